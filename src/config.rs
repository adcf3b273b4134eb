//! Declarative backend selection and construction.
//!
//! Hosts embed a [`CacheSettings`] block in their own configuration tree
//! (every field has a default, so an empty table is valid) and call
//! [`build_cache`] at startup. Which store backs the cache is then a
//! deployment decision, not a code change.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use time::Duration;

use crate::cache::Cache;
use crate::error::CacheError;
use crate::store::{
    DynStore, FileStore, MemcachedConfig, MemcachedStore, MemoryStore, NullStore, WriteOptions,
};

const DEFAULT_MEMCACHED_OP_TIMEOUT_SECS: u64 = 1;

/// Symbolic backend names as they appear in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Bounded in-process store, the default. See
    /// [`crate::store::DEFAULT_MEMORY_BUDGET_BYTES`].
    #[default]
    Memory,
    /// Filesystem-persistent store rooted at [`FileSettings::root`].
    File,
    /// Sharded memcached client.
    Memcached,
    /// Stores nothing; for disabling caching without touching call sites.
    Null,
}

/// Cache configuration as deserialized from the host's settings tree.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CacheSettings {
    pub backend: StoreBackend,
    /// Namespace prepended to every key, for shared backends.
    pub namespace: Option<String>,
    /// Default relative expiry applied to writes without an explicit one.
    pub expires_in_seconds: Option<u64>,
    /// Default grace window for serving stale entries during regeneration.
    pub race_condition_ttl_seconds: Option<u64>,
    pub compress: Option<bool>,
    pub compress_threshold_bytes: Option<usize>,
    pub memory: MemorySettings,
    pub file: FileSettings,
    pub memcached: MemcachedSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct MemorySettings {
    /// Byte budget for the in-process store. Zero lifts the bound.
    pub budget_bytes: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct FileSettings {
    /// Directory the store fans its entry files out under.
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct MemcachedSettings {
    /// `host:port` endpoints; keys are sharded across them. Empty means
    /// the client default of one local endpoint.
    pub endpoints: Vec<String>,
    pub op_timeout_seconds: Option<u64>,
}

impl CacheSettings {
    /// The default write options these settings describe. Saturates
    /// second counts that exceed the signed range rather than failing.
    pub fn write_options(&self) -> WriteOptions {
        let mut options = WriteOptions::default();
        if let Some(secs) = self.expires_in_seconds {
            options.expires_in = Some(Duration::seconds(clamp_secs(secs)));
        }
        if let Some(secs) = self.race_condition_ttl_seconds {
            options.race_condition_ttl = Some(Duration::seconds(clamp_secs(secs)));
        }
        if let Some(compress) = self.compress {
            options.compress = compress;
        }
        if let Some(threshold) = self.compress_threshold_bytes {
            options.compress_threshold = threshold;
        }
        options
    }
}

fn clamp_secs(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}

/// Construct the configured store.
pub fn build_store(settings: &CacheSettings) -> Result<DynStore, CacheError> {
    let store: DynStore = match settings.backend {
        StoreBackend::Memory => match settings.memory.budget_bytes {
            Some(0) => Arc::new(MemoryStore::unbounded()),
            Some(budget) => Arc::new(MemoryStore::with_budget(budget)),
            None => Arc::new(MemoryStore::new()),
        },
        StoreBackend::File => {
            let root = settings.file.root.clone().ok_or_else(|| {
                CacheError::configuration("`file.root` is required for the file backend")
            })?;
            if root.as_os_str().is_empty() {
                return Err(CacheError::configuration("`file.root` must not be empty"));
            }
            Arc::new(FileStore::new(root))
        }
        StoreBackend::Memcached => {
            let mut config = MemcachedConfig::default();
            if !settings.memcached.endpoints.is_empty() {
                config.endpoints = settings.memcached.endpoints.clone();
            }
            let timeout_secs = settings
                .memcached
                .op_timeout_seconds
                .unwrap_or(DEFAULT_MEMCACHED_OP_TIMEOUT_SECS);
            if timeout_secs == 0 {
                return Err(CacheError::configuration(
                    "`memcached.op_timeout_seconds` must be greater than zero",
                ));
            }
            config.op_timeout = std::time::Duration::from_secs(timeout_secs);
            Arc::new(MemcachedStore::new(config)?)
        }
        StoreBackend::Null => Arc::new(NullStore::new()),
    };
    Ok(store)
}

/// Construct a ready-to-use [`Cache`]: configured store, namespace, and
/// default write options.
pub fn build_cache(settings: &CacheSettings) -> Result<Cache, CacheError> {
    let store = build_store(settings)?;
    let cache = Cache::with_defaults(store, settings.write_options());
    Ok(match settings.namespace.as_deref() {
        Some(namespace) if !namespace.is_empty() => cache.namespaced(namespace),
        _ => cache,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_toml(raw: &str) -> CacheSettings {
        toml::from_str(raw).expect("settings parse")
    }

    #[test]
    fn empty_table_is_the_default_memory_backend() {
        let settings = from_toml("");
        assert_eq!(settings.backend, StoreBackend::Memory);
        assert!(build_store(&settings).is_ok());
    }

    #[test]
    fn backend_names_are_lowercase() {
        assert_eq!(from_toml("backend = \"memory\"").backend, StoreBackend::Memory);
        assert_eq!(from_toml("backend = \"file\"").backend, StoreBackend::File);
        assert_eq!(
            from_toml("backend = \"memcached\"").backend,
            StoreBackend::Memcached
        );
        assert_eq!(from_toml("backend = \"null\"").backend, StoreBackend::Null);
        assert!(toml::from_str::<CacheSettings>("backend = \"redis\"").is_err());
    }

    #[test]
    fn write_options_resolve_from_settings() {
        let settings = from_toml(
            "expires_in_seconds = 300\n\
             race_condition_ttl_seconds = 10\n\
             compress = false\n\
             compress_threshold_bytes = 4096\n",
        );
        let options = settings.write_options();
        assert_eq!(options.expires_in, Some(Duration::seconds(300)));
        assert_eq!(options.race_condition_ttl, Some(Duration::seconds(10)));
        assert!(!options.compress);
        assert_eq!(options.compress_threshold, 4096);
    }

    #[test]
    fn unset_options_keep_their_defaults() {
        let options = from_toml("").write_options();
        assert_eq!(options.expires_in, None);
        assert_eq!(options.race_condition_ttl, None);
        assert!(options.compress);
    }

    #[test]
    fn file_backend_requires_a_root() {
        let settings = from_toml("backend = \"file\"");
        let err = build_store(&settings).err().expect("configuration error");
        assert!(matches!(err, CacheError::Configuration { .. }));

        let settings = from_toml("backend = \"file\"\n[file]\nroot = \"\"");
        assert!(build_store(&settings).is_err());

        let dir = tempfile::tempdir().expect("tempdir");
        let raw = format!("backend = \"file\"\n[file]\nroot = {:?}", dir.path());
        assert!(build_store(&from_toml(&raw)).is_ok());
    }

    #[test]
    fn memcached_timeout_must_be_positive() {
        let settings = from_toml(
            "backend = \"memcached\"\n[memcached]\nop_timeout_seconds = 0",
        );
        assert!(matches!(
            build_store(&settings).err().expect("configuration error"),
            CacheError::Configuration { .. }
        ));
    }

    #[test]
    fn memcached_endpoints_pass_through() {
        let settings = from_toml(
            "backend = \"memcached\"\n[memcached]\nendpoints = [\"10.0.0.1:11211\", \"10.0.0.2:11211\"]",
        );
        // Construction is lazy; no connection is attempted here.
        let store = build_store(&settings).expect("memcached store");
        assert_eq!(store.backend_name(), "memcached");
    }

    #[test]
    fn zero_memory_budget_lifts_the_bound() {
        let settings = from_toml("[memory]\nbudget_bytes = 0");
        assert!(build_store(&settings).is_ok());
    }

    #[test]
    fn namespace_applies_to_the_built_cache() {
        let settings = from_toml("namespace = \"app-v2\"");
        let cache = build_cache(&settings).expect("cache");
        assert_eq!(cache.backend_name(), "memory");
        // Namespacing is observable through key isolation, covered by the
        // front-end tests; here it is enough that construction succeeds.
        let bare = build_cache(&from_toml("namespace = \"\"")).expect("cache");
        assert_eq!(bare.backend_name(), "memory");
    }

    #[tokio::test]
    async fn oversized_second_counts_saturate() {
        let settings = from_toml(&format!(
            "expires_in_seconds = {max}\nrace_condition_ttl_seconds = {max}",
            max = u64::MAX
        ));
        let options = settings.write_options();
        assert_eq!(options.expires_in, Some(Duration::seconds(i64::MAX)));
        assert_eq!(options.race_condition_ttl, Some(Duration::seconds(i64::MAX)));

        // The saturated ttl has to survive a real write; it behaves as
        // never-expiring rather than overflowing the expiry instant.
        let cache = build_cache(&settings).expect("cache");
        let key = crate::key::CacheKey::new("durable");
        assert!(cache.write(&key, &1u8).await.expect("write"));
        assert_eq!(cache.read::<u8>(&key).await.expect("read"), Some(1));
    }
}
