//! Dispensa Caching Subsystem
//!
//! A pluggable cache for server-side applications:
//!
//! - **Stores**: in-memory LRU with a byte budget, filesystem, sharded
//!   memcached, and a null store, all behind one [`CacheStore`] trait
//! - **Fetch**: read-through [`Cache::fetch`] with stale-while-revalidate
//!   regeneration under a per-key lease, so one producer runs per key
//!   whether the entry expired or was never written
//! - **Keys**: [`derive`] builds entity keys from identity plus a freshness
//!   signal; mutation abandons old keys instead of deleting them
//! - **Touch chains**: [`TouchPropagator`] bumps parent entities when a
//!   child changes, invalidating nested fragments transitively
//! - **Conditional GET**: [`evaluate`] decides not-modified short-circuits
//!   from `If-None-Match` / `If-Modified-Since` validators
//!
//! ## Configuration
//!
//! Backend selection is declarative; embed [`CacheSettings`] in the host's
//! configuration tree and call [`build_cache`]:
//!
//! ```toml
//! [cache]
//! backend = "memcached"
//! namespace = "app"
//! expires_in_seconds = 300
//! race_condition_ttl_seconds = 10
//!
//! [cache.memcached]
//! endpoints = ["10.0.0.1:11211", "10.0.0.2:11211"]
//! ```

mod cache;
mod codec;
mod config;
mod entity;
mod entry;
mod error;
mod freshness;
mod key;
mod lock;
pub mod metrics;
mod scoped;
mod stampede;
mod store;
mod touch;

pub use cache::Cache;
pub use config::{
    CacheSettings, FileSettings, MemcachedSettings, MemorySettings, StoreBackend, build_cache,
    build_store,
};
pub use entity::{Cacheable, EntityRef, FreshnessSignal};
pub use entry::{CacheEntry, EntryState};
pub use error::{CacheError, ProducerError};
pub use freshness::{
    Etag, Freshness, RequestConditionals, ResourceValidators, evaluate, http_date,
    parse_http_date,
};
pub use key::{CacheKey, KeyMaterial, derive, derive_raw, derive_stable};
pub use scoped::ScopedCache;
pub use stampede::{LeaseToken, StampedeGuard};
pub use store::{
    CacheStore, DEFAULT_COMPRESS_THRESHOLD_BYTES, DEFAULT_MEMORY_BUDGET_BYTES, DynStore,
    FileStore, MemcachedConfig, MemcachedStore, MemoryStore, NullStore, WriteOptions,
};
pub use touch::{DependencyGraph, FreshnessTracker, TouchPropagator, Tracked};
