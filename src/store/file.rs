//! Filesystem store.
//!
//! Entries persist across restarts and are shared by every process pointed
//! at the same root. Each entry lives in its own file named by a digest of
//! the key, fanned out over two directory levels. The file starts with the
//! key text so maintenance passes can walk the tree and recover keys. Writes
//! go to a temp file in the destination directory and are renamed into
//! place, so readers see the old record or the new one, never a torn write.
//!
//! Nothing is ever evicted here. Expiry is lazy and `cleanup` is the only
//! way disk usage shrinks besides explicit deletes.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;

use crate::codec::{decode_envelope, encode_envelope};
use crate::entry::{CacheEntry, resolve_expiry};
use crate::error::CacheError;
use crate::key::CacheKey;
use crate::stampede::{LeaseToken, StampedeGuard};

use super::{CacheStore, WriteOptions, glob_match};

const BACKEND: &str = "file";
const RECORD_EXTENSION: &str = "cache";

/// Store rooted at a directory on the local filesystem.
pub struct FileStore {
    root: PathBuf,
    guard: StampedeGuard,
    // Serializes in-process counter updates; cross-process increments are
    // best effort, as with any shared-directory cache.
    counter_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            guard: StampedeGuard::new(),
            counter_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_str().as_bytes()));
        self.root
            .join(&digest[..2])
            .join(&digest[2..4])
            .join(format!("{}.{RECORD_EXTENSION}", &digest[4..]))
    }

    async fn read_record(&self, path: &Path) -> Result<Option<(String, CacheEntry)>, CacheError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => Bytes::from(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        decode_record(bytes).map(Some)
    }

    async fn write_record(&self, path: PathBuf, record: Bytes) -> Result<(), CacheError> {
        let parent = path
            .parent()
            .map(PathBuf::from)
            .ok_or_else(|| CacheError::unavailable(BACKEND, "record path has no parent"))?;
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            std::fs::create_dir_all(&parent)?;
            let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
            tmp.write_all(&record)?;
            tmp.persist(&path).map_err(|err| err.error)?;
            Ok(())
        })
        .await
        .map_err(|err| CacheError::unavailable(BACKEND, format!("write task failed: {err}")))??;
        Ok(())
    }

    /// Every record file under the root. Directories that are not part of
    /// the two-level fan-out are left alone.
    async fn record_paths(&self) -> Result<Vec<PathBuf>, CacheError> {
        let mut paths = Vec::new();
        let mut outer = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(paths),
            Err(err) => return Err(err.into()),
        };
        while let Some(level1) = outer.next_entry().await? {
            if !level1.file_type().await?.is_dir() {
                continue;
            }
            let mut mid = tokio::fs::read_dir(level1.path()).await?;
            while let Some(level2) = mid.next_entry().await? {
                if !level2.file_type().await?.is_dir() {
                    continue;
                }
                let mut inner = tokio::fs::read_dir(level2.path()).await?;
                while let Some(record) = inner.next_entry().await? {
                    let path = record.path();
                    if path
                        .extension()
                        .is_some_and(|ext| ext == RECORD_EXTENSION)
                    {
                        paths.push(path);
                    }
                }
            }
        }
        Ok(paths)
    }

    /// Walk all records, deleting those `doomed` selects. Records that fail
    /// to decode are treated as damaged and deleted too.
    async fn sweep(
        &self,
        mut doomed: impl FnMut(&str, &CacheEntry) -> bool,
    ) -> Result<usize, CacheError> {
        let mut removed = 0;
        for path in self.record_paths().await? {
            let verdict = match self.read_record(&path).await {
                Ok(Some((key, entry))) => doomed(&key, &entry),
                Ok(None) => continue,
                Err(CacheError::Serialization { message }) => {
                    tracing::warn!(path = %path.display(), %message, "removing damaged cache record");
                    true
                }
                Err(err) => return Err(err),
            };
            if verdict && remove_file_if_present(&path).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl CacheStore for FileStore {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    async fn read_entry(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self
            .read_record(&self.path_for(key))
            .await?
            .map(|(_, entry)| entry))
    }

    async fn write_entry(
        &self,
        key: &CacheKey,
        entry: CacheEntry,
        options: &WriteOptions,
    ) -> Result<bool, CacheError> {
        let path = self.path_for(key);
        if options.unless_exist
            && let Some((_, existing)) = self.read_record(&path).await?
            && !existing.is_expired(OffsetDateTime::now_utc())
        {
            return Ok(false);
        }
        self.write_record(path, encode_record(key, &entry)).await?;
        Ok(true)
    }

    async fn delete_entry(&self, key: &CacheKey) -> Result<bool, CacheError> {
        remove_file_if_present(&self.path_for(key)).await
    }

    async fn exists(&self, key: &CacheKey) -> Result<bool, CacheError> {
        Ok(match self.read_entry(key).await? {
            Some(entry) => !entry.is_expired(OffsetDateTime::now_utc()),
            None => false,
        })
    }

    async fn increment(
        &self,
        key: &CacheKey,
        delta: u64,
        options: &WriteOptions,
    ) -> Result<u64, CacheError> {
        self.bump_counter(key, options, |current| current.saturating_add(delta))
            .await
    }

    async fn decrement(
        &self,
        key: &CacheKey,
        delta: u64,
        options: &WriteOptions,
    ) -> Result<u64, CacheError> {
        self.bump_counter(key, options, |current| current.saturating_sub(delta))
            .await
    }

    async fn try_acquire_lease(
        &self,
        key: &CacheKey,
        ttl: Duration,
    ) -> Result<Option<LeaseToken>, CacheError> {
        Ok(self
            .guard
            .try_acquire(key, ttl, OffsetDateTime::now_utc()))
    }

    async fn release_lease(&self, key: &CacheKey, token: LeaseToken) -> Result<(), CacheError> {
        self.guard.release(key, token);
        Ok(())
    }

    async fn delete_matched(&self, pattern: &str) -> Result<usize, CacheError> {
        self.sweep(|key, _| glob_match(pattern, key)).await
    }

    async fn cleanup(&self, now: OffsetDateTime) -> Result<usize, CacheError> {
        self.sweep(|_, entry| entry.is_expired(now)).await
    }

    async fn clear(&self) -> Result<(), CacheError> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        self.guard.clear();
        Ok(())
    }
}

impl FileStore {
    async fn bump_counter(
        &self,
        key: &CacheKey,
        options: &WriteOptions,
        apply: impl FnOnce(u64) -> u64,
    ) -> Result<u64, CacheError> {
        let _serialized = self.counter_lock.lock().await;
        let now = OffsetDateTime::now_utc();
        let path = self.path_for(key);

        let existing = match self.read_record(&path).await? {
            None => None,
            Some((_, entry)) if entry.is_expired(now) => None,
            Some((_, entry)) => {
                if !entry.is_raw() {
                    return Err(CacheError::type_mismatch(key.as_str()));
                }
                let current = std::str::from_utf8(entry.payload())
                    .ok()
                    .and_then(|text| text.trim().parse::<u64>().ok())
                    .ok_or_else(|| CacheError::type_mismatch(key.as_str()))?;
                Some((current, entry.expires_at()))
            }
        };

        let (value, expires_at) = match existing {
            None => (
                apply(0),
                resolve_expiry(options.expires_in, options.expires_at, now),
            ),
            Some((current, expires_at)) => (apply(current), expires_at),
        };

        let entry = CacheEntry::raw(value.to_string().into(), expires_at);
        self.write_record(path, encode_record(key, &entry)).await?;
        Ok(value)
    }
}

async fn remove_file_if_present(path: &Path) -> Result<bool, CacheError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

/// Record layout: key length, key text, then the entry envelope.
fn encode_record(key: &CacheKey, entry: &CacheEntry) -> Bytes {
    let envelope = encode_envelope(entry);
    let key_bytes = key.as_str().as_bytes();
    let mut record = BytesMut::with_capacity(2 + key_bytes.len() + envelope.len());
    record.put_u16(key_bytes.len() as u16);
    record.put_slice(key_bytes);
    record.put_slice(&envelope);
    record.freeze()
}

fn decode_record(mut record: Bytes) -> Result<(String, CacheEntry), CacheError> {
    if record.remaining() < 2 {
        return Err(CacheError::serialization("record truncated"));
    }
    let key_len = record.get_u16() as usize;
    if record.remaining() < key_len {
        return Err(CacheError::serialization("record truncated at key"));
    }
    let key = String::from_utf8(record.split_to(key_len).to_vec())
        .map_err(|_| CacheError::serialization("record key is not utf-8"))?;
    let entry = decode_envelope(record)?;
    Ok((key, entry))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn key(name: &str) -> CacheKey {
        CacheKey::new(name)
    }

    fn entry(payload: &[u8]) -> CacheEntry {
        CacheEntry::new(Bytes::copy_from_slice(payload), None, None)
    }

    fn store() -> (TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("cache"));
        (dir, store)
    }

    #[tokio::test]
    async fn roundtrip_and_overwrite() {
        let (_dir, store) = store();
        let k = key("views/article/1");

        assert!(store.read_entry(&k).await.unwrap().is_none());
        store
            .write_entry(&k, entry(b"one"), &WriteOptions::default())
            .await
            .unwrap();
        store
            .write_entry(&k, entry(b"two"), &WriteOptions::default())
            .await
            .unwrap();

        let read = store.read_entry(&k).await.unwrap().unwrap();
        assert_eq!(read.payload().as_ref(), b"two");
    }

    #[tokio::test]
    async fn entries_survive_a_new_store_over_the_same_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cache");

        let first = FileStore::new(&root);
        first
            .write_entry(&key("a"), entry(b"persisted"), &WriteOptions::default())
            .await
            .unwrap();
        drop(first);

        let second = FileStore::new(&root);
        let read = second.read_entry(&key("a")).await.unwrap().unwrap();
        assert_eq!(read.payload().as_ref(), b"persisted");
    }

    #[tokio::test]
    async fn metadata_survives_the_record_format() {
        let (_dir, store) = store();
        let k = key("a");
        let expires = OffsetDateTime::now_utc() + Duration::hours(1);
        let written = CacheEntry::new(
            Bytes::from_static(b"x"),
            Some(expires),
            Some("v7".to_owned()),
        );
        store
            .write_entry(&k, written, &WriteOptions::default())
            .await
            .unwrap();

        let read = store.read_entry(&k).await.unwrap().unwrap();
        assert_eq!(read.expires_at(), Some(expires));
        assert_eq!(read.version(), Some("v7"));
    }

    #[tokio::test]
    async fn unless_exist_respects_live_entries() {
        let (_dir, store) = store();
        let k = key("a");
        let opts = WriteOptions {
            unless_exist: true,
            ..WriteOptions::default()
        };

        assert!(store.write_entry(&k, entry(b"first"), &opts).await.unwrap());
        assert!(!store.write_entry(&k, entry(b"second"), &opts).await.unwrap());
        assert_eq!(
            store
                .read_entry(&k)
                .await
                .unwrap()
                .unwrap()
                .payload()
                .as_ref(),
            b"first"
        );
    }

    #[tokio::test]
    async fn delete_and_exists() {
        let (_dir, store) = store();
        let k = key("a");
        store
            .write_entry(&k, entry(b"x"), &WriteOptions::default())
            .await
            .unwrap();
        assert!(store.exists(&k).await.unwrap());

        assert!(store.delete_entry(&k).await.unwrap());
        assert!(!store.delete_entry(&k).await.unwrap());
        assert!(!store.exists(&k).await.unwrap());
    }

    #[tokio::test]
    async fn counters_roundtrip_through_disk() {
        let (_dir, store) = store();
        let k = key("hits");
        let opts = WriteOptions::default();

        assert_eq!(store.increment(&k, 2, &opts).await.unwrap(), 2);
        assert_eq!(store.increment(&k, 2, &opts).await.unwrap(), 4);
        assert_eq!(store.decrement(&k, 1, &opts).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn delete_matched_recovers_keys_from_records() {
        let (_dir, store) = store();
        for name in ["views/article/1", "views/article/2", "views/comment/9"] {
            store
                .write_entry(&key(name), entry(b"x"), &WriteOptions::default())
                .await
                .unwrap();
        }

        let removed = store.delete_matched("views/article/*").await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.read_entry(&key("views/article/1")).await.unwrap().is_none());
        assert!(store.read_entry(&key("views/comment/9")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cleanup_prunes_only_expired_records() {
        let (_dir, store) = store();
        let now = OffsetDateTime::now_utc();
        store
            .write_entry(
                &key("dead"),
                CacheEntry::new(Bytes::from_static(b"x"), Some(now - Duration::seconds(5)), None),
                &WriteOptions::default(),
            )
            .await
            .unwrap();
        store
            .write_entry(
                &key("live"),
                CacheEntry::new(Bytes::from_static(b"x"), Some(now + Duration::hours(1)), None),
                &WriteOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(store.cleanup(now).await.unwrap(), 1);
        assert!(store.read_entry(&key("dead")).await.unwrap().is_none());
        assert!(store.read_entry(&key("live")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn clear_empties_the_root() {
        let (_dir, store) = store();
        store
            .write_entry(&key("a"), entry(b"x"), &WriteOptions::default())
            .await
            .unwrap();
        store.clear().await.unwrap();
        assert!(store.read_entry(&key("a")).await.unwrap().is_none());

        // The store keeps working after clear.
        store
            .write_entry(&key("b"), entry(b"y"), &WriteOptions::default())
            .await
            .unwrap();
        assert!(store.read_entry(&key("b")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn damaged_records_are_swept_not_fatal() {
        let (_dir, store) = store();
        store
            .write_entry(&key("good"), entry(b"x"), &WriteOptions::default())
            .await
            .unwrap();

        // Corrupt a record in place.
        let path = store.path_for(&key("good"));
        tokio::fs::write(&path, b"\x00").await.unwrap();

        assert_eq!(store.cleanup(OffsetDateTime::now_utc()).await.unwrap(), 1);
        assert!(store.read_entry(&key("good")).await.unwrap().is_none());
    }
}
