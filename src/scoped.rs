//! Request-scoped memoization.
//!
//! A [`ScopedCache`] is created at the start of a unit of work (a request,
//! a job) and dropped wholesale at its end. It memoizes into an unbounded
//! in-process store, so nothing written here is budgeted, persisted, or
//! visible to any other scope.

use std::ops::Deref;
use std::sync::Arc;

use crate::cache::Cache;
use crate::store::{MemoryStore, WriteOptions};

/// A throwaway cache for one unit of work. Derefs to [`Cache`], so the
/// whole front-end API is available; dropping the scope discards every
/// entry at once.
pub struct ScopedCache {
    cache: Cache,
}

impl ScopedCache {
    /// Open a fresh scope backed by an unbounded in-process store.
    pub fn begin() -> Self {
        Self {
            cache: Cache::new(Arc::new(MemoryStore::unbounded())),
        }
    }

    /// Open a scope whose entries default to the given write options.
    pub fn begin_with_defaults(defaults: WriteOptions) -> Self {
        Self {
            cache: Cache::with_defaults(Arc::new(MemoryStore::unbounded()), defaults),
        }
    }
}

impl Deref for ScopedCache {
    type Target = Cache;

    fn deref(&self) -> &Cache {
        &self.cache
    }
}
