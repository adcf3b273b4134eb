//! Error types shared across the cache subsystem.
//!
//! Propagation policy: transient backend failures on the read path degrade to
//! a miss (reads are best-effort), while write failures and producer failures
//! always surface to the caller. A silently dropped write would mean silent
//! staleness.

use thiserror::Error;

/// Boxed error produced by a fetch producer.
pub type ProducerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum CacheError {
    /// A networked or filesystem backend could not be reached.
    #[error("cache backend `{backend}` unavailable: {message}")]
    BackendUnavailable {
        backend: &'static str,
        message: String,
    },
    /// A value could not be encoded into, or decoded from, an entry envelope.
    #[error("cache serialization failed: {message}")]
    Serialization { message: String },
    /// `increment`/`decrement` was called on an entry not written in raw mode.
    #[error("cache entry `{key}` is not a raw counter")]
    TypeMismatch { key: String },
    /// The backend rejected an entry for exceeding its size limit.
    #[error("cache entry `{key}` exceeds backend size limit of {limit} bytes")]
    EntrySizeExceeded { key: String, limit: usize },
    /// Declaring this dependency edge would close a cycle in the touch graph.
    #[error("dependency edge `{child}` -> `{parent}` would form a cycle")]
    CyclicDependency {
        child: &'static str,
        parent: &'static str,
    },
    /// The selected backend cannot perform the requested operation.
    #[error("cache backend `{backend}` does not support {operation}")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },
    /// The cache settings are incomplete or contradictory for the selected
    /// backend.
    #[error("cache configuration error: {message}")]
    Configuration { message: String },
    /// The fetch producer failed; nothing was written for the key.
    #[error("cache producer failed: {0}")]
    Producer(#[source] ProducerError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    pub fn unavailable(backend: &'static str, message: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            backend,
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn type_mismatch(key: impl Into<String>) -> Self {
        Self::TypeMismatch { key: key.into() }
    }

    pub fn entry_too_large(key: impl Into<String>, limit: usize) -> Self {
        Self::EntrySizeExceeded {
            key: key.into(),
            limit,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// True if a read that failed with this error may degrade to a miss.
    ///
    /// Serialization failures qualify: a corrupt envelope is indistinguishable
    /// from an evicted entry as far as the caller is concerned. Everything
    /// else on the read path is an infrastructure fault worth surfacing in
    /// logs before degrading.
    pub fn degrades_to_miss(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable { .. } | Self::Serialization { .. } | Self::Io(_)
        )
    }
}
