//! The contract a domain type fulfills to participate in key derivation and
//! dependency propagation. No persistence framework is assumed; the host
//! supplies identity and freshness, the cache never loads entities itself.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// What changed last, and when. Embedded in derived keys as a token and
/// tracked by the freshness ledger for dependency bumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FreshnessSignal {
    /// Last-modified instant at nanosecond resolution.
    Timestamp(#[serde(with = "time::serde::rfc3339")] OffsetDateTime),
    /// Monotonic version counter for hosts without reliable clocks.
    Version(u64),
}

impl FreshnessSignal {
    /// Render the token embedded in derived keys.
    pub fn token(&self) -> String {
        match self {
            Self::Timestamp(t) => t.unix_timestamp_nanos().to_string(),
            Self::Version(v) => v.to_string(),
        }
    }

    /// The signal after a touch at `at`. Always strictly advances: a bump
    /// under a coarse or stalled clock still yields a new token, so the
    /// derived key is guaranteed to change.
    pub fn bumped(&self, at: OffsetDateTime) -> Self {
        match self {
            Self::Timestamp(prev) => {
                let floor = *prev + time::Duration::nanoseconds(1);
                Self::Timestamp(if at > *prev { at } else { floor })
            }
            Self::Version(v) => Self::Version(v + 1),
        }
    }
}

impl fmt::Display for FreshnessSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token())
    }
}

/// A `(type, id)` pair naming one entity instance. This is the unit the
/// dependency graph and freshness ledger operate on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub entity_type: &'static str,
    pub id: String,
}

impl EntityRef {
    pub fn new(entity_type: &'static str, id: impl Into<String>) -> Self {
        Self {
            entity_type,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.id)
    }
}

/// Implemented by host types that want entity-derived cache keys.
pub trait Cacheable {
    /// Stable type prefix, e.g. `"article"`. Must never change across
    /// releases or previously derived keys go dark.
    fn cache_prefix(&self) -> &'static str;

    /// Identity within the prefix, unique and stable.
    fn cache_id(&self) -> String;

    /// Current freshness signal for this instance.
    fn freshness(&self) -> FreshnessSignal;

    fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.cache_prefix(), self.cache_id())
    }
}
