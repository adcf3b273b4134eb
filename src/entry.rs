//! Cache entry metadata. Expiry is evaluated lazily against the entry's own
//! clock fields, never by backend eviction, so the grace-window state machine
//! behaves identically across backends.

use bytes::Bytes;
use time::{Duration, OffsetDateTime};

/// Flat accounting overhead charged per entry against the memory store's
/// byte budget, covering key text and struct fields.
pub(crate) const ENTRY_OVERHEAD_BYTES: usize = 128;

/// Where an entry sits in its lifecycle relative to `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Not yet expired (or never expires).
    Fresh,
    /// Past expiry but inside the regeneration grace window; eligible to be
    /// served stale while one caller regenerates.
    ExpiredInGrace,
    /// Past expiry and past the grace window; a plain miss.
    Expired,
}

/// One stored cache entry: opaque payload plus lifecycle metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    payload: Bytes,
    created_at: OffsetDateTime,
    expires_at: Option<OffsetDateTime>,
    version: Option<String>,
    compressed: bool,
    raw: bool,
}

impl CacheEntry {
    pub fn new(payload: Bytes, expires_at: Option<OffsetDateTime>, version: Option<String>) -> Self {
        Self {
            payload,
            created_at: OffsetDateTime::now_utc(),
            expires_at,
            version,
            compressed: false,
            raw: false,
        }
    }

    /// An entry holding a bare ASCII-decimal counter. Raw entries skip the
    /// serialization and compression layers so backend-native increment
    /// commands can operate on them.
    pub fn raw(payload: Bytes, expires_at: Option<OffsetDateTime>) -> Self {
        Self {
            payload,
            created_at: OffsetDateTime::now_utc(),
            expires_at,
            version: None,
            compressed: false,
            raw: true,
        }
    }

    /// Reassemble an entry from decoded envelope fields.
    pub(crate) fn from_parts(
        payload: Bytes,
        created_at: OffsetDateTime,
        expires_at: Option<OffsetDateTime>,
        version: Option<String>,
        compressed: bool,
        raw: bool,
    ) -> Self {
        Self {
            payload,
            created_at,
            expires_at,
            version,
            compressed,
            raw,
        }
    }

    pub(crate) fn mark_compressed(&mut self, payload: Bytes) {
        self.payload = payload;
        self.compressed = true;
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }

    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        self.expires_at
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn is_raw(&self) -> bool {
        self.raw
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        matches!(self.expires_at, Some(at) if now >= at)
    }

    /// Lifecycle state under a grace window of `race_ttl`.
    pub fn state(&self, race_ttl: Duration, now: OffsetDateTime) -> EntryState {
        let Some(expires_at) = self.expires_at else {
            return EntryState::Fresh;
        };
        if now < expires_at {
            return EntryState::Fresh;
        }
        if race_ttl > Duration::ZERO && now - expires_at <= race_ttl {
            return EntryState::ExpiredInGrace;
        }
        EntryState::Expired
    }

    /// Whether this entry satisfies the reader's expected version tag.
    /// `None` expected matches anything, mirroring untagged reads.
    pub fn matches_version(&self, expected: Option<&str>) -> bool {
        match expected {
            None => true,
            Some(want) => self.version.as_deref() == Some(want),
        }
    }

    /// Remaining lifetime from `now`, if the entry expires.
    pub fn ttl_from(&self, now: OffsetDateTime) -> Option<Duration> {
        self.expires_at.map(|at| (at - now).max(Duration::ZERO))
    }

    /// Bytes charged against a store's budget for this entry.
    pub fn byte_size(&self) -> usize {
        let version_len = self.version.as_ref().map_or(0, String::len);
        self.payload.len() + version_len + ENTRY_OVERHEAD_BYTES
    }
}

/// Resolve the effective expiry instant from the caller's options.
/// `expires_at` wins over `expires_in` when both are given. A ttl that
/// lands past the representable calendar counts as never expiring.
pub(crate) fn resolve_expiry(
    expires_in: Option<Duration>,
    expires_at: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> Option<OffsetDateTime> {
    expires_at.or_else(|| expires_in.and_then(|ttl| now.checked_add(ttl)))
}
