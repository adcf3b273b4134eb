//! Regeneration leases.
//!
//! When an entry expires inside its grace window, exactly one caller should
//! regenerate it while everyone is served the stale value. The lease is an
//! explicit four-state machine per key: Unleased, Leased, Released (entry
//! rewritten), and LeaseTimeout. Timeout never surfaces to callers; an
//! expired lease is simply reclaimable by the next acquirer, so a crashed
//! holder cannot wedge a key.
//!
//! This table covers in-process coordination. The networked backend layers
//! its own add-if-absent lease on top so independent processes coordinate
//! through the server instead.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use time::{Duration, OffsetDateTime, PrimitiveDateTime};
use uuid::Uuid;

use crate::key::CacheKey;
use crate::metrics::LEASE_RECLAIMED_TOTAL;

/// Leases never live shorter than this, whatever the grace window.
pub const LEASE_TTL_FLOOR: Duration = Duration::seconds(5);

/// Opaque proof of lease ownership. Release requires the token handed out
/// at acquisition, so a slow holder cannot free a successor's lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseToken(Uuid);

impl LeaseToken {
    pub(crate) fn mint() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wire form, used by backends that persist the lease remotely.
    pub(crate) fn render(&self) -> String {
        self.0.as_hyphenated().to_string()
    }

    pub(crate) fn parse(raw: &str) -> Option<Self> {
        Uuid::try_parse(raw).ok().map(Self)
    }
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    token: LeaseToken,
    expires_at: OffsetDateTime,
}

/// Deadline for a lease granted at `now`. A ttl reaching past the
/// representable calendar pins the deadline to its far end instead of
/// overflowing.
fn lease_deadline(now: OffsetDateTime, ttl: Duration) -> OffsetDateTime {
    now.checked_add(ttl)
        .unwrap_or(PrimitiveDateTime::MAX.assume_utc())
}

/// Per-key lease table backed by a sharded map; the entry API gives
/// compare-and-set semantics without a global lock.
#[derive(Debug, Default)]
pub struct StampedeGuard {
    leases: DashMap<CacheKey, Lease>,
}

impl StampedeGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease lifetime for a given grace window: twice the window, floored
    /// so hosts with sub-second grace still get a usable lease.
    pub fn lease_ttl(race_ttl: Duration) -> Duration {
        race_ttl.saturating_mul(2).max(LEASE_TTL_FLOOR)
    }

    /// Try to become the regenerator for `key`. Returns a token on success,
    /// `None` while another holder's lease is live. A lease whose deadline
    /// has passed is reclaimed in place. The entry API holds the shard lock
    /// across the check and the write, so acquisition is atomic.
    pub fn try_acquire(
        &self,
        key: &CacheKey,
        ttl: Duration,
        now: OffsetDateTime,
    ) -> Option<LeaseToken> {
        match self.leases.entry(key.clone()) {
            Entry::Vacant(slot) => {
                let token = LeaseToken::mint();
                slot.insert(Lease {
                    token,
                    expires_at: lease_deadline(now, ttl),
                });
                Some(token)
            }
            Entry::Occupied(mut slot) => {
                let lease = slot.get_mut();
                if lease.expires_at > now {
                    return None;
                }
                metrics::counter!(LEASE_RECLAIMED_TOTAL).increment(1);
                tracing::debug!(key = %key, "reclaiming timed out regeneration lease");
                let token = LeaseToken::mint();
                *lease = Lease {
                    token,
                    expires_at: lease_deadline(now, ttl),
                };
                Some(token)
            }
        }
    }

    /// Release `key` if `token` still owns it. Releasing after timeout and
    /// reclaim is a no-op by design.
    pub fn release(&self, key: &CacheKey, token: LeaseToken) {
        self.leases.remove_if(key, |_, lease| lease.token == token);
    }

    /// Drop all leases, live or not. Used when the owning store clears.
    pub fn clear(&self) {
        self.leases.clear();
    }

    #[cfg(test)]
    pub(crate) fn live_leases(&self) -> usize {
        self.leases.len()
    }
}
