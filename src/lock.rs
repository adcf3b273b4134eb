//! Poison-tolerant lock guards.
//!
//! A panic while holding a cache lock must not take the whole cache down with
//! it: the protected state is by definition disposable. Guards are recovered
//! from poisoning with a warning so the event stays visible in logs.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

pub(crate) fn rw_read<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind = "rwlock.read",
                result = "poisoned_recovered",
                hint = "cached state may be stale after panic in another thread",
                "Recovered from poisoned cache lock"
            );
            poisoned.into_inner()
        }
    }
}

pub(crate) fn rw_write<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind = "rwlock.write",
                result = "poisoned_recovered",
                hint = "cached state may be stale after panic in another thread",
                "Recovered from poisoned cache lock"
            );
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::RwLock;

    use super::*;

    #[test]
    fn rw_write_recovers_after_panic() {
        let lock = RwLock::new(0u32);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = lock.write().expect("lock should be acquirable");
            panic!("poison the lock");
        }));

        *rw_write(&lock, "lock::tests", "rw_write_recovers") = 7;
        assert_eq!(*rw_read(&lock, "lock::tests", "rw_write_recovers"), 7);
    }
}
