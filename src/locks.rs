// ===============================
// src/locks.rs (per-key execution guard)
// ===============================
use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::domain::PositionKey;

/// One lazily created lock per key. Acquisition never waits: if the key is
/// still busy from an earlier pass the caller skips it for this tick.
#[derive(Default)]
pub struct KeyLocks {
    arena: Mutex<HashMap<PositionKey, Arc<AsyncMutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self { Self::default() }

    pub fn try_acquire(&self, key: &PositionKey) -> Option<OwnedMutexGuard<()>> {
        // create-if-absent happens under the arena lock so two passes racing on
        // a brand new key end up sharing the same mutex
        let lock = {
            let mut arena = self.arena.lock();
            arena.entry(key.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
        };
        lock.try_lock_owned().ok()
    }

    pub fn len(&self) -> usize { self.arena.lock().len() }

    pub fn is_empty(&self) -> bool { self.arena.lock().is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PosSide;

    #[test]
    fn second_acquire_is_refused_until_release() {
        let locks = KeyLocks::new();
        let k = PositionKey::new("X", PosSide::Long);
        let g = locks.try_acquire(&k).expect("first acquire");
        assert!(locks.try_acquire(&k).is_none());
        drop(g);
        assert!(locks.try_acquire(&k).is_some());
    }

    #[test]
    fn keys_do_not_block_each_other() {
        let locks = KeyLocks::new();
        let _a = locks.try_acquire(&PositionKey::new("X", PosSide::Long)).unwrap();
        let _b = locks.try_acquire(&PositionKey::new("X", PosSide::Short)).unwrap();
        assert_eq!(locks.len(), 2);
    }
}
