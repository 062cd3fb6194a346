use crate::error::{EngineError, Result};
use crate::registry::TemporalUnit;
use crate::router::TxStatus;
use alloy::primitives::{Address, U256};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Summary of a discovered candidate. The full request state is always
/// re-fetched from the ledger; only this summary is held locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub bounty: U256,
    pub temporal_unit: TemporalUnit,
    pub claimed_by: Option<Address>,
    pub was_called: bool,
    pub window_start: u64,
    pub claim_window_start: u64,
    pub status: TxStatus,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<Address, CacheEntry>,
    // Insertion order of live keys; kept in sync with `entries` on del().
    order: Vec<Address>,
}

/// In-memory index from candidate identifier to its last-seen summary.
///
/// There is no eviction policy beyond explicit deletion: the Router deletes
/// terminal entries, and bounded cardinality depends on it doing so. Entries
/// are owned exclusively by the cache; callers read and write through the
/// identifier-keyed interface and never hold references across await points.
#[derive(Default)]
pub struct Cache {
    state: Mutex<CacheState>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set(&self, id: Address, entry: CacheEntry) {
        let mut state = self.lock();
        if state.entries.insert(id, entry).is_none() {
            state.order.push(id);
        }
    }

    pub fn get(&self, id: Address) -> Result<CacheEntry> {
        self.lock()
            .entries
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::CacheMiss(id).into())
    }

    pub fn get_or(&self, id: Address, fallback: CacheEntry) -> CacheEntry {
        self.lock().entries.get(&id).cloned().unwrap_or(fallback)
    }

    /// Apply `f` to the entry if present. Returns whether the entry existed.
    pub fn update(&self, id: Address, f: impl FnOnce(&mut CacheEntry)) -> bool {
        let mut state = self.lock();
        match state.entries.get_mut(&id) {
            Some(entry) => {
                f(entry);
                true
            }
            None => false,
        }
    }

    pub fn has(&self, id: Address) -> bool {
        self.lock().entries.contains_key(&id)
    }

    pub fn del(&self, id: Address) {
        let mut state = self.lock();
        if state.entries.remove(&id).is_some() {
            state.order.retain(|stored| *stored != id);
        }
    }

    /// All stored identifiers, in insertion order.
    pub fn stored(&self) -> Vec<Address> {
        self.lock().order.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    fn entry(window_start: u64) -> CacheEntry {
        CacheEntry {
            bounty: U256::from(10),
            temporal_unit: TemporalUnit::Blocks,
            claimed_by: None,
            was_called: false,
            window_start,
            claim_window_start: window_start.saturating_sub(30),
            status: TxStatus::BeforeClaimWindow,
        }
    }

    #[test]
    fn test_get_without_entry_is_an_error() {
        let cache = Cache::new();
        let id = address!("72059fee98e3a3fa80618cb1446b550af0f5e1ec");
        assert!(cache.get(id).is_err());
        assert_eq!(cache.get_or(id, entry(5)).window_start, 5);
    }

    #[test]
    fn test_set_get_del_roundtrip() {
        let cache = Cache::new();
        let id = address!("72059fee98e3a3fa80618cb1446b550af0f5e1ec");

        cache.set(id, entry(100));
        assert!(cache.has(id));
        assert_eq!(cache.get(id).expect("entry").window_start, 100);
        assert_eq!(cache.len(), 1);

        cache.del(id);
        assert!(!cache.has(id));
        assert!(cache.is_empty());
        assert!(cache.stored().is_empty());
    }

    #[test]
    fn test_stored_preserves_insertion_order() {
        let cache = Cache::new();
        let a = address!("72059fee98e3a3fa80618cb1446b550af0f5e1ec");
        let b = address!("48e258a63f5acd3630d9e2a4e2c6a9f8f6aed4e8");
        let c = address!("a4b197b83b06f97c1be081e95f872458f7f9a978");

        cache.set(a, entry(1));
        cache.set(b, entry(2));
        cache.set(c, entry(3));
        // Overwriting must not change position.
        cache.set(b, entry(20));

        assert_eq!(cache.stored(), vec![a, b, c]);

        cache.del(b);
        assert_eq!(cache.stored(), vec![a, c]);
    }

    #[test]
    fn test_update_mutates_in_place() {
        let cache = Cache::new();
        let id = address!("72059fee98e3a3fa80618cb1446b550af0f5e1ec");
        let other = address!("48e258a63f5acd3630d9e2a4e2c6a9f8f6aed4e8");

        cache.set(id, entry(1));
        assert!(cache.update(id, |e| e.was_called = true));
        assert!(cache.get(id).expect("entry").was_called);
        assert!(!cache.update(other, |e| e.was_called = true));
    }
}
