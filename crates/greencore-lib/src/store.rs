//! Authoritative in-memory table of per-core power state
//!
//! Every mutation goes through compare-and-swap, which is what keeps two
//! transitions from racing on the same core. The table is guarded by a
//! single lock that is only ever held for the duration of a map access,
//! never across a host agent call.

use crate::error::StoreError;
use crate::models::{CoreId, CoreState, FleetConfig};
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: CoreState,
    /// Stable cores are tracked but may never leave `Awake`
    pinned: bool,
}

/// Shared per-core state table
#[derive(Debug, Default)]
pub struct CoreStateStore {
    cores: RwLock<BTreeMap<CoreId, Entry>>,
}

impl CoreStateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Track every configured core as `Awake`, pinning the stable partition
    ///
    /// Cores that are already tracked keep their current state.
    pub fn populate(&self, fleet: &FleetConfig) {
        let mut cores = self.write();
        for host in &fleet.hosts {
            for id in host.dynamic_cores() {
                cores.entry(id).or_insert(Entry {
                    state: CoreState::Awake,
                    pinned: false,
                });
            }
            for id in host.stable_cores() {
                cores.entry(id).or_insert(Entry {
                    state: CoreState::Awake,
                    pinned: true,
                });
            }
        }
        debug!(cores = cores.len(), "Core state store populated");
    }

    /// Current state of a core
    pub fn get(&self, id: &CoreId) -> Result<CoreState, StoreError> {
        self.read()
            .get(id)
            .map(|e| e.state)
            .ok_or_else(|| StoreError::UnknownCore(id.clone()))
    }

    /// Whether the core belongs to the stable partition
    pub fn is_pinned(&self, id: &CoreId) -> Result<bool, StoreError> {
        self.read()
            .get(id)
            .map(|e| e.pinned)
            .ok_or_else(|| StoreError::UnknownCore(id.clone()))
    }

    /// Move `id` from `expected` to `next`
    ///
    /// Returns `Ok(false)` without mutating when the current state is not
    /// `expected`. Pinned cores refuse any `next` other than `Awake`.
    pub fn set_if_current(
        &self,
        id: &CoreId,
        expected: CoreState,
        next: CoreState,
    ) -> Result<bool, StoreError> {
        let mut cores = self.write();
        let entry = cores
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownCore(id.clone()))?;

        if entry.pinned && next != CoreState::Awake {
            return Err(StoreError::PinnedCore(id.clone()));
        }
        if entry.state != expected {
            return Ok(false);
        }

        entry.state = next;
        Ok(true)
    }

    /// Point-in-time copy of the whole table, ordered by core id
    pub fn snapshot(&self) -> BTreeMap<CoreId, CoreState> {
        self.read()
            .iter()
            .map(|(id, e)| (id.clone(), e.state))
            .collect()
    }

    /// Ids of all cores currently in `state`, ordered
    pub fn ids_in_state(&self, state: CoreState) -> Vec<CoreId> {
        self.read()
            .iter()
            .filter(|(_, e)| e.state == state)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    // A poisoned lock still holds a valid table: every write is a single
    // assignment of a complete value.
    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<CoreId, Entry>> {
        self.cores.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<CoreId, Entry>> {
        self.cores.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ComputeHost;
    use std::sync::Arc;

    fn fleet() -> FleetConfig {
        FleetConfig::new(vec![
            ComputeHost::new("a", "u", vec![0, 1], vec![2]),
            ComputeHost::new("b", "u", vec![0], vec![]),
        ])
    }

    fn populated() -> CoreStateStore {
        let store = CoreStateStore::new();
        store.populate(&fleet());
        store
    }

    #[test]
    fn test_new_store_is_empty() {
        let store = CoreStateStore::new();
        assert!(store.is_empty());
        assert_eq!(
            store.get(&CoreId::new("a", 0)),
            Err(StoreError::UnknownCore(CoreId::new("a", 0)))
        );
    }

    #[test]
    fn test_populate_starts_awake() {
        let store = populated();
        assert_eq!(store.len(), 4);
        assert!(store.snapshot().values().all(|s| *s == CoreState::Awake));
        assert!(store.is_pinned(&CoreId::new("a", 2)).unwrap());
        assert!(!store.is_pinned(&CoreId::new("a", 0)).unwrap());
    }

    #[test]
    fn test_populate_keeps_existing_state() {
        let store = populated();
        let id = CoreId::new("a", 0);
        store
            .set_if_current(&id, CoreState::Awake, CoreState::Asleep)
            .unwrap();
        store.populate(&fleet());
        assert_eq!(store.get(&id).unwrap(), CoreState::Asleep);
    }

    #[test]
    fn test_set_if_current_mismatch_does_not_mutate() {
        let store = populated();
        let id = CoreId::new("a", 1);
        let swapped = store
            .set_if_current(&id, CoreState::Asleep, CoreState::Transitioning)
            .unwrap();
        assert!(!swapped);
        assert_eq!(store.get(&id).unwrap(), CoreState::Awake);
    }

    #[test]
    fn test_set_if_current_unknown_core() {
        let store = populated();
        let id = CoreId::new("c", 0);
        assert_eq!(
            store.set_if_current(&id, CoreState::Awake, CoreState::Asleep),
            Err(StoreError::UnknownCore(id))
        );
    }

    #[test]
    fn test_pinned_core_never_leaves_awake() {
        let store = populated();
        let id = CoreId::new("a", 2);
        assert_eq!(
            store.set_if_current(&id, CoreState::Awake, CoreState::Transitioning),
            Err(StoreError::PinnedCore(id.clone()))
        );
        assert_eq!(
            store.set_if_current(&id, CoreState::Awake, CoreState::Asleep),
            Err(StoreError::PinnedCore(id.clone()))
        );
        assert_eq!(store.get(&id).unwrap(), CoreState::Awake);
    }

    #[test]
    fn test_ids_in_state_is_ordered() {
        let store = populated();
        for id in [CoreId::new("b", 0), CoreId::new("a", 1)] {
            store
                .set_if_current(&id, CoreState::Awake, CoreState::Asleep)
                .unwrap();
        }
        assert_eq!(
            store.ids_in_state(CoreState::Asleep),
            vec![CoreId::new("a", 1), CoreId::new("b", 0)]
        );
    }

    #[test]
    fn test_concurrent_cas_has_single_winner() {
        let store = Arc::new(populated());
        let id = CoreId::new("a", 0);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                let id = id.clone();
                std::thread::spawn(move || {
                    store
                        .set_if_current(&id, CoreState::Awake, CoreState::Transitioning)
                        .unwrap()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(store.get(&id).unwrap(), CoreState::Transitioning);
    }
}
