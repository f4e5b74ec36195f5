use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use gridstore_model::{AllocationFailure, ChunkId};
use uuid::Uuid;

use crate::error::Result;
use crate::store::{CacheStore, InMemoryCacheStore, Result as StoreResult};

#[derive(Debug, Clone)]
pub struct MemoryManagerConfig {
    /// Budget for resident chunk payloads (default: 512MB).
    pub max_memory_bytes: usize,
    /// Headroom held back from the budget and released first when an
    /// allocation fails (default: 1MB).
    pub reserve_bytes: usize,
    /// Evict-and-retry rounds before an operation fails with out-of-memory
    /// (default: 64).
    pub max_recovery_attempts: usize,
}

impl Default for MemoryManagerConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: 512 * 1024 * 1024,
            reserve_bytes: 1024 * 1024,
            max_recovery_attempts: 64,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryManagerStats {
    pub allocation_failures: u64,
    pub recoveries: u64,
    pub out_of_memory: u64,
    pub chunks_evicted: u64,
    pub chunks_stored: u64,
    pub chunks_loaded: u64,
}

/// Which resident chunks a grid may give up during recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VictimPolicy {
    /// Unpinned, non-singlet chunks only.
    WorthSwapping,
    /// Any unpinned chunk.
    AnyUnpinned,
}

/// A grid the memory manager can reclaim chunks from.
pub(crate) trait SwapTarget: Send {
    fn grid_id(&self) -> Uuid;

    /// Swap out the least recently used chunk allowed by `policy`. Returns
    /// whether a chunk was evicted.
    fn evict_one(&mut self, policy: VictimPolicy) -> Result<bool>;
}

struct Inner {
    charged: usize,
    reserve_held: usize,
    pinned: HashMap<(Uuid, ChunkId), usize>,
    grids: Vec<(Uuid, Weak<Mutex<dyn SwapTarget>>)>,
    fail_next: usize,
    stats: MemoryManagerStats,
}

impl Inner {
    fn available(&self, max: usize) -> usize {
        max.saturating_sub(self.charged)
            .saturating_sub(self.reserve_held)
    }
}

/// Process-wide arbiter for chunk memory.
///
/// Grids charge the estimated size of every resident chunk against a byte
/// budget. When a charge fails, [`crate::Grid`] operations call back into the
/// manager, which swaps chunks out to the cache store (other grids first, least
/// recently used first) and lets the operation retry.
///
/// Cloning is cheap; all clones share the same budget, registry and store.
#[derive(Clone)]
pub struct MemoryManager {
    config: MemoryManagerConfig,
    store: Arc<dyn CacheStore>,
    inner: Arc<Mutex<Inner>>,
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("config", &self.config)
            .field("charged_bytes", &self.charged_bytes())
            .finish_non_exhaustive()
    }
}

impl MemoryManager {
    pub fn new(store: Arc<dyn CacheStore>, mut config: MemoryManagerConfig) -> Self {
        config.max_recovery_attempts = config.max_recovery_attempts.max(1);
        config.reserve_bytes = config.reserve_bytes.min(config.max_memory_bytes / 2);
        let inner = Inner {
            charged: 0,
            reserve_held: config.reserve_bytes,
            pinned: HashMap::new(),
            grids: Vec::new(),
            fail_next: 0,
            stats: MemoryManagerStats::default(),
        };
        Self {
            config,
            store,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// A manager backed by an [`InMemoryCacheStore`].
    pub fn in_memory(config: MemoryManagerConfig) -> Self {
        Self::new(Arc::new(InMemoryCacheStore::new()), config)
    }

    pub fn config(&self) -> &MemoryManagerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn charged_bytes(&self) -> usize {
        self.lock().charged
    }

    /// Bytes that can still be charged without recovery.
    pub fn available_bytes(&self) -> usize {
        self.lock().available(self.config.max_memory_bytes)
    }

    pub fn stats_snapshot(&self) -> MemoryManagerStats {
        self.lock().stats
    }

    /// Make the next `count` charge attempts fail as if memory were exhausted.
    pub fn fail_next_allocations(&self, count: usize) {
        self.lock().fail_next = count;
    }

    /// Charge `bytes` against the budget, failing if they do not fit.
    pub fn try_charge(&self, bytes: usize) -> std::result::Result<(), AllocationFailure> {
        let mut inner = self.lock();
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            log::trace!("injected allocation failure for {bytes} bytes");
            return Err(AllocationFailure::new(bytes));
        }
        if bytes > inner.available(self.config.max_memory_bytes) {
            log::trace!(
                "charge of {bytes} bytes refused ({} of {} charged)",
                inner.charged,
                self.config.max_memory_bytes
            );
            return Err(AllocationFailure::new(bytes));
        }
        inner.charged = inner.charged.saturating_add(bytes);
        Ok(())
    }

    /// Charge `bytes` unconditionally, e.g. to correct an underestimate after
    /// the memory has already been allocated.
    pub fn charge(&self, bytes: usize) {
        let mut inner = self.lock();
        inner.charged = inner.charged.saturating_add(bytes);
    }

    pub fn release(&self, bytes: usize) {
        let mut inner = self.lock();
        inner.charged = inner.charged.saturating_sub(bytes);
    }

    /// Charge `bytes` and hand back a guard that releases them unless settled.
    pub fn reserve(&self, bytes: usize) -> std::result::Result<Reservation, AllocationFailure> {
        self.try_charge(bytes)?;
        Ok(Reservation {
            memory: self.clone(),
            bytes,
        })
    }

    /// Pin chunks of a grid so recovery never evicts them. Pins are counted
    /// and released when the guard drops.
    pub fn pin(&self, grid_id: Uuid, ids: impl IntoIterator<Item = ChunkId>) -> PinGuard {
        let keys: Vec<(Uuid, ChunkId)> = ids.into_iter().map(|id| (grid_id, id)).collect();
        let mut inner = self.lock();
        for key in &keys {
            *inner.pinned.entry(*key).or_insert(0) += 1;
        }
        PinGuard {
            memory: self.clone(),
            keys,
        }
    }

    pub fn is_pinned(&self, grid_id: Uuid, id: ChunkId) -> bool {
        self.lock().pinned.contains_key(&(grid_id, id))
    }

    /// Add a grid to the recovery registry. Returns false, leaving the
    /// registry untouched, if a live grid already holds `grid_id`.
    pub(crate) fn register(&self, grid_id: Uuid, grid: Weak<Mutex<dyn SwapTarget>>) -> bool {
        let mut inner = self.lock();
        inner.grids.retain(|(_, weak)| weak.strong_count() > 0);
        if inner.grids.iter().any(|(id, _)| *id == grid_id) {
            return false;
        }
        inner.grids.push((grid_id, grid));
        true
    }

    pub(crate) fn unregister(&self, grid_id: Uuid) {
        self.lock().grids.retain(|(id, _)| *id != grid_id);
    }

    pub(crate) fn store_chunk(&self, grid_id: Uuid, id: ChunkId, bytes: &[u8]) -> StoreResult<()> {
        self.store.put(grid_id, id, bytes)?;
        let mut inner = self.lock();
        inner.stats.chunks_stored = inner.stats.chunks_stored.saturating_add(1);
        Ok(())
    }

    pub(crate) fn load_chunk(&self, grid_id: Uuid, id: ChunkId) -> StoreResult<Option<Vec<u8>>> {
        let bytes = self.store.get(grid_id, id)?;
        if bytes.is_some() {
            let mut inner = self.lock();
            inner.stats.chunks_loaded = inner.stats.chunks_loaded.saturating_add(1);
        }
        Ok(bytes)
    }

    pub(crate) fn stored_chunk_ids(&self, grid_id: Uuid) -> StoreResult<Vec<ChunkId>> {
        self.store.chunk_ids(grid_id)
    }

    pub(crate) fn remove_grid(&self, grid_id: Uuid) -> StoreResult<()> {
        self.unregister(grid_id);
        self.store.remove_grid(grid_id)
    }

    pub(crate) fn note_evicted(&self) {
        let mut inner = self.lock();
        inner.stats.chunks_evicted = inner.stats.chunks_evicted.saturating_add(1);
    }

    pub(crate) fn note_allocation_failure(&self) {
        let mut inner = self.lock();
        inner.stats.allocation_failures = inner.stats.allocation_failures.saturating_add(1);
    }

    pub(crate) fn note_out_of_memory(&self) {
        let mut inner = self.lock();
        inner.stats.out_of_memory = inner.stats.out_of_memory.saturating_add(1);
    }

    /// Free memory after `failure` in an operation on `current`.
    ///
    /// Releases the soft reserve, then evicts until `failure.requested` bytes
    /// plus the reserve are available or nothing more can go. Victims come
    /// from other registered grids before `current`; grids locked by another
    /// caller are skipped. Returns whether anything was evicted.
    pub(crate) fn recover(
        &self,
        current: &mut dyn SwapTarget,
        failure: AllocationFailure,
    ) -> Result<bool> {
        let current_id = current.grid_id();
        let others: Vec<Arc<Mutex<dyn SwapTarget>>> = {
            let mut inner = self.lock();
            inner.reserve_held = 0;
            inner.grids.retain(|(_, weak)| weak.strong_count() > 0);
            inner
                .grids
                .iter()
                .filter(|(id, _)| *id != current_id)
                .filter_map(|(_, weak)| weak.upgrade())
                .collect()
        };

        let target = failure.requested.saturating_add(self.config.reserve_bytes);
        let policies = [VictimPolicy::WorthSwapping, VictimPolicy::AnyUnpinned];
        let mut evicted = 0usize;
        for policy in policies {
            for grid in &others {
                let Ok(mut grid) = grid.try_lock() else {
                    continue;
                };
                while !self.satisfied(target, evicted) && grid.evict_one(policy)? {
                    evicted += 1;
                }
            }
        }
        for policy in policies {
            while !self.satisfied(target, evicted) && current.evict_one(policy)? {
                evicted += 1;
            }
        }

        let mut inner = self.lock();
        if inner.available(self.config.max_memory_bytes) >= self.config.reserve_bytes {
            inner.reserve_held = self.config.reserve_bytes;
        }
        if evicted > 0 {
            inner.stats.recoveries = inner.stats.recoveries.saturating_add(1);
        }
        log::debug!(
            "recovery for grid {current_id} evicted {evicted} chunks ({} bytes charged)",
            inner.charged
        );
        Ok(evicted > 0)
    }

    fn satisfied(&self, target: usize, evicted: usize) -> bool {
        evicted > 0 && self.available_bytes() >= target
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory manager mutex poisoned")
    }
}

/// Bytes charged ahead of an operation.
///
/// Dropping the guard returns the bytes to the budget, so an operation that
/// bails out with `?` leaves the budget as it found it.
#[must_use]
pub struct Reservation {
    memory: MemoryManager,
    bytes: usize,
}

impl Reservation {
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Replace a previous charge plus this reservation with `actual` bytes.
    pub fn settle(mut self, previous: usize, actual: usize) {
        let held = previous.saturating_add(std::mem::take(&mut self.bytes));
        if held > actual {
            self.memory.release(held - actual);
        } else {
            self.memory.charge(actual - held);
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.bytes > 0 {
            self.memory.release(self.bytes);
        }
    }
}

/// Releases its pins when dropped.
#[must_use]
pub struct PinGuard {
    memory: MemoryManager,
    keys: Vec<(Uuid, ChunkId)>,
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        let mut inner = self.memory.lock();
        for key in &self.keys {
            if let Some(count) = inner.pinned.get_mut(key) {
                *count -= 1;
                if *count == 0 {
                    inner.pinned.remove(key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max: usize, reserve: usize) -> MemoryManager {
        MemoryManager::in_memory(MemoryManagerConfig {
            max_memory_bytes: max,
            reserve_bytes: reserve,
            max_recovery_attempts: 4,
        })
    }

    #[test]
    fn charges_respect_budget_and_reserve() {
        let memory = manager(1000, 100);
        assert_eq!(memory.available_bytes(), 900);
        memory.try_charge(850).unwrap();
        assert_eq!(memory.try_charge(100), Err(AllocationFailure::new(100)));
        memory.release(850);
        assert_eq!(memory.charged_bytes(), 0);
    }

    #[test]
    fn reservations_release_unless_settled() {
        let memory = manager(1000, 0);
        {
            let _reservation = memory.reserve(300).unwrap();
            assert_eq!(memory.charged_bytes(), 300);
        }
        assert_eq!(memory.charged_bytes(), 0);

        memory.charge(50);
        memory.reserve(300).unwrap().settle(50, 120);
        assert_eq!(memory.charged_bytes(), 120);
    }

    #[test]
    fn injected_failures_are_counted_down() {
        let memory = manager(1000, 0);
        memory.fail_next_allocations(2);
        assert!(memory.try_charge(1).is_err());
        assert!(memory.try_charge(1).is_err());
        assert!(memory.try_charge(1).is_ok());
    }

    #[test]
    fn pins_nest() {
        let memory = manager(1000, 0);
        let grid = Uuid::new_v4();
        let id = ChunkId::new(0, 0);
        let outer = memory.pin(grid, [id]);
        let inner = memory.pin(grid, [id]);
        drop(outer);
        assert!(memory.is_pinned(grid, id));
        drop(inner);
        assert!(!memory.is_pinned(grid, id));
    }

    #[test]
    fn reserve_is_clamped_to_half_the_budget() {
        let memory = manager(100, 1000);
        assert_eq!(memory.config().reserve_bytes, 50);
        assert_eq!(memory.available_bytes(), 50);
    }
}
