//! # Per-Class Allocator
//!
//! One `ClassAllocator` owns every chunk of one size class. All chunk-list
//! and bitmap mutation happens under the class mutex, so contention is
//! scoped per size class instead of pool-wide.

use crate::chunk::Chunk;
use crate::config::EmptyChunkPolicy;
use crate::error::{GpuMemError, GpuMemResult};
use crate::handle::AllocationHandle;
use crate::provider::ChunkProvider;
use crate::size_class::SizeClass;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Pool-wide chunk budget shared by every class allocator.
#[derive(Debug)]
pub(crate) struct ChunkBudget {
    live: AtomicU32,
    max: u32,
    total_created: AtomicU64,
}

impl ChunkBudget {
    pub(crate) fn new(max: u32) -> Self {
        Self {
            live: AtomicU32::new(0),
            max,
            total_created: AtomicU64::new(0),
        }
    }

    /// Reserves one chunk against the budget. Returns false when the
    /// configured ceiling is reached.
    fn try_reserve(&self) -> bool {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.max).then_some(live + 1)
            })
            .map(|_| {
                self.total_created.fetch_add(1, Ordering::Relaxed);
            })
            .is_ok()
    }

    fn release(&self) {
        let previous = self.live.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0);
    }

    /// Number of chunks currently live across the pool.
    pub(crate) fn live(&self) -> u32 {
        self.live.load(Ordering::Acquire)
    }

    /// Total chunks ever created.
    pub(crate) fn total_created(&self) -> u64 {
        self.total_created.load(Ordering::Relaxed)
    }
}

/// Mutable per-class state, guarded by the class mutex.
#[derive(Debug, Default)]
struct ChunkList {
    /// Chunks in creation order. Removal preserves order so the
    /// lowest-index tie-break stays deterministic.
    chunks: Vec<Chunk>,
    /// Id of the chunk the last allocation came from. Preferring it while
    /// it is still partial keeps empty chunks consolidated and cheap to
    /// destroy.
    last_used: Option<u64>,
}

/// Snapshot of one class's occupancy, for pool statistics.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ClassOccupancy {
    pub(crate) chunk_count: u32,
    pub(crate) in_use_bytes: u64,
    pub(crate) chunk_bytes: u64,
}

/// Allocator for one size class.
pub(crate) struct ClassAllocator {
    class_index: usize,
    class: SizeClass,
    policy: EmptyChunkPolicy,
    provider: Arc<dyn ChunkProvider>,
    budget: Arc<ChunkBudget>,
    next_chunk_id: AtomicU64,
    inner: Mutex<ChunkList>,
}

impl ClassAllocator {
    pub(crate) fn new(
        class_index: usize,
        class: SizeClass,
        policy: EmptyChunkPolicy,
        provider: Arc<dyn ChunkProvider>,
        budget: Arc<ChunkBudget>,
    ) -> Self {
        Self {
            class_index,
            class,
            policy,
            provider,
            budget,
            next_chunk_id: AtomicU64::new(0),
            inner: Mutex::new(ChunkList::default()),
        }
    }

    /// Allocates one slot, creating a chunk if no existing chunk has space.
    ///
    /// Chunk preference: the most-recently-used chunk while it is still
    /// partial, then the lowest-index partial chunk, then the lowest-index
    /// chunk with any free slot (an empty or warm chunk), then a new chunk.
    ///
    /// # Errors
    ///
    /// [`GpuMemError::OutOfMemory`] when the pool chunk budget is exhausted
    /// or the provider cannot back a new chunk.
    pub(crate) fn allocate(&self) -> GpuMemResult<AllocationHandle> {
        let slots_per_chunk = self.class.slots_per_chunk;
        let mut list = self.inner.lock();

        let position = self
            .pick_mru_partial(&list)
            .or_else(|| {
                list.chunks
                    .iter()
                    .position(|c| !c.is_empty() && !c.is_full(slots_per_chunk))
            })
            .or_else(|| list.chunks.iter().position(|c| !c.is_full(slots_per_chunk)));

        let position = match position {
            Some(position) => position,
            None => self.create_chunk(&mut list)?,
        };

        let chunk = &mut list.chunks[position];
        let Some(slot) = chunk.claim_first_free(slots_per_chunk) else {
            unreachable!("chunk was selected with a free slot");
        };
        list.last_used = Some(list.chunks[position].id());

        Ok(AllocationHandle {
            class_index: self.class_index,
            chunk_id: list.chunks[position].id(),
            backing: list.chunks[position].backing(),
            offset: u64::from(slot) * self.class.slot_size,
            size: self.class.slot_size,
        })
    }

    /// Returns the position of the most-recently-used chunk if it is still
    /// partial (neither empty nor full).
    fn pick_mru_partial(&self, list: &ChunkList) -> Option<usize> {
        let id = list.last_used?;
        let position = list.chunks.iter().position(|c| c.id() == id)?;
        let chunk = &list.chunks[position];
        (!chunk.is_empty() && !chunk.is_full(self.class.slots_per_chunk)).then_some(position)
    }

    /// Creates a new backing chunk, returning its position in the list.
    fn create_chunk(&self, list: &mut ChunkList) -> GpuMemResult<usize> {
        if !self.budget.try_reserve() {
            return Err(GpuMemError::OutOfMemory {
                class_index: self.class_index,
                chunk_count: self.budget.live(),
                provider_detail: None,
            });
        }

        let backing = match self
            .provider
            .allocate_chunk(self.class_index, self.class.chunk_size())
        {
            Ok(backing) => backing,
            Err(provider_error) => {
                self.budget.release();
                tracing::warn!(
                    "chunk provider failed for class {}: {}",
                    self.class_index,
                    provider_error
                );
                return Err(GpuMemError::OutOfMemory {
                    class_index: self.class_index,
                    chunk_count: self.budget.live(),
                    provider_detail: Some(provider_error.0),
                });
            }
        };

        let id = self.next_chunk_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "created chunk {} for class {} ({} bytes)",
            id,
            self.class_index,
            self.class.chunk_size()
        );
        list.chunks.push(Chunk::new(id, backing));
        Ok(list.chunks.len() - 1)
    }

    /// Returns a reclaimed slot to the free pool. Called only by the garbage
    /// collector once the slot's completion token has signaled - never
    /// directly from `free`.
    ///
    /// # Panics
    ///
    /// Panics on a slot that is not in use or a chunk the class does not
    /// own - both indicate a double free or a forged handle.
    pub(crate) fn release_slot(&self, chunk_id: u64, offset: u64) {
        let mut list = self.inner.lock();
        let Some(position) = list.chunks.iter().position(|c| c.id() == chunk_id) else {
            panic!(
                "class {} released a slot of unknown chunk {chunk_id} (double free?)",
                self.class_index
            );
        };

        let slot = (offset / self.class.slot_size) as u32;
        list.chunks[position].release(slot);
        debug_assert!(list.chunks[position].invariant_holds());

        if list.chunks[position].is_empty() {
            self.handle_empty_chunk(&mut list, position);
        }
    }

    /// Applies the empty-chunk policy after a chunk drains to zero.
    fn handle_empty_chunk(&self, list: &mut ChunkList, position: usize) {
        let keep_warm = self.policy == EmptyChunkPolicy::RetainWarm
            && !list
                .chunks
                .iter()
                .enumerate()
                .any(|(i, c)| i != position && c.is_empty());
        if keep_warm {
            return;
        }

        let chunk = list.chunks.remove(position);
        if list.last_used == Some(chunk.id()) {
            list.last_used = None;
        }
        tracing::debug!(
            "destroying empty chunk {} of class {}",
            chunk.id(),
            self.class_index
        );
        self.provider.destroy_chunk(chunk.backing());
        self.budget.release();
    }

    /// Occupancy snapshot for pool statistics.
    pub(crate) fn occupancy(&self) -> ClassOccupancy {
        let list = self.inner.lock();
        let chunk_count = list.chunks.len() as u32;
        let in_use_slots: u64 = list
            .chunks
            .iter()
            .map(|c| u64::from(c.in_use_count()))
            .sum();
        ClassOccupancy {
            chunk_count,
            in_use_bytes: in_use_slots * self.class.slot_size,
            chunk_bytes: u64::from(chunk_count) * self.class.chunk_size(),
        }
    }

    /// Destroys every remaining chunk. Called once at pool teardown, after
    /// the forced garbage sweep. Returns the number of slots that were
    /// still live (leaked by the caller).
    pub(crate) fn destroy_all_chunks(&self) -> u64 {
        let mut list = self.inner.lock();
        let mut leaked_slots = 0u64;
        for chunk in list.chunks.drain(..) {
            leaked_slots += u64::from(chunk.in_use_count());
            self.provider.destroy_chunk(chunk.backing());
            self.budget.release();
        }
        list.last_used = None;
        leaked_slots
    }

    /// Verifies the per-chunk `in_use_count == popcount` invariant.
    #[cfg(test)]
    pub(crate) fn invariants_hold(&self) -> bool {
        self.inner.lock().chunks.iter().all(Chunk::invariant_holds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChunkHandle, ProviderError};
    use std::sync::atomic::AtomicUsize;

    /// Counts provider calls and mints sequential handles.
    #[derive(Default)]
    struct CountingProvider {
        created: AtomicUsize,
        destroyed: AtomicUsize,
        fail_allocations: std::sync::atomic::AtomicBool,
    }

    impl ChunkProvider for CountingProvider {
        fn allocate_chunk(
            &self,
            _class_index: usize,
            _size: u64,
        ) -> Result<ChunkHandle, ProviderError> {
            if self.fail_allocations.load(Ordering::Relaxed) {
                return Err(ProviderError("device out of memory".to_string()));
            }
            let id = self.created.fetch_add(1, Ordering::Relaxed);
            Ok(ChunkHandle(id as u64))
        }

        fn destroy_chunk(&self, _handle: ChunkHandle) {
            self.destroyed.fetch_add(1, Ordering::Relaxed);
        }

        fn wait_idle(&self) {}
    }

    fn class_allocator(
        policy: EmptyChunkPolicy,
        max_chunks: u32,
    ) -> (ClassAllocator, Arc<CountingProvider>) {
        let provider = Arc::new(CountingProvider::default());
        let allocator = ClassAllocator::new(
            0,
            SizeClass {
                slot_size: 32,
                slots_per_chunk: 4,
            },
            policy,
            Arc::clone(&provider) as Arc<dyn ChunkProvider>,
            Arc::new(ChunkBudget::new(max_chunks)),
        );
        (allocator, provider)
    }

    #[test]
    fn test_allocations_are_deterministic_and_disjoint() {
        let (allocator, provider) = class_allocator(EmptyChunkPolicy::DestroyImmediately, 8);

        let a = allocator.allocate().unwrap();
        let b = allocator.allocate().unwrap();
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 32);
        assert_eq!(a.memory(), b.memory());
        assert_eq!(provider.created.load(Ordering::Relaxed), 1);
        assert!(allocator.invariants_hold());
    }

    #[test]
    fn test_full_chunk_spills_to_new_chunk() {
        let (allocator, provider) = class_allocator(EmptyChunkPolicy::DestroyImmediately, 8);

        let handles: Vec<_> = (0..5).map(|_| allocator.allocate().unwrap()).collect();
        assert_eq!(provider.created.load(Ordering::Relaxed), 2);
        // Fifth allocation starts the second chunk at offset 0.
        assert_eq!(handles[4].offset(), 0);
        assert_ne!(handles[4].memory(), handles[0].memory());
    }

    #[test]
    fn test_budget_exhaustion_reports_out_of_memory() {
        let (allocator, _provider) = class_allocator(EmptyChunkPolicy::DestroyImmediately, 1);

        for _ in 0..4 {
            allocator.allocate().unwrap();
        }
        let err = allocator.allocate().unwrap_err();
        assert!(matches!(
            err,
            GpuMemError::OutOfMemory {
                class_index: 0,
                chunk_count: 1,
                provider_detail: None,
            }
        ));
    }

    #[test]
    fn test_provider_failure_propagates_with_detail() {
        let (allocator, provider) = class_allocator(EmptyChunkPolicy::DestroyImmediately, 8);
        provider.fail_allocations.store(true, Ordering::Relaxed);

        let err = allocator.allocate().unwrap_err();
        match err {
            GpuMemError::OutOfMemory {
                provider_detail: Some(detail),
                ..
            } => assert!(detail.contains("device out of memory")),
            other => panic!("expected provider-tagged OutOfMemory, got {other:?}"),
        }
        // The reservation must have been rolled back.
        assert_eq!(allocator.budget.live(), 0);
    }

    #[test]
    fn test_destroy_immediately_destroys_empty_chunk() {
        let (allocator, provider) = class_allocator(EmptyChunkPolicy::DestroyImmediately, 8);

        let handle = allocator.allocate().unwrap();
        allocator.release_slot(handle.chunk_id, handle.offset);
        assert_eq!(provider.destroyed.load(Ordering::Relaxed), 1);
        assert_eq!(allocator.budget.live(), 0);
    }

    #[test]
    fn test_retain_warm_keeps_one_empty_chunk() {
        let (allocator, provider) = class_allocator(EmptyChunkPolicy::RetainWarm, 8);

        let handle = allocator.allocate().unwrap();
        allocator.release_slot(handle.chunk_id, handle.offset);
        assert_eq!(provider.destroyed.load(Ordering::Relaxed), 0);
        assert_eq!(allocator.budget.live(), 1);

        // The warm chunk is recycled instead of creating a new one.
        let again = allocator.allocate().unwrap();
        assert_eq!(provider.created.load(Ordering::Relaxed), 1);
        assert_eq!(again.offset(), 0);
    }

    #[test]
    fn test_retain_warm_caps_spares_at_one() {
        let (allocator, provider) = class_allocator(EmptyChunkPolicy::RetainWarm, 8);

        // Two full chunks.
        let handles: Vec<_> = (0..8).map(|_| allocator.allocate().unwrap()).collect();
        assert_eq!(provider.created.load(Ordering::Relaxed), 2);

        // Drain both; only one empty chunk may stay warm.
        for handle in handles {
            allocator.release_slot(handle.chunk_id, handle.offset);
        }
        assert_eq!(provider.destroyed.load(Ordering::Relaxed), 1);
        assert_eq!(allocator.budget.live(), 1);
    }

    #[test]
    fn test_mru_partial_chunk_preferred() {
        let (allocator, _provider) = class_allocator(EmptyChunkPolicy::RetainWarm, 8);

        // Fill chunk 0, then start chunk 1.
        let first: Vec<_> = (0..4).map(|_| allocator.allocate().unwrap()).collect();
        let in_second = allocator.allocate().unwrap();

        // Free one slot of chunk 0: it becomes partial, but the MRU chunk
        // (chunk 1) is partial too and must keep winning.
        allocator.release_slot(first[0].chunk_id, first[0].offset);
        let next = allocator.allocate().unwrap();
        assert_eq!(next.memory(), in_second.memory());
        assert_eq!(next.offset(), 32);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_release_panics() {
        let (allocator, _provider) = class_allocator(EmptyChunkPolicy::RetainWarm, 8);
        let handle = allocator.allocate().unwrap();
        let (chunk_id, offset) = (handle.chunk_id, handle.offset);
        allocator.release_slot(chunk_id, offset);
        allocator.release_slot(chunk_id, offset);
    }

    #[test]
    fn test_destroy_all_chunks_reports_leaks() {
        let (allocator, provider) = class_allocator(EmptyChunkPolicy::RetainWarm, 8);
        let _live = allocator.allocate().unwrap();
        let _live2 = allocator.allocate().unwrap();

        assert_eq!(allocator.destroy_all_chunks(), 2);
        assert_eq!(provider.destroyed.load(Ordering::Relaxed), 1);
        assert_eq!(allocator.budget.live(), 0);
    }
}
