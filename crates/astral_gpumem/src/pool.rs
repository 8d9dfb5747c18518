//! # Memory Pool Facade
//!
//! Aggregates the class allocators and the garbage collector behind the
//! four-call surface the renderer uses: `allocate`, `free`, `end_frame`,
//! `stats`.

use crate::class_alloc::{ChunkBudget, ClassAllocator};
use crate::config::PoolConfig;
use crate::error::GpuMemResult;
use crate::garbage::GarbageCollector;
use crate::handle::AllocationHandle;
use crate::provider::{ChunkProvider, CompletionTokenSource};
use crate::size_class::SizeClassTable;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Running pool statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    /// Bytes currently handed out, including frees still waiting for their
    /// completion token. Counted in slot-size granularity.
    pub allocated_bytes: u64,
    /// Chunks currently live across all classes.
    pub chunk_count: u32,
    /// Chunks ever created.
    pub chunks_created: u64,
    /// `1 - (in-use bytes / chunk bytes)`: the fraction of backing memory
    /// the pool holds but has not handed out.
    pub external_fragmentation: f32,
}

/// Class-based GPU memory pool with fence-deferred reclamation.
///
/// An explicit value owned by the graphics context - construct it at device
/// init, call [`MemoryPool::shutdown`] (or let `Drop` do it) at device
/// teardown. There is no global pool.
///
/// # Thread Safety
///
/// `allocate` and `free` may be called from any number of threads.
/// [`MemoryPool::end_frame`] must be driven by a single coordinating thread;
/// it may overlap with `allocate`/`free` but not with itself.
pub struct MemoryPool {
    table: SizeClassTable,
    classes: Vec<ClassAllocator>,
    garbage: GarbageCollector,
    provider: Arc<dyn ChunkProvider>,
    tokens: Box<dyn CompletionTokenSource>,
    budget: Arc<ChunkBudget>,
    allocated_bytes: AtomicU64,
    shut_down: bool,
}

impl MemoryPool {
    /// Creates a pool from a validated configuration and its external
    /// collaborators.
    ///
    /// # Errors
    ///
    /// Returns [`GpuMemError::InvalidConfig`](crate::error::GpuMemError) if
    /// the configuration fails validation.
    pub fn new(
        config: &PoolConfig,
        provider: Arc<dyn ChunkProvider>,
        tokens: Box<dyn CompletionTokenSource>,
    ) -> GpuMemResult<Self> {
        config.validate()?;

        let table = SizeClassTable::new(&config.size_classes);
        let budget = Arc::new(ChunkBudget::new(config.max_chunks));
        let classes = table
            .classes()
            .iter()
            .enumerate()
            .map(|(index, &class)| {
                tracing::info!(
                    "creating memory class {}: chunk size {}, slot size {}, slots per chunk {}",
                    index,
                    class.chunk_size(),
                    class.slot_size,
                    class.slots_per_chunk
                );
                ClassAllocator::new(
                    index,
                    class,
                    config.empty_chunk_policy,
                    Arc::clone(&provider),
                    Arc::clone(&budget),
                )
            })
            .collect();

        Ok(Self {
            table,
            classes,
            garbage: GarbageCollector::new(config.frames_in_flight),
            provider,
            tokens,
            budget,
            allocated_bytes: AtomicU64::new(0),
            shut_down: false,
        })
    }

    /// Allocates `size` bytes with at least `alignment`-byte alignment.
    ///
    /// # Errors
    ///
    /// * [`InvalidSize`](crate::error::GpuMemError::InvalidSize) - zero size
    ///   or alignment.
    /// * [`NoClassFits`](crate::error::GpuMemError::NoClassFits) - size or
    ///   alignment above every class.
    /// * [`OutOfMemory`](crate::error::GpuMemError::OutOfMemory) - chunk
    ///   budget exhausted or provider failure. Never retried internally;
    ///   backpressure (wait a frame, retry) is the caller's policy.
    pub fn allocate(&self, size: u64, alignment: u32) -> GpuMemResult<AllocationHandle> {
        let class_index = self.table.select(size, alignment)?;
        let handle = self.classes[class_index].allocate()?;
        self.allocated_bytes.fetch_add(handle.size, Ordering::Relaxed);
        Ok(handle)
    }

    /// Allocates with scope-bound release: the returned guard enqueues the
    /// free when dropped.
    ///
    /// # Errors
    ///
    /// Same as [`MemoryPool::allocate`].
    pub fn allocate_scoped(&self, size: u64, alignment: u32) -> GpuMemResult<ScopedAllocation<'_>> {
        let handle = self.allocate(size, alignment)?;
        Ok(ScopedAllocation {
            pool: self,
            handle: Some(handle),
        })
    }

    /// Frees an allocation.
    ///
    /// Nothing is released immediately: the handle is parked in the current
    /// garbage bucket and its slot becomes reusable only after a later
    /// [`MemoryPool::end_frame`] observes the bucket's completion token
    /// signaled. Double-free is a caller bug (the sweep asserts).
    pub fn free(&self, handle: AllocationHandle) {
        self.garbage.enqueue(handle);
    }

    /// Frame synchronization point.
    ///
    /// Stamps the frame's frees with a fresh completion token and reclaims
    /// every prior frame whose token has signaled. Call once per frame from
    /// the coordinating thread.
    pub fn end_frame(&self) {
        let reclaimed = self.garbage.sweep(&*self.tokens, &self.classes, false);
        self.allocated_bytes.fetch_sub(reclaimed, Ordering::Relaxed);
    }

    /// Returns current statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let mut in_use_bytes = 0u64;
        let mut chunk_bytes = 0u64;
        let mut chunk_count = 0u32;
        for class in &self.classes {
            let occupancy = class.occupancy();
            in_use_bytes += occupancy.in_use_bytes;
            chunk_bytes += occupancy.chunk_bytes;
            chunk_count += occupancy.chunk_count;
        }
        let external_fragmentation = if chunk_bytes == 0 {
            0.0
        } else {
            1.0 - in_use_bytes as f32 / chunk_bytes as f32
        };
        PoolStats {
            allocated_bytes: self.allocated_bytes.load(Ordering::Relaxed),
            chunk_count,
            chunks_created: self.budget.total_created(),
            external_fragmentation,
        }
    }

    /// Tears the pool down: waits for the device to go idle, force-sweeps
    /// every garbage bucket (a token that never signals - device lost - is
    /// unrecoverable by then anyway), and destroys all remaining chunks.
    ///
    /// Called automatically on drop if not called explicitly.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        self.provider.wait_idle();
        let in_flight = self.garbage.pending_count();
        if in_flight > 0 {
            tracing::debug!("force-sweeping {} in-flight frees at teardown", in_flight);
        }
        let reclaimed = self.garbage.sweep(&*self.tokens, &self.classes, true);
        self.allocated_bytes.fetch_sub(reclaimed, Ordering::Relaxed);

        let leaked_slots: u64 = self
            .classes
            .iter()
            .map(ClassAllocator::destroy_all_chunks)
            .sum();
        if leaked_slots > 0 {
            tracing::warn!(
                "forgot to deallocate GPU memory: {} slots still live at pool teardown",
                leaked_slots
            );
        }
        self.allocated_bytes.store(0, Ordering::Relaxed);
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Scope-bound allocation: dropping the guard frees the allocation.
///
/// # Contract
///
/// Release is asymmetric: `Drop` only *enqueues* the free into the garbage
/// collector. The memory is reclaimed at a later
/// [`MemoryPool::end_frame`] once the frame's completion token signals,
/// not when the guard goes out of scope.
pub struct ScopedAllocation<'pool> {
    pool: &'pool MemoryPool,
    handle: Option<AllocationHandle>,
}

impl ScopedAllocation<'_> {
    /// The underlying handle, for binding.
    ///
    /// # Panics
    ///
    /// Never panics in practice: the handle is only vacated by
    /// [`ScopedAllocation::into_handle`], which consumes the guard.
    #[inline]
    #[must_use]
    pub fn handle(&self) -> &AllocationHandle {
        self.handle.as_ref().expect("guard always holds a handle")
    }

    /// Escapes the scope: takes ownership of the handle without freeing.
    #[must_use]
    pub fn into_handle(mut self) -> AllocationHandle {
        self.handle.take().expect("guard always holds a handle")
    }
}

impl Drop for ScopedAllocation<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.free(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmptyChunkPolicy, SizeClassConfig};
    use crate::provider::{ChunkHandle, CompletionToken, ProviderError};
    use std::sync::atomic::AtomicU64 as StdAtomicU64;

    struct TestProvider {
        next: StdAtomicU64,
    }

    impl ChunkProvider for TestProvider {
        fn allocate_chunk(
            &self,
            _class_index: usize,
            _size: u64,
        ) -> Result<ChunkHandle, ProviderError> {
            Ok(ChunkHandle(self.next.fetch_add(1, Ordering::Relaxed)))
        }

        fn destroy_chunk(&self, _handle: ChunkHandle) {}

        fn wait_idle(&self) {}
    }

    struct InstantToken;

    impl CompletionToken for InstantToken {
        fn is_signaled(&self) -> bool {
            true
        }
    }

    struct InstantTokenSource;

    impl CompletionTokenSource for InstantTokenSource {
        fn issue_token(&self) -> Box<dyn CompletionToken> {
            Box::new(InstantToken)
        }
    }

    fn test_pool() -> MemoryPool {
        let config = PoolConfig {
            size_classes: vec![
                SizeClassConfig { slot_size: 32, slots_per_chunk: 32 },
                SizeClassConfig { slot_size: 64, slots_per_chunk: 16 },
                SizeClassConfig { slot_size: 128, slots_per_chunk: 8 },
                SizeClassConfig { slot_size: 1024, slots_per_chunk: 1 },
            ],
            max_chunks: 8,
            frames_in_flight: 2,
            empty_chunk_policy: EmptyChunkPolicy::DestroyImmediately,
        };
        MemoryPool::new(
            &config,
            Arc::new(TestProvider {
                next: StdAtomicU64::new(0),
            }),
            Box::new(InstantTokenSource),
        )
        .unwrap()
    }

    #[test]
    fn test_allocate_updates_stats() {
        let pool = test_pool();
        let handle = pool.allocate(5, 4).unwrap();
        assert_eq!(handle.size(), 32);
        assert_eq!(handle.class_index(), 0);

        let stats = pool.stats();
        assert_eq!(stats.allocated_bytes, 32);
        assert_eq!(stats.chunk_count, 1);
        assert_eq!(stats.chunks_created, 1);
        assert!(stats.external_fragmentation > 0.9);
        pool.free(handle);
    }

    #[test]
    fn test_free_then_end_frames_returns_to_zero() {
        let pool = test_pool();
        let handle = pool.allocate(100, 1).unwrap();
        pool.free(handle);

        // Stats don't move at free time.
        assert_eq!(pool.stats().allocated_bytes, 128);

        // Flush all in-flight buckets.
        pool.end_frame();
        pool.end_frame();
        let stats = pool.stats();
        assert_eq!(stats.allocated_bytes, 0);
        assert_eq!(stats.chunk_count, 0);
    }

    #[test]
    fn test_jumbo_allocation_spans_whole_chunk() {
        let pool = test_pool();
        let handle = pool.allocate(1000, 1).unwrap();
        assert_eq!(handle.class_index(), 3);
        assert_eq!(handle.offset(), 0);
        assert_eq!(handle.size(), 1024);
        pool.free(handle);
    }

    #[test]
    fn test_scoped_allocation_frees_on_drop() {
        let pool = test_pool();
        {
            let scoped = pool.allocate_scoped(40, 4).unwrap();
            assert_eq!(scoped.handle().size(), 64);
        }
        // Drop enqueued the free; the sweep reclaims it.
        pool.end_frame();
        pool.end_frame();
        assert_eq!(pool.stats().allocated_bytes, 0);
    }

    #[test]
    fn test_scoped_into_handle_escapes_the_scope() {
        let pool = test_pool();
        let handle = {
            let scoped = pool.allocate_scoped(40, 4).unwrap();
            scoped.into_handle()
        };
        // Not freed by the guard.
        pool.end_frame();
        pool.end_frame();
        assert_eq!(pool.stats().allocated_bytes, 64);
        pool.free(handle);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut pool = test_pool();
        let handle = pool.allocate(8, 1).unwrap();
        pool.free(handle);
        pool.shutdown();
        pool.shutdown();
        assert_eq!(pool.stats().allocated_bytes, 0);
        assert_eq!(pool.stats().chunk_count, 0);
    }
}
