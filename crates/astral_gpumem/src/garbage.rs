//! # Fence-Deferred Garbage Collection
//!
//! The CPU cannot know when the GPU is done with freed memory. Frees are
//! therefore parked in per-frame buckets; a bucket is only swept back into
//! the class allocators once its completion token has signaled.

use crate::class_alloc::ClassAllocator;
use crate::handle::AllocationHandle;
use crate::provider::{CompletionToken, CompletionTokenSource};
use parking_lot::Mutex;

/// Frees from one frame, waiting for one completion token.
///
/// Holds the freed handles by value. The underlying slots stay marked
/// in-use in their chunk bitmaps until the sweep, which is what prevents
/// `allocate` from handing them out early.
struct GarbageBucket {
    handles: Vec<AllocationHandle>,
    token: Option<Box<dyn CompletionToken>>,
}

impl GarbageBucket {
    const fn new() -> Self {
        Self {
            handles: Vec::new(),
            token: None,
        }
    }
}

/// Bounded ring of garbage buckets, one active at a time.
///
/// Explicit head index over a plain `Vec` - the state is always a valid
/// index, never a sentinel.
struct Ring {
    buckets: Vec<GarbageBucket>,
    active: usize,
}

/// Defers frees until the GPU work that may touch them has completed.
pub(crate) struct GarbageCollector {
    ring: Mutex<Ring>,
}

impl GarbageCollector {
    /// Creates a collector with `depth` buckets (max frames in flight).
    pub(crate) fn new(depth: usize) -> Self {
        assert!(depth > 0, "garbage ring depth must be at least 1");
        let buckets = (0..depth).map(|_| GarbageBucket::new()).collect();
        Self {
            ring: Mutex::new(Ring { buckets, active: 0 }),
        }
    }

    /// Parks a freed handle in the active bucket.
    ///
    /// Thread-safe; guarded by the ring mutex only, so frees never contend
    /// with `allocate` calls on class locks.
    pub(crate) fn enqueue(&self, handle: AllocationHandle) {
        let mut ring = self.ring.lock();
        let active = ring.active;
        ring.buckets[active].handles.push(handle);
    }

    /// Number of handles currently parked across all buckets.
    pub(crate) fn pending_count(&self) -> usize {
        let ring = self.ring.lock();
        ring.buckets.iter().map(|b| b.handles.len()).sum()
    }

    /// Frame synchronization point.
    ///
    /// Stamps a fresh completion token onto the active bucket if it
    /// collected any frees this frame and rotates to the next bucket, then
    /// sweeps every retired bucket whose token has signaled, returning the
    /// reclaimed slots to their class allocators.
    ///
    /// With `force_all` (teardown, after a device-idle wait) every bucket is
    /// swept regardless of token state.
    ///
    /// Returns the number of bytes reclaimed. Must not be called
    /// concurrently with itself; concurrent `enqueue` is fine.
    pub(crate) fn sweep(
        &self,
        tokens: &dyn CompletionTokenSource,
        classes: &[ClassAllocator],
        force_all: bool,
    ) -> u64 {
        let mut ring = self.ring.lock();

        let active = ring.active;
        if !ring.buckets[active].handles.is_empty() {
            // Rotating onto a bucket that is still pending only re-stamps it
            // with a newer token later, which delays but never hastens reuse.
            ring.buckets[active].token = Some(tokens.issue_token());
            ring.active = (active + 1) % ring.buckets.len();
        }

        let active = ring.active;
        let mut reclaimed_bytes = 0u64;
        for (index, bucket) in ring.buckets.iter_mut().enumerate() {
            if index == active && !force_all {
                continue;
            }
            let ready = force_all
                || bucket
                    .token
                    .as_ref()
                    .is_some_and(|token| token.is_signaled());
            if !ready {
                continue;
            }
            bucket.token = None;
            for handle in bucket.handles.drain(..) {
                reclaimed_bytes += handle.size;
                classes[handle.class_index].release_slot(handle.chunk_id, handle.offset);
            }
        }
        reclaimed_bytes
    }
}
