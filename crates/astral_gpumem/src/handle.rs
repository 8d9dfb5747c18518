//! # Allocation Handles
//!
//! The opaque value returned by `allocate` and consumed by `free`.

use crate::provider::ChunkHandle;

/// A live allocation: one slot inside one chunk.
///
/// The handle is deliberately neither `Clone` nor `Copy`:
/// [`MemoryPool::free`](crate::pool::MemoryPool::free) consumes it by value,
/// so the type system makes double-free awkward. A valid handle always
/// refers to a currently-in-use slot; the pool does not track handle
/// identity at runtime, so forging one is a caller bug.
#[derive(Debug)]
pub struct AllocationHandle {
    pub(crate) class_index: usize,
    pub(crate) chunk_id: u64,
    pub(crate) backing: ChunkHandle,
    pub(crate) offset: u64,
    pub(crate) size: u64,
}

impl AllocationHandle {
    /// The backing chunk handle, for the render graph to resolve a base
    /// address or descriptor. Not interpreted by the pool.
    #[inline]
    #[must_use]
    pub fn memory(&self) -> ChunkHandle {
        self.backing
    }

    /// Byte offset of the slot within the backing chunk.
    #[inline]
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Reserved bytes: the requested size rounded up to the class slot size.
    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Index of the size class that served this allocation.
    #[inline]
    #[must_use]
    pub fn class_index(&self) -> usize {
        self.class_index
    }
}
