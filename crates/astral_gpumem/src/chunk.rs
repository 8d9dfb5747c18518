//! # Chunks and Slot Bitmaps
//!
//! One chunk is one contiguous backing allocation subdivided into
//! fixed-size slots of a single size class. Slot occupancy is tracked with
//! a fixed-capacity bitmap.

use crate::provider::ChunkHandle;

/// Hard cap on slots per chunk. Two bitmap words cover it.
pub const MAX_SLOTS_PER_CHUNK: u32 = 128;

/// Fixed-capacity bitmap over at most [`MAX_SLOTS_PER_CHUNK`] slots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SlotBitmap {
    words: [u64; 2],
}

impl SlotBitmap {
    /// An all-clear bitmap.
    pub(crate) const fn empty() -> Self {
        Self { words: [0; 2] }
    }

    /// Returns whether bit `index` is set.
    #[inline]
    pub(crate) fn get(&self, index: u32) -> bool {
        debug_assert!(index < MAX_SLOTS_PER_CHUNK);
        self.words[(index / 64) as usize] & (1u64 << (index % 64)) != 0
    }

    /// Sets bit `index`.
    #[inline]
    pub(crate) fn set(&mut self, index: u32) {
        debug_assert!(index < MAX_SLOTS_PER_CHUNK);
        self.words[(index / 64) as usize] |= 1u64 << (index % 64);
    }

    /// Clears bit `index`.
    #[inline]
    pub(crate) fn clear(&mut self, index: u32) {
        debug_assert!(index < MAX_SLOTS_PER_CHUNK);
        self.words[(index / 64) as usize] &= !(1u64 << (index % 64));
    }

    /// Returns the lowest clear bit below `limit`, if any.
    ///
    /// Lowest-index-wins keeps slot placement deterministic and testable.
    pub(crate) fn first_clear(&self, limit: u32) -> Option<u32> {
        debug_assert!(limit <= MAX_SLOTS_PER_CHUNK);
        for (word_index, word) in self.words.iter().enumerate() {
            let inverted = !word;
            if inverted != 0 {
                let bit = word_index as u32 * 64 + inverted.trailing_zeros();
                return (bit < limit).then_some(bit);
            }
        }
        None
    }

    /// Returns the number of set bits.
    #[inline]
    pub(crate) fn count_set(&self) -> u32 {
        self.words[0].count_ones() + self.words[1].count_ones()
    }
}

/// One backing chunk of a single size class.
///
/// Lifecycle: `Empty -> Partial -> Full -> Partial -> ... -> Empty`.
/// Only empty chunks are ever destroyed.
#[derive(Debug)]
pub(crate) struct Chunk {
    /// Stable id, unique within the owning class.
    id: u64,
    /// The backing GPU allocation.
    backing: ChunkHandle,
    /// Slot occupancy. Bits stay set while a freed slot waits for its
    /// completion token, which is what prevents premature reuse.
    slots: SlotBitmap,
    /// Cached popcount of `slots`.
    in_use_count: u32,
}

impl Chunk {
    pub(crate) fn new(id: u64, backing: ChunkHandle) -> Self {
        Self {
            id,
            backing,
            slots: SlotBitmap::empty(),
            in_use_count: 0,
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub(crate) fn backing(&self) -> ChunkHandle {
        self.backing
    }

    #[inline]
    pub(crate) fn in_use_count(&self) -> u32 {
        self.in_use_count
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.in_use_count == 0
    }

    #[inline]
    pub(crate) fn is_full(&self, slots_per_chunk: u32) -> bool {
        self.in_use_count == slots_per_chunk
    }

    /// Claims the lowest free slot, returning its index.
    pub(crate) fn claim_first_free(&mut self, slots_per_chunk: u32) -> Option<u32> {
        let slot = self.slots.first_clear(slots_per_chunk)?;
        self.slots.set(slot);
        self.in_use_count += 1;
        Some(slot)
    }

    /// Releases a claimed slot.
    ///
    /// # Panics
    ///
    /// Panics if the slot is not in use - the caller double-freed or
    /// released through a forged handle.
    pub(crate) fn release(&mut self, slot: u32) {
        assert!(
            self.slots.get(slot),
            "released slot {slot} of chunk {} is not in use (double free?)",
            self.id
        );
        self.slots.clear(slot);
        self.in_use_count -= 1;
    }

    /// Checks the `in_use_count == popcount(slots)` invariant.
    pub(crate) fn invariant_holds(&self) -> bool {
        self.in_use_count == self.slots.count_set()
    }
}
