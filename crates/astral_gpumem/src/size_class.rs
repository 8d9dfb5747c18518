//! # Size Classes
//!
//! Static table of allocation size classes. Requests round up to the
//! smallest class whose slot size fits both the size and the alignment.

use crate::config::SizeClassConfig;
use crate::error::{GpuMemError, GpuMemResult};

/// One size class: every slot in a chunk of this class has the same size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClass {
    /// Fixed slot size in bytes.
    pub slot_size: u64,
    /// Slots per chunk.
    pub slots_per_chunk: u32,
}

impl SizeClass {
    /// Size of one backing chunk of this class, in bytes.
    #[inline]
    #[must_use]
    pub const fn chunk_size(&self) -> u64 {
        self.slot_size * self.slots_per_chunk as u64
    }
}

/// The static, strictly-increasing table of size classes.
#[derive(Debug, Clone)]
pub struct SizeClassTable {
    classes: Vec<SizeClass>,
}

impl SizeClassTable {
    /// Builds the table from validated configuration entries.
    pub(crate) fn new(configs: &[SizeClassConfig]) -> Self {
        let classes = configs
            .iter()
            .map(|c| SizeClass {
                slot_size: c.slot_size,
                slots_per_chunk: c.slots_per_chunk,
            })
            .collect();
        Self { classes }
    }

    /// Returns the number of classes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Returns true if the table has no classes.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Returns the class at `index`.
    #[inline]
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&SizeClass> {
        self.classes.get(index)
    }

    /// Returns all classes in increasing slot-size order.
    #[inline]
    #[must_use]
    pub fn classes(&self) -> &[SizeClass] {
        &self.classes
    }

    /// Selects the class for an allocation request.
    ///
    /// Scans classes in increasing order and returns the first whose slot
    /// size is at least `size` and a multiple of `alignment` (slot offsets
    /// within a chunk are `index * slot_size`, and chunk bases are maximally
    /// aligned, so a slot size divisible by the alignment guarantees every
    /// slot offset satisfies it). A class that fits the size but not the
    /// alignment escalates the scan to larger classes.
    ///
    /// # Errors
    ///
    /// * [`GpuMemError::InvalidSize`] - `size` or `alignment` is zero.
    /// * [`GpuMemError::NoClassFits`] - the size or alignment exceeds every
    ///   class. A design-time invariant violation, not a transient failure.
    pub fn select(&self, size: u64, alignment: u32) -> GpuMemResult<usize> {
        if size == 0 || alignment == 0 {
            return Err(GpuMemError::InvalidSize);
        }
        for (index, class) in self.classes.iter().enumerate() {
            if class.slot_size >= size && class.slot_size % u64::from(alignment) == 0 {
                return Ok(index);
            }
        }
        Err(GpuMemError::NoClassFits { size, alignment })
    }
}
