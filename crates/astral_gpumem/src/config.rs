//! # Pool Configuration
//!
//! Size-class table, chunk budget and garbage ring depth. Loaded once at
//! startup, typically from TOML.

use crate::chunk::MAX_SLOTS_PER_CHUNK;
use crate::error::{GpuMemError, GpuMemResult};
use serde::Deserialize;

/// What to do with a chunk that becomes fully empty after a garbage sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyChunkPolicy {
    /// Destroy the chunk immediately. The provider may need a device-idle
    /// wait before releasing the backing memory - slow but frees memory as
    /// early as possible.
    DestroyImmediately,
    /// Keep at most one empty chunk per size class as a warm spare, so
    /// alloc/free bursts of the same size don't churn device allocations.
    RetainWarm,
}

/// One size class: fixed slot size and how many slots one chunk carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SizeClassConfig {
    /// Size of every slot in this class, in bytes.
    pub slot_size: u64,
    /// Number of slots per chunk. Chunk size is `slot_size * slots_per_chunk`.
    pub slots_per_chunk: u32,
}

/// Configuration for a [`MemoryPool`](crate::pool::MemoryPool).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Size classes in strictly increasing slot size. The last class must be
    /// a single-slot jumbo class spanning a whole chunk.
    pub size_classes: Vec<SizeClassConfig>,
    /// Pool-wide ceiling on live chunks across all classes.
    pub max_chunks: u32,
    /// Depth of the garbage ring - the maximum number of frames in flight
    /// between the CPU and the GPU (typically 2-3).
    pub frames_in_flight: usize,
    /// Policy for fully-empty chunks.
    pub empty_chunk_policy: EmptyChunkPolicy,
}

impl Default for PoolConfig {
    /// Six classes covering 256 bytes up to an 80 MiB whole-chunk jumbo
    /// class. Small classes get many slots per chunk, large classes few.
    fn default() -> Self {
        const KB: u64 = 1024;
        const MB: u64 = 1024 * 1024;
        Self {
            size_classes: vec![
                SizeClassConfig { slot_size: 256, slots_per_chunk: 64 },
                SizeClassConfig { slot_size: 4 * KB, slots_per_chunk: 64 },
                SizeClassConfig { slot_size: 128 * KB, slots_per_chunk: 64 },
                SizeClassConfig { slot_size: MB, slots_per_chunk: 32 },
                SizeClassConfig { slot_size: 10 * MB, slots_per_chunk: 8 },
                SizeClassConfig { slot_size: 80 * MB, slots_per_chunk: 1 },
            ],
            max_chunks: 64,
            frames_in_flight: 3,
            empty_chunk_policy: EmptyChunkPolicy::RetainWarm,
        }
    }
}

impl PoolConfig {
    /// Parses a configuration from a TOML document and validates it.
    ///
    /// # Errors
    ///
    /// Returns [`GpuMemError::InvalidConfig`] if the document does not parse
    /// or the parsed configuration fails [`PoolConfig::validate`].
    pub fn from_toml_str(text: &str) -> GpuMemResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| GpuMemError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`GpuMemError::InvalidConfig`] if the class table is empty,
    /// slot sizes are not strictly increasing, any class has zero or more
    /// than 128 slots per chunk, the last class is not a single-slot jumbo
    /// class, or the chunk budget / ring depth is zero.
    pub fn validate(&self) -> GpuMemResult<()> {
        if self.size_classes.is_empty() {
            return Err(GpuMemError::InvalidConfig(
                "size class table is empty".to_string(),
            ));
        }
        let mut prev_size = 0u64;
        for (index, class) in self.size_classes.iter().enumerate() {
            if class.slot_size <= prev_size {
                return Err(GpuMemError::InvalidConfig(format!(
                    "slot sizes must be strictly increasing: class {index} has slot size {}",
                    class.slot_size
                )));
            }
            if class.slots_per_chunk == 0 || class.slots_per_chunk > MAX_SLOTS_PER_CHUNK {
                return Err(GpuMemError::InvalidConfig(format!(
                    "class {index}: slots per chunk must be in 1..={MAX_SLOTS_PER_CHUNK}, \
                     got {}",
                    class.slots_per_chunk
                )));
            }
            prev_size = class.slot_size;
        }
        // Jumbo allocations span a whole chunk.
        let last = self.size_classes[self.size_classes.len() - 1];
        if last.slots_per_chunk != 1 {
            return Err(GpuMemError::InvalidConfig(format!(
                "last class must be a single-slot jumbo class, got {} slots per chunk",
                last.slots_per_chunk
            )));
        }
        if self.max_chunks == 0 {
            return Err(GpuMemError::InvalidConfig(
                "max_chunks must be at least 1".to_string(),
            ));
        }
        if self.frames_in_flight == 0 {
            return Err(GpuMemError::InvalidConfig(
                "frames_in_flight must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
