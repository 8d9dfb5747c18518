//! # GPU Memory Error Types
//!
//! All errors that can occur in the GPU memory pool.

use thiserror::Error;

/// Errors that can occur when allocating GPU memory.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuMemError {
    /// Zero-size or zero-alignment allocation request.
    #[error("invalid allocation request: size and alignment must be non-zero")]
    InvalidSize,

    /// No size class can satisfy the request. Indicates a configuration or
    /// usage mistake (alignment or size above the largest class), not a
    /// transient condition.
    #[error("no size class fits request: size {size}, alignment {alignment}")]
    NoClassFits {
        /// The requested size in bytes.
        size: u64,
        /// The requested minimum alignment in bytes.
        alignment: u32,
    },

    /// The pool-wide chunk budget is exhausted and no existing chunk has a
    /// free slot. Reported synchronously, never retried internally; waiting
    /// a frame and retrying is the caller's policy.
    #[error(
        "out of GPU memory in size class {class_index}: {chunk_count} chunks live, \
         budget exhausted{}",
        .provider_detail.as_deref().map(|d| format!(" ({d})")).unwrap_or_default()
    )]
    OutOfMemory {
        /// The size class that could not grow.
        class_index: usize,
        /// Number of chunks live across the pool when the allocation failed.
        chunk_count: u32,
        /// Detail from the chunk provider when the backing allocation itself
        /// failed (device OOM), for logging.
        provider_detail: Option<String>,
    },

    /// Invalid pool configuration.
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for GPU memory operations.
pub type GpuMemResult<T> = Result<T, GpuMemError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_memory_message_is_class_tagged() {
        let err = GpuMemError::OutOfMemory {
            class_index: 2,
            chunk_count: 64,
            provider_detail: None,
        };
        let msg = err.to_string();
        assert!(msg.contains("size class 2"));
        assert!(msg.contains("64 chunks"));
    }

    #[test]
    fn test_out_of_memory_message_carries_provider_detail() {
        let err = GpuMemError::OutOfMemory {
            class_index: 0,
            chunk_count: 1,
            provider_detail: Some("vkAllocateMemory failed".to_string()),
        };
        assert!(err.to_string().contains("vkAllocateMemory failed"));
    }
}
