//! # ASTRAL GPU Memory Pool
//!
//! Class-based (size-segregated) allocator for large GPU backing regions
//! shared between CPU submission threads and the GPU:
//! - Arbitrary sizes round up to fixed size classes; each class owns its
//!   chunks and a slot bitmap per chunk
//! - Per-class locking - allocations of different sizes never contend
//! - Frees are deferred behind completion tokens ("fences"): a slot is
//!   reused only after the GPU work that last touched it has finished
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         MemoryPool                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │  allocate ─→ SizeClassTable ─→ ClassAllocator ─→ Chunk/slot  │
//! │  free ─────→ GarbageCollector (active bucket)                │
//! │  end_frame → stamp fence → sweep signaled buckets ──┐        │
//! │                                                     ▼        │
//! │                          ClassAllocator::release_slot        │
//! └──────────────────────────────────────────────────────────────┘
//!        ▲                                        ▲
//!   ChunkProvider                        CompletionTokenSource
//!   (graphics API)                       (submission system)
//! ```
//!
//! ## ARCHITECT'S MANDATE
//!
//! - Memory freed by the CPU is NEVER reused while the GPU may touch it
//! - Allocation failure is reported, never silently retried
//! - Deterministic placement: lowest free slot wins, always
//!
//! ## Example
//!
//! ```rust,ignore
//! let pool = MemoryPool::new(&PoolConfig::default(), provider, tokens)?;
//!
//! let handle = pool.allocate(4096, 256)?;
//! // ... record GPU work against handle.memory() + handle.offset() ...
//! pool.free(handle);        // enqueued, not reclaimed
//! pool.end_frame();         // reclaimed once the frame's fence signals
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

mod chunk;
mod class_alloc;
mod garbage;

pub mod config;
pub mod error;
pub mod handle;
pub mod pool;
pub mod provider;
pub mod size_class;

pub use chunk::MAX_SLOTS_PER_CHUNK;
pub use config::{EmptyChunkPolicy, PoolConfig, SizeClassConfig};
pub use error::{GpuMemError, GpuMemResult};
pub use handle::AllocationHandle;
pub use pool::{MemoryPool, PoolStats, ScopedAllocation};
pub use provider::{
    ChunkHandle, ChunkProvider, CompletionToken, CompletionTokenSource, ProviderError,
};
pub use size_class::{SizeClass, SizeClassTable};
