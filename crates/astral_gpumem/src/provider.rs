//! # External Collaborator Contracts
//!
//! The pool never talks to a graphics API directly. Backing chunks and
//! completion tokens come from these traits, implemented by the graphics
//! abstraction layer (Vulkan, D3D, a mock in tests).

use thiserror::Error;

/// Opaque handle to one backing chunk allocation (a GPU buffer or image
/// region), minted by the [`ChunkProvider`].
///
/// The pool never interprets the value; callers hand it back to the graphics
/// layer to resolve a base address or descriptor for binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChunkHandle(pub u64);

/// A backing chunk allocation failed inside the provider (device OOM,
/// driver error).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("chunk provider failure: {0}")]
pub struct ProviderError(pub String);

/// Creates and destroys backing chunks by calling into the graphics API.
///
/// Calls may block on driver work. `destroy_chunk` is only ever invoked for
/// chunks with zero live slots; if the provider cannot otherwise guarantee
/// that no in-flight GPU work references the chunk, it must perform its own
/// device-idle wait (a slow, rare path - allocator policy keeps chunk churn
/// low, see [`EmptyChunkPolicy`](crate::config::EmptyChunkPolicy)).
pub trait ChunkProvider: Send + Sync {
    /// Allocates one backing chunk of `size` bytes for the given size class.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if the device allocation itself failed.
    fn allocate_chunk(&self, class_index: usize, size: u64) -> Result<ChunkHandle, ProviderError>;

    /// Destroys a backing chunk. Called only for fully-empty chunks.
    fn destroy_chunk(&self, handle: ChunkHandle);

    /// Blocks until all outstanding GPU work has finished.
    ///
    /// Used once, at pool teardown, before the forced garbage sweep.
    fn wait_idle(&self);
}

/// An opaque completion token ("fence").
///
/// Reports whether all GPU work submitted before the token was issued has
/// finished. Polled, never waited on, by the garbage collector.
pub trait CompletionToken: Send {
    /// Returns true once the GPU work covered by this token has completed.
    fn is_signaled(&self) -> bool;
}

/// Issues completion tokens tied to the external submission stream.
pub trait CompletionTokenSource: Send + Sync {
    /// Issues a token covering all GPU work submitted so far this frame.
    fn issue_token(&self) -> Box<dyn CompletionToken>;
}
