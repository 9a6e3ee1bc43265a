use thiserror::Error;

use crate::BlockId;

/// Errors that can occur when operating a pool or one of its items.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// The pool could not make enough room for the requested charge, either because the charge
    /// exceeds the limit on its own or because no evictable items remained.
    #[error("pool budget exhausted: {needed} units needed but the limit is {limit}")]
    Exhausted {
        /// The charge the pool was asked to accommodate.
        needed: usize,

        /// The limit of the pool at the time of the failure.
        limit: usize,
    },

    /// The allocator returned no memory for the request.
    #[error("allocator failed to provide capacity for {requested} elements")]
    AllocatorFailed {
        /// The number of elements requested from the allocator.
        requested: usize,
    },

    /// An item chosen for eviction failed to discard itself. The operation that triggered the
    /// eviction has failed as a result.
    #[error("evicting the least recently used item failed")]
    EvictionFailed {
        /// The reason the victim failed to discard itself.
        #[source]
        source: Box<Self>,
    },

    /// An item chosen for eviction reported success but remained admitted.
    #[error("eviction victim reported success but is still admitted to the pool")]
    VictimRefused,

    /// The item chosen for eviction is being accessed further up the current thread's stack,
    /// so it cannot discard itself.
    #[error("eviction victim is in use by the current thread")]
    VictimInUse,

    /// The operation requires an admitted item but the item is not admitted.
    #[error("the item is not admitted to the pool")]
    NotAdmitted,

    /// The operation requires an item that is not yet admitted.
    #[error("the item is already admitted to the pool")]
    AlreadyAdmitted,

    /// The operation requires an item that was removed from the pool but it is still admitted.
    #[error("the item is still admitted to the pool")]
    StillAdmitted,

    /// The item still holds memory that was removed from the pool but never released.
    #[error("the item holds removed memory that must be released first")]
    HoldsRemovedMemory,

    /// The block store failed to persist or load data.
    #[error(transparent)]
    Store(#[from] BlockStoreError),

    /// Encoding or decoding of item contents failed.
    #[error("failed to encode or decode item contents")]
    Codec(#[from] postcard::Error),

    /// An I/O operation failed while compressing or decompressing item contents.
    #[error("I/O failure while processing item contents")]
    Io(#[from] std::io::Error),
}

impl PoolError {
    /// Whether this error means the pool ran out of budget or the allocator ran out of memory.
    ///
    /// Both are reported to the caller the same way: the operation could not get memory.
    #[must_use]
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, Self::Exhausted { .. } | Self::AllocatorFailed { .. })
    }
}

/// Errors reported by a [`BlockStore`][crate::BlockStore].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BlockStoreError {
    /// No block exists under the given identifier.
    #[error("block {0} does not exist in the store")]
    UnknownBlock(BlockId),

    /// The block exists but could not be read or written.
    #[error("I/O failure on block store")]
    Io(#[from] std::io::Error),

    /// The block contents could not be encoded or decoded.
    #[error("block contents could not be encoded or decoded")]
    Codec(#[from] postcard::Error),

    /// The store refused the operation for an implementation-specific reason.
    #[error("block store rejected the operation: {0}")]
    Rejected(String),
}

/// A specialized `Result` type for pool operations, returning the crate's
/// [`PoolError`] type as the error value.
pub type Result<T> = std::result::Result<T, PoolError>;
