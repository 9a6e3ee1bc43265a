#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! A memory budget shared by many variable-size buffers, evicting the least recently used ones
//! when the budget runs out and restoring them transparently when they are used again.
//!
//! A [`Pool`] owns a limit and tracks every buffer admitted against it. When an allocation would
//! exceed the limit, the pool asks the least recently used items to discard themselves. An item
//! that is discarded moves its contents into its [`Backing`], such as a compressed in-memory copy
//! ([`CompressedBacking`]) or a block in a [`BlockStore`] ([`StoredBacking`]), and releases its
//! buffer. The next operation that touches the item allocates a new buffer, evicting others in
//! turn, and restores the contents.
//!
//! Two kinds of pools differ in what they count:
//!
//! * [`CountLimitedPool`] charges each item its capacity in elements.
//! * [`IndirectCountLimitedPool`] charges each item its deep footprint in bytes: the buffer itself
//!   plus the heap memory owned by the elements, as reported through [`DeepSized`].
//!
//! The consumer-facing item type is [`PooledVec`], a growable vector whose buffer lives in a
//! pool.
//!
//! # Example
//!
//! ```
//! use std::num::NonZero;
//! use std::sync::Arc;
//!
//! use budget_pool::{
//!     BlockStore, CountLimitedPool, MemoryBlockStore, StoredBacking, StoredPooledVec,
//! };
//!
//! let pool = CountLimitedPool::<u64>::builder()
//!     .limit(NonZero::new(1_000).unwrap())
//!     .build();
//!
//! let store: Arc<dyn BlockStore<u64>> = Arc::new(MemoryBlockStore::<u64>::new());
//!
//! let vectors: Vec<_> = (0..5)
//!     .map(|_| StoredPooledVec::with_backing(&pool, StoredBacking::new(Arc::clone(&store))))
//!     .collect();
//!
//! // Each vector needs 400 elements; only two fit in the budget at a time.
//! for (index, vector) in vectors.iter().enumerate() {
//!     let value = u64::try_from(index).unwrap();
//!     vector.extend_from_slice(&[value; 400]).unwrap();
//! }
//!
//! assert!(pool.used() <= 1_000);
//! assert!(vectors[0].is_discarded());
//!
//! // The first vector comes back from the store when used.
//! assert_eq!(vectors[0].get(399).unwrap(), Some(0));
//! ```
//!
//! # Thread safety
//!
//! Pools and items are thread-safe. Every operation runs inside the pool's reentrant critical
//! section, so operations on items of the same pool are serialized. Eviction runs synchronously
//! inside the operation that needs the room and may therefore wait for block store I/O.
//!
//! # Logging
//!
//! The crate emits `tracing` events: `trace` for admissions and frees, `debug` for evictions and
//! limit changes, `warn` when an eviction fails. No subscriber is installed.

mod allocator;
mod backing;
mod builder;
mod compressed;
mod error;
mod file_store;
mod item;
mod member;
mod meter;
mod pool;
mod recency;
mod slot;
mod stats;
mod store;
mod stored;
mod vector;

pub use allocator::*;
pub use backing::*;
pub use builder::*;
pub use compressed::*;
pub use error::*;
pub use file_store::*;
pub(crate) use item::PoolItem;
pub use item::PinGuard;
pub use member::*;
pub use meter::*;
pub use pool::*;
pub(crate) use recency::RecencyList;
pub use recency::PositionToken;
pub use slot::*;
pub use stats::*;
pub use store::*;
pub use stored::*;
pub use vector::*;

/// Re-exported so that compression levels can be chosen without depending on `flate2` directly.
pub use flate2::Compression;
