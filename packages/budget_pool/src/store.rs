use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::BlockStoreError;

/// Identifies a block of elements persisted in a [`BlockStore`].
///
/// Identifiers are opaque; they are only compared for equality and handed back to the store
/// that issued them.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct BlockId(u64);

impl BlockId {
    /// Creates an identifier from its raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw value of the identifier.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Persists contiguous buffers of elements under opaque identifiers and loads them back.
///
/// Used by [`StoredBacking`][crate::StoredBacking] to move the contents of discarded items out
/// of memory. A store is shared by many items, so all operations take `&self`.
pub trait BlockStore<T>: Send + Sync + fmt::Debug {
    /// Persists `data`, replacing the block `existing` if given.
    ///
    /// Returns the identifier the data can be loaded from, which is `existing` when it was given.
    ///
    /// # Errors
    ///
    /// Fails if `existing` is not a block of this store or the data cannot be written.
    fn store_block(&self, data: &[T], existing: Option<BlockId>)
    -> Result<BlockId, BlockStoreError>;

    /// Appends up to `max_count` elements of block `id` to `buffer`.
    ///
    /// Returns the number of elements appended.
    ///
    /// # Errors
    ///
    /// Fails if the block does not exist or cannot be read.
    fn load_block(
        &self,
        buffer: &mut Vec<T>,
        max_count: usize,
        id: BlockId,
    ) -> Result<usize, BlockStoreError>;

    /// The number of elements in block `id`.
    ///
    /// # Errors
    ///
    /// Fails if the block does not exist or cannot be read.
    fn block_data_count(&self, id: BlockId) -> Result<usize, BlockStoreError>;

    /// Deletes block `id`.
    ///
    /// Returns `false` if there was no such block.
    ///
    /// # Errors
    ///
    /// Fails if the block exists but cannot be deleted.
    fn destroy_block(&self, id: BlockId) -> Result<bool, BlockStoreError>;
}

/// A [`BlockStore`] that keeps blocks in process memory.
///
/// Useful for tests and for items whose contents must survive eviction without ever touching
/// the disk. Memory held by this store is not charged against any pool.
///
/// # Examples
///
/// ```
/// use budget_pool::{BlockStore, MemoryBlockStore};
///
/// let store = MemoryBlockStore::<u16>::new();
/// let id = store.store_block(&[1_u16, 2, 3], None).unwrap();
///
/// let mut loaded = Vec::new();
/// assert_eq!(store.load_block(&mut loaded, 2, id).unwrap(), 2);
/// assert_eq!(loaded, [1, 2]);
/// ```
pub struct MemoryBlockStore<T> {
    blocks: Mutex<HashMap<BlockId, Vec<T>>>,
    next_id: AtomicU64,
}

impl<T> MemoryBlockStore<T> {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of blocks currently in the store.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.lock().len()
    }

    /// Whether the store holds no blocks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.lock().is_empty()
    }
}

impl<T> Default for MemoryBlockStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for MemoryBlockStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBlockStore")
            .field("block_count", &self.block_count())
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send> BlockStore<T> for MemoryBlockStore<T> {
    fn store_block(
        &self,
        data: &[T],
        existing: Option<BlockId>,
    ) -> Result<BlockId, BlockStoreError> {
        let mut blocks = self.blocks.lock();

        let id = match existing {
            Some(id) if !blocks.contains_key(&id) => {
                return Err(BlockStoreError::UnknownBlock(id));
            }
            Some(id) => id,
            None => BlockId(self.next_id.fetch_add(1, Ordering::Relaxed)),
        };

        blocks.insert(id, data.to_vec());
        Ok(id)
    }

    fn load_block(
        &self,
        buffer: &mut Vec<T>,
        max_count: usize,
        id: BlockId,
    ) -> Result<usize, BlockStoreError> {
        let blocks = self.blocks.lock();
        let block = blocks.get(&id).ok_or(BlockStoreError::UnknownBlock(id))?;

        let count = block.len().min(max_count);
        buffer.extend_from_slice(block.get(..count).unwrap_or_default());
        Ok(count)
    }

    fn block_data_count(&self, id: BlockId) -> Result<usize, BlockStoreError> {
        self.blocks
            .lock()
            .get(&id)
            .map(Vec::len)
            .ok_or(BlockStoreError::UnknownBlock(id))
    }

    fn destroy_block(&self, id: BlockId) -> Result<bool, BlockStoreError> {
        Ok(self.blocks.lock().remove(&id).is_some())
    }
}
