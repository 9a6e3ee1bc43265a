use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::{Backing, BlockId, BlockStore, Result};

/// A [`Backing`] that persists discarded contents as a block in a shared [`BlockStore`].
///
/// The block is kept after a restore, so an item that was not modified since it was last
/// persisted is discarded without writing anything. Blocks are owned by the store and outlive
/// the item; [`block_id()`][Self::block_id] names the block to reopen it later with
/// [`from_block()`][Self::from_block].
pub struct StoredBacking<T, S: ?Sized = dyn BlockStore<T>> {
    store: Arc<S>,
    block: Option<BlockId>,

    _elements: PhantomData<fn(T) -> T>,
}

impl<T, S: BlockStore<T> + ?Sized> StoredBacking<T, S> {
    /// Creates a backing that writes a new block on first persist.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            block: None,
            _elements: PhantomData,
        }
    }

    /// Creates a backing over a block that already exists in the store.
    ///
    /// An item with such a backing starts discarded and loads the block on first access.
    #[must_use]
    pub fn from_block(store: Arc<S>, block: BlockId) -> Self {
        Self {
            store,
            block: Some(block),
            _elements: PhantomData,
        }
    }

    /// The block holding the persisted contents, if anything was persisted yet.
    #[must_use]
    pub fn block_id(&self) -> Option<BlockId> {
        self.block
    }

    /// The store blocks are written to.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

impl<T, S: BlockStore<T> + ?Sized> fmt::Debug for StoredBacking<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredBacking")
            .field("store", &self.store)
            .field("block", &self.block)
            .finish()
    }
}

impl<T, S: BlockStore<T> + ?Sized> Backing<T> for StoredBacking<T, S> {
    fn persist(&mut self, contents: &[T]) -> Result<()> {
        self.block = Some(self.store.store_block(contents, self.block)?);
        Ok(())
    }

    fn restore(&mut self, buffer: &mut Vec<T>, max_count: usize) -> Result<usize> {
        let Some(block) = self.block else {
            return Ok(0);
        };

        Ok(self.store.load_block(buffer, max_count, block)?)
    }

    fn is_persisted(&self) -> bool {
        self.block.is_some()
    }

    fn persisted_len(&self) -> Result<Option<usize>> {
        self.block
            .map(|block| self.store.block_data_count(block))
            .transpose()
            .map_err(Into::into)
    }
}
