use std::fmt;
use std::mem;
use std::sync::Arc;

use crate::{
    Backing, BlockId, BlockStore, CompressedBacking, ElementCount, Meter, PinGuard, Pool, PoolItem,
    Result, StoredBacking,
};

/// A pooled vector whose contents are compressed in memory while evicted.
pub type CompressedPooledVec<T, M = ElementCount> = PooledVec<T, CompressedBacking<T>, M>;

/// A pooled vector whose contents are written to a shared [`BlockStore`] while evicted.
pub type StoredPooledVec<T, M = ElementCount> = PooledVec<T, StoredBacking<T>, M>;

/// A growable vector whose buffer is charged against a [`Pool`] and may be evicted from memory
/// when the pool needs room.
///
/// Evicted contents go to the vector's [`Backing`] and are brought back transparently by the
/// next operation that touches the vector. Every such operation also marks the vector as the
/// most recently used item of its pool. Because any operation may need to allocate or restore,
/// most operations are fallible.
///
/// Clones are handles to the same vector. The buffer is released when the last handle is
/// dropped; persisted copies are not deleted.
///
/// Contents are only reachable through closures or by value, as the buffer may move or be
/// evicted between operations.
///
/// # Examples
///
/// ```
/// use std::num::NonZero;
///
/// use budget_pool::{CountLimitedPool, CompressedPooledVec};
///
/// let pool = CountLimitedPool::<u32>::builder()
///     .limit(NonZero::new(1000).unwrap())
///     .build();
///
/// let values = CompressedPooledVec::new(&pool);
/// values.extend_from_slice(&[1, 2, 3]).unwrap();
/// values.push(4).unwrap();
///
/// let sum = values.read(|contents| contents.iter().sum::<u32>()).unwrap();
/// assert_eq!(sum, 10);
/// ```
pub struct PooledVec<T, B, M = ElementCount>
where
    T: Send + 'static,
    B: Backing<T> + 'static,
    M: Meter<T>,
{
    item: Arc<PoolItem<T, B, M>>,
}

impl<T, B, M> PooledVec<T, B, M>
where
    T: Send + 'static,
    B: Backing<T> + 'static,
    M: Meter<T>,
{
    /// Creates an empty vector in `pool` with a default backing.
    #[must_use]
    pub fn new(pool: &Pool<T, M>) -> Self
    where
        B: Default,
    {
        Self::with_backing(pool, B::default())
    }

    /// Creates an empty vector in `pool` that evicts into `backing`.
    ///
    /// Nothing is allocated until the first element arrives.
    #[must_use]
    pub fn with_backing(pool: &Pool<T, M>, backing: B) -> Self {
        Self {
            item: PoolItem::new(pool.clone(), backing),
        }
    }

    /// Creates a vector over contents already persisted in `backing`.
    ///
    /// The vector starts out evicted and loads its contents on first use.
    ///
    /// # Errors
    ///
    /// Fails if the length of the persisted contents cannot be determined.
    pub fn from_persisted(pool: &Pool<T, M>, backing: B) -> Result<Self> {
        Ok(Self {
            item: PoolItem::from_persisted(pool.clone(), backing)?,
        })
    }

    /// The pool the vector is charged to.
    #[must_use]
    pub fn pool(&self) -> &Pool<T, M> {
        self.item.pool()
    }

    /// Number of elements, whether in memory or evicted. Does not count as a use.
    #[must_use]
    pub fn len(&self) -> usize {
        self.item.lock().len()
    }

    /// Whether the vector has no elements. Does not count as a use.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of elements the buffer can hold without growing. Zero while evicted.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.item.lock().slot.capacity()
    }

    /// Makes room for at least `additional` more elements.
    ///
    /// # Errors
    ///
    /// Fails if the pool cannot make room or the vector cannot be restored.
    pub fn reserve(&self, additional: usize) -> Result<()> {
        let mut item = self.item.lock();
        item.touch()?;

        let required = item
            .len()
            .checked_add(additional)
            .expect("requested capacity exceeds size of virtual memory");
        item.ensure_capacity(required)
    }

    /// Appends an element, growing the buffer through the pool when full.
    ///
    /// # Errors
    ///
    /// Fails if the pool cannot make room or the vector cannot be restored. The element is
    /// dropped if it could not be added.
    pub fn push(&self, value: T) -> Result<()> {
        let mut item = self.item.lock();
        item.touch()?;

        let len = item.len();
        let required = len
            .checked_add(1)
            .expect("vector length cannot realistically overflow usize");
        item.ensure_capacity(required)?;

        item.slot.push_within_capacity(value);
        item.mark_dirty_or_undo(|slot| slot.truncate(len))
    }

    /// Appends clones of all elements of `values`.
    ///
    /// # Errors
    ///
    /// Fails if the pool cannot make room or the vector cannot be restored. Nothing is appended
    /// on failure; elements that were cloned before the failure are dropped.
    pub fn extend_from_slice(&self, values: &[T]) -> Result<()>
    where
        T: Clone,
    {
        let mut item = self.item.lock();
        item.touch()?;

        let len = item.len();
        let required = len
            .checked_add(values.len())
            .expect("requested capacity exceeds size of virtual memory");
        item.ensure_capacity(required)?;

        item.slot.refill(|buffer| buffer.extend_from_slice(values));
        item.mark_dirty_or_undo(|slot| slot.truncate(len))
    }

    /// A clone of the element at `index`, or `None` if out of bounds.
    ///
    /// # Errors
    ///
    /// Fails if the vector cannot be restored.
    pub fn get(&self, index: usize) -> Result<Option<T>>
    where
        T: Clone,
    {
        self.read(|contents| contents.get(index).cloned())
    }

    /// Calls `f` with the contents.
    ///
    /// The pool's critical section is held while `f` runs; other threads using the same pool
    /// wait for it.
    ///
    /// # Errors
    ///
    /// Fails if the vector cannot be restored.
    pub fn read<R>(&self, f: impl FnOnce(&[T]) -> R) -> Result<R> {
        let mut item = self.item.lock();
        item.touch()?;

        Ok(f(item.slot.as_slice()))
    }

    /// Calls `f` with the contents, mutably, and charges any change in footprint.
    ///
    /// # Errors
    ///
    /// Fails if the vector cannot be restored, or if the contents grew beyond what the pool can
    /// accommodate. In the latter case the changes are persisted and the vector is evicted;
    /// using it again fails until the pool's limit allows the grown contents.
    pub fn modify<R>(&self, f: impl FnOnce(&mut [T]) -> R) -> Result<R> {
        let mut item = self.item.lock();
        item.touch()?;

        let result = f(item.slot.as_mut_slice());
        item.mark_dirty()?;
        Ok(result)
    }

    /// Replaces the element at `index`, returning the previous one.
    ///
    /// # Errors
    ///
    /// Fails if the vector cannot be restored or the new element does not fit. A new element that
    /// does not fit is persisted and the vector evicted, as with [`modify()`][Self::modify].
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn set(&self, index: usize, value: T) -> Result<T> {
        self.modify(|contents| {
            let slot = contents
                .get_mut(index)
                .unwrap_or_else(|| panic!("index {index} out of bounds"));
            mem::replace(slot, value)
        })
    }

    /// Removes and returns the element at `index`, shifting later elements down.
    ///
    /// # Errors
    ///
    /// Fails if the vector cannot be restored.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn erase(&self, index: usize) -> Result<T> {
        let mut item = self.item.lock();
        item.touch()?;

        let removed = item.slot.remove(index);
        item.mark_dirty()?;
        Ok(removed)
    }

    /// Shortens the vector to `len` elements. The capacity is kept.
    ///
    /// # Errors
    ///
    /// Fails if the vector cannot be restored.
    pub fn truncate(&self, len: usize) -> Result<()> {
        let mut item = self.item.lock();
        item.touch()?;

        item.slot.truncate(len);
        item.mark_dirty()
    }

    /// Removes all elements. The capacity is kept.
    ///
    /// # Errors
    ///
    /// Fails if the vector cannot be restored.
    pub fn clear(&self) -> Result<()> {
        self.truncate(0)
    }

    /// Clones the contents into a regular vector.
    ///
    /// # Errors
    ///
    /// Fails if the vector cannot be restored.
    pub fn to_vec(&self) -> Result<Vec<T>>
    where
        T: Clone,
    {
        self.read(<[T]>::to_vec)
    }

    /// Pins the vector, restoring it first if evicted.
    ///
    /// While pinned, eviction keeps the buffer in memory. See [`PinGuard`].
    ///
    /// # Errors
    ///
    /// Fails if the vector cannot be restored.
    pub fn pin(&self) -> Result<PinGuard<T, B, M>> {
        PinGuard::new(Arc::clone(&self.item))
    }

    /// Evicts the vector voluntarily, persisting modified contents.
    ///
    /// Does nothing if the vector is already evicted or holds no buffer.
    ///
    /// # Errors
    ///
    /// Fails if the contents cannot be persisted; the vector is then left unchanged.
    pub fn discard(&self) -> Result<()> {
        self.item.lock().discard()
    }

    /// Restores an evicted vector without otherwise using it.
    ///
    /// # Errors
    ///
    /// Fails if the pool cannot make room or the backing cannot restore the contents.
    pub fn inflate(&self) -> Result<()> {
        self.item.lock().inflate()
    }

    /// Persists modified contents while keeping them in memory.
    ///
    /// # Errors
    ///
    /// Fails if the contents cannot be persisted.
    pub fn flush(&self) -> Result<()> {
        self.item.lock().flush()
    }

    /// Whether the contents are currently evicted.
    #[must_use]
    pub fn is_discarded(&self) -> bool {
        self.item.lock().is_discarded()
    }

    /// Whether the contents changed since they were last persisted.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.item.lock().is_dirty()
    }

    /// Whether a [`PinGuard`] for the vector exists.
    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.item.lock().is_pinned()
    }

    /// Whether the buffer is currently charged against the pool.
    #[must_use]
    pub fn is_admitted(&self) -> bool {
        self.item.lock().slot.is_admitted()
    }

    /// Calls `f` with the backing, for example to find out where contents were persisted.
    pub fn with_backing_ref<R>(&self, f: impl FnOnce(&B) -> R) -> R {
        f(&self.item.lock().backing)
    }
}

impl<T, S, M> PooledVec<T, StoredBacking<T, S>, M>
where
    T: Send + 'static,
    S: BlockStore<T> + ?Sized + 'static,
    M: Meter<T>,
{
    /// Creates a vector over an existing block of `store`, loaded on first use.
    ///
    /// # Errors
    ///
    /// Fails if the block does not exist or its length cannot be read.
    pub fn from_block(pool: &Pool<T, M>, store: Arc<S>, block: BlockId) -> Result<Self> {
        Self::from_persisted(pool, StoredBacking::from_block(store, block))
    }

    /// The block the contents were last persisted to.
    #[must_use]
    pub fn block_id(&self) -> Option<BlockId> {
        self.with_backing_ref(StoredBacking::block_id)
    }
}

impl<T, B, M> Clone for PooledVec<T, B, M>
where
    T: Send + 'static,
    B: Backing<T> + 'static,
    M: Meter<T>,
{
    fn clone(&self) -> Self {
        Self {
            item: Arc::clone(&self.item),
        }
    }
}

impl<T, B, M> fmt::Debug for PooledVec<T, B, M>
where
    T: Send + 'static,
    B: Backing<T> + 'static,
    M: Meter<T>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledVec")
            .field("item", &self.item)
            .finish()
    }
}
