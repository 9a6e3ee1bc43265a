use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use tracing::{trace, warn};

use crate::{
    Backing, CriticalSection, ElementCount, Meter, Pool, PoolError, PoolMember, PoolSlot, Result,
};

/// An item tracked by a pool, whose contents move into a [`Backing`] when the pool evicts it and
/// come back when it is next used.
///
/// The item holds its pool strongly; the pool only holds the item weakly.
pub(crate) struct PoolItem<T, B, M>
where
    T: Send + 'static,
    B: Backing<T> + 'static,
    M: Meter<T>,
{
    pool: Pool<T, M>,
    weak_self: Weak<Self>,
    state: Mutex<ItemState<T, B>>,
}

pub(crate) struct ItemState<T, B> {
    pub(crate) slot: PoolSlot<T>,
    pub(crate) backing: B,

    pins: usize,
    discarded: bool,

    // Modified since the contents were last persisted.
    dirty: bool,

    // Element count while discarded, when the slot holds nothing.
    discarded_len: usize,
}

impl<T, B, M> PoolItem<T, B, M>
where
    T: Send + 'static,
    B: Backing<T> + 'static,
    M: Meter<T>,
{
    /// Creates an item with no contents.
    pub(crate) fn new(pool: Pool<T, M>, backing: B) -> Arc<Self> {
        Self::with_state(pool, backing, false, 0)
    }

    /// Creates an item whose contents are already persisted in `backing`. It starts discarded.
    pub(crate) fn from_persisted(pool: Pool<T, M>, backing: B) -> Result<Arc<Self>> {
        let len = backing.persisted_len()?.unwrap_or(0);
        Ok(Self::with_state(pool, backing, true, len))
    }

    fn with_state(pool: Pool<T, M>, backing: B, discarded: bool, len: usize) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            pool,
            weak_self: Weak::clone(weak_self),
            state: Mutex::new(ItemState {
                slot: PoolSlot::new(),
                backing,
                pins: 0,
                discarded,
                dirty: false,
                discarded_len: len,
            }),
        })
    }

    pub(crate) fn pool(&self) -> &Pool<T, M> {
        &self.pool
    }

    /// Enters the pool's critical section and locks the item state.
    ///
    /// # Panics
    ///
    /// Panics if the current thread already holds the item state, which happens when an item is
    /// used from inside one of its own access closures.
    pub(crate) fn lock(&self) -> ItemGuard<'_, T, B, M> {
        let section = self.pool.critical_section();

        // Every holder of the state also holds the section, which we now own. A held state
        // therefore belongs to a caller further up this thread's stack.
        let state = self
            .state
            .try_lock()
            .expect("pooled vector accessed from inside one of its own closures");

        ItemGuard {
            state,
            _section: section,
            item: self,
        }
    }

    fn member(&self) -> Weak<dyn PoolMember> {
        let member: Weak<Self> = Weak::clone(&self.weak_self);
        member
    }
}

impl<T, B, M> PoolMember for PoolItem<T, B, M>
where
    T: Send + 'static,
    B: Backing<T> + 'static,
    M: Meter<T>,
{
    fn discard(&self) -> Result<()> {
        let _section = self.pool.critical_section();

        // A held state belongs to a caller further up this thread's stack, see `lock()`.
        let Some(mut state) = self.state.try_lock() else {
            return Err(PoolError::VictimInUse);
        };

        state.discard(&self.pool)
    }

    fn footprint(&self) -> Option<usize> {
        let _section = self.pool.critical_section();
        let mut state = self.state.try_lock()?;

        if state.slot.is_admitted() {
            Some(state.slot.footprint(self.pool.meter()))
        } else {
            Some(0)
        }
    }
}

impl<T, B, M> Drop for PoolItem<T, B, M>
where
    T: Send + 'static,
    B: Backing<T> + 'static,
    M: Meter<T>,
{
    fn drop(&mut self) {
        let _section = self.pool.critical_section();
        let slot = &mut self.state.get_mut().slot;

        if slot.is_admitted() {
            self.pool.free(slot);
        } else if slot.holds_removed_memory()
            && let Err(error) = self.pool.free_removed_item_memory(slot)
        {
            warn!(%error, "could not release memory of dropped pool item");
        }
    }
}

impl<T, B, M> fmt::Debug for PoolItem<T, B, M>
where
    T: Send + 'static,
    B: Backing<T> + 'static,
    M: Meter<T>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let _section = self.pool.critical_section();

        // We may be formatted from inside an operation on this same item.
        let Some(state) = self.state.try_lock() else {
            return f.debug_struct("PoolItem").finish_non_exhaustive();
        };

        f.debug_struct("PoolItem")
            .field("len", &state.len())
            .field("capacity", &state.slot.capacity())
            .field("admitted", &state.slot.is_admitted())
            .field("discarded", &state.is_discarded())
            .field("dirty", &state.is_dirty())
            .field("pins", &state.pins)
            .field("backing", &state.backing)
            .finish()
    }
}

impl<T, B: Backing<T>> ItemState<T, B> {
    pub(crate) fn len(&self) -> usize {
        if self.discarded {
            self.discarded_len
        } else {
            self.slot.len()
        }
    }

    pub(crate) fn is_discarded(&self) -> bool {
        self.discarded
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn is_pinned(&self) -> bool {
        self.pins > 0
    }

    /// Persists what is not yet persisted and gives up the admission.
    ///
    /// A pinned item keeps its memory as a removed item.
    fn discard<M: Meter<T>>(&mut self, pool: &Pool<T, M>) -> Result<()> {
        if self.discarded || !self.slot.is_admitted() {
            return Ok(());
        }

        self.persist()?;

        self.discarded_len = self.slot.len();
        self.release_admission(pool);
        self.discarded = true;

        trace!(
            len = self.discarded_len,
            pinned = self.is_pinned(),
            "discarded pool item"
        );

        Ok(())
    }

    /// Brings the contents of a discarded item back under the pool's management.
    fn inflate<M: Meter<T>>(
        &mut self,
        pool: &Pool<T, M>,
        member: Weak<dyn PoolMember>,
    ) -> Result<()> {
        if !self.discarded {
            return Ok(());
        }

        if self.slot.holds_removed_memory() {
            pool.readmit(&mut self.slot, member)?;
        } else {
            let len = self.backing.persisted_len()?.unwrap_or(0);

            if len > 0 {
                pool.allocate(&mut self.slot, member, len)?;

                let backing = &mut self.backing;
                let mut restored = Ok(0);
                self.slot.refill(|buffer| restored = backing.restore(buffer, len));

                if let Err(error) = restored {
                    pool.free(&mut self.slot);
                    return Err(error);
                }
            }
        }

        self.discarded = false;
        self.dirty = false;

        if let Err(error) = pool.remeasure(&mut self.slot) {
            // The restored contents do not fit after all. Put everything back as it was.
            self.persist()?;
            self.discarded_len = self.slot.len();
            self.release_admission(pool);
            self.discarded = true;
            return Err(error);
        }

        trace!(len = self.slot.len(), "inflated pool item");

        Ok(())
    }

    /// Persists the contents if the backing does not hold an up to date copy.
    fn persist(&mut self) -> Result<()> {
        if self.dirty || !self.backing.is_persisted() {
            self.backing.persist(self.slot.as_slice())?;
            self.dirty = false;
        }

        Ok(())
    }

    fn release_admission<M: Meter<T>>(&mut self, pool: &Pool<T, M>) {
        if self.is_pinned() {
            pool.remove_item(&mut self.slot);
        } else {
            pool.free(&mut self.slot);
        }
    }
}

/// Exclusive access to an item: the pool's critical section plus the item state lock.
pub(crate) struct ItemGuard<'a, T, B, M>
where
    T: Send + 'static,
    B: Backing<T> + 'static,
    M: Meter<T>,
{
    // Declared before the section so that the item is unlocked first.
    state: MutexGuard<'a, ItemState<T, B>>,
    _section: CriticalSection<'a>,
    item: &'a PoolItem<T, B, M>,
}

impl<T, B, M> ItemGuard<'_, T, B, M>
where
    T: Send + 'static,
    B: Backing<T> + 'static,
    M: Meter<T>,
{
    pub(crate) fn inflate(&mut self) -> Result<()> {
        self.state.inflate(&self.item.pool, self.item.member())
    }

    /// Inflates if needed and marks the item as most recently used.
    pub(crate) fn touch(&mut self) -> Result<()> {
        self.inflate()?;
        self.item.pool.notify_access(&self.state.slot);
        Ok(())
    }

    pub(crate) fn discard(&mut self) -> Result<()> {
        self.state.discard(&self.item.pool)
    }

    /// Persists modified contents while keeping them in memory.
    pub(crate) fn flush(&mut self) -> Result<()> {
        if self.state.discarded || !self.state.slot.is_admitted() {
            return Ok(());
        }

        self.state.persist()
    }

    /// Makes room for at least `required` elements.
    ///
    /// Grows to double the current capacity if the pool allows it, or to exactly `required`
    /// otherwise.
    pub(crate) fn ensure_capacity(&mut self, required: usize) -> Result<()> {
        if required <= self.state.slot.capacity() {
            return Ok(());
        }

        let doubled = self.state.slot.capacity().saturating_mul(2);
        if doubled > required {
            match self.grow_to(doubled) {
                Err(error) if error.is_exhaustion() => {
                    trace!(
                        doubled,
                        required, "doubled growth does not fit, growing exactly"
                    );
                }
                result => return result,
            }
        }

        self.grow_to(required)
    }

    fn grow_to(&mut self, capacity: usize) -> Result<()> {
        let slot = &mut self.state.slot;

        if slot.is_admitted() {
            self.item.pool.reallocate(slot, capacity)
        } else {
            self.item.pool.allocate(slot, self.item.member(), capacity)
        }
    }

    /// Records a modification of the contents and re-syncs the charge.
    ///
    /// If the pool cannot accommodate grown contents, the item is evicted with the modification
    /// persisted, which brings the pool back within its limit.
    pub(crate) fn mark_dirty(&mut self) -> Result<()> {
        self.state.dirty = true;

        let Err(error) = self.item.pool.remeasure(&mut self.state.slot) else {
            return Ok(());
        };

        self.shed_overgrowth();
        Err(error)
    }

    /// Like [`mark_dirty()`][Self::mark_dirty], but a modification that does not fit is first
    /// reverted through `undo`.
    pub(crate) fn mark_dirty_or_undo(&mut self, undo: impl FnOnce(&mut PoolSlot<T>)) -> Result<()> {
        let was_dirty = self.state.dirty;
        self.state.dirty = true;

        let Err(error) = self.item.pool.remeasure(&mut self.state.slot) else {
            return Ok(());
        };

        undo(&mut self.state.slot);
        self.state.dirty = was_dirty;

        // Shrinking back never needs room, unless the contents grew elsewhere in the meantime.
        if self.item.pool.remeasure(&mut self.state.slot).is_err() {
            self.state.dirty = true;
            self.shed_overgrowth();
        }

        Err(error)
    }

    fn shed_overgrowth(&mut self) {
        if let Err(error) = self.state.discard(&self.item.pool) {
            warn!(%error, "could not persist pool item that outgrew the pool");
        }
    }

    pub(crate) fn pin(&mut self) -> Result<()> {
        self.inflate()?;
        self.state.pins = self
            .state
            .pins
            .checked_add(1)
            .expect("pin count cannot realistically overflow usize");
        Ok(())
    }

    /// Drops one pin, releasing memory the pool took away while the item was pinned.
    pub(crate) fn unpin(&mut self) {
        self.state.pins = self.state.pins.saturating_sub(1);

        if self.state.pins == 0
            && self.state.discarded
            && self.state.slot.holds_removed_memory()
            && let Err(error) = self.item.pool.free_removed_item_memory(&mut self.state.slot)
        {
            warn!(%error, "could not release memory of unpinned pool item");
        }
    }
}

impl<T, B, M> Deref for ItemGuard<'_, T, B, M>
where
    T: Send + 'static,
    B: Backing<T> + 'static,
    M: Meter<T>,
{
    type Target = ItemState<T, B>;

    fn deref(&self) -> &Self::Target {
        &self.state
    }
}

impl<T, B, M> DerefMut for ItemGuard<'_, T, B, M>
where
    T: Send + 'static,
    B: Backing<T> + 'static,
    M: Meter<T>,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.state
    }
}

/// Keeps a pooled item's memory in place while it exists.
///
/// The pool may still evict a pinned item when it needs room, but the item then keeps its buffer
/// instead of releasing it, so using the item again needs no restore. The buffer is released when
/// the last pin goes away, if the item is still discarded by then.
///
/// Obtained via [`PooledVec::pin()`][crate::PooledVec::pin].
#[must_use]
pub struct PinGuard<T, B, M = ElementCount>
where
    T: Send + 'static,
    B: Backing<T> + 'static,
    M: Meter<T>,
{
    item: Arc<PoolItem<T, B, M>>,
}

impl<T, B, M> PinGuard<T, B, M>
where
    T: Send + 'static,
    B: Backing<T> + 'static,
    M: Meter<T>,
{
    pub(crate) fn new(item: Arc<PoolItem<T, B, M>>) -> Result<Self> {
        item.lock().pin()?;
        Ok(Self { item })
    }
}

impl<T, B, M> Drop for PinGuard<T, B, M>
where
    T: Send + 'static,
    B: Backing<T> + 'static,
    M: Meter<T>,
{
    fn drop(&mut self) {
        self.item.lock().unpin();
    }
}

impl<T, B, M> fmt::Debug for PinGuard<T, B, M>
where
    T: Send + 'static,
    B: Backing<T> + 'static,
    M: Meter<T>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinGuard")
            .field("item", &self.item)
            .finish()
    }
}
