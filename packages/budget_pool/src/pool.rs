use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::num::NonZero;
use std::sync::{Arc, Weak};

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use tracing::{debug, trace, warn};

use crate::{
    DeepFootprint, DeepSized, ElementCount, Meter, PoolAllocator, PoolBuilder, PoolError,
    PoolMember, PoolSlot, PoolStats, PositionToken, RecencyList, Result,
};

/// A pool whose limit counts elements: every item is charged its granted capacity.
pub type CountLimitedPool<T> = Pool<T, ElementCount>;

/// A pool whose limit counts bytes of deep footprint: every item is charged the inline size of
/// its buffer plus the heap memory owned by its elements.
pub type IndirectCountLimitedPool<T> = Pool<T, DeepFootprint>;

/// A memory budget shared by many variable-size items, evicting the least recently used items
/// when an allocation would exceed the limit.
///
/// The pool does not own its items. It tracks the admitted ones in a recency list through weak
/// references and charges each one against the limit. When an allocation needs room, the pool
/// asks the least recently used item to [discard itself][PoolMember::discard]; the item persists
/// what it needs and releases its admission by calling back into [`free()`][Self::free] or
/// [`remove_item()`][Self::remove_item].
///
/// `Pool` is a cheap handle; clones refer to the same budget.
///
/// # Critical section
///
/// Every operation runs inside the pool's reentrant critical section. Eviction calls into items
/// which call back into the pool on the same thread, which simply re-enters. Items that perform
/// several pool operations in sequence (for example, discard then free) hold
/// [`critical_section()`][Self::critical_section] for the whole sequence so that other threads
/// observe it atomically.
///
/// # Examples
///
/// ```
/// use std::num::NonZero;
///
/// use budget_pool::{CompressedPooledVec, CountLimitedPool};
///
/// let pool = CountLimitedPool::<u32>::builder()
///     .limit(NonZero::new(100).unwrap())
///     .build();
///
/// let first = CompressedPooledVec::new(&pool);
/// first.extend_from_slice(&[1; 60]).unwrap();
///
/// // This does not fit next to the first vector, which gets compressed to make room.
/// let second = CompressedPooledVec::new(&pool);
/// second.extend_from_slice(&[2; 60]).unwrap();
///
/// assert!(first.is_discarded());
/// assert_eq!(pool.used(), 60);
///
/// // Touching the first vector brings it back, evicting the second one.
/// assert_eq!(first.get(59).unwrap(), Some(1));
/// assert!(second.is_discarded());
/// ```
pub struct Pool<T, M = ElementCount> {
    core: Arc<PoolCore<T, M>>,
}

struct PoolCore<T, M> {
    meter: M,
    allocator: Arc<dyn PoolAllocator<T>>,
    state: ReentrantMutex<RefCell<PoolState>>,
}

#[derive(Debug)]
struct PoolState {
    limit: NonZero<usize>,

    /// Sum of the charges of all entries in `recency`.
    used: usize,

    recency: RecencyList<Entry>,
    stats: PoolStats,
}

struct Entry {
    member: Weak<dyn PoolMember>,

    /// What the member was charged when admitted or last re-measured. Frees subtract exactly
    /// this, so `used` stays consistent even if the member's real footprint drifted.
    charge: usize,
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("charge", &self.charge)
            .finish_non_exhaustive()
    }
}

/// Proof that the current thread holds a pool's critical section.
///
/// Obtained via [`Pool::critical_section()`]. The section is released when this is dropped.
#[must_use]
pub struct CriticalSection<'a> {
    _guard: ReentrantMutexGuard<'a, RefCell<PoolState>>,
}

impl fmt::Debug for CriticalSection<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CriticalSection").finish_non_exhaustive()
    }
}

impl<T> Pool<T, ElementCount> {
    /// Creates a builder for configuring and constructing a count-limited pool.
    ///
    /// # Example
    ///
    /// ```
    /// use std::num::NonZero;
    ///
    /// use budget_pool::CountLimitedPool;
    ///
    /// let pool = CountLimitedPool::<u64>::builder()
    ///     .limit(NonZero::new(10_000).unwrap())
    ///     .build();
    ///
    /// assert_eq!(pool.used(), 0);
    /// ```
    pub fn builder() -> PoolBuilder<T, ElementCount> {
        PoolBuilder::new(ElementCount)
    }
}

impl<T: DeepSized> Pool<T, DeepFootprint> {
    /// Creates a builder for configuring and constructing an indirect pool, which charges items
    /// their deep footprint in bytes.
    ///
    /// # Example
    ///
    /// ```
    /// use std::num::NonZero;
    ///
    /// use budget_pool::IndirectCountLimitedPool;
    ///
    /// let pool = IndirectCountLimitedPool::<String>::builder()
    ///     .limit(NonZero::new(1 << 20).unwrap())
    ///     .build();
    ///
    /// assert_eq!(pool.limit(), 1 << 20);
    /// ```
    pub fn builder() -> PoolBuilder<T, DeepFootprint> {
        PoolBuilder::new(DeepFootprint)
    }
}

impl<T, M: Meter<T>> Pool<T, M> {
    #[must_use]
    pub(crate) fn new_inner(
        limit: NonZero<usize>,
        allocator: Arc<dyn PoolAllocator<T>>,
        meter: M,
    ) -> Self {
        Self {
            core: Arc::new(PoolCore {
                meter,
                allocator,
                state: ReentrantMutex::new(RefCell::new(PoolState {
                    limit,
                    used: 0,
                    recency: RecencyList::new(),
                    stats: PoolStats::default(),
                })),
            }),
        }
    }

    /// Enters the pool's critical section, blocking while another thread holds it.
    ///
    /// The section is reentrant: the holding thread may call any pool operation, and items may
    /// call back into the pool during eviction.
    pub fn critical_section(&self) -> CriticalSection<'_> {
        CriticalSection {
            _guard: self.core.state.lock(),
        }
    }

    /// The maximum aggregate charge of all admitted items.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.core.state.lock().borrow().limit.get()
    }

    /// The aggregate charge of all admitted items.
    #[must_use]
    pub fn used(&self) -> usize {
        self.core.state.lock().borrow().used
    }

    /// Number of admitted items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.core.state.lock().borrow().recency.len()
    }

    /// Whether no item is admitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.core.state.lock().borrow().recency.is_empty()
    }

    /// A snapshot of the activity counters of this pool.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.core.state.lock().borrow().stats
    }

    /// The meter that decides what items are charged.
    #[must_use]
    pub fn meter(&self) -> &M {
        &self.core.meter
    }

    /// Positions of the admitted items, most recently used first.
    #[must_use]
    pub fn recency_snapshot(&self) -> Vec<PositionToken> {
        self.core
            .state
            .lock()
            .borrow()
            .recency
            .iter()
            .map(|(token, _)| token)
            .collect()
    }

    /// The most recently used admitted item.
    #[must_use]
    pub fn most_recent(&self) -> Option<PositionToken> {
        self.core
            .state
            .lock()
            .borrow()
            .recency
            .front()
            .map(|(token, _)| token)
    }

    /// The least recently used admitted item, which is the next eviction victim.
    #[must_use]
    pub fn least_recent(&self) -> Option<PositionToken> {
        self.core
            .state
            .lock()
            .borrow()
            .recency
            .back()
            .map(|(token, _)| token)
    }

    /// The charge currently recorded for an admitted item.
    #[must_use]
    pub fn charge_of(&self, position: PositionToken) -> Option<usize> {
        self.core
            .state
            .lock()
            .borrow()
            .recency
            .get(position)
            .map(|entry| entry.charge)
    }

    /// Whether two handles refer to the same pool.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    /// Changes the limit, evicting least recently used items until the pool fits.
    ///
    /// # Errors
    ///
    /// Fails if the pool runs out of victims or a victim fails to discard. The previous limit is
    /// then restored; it still bounds the used total because eviction only ever lowers it.
    pub fn change_limit(&self, new_limit: NonZero<usize>) -> Result<()> {
        let section = self.core.state.lock();

        let previous = mem::replace(&mut section.borrow_mut().limit, new_limit);

        debug!(
            previous = previous.get(),
            limit = new_limit.get(),
            used = section.borrow().used,
            "changing pool limit"
        );

        if let Err(error) = self.make_room(&section, 0, 0, None) {
            warn!(%error, limit = new_limit.get(), "could not shrink pool to new limit");
            section.borrow_mut().limit = previous;
            return Err(error);
        }

        Ok(())
    }

    /// Admits a detached slot, giving it a buffer for at least `requested` elements.
    ///
    /// Evicts least recently used items until the charge fits. The slot is charged for what the
    /// allocator actually granted, which may exceed the request.
    ///
    /// # Errors
    ///
    /// Fails without changing the slot if the slot is not detached, if the pool cannot make
    /// enough room or if the allocator fails. Items evicted before a failure stay evicted.
    pub fn allocate(
        &self,
        slot: &mut PoolSlot<T>,
        member: Weak<dyn PoolMember>,
        requested: usize,
    ) -> Result<()> {
        let section = self.core.state.lock();

        if slot.is_admitted() {
            return Err(PoolError::AlreadyAdmitted);
        }

        if slot.holds_removed_memory() {
            return Err(PoolError::HoldsRemovedMemory);
        }

        let charge = self.core.meter.measure(&[], requested);
        self.make_room(&section, charge, 0, None)?;

        let (buffer, granted) = self
            .core
            .allocator
            .allocate(requested)
            .ok_or(PoolError::AllocatorFailed { requested })?
            .into_parts();

        let actual = self.core.meter.measure(&[], granted);

        if actual > charge
            && let Err(error) = self.make_room(&section, actual, 0, None)
        {
            self.core.allocator.free(buffer, granted);
            return Err(error);
        }

        let (token, used) = {
            let mut state = section.borrow_mut();
            state.used = state.used.saturating_add(actual);
            state.stats.admissions = state.stats.admissions.wrapping_add(1);

            let token = state.recency.push_front(Entry {
                member,
                charge: actual,
            });

            (token, state.used)
        };

        slot.buffer = buffer;
        slot.capacity = granted;
        slot.token = Some(token);
        slot.invalidate_footprint();

        trace!(requested, granted, charge = actual, used, "admitted pool item");

        Ok(())
    }

    /// Replaces the buffer of an admitted slot with one for at least `new_size` elements.
    ///
    /// The slot becomes the most recently used item before any eviction happens, so it is never
    /// chosen to make room for itself. Up to `new_size` existing elements are moved into the new
    /// buffer before the old buffer is released.
    ///
    /// # Errors
    ///
    /// Fails without changing the slot if it is not admitted, if the pool cannot make enough
    /// room or if the allocator fails.
    pub fn reallocate(&self, slot: &mut PoolSlot<T>, new_size: usize) -> Result<()> {
        let section = self.core.state.lock();

        let token = slot.token.ok_or(PoolError::NotAdmitted)?;

        let outgoing = {
            let mut state = section.borrow_mut();
            if !state.recency.move_to_front(token) {
                return Err(PoolError::NotAdmitted);
            }

            state
                .recency
                .get(token)
                .map(|entry| entry.charge)
                .ok_or(PoolError::NotAdmitted)?
        };

        let keep = new_size.min(slot.buffer.len());
        let kept = slot.buffer.get(..keep).unwrap_or_default();

        let incoming = self.core.meter.measure(kept, new_size);
        self.make_room(&section, incoming, outgoing, Some(token))?;

        let (mut buffer, granted) = self
            .core
            .allocator
            .allocate(new_size)
            .ok_or(PoolError::AllocatorFailed {
                requested: new_size,
            })?
            .into_parts();

        let kept = slot.buffer.get(..keep).unwrap_or_default();
        let actual = self.core.meter.measure(kept, granted);

        if actual > incoming
            && let Err(error) = self.make_room(&section, actual, outgoing, Some(token))
        {
            self.core.allocator.free(buffer, granted);
            return Err(error);
        }

        // Move the survivors over before the old buffer goes back to the allocator.
        let mut old = mem::take(&mut slot.buffer);
        old.truncate(keep);
        buffer.append(&mut old);
        self.core.allocator.free(old, slot.capacity);

        slot.buffer = buffer;
        slot.capacity = granted;
        slot.invalidate_footprint();

        let used = {
            let mut state = section.borrow_mut();
            if let Some(entry) = state.recency.get_mut(token) {
                entry.charge = actual;
            }
            state.used = state.used.saturating_sub(outgoing).saturating_add(actual);
            state.stats.reallocations = state.stats.reallocations.wrapping_add(1);
            state.used
        };

        trace!(new_size, granted, charge = actual, used, "reallocated pool item");

        Ok(())
    }

    /// Releases the buffer of an admitted slot and stops tracking it.
    ///
    /// Does nothing for a slot that is not admitted.
    pub fn free(&self, slot: &mut PoolSlot<T>) {
        let section = self.core.state.lock();

        let Some(token) = slot.token.take() else {
            return;
        };

        {
            let mut state = section.borrow_mut();

            // A stale token means the pool already reclaimed the entry while the item was being
            // dropped. Only the memory is left to release.
            if let Some(entry) = state.recency.remove(token) {
                state.used = state.used.saturating_sub(entry.charge);
                state.stats.frees = state.stats.frees.wrapping_add(1);
            }

            trace!(used = state.used, "freed pool item");
        }

        self.release(slot);
    }

    /// Stops tracking an admitted slot without releasing its buffer.
    ///
    /// The slot keeps its memory but is no longer charged or considered for eviction. The memory
    /// must later be released through [`free_removed_item_memory()`][Self::free_removed_item_memory].
    /// Does nothing for a slot that is not admitted.
    pub fn remove_item(&self, slot: &mut PoolSlot<T>) {
        let section = self.core.state.lock();

        let Some(token) = slot.token.take() else {
            return;
        };

        let mut state = section.borrow_mut();
        if let Some(entry) = state.recency.remove(token) {
            state.used = state.used.saturating_sub(entry.charge);
            state.stats.removals = state.stats.removals.wrapping_add(1);
        }

        trace!(used = state.used, "removed pool item, memory retained");
    }

    /// Releases the memory of a slot previously removed via [`remove_item()`][Self::remove_item].
    ///
    /// Does nothing for a detached slot.
    ///
    /// # Errors
    ///
    /// Fails if the slot is still admitted; use [`free()`][Self::free] for admitted slots.
    pub fn free_removed_item_memory(&self, slot: &mut PoolSlot<T>) -> Result<()> {
        if slot.is_admitted() {
            return Err(PoolError::StillAdmitted);
        }

        if slot.holds_removed_memory() {
            let _section = self.core.state.lock();
            self.release(slot);
        }

        Ok(())
    }

    /// Puts a removed slot back under the pool's management without reloading its contents.
    ///
    /// The slot is charged its current footprint and becomes the most recently used item.
    ///
    /// # Errors
    ///
    /// Fails without changing the slot if it is admitted or the pool cannot make enough room.
    pub fn readmit(&self, slot: &mut PoolSlot<T>, member: Weak<dyn PoolMember>) -> Result<()> {
        let section = self.core.state.lock();

        if slot.is_admitted() {
            return Err(PoolError::AlreadyAdmitted);
        }

        let charge = slot.footprint(&self.core.meter);
        self.make_room(&section, charge, 0, None)?;

        let mut state = section.borrow_mut();
        state.used = state.used.saturating_add(charge);
        state.stats.admissions = state.stats.admissions.wrapping_add(1);
        slot.token = Some(state.recency.push_front(Entry { member, charge }));

        trace!(charge, used = state.used, "readmitted pool item");

        Ok(())
    }

    /// Marks an admitted slot as the most recently used item.
    ///
    /// Does nothing for a slot that is not admitted.
    pub fn notify_access(&self, slot: &PoolSlot<T>) {
        let Some(token) = slot.token else {
            return;
        };

        let section = self.core.state.lock();
        section.borrow_mut().recency.move_to_front(token);
    }

    /// Brings the charge of an admitted slot in line with its current footprint.
    ///
    /// Only meaningful for meters that track contents; a no-op otherwise. Growth evicts other
    /// items, least recently used first.
    ///
    /// # Errors
    ///
    /// Fails if the growth cannot be accommodated. The slot is still charged its true footprint,
    /// so the caller has to shrink the contents back or release the slot to return the pool to
    /// its limit.
    pub fn remeasure(&self, slot: &mut PoolSlot<T>) -> Result<()> {
        if !M::TRACKS_CONTENTS {
            return Ok(());
        }

        let Some(token) = slot.token else {
            return Ok(());
        };

        let section = self.core.state.lock();

        let outgoing = {
            let mut state = section.borrow_mut();
            if !state.recency.move_to_front(token) {
                return Ok(());
            }

            state.recency.get(token).map_or(0, |entry| entry.charge)
        };

        let incoming = slot.footprint(&self.core.meter);
        if incoming == outgoing {
            return Ok(());
        }

        let result = if incoming > outgoing {
            self.make_room(&section, incoming, outgoing, Some(token))
        } else {
            Ok(())
        };

        let mut state = section.borrow_mut();
        if let Some(entry) = state.recency.get_mut(token) {
            entry.charge = incoming;
        }
        state.used = state.used.saturating_sub(outgoing).saturating_add(incoming);

        trace!(
            previous = outgoing,
            charge = incoming,
            used = state.used,
            "remeasured pool item"
        );

        result
    }

    /// Asks every admitted item for its current footprint and rebuilds the used total from the
    /// answers, then evicts if the pool turns out to be over its limit.
    ///
    /// This is a full O(n) rescan, meant to restore consistency after bulk changes to item
    /// contents that bypassed [`remeasure()`][Self::remeasure]. Items whose state the current
    /// thread is holding, for example from inside an access closure, keep their recorded charge.
    ///
    /// # Errors
    ///
    /// Fails if the pool is over its limit after the rescan and eviction cannot fix that.
    pub fn recompute_total_count(&self) -> Result<()> {
        let section = self.core.state.lock();

        let members: Vec<_> = section
            .borrow()
            .recency
            .iter()
            .map(|(token, entry)| (token, Weak::clone(&entry.member)))
            .collect();

        for (token, member) in members {
            // Members in use by this thread keep the charge they have.
            let Some(charge) = member.upgrade().and_then(|member| member.footprint()) else {
                continue;
            };

            if let Some(entry) = section.borrow_mut().recency.get_mut(token) {
                entry.charge = charge;
            }
        }

        {
            let mut state = section.borrow_mut();
            let total = state
                .recency
                .iter()
                .map(|(_, entry)| entry.charge)
                .fold(0_usize, usize::saturating_add);

            debug!(previous = state.used, used = total, "recomputed pool total");
            state.used = total;
        }

        self.make_room(&section, 0, 0, None)
    }

    /// Evicts least recently used items until `used - outgoing + incoming <= limit`.
    ///
    /// `spare` is never evicted; it must be at the front of the recency list.
    fn make_room(
        &self,
        section: &RefCell<PoolState>,
        incoming: usize,
        outgoing: usize,
        spare: Option<PositionToken>,
    ) -> Result<()> {
        {
            let state = section.borrow();
            if incoming > state.limit.get() {
                return Err(PoolError::Exhausted {
                    needed: incoming,
                    limit: state.limit.get(),
                });
            }
        }

        loop {
            let (token, victim) = {
                let state = section.borrow();
                let projected = state
                    .used
                    .saturating_sub(outgoing)
                    .saturating_add(incoming);

                if projected <= state.limit.get() {
                    return Ok(());
                }

                match state.recency.back() {
                    Some((token, entry)) if Some(token) != spare => {
                        (token, Weak::clone(&entry.member))
                    }
                    _ => {
                        return Err(PoolError::Exhausted {
                            needed: projected,
                            limit: state.limit.get(),
                        });
                    }
                }
            };

            self.evict(section, token, &victim)?;
        }
    }

    fn evict(
        &self,
        section: &RefCell<PoolState>,
        token: PositionToken,
        victim: &Weak<dyn PoolMember>,
    ) -> Result<()> {
        let Some(victim) = victim.upgrade() else {
            // The item is being dropped and waits for the critical section. Take its charge back
            // now; when it gets to free itself it will find its token stale.
            let mut state = section.borrow_mut();
            if let Some(entry) = state.recency.remove(token) {
                state.used = state.used.saturating_sub(entry.charge);
                state.stats.reclaimed = state.stats.reclaimed.wrapping_add(1);
                debug!(charge = entry.charge, "reclaimed entry of dropped pool item");
            }
            return Ok(());
        };

        debug!(used = section.borrow().used, "evicting least recently used pool item");

        let outcome = victim.discard();

        // Dropping the victim may run its destructor, which needs the state.
        drop(victim);

        let mut state = section.borrow_mut();

        if let Err(error) = outcome {
            warn!(%error, "eviction victim failed to discard");
            state.stats.failed_evictions = state.stats.failed_evictions.wrapping_add(1);
            return Err(PoolError::EvictionFailed {
                source: Box::new(error),
            });
        }

        if state.recency.contains(token) {
            warn!("eviction victim reported success but is still admitted");
            state.stats.failed_evictions = state.stats.failed_evictions.wrapping_add(1);
            return Err(PoolError::VictimRefused);
        }

        state.stats.evictions = state.stats.evictions.wrapping_add(1);
        Ok(())
    }

    fn release(&self, slot: &mut PoolSlot<T>) {
        let buffer = mem::take(&mut slot.buffer);
        let granted = mem::take(&mut slot.capacity);
        slot.invalidate_footprint();

        self.core.allocator.free(buffer, granted);
    }

    #[cfg(test)]
    pub(crate) fn integrity_check(&self) {
        let section = self.core.state.lock();
        let state = section.borrow();

        state.recency.integrity_check();

        let total = state
            .recency
            .iter()
            .map(|(_, entry)| entry.charge)
            .sum::<usize>();
        assert_eq!(total, state.used, "used total disagrees with entry charges");
        assert!(
            state.used <= state.limit.get(),
            "used total {} exceeds limit {}",
            state.used,
            state.limit
        );
    }
}

impl<T, M> Clone for Pool<T, M> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T, M: fmt::Debug> fmt::Debug for Pool<T, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let section = self.core.state.lock();

        // The state may already be borrowed if we are formatted from inside an operation.
        match section.try_borrow() {
            Ok(state) => f
                .debug_struct("Pool")
                .field("limit", &state.limit)
                .field("used", &state.used)
                .field("len", &state.recency.len())
                .field("meter", &self.core.meter)
                .finish_non_exhaustive(),
            Err(_) => f
                .debug_struct("Pool")
                .field("meter", &self.core.meter)
                .finish_non_exhaustive(),
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::indexing_slicing,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use parking_lot::Mutex;
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::{RoundingAllocator, TrackingAllocator};

    assert_impl_all!(CountLimitedPool<u32>: Send, Sync, Clone, fmt::Debug);
    assert_impl_all!(IndirectCountLimitedPool<String>: Send, Sync, Clone, fmt::Debug);

    /// A minimal member that drops its contents when discarded, or refuses when told to.
    struct TestItem {
        pool: CountLimitedPool<u32>,
        slot: Mutex<PoolSlot<u32>>,
        refuse: AtomicBool,
        pinned: AtomicBool,
        discards: Mutex<u32>,
    }

    impl TestItem {
        fn new(pool: &CountLimitedPool<u32>) -> Arc<Self> {
            Arc::new(Self {
                pool: pool.clone(),
                slot: Mutex::new(PoolSlot::new()),
                refuse: AtomicBool::new(false),
                pinned: AtomicBool::new(false),
                discards: Mutex::new(0),
            })
        }

        fn allocate(self: &Arc<Self>, size: usize) -> Result<()> {
            let weak: Weak<dyn PoolMember> = Arc::downgrade(self) as Weak<dyn PoolMember>;
            let _section = self.pool.critical_section();
            self.pool.allocate(&mut self.slot.lock(), weak, size)
        }

        fn reallocate(&self, size: usize) -> Result<()> {
            let _section = self.pool.critical_section();
            self.pool.reallocate(&mut self.slot.lock(), size)
        }

        fn touch(&self) {
            // Item state is only ever locked inside the critical section.
            let _section = self.pool.critical_section();
            self.pool.notify_access(&self.slot.lock());
        }

        fn position(&self) -> PositionToken {
            self.slot.lock().position().expect("item is admitted")
        }

        fn is_admitted(&self) -> bool {
            self.slot.lock().is_admitted()
        }

        fn discards(&self) -> u32 {
            *self.discards.lock()
        }
    }

    impl PoolMember for TestItem {
        fn discard(&self) -> Result<()> {
            if self.refuse.load(Ordering::Relaxed) {
                return Err(PoolError::Exhausted { needed: 0, limit: 0 });
            }

            *self.discards.lock() += 1;

            let _section = self.pool.critical_section();
            let mut slot = self.slot.lock();
            if self.pinned.load(Ordering::Relaxed) {
                self.pool.remove_item(&mut slot);
            } else {
                self.pool.free(&mut slot);
            }
            Ok(())
        }

        fn footprint(&self) -> Option<usize> {
            Some(self.slot.lock().footprint(self.pool.meter()))
        }
    }

    impl Drop for TestItem {
        fn drop(&mut self) {
            let _section = self.pool.critical_section();
            let slot = self.slot.get_mut();
            self.pool.free(slot);
            self.pool
                .free_removed_item_memory(slot)
                .expect("slot is no longer admitted");
        }
    }

    fn pool_with_limit(limit: usize) -> CountLimitedPool<u32> {
        CountLimitedPool::builder()
            .limit(NonZero::new(limit).unwrap())
            .build()
    }

    #[test]
    fn allocate_admits_and_charges() {
        let pool = pool_with_limit(100);
        let item = TestItem::new(&pool);

        item.allocate(40).unwrap();

        assert!(item.is_admitted());
        assert_eq!(pool.used(), 40);
        assert_eq!(pool.len(), 1);
        assert_eq!(item.slot.lock().capacity(), 40);
        assert_eq!(pool.most_recent(), Some(item.position()));
        pool.integrity_check();
    }

    #[test]
    fn allocating_twice_is_rejected() {
        let pool = pool_with_limit(100);
        let item = TestItem::new(&pool);

        item.allocate(10).unwrap();
        assert!(matches!(item.allocate(10), Err(PoolError::AlreadyAdmitted)));
        assert_eq!(pool.used(), 10);
    }

    #[test]
    fn allocation_evicts_least_recently_used() {
        // limit=100, A=60 admitted, B=60 forces A out, leaving only B.
        let pool = pool_with_limit(100);
        let a = TestItem::new(&pool);
        let b = TestItem::new(&pool);

        a.allocate(60).unwrap();
        assert_eq!(pool.used(), 60);

        b.allocate(60).unwrap();

        assert!(!a.is_admitted());
        assert!(b.is_admitted());
        assert_eq!(a.discards(), 1);
        assert_eq!(pool.used(), 60);
        assert_eq!(pool.stats().evictions(), 1);
        pool.integrity_check();
    }

    #[test]
    fn eviction_follows_access_order() {
        let pool = pool_with_limit(30);
        let a = TestItem::new(&pool);
        let b = TestItem::new(&pool);
        let c = TestItem::new(&pool);
        let d = TestItem::new(&pool);

        a.allocate(10).unwrap();
        b.allocate(10).unwrap();
        c.allocate(10).unwrap();

        // A becomes most recent, so B is now the oldest.
        a.touch();
        assert_eq!(pool.most_recent(), Some(a.position()));
        assert_eq!(pool.least_recent(), Some(b.position()));

        d.allocate(10).unwrap();

        assert!(a.is_admitted());
        assert!(!b.is_admitted());
        assert!(c.is_admitted());
        assert!(d.is_admitted());
        assert_eq!(
            pool.recency_snapshot(),
            vec![d.position(), a.position(), c.position()]
        );
        pool.integrity_check();
    }

    #[test]
    fn charge_larger_than_limit_fails_without_evicting() {
        let pool = pool_with_limit(50);
        let a = TestItem::new(&pool);
        let b = TestItem::new(&pool);

        a.allocate(20).unwrap();

        let result = b.allocate(51);
        assert!(matches!(result, Err(PoolError::Exhausted { needed: 51, limit: 50 })));
        assert!(a.is_admitted());
        assert!(!b.is_admitted());
        assert_eq!(pool.used(), 20);
        pool.integrity_check();
    }

    #[test]
    fn refused_discard_fails_allocation() {
        let pool = pool_with_limit(100);
        let a = TestItem::new(&pool);
        let b = TestItem::new(&pool);

        a.allocate(60).unwrap();
        a.refuse.store(true, Ordering::Relaxed);

        let result = b.allocate(60);
        assert!(matches!(result, Err(PoolError::EvictionFailed { .. })));
        assert!(a.is_admitted());
        assert!(!b.is_admitted());
        assert_eq!(pool.used(), 60);
        assert_eq!(pool.stats().failed_evictions(), 1);
        pool.integrity_check();
    }

    #[test]
    fn reallocate_never_evicts_itself() {
        let pool = pool_with_limit(100);
        let a = TestItem::new(&pool);
        let b = TestItem::new(&pool);

        a.allocate(30).unwrap();
        b.allocate(30).unwrap();

        // A is the oldest, but growing it must evict B instead.
        a.reallocate(90).unwrap();

        assert!(a.is_admitted());
        assert!(!b.is_admitted());
        assert_eq!(a.slot.lock().capacity(), 90);
        assert_eq!(pool.used(), 90);
        pool.integrity_check();
    }

    #[test]
    fn reallocate_alone_beyond_limit_fails() {
        let pool = pool_with_limit(100);
        let a = TestItem::new(&pool);

        a.allocate(30).unwrap();

        assert!(matches!(a.reallocate(101), Err(PoolError::Exhausted { .. })));
        assert_eq!(a.slot.lock().capacity(), 30);
        assert_eq!(pool.used(), 30);
    }

    #[test]
    fn reallocate_preserves_elements() {
        let pool = pool_with_limit(100);
        let a = TestItem::new(&pool);

        a.allocate(4).unwrap();
        {
            let mut slot = a.slot.lock();
            for value in 1..=4 {
                slot.push_within_capacity(value);
            }
        }

        a.reallocate(8).unwrap();
        assert_eq!(a.slot.lock().as_slice(), &[1, 2, 3, 4]);

        a.reallocate(2).unwrap();
        assert_eq!(a.slot.lock().as_slice(), &[1, 2]);
        assert_eq!(pool.used(), 2);
        assert_eq!(pool.stats().reallocations(), 2);
    }

    #[test]
    fn reallocate_detached_is_rejected() {
        let pool = pool_with_limit(10);
        let a = TestItem::new(&pool);

        assert!(matches!(a.reallocate(5), Err(PoolError::NotAdmitted)));
    }

    #[test]
    fn free_is_idempotent() {
        let pool = pool_with_limit(100);
        let a = TestItem::new(&pool);
        a.allocate(25).unwrap();

        pool.free(&mut a.slot.lock());
        pool.free(&mut a.slot.lock());

        assert!(!a.is_admitted());
        assert_eq!(pool.used(), 0);
        assert!(pool.is_empty());
        assert_eq!(pool.stats().frees(), 1);
        pool.integrity_check();
    }

    #[test]
    fn remove_item_keeps_memory_until_released() {
        let allocator = Arc::new(TrackingAllocator::new(crate::HeapAllocator));
        let pool = CountLimitedPool::<u32>::builder()
            .limit(NonZero::new(100).unwrap())
            .allocator(Arc::clone(&allocator))
            .build();
        let a = TestItem::new(&pool);

        a.allocate(25).unwrap();
        a.slot.lock().push_within_capacity(7);

        pool.remove_item(&mut a.slot.lock());
        assert_eq!(pool.used(), 0);
        assert!(a.slot.lock().holds_removed_memory());
        assert_eq!(a.slot.lock().as_slice(), &[7]);
        assert_eq!(allocator.live_elements(), 25);

        pool.free_removed_item_memory(&mut a.slot.lock()).unwrap();
        assert!(!a.slot.lock().holds_removed_memory());
        assert_eq!(allocator.live_elements(), 0);
    }

    #[test]
    fn free_removed_memory_of_admitted_item_is_rejected() {
        let pool = pool_with_limit(100);
        let a = TestItem::new(&pool);
        a.allocate(5).unwrap();

        assert!(matches!(
            pool.free_removed_item_memory(&mut a.slot.lock()),
            Err(PoolError::StillAdmitted)
        ));
        assert_eq!(pool.used(), 5);
    }

    #[test]
    fn pinned_victim_is_removed_not_freed() {
        let pool = pool_with_limit(100);
        let a = TestItem::new(&pool);
        let b = TestItem::new(&pool);

        a.allocate(60).unwrap();
        a.pinned.store(true, Ordering::Relaxed);

        b.allocate(60).unwrap();

        assert!(!a.is_admitted());
        assert!(a.slot.lock().holds_removed_memory());
        assert_eq!(pool.stats().removals(), 1);
        assert_eq!(pool.used(), 60);

        // Readmitting needs room again, so B goes.
        let weak: Weak<dyn PoolMember> = Arc::downgrade(&a) as Weak<dyn PoolMember>;
        pool.readmit(&mut a.slot.lock(), weak).unwrap();
        assert!(a.is_admitted());
        assert!(!b.is_admitted());
        assert_eq!(pool.used(), 60);
        pool.integrity_check();
    }

    #[test]
    fn allocator_rounding_is_charged() {
        let pool = CountLimitedPool::<u32>::builder()
            .limit(NonZero::new(100).unwrap())
            .allocator(Arc::new(RoundingAllocator::new(NonZero::new(16).unwrap())))
            .build();
        let a = TestItem::new(&pool);

        a.allocate(17).unwrap();

        assert_eq!(a.slot.lock().capacity(), 32);
        assert_eq!(pool.used(), 32);
    }

    #[test]
    fn allocator_rounding_evicts_for_actual_grant() {
        let pool = CountLimitedPool::<u32>::builder()
            .limit(NonZero::new(100).unwrap())
            .allocator(Arc::new(RoundingAllocator::new(NonZero::new(16).unwrap())))
            .build();
        let a = TestItem::new(&pool);
        let b = TestItem::new(&pool);

        a.allocate(48).unwrap();

        // 50 fits next to 48 as requested, but the grant of 64 does not.
        b.allocate(50).unwrap();

        assert!(!a.is_admitted());
        assert_eq!(pool.used(), 64);
        pool.integrity_check();
    }

    #[test]
    fn change_limit_evicts_from_back() {
        let pool = pool_with_limit(100);
        let items: Vec<_> = (0..4).map(|_| TestItem::new(&pool)).collect();
        for item in &items {
            item.allocate(25).unwrap();
        }

        pool.change_limit(NonZero::new(50).unwrap()).unwrap();

        assert_eq!(pool.limit(), 50);
        assert_eq!(pool.used(), 50);
        assert!(!items[0].is_admitted());
        assert!(!items[1].is_admitted());
        assert!(items[2].is_admitted());
        assert!(items[3].is_admitted());
        pool.integrity_check();
    }

    #[test]
    fn change_limit_failure_restores_previous_limit() {
        let pool = pool_with_limit(100);
        let a = TestItem::new(&pool);
        let b = TestItem::new(&pool);
        a.allocate(40).unwrap();
        b.allocate(40).unwrap();
        a.refuse.store(true, Ordering::Relaxed);

        let result = pool.change_limit(NonZero::new(30).unwrap());

        assert!(matches!(result, Err(PoolError::EvictionFailed { .. })));
        assert_eq!(pool.limit(), 100);
        assert_eq!(pool.used(), 80);
        pool.integrity_check();
    }

    #[test]
    fn change_limit_upwards_does_not_evict() {
        let pool = pool_with_limit(10);
        let a = TestItem::new(&pool);
        a.allocate(10).unwrap();

        pool.change_limit(NonZero::new(1000).unwrap()).unwrap();

        assert!(a.is_admitted());
        assert_eq!(pool.stats().evictions(), 0);
    }

    #[test]
    fn dropped_item_frees_itself() {
        let pool = pool_with_limit(100);
        let a = TestItem::new(&pool);
        a.allocate(30).unwrap();

        drop(a);

        assert_eq!(pool.used(), 0);
        assert!(pool.is_empty());
    }

    #[test]
    fn entry_of_unreachable_member_is_reclaimed() {
        let pool = pool_with_limit(100);
        let mut slot = PoolSlot::new();

        // A member that is already gone, as if its last handle were being dropped right now.
        let gone: Weak<dyn PoolMember> = {
            let temporary = TestItem::new(&pool);
            Arc::downgrade(&temporary) as Weak<dyn PoolMember>
        };
        pool.allocate(&mut slot, gone, 70).unwrap();

        let b = TestItem::new(&pool);
        b.allocate(70).unwrap();

        assert_eq!(pool.stats().reclaimed(), 1);
        assert_eq!(pool.used(), 70);

        // The late free finds its token stale and only releases memory.
        pool.free(&mut slot);
        assert_eq!(slot.capacity(), 0);
        assert_eq!(pool.used(), 70);
        pool.integrity_check();
    }

    #[test]
    fn recompute_total_count_rebuilds_used() {
        let pool = pool_with_limit(100);
        let a = TestItem::new(&pool);
        let b = TestItem::new(&pool);
        a.allocate(10).unwrap();
        b.allocate(20).unwrap();

        pool.recompute_total_count().unwrap();

        assert_eq!(pool.used(), 30);
        pool.integrity_check();
    }

    #[test]
    fn operations_from_many_threads_keep_invariants() {
        let pool = pool_with_limit(64);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    let items: Vec<_> = (0..16).map(|_| TestItem::new(&pool)).collect();
                    for (index, item) in items.iter().enumerate() {
                        item.allocate(index % 7 + 1).unwrap();
                        item.touch();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(pool.used(), 0);
        pool.integrity_check();
    }
}
