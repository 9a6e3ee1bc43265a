use crate::{Meter, PositionToken};

/// The part of a pool item that the pool manages: its buffer, granted capacity and position in
/// the recency list.
///
/// A slot is in one of three states:
///
/// * **Detached** - no buffer, not admitted.
/// * **Admitted** - holds a buffer that is charged against the pool limit.
/// * **Removed** - holds a buffer that is no longer charged or tracked by the pool. The memory
///   must be released via [`Pool::free_removed_item_memory()`][crate::Pool::free_removed_item_memory].
///
/// The slot never grows its buffer on its own; all growth goes through the pool so the charge
/// stays accurate.
#[derive(Debug)]
pub struct PoolSlot<T> {
    pub(crate) buffer: Vec<T>,
    pub(crate) capacity: usize,
    pub(crate) token: Option<PositionToken>,

    // Zero means stale, recomputed on the next read.
    footprint: usize,
}

impl<T> PoolSlot<T> {
    /// Creates a detached slot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            capacity: 0,
            token: None,
            footprint: 0,
        }
    }

    /// Whether the slot is admitted to the pool and counted against its limit.
    #[must_use]
    pub fn is_admitted(&self) -> bool {
        self.token.is_some()
    }

    /// Whether the slot was removed from the pool while keeping its memory.
    #[must_use]
    pub fn holds_removed_memory(&self) -> bool {
        self.token.is_none() && self.capacity > 0
    }

    /// The position of the slot in the recency list, if admitted.
    #[must_use]
    pub fn position(&self) -> Option<PositionToken> {
        self.token
    }

    /// Number of elements the buffer was granted for.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of elements in the buffer.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the buffer holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Room left in the granted capacity.
    #[must_use]
    pub fn spare_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.buffer.len())
    }

    /// The elements in the buffer.
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        &self.buffer
    }

    /// The elements in the buffer, mutably.
    ///
    /// Changes may alter the deep footprint of the contents, so the cached footprint is
    /// invalidated.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        self.invalidate_footprint();
        &mut self.buffer
    }

    /// Appends an element within the granted capacity.
    ///
    /// # Panics
    ///
    /// Panics if the granted capacity is already used up. Grow the slot through the pool first.
    pub fn push_within_capacity(&mut self, value: T) {
        assert!(
            self.buffer.len() < self.capacity,
            "slot is full ({} elements), reallocate through the pool before pushing",
            self.capacity
        );

        self.invalidate_footprint();
        self.buffer.push(value);
    }

    /// Removes and returns the element at `index`, shifting later elements down.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn remove(&mut self, index: usize) -> T {
        self.invalidate_footprint();
        self.buffer.remove(index)
    }

    /// Shortens the buffer to `len` elements, dropping the rest.
    pub fn truncate(&mut self, len: usize) {
        self.invalidate_footprint();
        self.buffer.truncate(len);
    }

    /// Gives mutable access to the buffer for bulk refills, such as restoring persisted contents.
    ///
    /// The caller must not grow the buffer beyond [`capacity()`][Self::capacity].
    pub fn refill(&mut self, f: impl FnOnce(&mut Vec<T>)) {
        self.invalidate_footprint();
        f(&mut self.buffer);

        debug_assert!(
            self.buffer.len() <= self.capacity,
            "refill grew the buffer beyond its granted capacity"
        );
    }

    /// Marks the cached footprint as stale.
    pub fn invalidate_footprint(&mut self) {
        self.footprint = 0;
    }

    /// The footprint of the slot under the given meter, recomputed if stale.
    pub fn footprint<M: Meter<T>>(&mut self, meter: &M) -> usize {
        if self.footprint == 0 && self.capacity > 0 {
            self.footprint = meter.measure(&self.buffer, self.capacity);
        }

        self.footprint
    }
}

impl<T> Default for PoolSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}
