use std::fmt;
use std::num::NonZero;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Memory handed out by a [`PoolAllocator`].
///
/// The buffer is empty (length zero) and can hold at least `granted` elements without
/// reallocating. The pool charges the item for `granted`, not for the requested count.
#[derive(Debug)]
pub struct Grant<T> {
    buffer: Vec<T>,
    granted: usize,
}

impl<T> Grant<T> {
    /// Creates a grant from an empty buffer and the capacity the buffer is guaranteed to provide.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is not empty or cannot hold `granted` elements.
    #[must_use]
    pub fn new(buffer: Vec<T>, granted: usize) -> Self {
        assert!(buffer.is_empty(), "granted buffers must start empty");
        assert!(
            buffer.capacity() >= granted,
            "buffer capacity {} is smaller than the granted count {granted}",
            buffer.capacity()
        );

        Self { buffer, granted }
    }

    /// The number of elements the buffer was granted for.
    #[must_use]
    pub fn granted(&self) -> usize {
        self.granted
    }

    pub(crate) fn into_parts(self) -> (Vec<T>, usize) {
        (self.buffer, self.granted)
    }
}

/// Source of memory for pool items.
///
/// A pool without a configured allocator uses [`HeapAllocator`].
///
/// Implementations may grant more than requested (for example to round to an allocation
/// granule). The pool always accounts for the granted count.
pub trait PoolAllocator<T>: Send + Sync + fmt::Debug {
    /// Provides an empty buffer able to hold at least `requested` elements, or `None` if no
    /// memory is available.
    fn allocate(&self, requested: usize) -> Option<Grant<T>>;

    /// Takes back a buffer previously handed out by [`allocate()`][Self::allocate], together
    /// with the count it was granted for. Any elements still in the buffer are dropped.
    fn free(&self, buffer: Vec<T>, granted: usize);
}

/// Allocates item buffers directly from the global heap, granting exactly what was requested.
#[derive(Clone, Copy, Debug, Default)]
#[non_exhaustive]
pub struct HeapAllocator;

impl HeapAllocator {
    /// Creates the heap allocator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl<T> PoolAllocator<T> for HeapAllocator {
    fn allocate(&self, requested: usize) -> Option<Grant<T>> {
        let mut buffer = Vec::new();
        buffer.try_reserve_exact(requested).ok()?;

        Some(Grant::new(buffer, requested))
    }

    #[cfg_attr(test, mutants::skip)] // Dropping the buffer is the only thing to do.
    fn free(&self, buffer: Vec<T>, _granted: usize) {
        drop(buffer);
    }
}

/// Rounds every request up to a multiple of a fixed granule before allocating from the heap.
///
/// Useful when item sizes cluster around a few values and re-growing by one element at a time
/// would otherwise churn the pool.
#[derive(Clone, Copy, Debug)]
pub struct RoundingAllocator {
    granule: NonZero<usize>,
}

impl RoundingAllocator {
    /// Creates an allocator that grants multiples of `granule` elements.
    #[must_use]
    pub fn new(granule: NonZero<usize>) -> Self {
        Self { granule }
    }

    /// The granule requests are rounded up to.
    #[must_use]
    pub fn granule(&self) -> NonZero<usize> {
        self.granule
    }
}

impl<T> PoolAllocator<T> for RoundingAllocator {
    fn allocate(&self, requested: usize) -> Option<Grant<T>> {
        let granted = requested.checked_next_multiple_of(self.granule.get())?;

        let mut buffer = Vec::new();
        buffer.try_reserve_exact(granted).ok()?;

        Some(Grant::new(buffer, granted))
    }

    #[cfg_attr(test, mutants::skip)] // Dropping the buffer is the only thing to do.
    fn free(&self, buffer: Vec<T>, _granted: usize) {
        drop(buffer);
    }
}

/// Wraps another allocator and counts the memory flowing through it.
///
/// The counters are owned by the allocator instance; share the allocator between pools through
/// an `Arc` to observe their combined traffic.
#[derive(Debug, Default)]
pub struct TrackingAllocator<A> {
    inner: A,
    live_elements: AtomicUsize,
    allocations: AtomicUsize,
    frees: AtomicUsize,
}

impl<A> TrackingAllocator<A> {
    /// Wraps `inner`, starting all counters at zero.
    #[must_use]
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            live_elements: AtomicUsize::new(0),
            allocations: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
        }
    }

    /// Number of granted elements currently handed out and not yet freed.
    #[must_use]
    pub fn live_elements(&self) -> usize {
        self.live_elements.load(Ordering::Relaxed)
    }

    /// Number of successful allocations performed.
    #[must_use]
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Number of buffers returned to the allocator.
    #[must_use]
    pub fn frees(&self) -> usize {
        self.frees.load(Ordering::Relaxed)
    }
}

impl<T, A> PoolAllocator<T> for TrackingAllocator<A>
where
    A: PoolAllocator<T>,
{
    fn allocate(&self, requested: usize) -> Option<Grant<T>> {
        let grant = self.inner.allocate(requested)?;

        self.live_elements
            .fetch_add(grant.granted(), Ordering::Relaxed);
        self.allocations.fetch_add(1, Ordering::Relaxed);

        Some(grant)
    }

    fn free(&self, buffer: Vec<T>, granted: usize) {
        self.live_elements.fetch_sub(granted, Ordering::Relaxed);
        self.frees.fetch_add(1, Ordering::Relaxed);

        self.inner.free(buffer, granted);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(HeapAllocator: Send, Sync, fmt::Debug);
    assert_impl_all!(TrackingAllocator<HeapAllocator>: Send, Sync, fmt::Debug);

    #[test]
    fn heap_grants_exactly_requested() {
        let grant: Grant<u64> = HeapAllocator.allocate(17).unwrap();

        assert_eq!(grant.granted(), 17);
        let (buffer, granted) = grant.into_parts();
        assert!(buffer.is_empty());
        assert!(buffer.capacity() >= granted);
    }

    #[test]
    fn rounding_grants_next_multiple() {
        let allocator = RoundingAllocator::new(NonZero::new(8).unwrap());

        let grant: Grant<u8> = allocator.allocate(9).unwrap();
        assert_eq!(grant.granted(), 16);

        let grant: Grant<u8> = allocator.allocate(16).unwrap();
        assert_eq!(grant.granted(), 16);

        let grant: Grant<u8> = allocator.allocate(0).unwrap();
        assert_eq!(grant.granted(), 0);
    }

    #[test]
    fn rounding_overflow_is_failure() {
        let allocator = RoundingAllocator::new(NonZero::new(8).unwrap());

        let grant: Option<Grant<u8>> = allocator.allocate(usize::MAX);
        assert!(grant.is_none());
    }

    #[test]
    fn tracking_counts_live_elements() {
        let allocator = TrackingAllocator::new(RoundingAllocator::new(NonZero::new(4).unwrap()));

        let first: Grant<u32> = allocator.allocate(3).unwrap();
        let second: Grant<u32> = allocator.allocate(5).unwrap();
        assert_eq!(allocator.live_elements(), 12);
        assert_eq!(allocator.allocations(), 2);

        let (buffer, granted) = first.into_parts();
        PoolAllocator::<u32>::free(&allocator, buffer, granted);
        assert_eq!(allocator.live_elements(), 8);
        assert_eq!(allocator.frees(), 1);

        let (buffer, granted) = second.into_parts();
        PoolAllocator::<u32>::free(&allocator, buffer, granted);
        assert_eq!(allocator.live_elements(), 0);
    }

    #[test]
    #[should_panic]
    fn grant_rejects_non_empty_buffer() {
        let _grant = Grant::new(vec![1_u8], 1);
    }
}
