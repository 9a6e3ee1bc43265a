use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::num::NonZero;
use std::sync::Arc;

use crate::{HeapAllocator, Meter, Pool, PoolAllocator};

/// Builder for creating an instance of [`Pool`].
///
/// The limit is mandatory, whereas the allocator is optional. Without an allocator, item
/// buffers come straight from the heap via [`HeapAllocator`].
///
/// # Examples
///
/// ```
/// use std::num::NonZero;
///
/// use budget_pool::CountLimitedPool;
///
/// let pool = CountLimitedPool::<u32>::builder()
///     .limit(NonZero::new(1024).unwrap())
///     .build();
///
/// assert_eq!(pool.limit(), 1024);
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) but not thread-safe ([`Sync`]).
#[must_use]
pub struct PoolBuilder<T, M> {
    limit: Option<NonZero<usize>>,
    allocator: Option<Arc<dyn PoolAllocator<T>>>,
    meter: M,

    _not_sync: PhantomData<Cell<()>>,
}

impl<T, M: Meter<T>> PoolBuilder<T, M> {
    pub(crate) fn new(meter: M) -> Self {
        Self {
            limit: None,
            allocator: None,
            meter,
            _not_sync: PhantomData,
        }
    }

    /// Sets the maximum aggregate charge of all admitted items.
    ///
    /// For the count-limited pool this is a number of elements; for the indirect pool it is a
    /// number of bytes.
    pub fn limit(mut self, limit: NonZero<usize>) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the allocator that provides item buffers.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::num::NonZero;
    /// use std::sync::Arc;
    ///
    /// use budget_pool::{CountLimitedPool, HeapAllocator, TrackingAllocator};
    ///
    /// let allocator = Arc::new(TrackingAllocator::new(HeapAllocator::new()));
    ///
    /// let pool = CountLimitedPool::<u8>::builder()
    ///     .limit(NonZero::new(64).unwrap())
    ///     .allocator(Arc::clone(&allocator))
    ///     .build();
    ///
    /// assert_eq!(allocator.live_elements(), 0);
    /// # drop(pool);
    /// ```
    pub fn allocator<A>(mut self, allocator: Arc<A>) -> Self
    where
        A: PoolAllocator<T> + 'static,
    {
        let allocator: Arc<dyn PoolAllocator<T>> = allocator;
        self.allocator = Some(allocator);
        self
    }

    /// Builds the pool with the specified configuration.
    ///
    /// # Panics
    ///
    /// Panics if no limit has been set using [`limit()`][Self::limit].
    #[must_use]
    pub fn build(self) -> Pool<T, M> {
        let limit = self
            .limit
            .expect("limit must be set using .limit() before calling .build()");

        let allocator = self.allocator.unwrap_or_else(|| {
            let heap: Arc<dyn PoolAllocator<T>> = Arc::new(HeapAllocator);
            heap
        });

        Pool::new_inner(limit, allocator, self.meter)
    }
}

impl<T, M: fmt::Debug> fmt::Debug for PoolBuilder<T, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuilder")
            .field("limit", &self.limit)
            .field("allocator", &self.allocator)
            .field("meter", &self.meter)
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::{
        CountLimitedPool, DeepFootprint, ElementCount, IndirectCountLimitedPool, RoundingAllocator,
    };

    assert_impl_all!(PoolBuilder<u32, ElementCount>: Send, fmt::Debug);
    assert_not_impl_any!(PoolBuilder<u32, ElementCount>: Sync);

    #[test]
    fn builder_new_creates_default_state() {
        let builder = PoolBuilder::<u32, _>::new(ElementCount);
        assert!(builder.limit.is_none());
        assert!(builder.allocator.is_none());
    }

    #[test]
    fn limit_sets_limit() {
        let pool = CountLimitedPool::<u32>::builder()
            .limit(NonZero::new(10).unwrap())
            .build();

        assert_eq!(pool.limit(), 10);
        assert_eq!(pool.used(), 0);
        assert!(pool.is_empty());
    }

    #[test]
    fn limit_can_be_overridden() {
        let pool = CountLimitedPool::<u32>::builder()
            .limit(NonZero::new(10).unwrap())
            .limit(NonZero::new(20).unwrap())
            .build();

        assert_eq!(pool.limit(), 20);
    }

    #[test]
    fn indirect_builder_uses_deep_meter() {
        let pool = IndirectCountLimitedPool::<String>::builder()
            .limit(NonZero::new(4096).unwrap())
            .build();

        assert_eq!(pool.limit(), 4096);
        let debug_output = format!("{pool:?}");
        assert!(debug_output.contains("Pool"));
        let _meter: &DeepFootprint = pool.meter();
    }

    #[test]
    fn custom_allocator_is_accepted() {
        let allocator = Arc::new(RoundingAllocator::new(NonZero::new(16).unwrap()));

        let _pool = CountLimitedPool::<u64>::builder()
            .limit(NonZero::new(100).unwrap())
            .allocator(allocator)
            .build();
    }

    #[test]
    #[should_panic]
    fn build_without_limit_panics() {
        let _pool = CountLimitedPool::<u32>::builder().build();
    }

    #[test]
    fn builder_is_debug() {
        let builder = CountLimitedPool::<u32>::builder().limit(NonZero::new(3).unwrap());
        let debug_output = format!("{builder:?}");
        assert!(debug_output.contains("PoolBuilder"));
    }

    #[test]
    fn builder_send_trait() {
        let builder = CountLimitedPool::<u64>::builder().limit(NonZero::new(8).unwrap());
        let handle = std::thread::spawn(move || builder.build());
        let pool = handle.join().expect("thread completed successfully");
        assert_eq!(pool.limit(), 8);
    }
}
