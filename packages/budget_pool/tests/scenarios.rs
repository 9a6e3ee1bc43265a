//! Budget scenarios exercised through the public API: eviction on admission, shrinking the
//! limit, growing an item, pinned eviction and deep footprint tracking.

use std::mem;
use std::num::NonZero;
use std::sync::Arc;

use budget_pool::{
    BlockId, BlockStore, BlockStoreError, CompressedPooledVec, CountLimitedPool, DeepFootprint,
    HeapAllocator, IndirectCountLimitedPool, PoolError, StoredBacking, StoredPooledVec,
    TrackingAllocator,
};
use mockall::mock;

mock! {
    #[derive(Debug)]
    Store {}

    impl BlockStore<u32> for Store {
        fn store_block(
            &self,
            data: &[u32],
            existing: Option<BlockId>,
        ) -> Result<BlockId, BlockStoreError>;

        fn load_block(
            &self,
            buffer: &mut Vec<u32>,
            max_count: usize,
            id: BlockId,
        ) -> Result<usize, BlockStoreError>;

        fn block_data_count(&self, id: BlockId) -> Result<usize, BlockStoreError>;

        fn destroy_block(&self, id: BlockId) -> Result<bool, BlockStoreError>;
    }
}

fn pool_with_limit(limit: usize) -> CountLimitedPool<u32> {
    CountLimitedPool::builder()
        .limit(NonZero::new(limit).unwrap())
        .build()
}

#[test]
fn admission_evicts_least_recently_used() {
    let pool = pool_with_limit(100);
    let a = CompressedPooledVec::new(&pool);
    let b = CompressedPooledVec::new(&pool);

    a.reserve(60).unwrap();
    assert_eq!(pool.used(), 60);

    b.reserve(60).unwrap();

    assert!(a.is_discarded());
    assert!(!a.is_admitted());
    assert!(b.is_admitted());
    assert_eq!(pool.used(), 60);
    assert_eq!(pool.len(), 1);
    assert_eq!(pool.stats().evictions(), 1);
}

#[test]
fn lowering_limit_evicts_from_the_back() {
    let pool = pool_with_limit(100);
    let vectors: Vec<_> = (0..4)
        .map(|_| {
            let vector = CompressedPooledVec::new(&pool);
            vector.reserve(20).unwrap();
            vector
        })
        .collect();

    // The oldest one is used again, so the second oldest is first in line.
    vectors.first().unwrap().read(|_| ()).unwrap();

    pool.change_limit(NonZero::new(50).unwrap()).unwrap();

    assert_eq!(pool.limit(), 50);
    assert_eq!(pool.used(), 40);
    let discarded: Vec<_> = vectors.iter().map(CompressedPooledVec::is_discarded).collect();
    assert_eq!(discarded, [false, true, true, false]);
}

#[test]
fn lowering_limit_fails_when_victim_cannot_persist() {
    let mut store = MockStore::new();
    store
        .expect_store_block()
        .returning(|_, _| Err(BlockStoreError::Rejected(String::from("read-only"))));
    let store: Arc<dyn BlockStore<u32>> = Arc::new(store);

    let pool = pool_with_limit(100);
    let stuck = StoredPooledVec::with_backing(&pool, StoredBacking::new(Arc::clone(&store)));
    stuck.extend_from_slice(&[1; 40]).unwrap();

    let result = pool.change_limit(NonZero::new(10).unwrap());

    assert!(matches!(result, Err(PoolError::EvictionFailed { .. })));
    assert_eq!(pool.limit(), 100);
    assert_eq!(pool.used(), 40);
    assert!(!stuck.is_discarded());
    assert_eq!(stuck.to_vec().unwrap(), [1; 40]);
    assert_eq!(pool.stats().failed_evictions(), 1);
}

#[test]
fn growing_item_never_evicts_itself() {
    let pool = pool_with_limit(100);
    let grown = CompressedPooledVec::new(&pool);
    let other = CompressedPooledVec::new(&pool);

    grown.extend_from_slice(&[7; 30]).unwrap();
    other.extend_from_slice(&[8; 30]).unwrap();

    // `grown` is the least recently used item, yet it is the one asking for room.
    grown.reserve(60).unwrap();

    assert!(!grown.is_discarded());
    assert!(grown.capacity() >= 90);
    assert!(other.is_discarded());
    assert!(pool.used() <= 100);
    assert_eq!(grown.to_vec().unwrap(), [7; 30]);
}

#[test]
fn growing_single_item_beyond_limit_fails() {
    let pool = pool_with_limit(100);
    let grown = CompressedPooledVec::new(&pool);
    grown.extend_from_slice(&[7; 30]).unwrap();

    let result = grown.reserve(80);

    assert!(matches!(result, Err(PoolError::Exhausted { .. })));
    assert_eq!(grown.capacity(), 30);
    assert_eq!(pool.used(), 30);
}

#[test]
fn pinned_item_memory_is_released_only_when_unpinned() {
    let allocator = Arc::new(TrackingAllocator::new(HeapAllocator::new()));
    let pool = CountLimitedPool::<u32>::builder()
        .limit(NonZero::new(100).unwrap())
        .allocator(Arc::clone(&allocator))
        .build();

    let pinned = CompressedPooledVec::new(&pool);
    pinned.extend_from_slice(&[1; 60]).unwrap();
    let pin = pinned.pin().unwrap();

    let other = CompressedPooledVec::new(&pool);
    other.extend_from_slice(&[2; 60]).unwrap();

    // Evicted from the budget, but the memory stays put.
    assert!(pinned.is_discarded());
    assert_eq!(pool.used(), 60);
    assert_eq!(allocator.live_elements(), 120);
    assert_eq!(pool.stats().removals(), 1);
    assert_eq!(pool.stats().frees(), 0);

    drop(pin);

    assert_eq!(allocator.live_elements(), 60);
    assert!(pinned.is_discarded());
    assert_eq!(pinned.to_vec().unwrap(), [1; 60]);
}

#[test]
fn deep_footprint_growth_is_charged_before_next_budget_check() {
    let pool = IndirectCountLimitedPool::<String>::builder()
        .limit(NonZero::new(4096).unwrap())
        .build();

    let strings = CompressedPooledVec::<String, DeepFootprint>::new(&pool);
    strings.push(String::new()).unwrap();
    strings.push(String::new()).unwrap();

    let shallow = pool.used();
    assert_eq!(shallow, 2 * mem::size_of::<String>());

    // Same element count, much larger structure.
    strings
        .modify(|contents| {
            for value in contents {
                value.push_str(&"x".repeat(1000));
            }
        })
        .unwrap();

    assert!(pool.used() >= shallow + 2000);

    // The next admission sees the true charge and evicts accordingly.
    let large = CompressedPooledVec::<String, DeepFootprint>::new(&pool);
    large.push("y".repeat(2500)).unwrap();

    assert!(strings.is_discarded());
    assert!(pool.used() <= pool.limit());

    // Restoring recomputes the deep charge and evicts the other vector in turn.
    let restored = strings.to_vec().unwrap();
    assert_eq!(restored, ["x".repeat(1000), "x".repeat(1000)]);
    assert!(large.is_discarded());
    assert!(pool.used() >= 2000);
    assert!(pool.used() <= pool.limit());
}
