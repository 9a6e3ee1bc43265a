//! Eviction order, persistence round trips and item lifetime, exercised through pooled vectors.

use std::num::NonZero;
use std::sync::Arc;

use budget_pool::{
    BlockStore, CompressedPooledVec, CountLimitedPool, FileBlockStore, MemoryBlockStore,
    RoundingAllocator, StoredBacking, StoredPooledVec,
};
use serde::{Deserialize, Serialize};

fn pool_with_limit<T>(limit: usize) -> CountLimitedPool<T> {
    CountLimitedPool::builder()
        .limit(NonZero::new(limit).unwrap())
        .build()
}

#[test]
fn every_access_refreshes_recency() {
    let pool = pool_with_limit::<u8>(30);
    let a = CompressedPooledVec::new(&pool);
    let b = CompressedPooledVec::new(&pool);
    let c = CompressedPooledVec::new(&pool);

    a.extend_from_slice(&[1; 10]).unwrap();
    b.extend_from_slice(&[2; 10]).unwrap();
    c.extend_from_slice(&[3; 10]).unwrap();

    // Reads count as use just like writes do.
    assert_eq!(a.get(0).unwrap(), Some(1));

    let d = CompressedPooledVec::new(&pool);
    d.extend_from_slice(&[4; 10]).unwrap();

    assert!(!a.is_discarded());
    assert!(b.is_discarded());
    assert!(!c.is_discarded());

    b.set(0, 5).unwrap();

    assert!(c.is_discarded());
    assert_eq!(b.to_vec().unwrap(), {
        let mut expected = vec![2; 10];
        expected[0] = 5;
        expected
    });
}

#[test]
fn length_queries_do_not_refresh_recency() {
    let pool = pool_with_limit::<u8>(20);
    let a = CompressedPooledVec::new(&pool);
    let b = CompressedPooledVec::new(&pool);

    a.extend_from_slice(&[1; 10]).unwrap();
    b.extend_from_slice(&[2; 10]).unwrap();

    assert_eq!(a.len(), 10);
    assert!(a.is_admitted());

    let c = CompressedPooledVec::new(&pool);
    c.extend_from_slice(&[3; 10]).unwrap();

    assert!(a.is_discarded());
    assert_eq!(a.len(), 10);
}

#[test]
fn dropping_vectors_returns_budget() {
    let pool = pool_with_limit::<u64>(100);

    {
        let a = CompressedPooledVec::new(&pool);
        a.reserve(40).unwrap();
        let b = CompressedPooledVec::new(&pool);
        b.reserve(40).unwrap();
        assert_eq!(pool.used(), 80);
    }

    assert_eq!(pool.used(), 0);
    assert!(pool.is_empty());
}

#[test]
fn dropping_last_clone_only_returns_budget() {
    let pool = pool_with_limit::<u64>(100);
    let a = CompressedPooledVec::new(&pool);
    a.reserve(40).unwrap();

    let alias = a.clone();
    drop(a);
    assert_eq!(pool.used(), 40);

    drop(alias);
    assert_eq!(pool.used(), 0);
}

#[test]
fn discarded_vector_can_be_dropped() {
    let pool = pool_with_limit::<u64>(100);
    let a = CompressedPooledVec::new(&pool);
    a.extend_from_slice(&[9; 40]).unwrap();
    a.discard().unwrap();

    drop(a);

    assert_eq!(pool.used(), 0);
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
struct Sample {
    sequence: u64,
    label: String,
}

fn samples(count: u64) -> Vec<Sample> {
    (0..count)
        .map(|sequence| Sample {
            sequence,
            label: format!("sample {sequence}"),
        })
        .collect()
}

#[test]
fn contents_survive_file_store_round_trip() {
    let directory = tempfile::tempdir().unwrap();
    let store: Arc<dyn BlockStore<Sample>> =
        Arc::new(FileBlockStore::<Sample>::open(directory.path()).unwrap());

    let pool = pool_with_limit::<Sample>(64);
    let first = StoredPooledVec::with_backing(&pool, StoredBacking::new(Arc::clone(&store)));
    first.extend_from_slice(&samples(50)).unwrap();

    let second = StoredPooledVec::with_backing(&pool, StoredBacking::new(Arc::clone(&store)));
    second.extend_from_slice(&samples(30)).unwrap();

    assert!(first.is_discarded());
    let block = first.block_id().unwrap();
    assert_eq!(store.block_data_count(block).unwrap(), 50);

    assert_eq!(first.to_vec().unwrap(), samples(50));
    assert!(second.is_discarded());
}

#[test]
fn persisted_block_can_be_reopened() {
    let directory = tempfile::tempdir().unwrap();

    let block = {
        let store: Arc<dyn BlockStore<Sample>> =
            Arc::new(FileBlockStore::<Sample>::open(directory.path()).unwrap());
        let pool = pool_with_limit::<Sample>(64);

        let vector = StoredPooledVec::with_backing(&pool, StoredBacking::new(store));
        vector.extend_from_slice(&samples(10)).unwrap();
        vector.flush().unwrap();
        vector.block_id().unwrap()
    };

    let store: Arc<dyn BlockStore<Sample>> =
        Arc::new(FileBlockStore::<Sample>::open(directory.path()).unwrap());
    let pool = pool_with_limit::<Sample>(64);

    let reopened = StoredPooledVec::from_block(&pool, store, block).unwrap();

    assert!(reopened.is_discarded());
    assert_eq!(reopened.len(), 10);
    assert_eq!(reopened.to_vec().unwrap(), samples(10));
    assert_eq!(pool.used(), 10);
}

#[test]
fn unmodified_stored_vector_is_not_rewritten() {
    let store = Arc::new(MemoryBlockStore::<u32>::new());
    let shared: Arc<dyn BlockStore<u32>> = Arc::clone(&store) as Arc<dyn BlockStore<u32>>;
    let pool = pool_with_limit::<u32>(10);

    let vector = StoredPooledVec::with_backing(&pool, StoredBacking::new(shared));
    vector.extend_from_slice(&[1, 2, 3]).unwrap();
    vector.discard().unwrap();
    assert!(!vector.is_dirty());

    // Reading brings it back clean; discarding again must keep the stored block as is.
    assert_eq!(vector.get(2).unwrap(), Some(3));
    assert!(!vector.is_dirty());

    let block = vector.block_id().unwrap();
    store.store_block(&[7, 7, 7], Some(block)).unwrap();
    vector.discard().unwrap();

    assert_eq!(vector.to_vec().unwrap(), [7, 7, 7]);
}

#[test]
fn modified_vector_is_rewritten_on_discard() {
    let store = Arc::new(MemoryBlockStore::<u32>::new());
    let shared: Arc<dyn BlockStore<u32>> = Arc::clone(&store) as Arc<dyn BlockStore<u32>>;
    let pool = pool_with_limit::<u32>(10);

    let vector = StoredPooledVec::with_backing(&pool, StoredBacking::new(shared));
    vector.extend_from_slice(&[1, 2, 3]).unwrap();
    vector.discard().unwrap();

    vector.push(4).unwrap();
    assert!(vector.is_dirty());
    vector.discard().unwrap();

    let mut loaded = Vec::new();
    store
        .load_block(&mut loaded, 10, vector.block_id().unwrap())
        .unwrap();
    assert_eq!(loaded, [1, 2, 3, 4]);
    assert_eq!(store.block_count(), 1);
}

#[test]
fn allocator_rounding_is_charged_to_vectors() {
    let pool = CountLimitedPool::<u16>::builder()
        .limit(NonZero::new(60).unwrap())
        .allocator(Arc::new(RoundingAllocator::new(NonZero::new(16).unwrap())))
        .build();

    let a = CompressedPooledVec::new(&pool);
    a.push(1).unwrap();

    assert_eq!(a.capacity(), 16);
    assert_eq!(pool.used(), 16);

    let b = CompressedPooledVec::new(&pool);
    b.reserve(40).unwrap();

    // 40 rounds up to 48, which no longer fits next to the first vector.
    assert!(a.is_discarded());
    assert_eq!(pool.used(), 48);
}

#[test]
fn stats_track_activity() {
    let pool = pool_with_limit::<u8>(10);
    let a = CompressedPooledVec::new(&pool);
    let b = CompressedPooledVec::new(&pool);

    a.extend_from_slice(&[1; 6]).unwrap();
    a.push(2).unwrap();
    b.extend_from_slice(&[3; 6]).unwrap();
    drop(b);

    let stats = pool.stats();
    assert_eq!(stats.admissions(), 2);
    assert_eq!(stats.reallocations(), 1);
    assert_eq!(stats.evictions(), 1);
    assert_eq!(stats.frees(), 2);
}
