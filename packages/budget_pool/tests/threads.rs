//! Several threads sharing one pool. Each thread works on its own vectors while evicting the
//! vectors of the others.

use std::num::NonZero;
use std::sync::Arc;
use std::thread;

use budget_pool::{
    BlockStore, CompressedPooledVec, CountLimitedPool, MemoryBlockStore, StoredBacking,
    StoredPooledVec,
};

const THREADS: u32 = 4;
const VECTORS_PER_THREAD: u32 = 8;
const ROUNDS: u32 = 50;

#[test]
fn concurrent_vectors_stay_within_limit() {
    let pool = CountLimitedPool::<u32>::builder()
        .limit(NonZero::new(256).unwrap())
        .build();

    thread::scope(|scope| {
        for thread_index in 0..THREADS {
            let pool = pool.clone();

            scope.spawn(move || {
                let vectors: Vec<_> = (0..VECTORS_PER_THREAD)
                    .map(|_| CompressedPooledVec::new(&pool))
                    .collect();

                for round in 0..ROUNDS {
                    for vector in &vectors {
                        vector.push(thread_index * 1_000 + round).unwrap();
                        assert!(pool.used() <= pool.limit());
                    }
                }

                for vector in &vectors {
                    let contents = vector.to_vec().unwrap();
                    let expected: Vec<_> = (0..ROUNDS)
                        .map(|round| thread_index * 1_000 + round)
                        .collect();
                    assert_eq!(contents, expected);
                }
            });
        }
    });

    assert!(pool.used() <= pool.limit());
    assert!(pool.stats().evictions() > 0);
}

#[test]
fn vectors_move_between_threads() {
    let store: Arc<dyn BlockStore<u32>> = Arc::new(MemoryBlockStore::<u32>::new());
    let pool = CountLimitedPool::<u32>::builder()
        .limit(NonZero::new(64).unwrap())
        .build();

    let vectors: Vec<_> = (0..THREADS)
        .map(|_| StoredPooledVec::with_backing(&pool, StoredBacking::new(Arc::clone(&store))))
        .collect();

    thread::scope(|scope| {
        for (index, vector) in (0..THREADS).zip(&vectors) {
            scope.spawn(move || {
                vector.extend_from_slice(&[index; 32]).unwrap();
            });
        }
    });

    // Only two vectors fit at a time, wherever they were filled.
    assert!(pool.used() <= 64);
    assert_eq!(pool.len(), 2);

    for (index, vector) in (0..THREADS).zip(&vectors) {
        assert_eq!(vector.to_vec().unwrap(), [index; 32]);
    }
}
