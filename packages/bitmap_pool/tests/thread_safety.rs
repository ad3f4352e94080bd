//! Tests for the thread-safe pool variants under concurrent use.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use bitmap_pool::{FixedSizeRegistry, FixedTypeAllocator, GrowthPolicy, IterationMode};

const THREADS: usize = 8;
const PER_THREAD: usize = 500;

#[test]
fn concurrent_allocate_and_free() {
    let pool = Arc::new(
        FixedTypeAllocator::<usize>::builder()
            .capacity(8)
            .build_sync()
            .unwrap(),
    );
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers = (0..THREADS)
        .map(|worker| {
            let pool = Arc::clone(&pool);
            let barrier = Arc::clone(&barrier);

            thread::spawn(move || {
                barrier.wait();

                let mut handles = (0..PER_THREAD)
                    .map(|n| pool.insert(worker * PER_THREAD + n).unwrap())
                    .collect::<Vec<_>>();

                for (n, handle) in handles.iter().enumerate() {
                    let value = pool.with(handle, |value| *value).unwrap();
                    assert_eq!(value, worker * PER_THREAD + n);
                }

                for handle in handles.iter_mut().step_by(2) {
                    pool.free(handle).unwrap();
                }

                handles
            })
        })
        .collect::<Vec<_>>();

    let mut survivors = Vec::new();

    for worker in workers {
        survivors.extend(worker.join().unwrap().into_iter().filter(|h| h.is_bound()));
    }

    assert_eq!(pool.len(), THREADS * PER_THREAD / 2);
    assert_eq!(survivors.len(), THREADS * PER_THREAD / 2);

    let mut visited = 0;
    pool.for_each(IterationMode::Active, |_| visited += 1)
        .unwrap();
    assert_eq!(visited, THREADS * PER_THREAD / 2);

    for handle in &mut survivors {
        pool.free(handle).unwrap();
    }

    assert!(pool.is_empty());
}

#[test]
fn growth_callback_fires_once_per_growth_under_contention() {
    let growths = Arc::new(AtomicUsize::new(0));

    let pool = Arc::new(
        FixedTypeAllocator::<u64>::builder()
            .capacity(8)
            .on_grow({
                let growths = Arc::clone(&growths);
                move || {
                    growths.fetch_add(1, Ordering::Relaxed);
                }
            })
            .build_sync()
            .unwrap(),
    );

    let workers = (0..THREADS)
        .map(|_| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                for n in 0..128 {
                    pool.insert(n).unwrap();
                }
            })
        })
        .collect::<Vec<_>>();

    for worker in workers {
        worker.join().unwrap();
    }

    // 8 -> 16 -> ... -> 1024 holds all 1024 objects.
    assert_eq!(pool.len(), 1024);
    assert_eq!(pool.capacity(), 1024);
    assert_eq!(growths.load(Ordering::Relaxed), 7);
}

#[test]
fn fixed_pool_never_overfills() {
    let pool = Arc::new(
        FixedTypeAllocator::<u32>::builder()
            .capacity(64)
            .growth_policy(GrowthPolicy::Fixed)
            .build_sync()
            .unwrap(),
    );

    let workers = (0..THREADS)
        .map(|_| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                (0..32)
                    .filter(|n| pool.insert(*n).unwrap().is_bound())
                    .count()
            })
        })
        .collect::<Vec<_>>();

    let bound: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();

    assert_eq!(bound, 64);
    assert!(pool.is_full());
    assert_eq!(pool.capacity(), 64);
}

#[test]
fn registry_pools_can_be_shared() {
    let registry = Arc::new(
        FixedSizeRegistry::builder()
            .pool(16, 64)
            .build()
            .unwrap(),
    );

    let workers = (0..THREADS)
        .map(|worker| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                (0..PER_THREAD)
                    .map(|n| {
                        registry
                            .with_pool(16, 64, |pool| pool.insert([worker, n]))
                            .unwrap()
                            .unwrap()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect::<Vec<_>>();

    let handles = workers
        .into_iter()
        .flat_map(|w| w.join().unwrap())
        .collect::<Vec<_>>();

    registry
        .with_pool(16, 64, |pool| {
            assert_eq!(pool.len(), THREADS * PER_THREAD);

            for handle in &handles {
                // SAFETY: Every handle was issued for a [usize; 2] and none was removed.
                let [worker, n] = *unsafe { pool.get(handle) }.unwrap();
                assert!(worker < THREADS);
                assert!(n < PER_THREAD);
            }
        })
        .unwrap();
}
