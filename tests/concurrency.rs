// Multi-threaded stress tests for the allocator facade (spec §8 invariants
// 1/3/9, §5 concurrency model). Spawns real OS threads against one shared
// facade and checks byte accounting and no-leaks after the fact, the same
// shape as the donor's `concurrent_map` multi-thread tests
// (`src/common/concurrent_map.rs`).

use std::sync::Arc;
use std::thread;

use pooled_alloc::memory::config::PoolConfig;
use pooled_alloc::memory::facade::AllocatorFacade;

fn small_pool(num_arenas: usize) -> Arc<AllocatorFacade> {
    let mut cfg = PoolConfig::default();
    cfg.num_heap_arenas = num_arenas;
    cfg.num_direct_arenas = 0;
    Arc::new(AllocatorFacade::new(cfg).unwrap())
}

// Spec §8 property 9: after every allocation is matched by exactly one
// free and all thread caches are drained, no bytes remain attributed.
#[test]
fn many_threads_allocate_and_free_leave_no_leaks() {
    let facade = small_pool(4);
    let mut handles = Vec::new();

    for t in 0..8 {
        let facade = facade.clone();
        handles.push(thread::spawn(move || {
            for i in 0..500 {
                let size = 16 + (t * 37 + i) % 4096;
                let view = facade.allocate(size, size, false).unwrap();
                facade.as_mut_slice(&view, |b| {
                    if !b.is_empty() {
                        b[0] = (t % 256) as u8;
                    }
                });
                facade.free(view).unwrap();
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    facade.shutdown();
    assert_eq!(facade.metrics().total_active_bytes, 0);
}

// Threads allocate many blocks, hand them to a different thread to free
// (crossing the thread-cache ownership boundary, spec §3 "a thread cache
// holds weak logical references ... when the thread exits, every cached
// entry is returned"), then the facade is torn down with nothing leaked.
#[test]
fn cross_thread_free_does_not_leak() {
    let facade = small_pool(2);
    let (tx, rx) = std::sync::mpsc::channel();

    let producer_facade = facade.clone();
    let producer = thread::spawn(move || {
        for i in 0..200 {
            let size = 64 + (i % 2048);
            let view = producer_facade.allocate(size, size, false).unwrap();
            tx.send(view).unwrap();
        }
    });

    let consumer_facade = facade.clone();
    let consumer = thread::spawn(move || {
        let mut freed = 0;
        while let Ok(view) = rx.recv() {
            consumer_facade.free(view).unwrap();
            freed += 1;
        }
        freed
    });

    producer.join().unwrap();
    let freed = consumer.join().unwrap();
    assert_eq!(freed, 200);

    facade.shutdown();
    assert_eq!(facade.metrics().total_active_bytes, 0);
}

// Concurrent allocation of many small (subpage) blocks across threads
// sharing one arena must never hand out two live blocks with the same
// underlying storage (spec §8 property: round trip / no overlap).
#[test]
fn concurrent_small_allocations_never_alias() {
    let facade = small_pool(1);
    let mut handles = Vec::new();

    for _ in 0..6 {
        let facade = facade.clone();
        handles.push(thread::spawn(move || {
            let mut views = Vec::new();
            for _ in 0..64 {
                views.push(facade.allocate(128, 128, false).unwrap());
            }
            for v in &views {
                facade.as_mut_slice(v, |b| b.fill(0xAB));
            }
            for v in &views {
                facade.as_slice(v, |b| assert!(b.iter().all(|&x| x == 0xAB)));
            }
            for v in views {
                facade.free(v).unwrap();
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    facade.shutdown();
    assert_eq!(facade.metrics().total_active_bytes, 0);
}
