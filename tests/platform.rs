use jscluster::runtime::platform::{Platform, PlatformHandle};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn test_acquire_release_from_many_threads() {
    const THREADS: usize = 8;
    const ROUNDS: usize = 50;

    let barrier = Arc::new(Barrier::new(THREADS));
    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..ROUNDS {
                    let handle = PlatformHandle::acquire();
                    assert!(Platform::live_count() <= 1);
                    assert!(handle.generation() > 0);
                    let copy = handle.clone();
                    assert_eq!(copy.generation(), handle.generation());
                    drop(handle);
                    assert!(Platform::live_count() <= 1);
                    drop(copy);
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(Platform::live_count(), 0);

    // A fresh acquire after full release builds a new generation.
    let first = PlatformHandle::acquire();
    let generation = first.generation();
    drop(first);
    let second = PlatformHandle::acquire();
    assert!(second.generation() > generation);
}
