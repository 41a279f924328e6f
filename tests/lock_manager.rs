//! Lock timeouts and mutual exclusion across threads

use memwarden::config::LockConfig;
use memwarden::{LockManager, LockOwner, ResourceId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

fn manager() -> Arc<LockManager> {
    Arc::new(LockManager::new(&LockConfig {
        lock_timeout_secs: 300,
        ..Default::default()
    }))
}

#[test]
fn test_write_lock_times_out_while_held() {
    let locks = manager();
    let id = ResourceId::from("model_weights:r1");

    let holder = LockOwner::new("t1");
    assert!(locks.acquire_write(&id, &holder, None, true));

    let waiter = {
        let locks = locks.clone();
        let id = id.clone();
        thread::spawn(move || {
            let start = Instant::now();
            let acquired = locks.acquire_write(
                &id,
                &LockOwner::new("t2"),
                Some(Duration::from_secs(2)),
                true,
            );
            (acquired, start.elapsed())
        })
    };

    let (acquired, waited) = waiter.join().unwrap();
    assert!(!acquired);
    assert!(waited >= Duration::from_millis(1900), "waited {:?}", waited);
    assert!(waited < Duration::from_secs(4), "waited {:?}", waited);

    assert!(locks.release_write(&id, &holder));
    assert!(locks.acquire_write(&id, &LockOwner::new("t2"), None, false));
}

#[test]
fn test_never_writer_with_readers() {
    let locks = manager();
    let id = ResourceId::from("render_cache:frames");
    let readers = Arc::new(AtomicUsize::new(0));
    let writers = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let locks = locks.clone();
            let id = id.clone();
            let readers = readers.clone();
            let writers = writers.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let owner = LockOwner::new(format!("worker-{}", i));
                barrier.wait();
                for _ in 0..50 {
                    if i % 2 == 0 {
                        if let Some(_guard) = locks.write(&id, &owner, Some(Duration::from_secs(5))) {
                            assert_eq!(writers.fetch_add(1, Ordering::SeqCst), 0);
                            assert_eq!(readers.load(Ordering::SeqCst), 0);
                            thread::yield_now();
                            writers.fetch_sub(1, Ordering::SeqCst);
                        }
                    } else if let Some(_guard) = locks.read(&id, &owner, Some(Duration::from_secs(5))) {
                        readers.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(writers.load(Ordering::SeqCst), 0);
                        thread::yield_now();
                        readers.fetch_sub(1, Ordering::SeqCst);
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    let info = locks.lock_info(&id);
    assert!(info.map(|info| info.writer.is_none() && info.reader_count == 0).unwrap_or(true));
}
