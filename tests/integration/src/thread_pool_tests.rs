//! Thread Pool Tests - Scaling, Hand-off Locking and Pool Management
//!
//! Exercises the concurrency layer the transport is built on:
//! - Pools growing under a burst and shrinking back when idle
//! - Pools at their thread limit with more queues than workers
//! - Work arriving while idle workers retire
//! - Reentrant lock hand-off between threads
//! - Named pools owned by a manager

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use common::*;
use orb_threadpool::{FnWork, ReentrantLock, ThreadPool, ThreadPoolConfig, ThreadPoolManager};

#[test]
fn test_burst_grows_to_max_and_shrinks_to_min() {
    init_logging();
    let pool = ThreadPool::new(
        ThreadPoolConfig::new("burst")
            .threads(1, 3)
            .idle_timeout(Duration::from_millis(50)),
    )
    .unwrap();
    assert_eq!(pool.current_number_of_threads(), 1);

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    for i in 0..5 {
        let running = running.clone();
        let peak = peak.clone();
        let tx = tx.clone();
        pool.add_work(Box::new(FnWork::new(format!("item-{}", i), move || {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(10));
            running.fetch_sub(1, Ordering::SeqCst);
            tx.send(i).unwrap();
        })))
        .unwrap();
    }
    for _ in 0..5 {
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(pool.current_number_of_threads() <= 3);
    assert_eq!(pool.get_any_work_queue().total_work_items_added(), 5);
    assert!(wait_until(Duration::from_secs(5), || pool.current_number_of_threads() == 1));

    let stats = pool.stats();
    assert_eq!(stats.processed_count, 5);
    assert_eq!(stats.failed_count, 0);
    pool.close();
    assert_eq!(pool.current_number_of_threads(), 0);
}

#[test]
fn test_work_spread_over_several_queues() {
    init_logging();
    let pool = ThreadPool::new(ThreadPoolConfig::new("multi").threads(0, 4).queues(2)).unwrap();
    assert_eq!(pool.number_of_work_queues(), 2);

    let (tx, rx) = mpsc::channel();
    for i in 0..20 {
        let tx = tx.clone();
        pool.add_work(Box::new(FnWork::new("spread", move || tx.send(i).unwrap())))
            .unwrap();
    }
    let mut seen: Vec<i32> = (0..20)
        .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
        .collect();
    seen.sort();
    assert_eq!(seen, (0..20).collect::<Vec<_>>());

    let added: u64 = pool
        .stats()
        .queues
        .iter()
        .map(|queue| queue.items_added)
        .sum();
    assert_eq!(added, 20);
    pool.close();
}

#[test]
fn test_saturated_pool_drains_every_queue() {
    init_logging();
    let pool = ThreadPool::new(ThreadPoolConfig::new("saturated").threads(1, 2).queues(4)).unwrap();

    let (tx, rx) = mpsc::channel();
    for i in 0..40 {
        let tx = tx.clone();
        pool.add_work(Box::new(FnWork::new("saturated", move || {
            thread::sleep(Duration::from_millis(1));
            tx.send(i).unwrap();
        })))
        .unwrap();
    }
    let mut seen: Vec<i32> = (0..40)
        .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
        .collect();
    seen.sort();
    assert_eq!(seen, (0..40).collect::<Vec<_>>());
    assert!(pool.current_number_of_threads() <= 2);
    assert!(pool.stats().queues.iter().all(|queue| queue.items_added == 10));
    pool.close();
}

#[test]
fn test_work_arriving_as_workers_retire_still_runs() {
    init_logging();
    let idle = Duration::from_millis(1);
    let pool = ThreadPool::new(ThreadPoolConfig::new("retiring").threads(0, 1).idle_timeout(idle)).unwrap();

    let (tx, rx) = mpsc::channel();
    for i in 0..300 {
        let tx = tx.clone();
        pool.add_work(Box::new(FnWork::new("late", move || tx.send(i).unwrap())))
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), i);
        thread::sleep(idle);
    }
    assert!(pool.current_number_of_threads() <= 1);
    pool.close();
}

#[test]
fn test_lock_hand_off_between_threads() {
    init_logging();
    let lock = Arc::new(ReentrantLock::new());
    lock.acquire();
    lock.acquire();
    lock.acquire();
    assert_eq!(lock.hold_count(), 3);

    // give the lock away entirely while another thread does its work
    let held = lock.release_all().unwrap();
    assert_eq!(held, 3);
    assert!(!lock.is_locked());

    let other = {
        let lock = lock.clone();
        thread::spawn(move || {
            let _guard = lock.lock();
            assert!(lock.is_held_by_current_thread());
            thread::sleep(Duration::from_millis(20));
        })
    };
    other.join().unwrap();

    lock.acquire_all(held).unwrap();
    assert_eq!(lock.hold_count(), 3);
    for _ in 0..3 {
        lock.release().unwrap();
    }
    assert!(!lock.is_locked());
}

#[test]
fn test_lock_provides_mutual_exclusion() {
    init_logging();
    let lock = Arc::new(ReentrantLock::new());
    let inside = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let lock = lock.clone();
            let inside = inside.clone();
            thread::spawn(move || {
                for _ in 0..50 {
                    let _outer = lock.lock();
                    let _inner = lock.lock();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(!lock.is_locked());
}

#[test]
fn test_manager_owns_named_pools() {
    init_logging();
    let manager = ThreadPoolManager::new(ThreadPoolConfig::new("orb-default").threads(1, 2)).unwrap();
    let replies = manager
        .add_thread_pool(ThreadPoolConfig::new("replies").threads(0, 2))
        .unwrap();
    assert_eq!(manager.pool_names(), vec!["orb-default".to_string(), "replies".to_string()]);
    assert!(manager.add_thread_pool(ThreadPoolConfig::new("replies")).is_err());
    assert!(manager.get_thread_pool("missing").is_err());

    let (tx, rx) = mpsc::channel();
    let tx2 = tx.clone();
    manager
        .default_pool()
        .add_work(Box::new(FnWork::new("default", move || tx.send("default").unwrap())))
        .unwrap();
    replies
        .add_work(Box::new(FnWork::new("replies", move || tx2.send("replies").unwrap())))
        .unwrap();
    let mut got = vec![
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
    ];
    got.sort();
    assert_eq!(got, vec!["default", "replies"]);

    manager.close();
    assert!(manager.default_pool().is_closed());
    assert!(manager.get_thread_pool("replies").unwrap().is_closed());
}
