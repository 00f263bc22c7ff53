#![allow(missing_docs)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dirstore::{
    primitives::concurrency::{LockManager, LockType},
    storage::BackendOptions,
    types::Dn,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const THREADS: usize = 8;
const OPS_PER_THREAD: usize = 2_000;
const BUDGET: Duration = Duration::from_secs(120);

fn random_dn(rng: &mut ChaCha8Rng) -> Dn {
    let depth = rng.gen_range(1..=3);
    let mut text = String::new();
    for level in (0..depth).rev() {
        text.push_str(&format!("ou=n{}x{},", level, rng.gen_range(0..4)));
    }
    text.push_str("dc=example");
    Dn::parse(&text).expect("generated dn")
}

fn random_kind(rng: &mut ChaCha8Rng) -> LockType {
    match rng.gen_range(0..10) {
        0..=3 => LockType::ReadEntry,
        4..=8 => LockType::WriteEntry,
        _ => LockType::WriteSubtree,
    }
}

fn run_workload(mgr: &LockManager, seed: u64) -> (u64, u64) {
    let granted = Arc::new(AtomicU64::new(0));
    let refused = Arc::new(AtomicU64::new(0));
    let started = Instant::now();
    let handles: Vec<_> = (0..THREADS)
        .map(|worker| {
            let mgr = mgr.clone();
            let granted = Arc::clone(&granted);
            let refused = Arc::clone(&refused);
            thread::spawn(move || {
                let mut rng = ChaCha8Rng::seed_from_u64(seed + worker as u64);
                let mut ctx = mgr.context();
                for _ in 0..OPS_PER_THREAD {
                    let first = random_dn(&mut rng);
                    let kind = random_kind(&mut rng);
                    let Some(outer) = mgr.try_lock(&mut ctx, &first, kind, mgr.timeout()) else {
                        refused.fetch_add(1, Ordering::Relaxed);
                        continue;
                    };
                    granted.fetch_add(1, Ordering::Relaxed);
                    // Occasionally hold a second lock, as add/rename paths do.
                    if rng.gen_bool(0.2) {
                        let second = random_dn(&mut rng);
                        match mgr.try_write_lock_entry(&mut ctx, &second) {
                            Some(_inner) => granted.fetch_add(1, Ordering::Relaxed),
                            None => refused.fetch_add(1, Ordering::Relaxed),
                        };
                    }
                    drop(outer);
                }
            })
        })
        .collect();

    while !handles.iter().all(|h| h.is_finished()) {
        assert!(started.elapsed() < BUDGET, "lock workload did not terminate");
        thread::sleep(Duration::from_millis(20));
    }
    for handle in handles {
        handle.join().expect("worker panicked");
    }
    (granted.load(Ordering::Relaxed), refused.load(Ordering::Relaxed))
}

#[test]
fn random_workload_terminates_and_drains_table() {
    let mgr = LockManager::new(&BackendOptions::new().lock_timeout(Duration::from_millis(50)));
    let (granted, refused) = run_workload(&mgr, 7);
    assert!(granted > 0);
    assert!(granted + refused >= (THREADS * OPS_PER_THREAD) as u64);
    assert_eq!(mgr.table_len(), 0);
}

#[test]
fn uncached_workload_drains_table() {
    let mgr = LockManager::new(
        &BackendOptions::new()
            .lock_timeout(Duration::from_millis(50))
            .lock_cache_capacity(0)
            .lock_table_shards(1),
    );
    run_workload(&mgr, 1_000);
    assert_eq!(mgr.table_len(), 0);
}

#[test]
fn exclusive_writers_never_overlap() {
    let mgr = LockManager::new(&BackendOptions::new().lock_timeout(Duration::from_secs(30)));
    let target = Dn::parse("uid=counter,dc=example").expect("dn");
    let inside = Arc::new(AtomicU64::new(0));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let mgr = mgr.clone();
            let target = target.clone();
            let inside = Arc::clone(&inside);
            thread::spawn(move || {
                let mut ctx = mgr.context();
                for _ in 0..200 {
                    let lock = mgr.try_write_lock_entry(&mut ctx, &target).expect("write");
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    thread::yield_now();
                    inside.fetch_sub(1, Ordering::SeqCst);
                    drop(lock);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer panicked");
    }
    assert_eq!(mgr.table_len(), 0);
}
