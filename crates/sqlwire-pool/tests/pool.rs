//! Pool and pool-manager behaviour against an in-memory session type.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use sqlwire_core::{Error, PoolErrorKind, Result};
use sqlwire_pool::{ManageConnection, Pool, PoolConfig, PoolManager};

#[derive(Debug)]
struct FakeSession {
    id: usize,
    broken: bool,
}

#[derive(Default)]
struct Counters {
    opened: AtomicUsize,
    closed: AtomicUsize,
    open_ids: Mutex<HashSet<usize>>,
    fail_validation: AtomicBool,
}

#[derive(Clone, Default)]
struct FakeManager {
    counters: Arc<Counters>,
}

impl ManageConnection for FakeManager {
    type Connection = FakeSession;

    fn connect(&self) -> Result<FakeSession> {
        let id = self.counters.opened.fetch_add(1, Ordering::SeqCst);
        self.counters.open_ids.lock().unwrap().insert(id);
        Ok(FakeSession { id, broken: false })
    }

    fn is_valid(&self, _conn: &mut FakeSession) -> Result<()> {
        if self.counters.fail_validation.load(Ordering::SeqCst) {
            Err(Error::protocol("ping failed"))
        } else {
            Ok(())
        }
    }

    fn has_broken(&self, conn: &mut FakeSession) -> bool {
        conn.broken
    }

    fn close(&self, conn: FakeSession) {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        self.counters.open_ids.lock().unwrap().remove(&conn.id);
    }
}

fn pool_with(config: PoolConfig) -> (Pool<FakeManager>, Arc<Counters>) {
    let manager = FakeManager::default();
    let counters = Arc::clone(&manager.counters);
    (Pool::new("test", manager, config), counters)
}

#[test]
fn reuses_released_sessions() {
    let (pool, counters) = pool_with(PoolConfig::new(2));
    let first_id = {
        let conn = pool.get().unwrap();
        conn.id
    };
    let conn = pool.get().unwrap();
    assert_eq!(conn.id, first_id);
    assert_eq!(counters.opened.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().active_connections, 1);
}

#[test]
fn never_hands_out_a_checked_out_session() {
    let (pool, _) = pool_with(PoolConfig::new(4).acquire_timeout(Duration::from_secs(5)));
    let in_use = Arc::new(Mutex::new(HashSet::new()));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let pool = pool.clone();
            let in_use = Arc::clone(&in_use);
            thread::spawn(move || {
                for _ in 0..50 {
                    let conn = pool.get().unwrap();
                    assert!(in_use.lock().unwrap().insert(conn.id), "double checkout");
                    thread::yield_now();
                    assert!(in_use.lock().unwrap().remove(&conn.id));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let stats = pool.stats();
    assert_eq!(stats.active_connections, 0);
    assert!(stats.total_connections() <= 4);
}

#[test]
fn times_out_at_capacity() {
    let (pool, _) = pool_with(PoolConfig::new(1).acquire_timeout(Duration::from_millis(50)));
    let _held = pool.get().unwrap();
    let err = pool.get().unwrap_err();
    assert!(matches!(err, Error::Pool(ref p) if p.kind == PoolErrorKind::Timeout));
}

#[test]
fn waiter_gets_released_session() {
    let (pool, counters) = pool_with(PoolConfig::new(1).acquire_timeout(Duration::from_secs(5)));
    let held = pool.get().unwrap();
    let waiter = {
        let pool = pool.clone();
        thread::spawn(move || pool.get().map(|conn| conn.id))
    };
    thread::sleep(Duration::from_millis(50));
    let id = held.id;
    drop(held);
    assert_eq!(waiter.join().unwrap().unwrap(), id);
    assert_eq!(counters.opened.load(Ordering::SeqCst), 1);
}

#[test]
fn broken_sessions_are_closed_on_release() {
    let (pool, counters) = pool_with(PoolConfig::new(2));
    {
        let mut conn = pool.get().unwrap();
        conn.broken = true;
    }
    assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().idle_connections, 0);
}

#[test]
fn lifetime_exceeded_sessions_are_not_repooled() {
    let (pool, counters) = pool_with(PoolConfig::new(2).max_lifetime(Duration::from_millis(10)));
    let conn = pool.get().unwrap();
    thread::sleep(Duration::from_millis(30));
    drop(conn);
    assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().total_connections(), 0);
}

#[test]
fn idle_sessions_are_swept_and_never_handed_out_after_expiry() {
    let (pool, counters) = pool_with(PoolConfig::new(2).idle_timeout(Duration::from_millis(20)));
    let first_id = pool.get().unwrap().id;
    thread::sleep(Duration::from_millis(40));

    assert_eq!(pool.sweep(), 1);
    assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().idle_connections, 0);

    // An expired session that escaped the sweep is also skipped at checkout.
    let second_id = pool.get().unwrap().id;
    assert_ne!(first_id, second_id);
    thread::sleep(Duration::from_millis(40));
    let third = pool.get().unwrap();
    assert_ne!(third.id, second_id);
    assert_eq!(counters.closed.load(Ordering::SeqCst), 2);
}

#[test]
fn sweep_keeps_minimum_sessions() {
    let (pool, counters) = pool_with(
        PoolConfig::new(4)
            .min_connections(1)
            .idle_timeout(Duration::from_millis(10)),
    );
    let a = pool.get().unwrap();
    let b = pool.get().unwrap();
    drop(a);
    drop(b);
    thread::sleep(Duration::from_millis(30));
    assert_eq!(pool.sweep(), 1);
    assert_eq!(pool.stats().idle_connections, 1);
    assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
}

#[test]
fn failed_validation_opens_a_fresh_session() {
    let (pool, counters) = pool_with(PoolConfig::new(2).test_on_checkout(true));
    let first_id = pool.get().unwrap().id;
    counters.fail_validation.store(true, Ordering::SeqCst);
    let conn = pool.get().unwrap();
    assert_ne!(conn.id, first_id);
    assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
}

#[test]
fn warm_up_opens_minimum() {
    let (pool, counters) = pool_with(PoolConfig::new(4).min_connections(3));
    pool.warm_up().unwrap();
    assert_eq!(pool.stats().idle_connections, 3);
    assert_eq!(counters.opened.load(Ordering::SeqCst), 3);
}

#[test]
fn manager_creates_one_pool_per_key() {
    let manager: PoolManager<FakeManager> = PoolManager::new();
    let make = || (FakeManager::default(), PoolConfig::new(2));
    let a = manager.get_pool("a", make);
    let again = manager.get_pool("a", || panic!("pool must be reused"));
    let _b = manager.get_pool("b", make);

    assert_eq!(manager.pool_count(), 2);
    let id = a.get().unwrap().id;
    assert_eq!(again.get().unwrap().id, id);
}

#[test]
fn clear_all_pools_closes_idle_and_empties_map() {
    let manager: PoolManager<FakeManager> = PoolManager::new();
    let fake = FakeManager::default();
    let counters = Arc::clone(&fake.counters);
    let pool = manager.get_pool("key", || (fake, PoolConfig::new(3)));

    let idle1 = pool.get().unwrap();
    let idle2 = pool.get().unwrap();
    let checked_out = pool.get().unwrap();
    drop(idle1);
    drop(idle2);
    assert_eq!(pool.stats().idle_connections, 2);

    manager.clear_all_pools();
    assert_eq!(manager.pool_count(), 0);
    assert_eq!(counters.closed.load(Ordering::SeqCst), 2);
    assert!(pool.is_cleared());

    // In-flight session is closed, not re-pooled, when it comes back.
    drop(checked_out);
    assert_eq!(counters.closed.load(Ordering::SeqCst), 3);
    assert!(counters.open_ids.lock().unwrap().is_empty());
    assert!(matches!(pool.get(), Err(Error::Pool(p)) if p.kind == PoolErrorKind::Closed));
}

#[test]
fn clear_pool_only_touches_one_key() {
    let manager: PoolManager<FakeManager> = PoolManager::new();
    let make = || (FakeManager::default(), PoolConfig::new(2));
    manager.get_pool("a", make);
    manager.get_pool("b", make);
    assert!(manager.clear_pool("a"));
    assert!(!manager.clear_pool("a"));
    assert!(manager.find_pool("a").is_none());
    assert!(manager.find_pool("b").is_some());
}

#[test]
fn background_sweeper_evicts_idle_sessions() {
    let manager: PoolManager<FakeManager> =
        PoolManager::with_sweep_interval(Duration::from_millis(20));
    let fake = FakeManager::default();
    let counters = Arc::clone(&fake.counters);
    let pool = manager.get_pool("key", || {
        (fake, PoolConfig::new(2).idle_timeout(Duration::from_millis(10)))
    });
    drop(pool.get().unwrap());

    for _ in 0..100 {
        if counters.closed.load(Ordering::SeqCst) == 1 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
}

#[test]
fn shutdown_guard_clears_pools() {
    let manager: PoolManager<FakeManager> = PoolManager::new();
    let fake = FakeManager::default();
    let counters = Arc::clone(&fake.counters);
    {
        let _guard = manager.shutdown_guard();
        let pool = manager.get_pool("key", || (fake, PoolConfig::new(2)));
        drop(pool.get().unwrap());
    }
    assert_eq!(manager.pool_count(), 0);
    assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
}

/// Panics when asked to close a session.
#[derive(Clone, Default)]
struct PanickingCloseManager {
    closing: Arc<AtomicBool>,
}

impl ManageConnection for PanickingCloseManager {
    type Connection = FakeSession;

    fn connect(&self) -> Result<FakeSession> {
        Ok(FakeSession {
            id: 0,
            broken: false,
        })
    }

    fn is_valid(&self, _conn: &mut FakeSession) -> Result<()> {
        Ok(())
    }

    fn has_broken(&self, _conn: &mut FakeSession) -> bool {
        false
    }

    fn close(&self, _conn: FakeSession) {
        self.closing.store(true, Ordering::SeqCst);
        panic!("close failed");
    }
}

#[test]
fn dropping_manager_survives_panicked_sweeper() {
    let manager: PoolManager<PanickingCloseManager> =
        PoolManager::with_sweep_interval(Duration::from_millis(20));
    let fake = PanickingCloseManager::default();
    let closing = Arc::clone(&fake.closing);
    let pool = manager.get_pool("key", || {
        (fake, PoolConfig::new(2).idle_timeout(Duration::from_millis(10)))
    });
    drop(pool.get().unwrap());
    drop(pool);

    for _ in 0..100 {
        if closing.load(Ordering::SeqCst) {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert!(closing.load(Ordering::SeqCst));
    drop(manager);
}
