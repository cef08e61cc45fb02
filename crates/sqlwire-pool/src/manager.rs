//! Keyed registry of pools with a background idle sweeper.

use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::PoolConfig;
use crate::pool::{ManageConnection, Pool};

/// Default interval between idle sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(180);

struct Registry<M: ManageConnection> {
    pools: Mutex<HashMap<String, Pool<M>>>,
}

impl<M: ManageConnection> Registry<M> {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Pool<M>>> {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> Vec<Pool<M>> {
        self.lock().values().cloned().collect()
    }
}

struct Sweeper {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    fn spawn<M: ManageConnection>(registry: Weak<Registry<M>>, interval: Duration) -> Option<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let spawned = thread::Builder::new()
            .name("sqlwire-pool-sweeper".to_string())
            .spawn(move || {
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    let Some(registry) = registry.upgrade() else {
                        break;
                    };
                    for pool in registry.snapshot() {
                        pool.sweep();
                    }
                }
                tracing::trace!("pool sweeper stopped");
            });

        match spawned {
            Ok(handle) => Some(Self {
                stop: Some(stop),
                handle: Some(handle),
            }),
            Err(e) => {
                tracing::warn!(error = %e, "failed to start pool sweeper; idle sessions will not expire");
                None
            }
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("pool sweeper thread panicked");
            }
        }
    }
}

/// A map from normalized configuration key to [`Pool`].
///
/// Structural changes to the map happen under one lock; sessions are never
/// opened or closed while that lock is held.
pub struct PoolManager<M: ManageConnection> {
    registry: Arc<Registry<M>>,
    sweep_interval: Duration,
    sweeper: Mutex<Option<Sweeper>>,
}

impl<M: ManageConnection> Default for PoolManager<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: ManageConnection> PoolManager<M> {
    pub fn new() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }

    /// Create a manager whose sweeper runs at the given interval.
    pub fn with_sweep_interval(sweep_interval: Duration) -> Self {
        Self {
            registry: Arc::new(Registry {
                pools: Mutex::new(HashMap::new()),
            }),
            sweep_interval,
            sweeper: Mutex::new(None),
        }
    }

    /// Return the pool registered under `key`, creating it on first use.
    ///
    /// `make` is only called when the pool does not exist yet. A new pool is
    /// warmed up to its minimum size outside the map lock.
    pub fn get_pool<F>(&self, key: &str, make: F) -> Pool<M>
    where
        F: FnOnce() -> (M, PoolConfig),
    {
        let created = {
            let mut pools = self.registry.lock();
            if let Some(pool) = pools.get(key) {
                return pool.clone();
            }
            let (manager, config) = make();
            let pool = Pool::new(key, manager, config);
            pools.insert(key.to_string(), pool.clone());
            pool
        };

        tracing::info!(
            pool = %key,
            max = created.config().max_connections,
            "created connection pool"
        );
        self.ensure_sweeper();
        if let Err(e) = created.warm_up() {
            tracing::warn!(pool = %key, error = %e, "failed to open minimum pool sessions");
        }
        created
    }

    /// Look up an existing pool.
    pub fn find_pool(&self, key: &str) -> Option<Pool<M>> {
        self.registry.lock().get(key).cloned()
    }

    /// Number of live pools.
    pub fn pool_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Remove the pool for `key` and close its idle sessions.
    ///
    /// Sessions currently checked out are closed on release. Returns
    /// `false` when no such pool exists.
    pub fn clear_pool(&self, key: &str) -> bool {
        let removed = self.registry.lock().remove(key);
        match removed {
            Some(pool) => {
                pool.clear();
                true
            }
            None => false,
        }
    }

    /// Remove every pool and close all idle sessions.
    pub fn clear_all_pools(&self) {
        let pools: Vec<Pool<M>> = self.registry.lock().drain().map(|(_, pool)| pool).collect();
        if !pools.is_empty() {
            tracing::debug!(pools = pools.len(), "clearing all pools");
        }
        for pool in pools {
            pool.clear();
        }
    }

    /// Run one sweep over every pool now.
    pub fn sweep_now(&self) -> usize {
        self.registry.snapshot().iter().map(Pool::sweep).sum()
    }

    /// Guard that clears every pool when dropped.
    ///
    /// Hold one in `main` so pooled sessions are closed at process exit.
    pub fn shutdown_guard(&self) -> ShutdownGuard<'_, M> {
        ShutdownGuard { manager: self }
    }

    fn ensure_sweeper(&self) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.is_none() {
            *sweeper = Sweeper::spawn(Arc::downgrade(&self.registry), self.sweep_interval);
        }
    }
}

/// Clears all pools of a [`PoolManager`] on drop.
#[must_use = "pools are cleared when the guard is dropped"]
pub struct ShutdownGuard<'a, M: ManageConnection> {
    manager: &'a PoolManager<M>,
}

impl<M: ManageConnection> Drop for ShutdownGuard<'_, M> {
    fn drop(&mut self) {
        self.manager.clear_all_pools();
    }
}
