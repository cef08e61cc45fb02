//! A blocking pool of sessions for one connection configuration.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use sqlwire_core::error::{PoolError, PoolErrorKind};
use sqlwire_core::{Error, Result};

use crate::config::PoolConfig;

/// Opens, checks and closes the sessions a [`Pool`] manages.
///
/// The pool never classifies errors itself: a session is dropped from the
/// pool exactly when [`ManageConnection::has_broken`] says so.
pub trait ManageConnection: Send + Sync + 'static {
    /// The session type handed out by the pool.
    type Connection: Send + 'static;

    /// Open a new physical session.
    #[allow(clippy::result_large_err)]
    fn connect(&self) -> Result<Self::Connection>;

    /// Check an idle session before it is handed out (e.g. a ping).
    #[allow(clippy::result_large_err)]
    fn is_valid(&self, conn: &mut Self::Connection) -> Result<()>;

    /// Has the session hit a fatal error?
    fn has_broken(&self, conn: &mut Self::Connection) -> bool;

    /// Reset session state before the session goes back to the idle set.
    #[allow(clippy::result_large_err)]
    fn reset(&self, _conn: &mut Self::Connection) -> Result<()> {
        Ok(())
    }

    /// Physically close the session.
    fn close(&self, conn: Self::Connection);
}

/// Pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of idle connections
    pub idle_connections: usize,
    /// Number of checked-out connections (including ones being opened)
    pub active_connections: usize,
    /// Number of callers waiting for a connection
    pub pending_requests: usize,
}

impl PoolStats {
    pub fn total_connections(&self) -> usize {
        self.idle_connections + self.active_connections
    }
}

struct Slot<C> {
    conn: C,
    created_at: Instant,
}

struct IdleSlot<C> {
    slot: Slot<C>,
    idle_since: Instant,
}

struct PoolState<C> {
    idle: VecDeque<IdleSlot<C>>,
    active: usize,
    waiting: usize,
    clearing: bool,
}

pub(crate) struct PoolInner<M: ManageConnection> {
    key: String,
    manager: M,
    config: PoolConfig,
    state: Mutex<PoolState<M::Connection>>,
    available: Condvar,
}

/// A pool of sessions opened from one configuration.
///
/// Cloning a `Pool` is cheap and yields a handle to the same pool.
pub struct Pool<M: ManageConnection> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ManageConnection> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: ManageConnection> std::fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("key", &self.inner.key)
            .field("stats", &self.stats())
            .finish()
    }
}

fn expired(since: Instant, limit: Option<Duration>, now: Instant) -> bool {
    limit.is_some_and(|limit| now.saturating_duration_since(since) >= limit)
}

impl<M: ManageConnection> PoolInner<M> {
    fn lock(&self) -> MutexGuard<'_, PoolState<M::Connection>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn discard(&self, slot: Slot<M::Connection>, reason: &'static str) {
        tracing::debug!(pool = %self.key, reason, "closing pooled session");
        self.manager.close(slot.conn);
    }

    fn release(&self, mut slot: Slot<M::Connection>) {
        let now = Instant::now();
        let mut reason = if self.manager.has_broken(&mut slot.conn) {
            Some("broken")
        } else if expired(slot.created_at, self.config.max_lifetime, now) {
            Some("lifetime exceeded")
        } else {
            None
        };

        if reason.is_none() && self.config.reset_on_release {
            if let Err(e) = self.manager.reset(&mut slot.conn) {
                tracing::debug!(pool = %self.key, error = %e, "session reset failed");
                reason = Some("reset failed");
            }
        }

        let mut state = self.lock();
        state.active = state.active.saturating_sub(1);
        if state.clearing {
            reason = Some("pool cleared");
        }
        match reason {
            Some(reason) => {
                drop(state);
                self.available.notify_one();
                self.discard(slot, reason);
            }
            None => {
                state.idle.push_back(IdleSlot {
                    slot,
                    idle_since: now,
                });
                drop(state);
                self.available.notify_one();
            }
        }
    }
}

impl<M: ManageConnection> Pool<M> {
    /// Create a new, empty pool. Sessions are opened on demand.
    pub fn new(key: impl Into<String>, manager: M, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                key: key.into(),
                manager,
                config,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    active: 0,
                    waiting: 0,
                    clearing: false,
                }),
                available: Condvar::new(),
            }),
        }
    }

    /// The key this pool was registered under.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Get the connection manager.
    pub fn manager(&self) -> &M {
        &self.inner.manager
    }

    /// Get the current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        PoolStats {
            idle_connections: state.idle.len(),
            active_connections: state.active,
            pending_requests: state.waiting,
        }
    }

    /// Has this pool been cleared?
    pub fn is_cleared(&self) -> bool {
        self.inner.lock().clearing
    }

    /// Check out a session, waiting up to the acquire timeout when the
    /// pool is at capacity.
    #[allow(clippy::result_large_err)]
    pub fn get(&self) -> Result<PooledConnection<M>> {
        let inner = &self.inner;
        let deadline = Instant::now() + inner.config.acquire_timeout;
        let mut state = inner.lock();

        loop {
            if state.clearing {
                return Err(closed_error(&inner.key));
            }

            // Most recently used first, so surplus sessions age out.
            if let Some(idle) = state.idle.pop_back() {
                state.active += 1;
                drop(state);

                let now = Instant::now();
                let IdleSlot {
                    mut slot,
                    idle_since,
                } = idle;
                let stale = expired(idle_since, Some(inner.config.idle_timeout), now)
                    || expired(slot.created_at, inner.config.max_lifetime, now);
                let usable = !stale
                    && (!inner.config.test_on_checkout
                        || inner.manager.is_valid(&mut slot.conn).is_ok());

                if usable {
                    return Ok(PooledConnection {
                        slot: Some(slot),
                        pool: Arc::clone(inner),
                    });
                }

                inner.discard(slot, if stale { "expired" } else { "failed validation" });
                state = inner.lock();
                state.active -= 1;
                continue;
            }

            if state.active + state.idle.len() < inner.config.max_connections {
                state.active += 1;
                drop(state);
                return match inner.manager.connect() {
                    Ok(conn) => {
                        tracing::debug!(pool = %inner.key, "opened pooled session");
                        Ok(PooledConnection {
                            slot: Some(Slot {
                                conn,
                                created_at: Instant::now(),
                            }),
                            pool: Arc::clone(inner),
                        })
                    }
                    Err(e) => {
                        inner.lock().active -= 1;
                        inner.available.notify_one();
                        Err(e)
                    }
                };
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Pool(PoolError {
                    kind: PoolErrorKind::Timeout,
                    message: format!(
                        "timed out after {:?} waiting for a session from pool '{}' ({} in use)",
                        inner.config.acquire_timeout, inner.key, state.active
                    ),
                    source: None,
                }));
            }

            state.waiting += 1;
            let (guard, _) = inner
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
            state.waiting -= 1;
        }
    }

    /// Open sessions until the idle set holds `min_connections`.
    #[allow(clippy::result_large_err)]
    pub fn warm_up(&self) -> Result<()> {
        let inner = &self.inner;
        loop {
            {
                let mut state = inner.lock();
                let total = state.active + state.idle.len();
                if state.clearing || total >= inner.config.min_connections {
                    return Ok(());
                }
                state.active += 1;
            }
            let opened = inner.manager.connect();
            let mut state = inner.lock();
            state.active -= 1;
            let conn = opened?;
            let now = Instant::now();
            state.idle.push_back(IdleSlot {
                slot: Slot {
                    conn,
                    created_at: now,
                },
                idle_since: now,
            });
            drop(state);
            inner.available.notify_one();
        }
    }

    /// Close idle sessions that exceeded the idle timeout or their lifetime.
    ///
    /// Idle-timeout eviction stops at `min_connections`; lifetime eviction
    /// does not. Returns the number of sessions closed.
    pub fn sweep(&self) -> usize {
        let inner = &self.inner;
        let now = Instant::now();
        let mut evicted = Vec::new();
        {
            let mut state = inner.lock();
            let total = state.active + state.idle.len();
            let mut surplus = total.saturating_sub(inner.config.min_connections);
            let mut kept = VecDeque::with_capacity(state.idle.len());
            for idle in state.idle.drain(..) {
                let over_lifetime = expired(idle.slot.created_at, inner.config.max_lifetime, now);
                let over_idle =
                    surplus > 0 && expired(idle.idle_since, Some(inner.config.idle_timeout), now);
                if over_lifetime || over_idle {
                    surplus = surplus.saturating_sub(1);
                    evicted.push(idle.slot);
                } else {
                    kept.push_back(idle);
                }
            }
            state.idle = kept;
        }

        let count = evicted.len();
        for slot in evicted {
            inner.discard(slot, "idle timeout");
        }
        if count > 0 {
            inner.available.notify_all();
            tracing::debug!(pool = %inner.key, closed = count, "swept idle sessions");
        }
        count
    }

    /// Mark the pool as clearing and close every idle session.
    ///
    /// Sessions currently checked out are closed when they are released.
    pub fn clear(&self) {
        let idle: Vec<_> = {
            let mut state = self.inner.lock();
            state.clearing = true;
            state.idle.drain(..).collect()
        };
        self.inner.available.notify_all();
        tracing::debug!(pool = %self.inner.key, idle = idle.len(), "clearing pool");
        for idle in idle {
            self.inner.discard(idle.slot, "pool cleared");
        }
    }
}

fn closed_error(key: &str) -> Error {
    Error::Pool(PoolError {
        kind: PoolErrorKind::Closed,
        message: format!("pool '{}' has been cleared", key),
        source: None,
    })
}

/// A session checked out of a [`Pool`]. Returned to the pool on drop.
pub struct PooledConnection<M: ManageConnection> {
    slot: Option<Slot<M::Connection>>,
    pool: Arc<PoolInner<M>>,
}

impl<M: ManageConnection> PooledConnection<M> {
    /// Key of the pool this session belongs to.
    pub fn pool_key(&self) -> &str {
        &self.pool.key
    }

    /// Close the session instead of returning it to the pool.
    pub fn discard(mut self) {
        if let Some(slot) = self.slot.take() {
            {
                let mut state = self.pool.lock();
                state.active = state.active.saturating_sub(1);
            }
            self.pool.available.notify_one();
            self.pool.discard(slot, "discarded by caller");
        }
    }
}

impl<M: ManageConnection> std::fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool.key)
            .finish_non_exhaustive()
    }
}

impl<M: ManageConnection> std::ops::Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        match &self.slot {
            Some(slot) => &slot.conn,
            None => unreachable!("pooled session accessed after release"),
        }
    }
}

impl<M: ManageConnection> std::ops::DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.slot {
            Some(slot) => &mut slot.conn,
            None => unreachable!("pooled session accessed after release"),
        }
    }
}

impl<M: ManageConnection> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.release(slot);
        }
    }
}
