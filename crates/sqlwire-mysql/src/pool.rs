//! Process-wide session pools keyed by normalized configuration.
//!
//! [`get_connection`] hands out a pooled session when `pooling` is on and
//! opens a dedicated one otherwise. Pools share one [`PoolManager`], whose
//! sweeper closes sessions idle past their timeout.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, LazyLock};

use sqlwire_core::Result;
use sqlwire_pool::{ManageConnection, PoolManager, PoolStats, PooledConnection, ShutdownGuard};

use crate::charset::ServerCharsetCache;
use crate::config::MySqlConfig;
use crate::connection::MySqlConnection;

static POOLS: LazyLock<PoolManager<MySqlConnectionManager>> = LazyLock::new(PoolManager::new);

/// Opens and vets MySQL sessions for one pool.
#[derive(Debug)]
pub struct MySqlConnectionManager {
    config: MySqlConfig,
    charsets: Arc<ServerCharsetCache>,
}

impl MySqlConnectionManager {
    pub fn new(config: MySqlConfig) -> Self {
        Self {
            config,
            charsets: Arc::new(ServerCharsetCache::new()),
        }
    }

    pub fn config(&self) -> &MySqlConfig {
        &self.config
    }
}

impl ManageConnection for MySqlConnectionManager {
    type Connection = MySqlConnection;

    fn connect(&self) -> Result<MySqlConnection> {
        MySqlConnection::connect_with_charsets(self.config.clone(), Arc::clone(&self.charsets))
    }

    fn is_valid(&self, conn: &mut MySqlConnection) -> Result<()> {
        conn.ping()
    }

    /// Also finishes any statement the caller left unread; a session that
    /// cannot be brought back to idle counts as broken.
    fn has_broken(&self, conn: &mut MySqlConnection) -> bool {
        if !conn.is_broken() && !conn.is_ready() {
            if let Err(err) = conn.finish_statement() {
                tracing::debug!(error = %err, "could not finish statement on release");
                return true;
            }
        }
        conn.is_broken()
    }

    fn reset(&self, conn: &mut MySqlConnection) -> Result<()> {
        conn.reset()
    }

    fn close(&self, conn: MySqlConnection) {
        if let Err(err) = conn.close() {
            tracing::debug!(error = %err, "error closing pooled session");
        }
    }
}

/// A session from [`get_connection`].
#[derive(Debug)]
pub enum MySqlSession {
    Pooled(PooledConnection<MySqlConnectionManager>),
    Direct(MySqlConnection),
}

impl MySqlSession {
    pub fn is_pooled(&self) -> bool {
        matches!(self, MySqlSession::Pooled(_))
    }

    /// Close the session instead of returning it to its pool.
    #[allow(clippy::result_large_err)]
    pub fn close(self) -> Result<()> {
        match self {
            MySqlSession::Pooled(conn) => {
                conn.discard();
                Ok(())
            }
            MySqlSession::Direct(conn) => conn.close(),
        }
    }
}

impl Deref for MySqlSession {
    type Target = MySqlConnection;

    fn deref(&self) -> &MySqlConnection {
        match self {
            MySqlSession::Pooled(conn) => &**conn,
            MySqlSession::Direct(conn) => conn,
        }
    }
}

impl DerefMut for MySqlSession {
    fn deref_mut(&mut self) -> &mut MySqlConnection {
        match self {
            MySqlSession::Pooled(conn) => &mut **conn,
            MySqlSession::Direct(conn) => conn,
        }
    }
}

/// Get a session for `config`: from its pool when pooling is enabled,
/// freshly opened otherwise.
#[allow(clippy::result_large_err)]
pub fn get_connection(config: &MySqlConfig) -> Result<MySqlSession> {
    if !config.pooling {
        return MySqlConnection::connect(config.clone()).map(MySqlSession::Direct);
    }
    config.validate()?;
    let key = config.pool_key();
    let pool = POOLS.get_pool(&key, || {
        (
            MySqlConnectionManager::new(config.clone()),
            config.pool.clone(),
        )
    });
    pool.get().map(MySqlSession::Pooled)
}

/// Close the idle sessions of `config`'s pool and forget it. Sessions in
/// use are closed when returned.
pub fn clear_pool(config: &MySqlConfig) -> bool {
    POOLS.clear_pool(&config.pool_key())
}

pub fn clear_all_pools() {
    POOLS.clear_all_pools();
}

/// Statistics for `config`'s pool, if it exists.
pub fn pool_stats(config: &MySqlConfig) -> Option<PoolStats> {
    POOLS.find_pool(&config.pool_key()).map(|pool| pool.stats())
}

pub fn pool_count() -> usize {
    POOLS.pool_count()
}

/// Clears every pool when dropped; hold one in `main`.
pub fn shutdown_guard() -> ShutdownGuard<'static, MySqlConnectionManager> {
    POOLS.shutdown_guard()
}
