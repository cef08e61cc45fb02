//! Connection pooling for sqlwire.
//!
//! A [`Pool`] owns the idle sessions for one connection configuration and
//! counts the ones checked out. A [`PoolManager`] maps normalized
//! configuration keys to pools, runs a background sweep that closes idle
//! sessions past their idle timeout, and can clear one or all pools.
//!
//! Sessions are opened, validated and closed through [`ManageConnection`],
//! which the database driver implements.

pub mod config;
pub mod manager;
pub mod pool;

pub use config::PoolConfig;
pub use manager::{DEFAULT_SWEEP_INTERVAL, PoolManager, ShutdownGuard};
pub use pool::{ManageConnection, Pool, PoolStats, PooledConnection};
