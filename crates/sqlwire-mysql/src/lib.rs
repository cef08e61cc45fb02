//! Blocking MySQL client protocol driver.
//!
//! This crate speaks the MySQL client/server protocol directly over
//! `std::net` sockets. It provides:
//!
//! - Packet framing with sequence numbers, and the zlib-compressed envelope
//! - Authentication (native, caching_sha2, sha256, cleartext, Windows
//!   integrated through a caller-supplied provider), TLS via rustls
//! - Text and binary (prepared statement) result sets, multiple results,
//!   LOCAL INFILE uploads
//! - Per-command time budgets enforced with `KILL QUERY`
//! - Pools keyed by normalized configuration
//!
//! # MySQL Protocol Overview
//!
//! MySQL uses a packet-based protocol with:
//! - 3-byte payload length + 1-byte sequence number header
//! - Packets over 16MB are split
//! - Request/response pairing via sequence numbers
//!
//! # Example
//!
//! ```rust,ignore
//! use sqlwire_mysql::{MySqlConfig, MySqlConnection};
//!
//! let config = MySqlConfig::new()
//!     .host("localhost")
//!     .port(3306)
//!     .user("root")
//!     .database("mydb");
//!
//! let mut conn = MySqlConnection::connect(config)?;
//! for row in conn.query("SELECT id, name FROM users")? {
//!     println!("{:?}", row.get_named::<String>("name")?);
//! }
//! ```

pub mod auth;
pub mod charset;
pub mod config;
pub mod connection;
pub mod handshake;
pub mod pool;
pub mod protocol;
pub mod resultset;
pub mod tls;
pub mod transport;
pub mod types;

pub use auth::{AuthPlugin, IntegratedAuthProvider};
pub use config::{MySqlConfig, SslMode, TlsConfig};
pub use connection::{ConnectionState, MySqlConnection};
pub use pool::{
    MySqlConnectionManager, MySqlSession, clear_all_pools, clear_pool, get_connection,
    shutdown_guard,
};
pub use protocol::PreparedStatement;
pub use resultset::ResultSet;
pub use types::{ColumnDef, ColumnPolicy, EffectiveType, FieldType};
