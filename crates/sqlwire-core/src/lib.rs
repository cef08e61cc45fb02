//! Core types shared by the sqlwire crates.
//!
//! - `Value`: dynamically typed SQL value covering every MySQL wire type
//! - `Row` / `ColumnInfo`: decoded rows with shared column metadata
//! - `Error`: error taxonomy with fatal/recoverable classification

pub mod error;
pub mod row;
pub mod value;

pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, PoolError, PoolErrorKind,
    ProtocolError, QueryError, QueryErrorKind, Result, TypeError,
};
pub use row::{ColumnInfo, FromValue, Row};
pub use value::Value;
