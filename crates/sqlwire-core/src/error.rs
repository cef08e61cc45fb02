//! Error types for sqlwire operations.

use std::fmt;

/// The primary error type for all sqlwire operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, authenticate, disconnect)
    Connection(ConnectionError),
    /// Errors reported by the server for a statement
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Protocol errors (wire-level desync or malformed packets)
    Protocol(ProtocolError),
    /// Pool errors
    Pool(PoolError),
    /// Configuration errors, raised before any I/O
    Config(ConfigError),
    /// API misuse, such as a second statement while a result is still open
    Usage(String),
    /// I/O errors
    Io(std::io::Error),
    /// The command exceeded its time budget; the session is still usable
    Timeout,
    /// Operation was cancelled
    Cancelled,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Authentication failed
    Authentication,
    /// The account password has expired
    PasswordExpired,
    /// Connection lost or aborted during operation
    Disconnected,
    /// SSL/TLS negotiation failed
    Ssl,
    /// Connection refused
    Refused,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    /// Server error code (e.g. 1062 for a duplicate key)
    pub code: Option<u16>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Permission denied
    Permission,
    /// Deadlock detected
    Deadlock,
    /// Statement interrupted by the server (KILL QUERY, max_execution_time)
    Interrupted,
    /// Password must be changed before the statement is allowed
    PasswordExpired,
    /// Connection-level condition: the session cannot be reused
    Fatal,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct ProtocolError {
    pub message: String,
    pub raw_data: Option<Vec<u8>>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// Connection checkout timeout
    Timeout,
    /// Pool has been cleared or shut down
    Closed,
    /// Configuration error
    Config,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Build a configuration error from a message.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
            source: None,
        })
    }

    /// Build a protocol error from a message.
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(ProtocolError {
            message: message.into(),
            raw_data: None,
            source: None,
        })
    }

    /// Build a connection error of the given kind.
    pub fn connection(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        Error::Connection(ConnectionError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    /// Is this a retryable error (deadlock, pool timeout, command timeout)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(q.kind, QueryErrorKind::Deadlock),
            Error::Pool(p) => matches!(p.kind, PoolErrorKind::Timeout),
            Error::Timeout => true,
            _ => false,
        }
    }

    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::Protocol(_) | Error::Io(_)
        )
    }

    /// Does this error leave the session unusable?
    ///
    /// Fatal errors force the session out of its pool and close the
    /// transport. Statement-level server errors, usage errors and a drained
    /// timeout are recoverable.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Query(q) => q.kind == QueryErrorKind::Fatal,
            other => other.is_connection_error(),
        }
    }

    /// Get the server error code if available (e.g. 1062 for duplicate key)
    pub fn server_code(&self) -> Option<u16> {
        match self {
            Error::Query(q) => q.code,
            _ => None,
        }
    }

    /// Get SQLSTATE if available (e.g., "23000" for integrity violations)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }
}

impl QueryError {
    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        self.code == Some(1062)
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        matches!(self.code, Some(1451 | 1452))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => match (e.code, &e.sqlstate) {
                (Some(code), Some(state)) => {
                    write!(f, "Query error {} (SQLSTATE {}): {}", code, state, e.message)
                }
                (Some(code), None) => write!(f, "Query error {}: {}", code, e.message),
                _ => write!(f, "Query error: {}", e.message),
            },
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Pool(e) => write!(f, "Pool error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Usage(msg) => write!(f, "Usage error: {}", msg),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Cancelled => write!(f, "Operation cancelled"),
        }
    }
}

fn boxed_source<'a>(
    source: Option<&'a (dyn std::error::Error + Send + Sync + 'static)>,
) -> Option<&'a (dyn std::error::Error + 'static)> {
    source.map(|err| err as &(dyn std::error::Error + 'static))
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => boxed_source(e.source.as_deref()),
            Error::Query(e) => boxed_source(e.source.as_deref()),
            Error::Protocol(e) => boxed_source(e.source.as_deref()),
            Error::Pool(e) => boxed_source(e.source.as_deref()),
            Error::Config(e) => boxed_source(e.source.as_deref()),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        Error::Pool(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for sqlwire operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn server_error(kind: QueryErrorKind, code: u16) -> QueryError {
        QueryError {
            kind,
            sql: Some("SELECT 1".to_string()),
            code: Some(code),
            sqlstate: Some("23000".to_string()),
            message: "server said no".to_string(),
            source: None,
        }
    }

    #[test]
    fn test_source_chain() {
        use std::error::Error as _;

        let mut query = server_error(QueryErrorKind::Syntax, 1064);
        query.source = Some(Box::new(std::io::Error::other("socket gone")));
        let err = Error::Query(query);
        assert_eq!(err.source().map(ToString::to_string).as_deref(), Some("socket gone"));

        assert!(Error::Timeout.source().is_none());
        assert!(Error::Query(server_error(QueryErrorKind::Syntax, 1064)).source().is_none());
    }

    #[test]
    fn server_code_helpers() {
        let query = server_error(QueryErrorKind::Constraint, 1062);
        assert!(query.is_unique_violation());
        assert!(!query.is_foreign_key_violation());

        let err = Error::Query(query);
        assert_eq!(err.sqlstate(), Some("23000"));
        assert_eq!(err.server_code(), Some(1062));
        assert_eq!(err.sql(), Some("SELECT 1"));
        assert_eq!(
            err.to_string(),
            "Query error 1062 (SQLSTATE 23000): server said no"
        );
    }

    #[test]
    fn fatal_classification() {
        assert!(!Error::Query(server_error(QueryErrorKind::Syntax, 1064)).is_fatal());
        assert!(Error::Query(server_error(QueryErrorKind::Fatal, 2013)).is_fatal());
        assert!(Error::protocol("packet out of order").is_fatal());
        assert!(Error::Io(std::io::Error::other("reset")).is_fatal());
        assert!(!Error::Timeout.is_fatal());
        assert!(!Error::Usage("cursor open".into()).is_fatal());
        assert!(!Error::config("bad option").is_fatal());
    }

    #[test]
    fn retryable_flags() {
        let deadlock = Error::Query(server_error(QueryErrorKind::Deadlock, 1213));
        let pool_timeout = Error::Pool(PoolError {
            kind: PoolErrorKind::Timeout,
            message: "timed out waiting".to_string(),
            source: None,
        });
        assert!(deadlock.is_retryable());
        assert!(pool_timeout.is_retryable());
        assert!(Error::Timeout.is_retryable());

        let lost = Error::connection(ConnectionErrorKind::Disconnected, "lost connection");
        assert!(lost.is_connection_error());
        assert!(!lost.is_retryable());
    }
}
