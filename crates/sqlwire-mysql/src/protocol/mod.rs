//! MySQL wire protocol implementation.
//!
//! MySQL packets have a 4-byte header:
//! - 3 bytes: payload length (little-endian)
//! - 1 byte: sequence number
//!
//! Maximum packet payload is 2^24 - 1 (16MB - 1). Larger payloads
//! are split into multiple packets.

pub mod compress;
pub mod framing;
pub mod prepared;
pub mod reader;
pub mod writer;

pub use framing::PacketStream;
pub use prepared::{
    PreparedStatement, StmtPrepareOk, build_stmt_close_packet, build_stmt_execute_packet,
    build_stmt_prepare_packet, parse_stmt_prepare_ok,
};
pub use reader::{LenEnc, PacketReader};
pub use writer::PacketWriter;

use sqlwire_core::error::{QueryError, QueryErrorKind};
use sqlwire_core::Error;

/// Maximum payload size for a single MySQL packet (2^24 - 1 bytes).
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// MySQL capability flags (client and server).
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_NO_SCHEMA: u32 = 1 << 4;
    pub const CLIENT_COMPRESS: u32 = 1 << 5;
    pub const CLIENT_ODBC: u32 = 1 << 6;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_IGNORE_SPACE: u32 = 1 << 8;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_INTERACTIVE: u32 = 1 << 10;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_IGNORE_SIGPIPE: u32 = 1 << 12;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
    pub const CLIENT_RESERVED: u32 = 1 << 14;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS: u32 = 1 << 22;
    pub const CLIENT_SESSION_TRACK: u32 = 1 << 23;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Capabilities requested on every connection, before configuration
    /// and the server's offer are applied.
    pub const DEFAULT_CLIENT_FLAGS: u32 = CLIENT_PROTOCOL_41
        | CLIENT_SECURE_CONNECTION
        | CLIENT_LONG_PASSWORD
        | CLIENT_LONG_FLAG
        | CLIENT_TRANSACTIONS
        | CLIENT_MULTI_RESULTS
        | CLIENT_PS_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
        | CLIENT_DEPRECATE_EOF;
}

/// MySQL command codes (COM_xxx).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Quit connection
    Quit = 0x01,
    /// Switch database
    InitDb = 0x02,
    /// Text protocol query
    Query = 0x03,
    /// Kill a connection or query (superseded by `KILL QUERY`)
    ProcessKill = 0x0c,
    /// Ping server
    Ping = 0x0e,
    /// Change user (re-authenticate)
    ChangeUser = 0x11,
    /// Prepare statement
    StmtPrepare = 0x16,
    /// Execute prepared statement
    StmtExecute = 0x17,
    /// Close prepared statement
    StmtClose = 0x19,
    /// Reset prepared statement
    StmtReset = 0x1a,
    /// Reset connection
    ResetConnection = 0x1f,
}

/// MySQL server status flags.
#[allow(dead_code)]
pub mod server_status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    /// Pre-4.1 "more results" bit.
    pub const SERVER_STATUS_MORE_RESULTS: u16 = 0x0004;
    /// Another result follows the current one ("another query pending").
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
    pub const SERVER_STATUS_NO_GOOD_INDEX_USED: u16 = 0x0010;
    pub const SERVER_STATUS_NO_INDEX_USED: u16 = 0x0020;
    pub const SERVER_STATUS_CURSOR_EXISTS: u16 = 0x0040;
    pub const SERVER_STATUS_LAST_ROW_SENT: u16 = 0x0080;
    pub const SERVER_STATUS_DB_DROPPED: u16 = 0x0100;
    pub const SERVER_STATUS_NO_BACKSLASH_ESCAPES: u16 = 0x0200;
    pub const SERVER_STATUS_METADATA_CHANGED: u16 = 0x0400;
    pub const SERVER_QUERY_WAS_SLOW: u16 = 0x0800;
    pub const SERVER_PS_OUT_PARAMS: u16 = 0x1000;
    pub const SERVER_STATUS_IN_TRANS_READONLY: u16 = 0x2000;
    pub const SERVER_SESSION_STATE_CHANGED: u16 = 0x4000;
}

/// Server error codes the driver reacts to.
pub mod error_codes {
    pub const ER_CON_COUNT_ERROR: u16 = 1040;
    pub const ER_DBACCESS_DENIED_ERROR: u16 = 1044;
    pub const ER_ACCESS_DENIED_ERROR: u16 = 1045;
    pub const ER_UNKNOWN_COM_ERROR: u16 = 1047;
    pub const ER_BAD_NULL_ERROR: u16 = 1048;
    pub const ER_BAD_DB_ERROR: u16 = 1049;
    pub const ER_SERVER_SHUTDOWN: u16 = 1053;
    pub const ER_BAD_FIELD_ERROR: u16 = 1054;
    pub const ER_DUP_ENTRY: u16 = 1062;
    pub const ER_PARSE_ERROR: u16 = 1064;
    pub const ER_NORMAL_SHUTDOWN: u16 = 1077;
    pub const ER_SHUTDOWN_COMPLETE: u16 = 1081;
    pub const ER_TABLEACCESS_DENIED_ERROR: u16 = 1142;
    pub const ER_NO_SUCH_TABLE: u16 = 1146;
    pub const ER_ABORTING_CONNECTION: u16 = 1152;
    pub const ER_NET_WRITE_INTERRUPTED: u16 = 1161;
    pub const ER_LOCK_WAIT_TIMEOUT: u16 = 1205;
    pub const ER_LOCK_DEADLOCK: u16 = 1213;
    pub const ER_QUERY_INTERRUPTED: u16 = 1317;
    pub const ER_ROW_IS_REFERENCED_2: u16 = 1451;
    pub const ER_NO_REFERENCED_ROW_2: u16 = 1452;
    pub const ER_MUST_CHANGE_PASSWORD: u16 = 1820;
    pub const ER_MUST_CHANGE_PASSWORD_LOGIN: u16 = 1862;
    pub const ER_CONNECTION_KILLED: u16 = 1927;
    pub const CR_SERVER_GONE_ERROR: u16 = 2006;
    pub const CR_SERVER_LOST: u16 = 2013;
    pub const ER_QUERY_TIMEOUT: u16 = 3024;
    pub const ER_CLIENT_INTERACTION_TIMEOUT: u16 = 4031;
}

/// A MySQL packet header.
#[derive(Debug, Clone, Copy)]
pub struct PacketHeader {
    /// Payload length (3 bytes, max 16MB - 1)
    pub payload_length: u32,
    /// Sequence number (wraps at 255)
    pub sequence_id: u8,
}

impl PacketHeader {
    /// Total header size in bytes.
    pub const SIZE: usize = 4;

    /// Parse a packet header from 4 bytes.
    pub fn from_bytes(bytes: &[u8; 4]) -> Self {
        let payload_length =
            u32::from(bytes[0]) | (u32::from(bytes[1]) << 8) | (u32::from(bytes[2]) << 16);
        Self {
            payload_length,
            sequence_id: bytes[3],
        }
    }

    /// Encode the header to 4 bytes.
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_bytes(&self) -> [u8; 4] {
        [
            (self.payload_length & 0xFF) as u8,
            ((self.payload_length >> 8) & 0xFF) as u8,
            ((self.payload_length >> 16) & 0xFF) as u8,
            self.sequence_id,
        ]
    }
}

/// Server response packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// OK packet (0x00)
    Ok,
    /// Error packet (0xFF)
    Error,
    /// EOF packet (0xFE) - deprecated in CLIENT_DEPRECATE_EOF
    Eof,
    /// Local infile request (0xFB)
    LocalInfile,
    /// Data packet (result set row, etc.)
    Data,
}

impl PacketType {
    /// Detect packet type from the first byte of payload.
    pub fn from_first_byte(byte: u8, payload_len: usize) -> Self {
        match byte {
            0x00 => PacketType::Ok,
            0xFF => PacketType::Error,
            // EOF is 0xFE with payload < 9 bytes
            0xFE if payload_len < 9 => PacketType::Eof,
            0xFB => PacketType::LocalInfile,
            _ => PacketType::Data,
        }
    }

    /// Classify a whole payload. An empty payload is a data packet.
    pub fn of(payload: &[u8]) -> Self {
        payload
            .first()
            .map_or(PacketType::Data, |&b| Self::from_first_byte(b, payload.len()))
    }
}

/// Parsed OK packet.
#[derive(Debug, Clone, Default)]
pub struct OkPacket {
    /// Number of affected rows
    pub affected_rows: u64,
    /// Last insert ID
    pub last_insert_id: u64,
    /// Server status flags
    pub status_flags: u16,
    /// Number of warnings
    pub warnings: u16,
    /// Info string (if any)
    pub info: String,
}

/// Parsed Error packet.
#[derive(Debug, Clone)]
pub struct ErrPacket {
    /// Error code
    pub error_code: u16,
    /// SQL state (5 characters)
    pub sql_state: String,
    /// Error message
    pub error_message: String,
}

impl ErrPacket {
    /// Check if this is a unique constraint violation.
    pub fn is_duplicate_key(&self) -> bool {
        self.error_code == error_codes::ER_DUP_ENTRY
    }

    /// Check if this is a foreign key constraint violation.
    pub fn is_foreign_key_violation(&self) -> bool {
        matches!(
            self.error_code,
            error_codes::ER_ROW_IS_REFERENCED_2 | error_codes::ER_NO_REFERENCED_ROW_2
        )
    }

    /// Does this error code mean the connection itself is gone?
    pub fn is_connection_fatal(&self) -> bool {
        use error_codes::*;
        matches!(
            self.error_code,
            ER_CON_COUNT_ERROR
                | ER_SERVER_SHUTDOWN
                | ER_NORMAL_SHUTDOWN..=ER_SHUTDOWN_COMPLETE
                | ER_ABORTING_CONNECTION..=ER_NET_WRITE_INTERRUPTED
                | ER_CONNECTION_KILLED
                | CR_SERVER_GONE_ERROR
                | CR_SERVER_LOST
                | ER_CLIENT_INTERACTION_TIMEOUT
        )
    }

    /// Map the server error onto the error taxonomy.
    pub fn kind(&self) -> QueryErrorKind {
        use error_codes::*;
        if self.is_connection_fatal() {
            return QueryErrorKind::Fatal;
        }
        match self.error_code {
            ER_PARSE_ERROR => QueryErrorKind::Syntax,
            ER_DUP_ENTRY | ER_BAD_NULL_ERROR | ER_ROW_IS_REFERENCED_2 | ER_NO_REFERENCED_ROW_2 => {
                QueryErrorKind::Constraint
            }
            ER_NO_SUCH_TABLE | ER_BAD_FIELD_ERROR | ER_BAD_DB_ERROR => QueryErrorKind::NotFound,
            ER_DBACCESS_DENIED_ERROR | ER_ACCESS_DENIED_ERROR | ER_TABLEACCESS_DENIED_ERROR => {
                QueryErrorKind::Permission
            }
            ER_LOCK_DEADLOCK | ER_LOCK_WAIT_TIMEOUT => QueryErrorKind::Deadlock,
            ER_QUERY_INTERRUPTED | ER_QUERY_TIMEOUT => QueryErrorKind::Interrupted,
            ER_MUST_CHANGE_PASSWORD => QueryErrorKind::PasswordExpired,
            _ => QueryErrorKind::Database,
        }
    }

    /// Convert into a query error, attaching the statement text if known.
    pub fn into_error(self, sql: Option<&str>) -> Error {
        Error::Query(QueryError {
            kind: self.kind(),
            sql: sql.map(str::to_string),
            code: Some(self.error_code),
            sqlstate: (!self.sql_state.is_empty()).then_some(self.sql_state),
            message: self.error_message,
            source: None,
        })
    }
}

/// Parsed EOF packet (deprecated in newer MySQL versions).
#[derive(Debug, Clone, Copy)]
pub struct EofPacket {
    /// Number of warnings
    pub warnings: u16,
    /// Server status flags
    pub status_flags: u16,
}
