//! MySQL prepared statement (binary protocol) implementation.
//!
//! This module implements COM_STMT_PREPARE, COM_STMT_EXECUTE, and COM_STMT_CLOSE
//! for the MySQL binary protocol.
//!
//! # Protocol Flow
//!
//! 1. **Prepare**: Client sends COM_STMT_PREPARE with SQL
//!    - Server returns statement ID, param count, column count
//!    - Server sends param column definitions (if any)
//!    - Server sends result column definitions (if any)
//!
//! 2. **Execute**: Client sends COM_STMT_EXECUTE with statement ID + binary params
//!    - Server returns result set (binary protocol) or OK packet
//!
//! 3. **Close**: Client sends COM_STMT_CLOSE with statement ID
//!    - No server response
//!
//! The builders return bare payloads; framing is done by the packet stream.

#![allow(clippy::cast_possible_truncation)]

use sqlwire_core::Value;

use super::{Command, PacketWriter};
use crate::charset::Encoding;
use crate::types::{ColumnDef, FieldType, civil_from_days, split_timestamp};

/// Response from COM_STMT_PREPARE.
#[derive(Debug, Clone)]
pub struct StmtPrepareOk {
    /// Unique statement identifier (used in execute/close)
    pub statement_id: u32,
    /// Number of columns in result set (0 for non-SELECT)
    pub num_columns: u16,
    /// Number of parameters (placeholders) in the SQL
    pub num_params: u16,
    /// Number of warnings generated during prepare
    pub warnings: u16,
}

/// A prepared statement with its metadata.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    /// Server-assigned statement ID
    pub statement_id: u32,
    /// SQL text, kept for error reports
    pub sql: String,
    /// Parameter column definitions
    pub params: Vec<ColumnDef>,
    /// Result column definitions
    pub columns: Vec<ColumnDef>,
}

impl PreparedStatement {
    pub fn new(
        statement_id: u32,
        sql: String,
        params: Vec<ColumnDef>,
        columns: Vec<ColumnDef>,
    ) -> Self {
        Self {
            statement_id,
            sql,
            params,
            columns,
        }
    }

    /// Get the number of parameters expected.
    #[must_use]
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    /// Get the number of result columns.
    #[must_use]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }
}

/// Build a COM_STMT_PREPARE payload.
pub fn build_stmt_prepare_packet(sql: &str, encoding: Encoding) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(1 + sql.len());
    writer.write_u8(Command::StmtPrepare as u8);
    writer.write_string_enc(sql, encoding);
    writer.into_bytes()
}

/// Build a COM_STMT_EXECUTE payload.
///
/// # Binary Protocol Parameter Encoding
///
/// - Command byte (0x17)
/// - Statement ID (4 bytes, little-endian)
/// - Flags (1 byte): 0x00 = no cursor
/// - Iteration count (4 bytes, always 1)
/// - NULL bitmap, (num_params + 7) / 8 bytes (if num_params > 0)
/// - New params bound flag (1 byte, always 1)
/// - Parameter types, 2 bytes each
/// - Non-NULL parameter values
///
/// `old_guids` sends GUIDs as 16 raw bytes instead of their text form.
pub fn build_stmt_execute_packet(
    statement_id: u32,
    params: &[Value],
    encoding: Encoding,
    old_guids: bool,
) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(64 + params.len() * 16);

    writer.write_u8(Command::StmtExecute as u8);
    writer.write_u32_le(statement_id);
    // CURSOR_TYPE_NO_CURSOR
    writer.write_u8(0x00);
    writer.write_u32_le(1);

    if params.is_empty() {
        return writer.into_bytes();
    }

    let mut null_bitmap = vec![0u8; params.len().div_ceil(8)];
    for (i, param) in params.iter().enumerate() {
        if param.is_null() {
            null_bitmap[i / 8] |= 1 << (i % 8);
        }
    }
    writer.write_bytes(&null_bitmap);
    writer.write_u8(1);

    for param in params {
        let (field_type, unsigned) = param_type(param, old_guids);
        writer.write_u8(field_type as u8);
        writer.write_u8(if unsigned { 0x80 } else { 0x00 });
    }

    for param in params {
        encode_binary_param(&mut writer, param, encoding, old_guids);
    }

    writer.into_bytes()
}

/// Build a COM_STMT_CLOSE payload. The server does not reply.
pub fn build_stmt_close_packet(statement_id: u32) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(5);
    writer.write_u8(Command::StmtClose as u8);
    writer.write_u32_le(statement_id);
    writer.into_bytes()
}

/// Parse a COM_STMT_PREPARE_OK response.
///
/// # Format
///
/// - Status: 0x00 (1 byte)
/// - Statement ID (4 bytes)
/// - Number of columns (2 bytes)
/// - Number of parameters (2 bytes)
/// - Reserved: 0x00 (1 byte)
/// - Warning count (2 bytes)
///
/// Returns `None` if the data is malformed.
pub fn parse_stmt_prepare_ok(data: &[u8]) -> Option<StmtPrepareOk> {
    if data.len() < 12 || data[0] != 0x00 {
        return None;
    }

    Some(StmtPrepareOk {
        statement_id: u32::from_le_bytes([data[1], data[2], data[3], data[4]]),
        num_columns: u16::from_le_bytes([data[5], data[6]]),
        num_params: u16::from_le_bytes([data[7], data[8]]),
        // data[9] is reserved
        warnings: u16::from_le_bytes([data[10], data[11]]),
    })
}

/// Wire type and unsigned flag announced for a parameter.
fn param_type(value: &Value, old_guids: bool) -> (FieldType, bool) {
    match value {
        Value::Null => (FieldType::Null, false),
        Value::Bool(_) | Value::TinyInt(_) => (FieldType::Tiny, false),
        Value::UnsignedTinyInt(_) => (FieldType::Tiny, true),
        Value::SmallInt(_) => (FieldType::Short, false),
        Value::UnsignedSmallInt(_) => (FieldType::Short, true),
        Value::Int(_) => (FieldType::Long, false),
        Value::UnsignedInt(_) => (FieldType::Long, true),
        Value::BigInt(_) => (FieldType::LongLong, false),
        Value::UnsignedBigInt(_) | Value::Bit(_) => (FieldType::LongLong, true),
        Value::Float(_) => (FieldType::Float, false),
        Value::Double(_) => (FieldType::Double, false),
        Value::Decimal(_) => (FieldType::NewDecimal, false),
        Value::Text(_) => (FieldType::VarString, false),
        Value::Bytes(_) | Value::Geometry(_) => (FieldType::Blob, false),
        Value::Uuid(_) if old_guids => (FieldType::Blob, false),
        Value::Uuid(_) => (FieldType::VarString, false),
        Value::Json(_) => (FieldType::Json, false),
        Value::Date(_) => (FieldType::Date, false),
        Value::Time(_) => (FieldType::Time, false),
        Value::Timestamp(_) => (FieldType::DateTime, false),
    }
}

/// Encode a parameter value for binary protocol. NULLs write nothing.
fn encode_binary_param(
    writer: &mut PacketWriter,
    value: &Value,
    encoding: Encoding,
    old_guids: bool,
) {
    match value {
        Value::Null => {}
        Value::Bool(b) => writer.write_u8(u8::from(*b)),
        Value::TinyInt(i) => writer.write_bytes(&i.to_le_bytes()),
        Value::UnsignedTinyInt(u) => writer.write_u8(*u),
        Value::SmallInt(i) => writer.write_bytes(&i.to_le_bytes()),
        Value::UnsignedSmallInt(u) => writer.write_u16_le(*u),
        Value::Int(i) => writer.write_bytes(&i.to_le_bytes()),
        Value::UnsignedInt(u) => writer.write_u32_le(*u),
        Value::BigInt(i) => writer.write_bytes(&i.to_le_bytes()),
        Value::UnsignedBigInt(u) | Value::Bit(u) => writer.write_u64_le(*u),
        Value::Float(f) => writer.write_bytes(&f.to_le_bytes()),
        Value::Double(f) => writer.write_bytes(&f.to_le_bytes()),
        Value::Decimal(s) => writer.write_lenenc_string(s),
        Value::Text(s) => writer.write_lenenc_string_enc(s, encoding),
        Value::Bytes(b) | Value::Geometry(b) => writer.write_lenenc_bytes(b),
        Value::Uuid(bytes) if old_guids => writer.write_lenenc_bytes(bytes),
        Value::Uuid(bytes) => writer.write_lenenc_string(&format_guid(bytes)),
        Value::Json(j) => writer.write_lenenc_string(&j.to_string()),
        Value::Date(days) => encode_binary_date(writer, *days),
        Value::Time(micros) => encode_binary_time(writer, *micros),
        Value::Timestamp(micros) => encode_binary_datetime(writer, *micros),
    }
}

/// Hyphenated lowercase GUID text.
pub fn format_guid(bytes: &[u8; 16]) -> String {
    let mut out = String::with_capacity(36);
    for (i, byte) in bytes.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            out.push('-');
        }
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// DATE: length 4, year(2) month(1) day(1).
fn encode_binary_date(writer: &mut PacketWriter, days: i32) {
    let (year, month, day) = civil_from_days(days);
    writer.write_u8(4);
    writer.write_u16_le(year as u16);
    writer.write_u8(month as u8);
    writer.write_u8(day as u8);
}

/// TIME: length 0, 8 or 12; sign, days(4), hour, minute, second, micros(4).
fn encode_binary_time(writer: &mut PacketWriter, micros: i64) {
    let negative = micros < 0;
    let micros = micros.unsigned_abs();

    let total_seconds = micros / 1_000_000;
    let fraction = (micros % 1_000_000) as u32;
    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if total_seconds == 0 && fraction == 0 {
        writer.write_u8(0);
        return;
    }
    writer.write_u8(if fraction == 0 { 8 } else { 12 });
    writer.write_u8(u8::from(negative));
    writer.write_u32_le(days as u32);
    writer.write_u8(hours as u8);
    writer.write_u8(minutes as u8);
    writer.write_u8(seconds as u8);
    if fraction != 0 {
        writer.write_u32_le(fraction);
    }
}

/// DATETIME: length 4, 7 or 11.
fn encode_binary_datetime(writer: &mut PacketWriter, micros: i64) {
    let ((year, month, day), (hour, minute, second, fraction)) = split_timestamp(micros);
    let len = match (hour, minute, second, fraction) {
        (0, 0, 0, 0) => 4,
        (_, _, _, 0) => 7,
        _ => 11,
    };
    writer.write_u8(len);
    writer.write_u16_le(year as u16);
    writer.write_u8(month as u8);
    writer.write_u8(day as u8);
    if len >= 7 {
        writer.write_u8(hour as u8);
        writer.write_u8(minute as u8);
        writer.write_u8(second as u8);
    }
    if len == 11 {
        writer.write_u32_le(fraction);
    }
}
