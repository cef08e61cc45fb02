//! MySQL type system and value decoding.
//!
//! This module provides:
//! - MySQL field type constants and column flags
//! - Column definitions and the effective type derived from them
//! - Decoding of text-protocol and binary-protocol cells into [`Value`]s
//!
//! # Effective types
//!
//! The wire type alone does not say how a cell should be presented: a BLOB
//! may hold text, a `CHAR(36)` may hold a GUID, a `TINYINT(1)` is usually a
//! boolean. [`derive_effective_type`] settles this once per column, when the
//! column definition is parsed, from the wire type, flags, charset and the
//! connection's [`ColumnPolicy`].

#![allow(clippy::cast_possible_truncation)]

use regex::Regex;
use sqlwire_core::{Error, Result, Value};

use crate::charset::{self, Encoding, collation};
use crate::protocol::PacketReader;

/// MySQL field type codes.
///
/// These are the `MYSQL_TYPE_*` constants from the MySQL C API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    /// DECIMAL (MYSQL_TYPE_DECIMAL)
    Decimal = 0x00,
    /// TINYINT (MYSQL_TYPE_TINY)
    Tiny = 0x01,
    /// SMALLINT (MYSQL_TYPE_SHORT)
    Short = 0x02,
    /// INT (MYSQL_TYPE_LONG)
    Long = 0x03,
    /// FLOAT (MYSQL_TYPE_FLOAT)
    Float = 0x04,
    /// DOUBLE (MYSQL_TYPE_DOUBLE)
    Double = 0x05,
    /// NULL (MYSQL_TYPE_NULL)
    Null = 0x06,
    /// TIMESTAMP (MYSQL_TYPE_TIMESTAMP)
    Timestamp = 0x07,
    /// BIGINT (MYSQL_TYPE_LONGLONG)
    LongLong = 0x08,
    /// MEDIUMINT (MYSQL_TYPE_INT24)
    Int24 = 0x09,
    /// DATE (MYSQL_TYPE_DATE)
    Date = 0x0A,
    /// TIME (MYSQL_TYPE_TIME)
    Time = 0x0B,
    /// DATETIME (MYSQL_TYPE_DATETIME)
    DateTime = 0x0C,
    /// YEAR (MYSQL_TYPE_YEAR)
    Year = 0x0D,
    /// NEWDATE (MYSQL_TYPE_NEWDATE) - internal use
    NewDate = 0x0E,
    /// VARCHAR (MYSQL_TYPE_VARCHAR)
    VarChar = 0x0F,
    /// BIT (MYSQL_TYPE_BIT)
    Bit = 0x10,
    /// TIMESTAMP2 (MYSQL_TYPE_TIMESTAMP2) - MySQL 5.6+
    Timestamp2 = 0x11,
    /// DATETIME2 (MYSQL_TYPE_DATETIME2) - MySQL 5.6+
    DateTime2 = 0x12,
    /// TIME2 (MYSQL_TYPE_TIME2) - MySQL 5.6+
    Time2 = 0x13,
    /// JSON (MYSQL_TYPE_JSON) - MySQL 5.7.8+
    Json = 0xF5,
    /// NEWDECIMAL (MYSQL_TYPE_NEWDECIMAL)
    NewDecimal = 0xF6,
    /// ENUM (MYSQL_TYPE_ENUM)
    Enum = 0xF7,
    /// SET (MYSQL_TYPE_SET)
    Set = 0xF8,
    /// TINYBLOB (MYSQL_TYPE_TINY_BLOB)
    TinyBlob = 0xF9,
    /// MEDIUMBLOB (MYSQL_TYPE_MEDIUM_BLOB)
    MediumBlob = 0xFA,
    /// LONGBLOB (MYSQL_TYPE_LONG_BLOB)
    LongBlob = 0xFB,
    /// BLOB (MYSQL_TYPE_BLOB)
    Blob = 0xFC,
    /// VARCHAR (MYSQL_TYPE_VAR_STRING)
    VarString = 0xFD,
    /// CHAR (MYSQL_TYPE_STRING)
    String = 0xFE,
    /// GEOMETRY (MYSQL_TYPE_GEOMETRY)
    Geometry = 0xFF,
}

impl FieldType {
    /// Parse a field type from a byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B => FieldType::Time,
            0x0C => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0E => FieldType::NewDate,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0x11 => FieldType::Timestamp2,
            0x12 => FieldType::DateTime2,
            0x13 => FieldType::Time2,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFE => FieldType::String,
            0xFF => FieldType::Geometry,
            _ => FieldType::String, // Unknown types treated as string
        }
    }

    /// Check if this is one of the BLOB wire types.
    #[must_use]
    pub const fn is_blob(self) -> bool {
        matches!(
            self,
            FieldType::TinyBlob | FieldType::MediumBlob | FieldType::LongBlob | FieldType::Blob
        )
    }

    /// Check if this is a character string wire type.
    #[must_use]
    pub const fn is_string(self) -> bool {
        matches!(
            self,
            FieldType::VarChar
                | FieldType::VarString
                | FieldType::String
                | FieldType::Enum
                | FieldType::Set
        )
    }

    /// Check if this is a date/time type.
    #[must_use]
    pub const fn is_temporal(self) -> bool {
        matches!(
            self,
            FieldType::Date
                | FieldType::Time
                | FieldType::DateTime
                | FieldType::Timestamp
                | FieldType::NewDate
                | FieldType::Timestamp2
                | FieldType::DateTime2
                | FieldType::Time2
        )
    }

    /// Get the type name as a string.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            FieldType::Decimal => "DECIMAL",
            FieldType::Tiny => "TINYINT",
            FieldType::Short => "SMALLINT",
            FieldType::Long => "INT",
            FieldType::Float => "FLOAT",
            FieldType::Double => "DOUBLE",
            FieldType::Null => "NULL",
            FieldType::Timestamp => "TIMESTAMP",
            FieldType::LongLong => "BIGINT",
            FieldType::Int24 => "MEDIUMINT",
            FieldType::Date => "DATE",
            FieldType::Time => "TIME",
            FieldType::DateTime => "DATETIME",
            FieldType::Year => "YEAR",
            FieldType::NewDate => "DATE",
            FieldType::VarChar => "VARCHAR",
            FieldType::Bit => "BIT",
            FieldType::Timestamp2 => "TIMESTAMP",
            FieldType::DateTime2 => "DATETIME",
            FieldType::Time2 => "TIME",
            FieldType::Json => "JSON",
            FieldType::NewDecimal => "DECIMAL",
            FieldType::Enum => "ENUM",
            FieldType::Set => "SET",
            FieldType::TinyBlob => "TINYBLOB",
            FieldType::MediumBlob => "MEDIUMBLOB",
            FieldType::LongBlob => "LONGBLOB",
            FieldType::Blob => "BLOB",
            FieldType::VarString => "VARCHAR",
            FieldType::String => "CHAR",
            FieldType::Geometry => "GEOMETRY",
        }
    }
}

/// Column flags in result set metadata.
#[allow(dead_code)]
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRIMARY_KEY: u16 = 2;
    pub const UNIQUE_KEY: u16 = 4;
    pub const MULTIPLE_KEY: u16 = 8;
    pub const BLOB: u16 = 16;
    pub const UNSIGNED: u16 = 32;
    pub const ZEROFILL: u16 = 64;
    pub const BINARY: u16 = 128;
    pub const ENUM: u16 = 256;
    pub const AUTO_INCREMENT: u16 = 512;
    pub const TIMESTAMP: u16 = 1024;
    pub const SET: u16 = 2048;
    pub const NO_DEFAULT_VALUE: u16 = 4096;
    pub const ON_UPDATE_NOW: u16 = 8192;
    pub const NUM: u16 = 32768;
}

/// How a column's cells are presented to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectiveType {
    Null,
    Boolean,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int24,
    UInt24,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Year,
    Float,
    Double,
    Decimal,
    Date,
    Time,
    DateTime,
    Timestamp,
    Bit,
    /// Character data, decoded through the column's encoding
    Text,
    /// Raw bytes
    Binary,
    Guid,
    Json,
    Geometry,
}

impl EffectiveType {
    /// Cells are handed out as raw bytes.
    pub const fn is_binary(self) -> bool {
        matches!(self, EffectiveType::Binary | EffectiveType::Geometry)
    }

    /// Cells are decoded as character data.
    pub const fn is_text(self) -> bool {
        matches!(self, EffectiveType::Text)
    }

    pub const fn is_unsigned(self) -> bool {
        matches!(
            self,
            EffectiveType::UInt8
                | EffectiveType::UInt16
                | EffectiveType::UInt24
                | EffectiveType::UInt32
                | EffectiveType::UInt64
        )
    }
}

/// Connection-level options that shape how columns are decoded.
#[derive(Debug, Clone)]
pub struct ColumnPolicy {
    /// `TINYINT(1)` columns decode as booleans
    pub treat_tiny_as_boolean: bool,
    /// `BINARY(16)` holds GUIDs instead of `CHAR(36)`
    pub old_guids: bool,
    /// Honor the BINARY flag on BLOB columns with a text charset
    pub respect_binary_flags: bool,
    /// Decode binary blobs as UTF-8 text, subject to the name patterns
    pub treat_blobs_as_utf8: bool,
    pub blob_include: Option<Regex>,
    pub blob_exclude: Option<Regex>,
    /// Zero dates come back as text instead of NULL
    pub allow_zero_datetime: bool,
}

impl Default for ColumnPolicy {
    fn default() -> Self {
        Self {
            treat_tiny_as_boolean: true,
            old_guids: false,
            respect_binary_flags: true,
            treat_blobs_as_utf8: false,
            blob_include: None,
            blob_exclude: None,
            allow_zero_datetime: false,
        }
    }
}

impl ColumnPolicy {
    /// Should a binary column with this name be decoded as UTF-8 text?
    pub fn blob_as_utf8(&self, column_name: &str) -> bool {
        if !self.treat_blobs_as_utf8 {
            return false;
        }
        if let Some(include) = &self.blob_include {
            if !include.is_match(column_name) {
                return false;
            }
        }
        if let Some(exclude) = &self.blob_exclude {
            if exclude.is_match(column_name) {
                return false;
            }
        }
        true
    }
}

/// Column definition from a result set.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    /// Catalog name (always "def")
    pub catalog: String,
    /// Schema (database) name
    pub schema: String,
    /// Table name (or alias)
    pub table: String,
    /// Original table name
    pub org_table: String,
    /// Column name (or alias)
    pub name: String,
    /// Original column name
    pub org_name: String,
    /// Collation id of the column
    pub charset: u16,
    /// Declared length in bytes
    pub column_length: u32,
    /// Wire type
    pub column_type: FieldType,
    /// Column flags
    pub flags: u16,
    /// Number of decimals
    pub decimals: u8,
    /// Derived once by [`derive_effective_type`] when the column is parsed
    pub effective_type: EffectiveType,
    /// Encoding used for character cells
    pub encoding: Encoding,
}

impl ColumnDef {
    /// Build a definition by hand and derive its effective type.
    pub fn new(
        name: impl Into<String>,
        column_type: FieldType,
        flags: u16,
        charset: u16,
        column_length: u32,
        policy: &ColumnPolicy,
    ) -> Self {
        let name = name.into();
        let mut def = Self {
            catalog: "def".to_string(),
            schema: String::new(),
            table: String::new(),
            org_table: String::new(),
            org_name: name.clone(),
            name,
            charset,
            column_length,
            column_type,
            flags,
            decimals: 0,
            effective_type: EffectiveType::Null,
            encoding: Encoding::Utf8,
        };
        def.finish(policy);
        def
    }

    /// Parse a column-definition packet (protocol 4.1).
    ///
    /// Names are decoded with the connection encoding.
    #[allow(clippy::result_large_err)]
    pub fn parse(payload: &[u8], encoding: Encoding, policy: &ColumnPolicy) -> Result<Self> {
        let truncated = || Error::protocol("truncated column definition");
        let mut reader = PacketReader::new(payload);
        let mut name = || reader.read_lenenc_string_enc(encoding).ok_or_else(truncated);
        let catalog = name()?;
        let schema = name()?;
        let table = name()?;
        let org_table = name()?;
        let column_name = name()?;
        let org_name = name()?;

        // Length of the fixed-size block that follows (always 0x0c).
        reader.read_packed_int().ok_or_else(truncated)?;
        let charset = reader.read_u16_le().ok_or_else(truncated)?;
        let column_length = reader.read_u32_le().ok_or_else(truncated)?;
        let column_type = FieldType::from_u8(reader.read_u8().ok_or_else(truncated)?);
        let flags = reader.read_u16_le().ok_or_else(truncated)?;
        let decimals = reader.read_u8().ok_or_else(truncated)?;

        let mut def = Self {
            catalog,
            schema,
            table,
            org_table,
            name: column_name,
            org_name,
            charset,
            column_length,
            column_type,
            flags,
            decimals,
            effective_type: EffectiveType::Null,
            encoding,
        };
        def.finish(policy);
        Ok(def)
    }

    fn finish(&mut self, policy: &ColumnPolicy) {
        self.effective_type = derive_effective_type(self, policy);
        self.encoding = if self.charset == collation::BINARY {
            // Binary columns flipped to text carry UTF-8.
            Encoding::Utf8
        } else {
            charset::charset_for_collation(self.charset)
                .map_or(Encoding::Utf8, charset::encoding_for_charset)
        };
    }

    /// Check if the column is NOT NULL.
    #[must_use]
    pub const fn is_not_null(&self) -> bool {
        self.flags & column_flags::NOT_NULL != 0
    }

    /// Check if the column is a primary key.
    #[must_use]
    pub const fn is_primary_key(&self) -> bool {
        self.flags & column_flags::PRIMARY_KEY != 0
    }

    /// Check if the column is unsigned.
    #[must_use]
    pub const fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    /// Check if the column is auto-increment.
    #[must_use]
    pub const fn is_auto_increment(&self) -> bool {
        self.flags & column_flags::AUTO_INCREMENT != 0
    }

    /// Check if the column carries the BINARY flag.
    #[must_use]
    pub const fn has_binary_flag(&self) -> bool {
        self.flags & column_flags::BINARY != 0
    }

    /// Cells are raw bytes after policy is applied.
    pub fn is_binary(&self) -> bool {
        self.effective_type.is_binary()
    }

    /// Cells are character data after policy is applied.
    pub fn is_text_field(&self) -> bool {
        self.effective_type.is_text()
    }

    /// Declared length in characters rather than bytes.
    pub fn char_length(&self) -> u32 {
        let max_len = charset::charset_for_collation(self.charset)
            .and_then(charset::lookup)
            .map_or(1, |info| u32::from(info.max_len.max(1)));
        self.column_length / max_len
    }
}

/// Decide how a column's cells are presented.
///
/// Pure function of the definition's wire fields and the policy; the
/// definition's own `effective_type` is ignored.
pub fn derive_effective_type(def: &ColumnDef, policy: &ColumnPolicy) -> EffectiveType {
    let unsigned = def.is_unsigned();
    let binary_charset = def.charset == collation::BINARY;
    let pick = |signed, unsigned_type| if unsigned { unsigned_type } else { signed };

    match def.column_type {
        FieldType::Tiny if policy.treat_tiny_as_boolean && def.column_length == 1 => {
            EffectiveType::Boolean
        }
        FieldType::Tiny => pick(EffectiveType::Int8, EffectiveType::UInt8),
        FieldType::Short => pick(EffectiveType::Int16, EffectiveType::UInt16),
        FieldType::Int24 => pick(EffectiveType::Int24, EffectiveType::UInt24),
        FieldType::Long => pick(EffectiveType::Int32, EffectiveType::UInt32),
        FieldType::LongLong => pick(EffectiveType::Int64, EffectiveType::UInt64),
        FieldType::Year => EffectiveType::Year,
        FieldType::Float => EffectiveType::Float,
        FieldType::Double => EffectiveType::Double,
        FieldType::Decimal | FieldType::NewDecimal => EffectiveType::Decimal,
        FieldType::Date | FieldType::NewDate => EffectiveType::Date,
        FieldType::Time | FieldType::Time2 => EffectiveType::Time,
        FieldType::DateTime | FieldType::DateTime2 => EffectiveType::DateTime,
        FieldType::Timestamp | FieldType::Timestamp2 => EffectiveType::Timestamp,
        FieldType::Bit => EffectiveType::Bit,
        FieldType::Json => EffectiveType::Json,
        FieldType::Geometry => EffectiveType::Geometry,
        FieldType::Null => EffectiveType::Null,
        FieldType::Enum | FieldType::Set => EffectiveType::Text,
        FieldType::TinyBlob | FieldType::MediumBlob | FieldType::LongBlob | FieldType::Blob => {
            let binary =
                binary_charset || (policy.respect_binary_flags && def.has_binary_flag());
            if binary && !policy.blob_as_utf8(&def.name) {
                EffectiveType::Binary
            } else {
                EffectiveType::Text
            }
        }
        FieldType::VarChar | FieldType::VarString | FieldType::String => {
            let fixed = def.column_type == FieldType::String;
            if binary_charset {
                if policy.old_guids && fixed && def.column_length == 16 {
                    EffectiveType::Guid
                } else if policy.blob_as_utf8(&def.name) {
                    EffectiveType::Text
                } else {
                    EffectiveType::Binary
                }
            } else if !policy.old_guids && fixed && def.char_length() == 36 {
                EffectiveType::Guid
            } else {
                EffectiveType::Text
            }
        }
    }
}

/// Decode a text-protocol cell.
///
/// Cells that fail to parse as their declared type are returned as text.
pub fn decode_text_value(data: &[u8], column: &ColumnDef, policy: &ColumnPolicy) -> Value {
    let text = || column.encoding.decode(data).into_owned();
    let parsed = match column.effective_type {
        EffectiveType::Null => Some(Value::Null),
        EffectiveType::Boolean => parse_ascii::<i64>(data).map(|v| Value::Bool(v != 0)),
        EffectiveType::Int8 => parse_ascii(data).map(Value::TinyInt),
        EffectiveType::UInt8 => parse_ascii(data).map(Value::UnsignedTinyInt),
        EffectiveType::Int16 | EffectiveType::Year => parse_ascii(data).map(Value::SmallInt),
        EffectiveType::UInt16 => parse_ascii(data).map(Value::UnsignedSmallInt),
        EffectiveType::Int24 | EffectiveType::Int32 => parse_ascii(data).map(Value::Int),
        EffectiveType::UInt24 | EffectiveType::UInt32 => {
            parse_ascii(data).map(Value::UnsignedInt)
        }
        EffectiveType::Int64 => parse_ascii(data).map(Value::BigInt),
        EffectiveType::UInt64 => parse_ascii(data).map(Value::UnsignedBigInt),
        EffectiveType::Float => parse_ascii(data).map(Value::Float),
        EffectiveType::Double => parse_ascii(data).map(Value::Double),
        EffectiveType::Date => parse_text_date(data).map(|date| match date {
            Some(days) => Value::Date(days),
            None => zero_date(policy, text()),
        }),
        EffectiveType::DateTime | EffectiveType::Timestamp => {
            parse_text_datetime(data).map(|stamp| match stamp {
                Some(micros) => Value::Timestamp(micros),
                None => zero_date(policy, text()),
            })
        }
        EffectiveType::Time => parse_text_time(data).map(Value::Time),
        _ => Some(decode_bytes_value(data, column)),
    };
    parsed.unwrap_or_else(|| Value::Text(text()))
}

/// Decode a binary-protocol cell from `reader`.
///
/// Returns `None` when the row ends before the cell does.
pub fn decode_binary_value(
    reader: &mut PacketReader<'_>,
    column: &ColumnDef,
    policy: &ColumnPolicy,
) -> Option<Value> {
    let effective = column.effective_type;
    let value = match column.column_type {
        FieldType::Null => Value::Null,
        FieldType::Tiny => {
            let byte = reader.read_u8()?;
            match effective {
                EffectiveType::Boolean => Value::Bool(byte != 0),
                EffectiveType::UInt8 => Value::UnsignedTinyInt(byte),
                _ => Value::TinyInt(i8::from_le_bytes([byte])),
            }
        }
        FieldType::Short | FieldType::Year => {
            let raw = reader.read_u16_le()?;
            match effective {
                EffectiveType::UInt16 => Value::UnsignedSmallInt(raw),
                _ => Value::SmallInt(raw as i16),
            }
        }
        FieldType::Int24 | FieldType::Long => {
            let raw = reader.read_u32_le()?;
            if effective.is_unsigned() {
                Value::UnsignedInt(raw)
            } else {
                Value::Int(raw as i32)
            }
        }
        FieldType::LongLong => {
            let raw = reader.read_u64_le()?;
            if effective.is_unsigned() {
                Value::UnsignedBigInt(raw)
            } else {
                Value::BigInt(raw as i64)
            }
        }
        FieldType::Float => {
            let bytes = reader.read_bytes(4)?;
            Value::Float(f32::from_le_bytes(bytes.try_into().ok()?))
        }
        FieldType::Double => {
            let bytes = reader.read_bytes(8)?;
            Value::Double(f64::from_le_bytes(bytes.try_into().ok()?))
        }
        FieldType::Date
        | FieldType::NewDate
        | FieldType::DateTime
        | FieldType::DateTime2
        | FieldType::Timestamp
        | FieldType::Timestamp2 => {
            let len = usize::from(reader.read_u8()?);
            let packed = reader.read_bytes(len)?;
            decode_packed_datetime(packed, effective, policy)
        }
        FieldType::Time | FieldType::Time2 => {
            let len = usize::from(reader.read_u8()?);
            decode_packed_time(reader.read_bytes(len)?).map_or(Value::Null, Value::Time)
        }
        _ => {
            let data = reader.read_lenenc_bytes()?;
            decode_bytes_value(data, column)
        }
    };
    Some(value)
}

/// Cells that arrive as a byte string in both protocols.
fn decode_bytes_value(data: &[u8], column: &ColumnDef) -> Value {
    match column.effective_type {
        EffectiveType::Binary => Value::Bytes(data.to_vec()),
        EffectiveType::Geometry => Value::Geometry(data.to_vec()),
        EffectiveType::Bit => Value::Bit(
            data.iter()
                .fold(0u64, |acc, &b| (acc << 8) | u64::from(b)),
        ),
        EffectiveType::Decimal => Value::Decimal(String::from_utf8_lossy(data).into_owned()),
        EffectiveType::Json => {
            let text = String::from_utf8_lossy(data);
            serde_json::from_str(&text).map_or_else(|_| Value::Text(text.into_owned()), Value::Json)
        }
        EffectiveType::Guid => match parse_guid(data) {
            Some(guid) => Value::Uuid(guid),
            None if column.charset == collation::BINARY => Value::Bytes(data.to_vec()),
            None => Value::Text(column.encoding.decode(data).into_owned()),
        },
        _ => Value::Text(column.encoding.decode(data).into_owned()),
    }
}

fn zero_date(policy: &ColumnPolicy, text: String) -> Value {
    if policy.allow_zero_datetime {
        Value::Text(text)
    } else {
        Value::Null
    }
}

fn parse_ascii<T: std::str::FromStr>(data: &[u8]) -> Option<T> {
    std::str::from_utf8(data).ok()?.trim().parse().ok()
}

/// A GUID is either 16 raw bytes or 32 hex digits with optional dashes.
fn parse_guid(data: &[u8]) -> Option<[u8; 16]> {
    if let Ok(raw) = <[u8; 16]>::try_from(data) {
        return Some(raw);
    }
    let digits: Vec<u8> = data.iter().copied().filter(|&b| b != b'-').collect();
    if digits.len() != 32 {
        return None;
    }
    let mut guid = [0u8; 16];
    for (i, pair) in digits.chunks(2).enumerate() {
        let hex = std::str::from_utf8(pair).ok()?;
        guid[i] = u8::from_str_radix(hex, 16).ok()?;
    }
    Some(guid)
}

const MICROS_PER_SECOND: i64 = 1_000_000;
const MICROS_PER_DAY: i64 = 86_400 * MICROS_PER_SECOND;

/// Parse `YYYY-MM-DD`. `Some(None)` is a zero date.
fn parse_text_date(data: &[u8]) -> Option<Option<i32>> {
    let text = std::str::from_utf8(data).ok()?;
    let mut parts = text.trim().splitn(3, '-');
    let year: i32 = parts.next()?.parse().ok()?;
    let month: i32 = parts.next()?.parse().ok()?;
    let day: i32 = parts.next()?.parse().ok()?;
    if month == 0 || day == 0 {
        return Some(None);
    }
    if !(0..=9999).contains(&year) || month > 12 || day > 31 {
        return None;
    }
    Some(Some(days_from_civil(year, month, day)))
}

/// Parse `YYYY-MM-DD[ HH:MM:SS[.ffffff]]` into microseconds since the epoch.
fn parse_text_datetime(data: &[u8]) -> Option<Option<i64>> {
    let text = std::str::from_utf8(data).ok()?.trim();
    let (date, time) = text.split_once(' ').unwrap_or((text, "00:00:00"));
    let Some(days) = parse_text_date(date.as_bytes())? else {
        return Some(None);
    };
    let micros = parse_text_time(time.as_bytes())?;
    Some(Some((i64::from(days) * MICROS_PER_DAY).checked_add(micros)?))
}

/// Parse `[-]HHH:MM:SS[.ffffff]` into signed microseconds. Values that do
/// not fit are rejected.
fn parse_text_time(data: &[u8]) -> Option<i64> {
    let text = std::str::from_utf8(data).ok()?.trim();
    let (negative, text) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let (clock, fraction) = text.split_once('.').unwrap_or((text, ""));
    let mut parts = clock.splitn(3, ':');
    let hours: i64 = parts.next()?.parse().ok()?;
    let minutes: i64 = parts.next()?.parse().ok()?;
    let seconds: i64 = parts.next()?.parse().ok()?;
    let mut micros = 0i64;
    if !fraction.is_empty() {
        if !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let digits = &fraction[..fraction.len().min(6)];
        micros = digits.parse::<i64>().ok()? * 10i64.pow(6 - digits.len() as u32);
    }
    let total = clock_micros(0, hours, minutes, seconds, micros)?;
    Some(if negative { -total } else { total })
}

fn clock_micros(days: i64, hours: i64, minutes: i64, seconds: i64, micros: i64) -> Option<i64> {
    days.checked_mul(24)?
        .checked_add(hours)?
        .checked_mul(60)?
        .checked_add(minutes)?
        .checked_mul(60)?
        .checked_add(seconds)?
        .checked_mul(MICROS_PER_SECOND)?
        .checked_add(micros)
}

/// Decode a packed DATE/DATETIME/TIMESTAMP (0, 4, 7 or 11 bytes).
fn decode_packed_datetime(packed: &[u8], effective: EffectiveType, policy: &ColumnPolicy) -> Value {
    let year = packed
        .get(..2)
        .map_or(0, |b| i32::from(u16::from_le_bytes([b[0], b[1]])));
    let month = packed.get(2).copied().map_or(0, i32::from);
    let day = packed.get(3).copied().map_or(0, i32::from);
    let hour = packed.get(4).copied().map_or(0, i64::from);
    let minute = packed.get(5).copied().map_or(0, i64::from);
    let second = packed.get(6).copied().map_or(0, i64::from);
    let micros = packed
        .get(7..11)
        .map_or(0, |b| i64::from(u32::from_le_bytes([b[0], b[1], b[2], b[3]])));

    if month == 0 || day == 0 {
        let text = if effective == EffectiveType::Date {
            format!("{year:04}-{month:02}-{day:02}")
        } else {
            format!("{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}")
        };
        return zero_date(policy, text);
    }

    let days = days_from_civil(year, month, day);
    if effective == EffectiveType::Date {
        return Value::Date(days);
    }
    let time = ((hour * 60 + minute) * 60 + second) * MICROS_PER_SECOND + micros;
    Value::Timestamp(i64::from(days) * MICROS_PER_DAY + time)
}

/// Decode a packed TIME (0, 8 or 12 bytes) into signed microseconds.
/// `None` when the value does not fit.
fn decode_packed_time(packed: &[u8]) -> Option<i64> {
    if packed.len() < 8 {
        return Some(0);
    }
    let negative = packed[0] != 0;
    let days = i64::from(u32::from_le_bytes([packed[1], packed[2], packed[3], packed[4]]));
    let hours = i64::from(packed[5]);
    let minutes = i64::from(packed[6]);
    let seconds = i64::from(packed[7]);
    let micros = packed
        .get(8..12)
        .map_or(0, |b| i64::from(u32::from_le_bytes([b[0], b[1], b[2], b[3]])));
    let total = clock_micros(days, hours, minutes, seconds, micros)?;
    Some(if negative { -total } else { total })
}

/// Days since 1970-01-01 for a proleptic Gregorian date.
pub fn days_from_civil(year: i32, month: i32, day: i32) -> i32 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = (if y >= 0 { y } else { y - 399 }) / 400;
    let yoe = y - era * 400;
    let mp = if month > 2 { month - 3 } else { month + 9 };
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// Convert days since Unix epoch to (year, month, day).
///
/// Uses the civil calendar algorithm from Howard Hinnant.
pub fn civil_from_days(days: i32) -> (i32, u32, u32) {
    let z = days + 719_468;
    let era = (if z >= 0 { z } else { z - 146_096 }) / 146_097;
    let doe = (z - era * 146_097) as u32; // [0, 146096]
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365; // [0, 399]
    let y = yoe as i32 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// Split microseconds since the epoch into a date and time of day.
pub fn split_timestamp(micros: i64) -> ((i32, u32, u32), (u32, u32, u32, u32)) {
    let days = micros.div_euclid(MICROS_PER_DAY);
    let rem = micros.rem_euclid(MICROS_PER_DAY);
    let secs = rem / MICROS_PER_SECOND;
    let date = civil_from_days(days as i32);
    let time = (
        (secs / 3600) as u32,
        ((secs % 3600) / 60) as u32,
        (secs % 60) as u32,
        (rem % MICROS_PER_SECOND) as u32,
    );
    (date, time)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(column_type: FieldType, flags: u16, charset: u16, length: u32) -> ColumnDef {
        ColumnDef::new("c", column_type, flags, charset, length, &ColumnPolicy::default())
    }

    fn column_with(
        name: &str,
        column_type: FieldType,
        flags: u16,
        charset: u16,
        length: u32,
        policy: &ColumnPolicy,
    ) -> ColumnDef {
        ColumnDef::new(name, column_type, flags, charset, length, policy)
    }

    #[test]
    fn test_field_type_from_u8() {
        assert_eq!(FieldType::from_u8(0x01), FieldType::Tiny);
        assert_eq!(FieldType::from_u8(0x03), FieldType::Long);
        assert_eq!(FieldType::from_u8(0x08), FieldType::LongLong);
        assert_eq!(FieldType::from_u8(0xFC), FieldType::Blob);
        assert_eq!(FieldType::from_u8(0xF5), FieldType::Json);
        assert_eq!(FieldType::from_u8(0x42), FieldType::String);
    }

    #[test]
    fn test_parse_column_definition() {
        let mut payload = Vec::new();
        for name in ["def", "test", "t", "t", "id", "id"] {
            payload.push(name.len() as u8);
            payload.extend_from_slice(name.as_bytes());
        }
        payload.push(0x0c);
        payload.extend_from_slice(&63u16.to_le_bytes());
        payload.extend_from_slice(&11u32.to_le_bytes());
        payload.push(FieldType::Long as u8);
        payload.extend_from_slice(
            &(column_flags::NOT_NULL | column_flags::PRIMARY_KEY | column_flags::UNSIGNED)
                .to_le_bytes(),
        );
        payload.push(0);
        payload.extend_from_slice(&[0, 0]);

        let def = ColumnDef::parse(&payload, Encoding::Utf8, &ColumnPolicy::default()).unwrap();
        assert_eq!(def.schema, "test");
        assert_eq!(def.name, "id");
        assert_eq!(def.column_type, FieldType::Long);
        assert!(def.is_not_null());
        assert!(def.is_primary_key());
        assert_eq!(def.effective_type, EffectiveType::UInt32);

        let err = ColumnDef::parse(&payload[..10], Encoding::Utf8, &ColumnPolicy::default())
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_unsigned_promotion() {
        let def = column(FieldType::Long, column_flags::UNSIGNED, 63, 10);
        assert_eq!(def.effective_type, EffectiveType::UInt32);
        let value = decode_binary_value(
            &mut PacketReader::new(&u32::MAX.to_le_bytes()),
            &def,
            &ColumnPolicy::default(),
        );
        assert_eq!(value, Some(Value::UnsignedInt(u32::MAX)));

        let signed = column(FieldType::Long, 0, 63, 11);
        assert_eq!(
            decode_text_value(b"-5", &signed, &ColumnPolicy::default()),
            Value::Int(-5)
        );
    }

    #[test]
    fn test_binary_charset_blob_is_binary() {
        let def = column(FieldType::Blob, column_flags::BLOB | column_flags::BINARY, 63, 65535);
        assert!(def.is_binary());
        assert!(!def.is_text_field());
    }

    #[test]
    fn test_text_charset_blob_is_text() {
        let def = column(FieldType::Blob, column_flags::BLOB, 45, 262_140);
        assert!(def.is_text_field());
        assert_eq!(
            decode_text_value(b"hello", &def, &ColumnPolicy::default()),
            Value::Text("hello".to_string())
        );

        // A binary collation flags the column BINARY; honoring it keeps bytes.
        let flagged = column(FieldType::Blob, column_flags::BINARY, 46, 262_140);
        assert!(flagged.is_binary());
        let relaxed = ColumnPolicy {
            respect_binary_flags: false,
            ..ColumnPolicy::default()
        };
        let def = column_with("c", FieldType::Blob, column_flags::BINARY, 46, 262_140, &relaxed);
        assert!(def.is_text_field());
    }

    #[test]
    fn test_blobs_as_utf8_patterns() {
        let policy = ColumnPolicy {
            treat_blobs_as_utf8: true,
            blob_include: Some(Regex::new("^doc_").unwrap()),
            blob_exclude: Some(Regex::new("_raw$").unwrap()),
            ..ColumnPolicy::default()
        };
        let flip = column_with("doc_body", FieldType::Blob, 0, 63, 65535, &policy);
        assert!(flip.is_text_field());
        assert_eq!(
            decode_text_value("h\u{e9}".as_bytes(), &flip, &policy),
            Value::Text("h\u{e9}".to_string())
        );

        let excluded = column_with("doc_raw", FieldType::Blob, 0, 63, 65535, &policy);
        assert!(excluded.is_binary());
        let unmatched = column_with("image", FieldType::Blob, 0, 63, 65535, &policy);
        assert!(unmatched.is_binary());
        let off = column_with("doc_body", FieldType::Blob, 0, 63, 65535, &ColumnPolicy::default());
        assert!(off.is_binary());
    }

    #[test]
    fn test_tiny_as_boolean() {
        let def = column(FieldType::Tiny, 0, 63, 1);
        assert_eq!(def.effective_type, EffectiveType::Boolean);
        assert_eq!(
            decode_text_value(b"1", &def, &ColumnPolicy::default()),
            Value::Bool(true)
        );

        let wide = column(FieldType::Tiny, 0, 63, 4);
        assert_eq!(wide.effective_type, EffectiveType::Int8);

        let policy = ColumnPolicy {
            treat_tiny_as_boolean: false,
            ..ColumnPolicy::default()
        };
        let def = column_with("c", FieldType::Tiny, 0, 63, 1, &policy);
        assert_eq!(def.effective_type, EffectiveType::Int8);
    }

    #[test]
    fn test_guid_detection() {
        // CHAR(36) in utf8mb4 declares 144 bytes.
        let char36 = column(FieldType::String, 0, 45, 144);
        assert_eq!(char36.effective_type, EffectiveType::Guid);
        let value = decode_text_value(
            b"00112233-4455-6677-8899-aabbccddeeff",
            &char36,
            &ColumnPolicy::default(),
        );
        assert_eq!(
            value,
            Value::Uuid([
                0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc,
                0xdd, 0xee, 0xff
            ])
        );

        let binary16 = column(FieldType::String, column_flags::BINARY, 63, 16);
        assert_eq!(binary16.effective_type, EffectiveType::Binary);

        let old = ColumnPolicy {
            old_guids: true,
            ..ColumnPolicy::default()
        };
        let binary16 = column_with("g", FieldType::String, column_flags::BINARY, 63, 16, &old);
        assert_eq!(binary16.effective_type, EffectiveType::Guid);
        let char36 = column_with("g", FieldType::String, 0, 45, 144, &old);
        assert_eq!(char36.effective_type, EffectiveType::Text);
    }

    #[test]
    fn test_text_temporal_values() {
        let policy = ColumnPolicy::default();
        let date = column(FieldType::Date, 0, 63, 10);
        assert_eq!(
            decode_text_value(b"2000-01-01", &date, &policy),
            Value::Date(10957)
        );

        let stamp = column(FieldType::DateTime, 0, 63, 26);
        assert_eq!(
            decode_text_value(b"1970-01-02 00:00:01.5", &stamp, &policy),
            Value::Timestamp(MICROS_PER_DAY + 1_500_000)
        );

        let time = column(FieldType::Time, 0, 63, 10);
        assert_eq!(
            decode_text_value(b"-838:59:59", &time, &policy),
            Value::Time(-(838 * 3600 + 59 * 60 + 59) * MICROS_PER_SECOND)
        );
    }

    #[test]
    fn test_zero_dates() {
        let date = column(FieldType::DateTime, 0, 63, 19);
        assert_eq!(
            decode_text_value(b"0000-00-00 00:00:00", &date, &ColumnPolicy::default()),
            Value::Null
        );
        let allow = ColumnPolicy {
            allow_zero_datetime: true,
            ..ColumnPolicy::default()
        };
        assert_eq!(
            decode_text_value(b"0000-00-00 00:00:00", &date, &allow),
            Value::Text("0000-00-00 00:00:00".to_string())
        );
        assert_eq!(
            decode_binary_value(&mut PacketReader::new(&[0]), &date, &ColumnPolicy::default()),
            Some(Value::Null)
        );
    }

    #[test]
    fn test_binary_packed_temporal_forms() {
        let policy = ColumnPolicy::default();
        let stamp = column(FieldType::DateTime, 0, 63, 26);

        let date_only = [4, 0xD0, 0x07, 1, 1];
        assert_eq!(
            decode_binary_value(&mut PacketReader::new(&date_only), &stamp, &policy),
            Some(Value::Timestamp(i64::from(days_from_civil(2000, 1, 1)) * MICROS_PER_DAY))
        );

        let full = [11, 0xB2, 0x07, 1, 2, 0, 0, 1, 0x20, 0xA1, 0x07, 0x00];
        assert_eq!(
            decode_binary_value(&mut PacketReader::new(&full), &stamp, &policy),
            Some(Value::Timestamp(MICROS_PER_DAY + MICROS_PER_SECOND + 500_000))
        );

        let time = column(FieldType::Time, 0, 63, 10);
        let packed = [8, 1, 1, 0, 0, 0, 2, 3, 4];
        assert_eq!(
            decode_binary_value(&mut PacketReader::new(&packed), &time, &policy),
            Some(Value::Time(-(((24 + 2) * 60 + 3) * 60 + 4) * MICROS_PER_SECOND))
        );

        // Truncated cell.
        assert_eq!(
            decode_binary_value(&mut PacketReader::new(&[7, 0xD0]), &stamp, &policy),
            None
        );
    }

    #[test]
    fn test_out_of_range_temporal_cells() {
        let policy = ColumnPolicy::default();
        let time = column(FieldType::Time, 0, 45, 10);

        let huge_days = [8, 0, 0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 0];
        assert_eq!(
            decode_binary_value(&mut PacketReader::new(&huge_days), &time, &policy),
            Some(Value::Null)
        );

        for text in ["1:2:3.12345é", "99999999999999999:00:00", "1:2:3.x"] {
            assert_eq!(
                decode_text_value(text.as_bytes(), &time, &policy),
                Value::Text(text.to_string())
            );
        }

        let stamp = column(FieldType::DateTime, 0, 45, 19);
        assert_eq!(
            decode_text_value(b"2147483647-01-01 00:00:00", &stamp, &policy),
            Value::Text("2147483647-01-01 00:00:00".to_string())
        );
    }

    #[test]
    fn test_bit_and_json() {
        let policy = ColumnPolicy::default();
        let bit = column(FieldType::Bit, column_flags::UNSIGNED, 63, 16);
        assert_eq!(decode_text_value(&[0x01, 0x02], &bit, &policy), Value::Bit(0x0102));

        let json = column(FieldType::Json, 0, 63, 0);
        assert_eq!(
            decode_text_value(br#"{"a":1}"#, &json, &policy),
            Value::Json(serde_json::json!({"a": 1}))
        );
    }

    #[test]
    fn test_unparseable_cell_falls_back_to_text() {
        let def = column(FieldType::Long, 0, 63, 11);
        assert_eq!(
            decode_text_value(b"abc", &def, &ColumnPolicy::default()),
            Value::Text("abc".to_string())
        );
    }

    #[test]
    fn test_civil_conversions() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(10957), (2000, 1, 1));
        assert_eq!(civil_from_days(19782), (2024, 2, 29));
        for days in [-719_468, -1, 0, 59, 10957, 19782, 2_932_896] {
            let (y, m, d) = civil_from_days(days);
            assert_eq!(days_from_civil(y, m as i32, d as i32), days);
        }
        assert_eq!(
            split_timestamp(-1),
            ((1969, 12, 31), (23, 59, 59, 999_999))
        );
    }
}
