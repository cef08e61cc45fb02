//! Result headers and row decoding.
//!
//! A statement answers with one or more results. Each is either an OK
//! summary (affected rows, last insert id) or a result set: column
//! definitions followed by rows in the text or binary encoding, ended by
//! EOF (or an OK with a `0xFE` header when `CLIENT_DEPRECATE_EOF` is
//! negotiated).

use std::sync::Arc;

use sqlwire_core::row::ColumnInfo;
use sqlwire_core::{Error, Result, Row, Value};

use crate::protocol::{
    EofPacket, ErrPacket, LenEnc, MAX_PACKET_SIZE, OkPacket, PacketReader, server_status,
};
use crate::types::{ColumnDef, ColumnPolicy, decode_binary_value, decode_text_value};

/// Row encoding of a result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowFormat {
    /// COM_QUERY: every cell is a length-encoded string
    Text,
    /// COM_STMT_EXECUTE: typed cells behind a NULL bitmap
    Binary,
}

/// One result of a statement.
#[derive(Debug, Clone)]
pub struct ResultSet {
    columns: Arc<[ColumnDef]>,
    column_info: Arc<ColumnInfo>,
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub warnings: u16,
    /// Human-readable summary from the OK packet
    pub info: String,
    pub status_flags: u16,
}

impl ResultSet {
    /// A result without rows.
    pub fn from_ok(ok: OkPacket) -> Self {
        Self {
            columns: Arc::from(Vec::new()),
            column_info: Arc::new(ColumnInfo::new(Vec::new())),
            affected_rows: ok.affected_rows,
            last_insert_id: ok.last_insert_id,
            warnings: ok.warnings,
            info: ok.info,
            status_flags: ok.status_flags,
        }
    }

    /// A result set whose rows follow.
    pub fn with_columns(columns: Vec<ColumnDef>) -> Self {
        let names = columns.iter().map(|c| c.name.clone()).collect();
        Self {
            columns: Arc::from(columns),
            column_info: Arc::new(ColumnInfo::new(names)),
            affected_rows: 0,
            last_insert_id: 0,
            warnings: 0,
            info: String::new(),
            status_flags: 0,
        }
    }

    /// Does this result carry rows?
    pub fn has_rows(&self) -> bool {
        !self.columns.is_empty()
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn column_info(&self) -> &Arc<ColumnInfo> {
        &self.column_info
    }

    /// More results follow this one.
    pub fn has_more_results(&self) -> bool {
        self.status_flags & server_status::SERVER_MORE_RESULTS_EXISTS != 0
    }
}

/// Column metadata shared by every row of an open result set.
#[derive(Debug, Clone)]
pub(crate) struct RowCursor {
    pub columns: Arc<[ColumnDef]>,
    pub column_info: Arc<ColumnInfo>,
    pub format: RowFormat,
}

impl RowCursor {
    pub fn new(result: &ResultSet, format: RowFormat) -> Self {
        Self {
            columns: Arc::clone(&result.columns),
            column_info: Arc::clone(&result.column_info),
            format,
        }
    }

    #[allow(clippy::result_large_err)]
    pub fn decode(&self, payload: &[u8], policy: &ColumnPolicy) -> Result<Row> {
        match self.format {
            RowFormat::Text => decode_text_row(payload, &self.columns, &self.column_info, policy),
            RowFormat::Binary => {
                decode_binary_row(payload, &self.columns, &self.column_info, policy)
            }
        }
    }
}

/// First packet of a result.
#[derive(Debug)]
pub enum ResultHeader {
    Ok(OkPacket),
    Err(ErrPacket),
    /// The server wants the named file uploaded
    LocalInfile(String),
    /// A result set with this many columns follows
    Columns(u64),
}

/// Classify the first packet of a result. The column count is a packed
/// integer, so `0xFE` carries four bytes and `0xFB` marks LOCAL INFILE.
#[allow(clippy::result_large_err)]
pub fn parse_result_header(payload: &[u8]) -> Result<ResultHeader> {
    let mut reader = PacketReader::new(payload);
    match payload.first() {
        Some(0x00) => reader
            .parse_ok_packet()
            .map(ResultHeader::Ok)
            .ok_or_else(|| Error::protocol("malformed OK packet")),
        Some(0xFF) => reader
            .parse_err_packet()
            .map(ResultHeader::Err)
            .ok_or_else(|| Error::protocol("malformed error packet")),
        _ => match reader.read_packed_int() {
            Some(LenEnc::Null) => Ok(ResultHeader::LocalInfile(
                String::from_utf8_lossy(reader.read_rest()).into_owned(),
            )),
            Some(LenEnc::Value(count)) if count > 0 => Ok(ResultHeader::Columns(count)),
            _ => Err(Error::protocol(format!(
                "malformed result header: {:02X?}",
                &payload[..payload.len().min(8)]
            ))),
        },
    }
}

/// Does this packet end the rows (or column definitions) of a result set?
pub fn is_result_end(payload: &[u8], deprecate_eof: bool) -> bool {
    match payload.first() {
        Some(0xFE) if deprecate_eof => payload.len() < MAX_PACKET_SIZE,
        Some(0xFE) => payload.len() < 9,
        _ => false,
    }
}

/// Warnings and status from a result set terminator.
#[allow(clippy::result_large_err)]
pub fn parse_terminator(payload: &[u8], deprecate_eof: bool) -> Result<EofPacket> {
    let mut reader = PacketReader::new(payload);
    if deprecate_eof {
        let ok = reader
            .parse_ok_packet()
            .ok_or_else(|| Error::protocol("malformed end-of-rows OK packet"))?;
        Ok(EofPacket {
            warnings: ok.warnings,
            status_flags: ok.status_flags,
        })
    } else {
        reader
            .parse_eof_packet()
            .ok_or_else(|| Error::protocol("malformed EOF packet"))
    }
}

fn truncated() -> Error {
    Error::protocol("row packet is shorter than its columns")
}

/// Decode a text-protocol row.
#[allow(clippy::result_large_err)]
pub fn decode_text_row(
    payload: &[u8],
    columns: &[ColumnDef],
    info: &Arc<ColumnInfo>,
    policy: &ColumnPolicy,
) -> Result<Row> {
    let mut reader = PacketReader::new(payload);
    let mut values = Vec::with_capacity(columns.len());
    for column in columns {
        let value = match reader.read_field_length().ok_or_else(truncated)? {
            LenEnc::Null => Value::Null,
            LenEnc::Value(len) => {
                let len = usize::try_from(len).map_err(|_| truncated())?;
                let data = reader.read_bytes(len).ok_or_else(truncated)?;
                decode_text_value(data, column, policy)
            }
        };
        values.push(value);
    }
    Ok(Row::with_columns(Arc::clone(info), values))
}

/// Bytes in a NULL bitmap for `columns` columns with `offset` leading bits.
pub const fn null_bitmap_len(columns: usize, offset: usize) -> usize {
    (columns + offset).div_ceil(8)
}

/// Decode a binary-protocol row: `0x00`, NULL bitmap with a two-bit
/// offset, then the non-NULL cells.
#[allow(clippy::result_large_err)]
pub fn decode_binary_row(
    payload: &[u8],
    columns: &[ColumnDef],
    info: &Arc<ColumnInfo>,
    policy: &ColumnPolicy,
) -> Result<Row> {
    let mut reader = PacketReader::new(payload);
    if reader.read_u8() != Some(0x00) {
        return Err(Error::protocol("binary row does not start with 0x00"));
    }
    let bitmap = reader
        .read_bytes(null_bitmap_len(columns.len(), 2))
        .ok_or_else(truncated)?;

    let mut values = Vec::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        let bit = i + 2;
        if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
            values.push(Value::Null);
            continue;
        }
        values.push(decode_binary_value(&mut reader, column, policy).ok_or_else(truncated)?);
    }
    Ok(Row::with_columns(Arc::clone(info), values))
}
