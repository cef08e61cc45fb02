//! MySQL packet reading utilities.
//!
//! Reads return `None` when the buffer runs out; that is the normal
//! end-of-data signal, not an error. Callers turn an unexpected `None` into
//! a protocol error.
//!
//! MySQL has two length-encoded integer forms that share marker bytes but
//! disagree on marker `0xFE`: [`PacketReader::read_field_length`] (8 bytes
//! follow) and [`PacketReader::read_packed_int`] (4 bytes follow). Each call
//! site uses the one its context calls for.

#![allow(clippy::cast_possible_truncation)]

use crate::charset::Encoding;
use crate::protocol::{EofPacket, ErrPacket, OkPacket};

/// A decoded length-encoded integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LenEnc {
    /// Marker `0xFB`: SQL NULL, or LOCAL INFILE in a result header.
    Null,
    Value(u64),
}

impl LenEnc {
    /// The value, with NULL mapped to `None`.
    pub fn value(self) -> Option<u64> {
        match self {
            LenEnc::Null => None,
            LenEnc::Value(v) => Some(v),
        }
    }
}

/// A reader for MySQL protocol data.
#[derive(Debug)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    /// Create a new reader from a byte slice.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Get remaining bytes in the buffer.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Check if we've reached the end of the data.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Current read position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Peek at the next byte without advancing.
    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    /// Read a single byte.
    pub fn read_u8(&mut self) -> Option<u8> {
        let byte = self.data.get(self.pos)?;
        self.pos += 1;
        Some(*byte)
    }

    fn read_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Some(out)
    }

    /// Read a u16 (little-endian).
    pub fn read_u16_le(&mut self) -> Option<u16> {
        self.read_array().map(u16::from_le_bytes)
    }

    /// Read a u24 (little-endian, 3 bytes).
    pub fn read_u24_le(&mut self) -> Option<u32> {
        let [a, b, c] = self.read_array()?;
        Some(u32::from_le_bytes([a, b, c, 0]))
    }

    /// Read a u32 (little-endian).
    pub fn read_u32_le(&mut self) -> Option<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    /// Read a u64 (little-endian).
    pub fn read_u64_le(&mut self) -> Option<u64> {
        self.read_array().map(u64::from_le_bytes)
    }

    /// Read an i64 (little-endian).
    pub fn read_i64_le(&mut self) -> Option<i64> {
        self.read_array().map(i64::from_le_bytes)
    }

    /// Read a length-encoded integer in the field-length form.
    ///
    /// - 0x00-0xFA: 1-byte value
    /// - 0xFB: NULL
    /// - 0xFC: 2-byte value follows
    /// - 0xFD: 3-byte value follows
    /// - 0xFE: 8-byte value follows
    ///
    /// Used for row cells, OK-packet counters and column-definition strings.
    pub fn read_field_length(&mut self) -> Option<LenEnc> {
        let first = self.read_u8()?;
        let value = match first {
            0x00..=0xFA => u64::from(first),
            0xFB => return Some(LenEnc::Null),
            0xFC => u64::from(self.read_u16_le()?),
            0xFD => u64::from(self.read_u24_le()?),
            0xFE => self.read_u64_le()?,
            0xFF => return None,
        };
        Some(LenEnc::Value(value))
    }

    /// Read a length-encoded integer in the packed form used by protocol
    /// metadata: like [`read_field_length`](Self::read_field_length) except
    /// that 0xFE is followed by 4 bytes.
    ///
    /// Used for the result-set field count (where NULL announces LOCAL
    /// INFILE) and the column-definition fixed-field length.
    pub fn read_packed_int(&mut self) -> Option<LenEnc> {
        let first = self.read_u8()?;
        let value = match first {
            0x00..=0xFA => u64::from(first),
            0xFB => return Some(LenEnc::Null),
            0xFC => u64::from(self.read_u16_le()?),
            0xFD => u64::from(self.read_u24_le()?),
            0xFE => u64::from(self.read_u32_le()?),
            0xFF => return None,
        };
        Some(LenEnc::Value(value))
    }

    /// Read a length-encoded byte slice. NULL reads as `None`.
    pub fn read_lenenc_bytes(&mut self) -> Option<&'a [u8]> {
        let len = self.read_field_length()?.value()?;
        self.read_bytes(usize::try_from(len).ok()?)
    }

    /// Read a length-encoded string in the given encoding.
    pub fn read_lenenc_string_enc(&mut self, encoding: Encoding) -> Option<String> {
        let len = self.read_field_length()?.value()?;
        if len == 0 {
            return Some(String::new());
        }
        let bytes = self.read_bytes(usize::try_from(len).ok()?)?;
        Some(encoding.decode(bytes).into_owned())
    }

    /// Read a length-encoded UTF-8 string.
    pub fn read_lenenc_string(&mut self) -> Option<String> {
        self.read_lenenc_string_enc(Encoding::Utf8)
    }

    /// Read bytes up to a NUL (or the end of the buffer), consuming the NUL.
    pub fn read_null_bytes(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        let len = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        self.pos += len;
        if self.pos < self.data.len() {
            self.pos += 1;
        }
        &rest[..len]
    }

    /// Read a null-terminated UTF-8 string.
    pub fn read_null_string(&mut self) -> String {
        String::from_utf8_lossy(self.read_null_bytes()).into_owned()
    }

    /// Read a fixed-length UTF-8 string.
    pub fn read_string(&mut self, len: usize) -> Option<String> {
        let bytes = self.read_bytes(len)?;
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Read remaining data as a string.
    pub fn read_rest_string(&mut self) -> String {
        String::from_utf8_lossy(self.read_rest()).into_owned()
    }

    /// Read a fixed number of bytes.
    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Some(bytes)
    }

    /// Read remaining bytes.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        rest
    }

    /// Skip a number of bytes.
    pub fn skip(&mut self, n: usize) -> bool {
        if self.remaining() >= n {
            self.pos += n;
            true
        } else {
            false
        }
    }

    /// Parse an OK packet from the current position.
    ///
    /// OK packet format (protocol 4.1+):
    /// - 0x00 (or 0xFE as a DEPRECATE_EOF terminator) header
    /// - affected_rows: lenenc int
    /// - last_insert_id: lenenc int
    /// - status_flags: 2 bytes
    /// - warnings: 2 bytes
    /// - info: rest of packet (optional)
    pub fn parse_ok_packet(&mut self) -> Option<OkPacket> {
        if matches!(self.peek(), Some(0x00 | 0xFE)) {
            self.skip(1);
        }

        let affected_rows = self.read_field_length()?.value()?;
        let last_insert_id = self.read_field_length()?.value()?;
        let status_flags = self.read_u16_le().unwrap_or(0);
        let warnings = self.read_u16_le().unwrap_or(0);
        let info = self.read_rest_string();

        Some(OkPacket {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
        })
    }

    /// Parse an Error packet from the current position.
    ///
    /// ERR packet format (protocol 4.1+):
    /// - 0xFF header
    /// - error_code: 2 bytes
    /// - '#' marker
    /// - sql_state: 5 bytes
    /// - error_message: rest of packet
    pub fn parse_err_packet(&mut self) -> Option<ErrPacket> {
        if self.peek() == Some(0xFF) {
            self.skip(1);
        }

        let error_code = self.read_u16_le()?;
        let sql_state = if self.peek() == Some(b'#') {
            self.skip(1);
            self.read_string(5)?
        } else {
            String::new()
        };
        let error_message = self.read_rest_string();

        Some(ErrPacket {
            error_code,
            sql_state,
            error_message,
        })
    }

    /// Parse an EOF packet from the current position.
    ///
    /// EOF packet format:
    /// - 0xFE header
    /// - warnings: 2 bytes
    /// - status_flags: 2 bytes
    pub fn parse_eof_packet(&mut self) -> Option<EofPacket> {
        if self.peek() == Some(0xFE) {
            self.skip(1);
        }

        // Pre-4.1 servers send a bare 0xFE.
        let warnings = self.read_u16_le().unwrap_or(0);
        let status_flags = self.read_u16_le().unwrap_or(0);

        Some(EofPacket {
            warnings,
            status_flags,
        })
    }
}
