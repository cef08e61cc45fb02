//! MySQL payload writing utilities.
//!
//! [`PacketWriter`] builds a single logical payload. Framing into 4-byte
//! header packets is the job of [`PacketStream`](crate::protocol::PacketStream).

#![allow(clippy::cast_possible_truncation)]

use crate::charset::Encoding;
use crate::protocol::Command;

/// A writer for MySQL protocol data.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buffer: Vec<u8>,
}

impl PacketWriter {
    /// Create a new writer with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// Create a new writer with specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Start a command payload with its command byte.
    pub fn command(command: Command) -> Self {
        let mut writer = Self::new();
        writer.write_u8(command as u8);
        writer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Get the buffer as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume the writer and return the buffer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Write a single byte.
    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    /// Write a u16 (little-endian).
    pub fn write_u16_le(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a u24 (little-endian, 3 bytes).
    pub fn write_u24_le(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes()[..3]);
    }

    /// Write a u32 (little-endian).
    pub fn write_u32_le(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a u64 (little-endian).
    pub fn write_u64_le(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a length-encoded integer (field-length form).
    ///
    /// - 0x00-0xFA: 1-byte value
    /// - 0xFC + 2 bytes: values up to 2^16
    /// - 0xFD + 3 bytes: values up to 2^24
    /// - 0xFE + 8 bytes: everything larger
    pub fn write_lenenc_int(&mut self, value: u64) {
        if value < 251 {
            self.write_u8(value as u8);
        } else if value < 0x1_0000 {
            self.write_u8(0xFC);
            self.write_u16_le(value as u16);
        } else if value < 0x0100_0000 {
            self.write_u8(0xFD);
            self.write_u24_le(value as u32);
        } else {
            self.write_u8(0xFE);
            self.write_u64_le(value);
        }
    }

    /// Write a length-encoded UTF-8 string.
    pub fn write_lenenc_string(&mut self, s: &str) {
        self.write_lenenc_bytes(s.as_bytes());
    }

    /// Write a length-encoded string in the given encoding.
    pub fn write_lenenc_string_enc(&mut self, s: &str, encoding: Encoding) {
        self.write_lenenc_bytes(&encoding.encode(s));
    }

    /// Write a length-encoded byte slice.
    pub fn write_lenenc_bytes(&mut self, data: &[u8]) {
        self.write_lenenc_int(data.len() as u64);
        self.buffer.extend_from_slice(data);
    }

    /// Write a null-terminated string.
    pub fn write_null_string(&mut self, s: &str) {
        self.buffer.extend_from_slice(s.as_bytes());
        self.buffer.push(0);
    }

    /// Write a string in the given encoding, without terminator.
    pub fn write_string_enc(&mut self, s: &str, encoding: Encoding) {
        self.buffer.extend_from_slice(&encoding.encode(s));
    }

    /// Write raw bytes.
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Write zeros (padding).
    pub fn write_zeros(&mut self, count: usize) {
        self.buffer.resize(self.buffer.len() + count, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_fixed_integers() {
        let mut writer = PacketWriter::new();
        writer.write_u8(0x42);
        writer.write_u16_le(0x1234);
        writer.write_u24_le(0x0012_3456);
        writer.write_u32_le(0x1234_5678);
        assert_eq!(
            writer.as_bytes(),
            &[0x42, 0x34, 0x12, 0x56, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12]
        );
    }

    #[test]
    fn test_write_lenenc_int() {
        let cases: [(u64, &[u8]); 4] = [
            (0x42, &[0x42]),
            (0x1234, &[0xFC, 0x34, 0x12]),
            (0x0012_3456, &[0xFD, 0x56, 0x34, 0x12]),
            (
                0x0807_0605_0403_0201,
                &[0xFE, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08],
            ),
        ];
        for (value, expected) in cases {
            let mut writer = PacketWriter::new();
            writer.write_lenenc_int(value);
            assert_eq!(writer.as_bytes(), expected);
        }
    }

    #[test]
    fn test_write_strings() {
        let mut writer = PacketWriter::new();
        writer.write_null_string("hi");
        writer.write_lenenc_string("hello");
        assert_eq!(writer.as_bytes(), b"hi\0\x05hello");
    }

    #[test]
    fn test_write_lenenc_string_enc() {
        let mut writer = PacketWriter::new();
        writer.write_lenenc_string_enc("\u{e9}", Encoding::Windows1252);
        assert_eq!(writer.as_bytes(), &[0x01, 0xE9]);
    }

    #[test]
    fn test_command_prefix() {
        let mut writer = PacketWriter::command(Command::Query);
        writer.write_bytes(b"SELECT 1");
        assert_eq!(writer.as_bytes()[0], 0x03);
        assert_eq!(&writer.as_bytes()[1..], b"SELECT 1");
    }
}
