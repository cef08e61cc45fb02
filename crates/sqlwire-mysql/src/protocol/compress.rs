//! Compressed protocol envelope.
//!
//! When `CLIENT_COMPRESS` is negotiated, the ordinary packet stream is
//! carried inside outer frames with a 7-byte header:
//! - 3 bytes: length of the frame body
//! - 1 byte: compressed sequence number
//! - 3 bytes: uncompressed length, or 0 when the body is stored raw
//!
//! Bodies are zlib streams. Short payloads, and payloads that do not shrink,
//! are stored raw.

#![allow(clippy::cast_possible_truncation)]

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use sqlwire_core::{Error, Result};

use crate::protocol::MAX_PACKET_SIZE;

/// Payloads shorter than this are never compressed.
pub const MIN_COMPRESS_LENGTH: usize = 50;

/// Size of the compressed frame header.
pub const COMPRESSED_HEADER_SIZE: usize = 7;

/// State of the compressed envelope for one connection.
#[derive(Debug)]
pub struct CompressedIo {
    sequence: u8,
    threshold: usize,
    /// Outgoing packet bytes waiting for the next flush
    pending: Vec<u8>,
    /// Decompressed inbound bytes not yet handed to the packet layer
    inbound: Vec<u8>,
    inbound_pos: usize,
}

impl Default for CompressedIo {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressedIo {
    pub fn new() -> Self {
        Self::with_threshold(MIN_COMPRESS_LENGTH)
    }

    /// Use a custom minimum length below which payloads are sent raw.
    pub fn with_threshold(threshold: usize) -> Self {
        Self {
            sequence: 0,
            threshold,
            pending: Vec::new(),
            inbound: Vec::new(),
            inbound_pos: 0,
        }
    }

    /// Reset the compressed sequence at the start of a command.
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    /// Queue packet bytes for the next [`flush`](Self::flush).
    pub fn write(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    /// Send all queued bytes as one or more compressed frames.
    #[allow(clippy::result_large_err)]
    pub fn flush<S: Write>(&mut self, inner: &mut S) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending);
        let mut out = Vec::with_capacity(pending.len() + COMPRESSED_HEADER_SIZE);
        for chunk in pending.chunks(MAX_PACKET_SIZE) {
            self.encode_frame(chunk, &mut out)?;
        }
        inner.write_all(&out)?;
        inner.flush()?;
        // Keep the allocation for the next command.
        self.pending = pending;
        self.pending.clear();
        Ok(())
    }

    /// Append one outer frame carrying `payload` to `out`.
    #[allow(clippy::result_large_err)]
    pub fn encode_frame(&mut self, payload: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let compressed = if payload.len() >= self.threshold {
            let mut encoder = ZlibEncoder::new(
                Vec::with_capacity(payload.len() / 2),
                Compression::default(),
            );
            encoder.write_all(payload)?;
            Some(encoder.finish()?).filter(|body| body.len() < payload.len())
        } else {
            None
        };

        let (body, uncompressed_len) = match &compressed {
            Some(body) => (body.as_slice(), payload.len()),
            None => (payload, 0),
        };
        out.extend_from_slice(&(body.len() as u32).to_le_bytes()[..3]);
        out.push(self.sequence);
        out.extend_from_slice(&(uncompressed_len as u32).to_le_bytes()[..3]);
        out.extend_from_slice(body);
        self.sequence = self.sequence.wrapping_add(1);
        Ok(())
    }

    /// Fill `buf` from decompressed frames, reading new frames as needed.
    #[allow(clippy::result_large_err)]
    pub fn read_exact<S: Read>(&mut self, inner: &mut S, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.inbound_pos >= self.inbound.len() {
                self.read_frame(inner)?;
                continue;
            }
            let available = &self.inbound[self.inbound_pos..];
            let n = available.len().min(buf.len() - filled);
            buf[filled..filled + n].copy_from_slice(&available[..n]);
            filled += n;
            self.inbound_pos += n;
        }
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn read_frame<S: Read>(&mut self, inner: &mut S) -> Result<()> {
        let mut header = [0u8; COMPRESSED_HEADER_SIZE];
        inner.read_exact(&mut header)?;
        let body_len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
        let sequence = header[3];
        let uncompressed_len = u32::from_le_bytes([header[4], header[5], header[6], 0]) as usize;

        if sequence != self.sequence {
            return Err(Error::protocol(format!(
                "compressed packet out of order: expected sequence {}, got {}",
                self.sequence, sequence
            )));
        }
        self.sequence = self.sequence.wrapping_add(1);

        let mut body = vec![0u8; body_len];
        inner.read_exact(&mut body)?;

        self.inbound_pos = 0;
        if uncompressed_len == 0 {
            self.inbound = body;
        } else {
            self.inbound.clear();
            self.inbound.reserve(uncompressed_len);
            ZlibDecoder::new(body.as_slice())
                .take(uncompressed_len as u64 + 1)
                .read_to_end(&mut self.inbound)?;
            if self.inbound.len() != uncompressed_len {
                return Err(Error::protocol(format!(
                    "compressed packet inflated to {} bytes, header announced {}",
                    self.inbound.len(),
                    uncompressed_len
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(io: &mut CompressedIo, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        io.encode_frame(payload, &mut out).unwrap();
        out
    }

    #[test]
    fn test_short_payload_is_stored_raw() {
        let mut io = CompressedIo::new();
        let out = frame(&mut io, b"SELECT 1");
        assert_eq!(&out[..7], &[8, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&out[7..], b"SELECT 1");
    }

    #[test]
    fn test_repetitive_payload_is_compressed() {
        let payload = vec![b'a'; 4096];
        let mut io = CompressedIo::new();
        let out = frame(&mut io, &payload);
        let body_len = u32::from_le_bytes([out[0], out[1], out[2], 0]) as usize;
        let uncompressed = u32::from_le_bytes([out[4], out[5], out[6], 0]) as usize;
        assert_eq!(uncompressed, 4096);
        assert!(body_len < 4096);
        assert_eq!(out.len(), body_len + COMPRESSED_HEADER_SIZE);

        let mut reader = CompressedIo::new();
        let mut decoded = vec![0u8; 4096];
        reader.read_exact(&mut out.as_slice(), &mut decoded).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_incompressible_payload_falls_back_to_raw() {
        // A byte sequence with no repetition zlib can exploit.
        let payload: Vec<u8> = (0u32..200)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 24) as u8)
            .collect();
        let mut io = CompressedIo::with_threshold(10);
        let out = frame(&mut io, &payload);
        let body_len = u32::from_le_bytes([out[0], out[1], out[2], 0]) as usize;
        if body_len == payload.len() {
            assert_eq!(&out[4..7], &[0, 0, 0]);
            assert_eq!(&out[7..], payload.as_slice());
        } else {
            assert!(body_len < payload.len());
        }
    }

    #[test]
    fn test_frames_carry_incrementing_sequence() {
        let mut io = CompressedIo::new();
        let mut out = Vec::new();
        io.encode_frame(b"one", &mut out).unwrap();
        io.encode_frame(b"two", &mut out).unwrap();
        assert_eq!(out[3], 0);
        assert_eq!(out[COMPRESSED_HEADER_SIZE + 3 + 3], 1);

        let mut reader = CompressedIo::new();
        let mut buf = [0u8; 6];
        reader.read_exact(&mut out.as_slice(), &mut buf).unwrap();
        assert_eq!(&buf, b"onetwo");
    }

    #[test]
    fn test_inflated_body_is_capped_at_announced_length() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&vec![0u8; 1 << 20]).unwrap();
        let body = encoder.finish().unwrap();

        let mut out = Vec::new();
        out.extend_from_slice(&(body.len() as u32).to_le_bytes()[..3]);
        out.push(0);
        out.extend_from_slice(&64u32.to_le_bytes()[..3]);
        out.extend_from_slice(&body);

        let mut reader = CompressedIo::new();
        let mut buf = [0u8; 64];
        let err = reader.read_exact(&mut out.as_slice(), &mut buf).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(reader.inbound.len() <= 65);
    }

    #[test]
    fn test_out_of_order_frame_is_desync() {
        let mut writer = CompressedIo::new();
        writer.encode_frame(b"x", &mut Vec::new()).unwrap();
        let out = frame(&mut writer, b"y");

        let mut reader = CompressedIo::new();
        let mut buf = [0u8; 1];
        let err = reader.read_exact(&mut out.as_slice(), &mut buf).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
