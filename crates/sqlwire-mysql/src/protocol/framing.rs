//! Packet framing over a byte stream.
//!
//! A logical payload of any size is sent as consecutive frames of at most
//! [`MAX_PACKET_SIZE`] bytes. A frame of exactly the maximum size means
//! another frame follows, so a payload whose length is a positive multiple
//! of the maximum ends with an empty frame.
//!
//! Every frame carries a sequence number. Sequences restart at zero with
//! each command and both directions share the counter; a frame arriving
//! with any other number means the stream is desynchronized and the
//! session must be abandoned.

#![allow(clippy::cast_possible_truncation)]

use std::io::{Read, Write};

use sqlwire_core::{Error, Result};

use super::compress::CompressedIo;
use super::{MAX_PACKET_SIZE, PacketHeader};

/// Framed packet I/O over a transport.
#[derive(Debug)]
pub struct PacketStream<S> {
    inner: S,
    compression: Option<CompressedIo>,
    sequence: u8,
    max_frame: usize,
    /// Reassembled inbound payload, reused across reads
    read_buf: Vec<u8>,
    /// Outbound frame staging, so a header and its body go out together
    write_buf: Vec<u8>,
}

impl<S: Read + Write> PacketStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            compression: None,
            sequence: 0,
            max_frame: MAX_PACKET_SIZE,
            read_buf: Vec::with_capacity(8192),
            write_buf: Vec::with_capacity(8192),
        }
    }

    /// Lower the frame size limit. Only useful for exercising continuation
    /// frames without 16MB payloads.
    #[cfg(test)]
    pub(crate) fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    /// Route all further traffic through the compressed envelope.
    pub fn enable_compression(&mut self) {
        if self.compression.is_none() {
            self.compression = Some(CompressedIo::new());
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.compression.is_some()
    }

    /// Sequence number the next frame must carry.
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Start a new command exchange.
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
        if let Some(compression) = &mut self.compression {
            compression.reset_sequence();
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Replace the transport mid-exchange, as for a TLS upgrade. The
    /// sequence carries over.
    #[allow(clippy::result_large_err)]
    pub fn map_inner<T, F>(self, wrap: F) -> Result<PacketStream<T>>
    where
        F: FnOnce(S) -> Result<T>,
    {
        Ok(PacketStream {
            inner: wrap(self.inner)?,
            compression: self.compression,
            sequence: self.sequence,
            max_frame: self.max_frame,
            read_buf: self.read_buf,
            write_buf: self.write_buf,
        })
    }

    /// Read one logical payload, joining continuation frames.
    ///
    /// The returned slice is valid until the next read.
    #[allow(clippy::result_large_err)]
    pub fn read_packet(&mut self) -> Result<&[u8]> {
        self.read_buf.clear();
        loop {
            let mut header = [0u8; PacketHeader::SIZE];
            self.fill(HeaderOrBody::Header(&mut header))?;
            let header = PacketHeader::from_bytes(&header);

            if header.sequence_id != self.sequence {
                return Err(Error::protocol(format!(
                    "packet out of order: expected sequence {}, got {}",
                    self.sequence, header.sequence_id
                )));
            }
            self.sequence = self.sequence.wrapping_add(1);

            let len = header.payload_length as usize;
            let start = self.read_buf.len();
            self.read_buf.resize(start + len, 0);
            self.fill(HeaderOrBody::Body(start))?;

            if len < self.max_frame {
                break;
            }
        }
        tracing::trace!(len = self.read_buf.len(), "read packet");
        Ok(&self.read_buf)
    }

    /// Write one logical payload, splitting it into frames as needed.
    #[allow(clippy::result_large_err)]
    pub fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        let mut offset = 0;
        loop {
            let len = (payload.len() - offset).min(self.max_frame);
            let header = PacketHeader {
                payload_length: len as u32,
                sequence_id: self.sequence,
            };
            self.write_buf.clear();
            self.write_buf.extend_from_slice(&header.to_bytes());
            self.write_buf
                .extend_from_slice(&payload[offset..offset + len]);
            match &mut self.compression {
                Some(compression) => compression.write(&self.write_buf),
                None => self.inner.write_all(&self.write_buf)?,
            }
            self.sequence = self.sequence.wrapping_add(1);
            offset += len;
            if len < self.max_frame {
                break;
            }
        }
        tracing::trace!(len = payload.len(), "wrote packet");
        self.flush()
    }

    /// Start a new command: reset the sequence, then send `payload`.
    #[allow(clippy::result_large_err)]
    pub fn write_command(&mut self, payload: &[u8]) -> Result<()> {
        self.reset_sequence();
        self.write_packet(payload)
    }

    #[allow(clippy::result_large_err)]
    fn flush(&mut self) -> Result<()> {
        match &mut self.compression {
            Some(compression) => compression.flush(&mut self.inner),
            None => Ok(self.inner.flush()?),
        }
    }

    #[allow(clippy::result_large_err)]
    fn fill(&mut self, target: HeaderOrBody<'_>) -> Result<()> {
        let buf = match target {
            HeaderOrBody::Header(header) => &mut header[..],
            HeaderOrBody::Body(start) => &mut self.read_buf[start..],
        };
        match &mut self.compression {
            Some(compression) => compression.read_exact(&mut self.inner, buf),
            None => Ok(self.inner.read_exact(buf)?),
        }
    }
}

enum HeaderOrBody<'a> {
    Header(&'a mut [u8; PacketHeader::SIZE]),
    Body(usize),
}
