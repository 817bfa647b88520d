//! Shell v2 inner framing.
//!
//! # Packet Format
//!
//! Inside a `shell,v2` socket every message is:
//! - 1 byte: stream id
//! - 4 bytes: data length (little-endian)
//! - N bytes: data
//!
//! Messages may be split or coalesced arbitrarily across socket writes, so
//! [`ShellCodec`] buffers until a whole message is available.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ProtocolError, Result};

/// Inner header size: id + length.
pub const SHELL_HEADER_SIZE: usize = 5;

/// Largest shell message the decoder will buffer (16 MB).
pub const MAX_SHELL_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Interrupt character written by `sigint`.
pub const CTRL_C: u8 = 0x03;

/// Shell v2 stream id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ShellStreamId {
    /// Host to device input.
    Stdin = 0,
    /// Device standard output.
    Stdout = 1,
    /// Device standard error.
    Stderr = 2,
    /// Exit status; data is a single byte.
    Exit = 3,
    /// Host closed its input.
    CloseStdin = 4,
    /// Terminal resize.
    WindowSizeChange = 5,
}

impl TryFrom<u8> for ShellStreamId {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ShellStreamId::Stdin),
            1 => Ok(ShellStreamId::Stdout),
            2 => Ok(ShellStreamId::Stderr),
            3 => Ok(ShellStreamId::Exit),
            4 => Ok(ShellStreamId::CloseStdin),
            5 => Ok(ShellStreamId::WindowSizeChange),
            other => Err(ProtocolError::ShellProtocol(format!(
                "unknown stream id {other}"
            ))),
        }
    }
}

/// A single shell v2 message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellPacket {
    /// Stream the data belongs to.
    pub id: ShellStreamId,
    /// Message body.
    pub data: Bytes,
}

impl ShellPacket {
    /// Creates a message.
    pub fn new(id: ShellStreamId, data: impl Into<Bytes>) -> Self {
        Self {
            id,
            data: data.into(),
        }
    }

    /// Standard input.
    pub fn stdin(data: impl Into<Bytes>) -> Self {
        Self::new(ShellStreamId::Stdin, data)
    }

    /// End of standard input.
    pub fn close_stdin() -> Self {
        Self::new(ShellStreamId::CloseStdin, Bytes::new())
    }

    /// Resize notification: `"<rows>x<cols>,0x0\0"`.
    pub fn window_size(rows: u16, cols: u16) -> Self {
        Self::new(
            ShellStreamId::WindowSizeChange,
            format!("{rows}x{cols},0x0\0"),
        )
    }

    /// Exit code carried by an [`ShellStreamId::Exit`] message.
    pub fn exit_code(&self) -> Result<u8> {
        if self.id != ShellStreamId::Exit {
            return Err(ProtocolError::ShellProtocol(format!(
                "{:?} message has no exit code",
                self.id
            )));
        }
        match self.data.first() {
            Some(code) if self.data.len() == 1 => Ok(*code),
            _ => Err(ProtocolError::ShellProtocol(format!(
                "exit message must carry one byte, got {}",
                self.data.len()
            ))),
        }
    }

    /// Encodes into a standalone buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SHELL_HEADER_SIZE + self.data.len());
        buf.put_u8(self.id as u8);
        buf.put_u32_le(self.data.len() as u32);
        buf.put_slice(&self.data);
        buf.freeze()
    }
}

/// Streaming codec for shell v2 messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellCodec;

impl ShellCodec {
    /// Creates a codec.
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for ShellCodec {
    type Item = ShellPacket;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ShellPacket>> {
        if src.len() < SHELL_HEADER_SIZE {
            return Ok(None);
        }

        let id = ShellStreamId::try_from(src[0])?;
        let length = u32::from_le_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if length > MAX_SHELL_PACKET_SIZE {
            return Err(ProtocolError::ShellProtocol(format!(
                "message length {length} exceeds limit"
            )));
        }

        if src.len() < SHELL_HEADER_SIZE + length {
            src.reserve(SHELL_HEADER_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(SHELL_HEADER_SIZE);
        let data = src.split_to(length).freeze();
        Ok(Some(ShellPacket { id, data }))
    }
}

impl Encoder<ShellPacket> for ShellCodec {
    type Error = ProtocolError;

    fn encode(&mut self, packet: ShellPacket, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(SHELL_HEADER_SIZE + packet.data.len());
        dst.put_u8(packet.id as u8);
        dst.put_u32_le(packet.data.len() as u32);
        dst.put_slice(&packet.data);
        Ok(())
    }
}
