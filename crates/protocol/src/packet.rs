//! Packet codec for the daemon wire format.
//!
//! # Packet Format
//!
//! Each packet consists of a 24-byte header followed by the payload:
//! - 4 bytes: command tag (little-endian, the ASCII mnemonic)
//! - 4 bytes: arg0
//! - 4 bytes: arg1
//! - 4 bytes: payload length
//! - 4 bytes: checksum (wrapping byte sum of the payload)
//! - 4 bytes: magic (`command ^ 0xFFFFFFFF`)
//!
//! # Checksums
//!
//! Serialization always fills in a valid checksum. Validation on receive is
//! only performed when the negotiated protocol version predates
//! [`crate::VERSION_SKIP_CHECKSUM`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::auth::ConnectionParams;
use crate::error::{ProtocolError, Result};

/// Header size: six little-endian u32 fields.
pub const PACKET_HEADER_SIZE: usize = 24;

/// Upper bound on a declared payload before the decoder refuses to buffer it (16 MB).
pub const MAX_PAYLOAD_SIZE_LIMIT: usize = 16 * 1024 * 1024;

/// Packet command tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    /// `CNXN`: connection banner exchange.
    Connect = 0x4e58_4e43,
    /// `AUTH`: token, signature or public key.
    Auth = 0x4854_5541,
    /// `OPEN`: open a socket to a service.
    Open = 0x4e45_504f,
    /// `OKAY`: socket ready or write acknowledged.
    Okay = 0x5941_4b4f,
    /// `WRTE`: socket payload.
    Write = 0x4554_5257,
    /// `CLSE`: socket closed or open refused.
    Close = 0x4553_4c43,
}

impl Command {
    /// Raw tag value as sent on the wire.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Expected magic for this command.
    pub fn magic(self) -> u32 {
        self.as_u32() ^ 0xFFFF_FFFF
    }

    /// Four-character mnemonic, for logs.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Command::Connect => "CNXN",
            Command::Auth => "AUTH",
            Command::Open => "OPEN",
            Command::Okay => "OKAY",
            Command::Write => "WRTE",
            Command::Close => "CLSE",
        }
    }
}

impl TryFrom<u32> for Command {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0x4e58_4e43 => Ok(Command::Connect),
            0x4854_5541 => Ok(Command::Auth),
            0x4e45_504f => Ok(Command::Open),
            0x5941_4b4f => Ok(Command::Okay),
            0x4554_5257 => Ok(Command::Write),
            0x4553_4c43 => Ok(Command::Close),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Wrapping sum of all payload bytes.
pub fn checksum(payload: &[u8]) -> u32 {
    payload
        .iter()
        .fold(0u32, |sum, byte| sum.wrapping_add(u32::from(*byte)))
}

/// Raw packet header exactly as laid out on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Command tag.
    pub command: u32,
    /// First argument.
    pub arg0: u32,
    /// Second argument.
    pub arg1: u32,
    /// Declared payload length.
    pub payload_length: u32,
    /// Payload checksum.
    pub checksum: u32,
    /// Complement of the command.
    pub magic: u32,
}

impl PacketHeader {
    /// Builds a header for the given command and payload, filling length,
    /// checksum and magic.
    pub fn new(command: Command, arg0: u32, arg1: u32, payload: &[u8]) -> Self {
        Self {
            command: command.as_u32(),
            arg0,
            arg1,
            payload_length: payload.len() as u32,
            checksum: checksum(payload),
            magic: command.magic(),
        }
    }

    /// Encodes the header into its 24-byte wire form.
    pub fn encode(&self) -> [u8; PACKET_HEADER_SIZE] {
        let mut out = [0u8; PACKET_HEADER_SIZE];
        let mut buf = &mut out[..];
        buf.put_u32_le(self.command);
        buf.put_u32_le(self.arg0);
        buf.put_u32_le(self.arg1);
        buf.put_u32_le(self.payload_length);
        buf.put_u32_le(self.checksum);
        buf.put_u32_le(self.magic);
        out
    }

    /// Decodes a header from at least 24 bytes.
    ///
    /// Only the layout is checked here; use [`PacketHeader::validate_magic`]
    /// to check the magic.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < PACKET_HEADER_SIZE {
            return Err(ProtocolError::MalformedPacket(format!(
                "insufficient data for header: need {} bytes, have {}",
                PACKET_HEADER_SIZE,
                data.len()
            )));
        }

        let mut buf = &data[..PACKET_HEADER_SIZE];
        Ok(Self {
            command: buf.get_u32_le(),
            arg0: buf.get_u32_le(),
            arg1: buf.get_u32_le(),
            payload_length: buf.get_u32_le(),
            checksum: buf.get_u32_le(),
            magic: buf.get_u32_le(),
        })
    }

    /// Checks `magic == !command`.
    pub fn validate_magic(&self) -> Result<()> {
        if self.magic != self.command ^ 0xFFFF_FFFF {
            return Err(ProtocolError::BadMagic {
                command: self.command,
                magic: self.magic,
            });
        }
        Ok(())
    }
}

/// A decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Command tag.
    pub command: Command,
    /// First argument.
    pub arg0: u32,
    /// Second argument.
    pub arg1: u32,
    /// Payload bytes.
    pub payload: Bytes,
}

impl Packet {
    /// Creates a new packet.
    pub fn new(command: Command, arg0: u32, arg1: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            command,
            arg0,
            arg1,
            payload: payload.into(),
        }
    }

    /// Header describing this packet.
    pub fn header(&self) -> PacketHeader {
        PacketHeader::new(self.command, self.arg0, self.arg1, &self.payload)
    }

    /// Serializes header and payload into a single buffer.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PACKET_HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.header().encode());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Deserializes a complete packet.
    ///
    /// `data` must contain exactly one header and its payload.
    pub fn deserialize(data: &[u8], checksum_required: bool) -> Result<Self> {
        let header = PacketHeader::decode(data)?;
        header.validate_magic()?;

        let payload = &data[PACKET_HEADER_SIZE..];
        if payload.len() != header.payload_length as usize {
            return Err(ProtocolError::MalformedPacket(format!(
                "declared payload length {} but {} bytes present",
                header.payload_length,
                payload.len()
            )));
        }

        Self::from_parts(header, Bytes::copy_from_slice(payload), checksum_required)
    }

    fn from_parts(header: PacketHeader, payload: Bytes, checksum_required: bool) -> Result<Self> {
        let command = Command::try_from(header.command)?;

        if checksum_required {
            let actual = checksum(&payload);
            if actual != header.checksum {
                return Err(ProtocolError::ChecksumMismatch {
                    expected: header.checksum,
                    actual,
                });
            }
        }

        Ok(Self {
            command,
            arg0: header.arg0,
            arg1: header.arg1,
            payload,
        })
    }
}

/// Streaming codec for packets over a byte channel.
#[derive(Debug, Clone, Default)]
pub struct PacketCodec {
    checksum_required: bool,
    header: Option<PacketHeader>,
}

impl PacketCodec {
    /// Codec for an established connection.
    pub fn new(params: &ConnectionParams) -> Self {
        Self {
            checksum_required: params.checksum_required,
            header: None,
        }
    }

    /// Codec used before parameters are negotiated. Checksums are not
    /// validated because the peer version is not yet known.
    pub fn handshake() -> Self {
        Self::default()
    }

    /// Whether incoming checksums are validated.
    pub fn checksum_required(&self) -> bool {
        self.checksum_required
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        let header = match self.header {
            Some(header) => header,
            None => {
                if src.len() < PACKET_HEADER_SIZE {
                    return Ok(None);
                }
                let header = PacketHeader::decode(&src[..])?;
                header.validate_magic()?;
                if header.payload_length as usize > MAX_PAYLOAD_SIZE_LIMIT {
                    return Err(ProtocolError::MalformedPacket(format!(
                        "payload length {} exceeds limit of {} bytes",
                        header.payload_length, MAX_PAYLOAD_SIZE_LIMIT
                    )));
                }
                src.advance(PACKET_HEADER_SIZE);
                self.header = Some(header);
                header
            }
        };

        let length = header.payload_length as usize;
        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        self.header = None;
        let payload = src.split_to(length).freeze();
        Packet::from_parts(header, payload, self.checksum_required).map(Some)
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(PACKET_HEADER_SIZE + packet.payload.len());
        dst.put_slice(&packet.header().encode());
        dst.put_slice(&packet.payload);
        Ok(())
    }
}
