//! File sync sub-protocol framing.
//!
//! A `sync:` socket carries request/response pairs. Every message starts
//! with a four-character id read as a little-endian u32.
//!
//! ```text
//! request   id | u32 len | bytes        (LIST, STAT, SEND, RECV, DATA, ...)
//!           id | u32 value              (DONE carries the mtime)
//! response  id | fixed struct [| u32 len | bytes]
//! ```
//!
//! v1 stat replies carry mode, size and mtime only. v2 replies carry the
//! full `struct stat` plus an error code.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;

use crate::error::{ProtocolError, Result};

/// Largest DATA chunk the daemon accepts (64 KB).
pub const SYNC_DATA_MAX: usize = 64 * 1024;

/// Mode used for pushed files when none is given: regular file, `rw-rw-rw-`.
pub const DEFAULT_FILE_MODE: u32 = ((LinuxFileType::File as u32) << 12) | 0o666;

/// A sync message id.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncId(pub u32);

impl SyncId {
    /// List a directory (v1).
    pub const LIST: SyncId = SyncId::from_ascii(b"LIST");
    /// List a directory (v2).
    pub const LIST_V2: SyncId = SyncId::from_ascii(b"LIS2");
    /// Push a file (v1).
    pub const SEND: SyncId = SyncId::from_ascii(b"SEND");
    /// Push a file (v2).
    pub const SEND_V2: SyncId = SyncId::from_ascii(b"SND2");
    /// Pull a file.
    pub const RECV: SyncId = SyncId::from_ascii(b"RECV");
    /// lstat (v1); also the v1 stat reply.
    pub const STAT_V1: SyncId = SyncId::from_ascii(b"STAT");
    /// stat (v2); also its reply.
    pub const STAT_V2: SyncId = SyncId::from_ascii(b"STA2");
    /// lstat (v2); also its reply.
    pub const LSTAT_V2: SyncId = SyncId::from_ascii(b"LST2");
    /// Directory entry (v1).
    pub const DENT: SyncId = SyncId::from_ascii(b"DENT");
    /// Directory entry (v2).
    pub const DENT_V2: SyncId = SyncId::from_ascii(b"DNT2");
    /// File data chunk.
    pub const DATA: SyncId = SyncId::from_ascii(b"DATA");
    /// End of a listing, pull or push.
    pub const DONE: SyncId = SyncId::from_ascii(b"DONE");
    /// Push accepted.
    pub const OKAY: SyncId = SyncId::from_ascii(b"OKAY");
    /// Request failed; carries a message.
    pub const FAIL: SyncId = SyncId::from_ascii(b"FAIL");
    /// Ends the sync session.
    pub const QUIT: SyncId = SyncId::from_ascii(b"QUIT");

    /// Id from its four ASCII characters.
    pub const fn from_ascii(tag: &[u8; 4]) -> Self {
        SyncId(u32::from_le_bytes(*tag))
    }

    /// Wire bytes.
    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for SyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.to_bytes();
        if bytes.iter().all(u8::is_ascii_graphic) {
            f.write_str(&String::from_utf8_lossy(&bytes))
        } else {
            write!(f, "{:#010x}", self.0)
        }
    }
}

impl fmt::Debug for SyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SyncId({self})")
    }
}

/// File type from the high bits of `st_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum LinuxFileType {
    /// Named pipe.
    Fifo = 1,
    /// Character device.
    CharDevice = 2,
    /// Directory.
    Directory = 4,
    /// Block device.
    BlockDevice = 6,
    /// Regular file.
    File = 8,
    /// Symbolic link.
    Symlink = 10,
    /// Unix socket.
    Socket = 12,
}

impl LinuxFileType {
    /// Extracts the type from a mode.
    pub fn from_mode(mode: u32) -> Option<Self> {
        match (mode >> 12) & 0xF {
            1 => Some(Self::Fifo),
            2 => Some(Self::CharDevice),
            4 => Some(Self::Directory),
            6 => Some(Self::BlockDevice),
            8 => Some(Self::File),
            10 => Some(Self::Symlink),
            12 => Some(Self::Socket),
            _ => None,
        }
    }
}

/// Flags of a SND2 request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendFlags(u32);

impl SendFlags {
    /// Uncompressed.
    pub const NONE: u32 = 0;
    /// Brotli-compressed data.
    pub const BROTLI: u32 = 1;
    /// LZ4-compressed data.
    pub const LZ4: u32 = 2;
    /// Zstd-compressed data.
    pub const ZSTD: u32 = 4;
    /// Validate without writing.
    pub const DRY_RUN: u32 = 0x8000_0000;

    /// Flags from a raw value.
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw value.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Adds `flag` when `enabled`.
    pub fn with(mut self, flag: u32, enabled: bool) -> Self {
        if enabled {
            self.0 |= flag;
        }
        self
    }

    /// Whether every bit of `flag` is set.
    pub fn contains(self, flag: u32) -> bool {
        self.0 & flag == flag
    }
}

/// `id | u32 len | data`.
pub fn encode_request(id: SyncId, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + data.len());
    buf.put_u32_le(id.0);
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
    buf.freeze()
}

/// `id | u32 value`.
pub fn encode_numeric(id: SyncId, value: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u32_le(id.0);
    buf.put_u32_le(value);
    buf.freeze()
}

/// SND2 header sent after the path request: `SND2 | mode | flags`.
pub fn encode_send_v2_header(mode: u32, flags: SendFlags) -> Bytes {
    let mut buf = BytesMut::with_capacity(12);
    buf.put_u32_le(SyncId::SEND_V2.0);
    buf.put_u32_le(mode);
    buf.put_u32_le(flags.bits());
    buf.freeze()
}

/// Reads the id at the start of a response.
pub fn decode_id(data: &[u8]) -> Result<SyncId> {
    let bytes: [u8; 4] = data
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| ProtocolError::SyncProtocol("truncated message id".to_string()))?;
    Ok(SyncId(u32::from_le_bytes(bytes)))
}

/// Reads a little-endian u32 length or value.
pub fn decode_u32(data: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = data
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| ProtocolError::SyncProtocol("truncated length field".to_string()))?;
    Ok(u32::from_le_bytes(bytes))
}

fn check_len(data: &[u8], expected: usize, what: &str) -> Result<()> {
    if data.len() != expected {
        return Err(ProtocolError::SyncProtocol(format!(
            "{what} must be {expected} bytes, got {}",
            data.len()
        )));
    }
    Ok(())
}

/// v1 stat reply body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LstatV1 {
    /// `st_mode`.
    pub mode: u32,
    /// Size, truncated to 32 bits.
    pub size: u32,
    /// Modification time in seconds.
    pub mtime: u32,
}

impl LstatV1 {
    /// Encoded size.
    pub const SIZE: usize = 12;

    /// Parses exactly [`Self::SIZE`] bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        check_len(data, Self::SIZE, "v1 stat")?;
        let mut buf = data;
        Ok(Self {
            mode: buf.get_u32_le(),
            size: buf.get_u32_le(),
            mtime: buf.get_u32_le(),
        })
    }

    /// Encodes the body.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.mode);
        dst.put_u32_le(self.size);
        dst.put_u32_le(self.mtime);
    }

    /// The daemon reports a missing path as all zeros.
    pub fn is_empty(&self) -> bool {
        self.mode == 0 && self.size == 0 && self.mtime == 0
    }
}

/// v2 stat reply body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatV2 {
    /// errno on failure, 0 on success.
    pub error: u32,
    /// Device id.
    pub dev: u64,
    /// Inode.
    pub ino: u64,
    /// `st_mode`.
    pub mode: u32,
    /// Link count.
    pub nlink: u32,
    /// Owner.
    pub uid: u32,
    /// Group.
    pub gid: u32,
    /// Size in bytes.
    pub size: u64,
    /// Access time.
    pub atime: u64,
    /// Modification time.
    pub mtime: u64,
    /// Status change time.
    pub ctime: u64,
}

impl StatV2 {
    /// Encoded size.
    pub const SIZE: usize = 68;

    /// Parses exactly [`Self::SIZE`] bytes.
    pub fn decode(data: &[u8]) -> Result<Self> {
        check_len(data, Self::SIZE, "v2 stat")?;
        let mut buf = data;
        Ok(Self {
            error: buf.get_u32_le(),
            dev: buf.get_u64_le(),
            ino: buf.get_u64_le(),
            mode: buf.get_u32_le(),
            nlink: buf.get_u32_le(),
            uid: buf.get_u32_le(),
            gid: buf.get_u32_le(),
            size: buf.get_u64_le(),
            atime: buf.get_u64_le(),
            mtime: buf.get_u64_le(),
            ctime: buf.get_u64_le(),
        })
    }

    /// Encodes the body.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32_le(self.error);
        dst.put_u64_le(self.dev);
        dst.put_u64_le(self.ino);
        dst.put_u32_le(self.mode);
        dst.put_u32_le(self.nlink);
        dst.put_u32_le(self.uid);
        dst.put_u32_le(self.gid);
        dst.put_u64_le(self.size);
        dst.put_u64_le(self.atime);
        dst.put_u64_le(self.mtime);
        dst.put_u64_le(self.ctime);
    }
}

/// Fixed part of a v1 directory entry: stat plus name length.
pub const DENT_V1_FIXED_SIZE: usize = LstatV1::SIZE + 4;

/// Fixed part of a v2 directory entry: stat plus name length.
pub const DENT_V2_FIXED_SIZE: usize = StatV2::SIZE + 4;

/// Fixed part of a DATA response: the length.
pub const DATA_FIXED_SIZE: usize = 4;

/// File metadata, from either stat version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncStat {
    /// `st_mode`.
    pub mode: u32,
    /// Size in bytes.
    pub size: u64,
    /// Modification time in seconds.
    pub mtime: u64,
    /// Device id (v2 only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dev: Option<u64>,
    /// Inode (v2 only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ino: Option<u64>,
    /// Link count (v2 only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nlink: Option<u32>,
    /// Owner (v2 only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    /// Group (v2 only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    /// Access time (v2 only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atime: Option<u64>,
    /// Status change time (v2 only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ctime: Option<u64>,
}

impl SyncStat {
    /// File type bits of the mode.
    pub fn file_type(&self) -> Option<LinuxFileType> {
        LinuxFileType::from_mode(self.mode)
    }

    /// Permission bits of the mode.
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }

    /// Whether this is a directory.
    pub fn is_dir(&self) -> bool {
        self.file_type() == Some(LinuxFileType::Directory)
    }
}

impl From<LstatV1> for SyncStat {
    fn from(stat: LstatV1) -> Self {
        Self {
            mode: stat.mode,
            size: u64::from(stat.size),
            mtime: u64::from(stat.mtime),
            dev: None,
            ino: None,
            nlink: None,
            uid: None,
            gid: None,
            atime: None,
            ctime: None,
        }
    }
}

impl From<StatV2> for SyncStat {
    fn from(stat: StatV2) -> Self {
        Self {
            mode: stat.mode,
            size: stat.size,
            mtime: stat.mtime,
            dev: Some(stat.dev),
            ino: Some(stat.ino),
            nlink: Some(stat.nlink),
            uid: Some(stat.uid),
            gid: Some(stat.gid),
            atime: Some(stat.atime),
            ctime: Some(stat.ctime),
        }
    }
}

/// A directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncEntry {
    /// File name, without the directory.
    pub name: String,
    /// Metadata.
    #[serde(flatten)]
    pub stat: SyncStat,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_ascii() {
        assert_eq!(&SyncId::LIST.to_bytes(), b"LIST");
        assert_eq!(&SyncId::SEND_V2.to_bytes(), b"SND2");
        assert_eq!(SyncId::DATA.0, 0x4154_4144);
        assert_eq!(SyncId::DONE.to_string(), "DONE");
        assert_eq!(SyncId(1).to_string(), "0x00000001");
    }

    #[test]
    fn test_encode_request() {
        let encoded = encode_request(SyncId::STAT_V1, b"/sdcard");
        assert_eq!(&encoded[..4], b"STAT");
        assert_eq!(&encoded[4..8], &7u32.to_le_bytes());
        assert_eq!(&encoded[8..], b"/sdcard");
    }

    #[test]
    fn test_encode_done_with_mtime() {
        let encoded = encode_numeric(SyncId::DONE, 1_700_000_000);
        assert_eq!(&encoded[..4], b"DONE");
        assert_eq!(decode_u32(&encoded[4..]).unwrap(), 1_700_000_000);
    }

    #[test]
    fn test_send_v2_header() {
        let flags = SendFlags::default()
            .with(SendFlags::LZ4, true)
            .with(SendFlags::DRY_RUN, true);
        let encoded = encode_send_v2_header(0o100644, flags);

        assert_eq!(encoded.len(), 12);
        assert_eq!(&encoded[..4], b"SND2");
        assert_eq!(decode_u32(&encoded[4..8]).unwrap(), 0o100644);
        assert_eq!(decode_u32(&encoded[8..]).unwrap(), 0x8000_0002);
        assert!(flags.contains(SendFlags::LZ4));
        assert!(!flags.contains(SendFlags::BROTLI));
    }

    #[test]
    fn test_default_mode() {
        assert_eq!(DEFAULT_FILE_MODE, 0o100666);
    }

    #[test]
    fn test_stat_v1_decode() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(0o040755);
        buf.put_u32_le(4096);
        buf.put_u32_le(1234);

        let stat = LstatV1::decode(&buf).unwrap();
        assert_eq!(stat.mode, 0o040755);
        assert!(!stat.is_empty());

        let stat = SyncStat::from(stat);
        assert!(stat.is_dir());
        assert_eq!(stat.permissions(), 0o755);
        assert_eq!(stat.size, 4096);
        assert!(stat.uid.is_none());
    }

    #[test]
    fn test_stat_v1_zero_is_empty() {
        assert!(LstatV1::decode(&[0u8; 12]).unwrap().is_empty());
    }

    #[test]
    fn test_stat_v2_layout() {
        let stat = StatV2 {
            error: 0,
            dev: 1,
            ino: 2,
            mode: 0o100644,
            nlink: 1,
            uid: 2000,
            gid: 2000,
            size: 5_000_000_000,
            atime: 10,
            mtime: 20,
            ctime: 30,
        };
        let mut buf = BytesMut::new();
        stat.encode(&mut buf);

        assert_eq!(buf.len(), StatV2::SIZE);
        assert_eq!(&buf[20..24], &0o100644u32.to_le_bytes());
        assert_eq!(&buf[36..44], &5_000_000_000u64.to_le_bytes());
        assert_eq!(StatV2::decode(&buf).unwrap(), stat);

        let converted = SyncStat::from(stat);
        assert_eq!(converted.file_type(), Some(LinuxFileType::File));
        assert_eq!(converted.uid, Some(2000));
    }

    #[test]
    fn test_stat_wrong_size_rejected() {
        assert!(matches!(
            StatV2::decode(&[0u8; 12]),
            Err(ProtocolError::SyncProtocol(_))
        ));
        assert!(LstatV1::decode(&[0u8; 11]).is_err());
    }

    #[test]
    fn test_fixed_sizes() {
        assert_eq!(DENT_V1_FIXED_SIZE, 16);
        assert_eq!(DENT_V2_FIXED_SIZE, 72);
    }

    #[test]
    fn test_file_type_from_mode() {
        assert_eq!(
            LinuxFileType::from_mode(0o120777),
            Some(LinuxFileType::Symlink)
        );
        assert_eq!(LinuxFileType::from_mode(0), None);
    }
}
