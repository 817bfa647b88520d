//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all wire-level failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Framing errors
    /// Packet header or payload is structurally invalid.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// Header magic is not the complement of the command.
    #[error("bad packet magic: command {command:#010x}, magic {magic:#010x}")]
    BadMagic {
        /// Command field from the header.
        command: u32,
        /// Magic field from the header.
        magic: u32,
    },

    /// Payload checksum does not match the header.
    #[error("checksum mismatch: header says {expected:#010x}, payload sums to {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum carried in the header.
        expected: u32,
        /// Checksum computed over the payload.
        actual: u32,
    },

    /// Command tag is not one of the known commands.
    #[error("unknown command: {0:#010x}")]
    UnknownCommand(u32),

    /// Connect banner could not be parsed.
    #[error("invalid banner: {0}")]
    InvalidBanner(String),

    // Authentication errors
    /// Key material is unusable.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// No key was accepted and the public key offer was not approved.
    #[error("authentication rejected: {0}")]
    AuthenticationRejected(String),

    /// Peer violated the handshake sequence.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    // Sub-protocol errors
    /// Shell v2 inner framing is invalid.
    #[error("shell protocol error: {0}")]
    ShellProtocol(String),

    /// Sync response is structurally invalid.
    #[error("sync protocol error: {0}")]
    SyncProtocol(String),

    /// Framebuffer header carries a version this client cannot parse.
    #[error("unsupported framebuffer version {0}")]
    UnsupportedFramebufferVersion(u32),

    // Connection errors
    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            _ => ProtocolError::Io(err.to_string()),
        }
    }
}

impl From<rsa::Error> for ProtocolError {
    fn from(err: rsa::Error) -> Self {
        ProtocolError::InvalidKey(err.to_string())
    }
}
