//! # Tether Protocol Library
//!
//! Wire formats and sans-IO state machines for talking to a device
//! debugging daemon.
//!
//! ## Overview
//!
//! - **Packets**: 24-byte header framing with checksum and magic validation
//! - **Authentication**: RSA token signing and public key exchange
//! - **Banner**: Connect banner parsing and feature negotiation
//! - **Sub-protocols**: shell v2, file sync and framebuffer framing
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │     shell v2 / sync / framebuffer       │  per-socket byte streams
//! ├─────────────────────────────────────────┤
//! │         Socket multiplexing             │  OPEN / OKAY / WRTE / CLSE
//! ├─────────────────────────────────────────┤
//! │     Handshake (CNXN / AUTH, RSA)        │
//! ├─────────────────────────────────────────┤
//! │            Packet codec                 │  24-byte header, checksum
//! ├─────────────────────────────────────────┤
//! │      Transport (TCP, USB bridge)        │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Nothing in this crate performs I/O. The multiplexer lives in the client
//! crate and drives these types over a tokio byte stream.
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Authenticator, Command, HandshakeOptions, Packet};
//!
//! let mut auth = Authenticator::new(HandshakeOptions::default(), Vec::new());
//! let connect = auth.connect_packet().unwrap();
//! assert_eq!(connect.command, Command::Connect);
//!
//! let bytes = connect.serialize();
//! let decoded = Packet::deserialize(&bytes, true).unwrap();
//! assert_eq!(decoded, connect);
//! ```
//!
//! ## Modules
//!
//! - [`packet`]: Packet header and streaming codec
//! - [`banner`]: Connect banner and features
//! - [`crypto`]: RSA keys, signatures and the public key blob
//! - [`auth`]: Handshake state machine and credential store trait
//! - [`shell`]: Shell v2 framing
//! - [`sync`]: File sync framing
//! - [`framebuffer`]: Screen capture header
//! - [`error`]: Error types

pub mod auth;
pub mod banner;
pub mod crypto;
pub mod error;
pub mod framebuffer;
pub mod packet;
pub mod shell;
pub mod sync;

pub use auth::{
    AuthState, AuthStep, AuthType, Authenticator, ConnectionParams, CredentialStore, FlowControl,
    HandshakeOptions, MemoryCredentialStore, DEFAULT_DELAYED_ACK_BYTES, DEFAULT_FEATURES,
    DEFAULT_MAX_PAYLOAD_SIZE, PROTOCOL_VERSION, VERSION_SKIP_CHECKSUM,
};
pub use banner::{Banner, Feature};
pub use crypto::{AdbPrivateKey, AdbPublicKey, TOKEN_SIZE};
pub use error::{ProtocolError, Result};
pub use framebuffer::FramebufferHeader;
pub use packet::{Command, Packet, PacketCodec, PacketHeader, PACKET_HEADER_SIZE};
pub use shell::{ShellCodec, ShellPacket, ShellStreamId};
pub use sync::{LinuxFileType, SendFlags, SyncEntry, SyncId, SyncStat};
