//! Error types for the client crate.

use std::time::Duration;

use protocol::ProtocolError;
use thiserror::Error;

use crate::services::sync::SyncError;

/// Errors surfaced by connections, sockets and services.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Wire-level failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    // Socket errors
    /// The daemon refused to open a service.
    #[error("device refused to open service {service:?}")]
    RemoteRefused {
        /// Requested service.
        service: String,
    },

    /// The socket was closed while an operation was in progress.
    #[error("socket closed")]
    SocketClosed,

    /// The connection to the daemon is gone.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// A socket left received data unread past the configured limit.
    #[error("socket {local_id} ({service}) stalled: data unread for {waited:?}")]
    StalledSocket {
        /// Local id of the stalled socket.
        local_id: u32,
        /// Service the socket was opened for.
        service: String,
        /// How long the oldest chunk waited.
        waited: Duration,
    },

    // Service errors
    /// File sync failure.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// The device does not advertise a required feature.
    #[error("device does not support {0}")]
    UnsupportedFeature(&'static str),

    /// The device refused a screen capture.
    #[error("framebuffer capture refused by device")]
    FramebufferForbidden,

    /// A one-shot service replied with unexpected text.
    #[error("unexpected reply from {service}: {reply:?}")]
    UnexpectedReply {
        /// Service that replied.
        service: String,
        /// Reply text.
        reply: String,
    },

    // Local errors
    /// Key storage failure.
    #[error("credential store error: {0}")]
    Credentials(String),

    /// Local I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
