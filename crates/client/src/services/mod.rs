//! Device services built on top of logical sockets.
//!
//! - [`shell`]: remote command execution (legacy and v2)
//! - [`sync`]: file stat, list, push and pull
//! - [`framebuffer`]: screen capture
//! - [`tcpip`]: TCP/USB transport switching

pub mod framebuffer;
pub mod shell;
pub mod sync;
pub mod tcpip;

pub use framebuffer::Framebuffer;
pub use shell::{
    RawShell, Shell, ShellEvent, ShellOptions, ShellOutput, ShellService, ShellV2,
};
pub use sync::{Compression, PushOptions, SyncClient, SyncError, SyncPull};
