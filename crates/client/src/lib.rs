//! # Tether Client Library
//!
//! Host side of the device debugging transport: authenticates to a device
//! daemon, multiplexes logical sockets over one byte stream and speaks the
//! shell and file sync sub-protocols on top of them.
//!
//! ## Overview
//!
//! - **Transport**: handshake driver, socket dispatcher with per-socket flow
//!   control, reverse tunnels and stall detection
//! - **Services**: shell (legacy and v2), file sync, screen capture, TCP/USB
//!   switching
//! - **Credentials**: PEM key directory implementing the credential store
//! - **Configuration**: TOML config with environment overrides
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                       Device                         │
//! ├──────────────────────────────────────────────────────┤
//! │  ┌────────────┐  ┌────────────┐  ┌────────────────┐  │
//! │  │   Shell    │  │    Sync    │  │  Framebuffer,  │  │
//! │  │  Service   │  │   Client   │  │  tcpip / usb   │  │
//! │  └────────────┘  └────────────┘  └────────────────┘  │
//! │  ┌────────────────────────────────────────────────┐  │
//! │  │        Dispatcher  (AdbSocket per service)     │  │
//! │  └────────────────────────────────────────────────┘  │
//! │  ┌────────────────────────────────────────────────┐  │
//! │  │        Handshake  (CredentialStore)            │  │
//! │  └────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use client::{Config, Device, DeviceOptions, FileCredentialStore};
//! use tokio::net::TcpStream;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let store = Arc::new(FileCredentialStore::from_config(&config));
//!
//!     let stream = TcpStream::connect(&config.connection.address).await?;
//!     let device = Device::connect(stream, store, DeviceOptions::from_config(&config)).await?;
//!
//!     let output = device.shell().run("echo hi").await?;
//!     print!("{}", output.stdout_lossy());
//!
//!     device.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`credentials`]: PEM key directory
//! - [`device`]: Connection facade
//! - [`transport`]: Handshake, dispatcher and sockets
//! - [`services`]: Shell, sync, framebuffer and tcpip
//! - [`error`]: Error types

pub mod config;
pub mod credentials;
pub mod device;
pub mod error;
pub mod services;
pub mod transport;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;
pub use credentials::FileCredentialStore;
pub use device::{Device, DeviceOptions};
pub use error::{ClientError, Result};

pub use services::{
    Compression, Framebuffer, PushOptions, RawShell, Shell, ShellEvent, ShellOptions, ShellOutput,
    ShellService, ShellV2, SyncClient, SyncError, SyncPull,
};

pub use transport::{
    AdbSocket, ConnectionState, Dispatcher, DispatcherOptions, IncomingSocketHandler,
    SocketReader, SocketWriter, WriteCredit,
};
