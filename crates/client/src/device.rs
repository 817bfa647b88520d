//! High-level handle to an authenticated device.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use protocol::sync::SYNC_DATA_MAX;
use protocol::{Banner, ConnectionParams, CredentialStore, Feature, HandshakeOptions, PacketCodec};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::FramedRead;

use crate::config::Config;
use crate::error::Result;
use crate::services::{framebuffer, tcpip, Framebuffer, PushOptions, ShellService, SyncClient};
use crate::transport::{
    perform_handshake, AdbSocket, ConnectionState, Dispatcher, DispatcherOptions,
    IncomingSocketHandler,
};

/// Connection settings for [`Device::connect`].
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    /// What to propose in the Connect packet.
    pub handshake: HandshakeOptions,
    /// Upper bound on the whole authentication exchange.
    pub auth_timeout: Duration,
    /// Tear the link down when a socket leaves data unread this long.
    pub read_time_limit: Option<Duration>,
    /// Default DATA size for pushes.
    pub sync_packet_size: usize,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            handshake: HandshakeOptions::default(),
            auth_timeout: Duration::from_secs(60),
            read_time_limit: None,
            sync_packet_size: SYNC_DATA_MAX,
        }
    }
}

impl DeviceOptions {
    /// Options from a loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            handshake: config.handshake_options(),
            auth_timeout: config.auth_timeout(),
            read_time_limit: config.read_time_limit(),
            sync_packet_size: config.sync.packet_size,
        }
    }
}

/// An authenticated connection to a device daemon.
#[derive(Debug, Clone)]
pub struct Device {
    dispatcher: Dispatcher,
    sync_packet_size: usize,
}

impl Device {
    /// Authenticates over `stream` and starts multiplexing sockets on it.
    pub async fn connect<S>(
        stream: S,
        store: Arc<dyn CredentialStore>,
        options: DeviceOptions,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut framed = FramedRead::new(read_half, PacketCodec::handshake());

        let params = perform_handshake(
            &mut framed,
            &mut write_half,
            store,
            options.handshake,
            options.auth_timeout,
        )
        .await?;
        *framed.decoder_mut() = PacketCodec::new(&params);

        tracing::info!(
            device_type = %params.banner.device_type,
            model = params.banner.model.as_deref().unwrap_or("unknown"),
            max_payload = params.max_payload_size,
            "Connected to device"
        );

        let dispatcher = Dispatcher::start(
            framed,
            write_half,
            params,
            DispatcherOptions {
                read_time_limit: options.read_time_limit,
            },
        );
        Ok(Self {
            dispatcher,
            sync_packet_size: options.sync_packet_size,
        })
    }

    /// The device's Connect banner.
    pub fn banner(&self) -> &Banner {
        &self.dispatcher.params().banner
    }

    /// Negotiated connection parameters.
    pub fn params(&self) -> &ConnectionParams {
        self.dispatcher.params()
    }

    /// Whether both sides support `feature`.
    pub fn can_use_feature(&self, feature: Feature) -> bool {
        self.params().can_use_feature(feature)
    }

    /// The underlying socket multiplexer.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Opens a socket to `service`.
    pub async fn create_socket(&self, service: &str) -> Result<AdbSocket> {
        self.dispatcher.open(service).await
    }

    /// Opens `service`, reads until the device closes it and returns the
    /// text, decoded lossily.
    pub async fn create_socket_and_wait(&self, service: &str) -> Result<String> {
        tcpip::run_service(&self.dispatcher, service).await
    }

    /// Command execution.
    pub fn shell(&self) -> ShellService {
        ShellService::new(self.dispatcher.clone())
    }

    /// Opens a file sync session.
    pub async fn sync(&self) -> Result<SyncClient> {
        SyncClient::open(&self.dispatcher).await
    }

    /// Push options using the configured DATA size.
    pub fn push_options(&self, path: impl Into<String>, data: impl Into<Bytes>) -> PushOptions {
        PushOptions::new(path, data).with_packet_size(self.sync_packet_size)
    }

    /// Captures the screen.
    pub async fn framebuffer(&self) -> Result<Framebuffer> {
        framebuffer::capture(&self.dispatcher).await
    }

    /// Restarts the device daemon listening on TCP `port`.
    pub async fn tcpip(&self, port: u16) -> Result<()> {
        tcpip::tcpip(&self.dispatcher, port).await
    }

    /// Restarts the device daemon on USB.
    pub async fn usb(&self) -> Result<()> {
        tcpip::usb(&self.dispatcher).await
    }

    /// Reads a system property.
    pub async fn getprop(&self, key: &str) -> Result<String> {
        let output = self
            .create_socket_and_wait(&format!("exec:getprop {key}"))
            .await?;
        Ok(output.trim().to_string())
    }

    /// Routes device-initiated opens for `service` to `handler`.
    pub fn add_reverse_handler<H>(&self, service: impl Into<String>, handler: H)
    where
        H: IncomingSocketHandler + 'static,
    {
        self.dispatcher.add_reverse_handler(service, handler);
    }

    /// Removes a reverse handler.
    pub fn remove_reverse_handler(&self, service: &str) -> bool {
        self.dispatcher.remove_reverse_handler(service)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.dispatcher.state()
    }

    /// Waits until the connection ends.
    pub async fn disconnected(&self) -> ConnectionState {
        self.dispatcher.disconnected().await
    }

    /// Closes every socket and the connection.
    pub async fn close(&self) {
        self.dispatcher.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_config() {
        let mut config = Config::default();
        config.connection.read_time_limit_ms = 250;
        config.connection.auth_timeout_secs = 5;
        config.sync.packet_size = 1024;

        let options = DeviceOptions::from_config(&config);
        assert_eq!(options.read_time_limit, Some(Duration::from_millis(250)));
        assert_eq!(options.auth_timeout, Duration::from_secs(5));
        assert_eq!(options.sync_packet_size, 1024);
        assert_eq!(
            options.handshake.delayed_ack_bytes,
            config.connection.delayed_ack_bytes
        );
    }

    #[test]
    fn test_default_options() {
        let options = DeviceOptions::default();
        assert_eq!(options.read_time_limit, None);
        assert_eq!(options.sync_packet_size, 64 * 1024);
    }
}
