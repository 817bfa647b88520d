//! Authentication handshake and connection parameter negotiation.
//!
//! The handshake is a sans-IO state machine: the caller feeds it every packet
//! received from the daemon and writes whatever it asks to send.
//!
//! ```text
//! AwaitingConnect ──connect_packet()──▶ AwaitingAuthOrConnect
//!     CNXN ─────────────────────────────────────────▶ Authenticated
//!     AUTH(token) ─▶ Signing(key 0) ─AUTH(token)─▶ Signing(key 1) ...
//!                    keys exhausted ─▶ PublicKeyOffered ─CNXN─▶ Authenticated
//!                                                       └AUTH(token)─▶ Failed
//! ```

use std::sync::Mutex;

use bytes::Bytes;

use crate::banner::{Banner, Feature};
use crate::crypto::AdbPrivateKey;
use crate::error::{ProtocolError, Result};
use crate::packet::{Command, Packet};

/// Protocol version sent in our Connect packet.
pub const PROTOCOL_VERSION: u32 = 0x0100_0001;

/// First version that skips checksums and NUL-terminated service strings.
pub const VERSION_SKIP_CHECKSUM: u32 = 0x0100_0001;

/// Default maximum payload proposed in the Connect packet (1 MB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 1024 * 1024;

/// Default receive window offered when delayed ack is negotiated (32 MB).
pub const DEFAULT_DELAYED_ACK_BYTES: u32 = 32 * 1024 * 1024;

/// Features advertised by default.
pub const DEFAULT_FEATURES: [Feature; 10] = [
    Feature::ShellV2,
    Feature::Cmd,
    Feature::StatV2,
    Feature::ListV2,
    Feature::FixedPushMkdir,
    Feature::AbbExec,
    Feature::SendReceiveV2,
    Feature::SendReceiveV2Lz4,
    Feature::SendReceiveV2DryRunSend,
    Feature::DelayedAck,
];

/// Auth packet sub-type carried in `arg0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AuthType {
    /// Challenge from the daemon.
    Token = 1,
    /// Signed challenge.
    Signature = 2,
    /// Public key offer.
    PublicKey = 3,
}

impl TryFrom<u32> for AuthType {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            1 => Ok(AuthType::Token),
            2 => Ok(AuthType::Signature),
            3 => Ok(AuthType::PublicKey),
            other => Err(ProtocolError::HandshakeFailed(format!(
                "unknown auth type {other}"
            ))),
        }
    }
}

/// Source of RSA keys for the handshake.
pub trait CredentialStore: Send + Sync {
    /// All stored keys, in the order they should be tried.
    fn keys(&self) -> Result<Vec<AdbPrivateKey>>;

    /// Generates and stores a new key.
    fn generate_key(&self) -> Result<AdbPrivateKey>;
}

/// In-memory credential store.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    keys: Mutex<Vec<AdbPrivateKey>>,
}

impl MemoryCredentialStore {
    /// Creates a store holding `keys`.
    pub fn new(keys: Vec<AdbPrivateKey>) -> Self {
        Self {
            keys: Mutex::new(keys),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn keys(&self) -> Result<Vec<AdbPrivateKey>> {
        self.keys
            .lock()
            .map(|keys| keys.clone())
            .map_err(|_| ProtocolError::InvalidKey("credential store lock poisoned".to_string()))
    }

    fn generate_key(&self) -> Result<AdbPrivateKey> {
        let key = AdbPrivateKey::generate()?;
        self.keys
            .lock()
            .map_err(|_| ProtocolError::InvalidKey("credential store lock poisoned".to_string()))?
            .push(key.clone());
        Ok(key)
    }
}

/// Local side of the negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOptions {
    /// Maximum payload proposed to the daemon.
    pub max_payload_size: u32,
    /// Features to advertise.
    pub features: Vec<Feature>,
    /// Receive window for delayed ack; 0 disables it.
    pub delayed_ack_bytes: u32,
    /// Name appended to offered public keys.
    pub key_name: String,
}

impl Default for HandshakeOptions {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            features: DEFAULT_FEATURES.to_vec(),
            delayed_ack_bytes: DEFAULT_DELAYED_ACK_BYTES,
            key_name: "tether@localhost".to_string(),
        }
    }
}

impl HandshakeOptions {
    /// Features actually advertised: `delayed_ack` is present exactly when a
    /// receive window is configured.
    pub fn advertised_features(&self) -> Vec<Feature> {
        let mut features: Vec<Feature> = self
            .features
            .iter()
            .copied()
            .filter(|f| *f != Feature::DelayedAck)
            .collect();
        if self.delayed_ack_bytes > 0 {
            features.push(Feature::DelayedAck);
        }
        features
    }
}

/// Per-socket flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    /// One Write in flight per socket until the peer sends Okay.
    SinglePacket,
    /// Byte credit granted through Okay payloads.
    DelayedAck {
        /// Receive window this side offers for each socket.
        initial_bytes: u32,
    },
}

/// Parameters fixed for the lifetime of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    /// Negotiated protocol version.
    pub version: u32,
    /// Largest payload either side may send.
    pub max_payload_size: u32,
    /// Banner received from the daemon.
    pub banner: Banner,
    /// Features this side advertised.
    pub local_features: Vec<Feature>,
    /// Whether incoming checksums are validated.
    pub checksum_required: bool,
    /// Whether service strings must end with NUL.
    pub null_terminated_services: bool,
    /// Flow control mode.
    pub flow_control: FlowControl,
}

impl ConnectionParams {
    /// Derives the parameters from the daemon's Connect packet.
    pub fn negotiate(options: &HandshakeOptions, connect: &Packet) -> Result<Self> {
        if connect.command != Command::Connect {
            return Err(ProtocolError::HandshakeFailed(format!(
                "expected CNXN, got {}",
                connect.command
            )));
        }

        let banner = Banner::parse(&String::from_utf8_lossy(&connect.payload))?;
        let version = PROTOCOL_VERSION.min(connect.arg0);
        let max_payload_size = options.max_payload_size.min(connect.arg1);
        if max_payload_size == 0 {
            return Err(ProtocolError::HandshakeFailed(
                "daemon advertised a zero max payload".to_string(),
            ));
        }

        let local_features = options.advertised_features();
        let flow_control = if local_features.contains(&Feature::DelayedAck)
            && banner.has_feature(Feature::DelayedAck)
        {
            FlowControl::DelayedAck {
                initial_bytes: options.delayed_ack_bytes,
            }
        } else {
            FlowControl::SinglePacket
        };

        let legacy = version < VERSION_SKIP_CHECKSUM;
        Ok(Self {
            version,
            max_payload_size,
            banner,
            local_features,
            checksum_required: legacy,
            null_terminated_services: legacy,
            flow_control,
        })
    }

    /// True when both sides advertise `feature`.
    pub fn can_use_feature(&self, feature: Feature) -> bool {
        self.local_features.contains(&feature) && self.banner.has_feature(feature)
    }

    /// Receive window offered per socket; 0 in single-packet mode.
    pub fn delayed_ack_bytes(&self) -> u32 {
        match self.flow_control {
            FlowControl::SinglePacket => 0,
            FlowControl::DelayedAck { initial_bytes } => initial_bytes,
        }
    }
}

/// Handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Connect not yet sent.
    AwaitingConnect,
    /// Connect sent; waiting for the daemon's first answer.
    AwaitingAuthOrConnect,
    /// Signature sent with the key before `next_key`.
    Signing {
        /// Index of the next stored key to try.
        next_key: usize,
    },
    /// Stored keys exhausted and none exist; a key must be generated.
    AwaitingGeneratedKey,
    /// Public key offered; waiting for the user to approve on the device.
    PublicKeyOffered,
    /// Daemon accepted the connection.
    Authenticated,
    /// Handshake failed.
    Failed,
}

/// What the caller must do after feeding a packet.
#[derive(Debug)]
pub enum AuthStep {
    /// Send this packet and keep reading.
    Send(Packet),
    /// Generate a key and pass it to [`Authenticator::offer_generated_key`].
    NeedKey,
    /// Nothing to send; keep reading.
    Wait,
    /// Handshake complete.
    Authenticated(ConnectionParams),
}

/// Handshake state machine.
#[derive(Debug)]
pub struct Authenticator {
    options: HandshakeOptions,
    keys: Vec<AdbPrivateKey>,
    state: AuthState,
}

impl Authenticator {
    /// Creates an authenticator trying `keys` in order.
    pub fn new(options: HandshakeOptions, keys: Vec<AdbPrivateKey>) -> Self {
        Self {
            options,
            keys,
            state: AuthState::AwaitingConnect,
        }
    }

    /// Current state.
    pub fn state(&self) -> AuthState {
        self.state
    }

    /// Builds the initial Connect packet.
    pub fn connect_packet(&mut self) -> Result<Packet> {
        if self.state != AuthState::AwaitingConnect {
            return Err(ProtocolError::HandshakeFailed(
                "connect packet already sent".to_string(),
            ));
        }

        let banner = Banner::host(&self.options.advertised_features());
        self.state = AuthState::AwaitingAuthOrConnect;
        Ok(Packet::new(
            Command::Connect,
            PROTOCOL_VERSION,
            self.options.max_payload_size,
            Bytes::from(banner.to_string()),
        ))
    }

    /// Advances the handshake with a packet from the daemon.
    pub fn on_packet(&mut self, packet: &Packet) -> Result<AuthStep> {
        match self.state {
            AuthState::AwaitingConnect => {
                return Err(ProtocolError::HandshakeFailed(
                    "received packet before connect was sent".to_string(),
                ))
            }
            AuthState::Authenticated | AuthState::Failed => {
                return Err(ProtocolError::HandshakeFailed(format!(
                    "handshake already finished ({:?})",
                    self.state
                )))
            }
            _ => {}
        }

        match packet.command {
            Command::Connect => {
                let params = match ConnectionParams::negotiate(&self.options, packet) {
                    Ok(params) => params,
                    Err(e) => {
                        self.state = AuthState::Failed;
                        return Err(e);
                    }
                };
                tracing::debug!(
                    version = params.version,
                    max_payload = params.max_payload_size,
                    flow_control = ?params.flow_control,
                    "Daemon accepted connection"
                );
                self.state = AuthState::Authenticated;
                Ok(AuthStep::Authenticated(params))
            }
            Command::Auth => {
                let auth_type = AuthType::try_from(packet.arg0)?;
                if auth_type != AuthType::Token {
                    self.state = AuthState::Failed;
                    return Err(ProtocolError::HandshakeFailed(format!(
                        "daemon sent unexpected auth type {auth_type:?}"
                    )));
                }
                self.on_token(&packet.payload)
            }
            other => {
                // Leftovers from a previous client on the same channel.
                tracing::debug!(command = %other, "Ignoring packet during handshake");
                Ok(AuthStep::Wait)
            }
        }
    }

    /// Offers the public key of a freshly generated key.
    pub fn offer_generated_key(&mut self, key: AdbPrivateKey) -> Result<Packet> {
        if self.state != AuthState::AwaitingGeneratedKey {
            return Err(ProtocolError::HandshakeFailed(
                "no key generation was requested".to_string(),
            ));
        }
        let packet = self.public_key_packet(&key);
        self.keys.push(key);
        self.state = AuthState::PublicKeyOffered;
        Ok(packet)
    }

    fn on_token(&mut self, token: &[u8]) -> Result<AuthStep> {
        let next_key = match self.state {
            AuthState::AwaitingAuthOrConnect => 0,
            AuthState::Signing { next_key } => next_key,
            AuthState::PublicKeyOffered | AuthState::AwaitingGeneratedKey => {
                self.state = AuthState::Failed;
                return Err(ProtocolError::AuthenticationRejected(
                    "daemon did not accept the offered public key".to_string(),
                ));
            }
            state => {
                return Err(ProtocolError::HandshakeFailed(format!(
                    "unexpected token in state {state:?}"
                )))
            }
        };

        if let Some(key) = self.keys.get(next_key) {
            let signature = key.sign(token)?;
            tracing::debug!(key_index = next_key, "Signing daemon token");
            self.state = AuthState::Signing {
                next_key: next_key + 1,
            };
            return Ok(AuthStep::Send(Packet::new(
                Command::Auth,
                AuthType::Signature as u32,
                0,
                signature,
            )));
        }

        match self.keys.first() {
            Some(key) => {
                let packet = self.public_key_packet(key);
                self.state = AuthState::PublicKeyOffered;
                Ok(AuthStep::Send(packet))
            }
            None => {
                self.state = AuthState::AwaitingGeneratedKey;
                Ok(AuthStep::NeedKey)
            }
        }
    }

    fn public_key_packet(&self, key: &AdbPrivateKey) -> Packet {
        let public = key.public_key();
        let name = key.name().unwrap_or(&self.options.key_name);
        tracing::info!(
            fingerprint = %public.fingerprint(),
            "Offering public key, confirm the prompt on the device"
        );
        Packet::new(
            Command::Auth,
            AuthType::PublicKey as u32,
            0,
            public.to_auth_payload(name),
        )
    }
}
