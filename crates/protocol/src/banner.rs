//! Connect banner and feature negotiation.
//!
//! The payload of a Connect packet is an ASCII banner:
//!
//! ```text
//! <device-type>:<serial>:<key1=val1;key2=val2;...>
//! ```
//!
//! The property list carries product identification and a comma-separated
//! `features` entry. A capability is available only when both sides list its
//! feature token.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

use crate::error::{ProtocolError, Result};

const KEY_PRODUCT: &str = "ro.product.name";
const KEY_MODEL: &str = "ro.product.model";
const KEY_DEVICE: &str = "ro.product.device";
const KEY_FEATURES: &str = "features";

/// Capability tokens exchanged in the banner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Feature {
    /// Multiplexed shell with exit codes.
    ShellV2,
    /// `cmd` service.
    Cmd,
    /// Sync stat/lstat v2.
    StatV2,
    /// Sync list v2.
    ListV2,
    /// Push creates missing parent directories.
    FixedPushMkdir,
    /// Android binder bridge.
    Abb,
    /// Android binder bridge, raw exec variant.
    AbbExec,
    /// Sync send/receive v2.
    SendReceiveV2,
    /// LZ4 compression for send/receive v2.
    SendReceiveV2Lz4,
    /// Dry-run flag for send v2.
    SendReceiveV2DryRunSend,
    /// Byte-credit flow control.
    DelayedAck,
}

impl Feature {
    /// Every feature this client knows about.
    pub const ALL: [Feature; 11] = [
        Feature::ShellV2,
        Feature::Cmd,
        Feature::StatV2,
        Feature::ListV2,
        Feature::FixedPushMkdir,
        Feature::Abb,
        Feature::AbbExec,
        Feature::SendReceiveV2,
        Feature::SendReceiveV2Lz4,
        Feature::SendReceiveV2DryRunSend,
        Feature::DelayedAck,
    ];

    /// Wire token.
    pub fn as_str(self) -> &'static str {
        match self {
            Feature::ShellV2 => "shell_v2",
            Feature::Cmd => "cmd",
            Feature::StatV2 => "stat_v2",
            Feature::ListV2 => "ls_v2",
            Feature::FixedPushMkdir => "fixed_push_mkdir",
            Feature::Abb => "abb",
            Feature::AbbExec => "abb_exec",
            Feature::SendReceiveV2 => "sendrecv_v2",
            Feature::SendReceiveV2Lz4 => "sendrecv_v2_lz4",
            Feature::SendReceiveV2DryRunSend => "sendrecv_v2_dry_run_send",
            Feature::DelayedAck => "delayed_ack",
        }
    }

    /// Looks up a feature by its wire token.
    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.as_str() == token)
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed Connect banner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Banner {
    /// Connection type, e.g. `device`, `recovery` or `host`.
    pub device_type: String,
    /// Serial number; usually empty.
    pub serial: String,
    /// `ro.product.name`.
    pub product: Option<String>,
    /// `ro.product.model`.
    pub model: Option<String>,
    /// `ro.product.device`.
    pub device: Option<String>,
    /// Raw feature tokens, including ones this client does not recognise.
    pub features: BTreeSet<String>,
}

impl Banner {
    /// Banner sent by this client in its Connect packet.
    pub fn host(features: &[Feature]) -> Self {
        Self {
            device_type: "host".to_string(),
            features: features.iter().map(|f| f.as_str().to_string()).collect(),
            ..Default::default()
        }
    }

    /// Parses a banner received from the peer.
    ///
    /// Unknown keys are ignored. A trailing NUL is tolerated.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim_end_matches('\0');
        let mut parts = raw.splitn(3, ':');
        let device_type = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ProtocolError::InvalidBanner(format!("missing device type in {raw:?}")))?;
        let serial = parts.next().unwrap_or_default();
        let properties = parts.next().unwrap_or_default();

        let mut banner = Banner {
            device_type: device_type.to_string(),
            serial: serial.to_string(),
            ..Default::default()
        };

        for entry in properties.split(';').filter(|e| !e.is_empty()) {
            let Some((key, value)) = entry.split_once('=') else {
                continue;
            };
            match key {
                KEY_PRODUCT => banner.product = Some(value.to_string()),
                KEY_MODEL => banner.model = Some(value.to_string()),
                KEY_DEVICE => banner.device = Some(value.to_string()),
                KEY_FEATURES => {
                    banner.features = value
                        .split(',')
                        .filter(|t| !t.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                _ => {}
            }
        }

        Ok(banner)
    }

    /// Whether the banner lists `feature`.
    pub fn has_feature(&self, feature: Feature) -> bool {
        self.features.contains(feature.as_str())
    }
}

impl fmt::Display for Banner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:", self.device_type, self.serial)?;

        let mut properties = Vec::new();
        if let Some(product) = &self.product {
            properties.push(format!("{KEY_PRODUCT}={product}"));
        }
        if let Some(model) = &self.model {
            properties.push(format!("{KEY_MODEL}={model}"));
        }
        if let Some(device) = &self.device {
            properties.push(format!("{KEY_DEVICE}={device}"));
        }
        if !self.features.is_empty() {
            let features: Vec<&str> = self.features.iter().map(String::as_str).collect();
            properties.push(format!("{KEY_FEATURES}={}", features.join(",")));
        }

        f.write_str(&properties.join(";"))
    }
}
