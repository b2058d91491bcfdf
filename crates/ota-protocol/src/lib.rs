//! Device-facing wire contract shared between the gateway and tests.
//!
//! Every message is a JSON text frame; firmware bytes follow the update
//! command as raw binary frames. Status tags stay free-form on the wire
//! and are classified into [`DeviceStatus`] at the record level.

use std::fmt;

use serde::{Deserialize, Serialize};

/// First message on a new device channel, establishing identity.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Handshake {
    pub device_id: String,
    pub current_version: String,
}

/// Status update sent by a device at any point after the handshake.
///
/// `version` is optional; when omitted the server keeps the device's
/// previously recorded version.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StatusReport {
    pub status: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// Server → device announcement preceding the firmware byte stream.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UpdateCommand {
    pub command: String,
    pub version: String,
    /// Hex-encoded SHA-256 of the full artifact.
    pub hash: String,
    /// Total payload bytes across all binary frames that follow.
    pub size: u64,
}

impl UpdateCommand {
    pub const COMMAND: &'static str = "update";

    pub fn new(version: impl Into<String>, hash: impl Into<String>, size: u64) -> Self {
        Self {
            command: Self::COMMAND.to_string(),
            version: version.into(),
            hash: hash.into(),
            size,
        }
    }
}

/// Closed status set recorded per device.
///
/// The wire keeps free-form tags; `Failed` and `Unknown` carry the raw tag
/// so the record round-trips `failed:hash`, `failed:install` and
/// installer-exit-code variants verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceStatus {
    Connected,
    Disconnected,
    Downloading,
    Installing,
    Success,
    Failed(String),
    Unknown(String),
}

impl DeviceStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "connected" => Self::Connected,
            "disconnected" => Self::Disconnected,
            "downloading" => Self::Downloading,
            "installing" => Self::Installing,
            "success" => Self::Success,
            other if other == "failed" || other.starts_with("failed:") => {
                Self::Failed(other.to_string())
            }
            other => Self::Unknown(other.to_string()),
        }
    }

    /// The tag as persisted and as seen on the wire.
    pub fn as_wire(&self) -> &str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Downloading => "downloading",
            Self::Installing => "installing",
            Self::Success => "success",
            Self::Failed(raw) | Self::Unknown(raw) => raw,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}
