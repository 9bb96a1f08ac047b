//! Device descriptor: the unit of group membership.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Stable identifier assigned to a device by the ad hoc transport.
///
/// For a Wi-Fi Direct transport this is the radio MAC address; other
/// transports may use any string that stays the same for the lifetime of the
/// device.  Two devices are the same member if and only if their ids match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A group member as seen by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Transport-derived identifier; unique within a registry.
    pub id: DeviceId,
    /// Human-readable name shown to users.
    pub display_name: String,
    /// Where this device's listener accepts envelopes, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<SocketAddr>,
}

impl Device {
    pub fn new(id: impl Into<DeviceId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            endpoint: None,
        }
    }

    /// Returns a copy with `endpoint` set.
    pub fn with_endpoint(mut self, endpoint: SocketAddr) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Returns the endpoint only if it can actually be dialled.
    ///
    /// A declared endpoint with port 0 or an unspecified host (`0.0.0.0`)
    /// is a placeholder, not an address.
    pub fn reachable_endpoint(&self) -> Option<SocketAddr> {
        self.endpoint
            .filter(|addr| addr.port() != 0 && !addr.ip().is_unspecified())
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.endpoint {
            Some(addr) => write!(f, "{} ({}) @ {addr}", self.display_name, self.id),
            None => write!(f, "{} ({})", self.display_name, self.id),
        }
    }
}
