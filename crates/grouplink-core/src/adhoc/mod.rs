//! Seam to the ad hoc network layer.
//!
//! Forming a radio-level group, advertising it, discovering other groups,
//! and learning the coordinator's address are the job of an external ad hoc
//! transport (for example Wi-Fi Direct).  The roles only talk to it through
//! the [`AdHocTransport`] trait, which keeps the membership protocol testable
//! without any radio.
//!
//! # Service record
//!
//! A coordinator advertises its group with a small key/value record:
//!
//! | Key                       | Value                                      |
//! |---------------------------|--------------------------------------------|
//! | [`SERVICE_PORT_PROPERTY`] | port the coordinator's listener is bound to |
//! | [`SERVICE_NAME_PROPERTY`] | always [`SERVICE_NAME_VALUE`]               |
//! | [`GROUP_NAME_PROPERTY`]   | the group name                              |
//!
//! plus any custom properties given at registration.  Records whose service
//! name does not match are ignored during discovery.
//!
//! # Implementations
//!
//! - [`static_lan::StaticLanTransport`]: hosts that already share a LAN.
//! - [`loopback::LoopbackNetwork`]: in-process simulation with fault
//!   injection, used by tests.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::domain::device::{Device, DeviceId};

pub mod loopback;
pub mod static_lan;

/// Well-known coordinator port.
pub const DEFAULT_COORDINATOR_PORT: u16 = 9999;

pub const SERVICE_PORT_PROPERTY: &str = "SERVICE_PORT";
pub const SERVICE_NAME_PROPERTY: &str = "SERVICE_NAME";
pub const SERVICE_NAME_VALUE: &str = "GROUPLINK";
pub const GROUP_NAME_PROPERTY: &str = "GROUP_NAME";

/// Errors reported by an ad hoc transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdHocError {
    /// The radio or network layer cannot be used right now.
    #[error("ad hoc transport unavailable: {0}")]
    Unavailable(String),

    /// Another group operation is still in progress.
    #[error("ad hoc transport is busy")]
    Busy,

    #[error("operation not supported by this ad hoc transport")]
    NotSupported,

    /// The requested group is no longer advertised.
    #[error("group advertised by {0} not found")]
    GroupNotFound(DeviceId),
}

/// Signals raised by the ad hoc transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdHocEvent {
    /// The radio-level group is up.
    ///
    /// For a member, `coordinator_endpoint` is the coordinator's listener
    /// address when the transport knows it.
    GroupFormed {
        is_coordinator: bool,
        coordinator_endpoint: Option<SocketAddr>,
    },
    /// This device lost its link to the group.
    PeerLinkLost,
    /// A member's link to this coordinator dropped.
    PeerDisconnected(DeviceId),
}

/// A coordinator found during discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorDescriptor {
    pub device_id: DeviceId,
    pub display_name: String,
    pub group_name: String,
    /// The coordinator's listener address, if the record made it known.
    pub endpoint: Option<SocketAddr>,
    /// Custom properties from the service record.
    pub properties: BTreeMap<String, String>,
}

impl CoordinatorDescriptor {
    /// Builds a descriptor from an advertised service record.
    ///
    /// Returns `None` when the record does not belong to this protocol.
    /// The reserved keys are removed from `properties`; the port they carry
    /// becomes `endpoint` when `host` is known.
    pub fn from_service_record(
        owner: &Device,
        record: &BTreeMap<String, String>,
        host: Option<IpAddr>,
    ) -> Option<Self> {
        let service = record.get(SERVICE_NAME_PROPERTY)?;
        if !service.eq_ignore_ascii_case(SERVICE_NAME_VALUE) {
            return None;
        }
        let port = record
            .get(SERVICE_PORT_PROPERTY)
            .and_then(|p| p.parse::<u16>().ok());
        let endpoint = match (host, port) {
            (Some(ip), Some(port)) if port != 0 => Some(SocketAddr::new(ip, port)),
            _ => None,
        };
        let group_name = record.get(GROUP_NAME_PROPERTY).cloned().unwrap_or_default();
        let properties = record
            .iter()
            .filter(|(k, _)| !is_reserved_property(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Some(Self {
            device_id: owner.id.clone(),
            display_name: owner.display_name.clone(),
            group_name,
            endpoint,
            properties,
        })
    }
}

/// Builds the service record advertised for a group.
///
/// Custom properties cannot override the reserved keys.
pub fn service_record(
    group_name: &str,
    port: u16,
    custom: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut record: BTreeMap<String, String> = custom
        .iter()
        .filter(|(k, _)| !is_reserved_property(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    record.insert(SERVICE_PORT_PROPERTY.to_string(), port.to_string());
    record.insert(SERVICE_NAME_PROPERTY.to_string(), SERVICE_NAME_VALUE.to_string());
    record.insert(GROUP_NAME_PROPERTY.to_string(), group_name.to_string());
    record
}

fn is_reserved_property(key: &str) -> bool {
    key == SERVICE_PORT_PROPERTY || key == SERVICE_NAME_PROPERTY || key == GROUP_NAME_PROPERTY
}

/// Everything the roles need from the ad hoc network layer.
#[async_trait]
pub trait AdHocTransport: Send + Sync {
    /// This process's device identity.
    fn local_device(&self) -> Device;

    /// Creates the group and publishes `record` (see [`service_record`]).
    async fn advertise_group(&self, record: BTreeMap<String, String>) -> Result<(), AdHocError>;

    /// Streams advertised coordinators until `timeout` elapses or the
    /// transport has nothing more to report.
    async fn discover(
        &self,
        timeout: Duration,
    ) -> Result<mpsc::Receiver<CoordinatorDescriptor>, AdHocError>;

    /// Asks the radio layer to join the group of `descriptor`.
    ///
    /// Success only means the request was accepted; the group is up once
    /// [`AdHocEvent::GroupFormed`] arrives.
    async fn join_group(&self, descriptor: &CoordinatorDescriptor) -> Result<(), AdHocError>;

    /// Tears down group membership or the advertised group.
    async fn leave_group(&self);

    /// Subscribes to transport signals.
    fn events(&self) -> broadcast::Receiver<AdHocEvent>;
}
