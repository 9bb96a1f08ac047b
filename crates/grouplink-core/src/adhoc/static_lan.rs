//! Ad hoc transport for hosts that already share a LAN.
//!
//! There is no radio layer to drive: the "group" is the existing network.
//! Advertising forms the group immediately, discovery reports the single
//! coordinator address from configuration, and joining succeeds at once.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use super::{AdHocError, AdHocEvent, AdHocTransport, CoordinatorDescriptor};
use crate::domain::device::{Device, DeviceId};

const EVENT_CAPACITY: usize = 16;

/// [`AdHocTransport`] over an already-connected LAN.
pub struct StaticLanTransport {
    local: Device,
    coordinator_address: SocketAddr,
    group_name: String,
    advertised: Mutex<Option<BTreeMap<String, String>>>,
    events_tx: broadcast::Sender<AdHocEvent>,
}

impl StaticLanTransport {
    /// `coordinator_address` is what discovery reports to members.
    pub fn new(
        local: Device,
        coordinator_address: SocketAddr,
        group_name: impl Into<String>,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            local,
            coordinator_address,
            group_name: group_name.into(),
            advertised: Mutex::new(None),
            events_tx,
        }
    }

    /// The record currently advertised, if any.
    pub fn advertised_record(&self) -> Option<BTreeMap<String, String>> {
        self.advertised.lock().ok().and_then(|guard| guard.clone())
    }

    fn emit(&self, event: AdHocEvent) {
        // No subscribers simply means nobody is listening yet.
        let _ = self.events_tx.send(event);
    }
}

#[async_trait]
impl AdHocTransport for StaticLanTransport {
    fn local_device(&self) -> Device {
        self.local.clone()
    }

    async fn advertise_group(&self, record: BTreeMap<String, String>) -> Result<(), AdHocError> {
        {
            let mut advertised = self
                .advertised
                .lock()
                .map_err(|_| AdHocError::Unavailable("advertisement state poisoned".to_string()))?;
            *advertised = Some(record);
        }
        info!("static LAN group '{}' formed", self.group_name);
        self.emit(AdHocEvent::GroupFormed {
            is_coordinator: true,
            coordinator_endpoint: None,
        });
        Ok(())
    }

    async fn discover(
        &self,
        _timeout: Duration,
    ) -> Result<mpsc::Receiver<CoordinatorDescriptor>, AdHocError> {
        let (tx, rx) = mpsc::channel(1);
        // The coordinator's real id is unknown until it first sends an
        // envelope; the address stands in for it.
        let descriptor = CoordinatorDescriptor {
            device_id: DeviceId::new(format!("lan:{}", self.coordinator_address)),
            display_name: self.coordinator_address.to_string(),
            group_name: self.group_name.clone(),
            endpoint: Some(self.coordinator_address),
            properties: BTreeMap::new(),
        };
        debug!("static LAN discovery reports {}", self.coordinator_address);
        // Capacity 1 and a fresh channel: this cannot fail.
        let _ = tx.try_send(descriptor);
        Ok(rx)
    }

    async fn join_group(&self, descriptor: &CoordinatorDescriptor) -> Result<(), AdHocError> {
        let endpoint = descriptor
            .endpoint
            .ok_or_else(|| AdHocError::GroupNotFound(descriptor.device_id.clone()))?;
        self.emit(AdHocEvent::GroupFormed {
            is_coordinator: false,
            coordinator_endpoint: Some(endpoint),
        });
        Ok(())
    }

    async fn leave_group(&self) {
        if let Ok(mut advertised) = self.advertised.lock() {
            *advertised = None;
        }
    }

    fn events(&self) -> broadcast::Receiver<AdHocEvent> {
        self.events_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adhoc::service_record;

    fn transport() -> StaticLanTransport {
        StaticLanTransport::new(
            Device::new("node-1", "node"),
            "192.168.1.10:9999".parse().unwrap(),
            "office",
        )
    }

    #[tokio::test]
    async fn test_discover_reports_configured_coordinator_then_ends() {
        let transport = transport();
        let mut rx = transport.discover(Duration::from_millis(10)).await.unwrap();

        let found = rx.recv().await.expect("one descriptor");
        assert_eq!(found.endpoint, Some("192.168.1.10:9999".parse().unwrap()));
        assert_eq!(found.group_name, "office");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_advertise_emits_group_formed_as_coordinator() {
        let transport = transport();
        let mut events = transport.events();

        transport
            .advertise_group(service_record("office", 9999, &BTreeMap::new()))
            .await
            .unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            AdHocEvent::GroupFormed {
                is_coordinator: true,
                coordinator_endpoint: None
            }
        );
        assert!(transport.advertised_record().is_some());
    }

    #[tokio::test]
    async fn test_join_emits_group_formed_with_descriptor_endpoint() {
        let transport = transport();
        let mut events = transport.events();
        let descriptor = transport.discover(Duration::ZERO).await.unwrap().recv().await.unwrap();

        transport.join_group(&descriptor).await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            AdHocEvent::GroupFormed {
                is_coordinator: false,
                coordinator_endpoint: descriptor.endpoint
            }
        );
    }

    #[tokio::test]
    async fn test_join_without_endpoint_fails() {
        let transport = transport();
        let descriptor = CoordinatorDescriptor {
            device_id: DeviceId::new("x"),
            display_name: "x".to_string(),
            group_name: "g".to_string(),
            endpoint: None,
            properties: BTreeMap::new(),
        };
        assert!(matches!(
            transport.join_group(&descriptor).await,
            Err(AdHocError::GroupNotFound(_))
        ));
    }
}
