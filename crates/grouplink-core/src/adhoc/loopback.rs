//! In-process simulated ad hoc network on `127.0.0.1`.
//!
//! A [`LoopbackNetwork`] stands in for the radio layer shared by several
//! devices in one test process.  Each device gets a [`LoopbackTransport`]
//! from [`LoopbackNetwork::transport`].  Envelopes still travel over real
//! loopback TCP; only group formation, discovery, and link signals are
//! simulated.
//!
//! Fault injection:
//! - [`LoopbackNetwork::drop_link`] cuts one member's link: the member sees
//!   [`AdHocEvent::PeerLinkLost`] and its coordinator sees
//!   [`AdHocEvent::PeerDisconnected`].
//! - [`LoopbackNetwork::set_radio_enabled`] makes every operation of one
//!   device fail with [`AdHocError::Unavailable`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::{AdHocError, AdHocEvent, AdHocTransport, CoordinatorDescriptor};
use crate::domain::device::{Device, DeviceId};

const EVENT_CAPACITY: usize = 32;
const LOOPBACK_HOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Shared state of the simulated network.  Cheap to clone.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<DeviceId, Node>,
    /// Advertised groups keyed by coordinator id.
    groups: HashMap<DeviceId, BTreeMap<String, String>>,
    /// Member id → coordinator id.
    memberships: HashMap<DeviceId, DeviceId>,
    radio_off: HashSet<DeviceId>,
}

struct Node {
    device: Device,
    events_tx: broadcast::Sender<AdHocEvent>,
}

impl NetworkState {
    fn emit(&self, id: &DeviceId, event: AdHocEvent) {
        if let Some(node) = self.nodes.get(id) {
            let _ = node.events_tx.send(event);
        }
    }

    fn check_radio(&self, id: &DeviceId) -> Result<(), AdHocError> {
        if self.radio_off.contains(id) {
            Err(AdHocError::Unavailable(format!("radio of {id} is disabled")))
        } else {
            Ok(())
        }
    }
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a device on the network and returns its transport.
    pub fn transport(
        &self,
        id: impl Into<DeviceId>,
        display_name: impl Into<String>,
    ) -> LoopbackTransport {
        let device = Device::new(id, display_name);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        self.lock().nodes.insert(
            device.id.clone(),
            Node {
                device: device.clone(),
                events_tx,
            },
        );
        LoopbackTransport {
            device,
            network: self.clone(),
        }
    }

    /// Cuts the link of `member` to its group.
    pub fn drop_link(&self, member: &DeviceId) {
        let mut state = self.lock();
        if let Some(coordinator) = state.memberships.remove(member) {
            debug!(%member, %coordinator, "loopback link dropped");
            state.emit(member, AdHocEvent::PeerLinkLost);
            state.emit(&coordinator, AdHocEvent::PeerDisconnected(member.clone()));
        }
    }

    /// Enables or disables the radio of `id`.
    pub fn set_radio_enabled(&self, id: &DeviceId, enabled: bool) {
        let mut state = self.lock();
        if enabled {
            state.radio_off.remove(id);
        } else {
            state.radio_off.insert(id.clone());
        }
    }

    /// Members currently linked to the group of `coordinator`.
    pub fn members_of(&self, coordinator: &DeviceId) -> Vec<DeviceId> {
        let state = self.lock();
        let mut members: Vec<DeviceId> = state
            .memberships
            .iter()
            .filter(|(_, c)| *c == coordinator)
            .map(|(m, _)| m.clone())
            .collect();
        members.sort();
        members
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        // A panic while holding the lock can only come from a test assertion;
        // keep using the state rather than cascading the panic.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn advertisements(&self) -> Vec<CoordinatorDescriptor> {
        let state = self.lock();
        let mut found: Vec<CoordinatorDescriptor> = state
            .groups
            .iter()
            .filter_map(|(owner_id, record)| {
                let owner = &state.nodes.get(owner_id)?.device;
                CoordinatorDescriptor::from_service_record(owner, record, Some(LOOPBACK_HOST))
            })
            .collect();
        found.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        found
    }
}

/// One device's view of a [`LoopbackNetwork`].
pub struct LoopbackTransport {
    device: Device,
    network: LoopbackNetwork,
}

#[async_trait]
impl AdHocTransport for LoopbackTransport {
    fn local_device(&self) -> Device {
        self.device.clone()
    }

    async fn advertise_group(&self, record: BTreeMap<String, String>) -> Result<(), AdHocError> {
        let mut state = self.network.lock();
        state.check_radio(&self.device.id)?;
        if state.memberships.contains_key(&self.device.id) {
            return Err(AdHocError::Busy);
        }
        state.groups.insert(self.device.id.clone(), record);
        state.emit(
            &self.device.id,
            AdHocEvent::GroupFormed {
                is_coordinator: true,
                coordinator_endpoint: None,
            },
        );
        Ok(())
    }

    async fn discover(
        &self,
        timeout: Duration,
    ) -> Result<mpsc::Receiver<CoordinatorDescriptor>, AdHocError> {
        self.network.lock().check_radio(&self.device.id)?;
        let found = self.network.advertisements();
        let (tx, rx) = mpsc::channel(found.len().max(1));
        tokio::spawn(async move {
            for descriptor in found {
                if tx.send(descriptor).await.is_err() {
                    return;
                }
            }
            // Keep the stream open for the whole discovery window.
            tokio::time::sleep(timeout).await;
        });
        Ok(rx)
    }

    async fn join_group(&self, descriptor: &CoordinatorDescriptor) -> Result<(), AdHocError> {
        let mut state = self.network.lock();
        state.check_radio(&self.device.id)?;
        let record = state
            .groups
            .get(&descriptor.device_id)
            .ok_or_else(|| AdHocError::GroupNotFound(descriptor.device_id.clone()))?;
        let owner = state
            .nodes
            .get(&descriptor.device_id)
            .map(|node| node.device.clone())
            .ok_or_else(|| AdHocError::GroupNotFound(descriptor.device_id.clone()))?;
        let coordinator_endpoint =
            CoordinatorDescriptor::from_service_record(&owner, record, Some(LOOPBACK_HOST))
                .and_then(|d| d.endpoint);

        state
            .memberships
            .insert(self.device.id.clone(), descriptor.device_id.clone());
        state.emit(
            &self.device.id,
            AdHocEvent::GroupFormed {
                is_coordinator: false,
                coordinator_endpoint,
            },
        );
        Ok(())
    }

    async fn leave_group(&self) {
        let mut state = self.network.lock();
        let id = &self.device.id;

        if state.groups.remove(id).is_some() {
            let members: Vec<DeviceId> = state
                .memberships
                .iter()
                .filter(|(_, c)| *c == id)
                .map(|(m, _)| m.clone())
                .collect();
            for member in members {
                state.memberships.remove(&member);
                state.emit(&member, AdHocEvent::PeerLinkLost);
            }
        }

        if let Some(coordinator) = state.memberships.remove(id) {
            state.emit(&coordinator, AdHocEvent::PeerDisconnected(id.clone()));
        }
    }

    fn events(&self) -> broadcast::Receiver<AdHocEvent> {
        let state = self.network.lock();
        match state.nodes.get(&self.device.id) {
            Some(node) => node.events_tx.subscribe(),
            // Unreachable through the public API; hand out a receiver that
            // simply never yields.
            None => broadcast::channel(1).1,
        }
    }
}
