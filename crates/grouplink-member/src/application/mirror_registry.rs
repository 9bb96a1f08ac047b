//! The member's mirror of the coordinator's registry.
//!
//! The mirror never contains the member itself and never contains the
//! coordinator: the coordinator is tracked separately because it is always a
//! send target but never appears in the coordinator's own registry.
//!
//! | Inbound  | Effect on the mirror                       | Change       |
//! |----------|--------------------------------------------|--------------|
//! | SyncSet  | replaced wholesale (self filtered out)     | `Synced`     |
//! | Join     | upsert, unless it names this member        | `Joined`     |
//! | Leave    | remove, no-op when absent                  | `Left`       |
//! | Data     | none                                       | `Ignored`    |

use std::net::SocketAddr;

use grouplink_core::{Device, DeviceId, Envelope, EnvelopeKind, ProtocolError, Registry, Target};
use tracing::debug;

/// What applying one envelope did to the mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorChange {
    Joined(Device),
    Left(Device),
    /// The mirror now holds exactly these devices.
    Synced(Vec<Device>),
    /// Nothing changed.
    Ignored,
}

/// One resolved destination of an outbound envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub to: DeviceId,
    pub endpoint: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct MirrorRegistry {
    local: Device,
    coordinator: Option<Device>,
    peers: Registry,
}

impl MirrorRegistry {
    pub fn new(local: Device) -> Self {
        Self {
            local,
            coordinator: None,
            peers: Registry::new(),
        }
    }

    pub fn local(&self) -> &Device {
        &self.local
    }

    /// The coordinator this mirror follows, if connected.
    pub fn coordinator(&self) -> Option<&Device> {
        self.coordinator.as_ref()
    }

    /// Starts following `coordinator`; its endpoint is where Join, Leave,
    /// and Data for the coordinator are sent.
    pub fn set_coordinator(&mut self, coordinator: Device) {
        self.coordinator = Some(coordinator);
    }

    /// Snapshot of the mirrored peers, sorted by id.
    pub fn snapshot(&self) -> Vec<Device> {
        self.peers.snapshot()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Applies one inbound envelope.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] when a membership payload cannot be
    /// decoded; the mirror is left unchanged.
    pub fn apply(&mut self, envelope: &Envelope) -> Result<MirrorChange, ProtocolError> {
        match envelope.kind {
            EnvelopeKind::SyncSet => {
                let devices = envelope.devices()?;
                self.learn_coordinator(envelope);
                self.peers.replace_all(devices, Some(&self.local.id));
                Ok(MirrorChange::Synced(self.peers.snapshot()))
            }
            EnvelopeKind::Join => {
                let device = envelope.device()?;
                if self.is_excluded(&device.id) {
                    debug!(id = %device.id, "Join for self or coordinator not mirrored");
                    return Ok(MirrorChange::Ignored);
                }
                self.peers.upsert(device.clone());
                Ok(MirrorChange::Joined(device))
            }
            EnvelopeKind::Leave => {
                let device = envelope.device()?;
                match self.peers.remove(&device.id) {
                    Some(removed) => Ok(MirrorChange::Left(removed)),
                    None => {
                        debug!(id = %device.id, "Leave for unknown peer ignored");
                        Ok(MirrorChange::Ignored)
                    }
                }
            }
            EnvelopeKind::Data => Ok(MirrorChange::Ignored),
        }
    }

    /// Resolves `target` to endpoints.
    ///
    /// Broadcast means the coordinator plus every reachable mirrored peer.
    /// Returns `None` when `target` names a device this member does not know.
    pub fn recipients(&self, target: &Target) -> Option<Vec<Recipient>> {
        let coordinator = self.coordinator.as_ref().and_then(recipient_of);
        match target {
            Target::Broadcast => Some(
                coordinator
                    .into_iter()
                    .chain(self.peers.snapshot().iter().filter_map(recipient_of))
                    .collect(),
            ),
            Target::Device(id) => {
                if self.coordinator.as_ref().is_some_and(|c| &c.id == id) {
                    return Some(coordinator.into_iter().collect());
                }
                let peer = self.peers.get(id)?;
                Some(recipient_of(peer).into_iter().collect())
            }
        }
    }

    /// Forgets the coordinator and every peer.
    pub fn clear(&mut self) {
        self.coordinator = None;
        self.peers.clear();
    }

    fn is_excluded(&self, id: &DeviceId) -> bool {
        *id == self.local.id || self.coordinator.as_ref().is_some_and(|c| &c.id == id)
    }

    /// Discovery may only know a placeholder id for the coordinator; the
    /// SyncSet sender is authoritative.
    fn learn_coordinator(&mut self, envelope: &Envelope) {
        if let Some(coordinator) = self.coordinator.as_mut() {
            if coordinator.id != envelope.sender_id {
                debug!(
                    placeholder = %coordinator.id,
                    id = %envelope.sender_id,
                    "learned coordinator id"
                );
                coordinator.id = envelope.sender_id.clone();
                coordinator.display_name = envelope.sender_name.clone();
            }
        }
    }
}

fn recipient_of(device: &Device) -> Option<Recipient> {
    device.reachable_endpoint().map(|endpoint| Recipient {
        to: device.id.clone(),
        endpoint,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
