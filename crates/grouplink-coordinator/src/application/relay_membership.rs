//! MembershipRelay: the coordinator's authoritative registry and fan-out plan.
//!
//! Every membership change accepted by the coordinator produces a *plan*: the
//! registry is mutated first, then a snapshot of the remaining members is
//! taken and turned into a list of [`Delivery`] values.  The session layer
//! hands those deliveries to its outbound sink; nothing here touches the
//! network.
//!
//! # Join (for beginners)
//!
//! ```text
//! member X ──Join(X, declared 0.0.0.0:p)──► coordinator
//!                                           │ endpoint := observed_ip:p
//!                                           │ registry.upsert(X)
//!                       ┌───────────────────┤
//!                       ▼                   ▼
//!          Join(X) to every other     SyncSet(registry − X) to X
//!          registered member
//! ```
//!
//! A duplicate Join simply replaces the record and repeats the fan-out, so a
//! member that rejoins after a lost reply still converges.
//!
//! # Leave
//!
//! Removing an id that is not registered changes nothing and sends nothing.
//! Otherwise every remaining member receives `Leave(X)`.

use std::net::SocketAddr;

use grouplink_core::{Device, DeviceId, Envelope, ProtocolError, Registry, Target, Upsert};
use tracing::{debug, warn};

/// One envelope to hand to the outbound sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Registry id of the recipient.
    pub to: DeviceId,
    pub endpoint: SocketAddr,
    pub envelope: Envelope,
}

/// Result of accepting a Join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinPlan {
    /// The registered record, with its endpoint host rewritten.
    pub device: Device,
    pub upsert: Upsert,
    /// `Join(device)` to the other members, then `SyncSet` to the joiner.
    pub deliveries: Vec<Delivery>,
    /// Registered members that could not be addressed (no usable endpoint).
    pub unreachable: Vec<DeviceId>,
}

/// Result of accepting a Leave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeavePlan {
    /// The record that was removed, if the id was registered.
    pub removed: Option<Device>,
    pub deliveries: Vec<Delivery>,
}

/// Result of resolving an outbound Data target.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataPlan {
    pub deliveries: Vec<Delivery>,
    /// The target id is not registered.
    pub unknown_target: Option<DeviceId>,
}

/// The coordinator's registry plus the rules that turn changes into fan-out.
#[derive(Debug, Clone)]
pub struct MembershipRelay {
    local: Device,
    registry: Registry,
}

impl MembershipRelay {
    /// `local` is the coordinator itself; it is the sender of every planned
    /// envelope and never enters the registry.
    pub fn new(local: Device) -> Self {
        Self {
            local,
            registry: Registry::new(),
        }
    }

    pub fn local(&self) -> &Device {
        &self.local
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Registers `subject` as reported by a Join from `source`.
    ///
    /// Returns `Ok(None)` when the Join names the coordinator itself.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::FieldTooLong`] if an envelope for the plan
    /// cannot be built.  The registry has already been updated in that case.
    pub fn accept_join(
        &mut self,
        subject: Device,
        source: SocketAddr,
    ) -> Result<Option<JoinPlan>, ProtocolError> {
        if subject.id == self.local.id {
            debug!(id = %subject.id, "ignoring Join that names the coordinator itself");
            return Ok(None);
        }

        // Prefer the observed source address; keep the declared port.
        let endpoint = subject
            .endpoint
            .map(|declared| SocketAddr::new(source.ip(), declared.port()));
        let device = Device { endpoint, ..subject };

        let upsert = self.registry.upsert(device.clone());
        if let Upsert::Replaced(previous) = &upsert {
            debug!(id = %device.id, %previous, "duplicate Join replaced existing record");
        }

        // Stable view of everyone except the joiner, taken after the upsert.
        let others = self.registry.snapshot_excluding(&device.id);

        let mut deliveries = Vec::with_capacity(others.len() + 1);
        let mut unreachable = Vec::new();

        let join = Envelope::join(&self.local, &device)?;
        for member in &others {
            match member.reachable_endpoint() {
                Some(endpoint) => deliveries.push(Delivery {
                    to: member.id.clone(),
                    endpoint,
                    envelope: join.clone(),
                }),
                None => unreachable.push(member.id.clone()),
            }
        }

        match device.reachable_endpoint() {
            Some(endpoint) => deliveries.push(Delivery {
                to: device.id.clone(),
                endpoint,
                envelope: Envelope::sync_set(&self.local, &others)?,
            }),
            None => {
                warn!(
                    id = %device.id,
                    "joined without a usable endpoint; it will not receive relayed envelopes"
                );
                unreachable.push(device.id.clone());
            }
        }

        Ok(Some(JoinPlan {
            device,
            upsert,
            deliveries,
            unreachable,
        }))
    }

    /// Unregisters `id` and plans `Leave` to the remaining members.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::FieldTooLong`] if the Leave envelope cannot be
    /// built.  The registry has already been updated in that case.
    pub fn accept_leave(&mut self, id: &DeviceId) -> Result<LeavePlan, ProtocolError> {
        let Some(removed) = self.registry.remove(id) else {
            debug!(%id, "Leave for unregistered device ignored");
            return Ok(LeavePlan {
                removed: None,
                deliveries: Vec::new(),
            });
        };

        let leave = Envelope::leave(&self.local, &removed)?;
        let deliveries = self
            .registry
            .snapshot()
            .into_iter()
            .filter_map(|member| {
                member.reachable_endpoint().map(|endpoint| Delivery {
                    to: member.id,
                    endpoint,
                    envelope: leave.clone(),
                })
            })
            .collect();

        Ok(LeavePlan {
            removed: Some(removed),
            deliveries,
        })
    }

    /// Plans a Data envelope from the coordinator to `target`.
    pub fn plan_data(&self, target: &Target, payload: Vec<u8>) -> DataPlan {
        let envelope = Envelope::data(&self.local, payload);
        let recipients: Vec<Device> = match target {
            Target::Broadcast => self.registry.snapshot(),
            Target::Device(id) => match self.registry.get(id) {
                Some(device) => vec![device.clone()],
                None => {
                    return DataPlan {
                        deliveries: Vec::new(),
                        unknown_target: Some(id.clone()),
                    }
                }
            },
        };

        let deliveries = recipients
            .into_iter()
            .filter_map(|member| {
                member.reachable_endpoint().map(|endpoint| Delivery {
                    to: member.id,
                    endpoint,
                    envelope: envelope.clone(),
                })
            })
            .collect();

        DataPlan {
            deliveries,
            unknown_target: None,
        }
    }

    /// Forgets every member.
    pub fn clear(&mut self) {
        self.registry.clear();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use grouplink_core::EnvelopeKind;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn coordinator() -> Device {
        Device::new("S", "server")
    }

    /// A member as it declares itself in its own Join.
    fn declared(id: &str, port: u16) -> Device {
        Device::new(id, format!("member-{id}"))
            .with_endpoint(SocketAddr::new([0, 0, 0, 0].into(), port))
    }

    fn source(last_octet: u8) -> SocketAddr {
        SocketAddr::new([192, 168, 49, last_octet].into(), 50000)
    }

    fn kinds_to(plan: &JoinPlan, id: &str) -> Vec<EnvelopeKind> {
        plan.deliveries
            .iter()
            .filter(|d| d.to.as_str() == id)
            .map(|d| d.envelope.kind)
            .collect()
    }

    // ── Join ─────────────────────────────────────────────────────────────────

    #[test]
    fn test_join_rewrites_host_and_keeps_declared_port() {
        let mut relay = MembershipRelay::new(coordinator());

        let plan = relay.accept_join(declared("A", 41000), source(10)).unwrap().unwrap();

        assert_eq!(plan.device.endpoint, Some("192.168.49.10:41000".parse().unwrap()));
        assert_eq!(plan.upsert, Upsert::Inserted);
    }

    #[test]
    fn test_first_join_gets_empty_sync_set_only() {
        let mut relay = MembershipRelay::new(coordinator());

        let plan = relay.accept_join(declared("A", 41000), source(10)).unwrap().unwrap();

        assert_eq!(plan.deliveries.len(), 1);
        let reply = &plan.deliveries[0];
        assert_eq!(reply.to, DeviceId::new("A"));
        assert_eq!(reply.envelope.kind, EnvelopeKind::SyncSet);
        assert!(reply.envelope.devices().unwrap().is_empty());
    }

    #[test]
    fn test_second_join_notifies_first_and_syncs_second() {
        // Arrange
        let mut relay = MembershipRelay::new(coordinator());
        relay.accept_join(declared("A", 41000), source(10)).unwrap();

        // Act
        let plan = relay.accept_join(declared("B", 42000), source(11)).unwrap().unwrap();

        // Assert: A hears Join(B); B receives SyncSet({A}).
        assert_eq!(kinds_to(&plan, "A"), vec![EnvelopeKind::Join]);
        assert_eq!(kinds_to(&plan, "B"), vec![EnvelopeKind::SyncSet]);

        let to_a = plan.deliveries.iter().find(|d| d.to.as_str() == "A").unwrap();
        assert_eq!(to_a.endpoint, "192.168.49.10:41000".parse().unwrap());
        assert_eq!(to_a.envelope.device().unwrap().id, DeviceId::new("B"));
        assert_eq!(to_a.envelope.sender_id, coordinator().id);

        let to_b = plan.deliveries.iter().find(|d| d.to.as_str() == "B").unwrap();
        let synced: Vec<DeviceId> = to_b
            .envelope
            .devices()
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(synced, vec![DeviceId::new("A")]);
    }

    #[test]
    fn test_duplicate_join_is_idempotent_replace() {
        let mut relay = MembershipRelay::new(coordinator());
        relay.accept_join(declared("A", 41000), source(10)).unwrap();

        let plan = relay.accept_join(declared("A", 41001), source(10)).unwrap().unwrap();

        assert!(matches!(plan.upsert, Upsert::Replaced(_)));
        assert_eq!(relay.registry().len(), 1);
        assert_eq!(
            relay.registry().get(&DeviceId::new("A")).unwrap().endpoint,
            Some("192.168.49.10:41001".parse().unwrap())
        );
    }

    #[test]
    fn test_join_naming_coordinator_is_ignored() {
        let mut relay = MembershipRelay::new(coordinator());
        let me = coordinator().with_endpoint("0.0.0.0:9999".parse().unwrap());

        assert_eq!(relay.accept_join(me, source(1)).unwrap(), None);
        assert!(relay.registry().is_empty());
    }

    #[test]
    fn test_join_with_port_zero_is_registered_but_unreachable() {
        let mut relay = MembershipRelay::new(coordinator());
        relay.accept_join(declared("A", 41000), source(10)).unwrap();

        let plan = relay.accept_join(declared("Z", 0), source(12)).unwrap().unwrap();

        assert!(relay.registry().contains(&DeviceId::new("Z")));
        assert_eq!(plan.unreachable, vec![DeviceId::new("Z")]);
        // A still hears about Z.
        assert_eq!(kinds_to(&plan, "A"), vec![EnvelopeKind::Join]);
        assert!(kinds_to(&plan, "Z").is_empty());
    }

    #[test]
    fn test_join_skips_members_without_usable_endpoint() {
        let mut relay = MembershipRelay::new(coordinator());
        relay.accept_join(declared("Z", 0), source(12)).unwrap();

        let plan = relay.accept_join(declared("A", 41000), source(10)).unwrap().unwrap();

        assert_eq!(plan.unreachable, vec![DeviceId::new("Z")]);
        // The SyncSet still lists Z.
        let reply = plan.deliveries.iter().find(|d| d.to.as_str() == "A").unwrap();
        assert_eq!(reply.envelope.devices().unwrap().len(), 1);
    }

    // ── Leave ────────────────────────────────────────────────────────────────

    #[test]
    fn test_leave_notifies_remaining_members() {
        // Arrange
        let mut relay = MembershipRelay::new(coordinator());
        relay.accept_join(declared("A", 41000), source(10)).unwrap();
        relay.accept_join(declared("B", 42000), source(11)).unwrap();

        // Act
        let plan = relay.accept_leave(&DeviceId::new("A")).unwrap();

        // Assert
        assert_eq!(plan.removed.map(|d| d.id), Some(DeviceId::new("A")));
        assert_eq!(plan.deliveries.len(), 1);
        assert_eq!(plan.deliveries[0].to, DeviceId::new("B"));
        assert_eq!(plan.deliveries[0].envelope.kind, EnvelopeKind::Leave);
        assert_eq!(plan.deliveries[0].envelope.device().unwrap().id, DeviceId::new("A"));
    }

    #[test]
    fn test_leave_for_unknown_id_is_noop() {
        let mut relay = MembershipRelay::new(coordinator());
        relay.accept_join(declared("A", 41000), source(10)).unwrap();

        let plan = relay.accept_leave(&DeviceId::new("ghost")).unwrap();

        assert_eq!(plan.removed, None);
        assert!(plan.deliveries.is_empty());
        assert_eq!(relay.registry().len(), 1);
    }

    // ── Data ─────────────────────────────────────────────────────────────────

    #[test]
    fn test_broadcast_data_reaches_every_reachable_member() {
        let mut relay = MembershipRelay::new(coordinator());
        relay.accept_join(declared("A", 41000), source(10)).unwrap();
        relay.accept_join(declared("B", 42000), source(11)).unwrap();

        let plan = relay.plan_data(&Target::Broadcast, b"hi".to_vec());

        let to: Vec<&str> = plan.deliveries.iter().map(|d| d.to.as_str()).collect();
        assert_eq!(to, vec!["A", "B"]);
        assert!(plan.deliveries.iter().all(|d| d.envelope.payload == b"hi"));
    }

    #[test]
    fn test_data_to_unknown_device_reports_unknown_target() {
        let relay = MembershipRelay::new(coordinator());

        let plan = relay.plan_data(&Target::Device(DeviceId::new("nobody")), vec![1]);

        assert!(plan.deliveries.is_empty());
        assert_eq!(plan.unknown_target, Some(DeviceId::new("nobody")));
    }

    // ── Properties ───────────────────────────────────────────────────────────

    #[derive(Debug, Clone)]
    enum Op {
        Join(u8),
        Leave(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![(0u8..6).prop_map(Op::Join), (0u8..6).prop_map(Op::Leave)]
    }

    proptest! {
        /// The registry always equals the set of ids whose last accepted
        /// operation was a Join.
        #[test]
        fn prop_registry_converges_to_unmatched_joins(
            ops in proptest::collection::vec(op(), 0..64),
        ) {
            let mut relay = MembershipRelay::new(coordinator());
            let mut expected = BTreeSet::new();

            for op in &ops {
                match op {
                    Op::Join(n) => {
                        let id = format!("m{n}");
                        relay.accept_join(declared(&id, 40000 + *n as u16), source(*n)).unwrap();
                        expected.insert(id);
                    }
                    Op::Leave(n) => {
                        let id = format!("m{n}");
                        relay.accept_leave(&DeviceId::new(id.clone())).unwrap();
                        expected.remove(&id);
                    }
                }
            }

            let actual: BTreeSet<String> =
                relay.registry().snapshot().into_iter().map(|d| d.id.to_string()).collect();
            prop_assert_eq!(actual, expected);
        }

        /// On Join(D) every other registered member gets exactly one Join(D),
        /// and D gets exactly one SyncSet equal to the registry minus D.
        #[test]
        fn prop_join_fan_out_is_complete(
            existing in proptest::collection::btree_set(0u8..20, 0..10),
            joiner in 20u8..30,
        ) {
            let mut relay = MembershipRelay::new(coordinator());
            for n in &existing {
                let member = declared(&format!("m{n}"), 40000 + *n as u16);
                relay.accept_join(member, source(*n)).unwrap();
            }

            let plan = relay
                .accept_join(declared(&format!("m{joiner}"), 41000), source(joiner))
                .unwrap()
                .unwrap();

            for n in &existing {
                let id = format!("m{n}");
                let joins: Vec<&Delivery> = plan
                    .deliveries
                    .iter()
                    .filter(|d| d.to.as_str() == id)
                    .collect();
                prop_assert_eq!(joins.len(), 1);
                prop_assert_eq!(joins[0].envelope.kind, EnvelopeKind::Join);
                prop_assert_eq!(joins[0].envelope.device().unwrap().id, plan.device.id.clone());
            }

            let sync: Vec<&Delivery> = plan
                .deliveries
                .iter()
                .filter(|d| d.to == plan.device.id)
                .collect();
            prop_assert_eq!(sync.len(), 1);
            let synced: BTreeSet<String> = sync[0]
                .envelope
                .devices()
                .unwrap()
                .into_iter()
                .map(|d| d.id.to_string())
                .collect();
            let expected: BTreeSet<String> = existing.iter().map(|n| format!("m{n}")).collect();
            prop_assert_eq!(synced, expected);
        }
    }
}
