//! Device registry: the id → device map kept by both roles.
//!
//! The coordinator's registry is the single source of truth for group
//! membership.  Each member keeps a *mirror* that converges on the
//! coordinator's registry as Join, Leave, and SyncSet envelopes arrive.
//!
//! # Eventual consistency (for beginners)
//!
//! Every envelope travels over its own TCP connection, so two envelopes sent
//! one after the other may arrive in either order.  A member can therefore
//! see `Leave(X)` before it has seen `Join(X)`.  The registry tolerates this:
//! removing an id that is not present is a no-op, and inserting an id that is
//! already present replaces the old record.  Neither case is an error.
//!
//! # HashMap choice
//!
//! A `HashMap<DeviceId, Device>` provides O(1) lookup by id.  Iteration order
//! is not stable, so [`Registry::snapshot`] sorts by id before returning; this
//! keeps SyncSet payloads and test expectations deterministic.

use std::collections::HashMap;

use crate::domain::device::{Device, DeviceId};

/// Outcome of [`Registry::upsert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upsert {
    /// The id was not present before.
    Inserted,
    /// The id was already present; the previous record is returned.
    Replaced(Device),
}

/// In-memory registry of group members, keyed by [`DeviceId`].
///
/// The registry never holds two records with the same id.  It is not
/// internally synchronised: each role keeps it behind a single async mutex so
/// that mutations are serialised.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    devices: HashMap<DeviceId, Device>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the record for `device.id`.
    pub fn upsert(&mut self, device: Device) -> Upsert {
        match self.devices.insert(device.id.clone(), device) {
            Some(previous) => Upsert::Replaced(previous),
            None => Upsert::Inserted,
        }
    }

    /// Removes the record for `id`, returning it if it was present.
    pub fn remove(&mut self, id: &DeviceId) -> Option<Device> {
        self.devices.remove(id)
    }

    pub fn get(&self, id: &DeviceId) -> Option<&Device> {
        self.devices.get(id)
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.devices.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Returns a copy of every record, sorted by id.
    pub fn snapshot(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    /// Returns a sorted copy of every record except `excluded`.
    pub fn snapshot_excluding(&self, excluded: &DeviceId) -> Vec<Device> {
        let mut devices = self.snapshot();
        devices.retain(|d| &d.id != excluded);
        devices
    }

    /// Replaces the whole content with `devices`, skipping `excluded`.
    ///
    /// Later duplicates in `devices` win over earlier ones.
    pub fn replace_all(&mut self, devices: Vec<Device>, excluded: Option<&DeviceId>) {
        self.devices.clear();
        for device in devices {
            if excluded == Some(&device.id) {
                continue;
            }
            self.devices.insert(device.id.clone(), device);
        }
    }

    /// Removes every record.
    pub fn clear(&mut self) {
        self.devices.clear();
    }
}
