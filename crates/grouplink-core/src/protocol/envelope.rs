//! The wire envelope carried over each one-shot relay connection.
//!
//! An envelope wraps one message kind, the identity of the device that sent
//! it, and a kind-specific payload:
//!
//! | Kind      | Payload                                   |
//! |-----------|-------------------------------------------|
//! | `Join`    | one device descriptor (the joining device) |
//! | `Leave`   | one device descriptor (the leaving device) |
//! | `SyncSet` | an ordered list of device descriptors      |
//! | `Data`    | opaque application bytes                   |
//!
//! The payload is kept as raw bytes so that envelopes can be relayed without
//! being re-interpreted; the typed accessors [`Envelope::device`] and
//! [`Envelope::devices`] decode it on demand.

use serde::{Deserialize, Serialize};

use crate::domain::device::{Device, DeviceId};
use crate::protocol::codec::{self, ProtocolError};

// ── Protocol constants ────────────────────────────────────────────────────────

/// Current protocol version byte.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Size of the envelope header in bytes.
pub const HEADER_SIZE: usize = 8;

// ── Envelope kinds ────────────────────────────────────────────────────────────

/// Message kind codes carried in the second header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EnvelopeKind {
    /// A device joined the group.
    Join = 0x01,
    /// A device left the group.
    Leave = 0x02,
    /// Full registry snapshot sent privately to a newly joined member.
    SyncSet = 0x03,
    /// Application payload.
    Data = 0x04,
}

impl TryFrom<u8> for EnvelopeKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(EnvelopeKind::Join),
            0x02 => Ok(EnvelopeKind::Leave),
            0x03 => Ok(EnvelopeKind::SyncSet),
            0x04 => Ok(EnvelopeKind::Data),
            _ => Err(()),
        }
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// One message as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Determines how `payload` is interpreted.
    pub kind: EnvelopeKind,
    /// Id of the device that produced this envelope.
    pub sender_id: DeviceId,
    /// Display name of the device that produced this envelope.
    pub sender_name: String,
    /// Kind-specific payload bytes.
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Builds an envelope from raw parts.
    pub fn new(kind: EnvelopeKind, sender: &Device, payload: Vec<u8>) -> Self {
        Self {
            kind,
            sender_id: sender.id.clone(),
            sender_name: sender.display_name.clone(),
            payload,
        }
    }

    /// `Join(subject)` sent by `sender`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::FieldTooLong`] if a descriptor field exceeds
    /// the wire limits.
    pub fn join(sender: &Device, subject: &Device) -> Result<Self, ProtocolError> {
        Ok(Self::new(EnvelopeKind::Join, sender, codec::encode_device_payload(subject)?))
    }

    /// `Leave(subject)` sent by `sender`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::FieldTooLong`] if a descriptor field exceeds
    /// the wire limits.
    pub fn leave(sender: &Device, subject: &Device) -> Result<Self, ProtocolError> {
        Ok(Self::new(EnvelopeKind::Leave, sender, codec::encode_device_payload(subject)?))
    }

    /// `SyncSet(devices)` sent by `sender`; order is preserved on the wire.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::FieldTooLong`] if the list or a descriptor
    /// field exceeds the wire limits.
    pub fn sync_set(sender: &Device, devices: &[Device]) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            EnvelopeKind::SyncSet,
            sender,
            codec::encode_device_list_payload(devices)?,
        ))
    }

    /// `Data(bytes)` sent by `sender`.
    pub fn data(sender: &Device, bytes: Vec<u8>) -> Self {
        Self::new(EnvelopeKind::Data, sender, bytes)
    }

    /// Decodes the single descriptor carried by a `Join` or `Leave`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedPayload`] for any other kind or for
    /// an undecodable payload.
    pub fn device(&self) -> Result<Device, ProtocolError> {
        match self.kind {
            EnvelopeKind::Join | EnvelopeKind::Leave => codec::decode_device_payload(&self.payload),
            other => Err(ProtocolError::MalformedPayload(format!(
                "{other:?} envelope does not carry a single device"
            ))),
        }
    }

    /// Decodes the descriptor list carried by a `SyncSet`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedPayload`] for any other kind or for
    /// an undecodable payload.
    pub fn devices(&self) -> Result<Vec<Device>, ProtocolError> {
        match self.kind {
            EnvelopeKind::SyncSet => codec::decode_device_list_payload(&self.payload),
            other => Err(ProtocolError::MalformedPayload(format!(
                "{other:?} envelope does not carry a device list"
            ))),
        }
    }

    /// The sender as a device descriptor without an endpoint.
    pub fn sender(&self) -> Device {
        Device::new(self.sender_id.clone(), self.sender_name.clone())
    }
}
