//! # grouplink-core
//!
//! Shared library for GroupLink containing the wire envelope codec, the device
//! registry, the one-shot relay transport, and the seam to the ad hoc network
//! layer.
//!
//! This crate is used by both the coordinator and member applications.
//!
//! # Architecture overview (for beginners)
//!
//! GroupLink keeps a small group of devices in sync over an ad hoc local
//! network.  One device (the *coordinator*) owns the authoritative list of
//! group members; every other device (a *member*) keeps a mirror of that list
//! and exchanges application messages with the rest of the group.
//!
//! This crate defines:
//!
//! - **`protocol`** – How bytes travel over the network.  Every message is an
//!   [`Envelope`] encoded into a compact binary record (8-byte header + body).
//!   Exactly one envelope travels over each TCP connection.
//!
//! - **`domain`** – Pure data with no I/O: the [`Device`] descriptor and the
//!   [`Registry`] that maps device ids to devices.
//!
//! - **`net`** – The accept loop that receives envelopes and the sender that
//!   pushes them out, one connection per envelope.
//!
//! - **`adhoc`** – The trait the radio-level ad hoc transport implements,
//!   plus two implementations: a static LAN transport and an in-process
//!   loopback network used by tests.
//!
//! - **`session`** – Types shared by both roles' session objects: the event
//!   stream, send targets, and session errors.
//!
//! - **`config`** – TOML configuration shared by both binaries.

pub mod adhoc;
pub mod config;
pub mod domain;
pub mod net;
pub mod protocol;
pub mod session;

// Re-export the most-used types at the crate root so callers can write
// `grouplink_core::Envelope` instead of `grouplink_core::protocol::envelope::Envelope`.
pub use domain::device::{Device, DeviceId};
pub use domain::registry::{Registry, Upsert};
pub use protocol::codec::{decode_envelope, encode_envelope, ProtocolError};
pub use protocol::envelope::{Envelope, EnvelopeKind};
pub use session::{SessionError, SessionEvent, Target};
