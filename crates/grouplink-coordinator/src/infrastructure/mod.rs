//! Infrastructure layer: the coordinator role wired to sockets and the ad
//! hoc transport.
//!
//! # What lives here? (for beginners)
//!
//! The `application` layer decides *what* to send after a Join or Leave.
//! This layer does the sending: it owns the TCP listener on the well-known
//! port, the per-peer outbound queues, and the task that watches the radio
//! layer for link changes.

pub mod session;
