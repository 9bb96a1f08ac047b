//! Application layer: the member's view of the group, free of I/O.
//!
//! [`mirror_registry::MirrorRegistry`] applies inbound membership envelopes
//! to a local copy of the registry and resolves send targets to endpoints.
//! The infrastructure layer feeds it and does the actual sending.

pub mod mirror_registry;
