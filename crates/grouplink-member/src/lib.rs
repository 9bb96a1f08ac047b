//! grouplink-member library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does a member do? (for beginners)
//!
//! A *member* is any device in the group that is not the coordinator.  It:
//!
//! 1. Discovers coordinators advertised on the ad hoc network.
//! 2. Joins one of them at the radio level and waits for the group to form.
//! 3. Starts its own listener on an OS-assigned port and sends a `Join`
//!    naming that port to the coordinator.
//! 4. Keeps a *mirror* of the coordinator's registry: a `SyncSet` replaces
//!    it, later `Join`/`Leave` envelopes patch it.
//! 5. Sends application data to the coordinator and directly to peers.

pub mod application;
pub mod infrastructure;

pub use application::mirror_registry::{MirrorChange, MirrorRegistry, Recipient};
pub use infrastructure::session::{MemberSession, MemberState};
