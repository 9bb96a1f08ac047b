//! Application layer of the coordinator.
//!
//! # What is the "application" layer? (for beginners)
//!
//! The application layer sits between the domain (the device registry in
//! `grouplink-core`) and the infrastructure (sockets, the ad hoc transport).
//! Code here decides *what* should happen when an envelope arrives, and
//! leaves *how* it is sent to the infrastructure.  It performs no I/O, so
//! every decision can be checked in a plain unit test.
//!
//! # Sub-modules
//!
//! - **`relay_membership`** – Applies Join and Leave to the authoritative
//!   registry and plans the resulting fan-out: who must be told about the
//!   change, and which snapshot the joiner receives.

pub mod relay_membership;
