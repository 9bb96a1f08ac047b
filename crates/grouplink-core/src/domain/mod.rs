//! Domain entities for GroupLink.
//!
//! This module contains pure data and business rules with no infrastructure
//! dependencies: no sockets, no tasks, no files.  Everything here can be
//! unit-tested without a runtime.
//!
//! - **`device`** – the [`device::Device`] descriptor and its identifier.
//! - **`registry`** – the id → device map that both roles keep.  The
//!   coordinator's copy is authoritative; members hold a mirror.

pub mod device;
pub mod registry;
