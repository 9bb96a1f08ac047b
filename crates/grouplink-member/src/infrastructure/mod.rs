//! Infrastructure layer: the member role wired to sockets and the ad hoc
//! transport.

pub mod session;
