//! Types shared by the coordinator and member sessions.
//!
//! Both roles report what happens through a single stream of
//! [`SessionEvent`]s handed out once when the session is opened, and both
//! fail their public operations with [`SessionError`].

use std::net::SocketAddr;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::adhoc::{AdHocError, CoordinatorDescriptor};
use crate::domain::device::{Device, DeviceId};
use crate::net::ListenerError;

/// Capacity of a session's event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something the application should know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A device joined the group (or re-joined with a new record).
    MemberJoined(Device),
    /// A device left the group.
    MemberLeft(Device),
    /// A member replaced its mirror with the coordinator's snapshot.
    RegistrySynced { devices: Vec<Device> },
    /// Application bytes arrived.
    DataReceived { from: Device, payload: Vec<u8> },
    /// The member's link to the coordinator dropped; the session is idle.
    CoordinatorLost,
    /// The member announced itself to the coordinator.
    Connected { coordinator: Device },
    /// The coordinator's group is up.
    GroupReady { endpoint: SocketAddr },
    /// An asynchronous step failed; the session is back to idle.
    Error { message: String },
}

/// Result of one discovery run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A coordinator seen for the first time in this run.
    Found(CoordinatorDescriptor),
    /// The run is over; every coordinator found, in discovery order.
    Finished(Vec<CoordinatorDescriptor>),
}

/// Where a `send_data` call should deliver its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Device(DeviceId),
    Broadcast,
}

/// Errors surfaced by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("ad hoc transport unavailable: {0}")]
    TransportUnavailable(#[from] AdHocError),

    #[error(transparent)]
    Bind(#[from] ListenerError),

    #[error("session is already registered as coordinator")]
    AlreadyRegistered,

    #[error("session is already connected or connecting")]
    AlreadyConnected,

    #[error("session is not active")]
    NotActive,

    #[error("no endpoint known for coordinator {0}")]
    NoCoordinatorEndpoint(DeviceId),
}

/// Sending half of a session's event stream.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<SessionEvent>,
}

impl EventSender {
    /// Creates the channel a session publishes on.
    pub fn channel() -> (Self, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    pub async fn emit(&self, event: SessionEvent) {
        if self.tx.send(event).await.is_err() {
            debug!("session event dropped: receiver closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_delivers_in_order() {
        let (events, mut rx) = EventSender::channel();
        events.emit(SessionEvent::CoordinatorLost).await;
        events
            .emit(SessionEvent::MemberJoined(Device::new("a", "A")))
            .await;

        assert_eq!(rx.recv().await, Some(SessionEvent::CoordinatorLost));
        assert_eq!(
            rx.recv().await,
            Some(SessionEvent::MemberJoined(Device::new("a", "A")))
        );
    }

    #[tokio::test]
    async fn test_emit_after_receiver_dropped_does_not_panic() {
        let (events, rx) = EventSender::channel();
        drop(rx);
        events.emit(SessionEvent::CoordinatorLost).await;
    }

    #[test]
    fn test_adhoc_error_converts_to_transport_unavailable() {
        let err: SessionError = AdHocError::Busy.into();
        assert!(matches!(err, SessionError::TransportUnavailable(AdHocError::Busy)));
    }
}
