//! CoordinatorSession: the coordinator role wired to real sockets.
//!
//! ```text
//!            register_as_coordinator            GroupFormed
//!   Idle ───────────────────────────► Listening ───────────► Active
//!    ▲                                    │                    │
//!    └────────────── disconnect ──────────┴────────────────────┘
//! ```
//!
//! The session owns three moving parts:
//!
//! - a [`Listener`] bound on the well-known port whose dispatcher feeds
//!   inbound envelopes into the [`MembershipRelay`],
//! - an [`EnvelopeSink`] (normally an [`Outbox`]) that carries the planned
//!   deliveries,
//! - a task watching [`AdHocEvent`]s from the ad hoc transport.
//!
//! # Locking
//!
//! The relay sits behind one `tokio::sync::Mutex`.  A plan is computed *and
//! enqueued* while that lock is held, so the per-peer FIFO order of the
//! outbox matches the order in which the registry changed: a member always
//! hears `Join(X)` before a later `Leave(X)`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use grouplink_core::adhoc::{service_record, AdHocEvent, AdHocTransport};
use grouplink_core::config::GroupLinkConfig;
use grouplink_core::net::{
    EnvelopeDispatcher, EnvelopeSink, InboundEnvelope, Listener, ListenerHandle, Outbox,
};
use grouplink_core::session::EventSender;
use grouplink_core::{Device, DeviceId, EnvelopeKind, SessionError, SessionEvent, Target};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::application::relay_membership::{Delivery, MembershipRelay};

/// Lifecycle state of a [`CoordinatorSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    /// The listener is bound; the ad hoc group is not confirmed yet.
    Listening,
    /// The ad hoc transport reported the group as formed.
    Active,
}

/// The coordinator role.  Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct CoordinatorSession {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn AdHocTransport>,
    config: GroupLinkConfig,
    local: Device,
    sink: Arc<dyn EnvelopeSink>,
    relay: Mutex<MembershipRelay>,
    runtime: Mutex<Runtime>,
    state_tx: watch::Sender<CoordinatorState>,
    events: EventSender,
}

#[derive(Default)]
struct Runtime {
    listener: Option<ListenerHandle>,
    adhoc_task: Option<JoinHandle<()>>,
}

impl CoordinatorSession {
    /// Creates an idle session and returns it with its event stream.
    pub fn open(
        transport: Arc<dyn AdHocTransport>,
        config: GroupLinkConfig,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let outbox = Outbox::new(
            config.network.outbound_queue_capacity,
            config.network.connect_timeout(),
        );
        Self::with_sink(transport, config, Arc::new(outbox))
    }

    /// Like [`CoordinatorSession::open`] but with a caller-supplied sink.
    pub fn with_sink(
        transport: Arc<dyn AdHocTransport>,
        config: GroupLinkConfig,
        sink: Arc<dyn EnvelopeSink>,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (events, rx) = EventSender::channel();
        let (state_tx, _) = watch::channel(CoordinatorState::Idle);
        let local = transport.local_device();
        let inner = Arc::new(Inner {
            relay: Mutex::new(MembershipRelay::new(local.clone())),
            transport,
            config,
            local,
            sink,
            runtime: Mutex::new(Runtime::default()),
            state_tx,
            events,
        });
        (Self { inner }, rx)
    }

    pub fn local_device(&self) -> &Device {
        &self.inner.local
    }

    pub fn state(&self) -> CoordinatorState {
        *self.inner.state_tx.borrow()
    }

    /// Watches state transitions.
    pub fn state_changes(&self) -> watch::Receiver<CoordinatorState> {
        self.inner.state_tx.subscribe()
    }

    /// Snapshot of the registered members, sorted by id.
    pub async fn registry(&self) -> Vec<Device> {
        self.inner.relay.lock().await.registry().snapshot()
    }

    /// Binds the well-known port, advertises `group_name`, and starts
    /// accepting members.
    ///
    /// Returns the address the listener is bound to.  The advertised
    /// service record carries that port plus `custom_properties`.
    ///
    /// # Errors
    ///
    /// - [`SessionError::AlreadyRegistered`] if the session is not idle.
    /// - [`SessionError::Bind`] if the port cannot be bound.
    /// - [`SessionError::TransportUnavailable`] if the ad hoc transport
    ///   refuses to advertise; the port is released again.
    pub async fn register_as_coordinator(
        &self,
        group_name: &str,
        custom_properties: BTreeMap<String, String>,
    ) -> Result<SocketAddr, SessionError> {
        let mut runtime = self.inner.runtime.lock().await;
        if self.state() != CoordinatorState::Idle {
            return Err(SessionError::AlreadyRegistered);
        }

        // Subscribe before advertising so GroupFormed cannot be missed.
        let adhoc_rx = self.inner.transport.events();

        let dispatcher = Arc::new(CoordinatorDispatcher {
            inner: Arc::downgrade(&self.inner),
        });
        let listener = Listener::bind(
            self.inner.config.network.coordinator_bind_addr(),
            self.inner.config.network.max_envelope_bytes,
            dispatcher,
        )
        .await?;
        let bound = listener.local_addr();
        if bound.port() != self.inner.config.network.coordinator_port
            && self.inner.config.network.coordinator_port != 0
        {
            warn!(%bound, "listener bound to an unexpected port");
        }

        let record = service_record(group_name, bound.port(), &custom_properties);
        if let Err(e) = self.inner.transport.advertise_group(record).await {
            listener.shutdown().await;
            return Err(SessionError::TransportUnavailable(e));
        }

        runtime.listener = Some(listener);
        // Listening must be visible before the watcher can see GroupFormed.
        self.inner.state_tx.send_replace(CoordinatorState::Listening);
        runtime.adhoc_task = Some(tokio::spawn(watch_adhoc_events(
            Arc::downgrade(&self.inner),
            adhoc_rx,
        )));
        info!(group = group_name, %bound, "registered as coordinator");
        Ok(bound)
    }

    /// Sends application bytes to one member or to every member.
    ///
    /// An unknown target id is logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotActive`] while the session is idle.
    pub async fn send_data(&self, target: Target, payload: Vec<u8>) -> Result<(), SessionError> {
        if self.state() == CoordinatorState::Idle {
            return Err(SessionError::NotActive);
        }
        let relay = self.inner.relay.lock().await;
        let plan = relay.plan_data(&target, payload);
        if let Some(id) = plan.unknown_target {
            debug!(%id, "send_data to unknown peer ignored");
        }
        self.inner.apply(plan.deliveries).await;
        Ok(())
    }

    /// Stops accepting envelopes, leaves the ad hoc group, and clears the
    /// registry.  Members are not notified.  Calling it again is a no-op.
    pub async fn disconnect(&self) {
        let mut runtime = self.inner.runtime.lock().await;
        if self.state() == CoordinatorState::Idle {
            return;
        }
        // Flip the state first so in-flight connections are dropped.
        self.inner.state_tx.send_replace(CoordinatorState::Idle);

        if let Some(task) = runtime.adhoc_task.take() {
            task.abort();
        }
        if let Some(listener) = runtime.listener.take() {
            listener.shutdown().await;
        }
        self.inner.transport.leave_group().await;
        self.inner.relay.lock().await.clear();
        self.inner.sink.forget_all().await;
        info!("coordinator disconnected");
    }
}

impl Inner {
    fn is_accepting(&self) -> bool {
        *self.state_tx.borrow() != CoordinatorState::Idle
    }

    async fn apply(&self, deliveries: Vec<Delivery>) {
        for delivery in deliveries {
            let kind = delivery.envelope.kind;
            if let Err(e) = self.sink.enqueue(delivery.endpoint, delivery.envelope).await {
                warn!(to = %delivery.to, ?kind, "relay dropped: {e}");
            }
        }
    }

    async fn on_join(&self, subject: Device, source: SocketAddr) {
        let mut relay = self.relay.lock().await;
        // disconnect may have cleared the relay while this call waited.
        if !self.is_accepting() {
            debug!(%source, "Join dropped: coordinator is idle");
            return;
        }
        let plan = match relay.accept_join(subject, source) {
            Ok(Some(plan)) => plan,
            Ok(None) => return,
            Err(e) => {
                warn!(%source, "Join could not be relayed: {e}");
                return;
            }
        };
        for id in &plan.unreachable {
            debug!(%id, "member has no usable endpoint; skipped");
        }
        self.apply(plan.deliveries).await;
        drop(relay);

        info!(device = %plan.device, "member joined");
        self.events.emit(SessionEvent::MemberJoined(plan.device)).await;
    }

    async fn on_leave(&self, id: &DeviceId) {
        let mut relay = self.relay.lock().await;
        if !self.is_accepting() {
            debug!(%id, "Leave dropped: coordinator is idle");
            return;
        }
        let plan = match relay.accept_leave(id) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(%id, "Leave could not be relayed: {e}");
                return;
            }
        };
        self.apply(plan.deliveries).await;
        if let Some(endpoint) = plan.removed.as_ref().and_then(Device::reachable_endpoint) {
            self.sink.forget(endpoint).await;
        }
        drop(relay);

        if let Some(removed) = plan.removed {
            info!(device = %removed, "member left");
            self.events.emit(SessionEvent::MemberLeft(removed)).await;
        }
    }
}

/// Routes inbound envelopes into the coordinator.
///
/// Holds a weak reference so a dropped session does not stay alive through
/// its own listener.
struct CoordinatorDispatcher {
    inner: Weak<Inner>,
}

#[async_trait]
impl EnvelopeDispatcher for CoordinatorDispatcher {
    async fn dispatch(&self, inbound: InboundEnvelope) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if !inner.is_accepting() {
            debug!(source = %inbound.source, "envelope dropped: coordinator is idle");
            return;
        }

        let InboundEnvelope { envelope, source } = inbound;
        match envelope.kind {
            EnvelopeKind::Join => match envelope.device() {
                Ok(subject) => inner.on_join(subject, source).await,
                Err(e) => warn!(%source, "dropping malformed Join: {e}"),
            },
            EnvelopeKind::Leave => match envelope.device() {
                Ok(subject) => inner.on_leave(&subject.id).await,
                Err(e) => warn!(%source, "dropping malformed Leave: {e}"),
            },
            EnvelopeKind::SyncSet => {
                debug!(%source, sender = %envelope.sender_id, "unexpected SyncSet ignored");
            }
            EnvelopeKind::Data => {
                let from = envelope.sender();
                inner
                    .events
                    .emit(SessionEvent::DataReceived {
                        from,
                        payload: envelope.payload,
                    })
                    .await;
            }
        }
    }
}

async fn watch_adhoc_events(inner: Weak<Inner>, mut rx: broadcast::Receiver<AdHocEvent>) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "ad hoc events lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };

        match event {
            AdHocEvent::GroupFormed {
                is_coordinator: true,
                ..
            } => {
                let promoted = inner.state_tx.send_if_modified(|state| {
                    if *state == CoordinatorState::Listening {
                        *state = CoordinatorState::Active;
                        true
                    } else {
                        false
                    }
                });
                if promoted {
                    let runtime = inner.runtime.lock().await;
                    let endpoint = runtime.listener.as_ref().map(ListenerHandle::local_addr);
                    if let Some(endpoint) = endpoint {
                        drop(runtime);
                        info!(%endpoint, "group formed; coordinator active");
                        inner.events.emit(SessionEvent::GroupReady { endpoint }).await;
                    }
                }
            }
            AdHocEvent::GroupFormed { .. } => {
                debug!("ignoring GroupFormed for a member role");
            }
            AdHocEvent::PeerDisconnected(id) => {
                debug!(%id, "ad hoc link to member dropped");
                inner.on_leave(&id).await;
            }
            AdHocEvent::PeerLinkLost => {
                warn!("ad hoc group link lost");
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
