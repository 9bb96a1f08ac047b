//! MemberSession: the member role wired to real sockets.
//!
//! ```text
//!          connect            GroupFormed + Join sent
//!   Idle ──────────► Joining ───────────────────────► Active
//!    ▲                  │                               │  │
//!    │  handshake error │          link lost            │  │ disconnect
//!    ├──────────────────┘◄──────────────────────────────┘  ▼
//!    └─────────────────────────── Leave sent ─────────── Leaving
//! ```
//!
//! # Locking
//!
//! Lifecycle transitions (connect, handshake, link loss, disconnect) are
//! serialised by the `runtime` mutex.  The mirror has its own mutex, always
//! taken last and never held across an `emit`, so a slow event consumer
//! cannot stall `registry()`, `send_data()` or `disconnect()`.
//!
//! `emit_order` pairs each mirror change with its event.  The handshake
//! holds it from sending `Join` until `Connected` is out, so the
//! coordinator's `SyncSet` reply is applied, and reported, only after
//! `Connected`.  Order: `runtime`, then `emit_order`, then `mirror`.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use grouplink_core::adhoc::{AdHocEvent, AdHocTransport, CoordinatorDescriptor};
use grouplink_core::config::GroupLinkConfig;
use grouplink_core::net::{
    EnvelopeDispatcher, EnvelopeSink, InboundEnvelope, Listener, ListenerHandle, Outbox,
};
use grouplink_core::session::{DiscoveryEvent, EventSender};
use grouplink_core::{Device, Envelope, EnvelopeKind, SessionError, SessionEvent, Target};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::application::mirror_registry::{MirrorChange, MirrorRegistry};

const DISCOVERY_CHANNEL_CAPACITY: usize = 16;

/// Lifecycle state of a [`MemberSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    Idle,
    /// Waiting for the ad hoc group to form.
    Joining,
    Active,
    /// Sending the farewell `Leave`.
    Leaving,
}

/// The member role.  Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct MemberSession {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn AdHocTransport>,
    config: GroupLinkConfig,
    local: Device,
    sink: Arc<dyn EnvelopeSink>,
    mirror: Mutex<MirrorRegistry>,
    emit_order: Mutex<()>,
    runtime: Mutex<Runtime>,
    state_tx: watch::Sender<MemberState>,
    events: EventSender,
}

#[derive(Default)]
struct Runtime {
    listener: Option<ListenerHandle>,
    adhoc_task: Option<JoinHandle<()>>,
    /// This member as announced in its Join.
    announced: Option<Device>,
}

impl MemberSession {
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

    /// Like [`MemberSession::open`] but with a caller-supplied sink.
    pub fn with_sink(
        transport: Arc<dyn AdHocTransport>,
        config: GroupLinkConfig,
        sink: Arc<dyn EnvelopeSink>,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (events, rx) = EventSender::channel();
        let (state_tx, _) = watch::channel(MemberState::Idle);
        let local = transport.local_device();
        let inner = Arc::new(Inner {
            mirror: Mutex::new(MirrorRegistry::new(local.clone())),
            emit_order: Mutex::new(()),
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

    pub fn state(&self) -> MemberState {
        self.inner.state()
    }

    /// Watches state transitions.
    pub fn state_changes(&self) -> watch::Receiver<MemberState> {
        self.inner.state_tx.subscribe()
    }

    /// Snapshot of the mirrored peers, sorted by id.
    pub async fn registry(&self) -> Vec<Device> {
        self.inner.mirror.lock().await.snapshot()
    }

    /// The coordinator this session is connected to.
    pub async fn coordinator(&self) -> Option<Device> {
        self.inner.mirror.lock().await.coordinator().cloned()
    }

    /// Looks for advertised coordinators for `timeout`.
    ///
    /// The stream yields [`DiscoveryEvent::Found`] once per coordinator id,
    /// then a single [`DiscoveryEvent::Finished`] with everything found, and
    /// closes.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::TransportUnavailable`] if discovery cannot
    /// start.
    pub async fn discover_coordinators(
        &self,
        timeout: Duration,
    ) -> Result<mpsc::Receiver<DiscoveryEvent>, SessionError> {
        let mut found_rx = self.inner.transport.discover(timeout).await?;
        let (tx, rx) = mpsc::channel(DISCOVERY_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);
            let mut seen = HashSet::new();
            let mut found = Vec::new();

            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    next = found_rx.recv() => match next {
                        Some(descriptor) => {
                            if !seen.insert(descriptor.device_id.clone()) {
                                continue;
                            }
                            debug!(
                                id = %descriptor.device_id,
                                group = %descriptor.group_name,
                                "coordinator found"
                            );
                            found.push(descriptor.clone());
                            if tx.send(DiscoveryEvent::Found(descriptor)).await.is_err() {
                                return;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = tx.send(DiscoveryEvent::Finished(found)).await;
        });
        Ok(rx)
    }

    /// Joins the group advertised by `descriptor`.
    ///
    /// Returns once the ad hoc transport accepted the request.  The rest of
    /// the handshake runs when the group forms and ends with
    /// [`SessionEvent::Connected`], or [`SessionEvent::Error`] and a return to
    /// idle.
    ///
    /// # Errors
    ///
    /// - [`SessionError::AlreadyConnected`] unless the session is idle.
    /// - [`SessionError::TransportUnavailable`] if the transport refuses.
    pub async fn connect(&self, descriptor: CoordinatorDescriptor) -> Result<(), SessionError> {
        let mut runtime = self.inner.runtime.lock().await;
        if self.state() != MemberState::Idle {
            return Err(SessionError::AlreadyConnected);
        }

        // Subscribe before joining so GroupFormed cannot be missed.
        let adhoc_rx = self.inner.transport.events();
        self.inner.state_tx.send_replace(MemberState::Joining);
        let task = tokio::spawn(watch_adhoc_events(
            Arc::downgrade(&self.inner),
            adhoc_rx,
            descriptor.clone(),
        ));

        if let Err(e) = self.inner.transport.join_group(&descriptor).await {
            task.abort();
            self.inner.state_tx.send_replace(MemberState::Idle);
            return Err(SessionError::TransportUnavailable(e));
        }
        runtime.adhoc_task = Some(task);
        info!(coordinator = %descriptor.device_id, group = %descriptor.group_name, "joining group");
        Ok(())
    }

    /// Sends application bytes.
    ///
    /// [`Target::Broadcast`] reaches the coordinator and every mirrored peer.
    /// An unknown target id is logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotActive`] unless the session is active.
    pub async fn send_data(&self, target: Target, payload: Vec<u8>) -> Result<(), SessionError> {
        if self.state() != MemberState::Active {
            return Err(SessionError::NotActive);
        }
        let recipients = {
            let mirror = self.inner.mirror.lock().await;
            mirror.recipients(&target)
        };
        let Some(recipients) = recipients else {
            debug!(?target, "send_data to unknown peer ignored");
            return Ok(());
        };

        let envelope = Envelope::data(&self.inner.local, payload);
        for recipient in recipients {
            if let Err(e) = self.inner.sink.enqueue(recipient.endpoint, envelope.clone()).await {
                warn!(to = %recipient.to, "data dropped: {e}");
            }
        }
        Ok(())
    }

    /// Leaves the group.
    ///
    /// When active, a `Leave` naming this member is sent to the coordinator
    /// first; a failed send is logged and teardown continues.  Calling it
    /// again is a no-op.
    pub async fn disconnect(&self) {
        let mut runtime = self.inner.runtime.lock().await;
        match self.state() {
            MemberState::Idle => return,
            MemberState::Active => {
                self.inner.state_tx.send_replace(MemberState::Leaving);
                self.inner.send_leave(&runtime).await;
            }
            MemberState::Joining | MemberState::Leaving => {}
        }

        if let Some(task) = runtime.adhoc_task.take() {
            task.abort();
        }
        self.inner.teardown(&mut runtime).await;
        self.inner.transport.leave_group().await;
        info!("member disconnected");
    }
}

impl Inner {
    fn state(&self) -> MemberState {
        *self.state_tx.borrow()
    }

    async fn send_leave(&self, runtime: &Runtime) {
        let coordinator = self.mirror.lock().await.coordinator().cloned();
        let (Some(me), Some(endpoint)) = (
            runtime.announced.as_ref(),
            coordinator.as_ref().and_then(Device::reachable_endpoint),
        ) else {
            return;
        };
        let result = match Envelope::leave(me, me) {
            Ok(leave) => self.sink.deliver_now(endpoint, leave).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(%endpoint, "Leave not delivered: {e}");
        }
    }

    /// Releases the listener and forgets the group.  Ends in `Idle`.
    async fn teardown(&self, runtime: &mut Runtime) {
        if let Some(listener) = runtime.listener.take() {
            listener.shutdown().await;
        }
        runtime.announced = None;
        self.mirror.lock().await.clear();
        self.sink.forget_all().await;
        self.state_tx.send_replace(MemberState::Idle);
    }

    /// Runs once the ad hoc group is up: start the listener, then announce
    /// this member to the coordinator.
    ///
    /// Returns `false` when the watcher that called it should stop.
    async fn handshake(
        self: &Arc<Self>,
        descriptor: &CoordinatorDescriptor,
        event_endpoint: Option<SocketAddr>,
    ) -> bool {
        let mut runtime = self.runtime.lock().await;
        if self.state() != MemberState::Joining {
            return true;
        }

        let order = self.emit_order.lock().await;
        match self.announce(&mut runtime, descriptor, event_endpoint).await {
            Ok(coordinator) => {
                drop(runtime);
                info!(%coordinator, "connected to coordinator");
                self.events.emit(SessionEvent::Connected { coordinator }).await;
                drop(order);
                true
            }
            Err(message) => {
                warn!("handshake failed: {message}");
                runtime.adhoc_task = None;
                self.teardown(&mut runtime).await;
                self.transport.leave_group().await;
                drop(order);
                drop(runtime);
                self.events.emit(SessionEvent::Error { message }).await;
                false
            }
        }
    }

    async fn announce(
        self: &Arc<Self>,
        runtime: &mut Runtime,
        descriptor: &CoordinatorDescriptor,
        event_endpoint: Option<SocketAddr>,
    ) -> Result<Device, String> {
        let endpoint = event_endpoint.or(descriptor.endpoint).ok_or_else(|| {
            SessionError::NoCoordinatorEndpoint(descriptor.device_id.clone()).to_string()
        })?;

        let dispatcher = Arc::new(MemberDispatcher {
            inner: Arc::downgrade(self),
        });
        let listener = Listener::bind(
            self.config.network.member_bind_addr(),
            self.config.network.max_envelope_bytes,
            dispatcher,
        )
        .await
        .map_err(|e| e.to_string())?;

        // The coordinator substitutes the host it sees; only the port matters.
        let port = listener.local_addr().port();
        let me = self
            .local
            .clone()
            .with_endpoint(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port));
        runtime.listener = Some(listener);
        runtime.announced = Some(me.clone());

        let coordinator = Device::new(descriptor.device_id.clone(), descriptor.display_name.clone())
            .with_endpoint(endpoint);
        let join = Envelope::join(&me, &me).map_err(|e| e.to_string())?;

        self.mirror.lock().await.set_coordinator(coordinator.clone());
        // Active before Join leaves, so the SyncSet reply is not dropped.
        self.state_tx.send_replace(MemberState::Active);
        self.sink
            .deliver_now(endpoint, join)
            .await
            .map_err(|e| e.to_string())?;
        Ok(coordinator)
    }

    async fn on_link_lost(&self) -> bool {
        let mut runtime = self.runtime.lock().await;
        match self.state() {
            MemberState::Active => {
                warn!("link to coordinator lost");
                runtime.adhoc_task = None;
                self.teardown(&mut runtime).await;
                drop(runtime);
                self.events.emit(SessionEvent::CoordinatorLost).await;
                true
            }
            MemberState::Joining => {
                warn!("link lost before the group formed");
                runtime.adhoc_task = None;
                self.teardown(&mut runtime).await;
                drop(runtime);
                self.events
                    .emit(SessionEvent::Error {
                        message: "ad hoc link lost while joining".to_string(),
                    })
                    .await;
                true
            }
            // A disconnect is already tearing the session down.
            MemberState::Leaving | MemberState::Idle => false,
        }
    }
}

/// Routes inbound envelopes into the mirror.
struct MemberDispatcher {
    inner: Weak<Inner>,
}

#[async_trait]
impl EnvelopeDispatcher for MemberDispatcher {
    async fn dispatch(&self, inbound: InboundEnvelope) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if inner.state() != MemberState::Active {
            debug!(source = %inbound.source, "envelope dropped: member is not active");
            return;
        }

        let InboundEnvelope { envelope, source } = inbound;
        if envelope.kind == EnvelopeKind::Data {
            let from = envelope.sender();
            inner
                .events
                .emit(SessionEvent::DataReceived {
                    from,
                    payload: envelope.payload,
                })
                .await;
            return;
        }

        // Events follow the order of mirror changes; the mirror itself is
        // released before emitting.
        let _order = inner.emit_order.lock().await;
        if inner.state() != MemberState::Active {
            return;
        }
        let change = inner.mirror.lock().await.apply(&envelope);
        let event = match change {
            Ok(MirrorChange::Joined(device)) => SessionEvent::MemberJoined(device),
            Ok(MirrorChange::Left(device)) => SessionEvent::MemberLeft(device),
            Ok(MirrorChange::Synced(devices)) => SessionEvent::RegistrySynced { devices },
            Ok(MirrorChange::Ignored) => return,
            Err(e) => {
                warn!(%source, kind = ?envelope.kind, "dropping malformed envelope: {e}");
                return;
            }
        };
        inner.events.emit(event).await;
    }
}

async fn watch_adhoc_events(
    inner: Weak<Inner>,
    mut rx: broadcast::Receiver<AdHocEvent>,
    descriptor: CoordinatorDescriptor,
) {
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
                is_coordinator: false,
                coordinator_endpoint,
            } => {
                if !inner.handshake(&descriptor, coordinator_endpoint).await {
                    break;
                }
            }
            AdHocEvent::GroupFormed { .. } => {
                debug!("ignoring GroupFormed for a coordinator role");
            }
            AdHocEvent::PeerLinkLost => {
                if inner.on_link_lost().await {
                    break;
                }
            }
            AdHocEvent::PeerDisconnected(id) => {
                debug!(%id, "peer disconnect ignored by member");
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
