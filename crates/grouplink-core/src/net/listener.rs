//! Inbound side of the one-shot envelope transport.
//!
//! A [`Listener`] binds a TCP port and runs an accept loop on its own task.
//! Each accepted connection is handled on a separate task: the stream is read
//! to EOF (up to a byte cap), decoded as exactly one envelope, and handed to
//! the role's [`EnvelopeDispatcher`] together with the observed source
//! address.
//!
//! # Readiness (for beginners)
//!
//! A member must not announce its endpoint before the listener can actually
//! accept connections, otherwise the coordinator's first reply could hit a
//! closed port.  [`Listener::bind`] therefore only returns once the socket is
//! bound *and* the accept task has signalled that it is running, using a
//! `tokio::sync::oneshot` channel as a one-time "I'm ready" flag.
//!
//! # Failure handling
//!
//! Nothing that happens on an individual connection can stop the accept
//! loop: read errors, oversized streams, and malformed envelopes are logged
//! and the connection is dropped.  The loop ends only when the
//! [`ListenerHandle`] is shut down or dropped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::protocol::codec::decode_envelope;
use crate::protocol::envelope::Envelope;

/// Default cap on the number of bytes read from one connection (1 MiB).
pub const DEFAULT_MAX_ENVELOPE_BYTES: usize = 1024 * 1024;

/// Pause after a failed `accept()` so a persistent error (e.g. file
/// descriptor exhaustion) does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Errors raised while starting a listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("bind failed on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// One decoded envelope and the address its connection came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEnvelope {
    pub envelope: Envelope,
    pub source: SocketAddr,
}

/// Receives every envelope decoded by a [`Listener`].
///
/// Each role implements this trait; the listener calls it from the task
/// that handled the connection, so implementations may be invoked
/// concurrently.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EnvelopeDispatcher: Send + Sync {
    async fn dispatch(&self, inbound: InboundEnvelope);
}

/// Dispatcher that forwards every inbound envelope on an `mpsc` channel.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::Sender<InboundEnvelope>,
}

impl ChannelDispatcher {
    /// Creates a dispatcher and the receiver its envelopes arrive on.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<InboundEnvelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EnvelopeDispatcher for ChannelDispatcher {
    async fn dispatch(&self, inbound: InboundEnvelope) {
        if self.tx.send(inbound).await.is_err() {
            debug!("inbound envelope dropped: receiver closed");
        }
    }
}

/// Entry point for starting the accept loop.
pub struct Listener;

impl Listener {
    /// Binds `addr` and starts the accept loop.
    ///
    /// Resolves once the socket is bound and the accept task is running.
    /// Use port 0 to let the OS pick a free port and read it back with
    /// [`ListenerHandle::local_addr`].
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::Bind`] if the address cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        max_envelope_bytes: usize,
        dispatcher: Arc<dyn EnvelopeDispatcher>,
    ) -> Result<ListenerHandle, ListenerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ListenerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ListenerError::Bind { addr, source })?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(
            listener,
            max_envelope_bytes,
            dispatcher,
            ready_tx,
            shutdown_rx,
        ));

        // The accept task signals before its first accept(); an Err here means
        // it already exited, which only happens on shutdown.
        let _ = ready_rx.await;
        info!("listening for envelopes on {local_addr}");

        Ok(ListenerHandle {
            local_addr,
            shutdown_tx,
            task,
        })
    }
}

/// Handle to a running accept loop.
///
/// Dropping the handle stops the loop as well; [`ListenerHandle::shutdown`]
/// additionally waits until the port has been released.
#[derive(Debug)]
pub struct ListenerHandle {
    local_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// The address actually bound, including an OS-assigned port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops the accept loop and waits for it to exit.
    ///
    /// Connections that were already accepted finish on their own tasks.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            error!("listener task on {} failed: {e}", self.local_addr);
        }
        info!("listener on {} stopped", self.local_addr);
    }
}

async fn accept_loop(
    listener: TcpListener,
    max_envelope_bytes: usize,
    dispatcher: Arc<dyn EnvelopeDispatcher>,
    ready_tx: oneshot::Sender<()>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let _ = ready_tx.send(());

    loop {
        tokio::select! {
            // Resolves on an explicit shutdown and when the handle is dropped.
            _ = &mut shutdown_rx => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, source)) => {
                    let dispatcher = Arc::clone(&dispatcher);
                    tokio::spawn(handle_connection(stream, source, max_envelope_bytes, dispatcher));
                }
                Err(e) => {
                    error!("accept failed: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    source: SocketAddr,
    max_envelope_bytes: usize,
    dispatcher: Arc<dyn EnvelopeDispatcher>,
) {
    let mut buf = Vec::new();
    // Read one byte past the cap so an oversized stream is detectable.
    let mut limited = stream.take(max_envelope_bytes as u64 + 1);
    if let Err(e) = limited.read_to_end(&mut buf).await {
        warn!(%source, "dropping connection after read error: {e}");
        return;
    }
    if buf.len() > max_envelope_bytes {
        warn!(%source, "dropping envelope larger than {max_envelope_bytes} bytes");
        return;
    }

    match decode_envelope(&buf) {
        Ok(envelope) => {
            debug!(
                %source,
                kind = ?envelope.kind,
                sender = %envelope.sender_id,
                "envelope received"
            );
            dispatcher.dispatch(InboundEnvelope { envelope, source }).await;
        }
        Err(e) => warn!(%source, "dropping malformed envelope: {e}"),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
