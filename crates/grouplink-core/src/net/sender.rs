//! Outbound side of the one-shot envelope transport.
//!
//! [`deliver`] opens one connection, writes one encoded envelope, and closes.
//! There is no acknowledgement and no retry: delivery is at-most-once.
//!
//! [`Outbox`] sits in front of [`deliver`] and gives every peer endpoint its
//! own bounded FIFO queue drained by a single worker task:
//!
//! ```text
//! enqueue(peer A, e1) ─┐
//! enqueue(peer A, e2) ─┼─► [queue A: e1 e2 ...] ─► worker A ─► deliver(A, ·)
//! enqueue(peer B, e3) ─┼─► [queue B: e3 ...]    ─► worker B ─► deliver(B, ·)
//! ```
//!
//! When a queue is full the *new* envelope is rejected with
//! [`SendError::QueueFull`]; callers log it and move on.  A slow or dead peer
//! therefore costs at most `capacity` queued envelopes and one worker.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::protocol::codec::{encode_envelope, ProtocolError};
use crate::protocol::envelope::Envelope;

/// Default bound on establishing an outbound connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Default number of envelopes that may wait for one peer.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Errors from a single delivery attempt or from enqueueing one.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("connecting to {endpoint} timed out after {timeout:?}")]
    ConnectTimeout {
        endpoint: SocketAddr,
        timeout: Duration,
    },

    #[error("connecting to {endpoint} failed: {source}")]
    Connect {
        endpoint: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("writing to {endpoint} failed: {source}")]
    Io {
        endpoint: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("envelope could not be encoded: {0}")]
    Encode(#[from] ProtocolError),

    #[error("outbound queue for {endpoint} is full ({capacity} envelopes waiting)")]
    QueueFull { endpoint: SocketAddr, capacity: usize },

    #[error("outbound queue for {endpoint} is closed")]
    Closed { endpoint: SocketAddr },
}

/// Delivers one envelope to `endpoint` over a fresh connection.
///
/// # Errors
///
/// Returns [`SendError::ConnectTimeout`] if the connection is not established
/// within `connect_timeout`, [`SendError::Connect`] if it is refused,
/// [`SendError::Io`] if writing fails, and [`SendError::Encode`] if the
/// envelope cannot be encoded.
pub async fn deliver(
    endpoint: SocketAddr,
    envelope: &Envelope,
    connect_timeout: Duration,
) -> Result<(), SendError> {
    let bytes = encode_envelope(envelope)?;

    let connecting = tokio::time::timeout(connect_timeout, TcpStream::connect(endpoint));
    let mut stream = match connecting.await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => return Err(SendError::Connect { endpoint, source }),
        Err(_) => {
            return Err(SendError::ConnectTimeout {
                endpoint,
                timeout: connect_timeout,
            })
        }
    };

    stream
        .write_all(&bytes)
        .await
        .map_err(|source| SendError::Io { endpoint, source })?;
    // Half-close so the listener's read-to-EOF completes.
    stream
        .shutdown()
        .await
        .map_err(|source| SendError::Io { endpoint, source })?;

    debug!(%endpoint, kind = ?envelope.kind, bytes = bytes.len(), "envelope delivered");
    Ok(())
}

/// Outbound seam used by role logic.
///
/// The production implementation is [`Outbox`]; tests use
/// [`RecordingSink`](crate::net::mock::RecordingSink) to observe exactly which
/// envelopes a role decided to send and to whom.
#[async_trait]
pub trait EnvelopeSink: Send + Sync {
    /// Queues `envelope` for asynchronous delivery to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::QueueFull`] when the peer's queue is at capacity.
    async fn enqueue(&self, endpoint: SocketAddr, envelope: Envelope) -> Result<(), SendError>;

    /// Delivers `envelope` immediately and waits for the outcome.
    ///
    /// # Errors
    ///
    /// Returns whatever [`deliver`] returns.
    async fn deliver_now(&self, endpoint: SocketAddr, envelope: Envelope) -> Result<(), SendError>;

    /// Drops the queue for `endpoint` once it has drained.
    async fn forget(&self, endpoint: SocketAddr);

    /// Drops every queue once each has drained.
    async fn forget_all(&self);
}

/// Bounded per-peer outbound queues backed by one worker task per peer.
///
/// Cheap to clone; clones share the same queues.
#[derive(Clone)]
pub struct Outbox {
    inner: Arc<OutboxInner>,
}

struct OutboxInner {
    capacity: usize,
    connect_timeout: Duration,
    queues: Mutex<HashMap<SocketAddr, mpsc::Sender<Envelope>>>,
}

impl Outbox {
    /// Creates an outbox with `capacity` slots per peer.
    ///
    /// A capacity of 0 is raised to 1.
    pub fn new(capacity: usize, connect_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(OutboxInner {
                capacity: capacity.max(1),
                connect_timeout,
                queues: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of peers that currently have a queue.
    pub async fn peer_count(&self) -> usize {
        self.inner.queues.lock().await.len()
    }

    fn spawn_worker(&self, endpoint: SocketAddr) -> mpsc::Sender<Envelope> {
        let (tx, mut rx) = mpsc::channel::<Envelope>(self.inner.capacity);
        let connect_timeout = self.inner.connect_timeout;
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if let Err(e) = deliver(endpoint, &envelope, connect_timeout).await {
                    warn!(%endpoint, kind = ?envelope.kind, "envelope dropped: {e}");
                }
            }
            debug!(%endpoint, "outbound worker finished");
        });
        tx
    }
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY, DEFAULT_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl EnvelopeSink for Outbox {
    async fn enqueue(&self, endpoint: SocketAddr, envelope: Envelope) -> Result<(), SendError> {
        let mut queues = self.inner.queues.lock().await;
        let tx = match queues.get(&endpoint) {
            Some(tx) if !tx.is_closed() => tx.clone(),
            _ => {
                let tx = self.spawn_worker(endpoint);
                queues.insert(endpoint, tx.clone());
                tx
            }
        };
        drop(queues);

        tx.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::QueueFull {
                endpoint,
                capacity: self.inner.capacity,
            },
            mpsc::error::TrySendError::Closed(_) => SendError::Closed { endpoint },
        })
    }

    async fn deliver_now(&self, endpoint: SocketAddr, envelope: Envelope) -> Result<(), SendError> {
        deliver(endpoint, &envelope, self.inner.connect_timeout).await
    }

    async fn forget(&self, endpoint: SocketAddr) {
        // Dropping the sender lets the worker drain what is queued and exit.
        self.inner.queues.lock().await.remove(&endpoint);
    }

    async fn forget_all(&self) {
        self.inner.queues.lock().await.clear();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
