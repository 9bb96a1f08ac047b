//! Recording envelope sink for unit testing role logic.
//!
//! Records every envelope a role hands to the outbound seam instead of
//! opening connections, so tests can assert exactly who was sent what.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::sender::{EnvelopeSink, SendError};
use crate::protocol::envelope::{Envelope, EnvelopeKind};

/// How an envelope reached the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    Queued,
    Immediate,
}

/// One recorded outbound envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEnvelope {
    pub endpoint: SocketAddr,
    pub envelope: Envelope,
    pub mode: SendMode,
}

/// An [`EnvelopeSink`] that records instead of sending.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    sent: Arc<Mutex<Vec<SentEnvelope>>>,
    forgotten: Arc<Mutex<Vec<SocketAddr>>>,
    fail_immediate: Arc<Mutex<bool>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later `deliver_now` fail with a connect error.
    pub fn fail_immediate_deliveries(&self) {
        *self.fail_immediate.lock().expect("lock poisoned") = true;
    }

    /// Every envelope recorded so far, in call order.
    pub fn sent(&self) -> Vec<SentEnvelope> {
        self.sent.lock().expect("lock poisoned").clone()
    }

    /// Envelopes of `kind` sent to `endpoint`.
    pub fn sent_to(&self, endpoint: SocketAddr, kind: EnvelopeKind) -> Vec<Envelope> {
        self.sent()
            .into_iter()
            .filter(|s| s.endpoint == endpoint && s.envelope.kind == kind)
            .map(|s| s.envelope)
            .collect()
    }

    /// Endpoints passed to `forget`, in call order.
    pub fn forgotten(&self) -> Vec<SocketAddr> {
        self.forgotten.lock().expect("lock poisoned").clone()
    }

    pub fn clear(&self) {
        self.sent.lock().expect("lock poisoned").clear();
    }

    fn record(&self, endpoint: SocketAddr, envelope: Envelope, mode: SendMode) {
        self.sent.lock().expect("lock poisoned").push(SentEnvelope {
            endpoint,
            envelope,
            mode,
        });
    }
}

#[async_trait]
impl EnvelopeSink for RecordingSink {
    async fn enqueue(&self, endpoint: SocketAddr, envelope: Envelope) -> Result<(), SendError> {
        self.record(endpoint, envelope, SendMode::Queued);
        Ok(())
    }

    async fn deliver_now(&self, endpoint: SocketAddr, envelope: Envelope) -> Result<(), SendError> {
        self.record(endpoint, envelope, SendMode::Immediate);
        if *self.fail_immediate.lock().expect("lock poisoned") {
            return Err(SendError::Connect {
                endpoint,
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            });
        }
        Ok(())
    }

    async fn forget(&self, endpoint: SocketAddr) {
        self.forgotten.lock().expect("lock poisoned").push(endpoint);
    }

    async fn forget_all(&self) {}
}
