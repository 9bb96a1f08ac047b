//! Network plumbing shared by both roles.
//!
//! Every envelope travels over its own short-lived TCP connection:
//!
//! ```text
//! sender                                   listener
//! ──────                                   ────────
//! connect (bounded timeout) ─────────────► accept
//! write encoded envelope    ─────────────► read until EOF (capped)
//! close                     ─────────────► decode, dispatch(envelope, source)
//! ```
//!
//! - [`listener`] owns the accept loop and hands decoded envelopes to an
//!   [`EnvelopeDispatcher`].
//! - [`sender`] performs one-shot deliveries and keeps a bounded FIFO queue
//!   per peer ([`Outbox`]).
//! - [`mock`] provides a recording [`EnvelopeSink`] for tests of role logic.

pub mod listener;
pub mod mock;
pub mod sender;

pub use listener::{
    ChannelDispatcher, EnvelopeDispatcher, InboundEnvelope, Listener, ListenerError,
    ListenerHandle, DEFAULT_MAX_ENVELOPE_BYTES,
};
pub use sender::{
    deliver, EnvelopeSink, Outbox, SendError, DEFAULT_CONNECT_TIMEOUT, DEFAULT_QUEUE_CAPACITY,
};
