//! Integration tests for the one-shot envelope transport.
//!
//! A real [`Listener`] is bound on loopback and envelopes are pushed at it
//! through [`deliver`] and [`Outbox`], exactly as the roles do it.
//!
//! ```text
//! Outbox ──► worker ──► deliver ──TCP──► Listener ──► ChannelDispatcher ──► test
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use grouplink_core::net::{
    deliver, ChannelDispatcher, EnvelopeSink, Listener, Outbox, SendError, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_MAX_ENVELOPE_BYTES,
};
use grouplink_core::{Device, Envelope};
use tokio::time::timeout;
use tokio_test::assert_ok;

const WAIT: Duration = Duration::from_secs(3);

fn any_loopback_port() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[tokio::test]
async fn test_deliver_then_receive_with_observed_source() {
    // Arrange
    let (dispatcher, mut rx) = ChannelDispatcher::channel(8);
    let listener = Listener::bind(
        any_loopback_port(),
        DEFAULT_MAX_ENVELOPE_BYTES,
        Arc::new(dispatcher),
    )
    .await
    .expect("bind");
    let sender = Device::new("member-1", "alpha");
    let declared = sender.clone().with_endpoint("0.0.0.0:5555".parse().unwrap());
    let envelope = Envelope::join(&sender, &declared).unwrap();

    // Act
    assert_ok!(deliver(listener.local_addr(), &envelope, DEFAULT_CONNECT_TIMEOUT).await);

    // Assert
    let inbound = timeout(WAIT, rx.recv())
        .await
        .expect("timed out")
        .expect("closed");
    assert_eq!(inbound.envelope, envelope);
    assert_eq!(inbound.source.ip(), listener.local_addr().ip());
    listener.shutdown().await;
}

#[tokio::test]
async fn test_outbox_fans_out_to_several_listeners() {
    // Arrange: three independent peers.
    let mut peers = Vec::new();
    for _ in 0..3 {
        let (dispatcher, rx) = ChannelDispatcher::channel(8);
        let handle = Listener::bind(
            any_loopback_port(),
            DEFAULT_MAX_ENVELOPE_BYTES,
            Arc::new(dispatcher),
        )
        .await
        .expect("bind");
        peers.push((handle, rx));
    }
    let outbox = Outbox::default();
    let envelope = Envelope::data(&Device::new("coordinator", "S"), b"hi".to_vec());

    // Act
    for (handle, _) in &peers {
        assert_ok!(outbox.enqueue(handle.local_addr(), envelope.clone()).await);
    }

    // Assert: every peer receives exactly the one envelope.
    for (handle, mut rx) in peers {
        let inbound = timeout(WAIT, rx.recv()).await.expect("timed out").expect("closed");
        assert_eq!(inbound.envelope.payload, b"hi");
        handle.shutdown().await;
    }
}

#[tokio::test]
async fn test_delivery_after_shutdown_fails_to_connect() {
    let (dispatcher, _rx) = ChannelDispatcher::channel(1);
    let listener = Listener::bind(
        any_loopback_port(),
        DEFAULT_MAX_ENVELOPE_BYTES,
        Arc::new(dispatcher),
    )
    .await
    .expect("bind");
    let addr = listener.local_addr();
    listener.shutdown().await;

    let envelope = Envelope::data(&Device::new("x", "X"), vec![]);
    let result = deliver(addr, &envelope, Duration::from_millis(500)).await;

    assert!(matches!(
        result,
        Err(SendError::Connect { .. }) | Err(SendError::ConnectTimeout { .. })
    ));
}

#[tokio::test]
async fn test_rebinding_same_port_after_shutdown_succeeds() {
    let (dispatcher, _rx) = ChannelDispatcher::channel(1);
    let first = Listener::bind(
        any_loopback_port(),
        DEFAULT_MAX_ENVELOPE_BYTES,
        Arc::new(dispatcher.clone()),
    )
    .await
    .expect("bind");
    let addr = first.local_addr();
    first.shutdown().await;

    let second = Listener::bind(addr, DEFAULT_MAX_ENVELOPE_BYTES, Arc::new(dispatcher)).await;

    let second = second.expect("port must be reusable after shutdown");
    assert_eq!(second.local_addr(), addr);
    second.shutdown().await;
}
