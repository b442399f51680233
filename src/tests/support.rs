//! Helpers shared by the async test suites.

use std::future::Ready;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::broker::Broker;
use crate::config::BrokerSettings;
use crate::transport::message::Message;
use crate::transport::{Address, Transport};

pub const WAIT: Duration = Duration::from_secs(3);
pub const QUIET: Duration = Duration::from_millis(400);

/// Short timeouts so failure paths finish quickly.
pub fn settings(peers: Vec<Address>) -> BrokerSettings {
    BrokerSettings {
        peers,
        send_timeout_ms: 200,
        connect_timeout_ms: 1000,
        channel_capacity: 16,
        route_idle_ms: 2000,
    }
}

pub async fn listener() -> (TcpListener, Address) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local_addr").into();
    (listener, addr)
}

pub fn spawn_broker(broker: &Broker, listener: TcpListener) {
    let broker = broker.clone();
    tokio::spawn(async move { broker.run(listener).await });
}

/// Connects an in-memory client to `broker`.
pub fn attach(broker: &Broker) -> Transport {
    attach_with_capacity(broker, 16)
}

pub fn attach_with_capacity(broker: &Broker, capacity: usize) -> Transport {
    let (ours, theirs) = Transport::pair(capacity);
    let broker = broker.clone();
    tokio::spawn(async move { broker.handle_connection(theirs).await });
    ours
}

pub async fn next_message(transport: &mut Transport) -> Message {
    let frame = tokio::time::timeout(WAIT, transport.receive())
        .await
        .expect("timed out waiting for a frame")
        .expect("connection closed");
    Message::decode(&frame).expect("decode")
}

pub async fn send_message(transport: &Transport, message: Message) {
    transport
        .send(message.encode().expect("encode"))
        .await
        .expect("send");
}

/// A subscriber closure that forwards every payload into a channel.
pub fn recorder() -> (
    impl Fn(Bytes) -> Ready<()> + Send + Sync + 'static,
    mpsc::UnboundedReceiver<Bytes>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let record = move |payload: Bytes| {
        let _ = tx.send(payload);
        std::future::ready(())
    };
    (record, rx)
}

pub async fn recv_payload(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Bytes {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a payload")
        .expect("recorder dropped")
}

pub async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
    if let Ok(Some(extra)) = tokio::time::timeout(QUIET, rx.recv()).await {
        panic!("unexpected extra delivery: {extra:?}");
    }
}

/// Polls `condition` until it holds or [`WAIT`] passes.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting until {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
