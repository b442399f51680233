use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::pubsub_client::Client;
use crate::broker::Broker;
use crate::tests::support::{
    WAIT, assert_quiet, listener, recorder, recv_payload, settings, spawn_broker, wait_until,
};
use crate::transport::Address;
use crate::utils::error::Error;

async fn local_broker() -> (Broker, Address) {
    let (listener, addr) = listener().await;
    let broker = Broker::new(settings(vec![]));
    spawn_broker(&broker, listener);
    (broker, addr)
}

async fn connected(addr: &Address) -> Client {
    let client = Client::with_settings(addr.clone(), &settings(vec![]));
    client.begin().await.expect("begin");
    client
}

#[tokio::test]
async fn test_publish_before_begin_is_rejected() {
    let client = Client::new(Address::new("127.0.0.1", 1));
    assert!(!client.is_connected());
    let err = client.publish("ping", "1").await.unwrap_err();
    assert!(matches!(err, Error::NotConnected));
}

#[tokio::test]
async fn test_begin_fails_without_broker() {
    let (listener, addr) = listener().await;
    drop(listener);
    let client = Client::with_settings(addr, &settings(vec![]));
    assert!(client.begin().await.is_err());
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_round_trip_through_broker() {
    let (broker, addr) = local_broker().await;
    let subscriber = connected(&addr).await;
    let publisher = connected(&addr).await;

    let (record, mut rx) = recorder();
    subscriber.subscribe("ping", record).await.unwrap();
    wait_until("the broker sees the subscription", || {
        broker.subscriber_count("ping") == 1
    })
    .await;

    publisher.publish("ping", "1").await.unwrap();
    assert_eq!(recv_payload(&mut rx).await, Bytes::from_static(b"1"));
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn test_dispatch_is_exact_match() {
    let (broker, addr) = local_broker().await;
    let subscriber = connected(&addr).await;
    let publisher = connected(&addr).await;

    let (record, mut rx) = recorder();
    subscriber.subscribe("lidar", record).await.unwrap();
    let (record_scan, mut scan_rx) = recorder();
    subscriber.subscribe("lidar/scan2d", record_scan).await.unwrap();
    wait_until("both topics are registered", || {
        broker.subscriber_count("lidar") == 1 && broker.subscriber_count("lidar/scan2d") == 1
    })
    .await;

    publisher.publish("lidar/scan2d", "scan").await.unwrap();
    assert_eq!(recv_payload(&mut scan_rx).await, Bytes::from_static(b"scan"));
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn test_callbacks_run_in_arrival_order() {
    let (broker, addr) = local_broker().await;
    let subscriber = connected(&addr).await;
    let publisher = connected(&addr).await;

    let (record, mut rx) = recorder();
    subscriber.subscribe("seq", record).await.unwrap();
    wait_until("the subscription lands", || broker.subscriber_count("seq") == 1).await;

    for i in 0..20u8 {
        publisher.publish("seq", vec![i]).await.unwrap();
    }
    for i in 0..20u8 {
        assert_eq!(recv_payload(&mut rx).await, Bytes::from(vec![i]));
    }
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let (broker, addr) = local_broker().await;
    let subscriber = connected(&addr).await;
    let publisher = connected(&addr).await;

    let (record, mut rx) = recorder();
    subscriber.subscribe("imu", record).await.unwrap();
    wait_until("subscribed", || broker.subscriber_count("imu") == 1).await;

    subscriber.unsubscribe("imu").await.unwrap();
    wait_until("unsubscribed", || broker.subscriber_count("imu") == 0).await;

    publisher.publish("imu", "accel").await.unwrap();
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn test_subscriptions_made_before_begin_are_sent() {
    let (broker, addr) = local_broker().await;
    let subscriber = Client::with_settings(addr.clone(), &settings(vec![]));
    let (record, mut rx) = recorder();
    subscriber.subscribe("early", record).await.unwrap();
    assert_eq!(broker.subscriber_count("early"), 0);

    subscriber.begin().await.unwrap();
    wait_until("the deferred subscription lands", || {
        broker.subscriber_count("early") == 1
    })
    .await;

    broker.publish("early", "bird").await.unwrap();
    assert_eq!(recv_payload(&mut rx).await, Bytes::from_static(b"bird"));
}

#[tokio::test]
async fn test_close_releases_broker_state() {
    let (broker, addr) = local_broker().await;
    let subscriber = connected(&addr).await;
    let (record, _rx) = recorder();
    subscriber.subscribe("gone", record).await.unwrap();
    wait_until("subscribed", || broker.subscriber_count("gone") == 1).await;

    subscriber.close();
    assert!(!subscriber.is_connected());
    wait_until("the broker forgets the client", || {
        broker.subscriber_count("gone") == 0
    })
    .await;
}

#[tokio::test]
async fn test_invalid_topic_is_rejected() {
    let (_broker, addr) = local_broker().await;
    let client = connected(&addr).await;
    let (record, _rx) = recorder();
    assert!(matches!(
        client.subscribe("", record).await,
        Err(Error::Encode(_))
    ));
    assert!(matches!(
        client.publish(&"x".repeat(300), "big").await,
        Err(Error::Encode(_))
    ));
}

#[tokio::test]
async fn test_slow_callback_does_not_hold_up_other_topics() {
    let (broker, addr) = local_broker().await;
    let subscriber = connected(&addr).await;
    let publisher = connected(&addr).await;

    let (started_tx, mut started) = mpsc::unbounded_channel();
    subscriber
        .subscribe("slow", move |payload: Bytes| {
            let _ = started_tx.send(payload);
            tokio::time::sleep(Duration::from_secs(30))
        })
        .await
        .unwrap();
    let (record, mut fast_rx) = recorder();
    subscriber.subscribe("fast", record).await.unwrap();
    wait_until("both topics are registered", || {
        broker.subscriber_count("slow") == 1 && broker.subscriber_count("fast") == 1
    })
    .await;

    publisher.publish("slow", "stuck").await.unwrap();
    assert_eq!(recv_payload(&mut started).await, Bytes::from_static(b"stuck"));

    publisher.publish("fast", "through").await.unwrap();
    let fast = tokio::time::timeout(WAIT, fast_rx.recv()).await;
    assert_eq!(fast.unwrap(), Some(Bytes::from_static(b"through")));
}

#[tokio::test]
async fn test_subscribe_during_begin_reaches_broker() {
    let (broker, addr) = local_broker().await;
    let client = Client::with_settings(addr.clone(), &settings(vec![]));
    let (record, mut rx) = recorder();

    let (begun, subscribed) = tokio::join!(client.begin(), client.subscribe("race", record));
    begun.unwrap();
    subscribed.unwrap();
    wait_until("the subscription lands", || broker.subscriber_count("race") == 1).await;

    broker.publish("race", "won").await.unwrap();
    assert_eq!(recv_payload(&mut rx).await, Bytes::from_static(b"won"));
}
