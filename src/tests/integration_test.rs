use bytes::Bytes;

use crate::broker::Broker;
use crate::client::Client;
use crate::tests::support::{
    assert_quiet, listener, recorder, recv_payload, settings, spawn_broker, wait_until,
};
use crate::transport::Address;

async fn client(addr: &Address) -> Client {
    let client = Client::with_settings(addr.clone(), &settings(vec![]));
    client.begin().await.expect("begin");
    client
}

#[tokio::test]
async fn integration_publish_crosses_two_nodes_once() {
    let (listener_a, addr_a) = listener().await;
    let (listener_b, addr_b) = listener().await;
    let a = Broker::new(settings(vec![addr_b.clone()]));
    let b = Broker::new(settings(vec![addr_a.clone()]));
    spawn_broker(&a, listener_a);
    spawn_broker(&b, listener_b);

    let remote = client(&addr_b).await;
    let (record_remote, mut remote_rx) = recorder();
    remote.subscribe("ping", record_remote).await.unwrap();

    let local = client(&addr_a).await;
    let (record_local, mut local_rx) = recorder();
    local.subscribe("ping", record_local).await.unwrap();

    wait_until("A learns that B wants ping", || {
        a.subscriber_count("ping") == 2
    })
    .await;

    let publisher = client(&addr_a).await;
    publisher.publish("ping", "1").await.unwrap();

    assert_eq!(recv_payload(&mut remote_rx).await, Bytes::from_static(b"1"));
    assert_eq!(recv_payload(&mut local_rx).await, Bytes::from_static(b"1"));
    // B must not bounce the message back to A
    assert_quiet(&mut remote_rx).await;
    assert_quiet(&mut local_rx).await;
}

#[tokio::test]
async fn integration_topics_stay_local_without_remote_interest() {
    let (listener_a, addr_a) = listener().await;
    let (listener_b, addr_b) = listener().await;
    let a = Broker::new(settings(vec![addr_b.clone()]));
    let b = Broker::new(settings(vec![addr_a.clone()]));
    spawn_broker(&a, listener_a);
    spawn_broker(&b, listener_b);

    let remote = client(&addr_b).await;
    let (record_imu, mut imu_rx) = recorder();
    remote.subscribe("imu", record_imu).await.unwrap();
    wait_until("A learns that B wants imu", || a.subscriber_count("imu") == 1).await;

    let publisher = client(&addr_a).await;
    publisher.publish("camera", "frame").await.unwrap();
    publisher.publish("imu", "accel").await.unwrap();

    assert_eq!(recv_payload(&mut imu_rx).await, Bytes::from_static(b"accel"));
    assert_quiet(&mut imu_rx).await;
    assert_eq!(a.topics(), vec!["imu".to_string()]);
    assert_eq!(b.subscriber_count("camera"), 0);
}

#[tokio::test]
async fn integration_in_process_and_client_subscribers_mix() {
    let (listener_a, addr_a) = listener().await;
    let (listener_b, addr_b) = listener().await;
    let a = Broker::new(settings(vec![addr_b.clone()]));
    let b = Broker::new(settings(vec![addr_a.clone()]));
    spawn_broker(&a, listener_a);
    spawn_broker(&b, listener_b);

    // in-process subscriber on B, announced straight from the broker
    let (record, mut rx) = recorder();
    b.subscribe("pose", record).await.unwrap();
    wait_until("A learns that B wants pose", || a.subscriber_count("pose") == 1).await;

    let publisher = client(&addr_a).await;
    publisher.publish("pose", "x=1").await.unwrap();
    assert_eq!(recv_payload(&mut rx).await, Bytes::from_static(b"x=1"));
    assert_quiet(&mut rx).await;
}

#[tokio::test]
async fn integration_one_way_peering_delivers_once() {
    let (listener_a, addr_a) = listener().await;
    let (listener_b, addr_b) = listener().await;
    // A lists B; B has no peers configured
    let a = Broker::new(settings(vec![addr_b.clone()]));
    let b = Broker::new(settings(vec![]));
    spawn_broker(&a, listener_a);
    spawn_broker(&b, listener_b);

    let remote = client(&addr_b).await;
    let (record_remote, mut remote_rx) = recorder();
    remote.subscribe("ping", record_remote).await.unwrap();
    wait_until("B registers its subscriber", || b.subscriber_count("ping") == 1).await;

    let local = client(&addr_a).await;
    let (record_local, mut local_rx) = recorder();
    local.subscribe("ping", record_local).await.unwrap();
    wait_until("A registers its subscriber", || a.subscriber_count("ping") == 1).await;

    let publisher = client(&addr_a).await;
    publisher.publish("ping", "1").await.unwrap();

    assert_eq!(recv_payload(&mut remote_rx).await, Bytes::from_static(b"1"));
    assert_eq!(recv_payload(&mut local_rx).await, Bytes::from_static(b"1"));
    assert_quiet(&mut remote_rx).await;
    // nothing comes back to A from B
    assert_quiet(&mut local_rx).await;
    assert!(a.peers()[0].is_connected());
}
