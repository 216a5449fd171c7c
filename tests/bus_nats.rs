//! NATS bus integration tests using testcontainers.
//!
//! Run with: cargo test --test bus_nats --features nats,test-utils -- --nocapture

use std::time::Duration;

use bytes::Bytes;
use notibus::bus::{
    init_bus, Bus, BusClients, BusConfig, BusDriver, BusError, BusExt, NatsBus, Payload,
};
use notibus::test_utils::{assert_no_delivery, recv_delivery, unique_topic, RecordingHandler};
use serde_json::json;
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};
use tokio::sync::mpsc;

/// Start NATS container and return its URL.
async fn start_nats() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let image = GenericImage::new("nats", "2.10")
        .with_exposed_port(4222.tcp())
        .with_wait_for(WaitFor::message_on_stderr(
            "Listening for client connections",
        ));

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start NATS container");

    let host_port = container
        .get_host_port_ipv4(4222)
        .await
        .expect("Failed to get mapped port");
    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let url = format!("nats://{}:{}", host, host_port);
    println!("NATS available at: {}", url);

    (container, url)
}

#[tokio::test]
async fn test_nats_publish_subscribe() {
    let (_container, url) = start_nats().await;
    let bus = NatsBus::connect(&url).await.unwrap();
    let topic = unique_topic("orders");

    let (handler, mut rx) = RecordingHandler::new();
    bus.subscribe(&topic, Box::new(handler)).await.unwrap();

    bus.publish(&topic, Payload::from("hello")).await.unwrap();

    assert_eq!(recv_delivery(&mut rx).await, Bytes::from("hello"));
}

#[tokio::test]
async fn test_nats_fan_out_to_every_subscription() {
    let (_container, url) = start_nats().await;
    let bus = NatsBus::connect(&url).await.unwrap();
    let topic = unique_topic("fanout");

    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe(&topic, Box::new(RecordingHandler::with_sender(tx.clone())))
        .await
        .unwrap();
    bus.subscribe(&topic, Box::new(RecordingHandler::with_sender(tx)))
        .await
        .unwrap();
    assert_eq!(bus.subscription_count(), 2);

    bus.publish_json(&topic, &json!({"n": 1})).await.unwrap();

    for _ in 0..2 {
        let received = recv_delivery(&mut rx).await;
        let decoded: serde_json::Value = serde_json::from_slice(&received).unwrap();
        assert_eq!(decoded, json!({"n": 1}));
    }
}

#[tokio::test]
async fn test_nats_via_factory() {
    let (_container, url) = start_nats().await;
    let config = BusConfig {
        driver: Some(BusDriver::Nats),
        url,
        ..Default::default()
    };

    let bus = init_bus(&config, BusClients::default()).await.unwrap();
    assert_eq!(bus.driver(), "nats");

    let topic = unique_topic("factory");
    let (handler, mut rx) = RecordingHandler::new();
    bus.subscribe(&topic, Box::new(handler)).await.unwrap();
    bus.publish(&topic, Payload::from("via factory")).await.unwrap();

    assert_eq!(recv_delivery(&mut rx).await, Bytes::from("via factory"));
}

#[tokio::test]
async fn test_nats_close_stops_delivery() {
    let (_container, url) = start_nats().await;
    let bus = NatsBus::connect(&url).await.unwrap();
    let observer = NatsBus::connect(&url).await.unwrap();
    let topic = unique_topic("closing");

    let (handler, mut rx) = RecordingHandler::new();
    bus.subscribe(&topic, Box::new(handler)).await.unwrap();
    bus.close().await.unwrap();
    assert_eq!(bus.subscription_count(), 0);

    observer
        .publish(&topic, Payload::from("after close"))
        .await
        .unwrap();

    assert_no_delivery(&mut rx, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_nats_operations_fail_after_close() {
    let (_container, url) = start_nats().await;
    let bus = NatsBus::connect(&url).await.unwrap();
    let topic = unique_topic("closed");

    bus.close().await.unwrap();

    let published = bus.publish(&topic, Payload::from("late")).await;
    assert!(matches!(published, Err(BusError::Connection(_))));

    let (handler, _rx) = RecordingHandler::new();
    let subscribed = bus.subscribe(&topic, Box::new(handler)).await;
    assert!(matches!(subscribed, Err(BusError::Connection(_))));

    // Idempotent
    bus.close().await.unwrap();
}
