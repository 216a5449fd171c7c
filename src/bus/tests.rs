use super::*;
use crate::test_utils::{recv_delivery, RecordingHandler};

#[test]
fn test_bus_config_default() {
    let config = BusConfig::default();
    assert_eq!(config.driver, None);
    assert_eq!(config.broker_url(), DEFAULT_NATS_URL);
    assert_eq!(config.listener_retry_delay_ms, DEFAULT_LISTENER_RETRY_DELAY_MS);
}

#[test]
fn test_bus_config_broker_url_override() {
    let config = BusConfig {
        url: "nats://broker:4222".to_string(),
        ..Default::default()
    };
    assert_eq!(config.broker_url(), "nats://broker:4222");
}

#[test]
fn test_bus_config_from_yaml() {
    let config: BusConfig = serde_yaml::from_str("driver: postgres\nlistener_retry_delay_ms: 250\n").unwrap();
    assert_eq!(config.driver, Some(BusDriver::Postgres));
    assert_eq!(config.listener_retry_delay_ms, 250);
    assert!(config.url.is_empty());
}

#[test]
fn test_bus_config_rejects_unknown_driver() {
    let result: std::result::Result<BusConfig, _> = serde_yaml::from_str("driver: carrier-pigeon\n");
    assert!(result.is_err());
}

#[test]
fn test_bus_driver_names() {
    assert_eq!(BusDriver::Memory.as_str(), "memory");
    assert_eq!(BusDriver::Nats.as_str(), "nats");
    assert_eq!(BusDriver::Redis.as_str(), "redis");
    assert_eq!(BusDriver::Postgres.as_str(), "postgres");
}

#[tokio::test]
async fn test_init_bus_defaults_to_memory() {
    let bus = init_bus(&BusConfig::default(), BusClients::default())
        .await
        .unwrap();
    assert_eq!(bus.driver(), "memory");

    let (handler, mut rx) = RecordingHandler::new();
    bus.subscribe("orders", Box::new(handler)).await.unwrap();
    bus.publish("orders", Payload::from("hi")).await.unwrap();
    assert_eq!(recv_delivery(&mut rx).await, bytes::Bytes::from("hi"));
}

#[tokio::test]
async fn test_init_bus_explicit_memory() {
    let config = BusConfig {
        driver: Some(BusDriver::Memory),
        ..Default::default()
    };
    let bus = init_bus(&config, BusClients::default()).await.unwrap();
    assert_eq!(bus.driver(), "memory");
}

#[tokio::test]
async fn test_init_bus_redis_without_client_fails() {
    let config = BusConfig {
        driver: Some(BusDriver::Redis),
        ..Default::default()
    };
    let result = init_bus(&config, BusClients::default()).await;
    assert!(matches!(result, Err(BusError::Config(_))));
}

#[tokio::test]
async fn test_init_bus_postgres_without_pool_fails() {
    let config = BusConfig {
        driver: Some(BusDriver::Postgres),
        ..Default::default()
    };
    let result = init_bus(&config, BusClients::default()).await;
    assert!(matches!(result, Err(BusError::Config(_))));
}

#[cfg(not(feature = "nats"))]
#[tokio::test]
async fn test_init_bus_nats_without_feature_fails() {
    let config = BusConfig {
        driver: Some(BusDriver::Nats),
        ..Default::default()
    };
    let result = init_bus(&config, BusClients::default()).await;
    assert!(matches!(result, Err(BusError::Config(_))));
}

#[cfg(feature = "nats")]
#[tokio::test]
async fn test_init_bus_nats_unreachable_fails() {
    let config = BusConfig {
        driver: Some(BusDriver::Nats),
        url: "nats://127.0.0.1:1".to_string(),
        ..Default::default()
    };
    let result = init_bus(&config, BusClients::default()).await;
    assert!(matches!(result, Err(BusError::Connection(_))));
}

#[cfg(feature = "redis")]
#[tokio::test]
async fn test_init_bus_redis_with_client() {
    let config = BusConfig {
        driver: Some(BusDriver::Redis),
        ..Default::default()
    };
    let clients = BusClients {
        redis: Some(::redis::Client::open("redis://127.0.0.1:1/").unwrap()),
        ..Default::default()
    };
    // Lazy: no connection is attempted until the first subscribe.
    let bus = init_bus(&config, clients).await.unwrap();
    assert_eq!(bus.driver(), "redis");
}

#[cfg(feature = "postgres")]
#[tokio::test]
async fn test_init_bus_postgres_with_pool() {
    let config = BusConfig {
        driver: Some(BusDriver::Postgres),
        listener_retry_delay_ms: 60_000,
        ..Default::default()
    };
    let pool = sqlx::postgres::PgPoolOptions::new()
        .connect_lazy("postgres://postgres@127.0.0.1:1/notibus")
        .unwrap();
    let clients = BusClients {
        postgres: Some(pool),
        ..Default::default()
    };

    let bus = init_bus(&config, clients).await.unwrap();
    assert_eq!(bus.driver(), "postgres");
    bus.close().await.unwrap();
}

#[tokio::test]
async fn test_closure_handler() {
    let bus = MemoryBus::new();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    bus.subscribe(
        "orders",
        Box::new(move |payload: bytes::Bytes| {
            let tx = tx.clone();
            async move {
                tx.send(payload.len())
                    .map_err(|e| BusError::Handler(e.to_string()))
            }
        }),
    )
    .await
    .unwrap();

    bus.publish("orders", Payload::from("four")).await.unwrap();

    let len = tokio::time::timeout(crate::test_utils::DELIVERY_TIMEOUT, rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(len, 4);
}
