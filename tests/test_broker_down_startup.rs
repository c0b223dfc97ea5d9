//! Startup against an unreachable broker
//!
//! Uses the real rumqttc-backed session pointed at a port nothing listens on.
//! `start()` must succeed, the link must stay Disconnected, and the liveness
//! loop must keep retrying until stopped.


use brokerlink::config::MqttSection;
use brokerlink::link::{BrokerConnection, ConnectionState, PublishOutcome};
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn unreachable_config() -> MqttSection {
    MqttSection {
        host: "mqtt://127.0.0.1:1".to_string(),
        client_id: "startup-retry-test".to_string(),
        ..test_helpers::fast_config()
    }
}

#[tokio::test]
async fn test_start_succeeds_when_broker_is_unavailable() {
    let connection = BrokerConnection::from_config(unreachable_config()).unwrap();

    timeout(Duration::from_secs(3), connection.start())
        .await
        .expect("start should not hang")
        .expect("start should not fail on an unreachable broker");

    assert_eq!(connection.connection_state(), ConnectionState::Disconnected);
    assert!(connection.metrics().connection.connection_failures >= 1);

    connection.stop().await;
}

#[tokio::test]
async fn test_connect_is_retried_until_stopped() {
    let connection = BrokerConnection::from_config(unreachable_config()).unwrap();
    connection.start().await.unwrap();

    test_helpers::wait_until(|| connection.metrics().connection.connection_attempts >= 3).await;
    assert!(!connection.is_connected());

    connection.stop().await;
    let attempts = connection.metrics().connection.connection_attempts;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        connection.metrics().connection.connection_attempts,
        attempts,
        "no attempts after stop"
    );
}

#[tokio::test]
async fn test_waiters_can_give_up() {
    let connection = BrokerConnection::from_config(unreachable_config()).unwrap();
    connection.start().await.unwrap();

    let cancel = CancellationToken::new();
    let waiter = connection.wait_until_connected(&cancel);
    let canceller = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    };
    let (result, _) = tokio::join!(waiter, canceller);
    assert!(matches!(result, Err(brokerlink::LinkError::Cancelled)));

    let handle = connection.publish_str("startup/pending", "x");
    connection.stop().await;
    assert!(matches!(
        handle.wait_completed().await,
        PublishOutcome::Failed { .. }
    ));
}
