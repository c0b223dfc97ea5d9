//! Connection lifecycle: start/stop, broker drops and reconnects
//!
//! These tests drive `BrokerConnection` over the mock session and observe the
//! connection state, the subscribe requests replayed after a reconnect and the
//! lifecycle errors surfaced to callers.


use brokerlink::link::{ConnectionState, PublishOutcome};
use brokerlink::testing::MockSession;
use brokerlink::{InboundMessage, LinkError};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{
    fast_config, forwarding_handler, mock_connection, mock_connection_with, recv_within,
    wait_until,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_every_pattern_is_resubscribed_after_reconnect() {
    let connection = mock_connection();
    connection.start().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let patterns = ["home/+/temperature", "home/alarm", "logs/#"];
    let handles: Vec<_> = patterns
        .iter()
        .map(|pattern| connection.subscribe(pattern, forwarding_handler(tx.clone())).unwrap())
        .collect();
    for handle in &handles {
        tokio::time::timeout(Duration::from_secs(2), handle.wait_until_subscribed())
            .await
            .unwrap();
    }
    let calls_before = connection.session().subscribe_calls().await.len();

    connection.session().drop_connection("broker restarted");
    wait_until(|| connection.session().connect_calls() >= 2 && connection.is_connected()).await;

    let session = connection.session().clone();
    tokio::time::timeout(Duration::from_secs(2), async {
        while session.subscribe_calls().await.len() <= calls_before {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let calls = session.subscribe_calls().await;
    let replay = calls.last().unwrap();
    assert_eq!(
        replay,
        &patterns.iter().map(|p| p.to_string()).collect::<Vec<_>>()
    );

    // Delivery resumes on the new session
    session.inject_message(InboundMessage::new("home/kitchen/temperature", "21"));
    assert_eq!(
        recv_within(&mut rx).await,
        ("home/kitchen/temperature".to_string(), "21".to_string())
    );

    connection.stop().await;
}

#[tokio::test]
async fn test_second_start_fails_fast() {
    let connection = mock_connection();
    connection.start().await.unwrap();

    let err = connection.start().await.unwrap_err();
    assert!(matches!(err, LinkError::AlreadyStarted));
    assert_eq!(connection.session().connect_calls(), 1);

    connection.stop().await;
}

#[tokio::test]
async fn test_start_after_stop_fails_fast() {
    let connection = mock_connection();
    connection.start().await.unwrap();
    wait_until(|| connection.is_connected()).await;
    connection.stop().await;

    let err = connection.start().await.unwrap_err();
    assert!(matches!(err, LinkError::AlreadyStarted));
    assert!(!connection.is_started());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(connection.session().connect_calls(), 1);
    assert_eq!(connection.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_start_after_stop_without_start_fails_fast() {
    let connection = mock_connection();
    connection.stop().await;

    let err = connection.start().await.unwrap_err();
    assert!(matches!(err, LinkError::AlreadyStarted));
    assert_eq!(connection.session().connect_calls(), 0);
}

#[tokio::test]
async fn test_concurrent_starts_only_one_wins() {
    let connection = mock_connection();

    let results = futures::future::join_all((0..8).map(|_| connection.start())).await;
    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter(|result| result.is_err())
        .all(|result| matches!(result, Err(LinkError::AlreadyStarted))));
    assert_eq!(connection.session().connect_calls(), 1);

    connection.stop().await;
}

#[tokio::test]
async fn test_initial_connect_failure_is_retried() {
    let session = MockSession::new();
    session.set_accept_connections(false);
    let connection = mock_connection_with(fast_config(), session);

    connection.start().await.unwrap();
    assert_eq!(connection.connection_state(), ConnectionState::Disconnected);

    wait_until(|| connection.session().connect_calls() >= 2).await;
    connection.session().set_accept_connections(true);

    tokio::time::timeout(
        Duration::from_secs(2),
        connection.wait_until_connected(&CancellationToken::new()),
    )
    .await
    .unwrap()
    .unwrap();

    connection.stop().await;
}

#[tokio::test]
async fn test_refused_credentials_keep_retrying() {
    let session = MockSession::new();
    session.set_refuse_credentials(true);
    let connection = mock_connection_with(fast_config(), session);

    connection.start().await.unwrap();
    wait_until(|| connection.metrics().connection.connection_failures >= 2).await;
    assert!(!connection.is_connected());

    connection.session().set_refuse_credentials(false);
    wait_until(|| connection.is_connected()).await;

    connection.stop().await;
}

#[tokio::test]
async fn test_disabled_connection_never_connects() {
    let config = brokerlink::config::MqttSection {
        disable_connection: true,
        ..fast_config()
    };
    let connection = mock_connection_with(config, MockSession::new());

    connection.start().await.unwrap();
    let handle = connection.publish_str("queued/forever", "x");
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(connection.session().connect_calls(), 0);
    assert_eq!(connection.connection_state(), ConnectionState::Disconnected);
    assert!(!handle.is_completed());

    connection.stop().await;

    // Nothing will ever drain the queue, so stop fails what is left
    let outcome = tokio::time::timeout(Duration::from_secs(1), handle.wait_completed())
        .await
        .expect("queued publish should be released by stop");
    assert!(matches!(outcome, PublishOutcome::Failed { .. }));
    assert!(connection.session().published().await.is_empty());
}

#[tokio::test]
async fn test_stop_resets_state_and_disconnects() {
    let connection = mock_connection();
    connection.start().await.unwrap();
    wait_until(|| connection.is_connected()).await;

    connection.stop().await;
    assert_eq!(connection.connection_state(), ConnectionState::Disconnected);
    assert_eq!(connection.session().disconnect_calls(), 1);

    // Loops are gone: no reconnect happens afterwards
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(connection.session().connect_calls(), 1);
    assert!(!connection.is_connected());
}

#[tokio::test]
async fn test_stop_without_start_is_harmless() {
    let connection = mock_connection();
    connection.stop().await;
    assert_eq!(connection.session().disconnect_calls(), 0);
    assert_eq!(connection.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_wait_until_connected_wakes_waiters() {
    let session = MockSession::new();
    session.set_accept_connections(false);
    let connection = Arc::new(mock_connection_with(fast_config(), session));
    connection.start().await.unwrap();

    let waiter = {
        let connection = connection.clone();
        tokio::spawn(async move {
            connection
                .wait_until_connected(&CancellationToken::new())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    connection.session().set_accept_connections(true);
    let result = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());

    connection.stop().await;
}

#[tokio::test]
async fn test_wait_before_start_resolves_on_first_connect() {
    let session = MockSession::new();
    session.set_accept_connections(false);
    let connection = Arc::new(mock_connection_with(fast_config(), session));

    let waiter = {
        let connection = connection.clone();
        tokio::spawn(async move {
            connection
                .wait_until_connected(&CancellationToken::new())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!waiter.is_finished());

    connection.start().await.unwrap();
    wait_until(|| connection.session().connect_calls() >= 2).await;
    assert!(!waiter.is_finished());

    connection.session().set_accept_connections(true);
    let result = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
    assert!(connection.is_connected());

    connection.stop().await;
}

#[tokio::test]
async fn test_cancelled_wait_has_no_side_effects() {
    let session = MockSession::new();
    session.set_accept_connections(false);
    let connection = mock_connection_with(fast_config(), session);
    connection.start().await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = connection.wait_until_connected(&cancel).await;
    assert!(matches!(result, Err(LinkError::Cancelled)));
    assert!(connection.is_started());

    connection.session().set_accept_connections(true);
    wait_until(|| connection.is_connected()).await;

    connection.stop().await;
}
