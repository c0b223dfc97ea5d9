//! Inbound dispatch: wildcard matching and handler isolation
//!
//! A failing, panicking or slow handler must never keep the other handlers
//! for the same message, or later messages, from running.


use async_trait::async_trait;
use brokerlink::link::{HandlerResult, MessageHandler};
use brokerlink::transport::InboundMessage;
use std::time::Duration;
use test_helpers::{forwarding_handler, mock_connection, recv_within, wait_until};
use tokio::sync::mpsc;

struct FailingHandler;

#[async_trait]
impl MessageHandler for FailingHandler {
    async fn on_message(&self, _message: InboundMessage) -> HandlerResult {
        Err("cannot process reading".into())
    }
}

struct PanickingHandler;

#[async_trait]
impl MessageHandler for PanickingHandler {
    async fn on_message(&self, _message: InboundMessage) -> HandlerResult {
        panic!("handler bug");
    }
}

struct StuckHandler;

#[async_trait]
impl MessageHandler for StuckHandler {
    async fn on_message(&self, _message: InboundMessage) -> HandlerResult {
        std::future::pending::<()>().await;
        Ok(())
    }
}

#[tokio::test]
async fn test_failing_and_panicking_handlers_do_not_block_others() {
    let connection = mock_connection();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handles = vec![
        connection.subscribe("plant/#", FailingHandler).unwrap(),
        connection.subscribe("plant/+/level", PanickingHandler).unwrap(),
        connection.subscribe("plant/#", StuckHandler).unwrap(),
        connection
            .subscribe("plant/tank/level", forwarding_handler(tx))
            .unwrap(),
    ];

    connection.start().await.unwrap();
    for handle in &handles {
        tokio::time::timeout(Duration::from_secs(2), handle.wait_until_subscribed())
            .await
            .unwrap();
    }

    for level in ["10", "20", "30"] {
        connection
            .session()
            .inject_message(InboundMessage::new("plant/tank/level", level));
    }
    for level in ["10", "20", "30"] {
        assert_eq!(recv_within(&mut rx).await.1, level);
    }

    wait_until(|| connection.metrics().dispatch.handler_failures >= 6).await;
    let dispatch = connection.metrics().dispatch;
    assert_eq!(dispatch.messages_received, 3);
    assert_eq!(dispatch.handlers_dispatched, 12);

    connection.stop().await;
}

#[tokio::test]
async fn test_only_matching_patterns_receive_messages() {
    let connection = mock_connection();
    let (level_tx, mut level_rx) = mpsc::unbounded_channel();
    let (system_tx, mut system_rx) = mpsc::unbounded_channel();

    let level = connection
        .subscribe("plant/+/level", forwarding_handler(level_tx))
        .unwrap();
    let system = connection
        .subscribe("#", forwarding_handler(system_tx))
        .unwrap();

    connection.start().await.unwrap();
    for handle in [&level, &system] {
        tokio::time::timeout(Duration::from_secs(2), handle.wait_until_subscribed())
            .await
            .unwrap();
    }

    let session = connection.session();
    session.inject_message(InboundMessage::new("$SYS/broker/uptime", "42"));
    session.inject_message(InboundMessage::new("plant/tank/pressure", "1.2"));
    session.inject_message(InboundMessage::new("plant/tank/level", "55"));

    assert_eq!(recv_within(&mut system_rx).await.0, "plant/tank/pressure");
    assert_eq!(recv_within(&mut system_rx).await.0, "plant/tank/level");
    assert_eq!(recv_within(&mut level_rx).await.0, "plant/tank/level");

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(system_rx.try_recv().is_err(), "$-topics must not match '#'");
    assert!(level_rx.try_recv().is_err());

    connection.stop().await;
}

#[tokio::test]
async fn test_stop_cancels_running_handlers() {
    let connection = mock_connection();
    let handle = connection.subscribe("slow/#", StuckHandler).unwrap();

    connection.start().await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle.wait_until_subscribed())
        .await
        .unwrap();

    connection
        .session()
        .inject_message(InboundMessage::new("slow/job", "x"));
    wait_until(|| connection.metrics().dispatch.handlers_dispatched == 1).await;

    tokio::time::timeout(Duration::from_secs(3), connection.stop())
        .await
        .expect("stop must not wait for stuck handlers");
    assert_eq!(connection.metrics().dispatch.handler_failures, 0);
}
