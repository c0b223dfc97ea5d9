//! Mock implementations for testing
//!
//! [`MockSession`] is an in-memory [`SessionHandle`] with switches for the
//! failure modes the link has to survive and recorders for what it was asked
//! to do.

use crate::transport::{
    ConnectOptions, InboundMessage, PublishRequest, QualityOfService, SessionError, SessionEvent,
    SessionHandle, SubscribeOutcome, SubscribeResultCode,
};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Mock broker session for testing
#[derive(Debug)]
pub struct MockSession {
    connected: AtomicBool,
    accept_connections: AtomicBool,
    refuse_credentials: AtomicBool,
    drop_during_connect: AtomicBool,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    subscribe_calls: Mutex<Vec<Vec<String>>>,
    publish_attempts: Mutex<Vec<PublishRequest>>,
    published: Mutex<Vec<PublishRequest>>,
    rejected_patterns: Mutex<HashSet<String>>,
    failing_topics: Mutex<HashSet<String>>,
    events: ArcSwapOption<mpsc::UnboundedSender<SessionEvent>>,
}

impl Default for MockSession {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSession {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            accept_connections: AtomicBool::new(true),
            refuse_credentials: AtomicBool::new(false),
            drop_during_connect: AtomicBool::new(false),
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            subscribe_calls: Mutex::new(Vec::new()),
            publish_attempts: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            rejected_patterns: Mutex::new(HashSet::new()),
            failing_topics: Mutex::new(HashSet::new()),
            events: ArcSwapOption::empty(),
        }
    }

    /// Flip the session state without any notification
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// When false, connect attempts fail like an unreachable broker
    pub fn set_accept_connections(&self, accept: bool) {
        self.accept_connections.store(accept, Ordering::SeqCst);
    }

    /// When true, connect attempts fail like a broker refusing the client
    pub fn set_refuse_credentials(&self, refuse: bool) {
        self.refuse_credentials.store(refuse, Ordering::SeqCst);
    }

    /// When true, the broker acknowledges a connect and kicks the client
    /// before the attempt returns
    pub fn set_drop_during_connect(&self, drop: bool) {
        self.drop_during_connect.store(drop, Ordering::SeqCst);
    }

    pub async fn reject_pattern(&self, pattern: &str) {
        self.rejected_patterns
            .lock()
            .await
            .insert(pattern.to_string());
    }

    /// Publishes to `topic` are rejected by the "broker"
    pub async fn fail_topic(&self, topic: &str) {
        self.failing_topics.lock().await.insert(topic.to_string());
    }

    /// Simulate the broker closing the session
    pub fn drop_connection(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        self.emit(SessionEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    pub fn emit_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.emit(SessionEvent::Connected);
    }

    /// Deliver a message as if the broker had sent it
    pub fn inject_message(&self, message: InboundMessage) {
        self.emit(SessionEvent::MessageReceived(message));
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    /// Patterns of every subscribe request, one entry per request
    pub async fn subscribe_calls(&self) -> Vec<Vec<String>> {
        self.subscribe_calls.lock().await.clone()
    }

    /// Messages the "broker" accepted, in order
    pub async fn published(&self) -> Vec<PublishRequest> {
        self.published.lock().await.clone()
    }

    /// Every publish attempt, including failed ones
    pub async fn publish_attempts(&self) -> usize {
        self.publish_attempts.lock().await.len()
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(sender) = self.events.load_full() {
            let _ = sender.send(event);
        }
    }
}

#[async_trait]
impl SessionHandle for MockSession {
    async fn connect(
        &self,
        options: &ConnectOptions,
        _timeout: Duration,
    ) -> Result<(), SessionError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);

        if self.refuse_credentials.load(Ordering::SeqCst) {
            return Err(SessionError::ConnectionRefused(format!(
                "not authorized: {}",
                options.client_id
            )));
        }
        if !self.accept_connections.load(Ordering::SeqCst) {
            return Err(SessionError::ConnectFailed(format!(
                "connection refused by {}:{}",
                options.host, options.port
            )));
        }

        self.emit_connected();
        if self.drop_during_connect.load(Ordering::SeqCst) {
            self.drop_connection("kicked");
        }
        Ok(())
    }

    async fn disconnect(&self, _reason: &str, _timeout: Duration) -> Result<(), SessionError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&self, _timeout: Duration) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(
        &self,
        patterns: &[String],
        _timeout: Duration,
    ) -> Result<Vec<SubscribeOutcome>, SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        self.subscribe_calls.lock().await.push(patterns.to_vec());

        let rejected = self.rejected_patterns.lock().await;
        Ok(patterns
            .iter()
            .map(|pattern| SubscribeOutcome {
                pattern: pattern.clone(),
                code: if rejected.contains(pattern) {
                    SubscribeResultCode::Rejected("not authorized".to_string())
                } else {
                    SubscribeResultCode::Granted(QualityOfService::AtLeastOnce)
                },
            })
            .collect())
    }

    async fn publish(
        &self,
        request: &PublishRequest,
        _timeout: Duration,
    ) -> Result<(), SessionError> {
        self.publish_attempts.lock().await.push(request.clone());

        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        if self.failing_topics.lock().await.contains(&request.topic) {
            return Err(SessionError::Rejected(format!(
                "publish to '{}' not authorized",
                request.topic
            )));
        }

        self.published.lock().await.push(request.clone());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn set_event_sender(&self, sender: mpsc::UnboundedSender<SessionEvent>) {
        self.events.store(Some(Arc::new(sender)));
    }
}
