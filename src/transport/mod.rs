//! Broker session abstraction
//!
//! The link core drives a broker session only through [`SessionHandle`], which
//! lets the production rumqttc session and the in-memory mock be swapped
//! freely. Notifications from the session (connected, disconnected, inbound
//! message) arrive as [`SessionEvent`]s on a channel installed with
//! [`SessionHandle::set_event_sender`].

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mqtt;

/// Delivery guarantee requested for a publish or subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityOfService {
    AtMostOnce,
    AtLeastOnce,
    #[default]
    ExactlyOnce,
}

impl QualityOfService {
    /// Map the numeric MQTT level (0, 1, 2)
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::AtMostOnce),
            1 => Some(Self::AtLeastOnce),
            2 => Some(Self::ExactlyOnce),
            _ => None,
        }
    }

    pub fn level(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
        }
    }
}

/// Username and password presented on connect
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub pass: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("pass", &"***")
            .finish()
    }
}

/// Everything the session needs to open a connection
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub client_id: String,
    pub credentials: Option<Credentials>,
    pub keep_alive: Duration,
}

/// A fully built outbound message
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRequest {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QualityOfService,
    pub retain: bool,
}

impl PublishRequest {
    pub fn new<T: Into<String>, P: Into<Bytes>>(topic: T, payload: P) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QualityOfService::default(),
            retain: false,
        }
    }

    pub fn with_qos(mut self, qos: QualityOfService) -> Self {
        self.qos = qos;
        self
    }

    pub fn retained(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// Broker verdict for one filter of a batched subscribe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeResultCode {
    Granted(QualityOfService),
    Rejected(String),
}

impl SubscribeResultCode {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

/// Per-pattern result of a batched subscribe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOutcome {
    pub pattern: String,
    pub code: SubscribeResultCode,
}

/// A message delivered by the broker
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QualityOfService,
    pub retain: bool,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new<T: Into<String>, P: Into<Bytes>>(topic: T, payload: P) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QualityOfService::AtMostOnce,
            retain: false,
            received_at: Utc::now(),
        }
    }

    /// Payload as text, replacing invalid UTF-8 sequences
    pub fn payload_utf8(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Deserialize the payload as JSON
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Notifications raised by a session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    Disconnected { reason: String },
    MessageReceived(InboundMessage),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Not connected to broker")]
    NotConnected,
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Broker refused connection: {0}")]
    ConnectionRefused(String),
    #[error("Connect failed: {0}")]
    ConnectFailed(String),
    #[error("Broker rejected request: {0}")]
    Rejected(String),
    #[error("Client error")]
    Client(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl SessionError {
    /// True when the failure means "no usable connection" rather than a broker verdict
    pub fn is_disconnection(&self) -> bool {
        matches!(self, Self::NotConnected)
    }

    /// True when retrying with the same settings is pointless until configuration changes
    pub fn is_refusal(&self) -> bool {
        matches!(self, Self::ConnectionRefused(_))
    }
}

/// Boundary to a single broker session
///
/// Implementations must be safe to call from several tasks at once. They do
/// not reconnect on their own; the connection supervisor calls `connect`
/// again after a failed liveness ping.
#[async_trait]
pub trait SessionHandle: Send + Sync + 'static {
    /// Open the session; succeeds once the broker has acknowledged it
    async fn connect(&self, options: &ConnectOptions, timeout: Duration)
        -> Result<(), SessionError>;

    /// Close the session gracefully
    async fn disconnect(&self, reason: &str, timeout: Duration) -> Result<(), SessionError>;

    /// Liveness check; any failure counts as not alive
    async fn ping(&self, timeout: Duration) -> bool;

    /// Register all `patterns` in one request, returning one outcome per pattern
    async fn subscribe(
        &self,
        patterns: &[String],
        timeout: Duration,
    ) -> Result<Vec<SubscribeOutcome>, SessionError>;

    /// Deliver one message; succeeds once the broker has acknowledged it
    /// (QoS 1 and 2) or once it has been written out (QoS 0)
    ///
    /// A session that drops before the acknowledgement reports `NotConnected`.
    async fn publish(&self, request: &PublishRequest, timeout: Duration)
        -> Result<(), SessionError>;

    fn is_connected(&self) -> bool;

    /// Install the channel that receives session notifications
    fn set_event_sender(&self, sender: mpsc::UnboundedSender<SessionEvent>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_levels() {
        for level in 0..=2 {
            let qos = QualityOfService::from_level(level).unwrap();
            assert_eq!(qos.level(), level);
        }
        assert!(QualityOfService::from_level(3).is_none());
        assert_eq!(QualityOfService::default(), QualityOfService::ExactlyOnce);
    }

    #[test]
    fn test_publish_request_defaults() {
        let request = PublishRequest::new("sensors/temp", "21.5");
        assert_eq!(request.qos, QualityOfService::ExactlyOnce);
        assert!(!request.retain);

        let request = request
            .with_qos(QualityOfService::AtLeastOnce)
            .retained(true);
        assert_eq!(request.qos, QualityOfService::AtLeastOnce);
        assert!(request.retain);
    }

    #[test]
    fn test_inbound_message_helpers() {
        let message = InboundMessage::new("sensors/temp", r#"{"celsius": 21.5}"#);
        assert_eq!(message.payload_utf8(), r#"{"celsius": 21.5}"#);

        let value: serde_json::Value = message.json().unwrap();
        assert_eq!(value["celsius"], 21.5);
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials {
            user: "alice".to_string(),
            pass: "hunter2".to_string(),
        };
        assert!(!format!("{creds:?}").contains("hunter2"));
    }

    #[test]
    fn test_error_classification() {
        assert!(SessionError::NotConnected.is_disconnection());
        assert!(!SessionError::Rejected("quota".into()).is_disconnection());
        assert!(SessionError::ConnectionRefused("bad credentials".into()).is_refusal());
        assert!(!SessionError::Timeout(Duration::from_secs(1)).is_refusal());
    }
}
