//! Pure connection configuration for the rumqttc session
//!
//! Host parsing, option building and QoS mapping live here so they can be
//! tested without a broker.

use crate::transport::{ConnectOptions, QualityOfService, SessionError};
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use thiserror::Error;
use url::Url;

const DEFAULT_PORT: u16 = 1883;
const DEFAULT_TLS_PORT: u16 = 8883;

/// Largest packet accepted from or sent to the broker
const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Lifecycle of one rumqttc event loop
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// No event loop has been started
    Idle,
    /// Event loop running, waiting for ConnAck
    AwaitingConnAck,
    /// ConnAck received
    Connected,
    /// Event loop ended with reason
    Closed(String),
}

/// rumqttc-level transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Connection refused by broker: {0}")]
    ConnectionRefused(String),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Invalid broker host: {0}")]
    InvalidBrokerHost(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: SessionState },
    #[error("Connection failed: {0}")]
    ConnectionFailedStr(String),
}

impl From<MqttError> for SessionError {
    fn from(err: MqttError) -> Self {
        match err {
            MqttError::NotConnected { .. } => SessionError::NotConnected,
            MqttError::ConnectionRefused(reason) => SessionError::ConnectionRefused(reason),
            MqttError::ConnectionFailedStr(reason) => SessionError::ConnectFailed(reason),
            MqttError::InvalidBrokerHost(host) => {
                SessionError::ConnectFailed(format!("invalid broker host: {host}"))
            }
            other => SessionError::Client(Box::new(other)),
        }
    }
}

/// Where to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// Parse `host`, `host:port`, `mqtt://host:port` or `mqtts://host:port`
///
/// `force_tls` turns TLS on for plain hosts; an explicit `mqtts://` scheme
/// turns it on regardless.
pub fn parse_host(host: &str, force_tls: bool) -> Result<BrokerEndpoint, MqttError> {
    let trimmed = host.trim();
    if trimmed.is_empty() {
        return Err(MqttError::InvalidBrokerHost(host.to_string()));
    }

    if trimmed.contains("://") {
        let url =
            Url::parse(trimmed).map_err(|_| MqttError::InvalidBrokerHost(host.to_string()))?;
        let use_tls = match url.scheme() {
            "mqtt" | "tcp" => force_tls,
            "mqtts" | "ssl" | "tls" => true,
            _ => return Err(MqttError::InvalidBrokerHost(host.to_string())),
        };
        let hostname = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| MqttError::InvalidBrokerHost(host.to_string()))?;
        let port = url.port().unwrap_or_else(|| default_port(use_tls));
        return Ok(BrokerEndpoint {
            host: hostname.to_string(),
            port,
            use_tls,
        });
    }

    let (hostname, port) = match trimmed.rsplit_once(':') {
        Some((name, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| MqttError::InvalidBrokerHost(host.to_string()))?;
            (name, Some(port))
        }
        None => (trimmed, None),
    };
    if hostname.is_empty() || hostname.contains('/') || hostname.contains(char::is_whitespace) {
        return Err(MqttError::InvalidBrokerHost(host.to_string()));
    }

    Ok(BrokerEndpoint {
        host: hostname.to_string(),
        port: port.unwrap_or_else(|| default_port(force_tls)),
        use_tls: force_tls,
    })
}

fn default_port(use_tls: bool) -> u16 {
    if use_tls {
        DEFAULT_TLS_PORT
    } else {
        DEFAULT_PORT
    }
}

/// Build rumqttc options for one connect attempt
pub fn configure_mqtt_options(options: &ConnectOptions) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(&options.client_id, &options.host, options.port);

    if options.use_tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(credentials) = &options.credentials {
        mqtt_options.set_credentials(&credentials.user, &credentials.pass);
    }

    mqtt_options.set_keep_alive(options.keep_alive);
    mqtt_options.set_max_packet_size(Some(MAX_PACKET_SIZE));

    mqtt_options
}

pub fn to_rumqttc_qos(qos: QualityOfService) -> QoS {
    match qos {
        QualityOfService::AtMostOnce => QoS::AtMostOnce,
        QualityOfService::AtLeastOnce => QoS::AtLeastOnce,
        QualityOfService::ExactlyOnce => QoS::ExactlyOnce,
    }
}

pub fn from_rumqttc_qos(qos: QoS) -> QualityOfService {
    match qos {
        QoS::AtMostOnce => QualityOfService::AtMostOnce,
        QoS::AtLeastOnce => QualityOfService::AtLeastOnce,
        QoS::ExactlyOnce => QualityOfService::ExactlyOnce,
    }
}
