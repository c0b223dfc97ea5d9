//! brokerlink - resilient MQTT broker connections
//!
//! A connection manager that keeps a single MQTT session alive across broker
//! restarts and network drops, while giving callers a simple surface:
//! - Ordered publishing that survives disconnects
//! - Deduplicated, batched subscriptions that are replayed on reconnect
//! - Wildcard message dispatch with isolated, concurrent handlers
//! - Connection state and a connected gate callers can await
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use brokerlink::{BrokerConnection, LinkConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LinkConfig::from_toml_str(r#"
//!     [mqtt]
//!     host = "mqtt://localhost:1883"
//!     ping_interval_secs = 5.0
//! "#)?;
//!
//! let connection = BrokerConnection::from_config(config.mqtt)?;
//! connection.start().await?;
//! connection.wait_until_connected(&CancellationToken::new()).await?;
//!
//! let outcome = connection
//!     .publish_json("status/online", serde_json::json!({ "online": true }))
//!     .wait_completed()
//!     .await;
//! println!("publish finished: {:?}", outcome);
//!
//! connection.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod link;
pub mod observability;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, LinkConfig, MqttSection};
pub use error::{LinkError, LinkResult};
pub use link::{
    BrokerConnection, ConnectionState, HandlerResult, MessageHandler, PublishHandle,
    PublishOutcome, Publisher, SubscriptionHandle,
};
pub use transport::{InboundMessage, QualityOfService};
