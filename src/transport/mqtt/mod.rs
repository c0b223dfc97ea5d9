//! MQTT v5 session implementation over rumqttc
//!
//! # Architecture
//!
//! - [`connection`] - Pure host parsing, option building and QoS mapping
//! - [`message_handler`] - Pure routing of rumqttc events
//! - [`client`] - The I/O side: event loop task, SubAck and PubAck/PubComp correlation
//!
//! # Usage
//!
//! ```rust,no_run
//! use brokerlink::config::MqttSection;
//! use brokerlink::transport::mqtt::MqttSession;
//! use brokerlink::transport::SessionHandle;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let config = MqttSection {
//!     host: "mqtt://localhost:1883".to_string(),
//!     ..MqttSection::default()
//! };
//!
//! let session = MqttSession::new();
//! session.connect(&config.connect_options()?, config.connect_timeout()).await?;
//! session
//!     .subscribe(&["sensors/#".to_string()], Duration::from_secs(5))
//!     .await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::MqttSession;
pub use connection::{BrokerEndpoint, MqttError, SessionState};
pub use message_handler::{EventRoute, EventRouter};
