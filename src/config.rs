//! Configuration for a broker link
//!
//! Configuration is read from a TOML file with an `[mqtt]` table. Every field
//! has a default, so an empty file (or no file) yields a usable configuration
//! pointing at a local broker. Credentials may be given literally or through
//! environment variables; the environment wins and is resolved at connect time.

use crate::transport::{ConnectOptions, Credentials};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Multiplier applied to the larger of ping interval and keep-alive to bound
/// subscribe and publish round-trips.
const OPERATION_TIMEOUT_FACTOR: f64 = 5.0;

/// Smallest keep-alive rumqttc accepts without panicking.
const MIN_KEEP_ALIVE_SECS: f64 = 5.0;

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LinkConfig {
    #[serde(default)]
    pub mqtt: MqttSection,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker address: `host`, `host:port`, `mqtt://host:port` or `mqtts://host:port`
    #[serde(default = "default_host")]
    pub host: String,
    /// Client identifier presented to the broker
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Optional username/password
    #[serde(default)]
    pub credentials: Option<CredentialsSection>,
    /// Force TLS even when the host string carries no `mqtts://` scheme
    #[serde(default)]
    pub use_tls: bool,
    /// Protocol keep-alive in seconds (default: 60)
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: f64,
    /// Liveness ping interval in seconds (default: 10)
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: f64,
    /// Back-off between publish attempts while disconnected (default: 12)
    #[serde(default = "default_publish_retry_interval")]
    pub publish_retry_interval_secs: f64,
    /// Coalescing window for subscription requests (default: 1)
    #[serde(default = "default_subscription_batch_delay")]
    pub subscription_batch_delay_secs: f64,
    /// Bound on a single connect attempt (default: 10)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: f64,
    /// Bound on the graceful disconnect during stop (default: 5)
    #[serde(default = "default_disconnect_timeout")]
    pub disconnect_timeout_secs: f64,
    /// Upper bound on a single message handler invocation (default: 1800)
    #[serde(default = "default_handler_timeout")]
    pub handler_timeout_secs: f64,
    /// Skip connecting entirely; calls still queue but never drain
    #[serde(default)]
    pub disable_connection: bool,
}

/// Username and password, either literal or looked up in the environment
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CredentialsSection {
    pub user: Option<String>,
    pub pass: Option<String>,
    /// Environment variable containing the username
    pub user_env: Option<String>,
    /// Environment variable containing the password
    pub pass_env: Option<String>,
}

impl std::fmt::Debug for CredentialsSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsSection")
            .field("user", &self.user)
            .field("pass", &self.pass.as_ref().map(|_| "***"))
            .field("user_env", &self.user_env)
            .field("pass_env", &self.pass_env)
            .finish()
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_client_id() -> String {
    format!("{}-{}", env!("CARGO_PKG_NAME"), uuid::Uuid::new_v4().simple())
}

fn default_keep_alive() -> f64 {
    60.0
}

fn default_ping_interval() -> f64 {
    10.0
}

fn default_publish_retry_interval() -> f64 {
    12.0
}

fn default_subscription_batch_delay() -> f64 {
    1.0
}

fn default_connect_timeout() -> f64 {
    10.0
}

fn default_disconnect_timeout() -> f64 {
    5.0
}

fn default_handler_timeout() -> f64 {
    30.0 * 60.0
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            client_id: default_client_id(),
            credentials: None,
            use_tls: false,
            keep_alive_secs: default_keep_alive(),
            ping_interval_secs: default_ping_interval(),
            publish_retry_interval_secs: default_publish_retry_interval(),
            subscription_batch_delay_secs: default_subscription_batch_delay(),
            connect_timeout_secs: default_connect_timeout(),
            disconnect_timeout_secs: default_disconnect_timeout(),
            handler_timeout_secs: default_handler_timeout(),
            disable_connection: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to render TOML: {0}")]
    TomlRender(#[from] toml::ser::Error),
    #[error("Invalid broker host: {0}")]
    InvalidHost(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl LinkConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: LinkConfig = toml::from_str(content)?;
        config.mqtt.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

impl MqttSection {
    /// Reject values the connection cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::InvalidHost("host must not be empty".to_string()));
        }
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "client_id must not be empty".to_string(),
            ));
        }

        let intervals = [
            ("keep_alive_secs", self.keep_alive_secs),
            ("ping_interval_secs", self.ping_interval_secs),
            ("publish_retry_interval_secs", self.publish_retry_interval_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("disconnect_timeout_secs", self.disconnect_timeout_secs),
            ("handler_timeout_secs", self.handler_timeout_secs),
        ];
        for (name, value) in intervals {
            validate_positive(name, value)?;
        }

        // A zero batch window is allowed: each registration is sent on its own.
        if !self.subscription_batch_delay_secs.is_finite() || self.subscription_batch_delay_secs < 0.0
        {
            return Err(ConfigError::InvalidConfig(format!(
                "subscription_batch_delay_secs must be a non-negative number, got {}",
                self.subscription_batch_delay_secs
            )));
        }

        crate::transport::mqtt::connection::parse_host(&self.host, self.use_tls)
            .map_err(|e| ConfigError::InvalidHost(e.to_string()))?;

        Ok(())
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs_f64(self.keep_alive_secs.max(MIN_KEEP_ALIVE_SECS))
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs_f64(self.ping_interval_secs)
    }

    pub fn publish_retry_interval(&self) -> Duration {
        Duration::from_secs_f64(self.publish_retry_interval_secs)
    }

    pub fn subscription_batch_delay(&self) -> Duration {
        Duration::from_secs_f64(self.subscription_batch_delay_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connect_timeout_secs)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.disconnect_timeout_secs)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.handler_timeout_secs)
    }

    /// Bound for subscribe and publish round-trips: `max(ping, keep-alive) * 5`
    pub fn operation_timeout(&self) -> Duration {
        let base = self.ping_interval_secs.max(self.keep_alive_secs);
        Duration::from_secs_f64(base * OPERATION_TIMEOUT_FACTOR)
    }

    /// Resolve credentials, preferring environment variables over literals
    pub fn resolved_credentials(&self) -> Option<Credentials> {
        let section = self.credentials.as_ref()?;
        let user = get_env_var_optional(section.user_env.as_ref()).or_else(|| section.user.clone())?;
        let pass = get_env_var_optional(section.pass_env.as_ref())
            .or_else(|| section.pass.clone())
            .unwrap_or_default();
        Some(Credentials { user, pass })
    }

    /// Build the options handed to the session on every connect attempt
    pub fn connect_options(&self) -> Result<ConnectOptions, ConfigError> {
        let endpoint = crate::transport::mqtt::connection::parse_host(&self.host, self.use_tls)
            .map_err(|e| ConfigError::InvalidHost(e.to_string()))?;
        Ok(ConnectOptions {
            host: endpoint.host,
            port: endpoint.port,
            use_tls: endpoint.use_tls,
            client_id: self.client_id.clone(),
            credentials: self.resolved_credentials(),
            keep_alive: self.keep_alive(),
        })
    }

    /// Fast settings for tests
    #[cfg(test)]
    pub fn test_config() -> Self {
        Self {
            client_id: "test-client".to_string(),
            ping_interval_secs: 0.05,
            publish_retry_interval_secs: 0.02,
            subscription_batch_delay_secs: 0.02,
            connect_timeout_secs: 1.0,
            disconnect_timeout_secs: 1.0,
            ..Self::default()
        }
    }
}

fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
    env_var_name.and_then(|name| std::env::var(name).ok())
}

fn validate_positive(name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidConfig(format!(
            "{name} must be a positive number, got {value}"
        )))
    }
}
