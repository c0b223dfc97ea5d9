//! Observability for broker links
//!
//! Structured logging setup plus per-connection metrics.

pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{LinkMetrics, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{lifecycle_span, mqtt_span, publish_span, subscription_span};
