//! Resilient broker link
//!
//! [`BrokerConnection`] keeps one broker session alive and layers an ordered
//! publish queue, batched subscriptions and concurrent message dispatch on
//! top of it. Callers never see transient connection failures; they observe
//! results through [`PublishHandle`]s, subscription confirmations and logs.

pub mod broker_connection;
pub mod dispatcher;
pub mod handlers;
pub mod publish_queue;
pub mod state;
pub mod subscription;
pub mod supervisor;
pub mod topic;

pub use broker_connection::BrokerConnection;
pub use dispatcher::Dispatcher;
pub use handlers::{
    HandlerError, HandlerResult, MessageHandler, PublishedHandler, SubscribedEvent,
    SubscribedHandler,
};
pub use publish_queue::{
    JsonPublisher, PublishHandle, PublishOutcome, PublishQueue, Publisher, PublisherError,
    StringPublisher,
};
pub use state::{ConnectionEvent, ConnectionState, ConnectivityGate};
pub use subscription::{SubscriptionHandle, SubscriptionRegistry};
pub use supervisor::{ConnectionSupervisor, SupervisorSettings};
pub use topic::{topic_matches, validate_filter, TopicFilterError};
