//! Callback traits for inbound messages, subscription confirmations and
//! publish completions
//!
//! Each trait has a blanket impl for async closures, so either a struct or a
//! closure returning a future can be registered.

use crate::link::publish_queue::PublishHandle;
use crate::transport::{InboundMessage, SubscribeResultCode};
use async_trait::async_trait;
use std::future::Future;

/// Error type handlers may return; it is logged and otherwise ignored
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult = Result<(), HandlerError>;

/// Receives messages whose topic matches a subscription pattern
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, message: InboundMessage) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(InboundMessage) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn on_message(&self, message: InboundMessage) -> HandlerResult {
        (self)(message).await
    }
}

/// Broker verdict delivered to a subscription's confirmation handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribedEvent {
    pub pattern: String,
    pub result: SubscribeResultCode,
}

/// Runs each time the broker answers a subscribe covering the pattern
#[async_trait]
pub trait SubscribedHandler: Send + Sync {
    async fn on_subscribed(&self, event: SubscribedEvent) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> SubscribedHandler for F
where
    F: Fn(SubscribedEvent) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn on_subscribed(&self, event: SubscribedEvent) -> HandlerResult {
        (self)(event).await
    }
}

/// Runs exactly once after a queued publish completes
#[async_trait]
pub trait PublishedHandler: Send + Sync {
    async fn on_published(&self, item: PublishHandle) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> PublishedHandler for F
where
    F: Fn(PublishHandle) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn on_published(&self, item: PublishHandle) -> HandlerResult {
        (self)(item).await
    }
}
