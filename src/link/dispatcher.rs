//! Fan-out of inbound messages
//!
//! Every matching subscription gets its own task. A slow, failing or
//! panicking handler never delays the others or the receive path; each one is
//! bounded by the handler timeout and by shutdown.

use crate::link::subscription::SubscriptionRegistry;
use crate::observability::LinkMetrics;
use crate::transport::InboundMessage;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// How one handler invocation ended
#[derive(Debug)]
enum HandlerExit {
    Completed,
    Failed(String),
    TimedOut,
    Cancelled,
}

pub struct Dispatcher {
    registry: Arc<SubscriptionRegistry>,
    handler_timeout: Duration,
    cancel: CancellationToken,
    metrics: Arc<LinkMetrics>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        handler_timeout: Duration,
        cancel: CancellationToken,
        metrics: Arc<LinkMetrics>,
    ) -> Self {
        Self {
            registry,
            handler_timeout,
            cancel,
            metrics,
        }
    }

    /// Start every matching handler and return how many were started
    ///
    /// Returns without waiting for the handlers.
    pub fn dispatch(&self, message: InboundMessage) -> usize {
        self.metrics.message_received();

        let matching = self.registry.matching(&message.topic);
        if matching.is_empty() {
            debug!(topic = %message.topic, "No subscription matches inbound message");
            return 0;
        }

        let mut handlers = JoinSet::new();
        for subscription in &matching {
            let handler = subscription.message_handler();
            let message = message.clone();
            let cancel = self.cancel.clone();
            let timeout = self.handler_timeout;
            let subscription_id = subscription.id();
            let pattern = subscription.pattern().to_string();

            handlers.spawn(async move {
                let exit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => HandlerExit::Cancelled,
                    result = tokio::time::timeout(timeout, handler.on_message(message)) => match result {
                        Ok(Ok(())) => HandlerExit::Completed,
                        Ok(Err(e)) => HandlerExit::Failed(e.to_string()),
                        Err(_) => HandlerExit::TimedOut,
                    },
                };
                (subscription_id, pattern, exit)
            });
        }

        let count = matching.len();
        self.metrics.handlers_dispatched(count);
        trace!(topic = %message.topic, handlers = count, "Dispatched inbound message");

        tokio::spawn(Self::supervise(
            handlers,
            message.topic,
            self.handler_timeout,
            self.metrics.clone(),
        ));
        count
    }

    /// Log how each handler ended
    async fn supervise(
        mut handlers: JoinSet<(u64, String, HandlerExit)>,
        topic: String,
        timeout: Duration,
        metrics: Arc<LinkMetrics>,
    ) {
        while let Some(joined) = handlers.join_next().await {
            match joined {
                Ok((_, _, HandlerExit::Completed)) => {}
                Ok((subscription_id, pattern, HandlerExit::Failed(reason))) => {
                    metrics.handler_failed();
                    warn!(subscription_id, %pattern, %topic, "Message handler failed: {}", reason);
                }
                Ok((subscription_id, pattern, HandlerExit::TimedOut)) => {
                    metrics.handler_failed();
                    warn!(subscription_id, %pattern, %topic, "Message handler timed out after {:?}", timeout);
                }
                Ok((subscription_id, pattern, HandlerExit::Cancelled)) => {
                    debug!(subscription_id, %pattern, %topic, "Message handler cancelled by shutdown");
                }
                Err(e) => {
                    metrics.handler_failed();
                    warn!(%topic, "Message handler panicked: {}", e);
                }
            }
        }
    }
}
