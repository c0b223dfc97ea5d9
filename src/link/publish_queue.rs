//! Ordered outbound queue
//!
//! `enqueue` never blocks. A single drain loop hands items to the session in
//! arrival order. While the gate says disconnected, the head item is held
//! back and retried after the retry interval; nothing behind it may overtake
//! it. A broker rejection while connected is final for that item.

use crate::link::handlers::PublishedHandler;
use crate::link::state::ConnectivityGate;
use crate::observability::LinkMetrics;
use crate::transport::{PublishRequest, QualityOfService, SessionHandle};
use crate::error::sanitize_error_message;
use bytes::Bytes;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument};

#[derive(Debug, Error)]
pub enum PublisherError {
    #[error("Failed to serialize payload for '{topic}'")]
    Serialization {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Something that can produce an outbound message when its turn comes
pub trait Publisher: Send + Sync {
    fn topic(&self) -> &str;

    fn build(&self) -> Result<PublishRequest, PublisherError>;
}

impl Publisher for PublishRequest {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn build(&self) -> Result<PublishRequest, PublisherError> {
        Ok(self.clone())
    }
}

/// UTF-8 text payload; exactly-once and not retained unless changed
#[derive(Debug, Clone)]
pub struct StringPublisher {
    topic: String,
    payload: String,
    qos: QualityOfService,
    retain: bool,
}

impl StringPublisher {
    pub fn new<T: Into<String>, P: Into<String>>(topic: T, payload: P) -> Self {
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

impl Publisher for StringPublisher {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn build(&self) -> Result<PublishRequest, PublisherError> {
        Ok(PublishRequest {
            topic: self.topic.clone(),
            payload: Bytes::from(self.payload.clone()),
            qos: self.qos,
            retain: self.retain,
        })
    }
}

/// JSON payload serialized when the item reaches the head of the queue
#[derive(Debug, Clone)]
pub struct JsonPublisher<T> {
    topic: String,
    value: T,
    qos: QualityOfService,
    retain: bool,
}

impl<T: Serialize + Send + Sync> JsonPublisher<T> {
    pub fn new<S: Into<String>>(topic: S, value: T) -> Self {
        Self {
            topic: topic.into(),
            value,
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

impl<T: Serialize + Send + Sync> Publisher for JsonPublisher<T> {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn build(&self) -> Result<PublishRequest, PublisherError> {
        let payload =
            serde_json::to_vec(&self.value).map_err(|source| PublisherError::Serialization {
                topic: self.topic.clone(),
                source,
            })?;
        Ok(PublishRequest {
            topic: self.topic.clone(),
            payload: Bytes::from(payload),
            qos: self.qos,
            retain: self.retain,
        })
    }
}

/// Final result of one queued item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    Failed { reason: String },
}

impl PublishOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Published)
    }

    fn failed<S: Into<String>>(reason: S) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

struct PublishItem {
    id: u64,
    publisher: Box<dyn Publisher>,
    on_published: Option<Arc<dyn PublishedHandler>>,
    result: watch::Sender<Option<PublishOutcome>>,
    enqueued_at: Instant,
}

/// Caller's view of a queued publish
#[derive(Clone)]
pub struct PublishHandle {
    item: Arc<PublishItem>,
}

impl std::fmt::Debug for PublishHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishHandle")
            .field("id", &self.item.id)
            .field("topic", &self.topic())
            .field("result", &self.result())
            .finish()
    }
}

impl PublishHandle {
    pub fn id(&self) -> u64 {
        self.item.id
    }

    pub fn topic(&self) -> &str {
        self.item.publisher.topic()
    }

    /// `None` until the item has been attempted
    pub fn result(&self) -> Option<PublishOutcome> {
        self.item.result.borrow().clone()
    }

    pub fn is_completed(&self) -> bool {
        self.item.result.borrow().is_some()
    }

    pub fn is_published(&self) -> bool {
        matches!(*self.item.result.borrow(), Some(PublishOutcome::Published))
    }

    /// Time spent waiting in the queue so far
    pub fn queued_for(&self) -> Duration {
        self.item.enqueued_at.elapsed()
    }

    /// Wait until the item has an outcome
    pub async fn wait_completed(&self) -> PublishOutcome {
        let mut rx = self.item.result.subscribe();
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|result| (*result).clone());
        outcome.unwrap_or_else(|| PublishOutcome::failed("publish queue dropped"))
    }
}

/// Timing for the drain loop
#[derive(Debug, Clone, Copy)]
pub struct DrainSettings {
    pub retry_interval: Duration,
    pub operation_timeout: Duration,
    /// Upper bound for one completion handler
    pub handler_timeout: Duration,
}

pub struct PublishQueue {
    tx: mpsc::UnboundedSender<Arc<PublishItem>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<PublishItem>>>>,
    next_id: AtomicU64,
    metrics: Arc<LinkMetrics>,
}

impl PublishQueue {
    pub fn new(metrics: Arc<LinkMetrics>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            next_id: AtomicU64::new(1),
            metrics,
        }
    }

    /// Append an item and return its handle immediately
    pub fn enqueue(
        &self,
        publisher: Box<dyn Publisher>,
        on_published: Option<Arc<dyn PublishedHandler>>,
    ) -> PublishHandle {
        let (result, _) = watch::channel(None);
        let item = Arc::new(PublishItem {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            publisher,
            on_published,
            result,
            enqueued_at: Instant::now(),
        });
        let handle = PublishHandle { item: item.clone() };

        self.metrics.publish_queued();
        trace!(item_id = item.id, topic = %handle.topic(), "Publish queued");

        if let Err(mpsc::error::SendError(item)) = self.tx.send(item) {
            warn!(item_id = item.id, "Publish queue closed, dropping item");
            self.finish_detached(item, PublishOutcome::failed("publish queue closed"));
        }
        handle
    }

    /// Drain items in order until `cancel` fires
    pub async fn run_drain_loop<S: SessionHandle>(
        self: Arc<Self>,
        session: Arc<S>,
        gate: Arc<ConnectivityGate>,
        settings: DrainSettings,
        cancel: CancellationToken,
    ) {
        let Some(mut rx) = self.rx.lock().await.take() else {
            warn!("Publish drain loop already running");
            return;
        };
        info!("Publish queue drain loop started");

        // Head item held back while disconnected
        let mut stalled: Option<Arc<PublishItem>> = None;
        let mut announced_stall: Option<u64> = None;

        loop {
            let item = match stalled.take() {
                Some(item) => item,
                None => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(item) => item,
                        None => break,
                    },
                },
            };

            if !gate.is_connected() {
                self.note_stall(&item, &mut announced_stall);
                stalled = Some(item);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(settings.retry_interval) => continue,
                }
            }

            let request = match item.publisher.build() {
                Ok(request) => request,
                Err(e) => {
                    warn!(item_id = item.id, "Cannot build publish: {}", e);
                    self.finish(&item, PublishOutcome::failed(e.to_string()), settings.handler_timeout)
                        .await;
                    continue;
                }
            };

            let span = crate::publish_span!(item_id = item.id, topic = %request.topic);
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.finish(
                        &item,
                        PublishOutcome::failed("stopped while publishing"),
                        settings.handler_timeout,
                    )
                    .await;
                    break;
                }
                result = session.publish(&request, settings.operation_timeout).instrument(span) => result,
            };

            match attempt {
                Ok(()) => {
                    announced_stall = None;
                    self.finish(&item, PublishOutcome::Published, settings.handler_timeout)
                        .await;
                }
                Err(e) if e.is_disconnection() => {
                    // Lost the session between the gate check and the attempt
                    self.note_stall(&item, &mut announced_stall);
                    stalled = Some(item);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(settings.retry_interval) => {}
                    }
                }
                Err(e) => {
                    announced_stall = None;
                    let reason = sanitize_error_message(&e.to_string());
                    warn!(item_id = item.id, topic = %request.topic, "Publish failed: {}", reason);
                    self.finish(&item, PublishOutcome::failed(reason), settings.handler_timeout)
                        .await;
                }
            }
        }

        let released = self
            .release_remaining(stalled, &mut rx, settings.handler_timeout)
            .await;
        info!(
            "Publish queue drain loop stopped ({} unsent items released)",
            released
        );
    }

    /// Fail every queued item when no drain loop ever took the queue
    ///
    /// Returns the number of items released; zero once a drain loop has run.
    pub async fn release_undrained(&self, handler_timeout: Duration) -> usize {
        let Some(mut rx) = self.rx.lock().await.take() else {
            return 0;
        };
        let released = self.release_remaining(None, &mut rx, handler_timeout).await;
        if released > 0 {
            info!("Publish queue never drained ({} unsent items released)", released);
        }
        released
    }

    fn note_stall(&self, item: &PublishItem, announced_stall: &mut Option<u64>) {
        self.metrics.publish_stalled();
        if *announced_stall == Some(item.id) {
            trace!(item_id = item.id, "Still waiting for connection");
        } else {
            warn!(
                item_id = item.id,
                topic = %item.publisher.topic(),
                "Publish queue: client is disconnected, waiting for connection"
            );
            *announced_stall = Some(item.id);
        }
    }

    /// Fail everything still queued so waiting callers are released
    async fn release_remaining(
        &self,
        stalled: Option<Arc<PublishItem>>,
        rx: &mut mpsc::UnboundedReceiver<Arc<PublishItem>>,
        handler_timeout: Duration,
    ) -> usize {
        rx.close();
        let mut released = 0;
        if let Some(item) = stalled {
            self.finish(
                &item,
                PublishOutcome::failed("connection stopped before publish"),
                handler_timeout,
            )
            .await;
            released += 1;
        }
        while let Ok(item) = rx.try_recv() {
            self.finish(
                &item,
                PublishOutcome::failed("connection stopped before publish"),
                handler_timeout,
            )
            .await;
            released += 1;
        }
        released
    }

    fn record(&self, item: &PublishItem, outcome: &PublishOutcome) {
        match outcome {
            PublishOutcome::Published => {
                self.metrics.publish_succeeded();
                trace!(item_id = item.id, "Published after {:?}", item.enqueued_at.elapsed());
            }
            PublishOutcome::Failed { reason } => {
                self.metrics.publish_failed();
                debug!(item_id = item.id, "Publish completed with failure: {}", reason);
            }
        }
    }

    /// Record the outcome and run the completion handler in its own task,
    /// waiting at most `handler_timeout` for it
    async fn finish(
        &self,
        item: &Arc<PublishItem>,
        outcome: PublishOutcome,
        handler_timeout: Duration,
    ) {
        self.record(item, &outcome);
        item.result.send_replace(Some(outcome));

        if let Some(handler) = item.on_published.clone() {
            let handle = PublishHandle { item: item.clone() };
            let item_id = item.id;
            let task = tokio::spawn(async move { handler.on_published(handle).await });
            let abort = task.abort_handle();
            match tokio::time::timeout(handler_timeout, task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!(item_id, "Publish completion handler failed: {}", e),
                Ok(Err(e)) => warn!(item_id, "Publish completion handler panicked: {}", e),
                Err(_) => {
                    abort.abort();
                    warn!(
                        item_id,
                        "Publish completion handler timed out after {:?}", handler_timeout
                    );
                }
            }
        }
    }

    /// `finish` for callers that cannot await
    fn finish_detached(&self, item: Arc<PublishItem>, outcome: PublishOutcome) {
        self.record(&item, &outcome);
        item.result.send_replace(Some(outcome));

        if let Some(handler) = item.on_published.clone() {
            let handle = PublishHandle { item };
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        if let Err(e) = handler.on_published(handle).await {
                            warn!("Publish completion handler failed: {}", e);
                        }
                    });
                }
                Err(_) => warn!("No runtime available to run publish completion handler"),
            }
        }
    }
}
