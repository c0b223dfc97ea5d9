//! The broker connection facade
//!
//! Owns the session, the connectivity gate, the subscription registry, the
//! publish queue and the background tasks that drive them.
//!
//! ```rust,no_run
//! use brokerlink::config::MqttSection;
//! use brokerlink::link::{BrokerConnection, HandlerResult};
//! use brokerlink::transport::InboundMessage;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let connection = BrokerConnection::from_config(MqttSection::default())?;
//! connection.subscribe("sensors/#", |message: InboundMessage| async move {
//!     println!("{} -> {}", message.topic, message.payload_utf8());
//!     HandlerResult::Ok(())
//! })?;
//!
//! connection.start().await?;
//! connection.wait_until_connected(&CancellationToken::new()).await?;
//! connection.publish_str("sensors/temp", "21.5").wait_completed().await;
//! connection.stop().await;
//! # Ok(())
//! # }
//! ```

use crate::config::MqttSection;
use crate::error::{LinkError, LinkResult};
use crate::link::dispatcher::Dispatcher;
use crate::link::handlers::{MessageHandler, PublishedHandler, SubscribedHandler};
use crate::link::publish_queue::{
    DrainSettings, JsonPublisher, PublishHandle, PublishQueue, Publisher, StringPublisher,
};
use crate::link::state::{ConnectionEvent, ConnectionState, ConnectivityGate};
use crate::link::subscription::{BatchSettings, SubscriptionHandle, SubscriptionRegistry};
use crate::link::supervisor::{ConnectionSupervisor, SupervisorSettings};
use crate::observability::{LinkMetrics, MetricsSnapshot};
use crate::transport::mqtt::MqttSession;
use crate::transport::{SessionEvent, SessionHandle};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Upper bound on joining the background tasks during `stop`
const TASK_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

pub struct BrokerConnection<S: SessionHandle = MqttSession> {
    config: MqttSection,
    session: Arc<S>,
    gate: Arc<ConnectivityGate>,
    registry: Arc<SubscriptionRegistry>,
    queue: Arc<PublishQueue>,
    supervisor: Arc<ConnectionSupervisor<S>>,
    metrics: Arc<LinkMetrics>,
    events: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    started: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BrokerConnection<MqttSession> {
    /// Connection over the rumqttc-backed session
    pub fn from_config(config: MqttSection) -> LinkResult<Self> {
        Self::new(config, MqttSession::new())
    }
}

impl<S: SessionHandle> BrokerConnection<S> {
    /// Validate the configuration and wire the components to `session`
    ///
    /// Nothing talks to the broker until [`start`](Self::start).
    pub fn new(config: MqttSection, session: S) -> LinkResult<Self> {
        config.validate()?;
        let options = config.connect_options()?;

        let session = Arc::new(session);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        session.set_event_sender(events_tx);

        let metrics = Arc::new(LinkMetrics::new());
        let gate = Arc::new(ConnectivityGate::new());
        let supervisor = Arc::new(ConnectionSupervisor::new(
            session.clone(),
            gate.clone(),
            options,
            SupervisorSettings {
                ping_interval: config.ping_interval(),
                connect_timeout: config.connect_timeout(),
            },
            metrics.clone(),
        ));

        Ok(Self {
            registry: Arc::new(SubscriptionRegistry::new(metrics.clone())),
            queue: Arc::new(PublishQueue::new(metrics.clone())),
            config,
            session,
            gate,
            supervisor,
            metrics,
            events: Mutex::new(Some(events_rx)),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Open the connection and start the background loops
    ///
    /// A failed first connect is logged and retried by the liveness loop, so
    /// this only fails when called more than once. A connection is started at
    /// most once: calling this after [`stop`](Self::stop) fails as well.
    pub async fn start(&self) -> LinkResult<()> {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            error!(
                client_id = %self.config.client_id,
                stopped = self.cancel.is_cancelled(),
                "start() called on a broker connection that was already started or stopped"
            );
            return Err(LinkError::AlreadyStarted);
        }

        let span = crate::lifecycle_span!(
            event = "start",
            client_id = %self.config.client_id,
            host = %self.config.host
        );
        self.start_inner().instrument(span).await
    }

    async fn start_inner(&self) -> LinkResult<()> {
        let events = self
            .events
            .lock()
            .await
            .take()
            .ok_or_else(|| LinkError::internal("session event receiver already taken"))?;

        let dispatcher = Arc::new(Dispatcher::new(
            self.registry.clone(),
            self.config.handler_timeout(),
            self.cancel.child_token(),
            self.metrics.clone(),
        ));

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(self.supervisor.clone().run_event_pump(
            events,
            self.registry.clone(),
            dispatcher,
            self.cancel.clone(),
        )));

        if self.config.disable_connection {
            warn!("Broker connection disabled by configuration; publishes will queue without draining");
            return Ok(());
        }

        info!("Starting broker connection");
        if !self.supervisor.try_connect().await {
            info!("Initial connect failed, liveness loop will keep retrying");
        }

        let operation_timeout = self.config.operation_timeout();
        tasks.push(tokio::spawn(
            self.supervisor.clone().run_liveness_loop(self.cancel.clone()),
        ));
        tasks.push(tokio::spawn(self.registry.clone().run_batching_loop(
            self.session.clone(),
            self.gate.clone(),
            BatchSettings {
                batch_delay: self.config.subscription_batch_delay(),
                operation_timeout,
                handler_timeout: self.config.handler_timeout(),
            },
            self.cancel.clone(),
        )));
        tasks.push(tokio::spawn(self.queue.clone().run_drain_loop(
            self.session.clone(),
            self.gate.clone(),
            DrainSettings {
                retry_interval: self.config.publish_retry_interval(),
                operation_timeout,
                handler_timeout: self.config.handler_timeout(),
            },
            self.cancel.clone(),
        )));

        info!(tasks = tasks.len(), "Broker connection started");
        Ok(())
    }

    /// Stop every loop and close the session gracefully
    pub async fn stop(&self) {
        self.stop_with(&CancellationToken::new()).await;
    }

    /// [`stop`](Self::stop) with a caller token that can cut the graceful
    /// disconnect short
    pub async fn stop_with(&self, cancel: &CancellationToken) {
        let span = crate::lifecycle_span!(event = "stop", client_id = %self.config.client_id);
        async {
            info!("Stopping broker connection");

            // A stopped connection cannot be started again
            self.started.store(true, Ordering::Release);
            let was_connected = self.gate.is_connected();
            self.gate.apply(ConnectionEvent::ShutdownRequested);
            self.cancel.cancel();

            if was_connected || self.session.is_connected() {
                let timeout = self.config.disconnect_timeout();
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        warn!("Graceful disconnect cancelled by caller");
                    }
                    result = self.session.disconnect("client stopping", timeout) => {
                        if let Err(e) = result {
                            warn!(
                                "Graceful disconnect failed: {}",
                                crate::error::sanitize_error_message(&e.to_string())
                            );
                        }
                    }
                }
            }

            self.join_tasks().await;
            // Without a drain loop (never started, or connection disabled)
            // queued items would otherwise wait forever.
            self.queue
                .release_undrained(self.config.handler_timeout())
                .await;
            info!("Broker connection stopped");
        }
        .instrument(span)
        .await
    }

    async fn join_tasks(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let abort = task.abort_handle();
            match tokio::time::timeout(TASK_SHUTDOWN_GRACE, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!("Background task ended with error: {}", e),
                Err(_) => {
                    warn!("Background task did not stop in time, aborting");
                    abort.abort();
                }
            }
        }
    }

    /// Queue an outbound message; never blocks
    pub fn publish<P: Publisher + 'static>(&self, publisher: P) -> PublishHandle {
        self.queue.enqueue(Box::new(publisher), None)
    }

    /// Queue an outbound message and run `on_published` once it completes
    pub fn publish_with<P, H>(&self, publisher: P, on_published: H) -> PublishHandle
    where
        P: Publisher + 'static,
        H: PublishedHandler + 'static,
    {
        self.queue
            .enqueue(Box::new(publisher), Some(Arc::new(on_published)))
    }

    pub fn publish_str<T: Into<String>, P: Into<String>>(&self, topic: T, payload: P) -> PublishHandle {
        self.publish(StringPublisher::new(topic, payload))
    }

    pub fn publish_json<T, V>(&self, topic: T, value: V) -> PublishHandle
    where
        T: Into<String>,
        V: Serialize + Send + Sync + 'static,
    {
        self.publish(JsonPublisher::new(topic, value))
    }

    /// Register `handler` for topics matching `pattern`
    ///
    /// The broker is asked on the next batch; registering while disconnected
    /// is fine.
    pub fn subscribe<H: MessageHandler + 'static>(
        &self,
        pattern: &str,
        handler: H,
    ) -> LinkResult<SubscriptionHandle> {
        self.registry.register(pattern, Arc::new(handler), None)
    }

    /// Like [`subscribe`](Self::subscribe), also reporting every broker answer
    /// for the pattern
    pub fn subscribe_with_confirmation<H, C>(
        &self,
        pattern: &str,
        handler: H,
        on_subscribed: C,
    ) -> LinkResult<SubscriptionHandle>
    where
        H: MessageHandler + 'static,
        C: SubscribedHandler + 'static,
    {
        self.registry
            .register(pattern, Arc::new(handler), Some(Arc::new(on_subscribed)))
    }

    pub fn is_connected(&self) -> bool {
        self.gate.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.gate.state()
    }

    /// Resolve once connected; `cancel` aborts the wait with [`LinkError::Cancelled`]
    pub async fn wait_until_connected(&self, cancel: &CancellationToken) -> LinkResult<()> {
        self.gate.wait_until_connected(cancel).await
    }

    /// Started and not yet stopped
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.cancel.is_cancelled()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn config(&self) -> &MqttSection {
        &self.config
    }

    pub fn session(&self) -> &Arc<S> {
        &self.session
    }
}

impl<S: SessionHandle> Drop for BrokerConnection<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Ok(mut tasks) = self.tasks.try_lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        debug!(client_id = %self.config.client_id, "Broker connection dropped");
    }
}
