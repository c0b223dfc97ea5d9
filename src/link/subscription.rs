//! Subscription registry and the batching loop
//!
//! Registrations are queued as commands. The batching loop waits for the
//! first command, lets more arrive during the batch window, activates every
//! new registration and then sends one subscribe request covering the
//! distinct patterns of the whole active set. A reconnect posts
//! `ResubscribeAll`, which runs the same cycle without adding anything.

use crate::error::{sanitize_error_message, LinkError, LinkResult};
use crate::link::handlers::{MessageHandler, SubscribedEvent, SubscribedHandler};
use crate::link::state::ConnectivityGate;
use crate::link::topic::{topic_matches, validate_filter};
use crate::observability::LinkMetrics;
use crate::transport::{SessionHandle, SubscribeOutcome, SubscribeResultCode};
use arc_swap::ArcSwap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn, Instrument};

/// One caller's interest in a pattern
pub struct Subscription {
    id: u64,
    pattern: String,
    on_message: Arc<dyn MessageHandler>,
    on_subscribed: Option<Arc<dyn SubscribedHandler>>,
    subscribed: watch::Sender<bool>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_subscribed(&self) -> bool {
        *self.subscribed.borrow()
    }

    pub(crate) fn message_handler(&self) -> Arc<dyn MessageHandler> {
        self.on_message.clone()
    }

    fn mark_subscribed(&self, granted: bool) {
        self.subscribed.send_replace(granted);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .field("subscribed", &self.is_subscribed())
            .finish()
    }
}

/// Caller's view of a registered subscription
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    subscription: Arc<Subscription>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.subscription.id
    }

    pub fn pattern(&self) -> &str {
        &self.subscription.pattern
    }

    /// True once the broker granted the pattern in the latest answer
    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_subscribed()
    }

    /// Wait until the broker has granted the pattern
    pub async fn wait_until_subscribed(&self) {
        let mut rx = self.subscription.subscribed.subscribe();
        // The sender lives as long as the subscription, so this only ends on success.
        let _ = rx.wait_for(|granted| *granted).await.map(|_| ());
    }
}

/// Work items for the batching loop
#[derive(Debug)]
pub enum RegistryCommand {
    Register(Arc<Subscription>),
    ResubscribeAll,
}

/// Timing for the batching loop
#[derive(Debug, Clone, Copy)]
pub struct BatchSettings {
    pub batch_delay: Duration,
    pub operation_timeout: Duration,
    /// Upper bound for one confirmation handler
    pub handler_timeout: Duration,
}

pub struct SubscriptionRegistry {
    tx: mpsc::UnboundedSender<RegistryCommand>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<RegistryCommand>>>,
    /// Copy-on-write; written only by the batching loop
    active: ArcSwap<Vec<Arc<Subscription>>>,
    next_id: AtomicU64,
    metrics: Arc<LinkMetrics>,
}

impl SubscriptionRegistry {
    pub fn new(metrics: Arc<LinkMetrics>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            active: ArcSwap::from_pointee(Vec::new()),
            next_id: AtomicU64::new(1),
            metrics,
        }
    }

    /// Queue a registration; the broker hears about it on the next batch
    pub fn register(
        &self,
        pattern: &str,
        on_message: Arc<dyn MessageHandler>,
        on_subscribed: Option<Arc<dyn SubscribedHandler>>,
    ) -> LinkResult<SubscriptionHandle> {
        validate_filter(pattern)
            .map_err(|e| LinkError::invalid_topic_filter(pattern, e.to_string()))?;

        let (subscribed, _) = watch::channel(false);
        let subscription = Arc::new(Subscription {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            pattern: pattern.to_string(),
            on_message,
            on_subscribed,
            subscribed,
        });

        self.tx
            .send(RegistryCommand::Register(subscription.clone()))
            .map_err(|_| LinkError::internal("subscription registry is shut down"))?;
        self.metrics.subscription_registered();
        debug!(subscription_id = subscription.id, pattern, "Subscription registered");

        Ok(SubscriptionHandle { subscription })
    }

    /// Force a subscribe cycle over the whole active set
    pub fn request_resubscribe(&self) {
        if self.tx.send(RegistryCommand::ResubscribeAll).is_err() {
            debug!("Subscription registry is shut down, ignoring resubscribe");
        }
    }

    /// Lock-free snapshot of the active set
    pub fn active(&self) -> Arc<Vec<Arc<Subscription>>> {
        self.active.load_full()
    }

    /// Active subscriptions whose pattern matches `topic`
    pub fn matching(&self, topic: &str) -> Vec<Arc<Subscription>> {
        self.active
            .load()
            .iter()
            .filter(|subscription| topic_matches(&subscription.pattern, topic))
            .cloned()
            .collect()
    }

    fn activate(&self, subscription: Arc<Subscription>) {
        self.active.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(subscription.clone());
            next
        });
    }

    /// Activate queued registrations without running the batching loop
    #[cfg(test)]
    pub(crate) fn activate_pending_for_tests(&self) {
        if let Ok(mut guard) = self.rx.try_lock() {
            if let Some(rx) = guard.as_mut() {
                while let Ok(command) = rx.try_recv() {
                    self.accept(command);
                }
            }
        }
    }

    /// Run batching cycles until `cancel` fires
    pub async fn run_batching_loop<S: SessionHandle>(
        self: Arc<Self>,
        session: Arc<S>,
        gate: Arc<ConnectivityGate>,
        settings: BatchSettings,
        cancel: CancellationToken,
    ) {
        let Some(mut rx) = self.rx.lock().await.take() else {
            warn!("Subscription batching loop already running");
            return;
        };
        info!("Subscription batching loop started");

        loop {
            let first = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                command = rx.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            let mut registered = self.accept(first);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(settings.batch_delay) => {}
            }

            while let Ok(command) = rx.try_recv() {
                registered += self.accept(command);
            }

            if !gate.is_connected() {
                debug!(
                    registered,
                    "Not connected, deferring subscribe until the next reconnect"
                );
                continue;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.submit_batch(session.as_ref(), &settings) => {}
            }
        }

        info!("Subscription batching loop stopped");
    }

    /// Activate a registration; returns how many were added
    fn accept(&self, command: RegistryCommand) -> usize {
        match command {
            RegistryCommand::Register(subscription) => {
                trace!(pattern = %subscription.pattern, "Activating subscription");
                self.activate(subscription);
                1
            }
            RegistryCommand::ResubscribeAll => 0,
        }
    }

    /// One subscribe request for every distinct active pattern, then
    /// confirmations
    async fn submit_batch<S: SessionHandle>(&self, session: &S, settings: &BatchSettings) {
        let snapshot = self.active.load_full();
        let patterns = distinct_patterns(&snapshot);
        if patterns.is_empty() {
            trace!("No active subscriptions to submit");
            return;
        }

        let span = crate::subscription_span!(patterns = patterns.len());
        self.metrics.subscribe_request();
        debug!(parent: &span, "Subscribing to {} pattern(s): {:?}", patterns.len(), patterns);

        let outcomes = match session
            .subscribe(&patterns, settings.operation_timeout)
            .instrument(span.clone())
            .await
        {
            Ok(outcomes) => outcomes,
            Err(e) => {
                self.metrics.subscribe_failed();
                warn!(
                    parent: &span,
                    "Batched subscribe failed, will retry on next cycle: {}",
                    sanitize_error_message(&e.to_string())
                );
                return;
            }
        };

        let verdicts = self.log_outcomes(&outcomes);
        for subscription in snapshot.iter() {
            if let Some(code) = verdicts.get(subscription.pattern.as_str()) {
                subscription.mark_subscribed(code.is_granted());
            }
        }

        self.notify_confirmations(&snapshot, &verdicts, settings.handler_timeout)
            .instrument(span)
            .await;
    }

    fn log_outcomes<'a>(&self, outcomes: &'a [SubscribeOutcome]) -> HashMap<&'a str, &'a SubscribeResultCode> {
        let mut verdicts = HashMap::with_capacity(outcomes.len());
        for outcome in outcomes {
            match &outcome.code {
                SubscribeResultCode::Granted(qos) => {
                    debug!(pattern = %outcome.pattern, "Subscribed with QoS {}", qos.level());
                }
                SubscribeResultCode::Rejected(reason) => {
                    self.metrics.pattern_rejected();
                    warn!(pattern = %outcome.pattern, "Broker rejected subscription: {}", reason);
                }
            }
            verdicts.insert(outcome.pattern.as_str(), &outcome.code);
        }
        verdicts
    }

    /// Run every confirmation handler concurrently, each bounded by
    /// `handler_timeout`; failures are logged
    async fn notify_confirmations(
        &self,
        snapshot: &[Arc<Subscription>],
        verdicts: &HashMap<&str, &SubscribeResultCode>,
        handler_timeout: Duration,
    ) {
        let mut handlers = JoinSet::new();
        for subscription in snapshot {
            let (Some(handler), Some(code)) = (
                subscription.on_subscribed.clone(),
                verdicts.get(subscription.pattern.as_str()),
            ) else {
                continue;
            };
            let event = SubscribedEvent {
                pattern: subscription.pattern.clone(),
                result: (*code).clone(),
            };
            let subscription_id = subscription.id;
            handlers.spawn(async move {
                let result = tokio::time::timeout(handler_timeout, handler.on_subscribed(event)).await;
                (subscription_id, result)
            });
        }

        while let Some(joined) = handlers.join_next().await {
            match joined {
                Ok((_, Ok(Ok(())))) => {}
                Ok((subscription_id, Ok(Err(e)))) => {
                    warn!(subscription_id, "Subscription confirmation handler failed: {}", e);
                }
                Ok((subscription_id, Err(_))) => {
                    warn!(
                        subscription_id,
                        "Subscription confirmation handler timed out after {:?}", handler_timeout
                    );
                }
                Err(e) => warn!("Subscription confirmation handler panicked: {}", e),
            }
        }
    }
}

/// Distinct patterns in first-registration order
pub fn distinct_patterns(subscriptions: &[Arc<Subscription>]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(subscriptions.len());
    subscriptions
        .iter()
        .filter(|subscription| seen.insert(subscription.pattern.as_str()))
        .map(|subscription| subscription.pattern.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::handlers::HandlerResult;
    use crate::link::state::ConnectionEvent;
    use crate::testing::MockSession;
    use crate::transport::InboundMessage;
    use async_trait::async_trait;

    struct NoopHandler;

    #[async_trait]
    impl MessageHandler for NoopHandler {
        async fn on_message(&self, _message: InboundMessage) -> HandlerResult {
            Ok(())
        }
    }

    fn settings() -> BatchSettings {
        BatchSettings {
            batch_delay: Duration::from_millis(30),
            operation_timeout: Duration::from_secs(1),
            handler_timeout: Duration::from_secs(1),
        }
    }

    fn registry() -> Arc<SubscriptionRegistry> {
        Arc::new(SubscriptionRegistry::new(Arc::new(LinkMetrics::new())))
    }

    #[test]
    fn test_register_rejects_invalid_filters() {
        let registry = registry();
        let err = registry
            .register("sensors/#/temp", Arc::new(NoopHandler), None)
            .unwrap_err();
        assert!(matches!(err, LinkError::InvalidTopicFilter { .. }));
    }

    #[test]
    fn test_distinct_patterns_preserve_first_seen_order() {
        let registry = registry();
        for pattern in ["b/#", "a/+", "b/#", "c", "a/+"] {
            let handle = registry.register(pattern, Arc::new(NoopHandler), None).unwrap();
            registry.activate(handle.subscription.clone());
        }

        assert_eq!(distinct_patterns(&registry.active()), vec!["b/#", "a/+", "c"]);
    }

    #[test]
    fn test_matching_uses_wildcards() {
        let registry = registry();
        for pattern in ["sensors/#", "sensors/+/value", "actuators/#"] {
            let handle = registry.register(pattern, Arc::new(NoopHandler), None).unwrap();
            registry.activate(handle.subscription.clone());
        }

        let patterns: Vec<String> = registry
            .matching("sensors/temp/value")
            .iter()
            .map(|s| s.pattern().to_string())
            .collect();
        assert_eq!(patterns, vec!["sensors/#", "sensors/+/value"]);
    }

    #[tokio::test]
    async fn test_registrations_within_window_share_one_request() {
        let registry = registry();
        let session = Arc::new(MockSession::new());
        session.set_connected(true);
        let gate = Arc::new(ConnectivityGate::new());
        gate.apply(ConnectionEvent::SessionConnected);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(registry.clone().run_batching_loop(
            session.clone(),
            gate,
            settings(),
            cancel.clone(),
        ));

        let first = registry.register("sensors/#", Arc::new(NoopHandler), None).unwrap();
        let second = registry.register("sensors/#", Arc::new(NoopHandler), None).unwrap();
        let third = registry.register("alerts/+", Arc::new(NoopHandler), None).unwrap();

        tokio::time::timeout(Duration::from_secs(2), first.wait_until_subscribed())
            .await
            .unwrap();
        assert!(second.is_subscribed());
        assert!(third.is_subscribed());

        assert_eq!(
            session.subscribe_calls().await,
            vec![vec!["sensors/#".to_string(), "alerts/+".to_string()]]
        );

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnected_registrations_stay_active() {
        let registry = registry();
        let session = Arc::new(MockSession::new());
        let gate = Arc::new(ConnectivityGate::new());

        let cancel = CancellationToken::new();
        let task = tokio::spawn(registry.clone().run_batching_loop(
            session.clone(),
            gate.clone(),
            settings(),
            cancel.clone(),
        ));

        let handle = registry.register("sensors/#", Arc::new(NoopHandler), None).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(session.subscribe_calls().await.is_empty());
        assert!(!handle.is_subscribed());
        assert_eq!(registry.active().len(), 1);

        // Reconnect replays the active set
        session.set_connected(true);
        gate.apply(ConnectionEvent::SessionConnected);
        registry.request_resubscribe();

        tokio::time::timeout(Duration::from_secs(2), handle.wait_until_subscribed())
            .await
            .unwrap();
        assert_eq!(
            session.subscribe_calls().await,
            vec![vec!["sensors/#".to_string()]]
        );

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_confirmation_handlers_see_rejections() {
        let registry = registry();
        let session = Arc::new(MockSession::new());
        session.set_connected(true);
        session.reject_pattern("forbidden/#").await;
        let gate = Arc::new(ConnectivityGate::new());
        gate.apply(ConnectionEvent::SessionConnected);

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let confirm = move |event: SubscribedEvent| {
            let events_tx = events_tx.clone();
            async move {
                let _ = events_tx.send(event);
                let result: HandlerResult = Ok(());
                result
            }
        };

        let cancel = CancellationToken::new();
        let task = tokio::spawn(registry.clone().run_batching_loop(
            session.clone(),
            gate,
            settings(),
            cancel.clone(),
        ));

        let allowed = registry
            .register("sensors/#", Arc::new(NoopHandler), Some(Arc::new(confirm.clone())))
            .unwrap();
        let forbidden = registry
            .register("forbidden/#", Arc::new(NoopHandler), Some(Arc::new(confirm)))
            .unwrap();

        let mut events = Vec::new();
        for _ in 0..2 {
            let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
                .await
                .unwrap()
                .unwrap();
            events.push(event);
        }
        events.sort_by(|a, b| a.pattern.cmp(&b.pattern));

        assert_eq!(events[0].pattern, "forbidden/#");
        assert!(!events[0].result.is_granted());
        assert_eq!(events[1].pattern, "sensors/#");
        assert!(events[1].result.is_granted());

        assert!(allowed.is_subscribed());
        assert!(!forbidden.is_subscribed());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_hung_confirmation_handler_does_not_stall_batching() {
        let registry = registry();
        let session = Arc::new(MockSession::new());
        session.set_connected(true);
        let gate = Arc::new(ConnectivityGate::new());
        gate.apply(ConnectionEvent::SessionConnected);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(registry.clone().run_batching_loop(
            session.clone(),
            gate,
            BatchSettings {
                handler_timeout: Duration::from_millis(50),
                ..settings()
            },
            cancel.clone(),
        ));

        let hung = |_event: SubscribedEvent| async move {
            std::future::pending::<()>().await;
            HandlerResult::Ok(())
        };
        let first = registry
            .register("sensors/#", Arc::new(NoopHandler), Some(Arc::new(hung)))
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), first.wait_until_subscribed())
            .await
            .unwrap();

        let second = registry.register("alerts/+", Arc::new(NoopHandler), None).unwrap();
        tokio::time::timeout(Duration::from_secs(2), second.wait_until_subscribed())
            .await
            .expect("batching must continue past a hung confirmation handler");
        assert_eq!(session.subscribe_calls().await.len(), 2);

        cancel.cancel();
        task.await.unwrap();
    }
}
