//! rumqttc-backed broker session
//!
//! Each `connect` builds a fresh rumqttc client and spawns a task that polls
//! its event loop. The task ends on the first event loop error or broker
//! disconnect; reconnection is left to the caller. A batched subscribe is
//! correlated with its SubAck through a single outstanding-request slot,
//! which holds because subscribe calls are serialized. Publishes are
//! serialized the same way and complete only once the broker's PubAck
//! (QoS 1) or PubComp (QoS 2) arrives, or once a QoS 0 packet is written.

use super::connection::{configure_mqtt_options, to_rumqttc_qos, MqttError, SessionState};
use super::message_handler::{EventRoute, EventRouter};
use crate::transport::{
    ConnectOptions, PublishRequest, SessionError, SessionEvent, SessionHandle, SubscribeOutcome,
    SubscribeResultCode,
};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::Filter;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, EventLoop};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the request channel between `AsyncClient` and its event loop
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// How long `disconnect` waits for the poll task after sending DISCONNECT
const POLL_TASK_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// QoS requested for every subscription
const SUBSCRIPTION_QOS: QoS = QoS::AtLeastOnce;

/// Outstanding batched subscribe waiting for its SubAck
struct PendingSubscribe {
    reply: oneshot::Sender<Vec<SubscribeResultCode>>,
}

/// Broker verdict for an outstanding publish
#[derive(Debug, PartialEq)]
enum PublishAck {
    Acknowledged,
    Rejected(String),
}

/// Outstanding publish waiting for its packet id and then its final ack
struct PendingPublish {
    qos: QoS,
    packet_id: Option<u16>,
    reply: oneshot::Sender<PublishAck>,
}

/// State shared with the poll task
struct SessionShared {
    state_tx: watch::Sender<SessionState>,
    events: ArcSwapOption<mpsc::UnboundedSender<SessionEvent>>,
    pending_subscribe: Mutex<Option<PendingSubscribe>>,
    pending_publish: Mutex<Option<PendingPublish>>,
}

impl SessionShared {
    fn emit(&self, event: SessionEvent) {
        if let Some(sender) = self.events.load_full() {
            if sender.send(event).is_err() {
                debug!(target: "mqtt_transport", "Session event receiver dropped");
            }
        }
    }

    fn state(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    /// Drop outstanding request slots; their waiters see the session as gone
    async fn abandon_pending(&self) {
        self.pending_subscribe.lock().await.take();
        self.pending_publish.lock().await.take();
    }
}

/// Production [`SessionHandle`] over rumqttc's MQTT v5 client
pub struct MqttSession {
    shared: Arc<SessionShared>,
    client: Mutex<Option<AsyncClient>>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
    subscribe_lock: Mutex<()>,
    publish_lock: Mutex<()>,
}

impl Default for MqttSession {
    fn default() -> Self {
        Self::new()
    }
}

impl MqttSession {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            shared: Arc::new(SessionShared {
                state_tx,
                events: ArcSwapOption::empty(),
                pending_subscribe: Mutex::new(None),
                pending_publish: Mutex::new(None),
            }),
            client: Mutex::new(None),
            poll_handle: Mutex::new(None),
            subscribe_lock: Mutex::new(()),
            publish_lock: Mutex::new(()),
        }
    }

    /// Current event loop state
    pub fn session_state(&self) -> SessionState {
        self.shared.state()
    }

    /// Wait for ConnAck (or the event loop dying) with timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<SessionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                match &*state_rx.borrow_and_update() {
                    SessionState::Connected => return Ok(()),
                    SessionState::Closed(reason) => return Err(reason.clone()),
                    SessionState::Idle | SessionState::AwaitingConnAck => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err("State channel closed".to_string());
                }
            }
        })
        .await;

        match timeout_result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) if reason.starts_with(REFUSED_PREFIX) => Err(
                MqttError::ConnectionRefused(reason.trim_start_matches(REFUSED_PREFIX).to_string()),
            ),
            Ok(Err(reason)) => Err(MqttError::ConnectionFailedStr(reason)),
            Err(_) => Err(MqttError::ConnectionFailedStr(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    /// Poll the event loop until it errors, the broker disconnects, or the
    /// task is aborted
    async fn run_event_loop(mut event_loop: EventLoop, shared: Arc<SessionShared>) {
        debug!(target: "mqtt_transport", "Starting MQTT event loop");
        loop {
            match event_loop.poll().await {
                Ok(event) => {
                    let route = EventRouter::route_mqtt_event(&event);
                    if !Self::process_event_route(route, &shared).await {
                        break;
                    }
                }
                Err(e) => {
                    let was_connected = shared.state() == SessionState::Connected;
                    let reason = if EventRouter::is_refusal(&e) {
                        format!("{REFUSED_PREFIX}{e}")
                    } else {
                        e.to_string()
                    };
                    if let Some(rejection) = EventRouter::publish_rejection(&e) {
                        Self::complete_publish(&shared, None, PublishAck::Rejected(rejection))
                            .await;
                    }
                    if was_connected {
                        warn!("MQTT event loop error: {}", e);
                    } else {
                        debug!(target: "mqtt_transport", "MQTT event loop error before ConnAck: {}", e);
                    }
                    Self::close(&shared, reason.clone(), was_connected).await;
                    break;
                }
            }
        }
        debug!(target: "mqtt_transport", "MQTT event loop stopped");
    }

    /// Returns false when the event loop should stop
    async fn process_event_route(route: EventRoute, shared: &Arc<SessionShared>) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                shared.state_tx.send_replace(SessionState::Connected);
                shared.emit(SessionEvent::Connected);
                true
            }
            EventRoute::ConnectionRefused { reason } => {
                error!("Broker refused connection: {}", reason);
                Self::close(shared, format!("{REFUSED_PREFIX}{reason}"), false).await;
                false
            }
            EventRoute::MessageReceived(message) => {
                shared.emit(SessionEvent::MessageReceived(message));
                true
            }
            EventRoute::Disconnected { reason } => {
                let was_connected = shared.state() == SessionState::Connected;
                Self::close(shared, reason, was_connected).await;
                false
            }
            EventRoute::SubscriptionAcknowledged { packet_id, codes } => {
                match shared.pending_subscribe.lock().await.take() {
                    Some(pending) => {
                        let _ = pending.reply.send(codes);
                    }
                    None => {
                        debug!(target: "mqtt_transport", "Unsolicited SubAck for packet {}", packet_id);
                    }
                }
                true
            }
            EventRoute::PublishSent { packet_id } => {
                let mut pending = shared.pending_publish.lock().await;
                let qos0_written = match pending.as_mut() {
                    Some(publish) if publish.packet_id.is_none() => {
                        publish.packet_id = Some(packet_id);
                        publish.qos == QoS::AtMostOnce
                    }
                    _ => false,
                };
                if qos0_written {
                    if let Some(publish) = pending.take() {
                        let _ = publish.reply.send(PublishAck::Acknowledged);
                    }
                }
                true
            }
            EventRoute::PublishAcknowledged {
                packet_id,
                rejection,
            } => {
                let ack = match rejection {
                    Some(reason) => PublishAck::Rejected(reason),
                    None => PublishAck::Acknowledged,
                };
                Self::complete_publish(shared, Some(packet_id), ack).await;
                true
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT infrastructure event: {}", event);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    /// Answer the outstanding publish if it was sent as `packet_id`
    ///
    /// `None` matches any publish that has already been written out.
    async fn complete_publish(shared: &SessionShared, packet_id: Option<u16>, ack: PublishAck) {
        let mut pending = shared.pending_publish.lock().await;
        let matches = match (pending.as_ref().and_then(|p| p.packet_id), packet_id) {
            (Some(sent), Some(acked)) => sent == acked,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            debug!(target: "mqtt_transport", "Unsolicited publish ack for packet {:?}", packet_id);
            return;
        }
        if let Some(publish) = pending.take() {
            let _ = publish.reply.send(ack);
        }
    }

    async fn close(shared: &SessionShared, reason: String, notify: bool) {
        shared.state_tx.send_replace(SessionState::Closed(reason.clone()));
        // Dropping the replies fails the waiting subscribe or publish immediately.
        shared.abandon_pending().await;
        if notify {
            shared.emit(SessionEvent::Disconnected { reason });
        }
    }

    async fn connected_client(&self) -> Result<AsyncClient, MqttError> {
        let state = self.shared.state();
        if state != SessionState::Connected {
            return Err(MqttError::NotConnected { state });
        }
        self.client
            .lock()
            .await
            .clone()
            .ok_or(MqttError::NotConnected { state })
    }

    async fn abort_poll_task(&self) {
        if let Some(handle) = self.poll_handle.lock().await.take() {
            handle.abort();
        }
    }
}

/// Marks a closed-state reason as a broker refusal
const REFUSED_PREFIX: &str = "refused: ";

#[async_trait]
impl SessionHandle for MqttSession {
    async fn connect(
        &self,
        options: &ConnectOptions,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        if self.shared.state() == SessionState::Connected {
            return Ok(());
        }

        // A dead or half-open event loop from an earlier attempt is discarded.
        self.abort_poll_task().await;

        let mqtt_options = configure_mqtt_options(options);
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        *self.client.lock().await = Some(client);

        let state_rx = self.shared.state_tx.subscribe();
        self.shared.state_tx.send_replace(SessionState::AwaitingConnAck);

        let shared = self.shared.clone();
        let handle = tokio::spawn(Self::run_event_loop(event_loop, shared));
        *self.poll_handle.lock().await = Some(handle);

        info!(
            "Connecting to MQTT broker {}:{} as {}",
            options.host, options.port, options.client_id
        );

        match Self::wait_for_connection_confirmation(state_rx, timeout).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.abort_poll_task().await;
                self.client.lock().await.take();
                self.shared
                    .state_tx
                    .send_replace(SessionState::Closed(e.to_string()));
                Err(e.into())
            }
        }
    }

    async fn disconnect(&self, reason: &str, timeout: Duration) -> Result<(), SessionError> {
        let client = self.client.lock().await.take();
        let Some(client) = client else {
            return Ok(());
        };

        info!("Disconnecting from MQTT broker: {}", reason);
        let result = match tokio::time::timeout(timeout, client.disconnect()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(MqttError::ConnectionFailed(Box::new(e)).into()),
            Err(_) => Err(SessionError::Timeout(timeout)),
        };

        // Give the poll task time to flush DISCONNECT before tearing it down
        if let Some(handle) = self.poll_handle.lock().await.take() {
            let abort = handle.abort_handle();
            match tokio::time::timeout(POLL_TASK_SHUTDOWN_GRACE, handle).await {
                Ok(Ok(())) => debug!(target: "mqtt_transport", "Event loop task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("Event loop task ended with error: {}", e),
                Err(_) => {
                    warn!("Event loop task didn't shut down gracefully, forcing abort");
                    abort.abort();
                }
                _ => {}
            }
        }

        self.shared
            .state_tx
            .send_replace(SessionState::Closed(format!("client disconnected: {reason}")));
        self.shared.abandon_pending().await;
        result
    }

    async fn ping(&self, _timeout: Duration) -> bool {
        // rumqttc runs the PINGREQ/PINGRESP exchange inside the event loop and
        // fails poll() when a response is missed, which closes the session.
        if self.shared.state() != SessionState::Connected {
            return false;
        }
        match self.poll_handle.lock().await.as_ref() {
            Some(handle) => !handle.is_finished(),
            None => false,
        }
    }

    async fn subscribe(
        &self,
        patterns: &[String],
        timeout: Duration,
    ) -> Result<Vec<SubscribeOutcome>, SessionError> {
        if patterns.is_empty() {
            return Ok(Vec::new());
        }

        let _serialized = self.subscribe_lock.lock().await;
        let client = self.connected_client().await?;

        let (reply_tx, reply_rx) = oneshot::channel();
        *self.shared.pending_subscribe.lock().await = Some(PendingSubscribe { reply: reply_tx });

        let filters: Vec<Filter> = patterns
            .iter()
            .map(|pattern| Filter::new(pattern.clone(), SUBSCRIPTION_QOS))
            .collect();

        if let Err(e) = client.subscribe_many(filters).await {
            self.shared.pending_subscribe.lock().await.take();
            return Err(MqttError::SubscriptionFailed(Box::new(e)).into());
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(codes)) => Ok(EventRouter::pair_with_patterns(patterns, codes)),
            Ok(Err(_)) => Err(SessionError::NotConnected),
            Err(_) => {
                self.shared.pending_subscribe.lock().await.take();
                Err(SessionError::Timeout(timeout))
            }
        }
    }

    async fn publish(
        &self,
        request: &PublishRequest,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        let _serialized = self.publish_lock.lock().await;
        let client = self.connected_client().await?;
        let qos = to_rumqttc_qos(request.qos);

        let (reply_tx, reply_rx) = oneshot::channel();
        *self.shared.pending_publish.lock().await = Some(PendingPublish {
            qos,
            packet_id: None,
            reply: reply_tx,
        });

        let exchange = async {
            client
                .publish(
                    request.topic.clone(),
                    qos,
                    request.retain,
                    request.payload.clone(),
                )
                .await
                // The request channel only closes when the event loop is gone
                .map_err(|_| SessionError::NotConnected)?;
            match reply_rx.await {
                Ok(PublishAck::Acknowledged) => Ok(()),
                Ok(PublishAck::Rejected(reason)) => Err(SessionError::Rejected(reason)),
                // The session closed before the broker answered
                Err(_) => Err(SessionError::NotConnected),
            }
        };

        let result = match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Timeout(timeout)),
        };
        if result.is_err() {
            self.shared.pending_publish.lock().await.take();
        }
        result
    }

    fn is_connected(&self) -> bool {
        self.shared.state() == SessionState::Connected
    }

    fn set_event_sender(&self, sender: mpsc::UnboundedSender<SessionEvent>) {
        self.shared.events.store(Some(Arc::new(sender)));
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        // Can't await in Drop; callers wanting a clean DISCONNECT call disconnect() first.
        if let Ok(mut guard) = self.poll_handle.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}
