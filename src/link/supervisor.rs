//! Connection supervision
//!
//! The supervisor owns every write to the connectivity gate. It opens the
//! session, pings it on a fixed interval, reconnects when the ping fails and
//! turns session notifications into state changes, resubscribe requests and
//! dispatched messages.

use crate::error::sanitize_error_message;
use crate::link::dispatcher::Dispatcher;
use crate::link::state::{ConnectionEvent, ConnectivityGate};
use crate::link::subscription::SubscriptionRegistry;
use crate::observability::LinkMetrics;
use crate::transport::{ConnectOptions, SessionError, SessionEvent, SessionHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn, Instrument};

/// Timing for connect attempts and the liveness loop
#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    pub ping_interval: Duration,
    pub connect_timeout: Duration,
}

pub struct ConnectionSupervisor<S: SessionHandle> {
    session: Arc<S>,
    gate: Arc<ConnectivityGate>,
    options: ConnectOptions,
    settings: SupervisorSettings,
    metrics: Arc<LinkMetrics>,
}

impl<S: SessionHandle> ConnectionSupervisor<S> {
    pub fn new(
        session: Arc<S>,
        gate: Arc<ConnectivityGate>,
        options: ConnectOptions,
        settings: SupervisorSettings,
        metrics: Arc<LinkMetrics>,
    ) -> Self {
        Self {
            session,
            gate,
            options,
            settings,
            metrics,
        }
    }

    pub fn gate(&self) -> &Arc<ConnectivityGate> {
        &self.gate
    }

    /// One connect attempt bounded by the connect timeout
    ///
    /// Failures are logged here; the caller only learns whether it worked.
    pub async fn try_connect(&self) -> bool {
        let span = crate::mqtt_span!(
            operation = "connect",
            host = %self.options.host,
            port = self.options.port
        );

        self.gate.apply(ConnectionEvent::ConnectAttempt);
        self.metrics.connection_attempt();

        let result = self
            .session
            .connect(&self.options, self.settings.connect_timeout)
            .instrument(span.clone())
            .await;

        match result {
            Ok(()) => {
                let session = &self.session;
                let opened = self
                    .gate
                    .apply_if(ConnectionEvent::SessionConnected, || session.is_connected());
                if opened.is_none() {
                    // Lost between the ack and here; the pump records the loss
                    self.gate.apply(ConnectionEvent::ConnectFailed);
                    span.in_scope(|| warn!("Broker session closed right after connecting"));
                    return false;
                }
                true
            }
            Err(e) => {
                self.metrics.connection_failed();
                self.gate.apply(ConnectionEvent::ConnectFailed);
                span.in_scope(|| self.log_connect_failure(&e));
                false
            }
        }
    }

    fn log_connect_failure(&self, e: &SessionError) {
        let reason = sanitize_error_message(&e.to_string());
        if e.is_refusal() {
            error!(
                host = %self.options.host,
                client_id = %self.options.client_id,
                "Broker refused connection, check credentials and client id: {}",
                reason
            );
        } else {
            warn!(
                host = %self.options.host,
                "Could not connect to broker, retrying in {:?}: {}",
                self.settings.ping_interval,
                reason
            );
        }
    }

    /// Ping the session every ping interval and reconnect when it is dead
    pub async fn run_liveness_loop(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            "Liveness loop started (interval {:?})",
            self.settings.ping_interval
        );

        let mut ticker = tokio::time::interval(self.settings.ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let alive = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                alive = self.session.ping(self.settings.ping_interval) => alive,
            };

            if alive {
                trace!("Broker session alive");
                continue;
            }

            if self.gate.is_connected() {
                self.gate.apply(ConnectionEvent::ConnectionLost);
                self.metrics.connection_lost();
                warn!("Liveness check failed, broker session lost");
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.try_connect() => {}
            }
        }

        info!("Liveness loop stopped");
    }

    /// Apply session notifications until the channel closes or `cancel` fires
    pub async fn run_event_pump(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
        registry: Arc<SubscriptionRegistry>,
        dispatcher: Arc<Dispatcher>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                SessionEvent::Connected => {
                    let session = &self.session;
                    let opened = self
                        .gate
                        .apply_if(ConnectionEvent::SessionConnected, || session.is_connected());
                    if opened.is_none() {
                        trace!("Ignoring stale connected notification");
                        continue;
                    }
                    self.metrics.connection_established();
                    info!(
                        host = %self.options.host,
                        port = self.options.port,
                        "Connected to broker"
                    );
                    registry.request_resubscribe();
                }
                SessionEvent::Disconnected { reason } => {
                    self.gate.apply(ConnectionEvent::ConnectionLost);
                    self.metrics.connection_lost();
                    warn!(
                        "Disconnected from broker: {}",
                        sanitize_error_message(&reason)
                    );
                }
                SessionEvent::MessageReceived(message) => {
                    dispatcher.dispatch(message);
                }
            }
        }

        trace!("Session event pump stopped");
    }
}
