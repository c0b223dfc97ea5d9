//! Connection state and the connectivity gate
//!
//! The gate is the single source of truth for "is the broker session usable".
//! Only the supervisor writes it; the publish queue, subscription registry and
//! callers of `wait_until_connected` read it.

use crate::error::{LinkError, LinkResult};
use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Things that move the connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A connect attempt is starting
    ConnectAttempt,
    /// The attempt failed or timed out
    ConnectFailed,
    /// The session reported it is connected
    SessionConnected,
    /// Liveness ping failed or the broker dropped the session
    ConnectionLost,
    /// `stop()` was called
    ShutdownRequested,
}

impl ConnectionState {
    /// Next state for a single step. A connected notification seen while
    /// Disconnected only advances to Connecting; apply it again to finish.
    pub fn next(self, event: ConnectionEvent) -> ConnectionState {
        use ConnectionEvent::*;
        use ConnectionState::*;

        match (self, event) {
            (_, ConnectionLost) | (_, ShutdownRequested) => Disconnected,
            (Connected, ConnectAttempt) => Connected,
            (_, ConnectAttempt) => Connecting,
            (Connecting, ConnectFailed) => Disconnected,
            (state, ConnectFailed) => state,
            (Disconnected, SessionConnected) => Connecting,
            (_, SessionConnected) => Connected,
        }
    }

    /// Every state visited while applying `event`, in order
    pub fn path(self, event: ConnectionEvent) -> Vec<ConnectionState> {
        let mut path = Vec::new();
        let mut current = self;
        loop {
            let next = current.next(event);
            if next == current {
                break;
            }
            path.push(next);
            current = next;
            if event != ConnectionEvent::SessionConnected || next == ConnectionState::Connected {
                break;
            }
        }
        path
    }
}

/// Watch-backed connectivity signal
///
/// Transitions are serialized: each one reads the current state and publishes
/// its whole path before the next one starts.
#[derive(Debug)]
pub struct ConnectivityGate {
    tx: watch::Sender<ConnectionState>,
    transition: Mutex<()>,
}

impl Default for ConnectivityGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            tx,
            transition: Mutex::new(()),
        }
    }

    /// Apply an event, stepping through intermediate states; returns the final state
    pub fn apply(&self, event: ConnectionEvent) -> ConnectionState {
        let _guard = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
        self.step(event)
    }

    /// Apply an event only if `condition` holds at the moment of the transition
    ///
    /// `condition` runs while no other transition can interleave, so a
    /// connection loss applied concurrently either lands before the check or
    /// after the event.
    pub fn apply_if(
        &self,
        event: ConnectionEvent,
        condition: impl FnOnce() -> bool,
    ) -> Option<ConnectionState> {
        let _guard = self.transition.lock().unwrap_or_else(PoisonError::into_inner);
        if condition() {
            Some(self.step(event))
        } else {
            None
        }
    }

    fn step(&self, event: ConnectionEvent) -> ConnectionState {
        let current = *self.tx.borrow();
        let mut last = current;
        for state in current.path(event) {
            self.tx.send_replace(state);
            last = state;
        }
        last
    }

    pub fn state(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Resolve once Connected, or fail with `Cancelled` when `cancel` fires first
    pub async fn wait_until_connected(&self, cancel: &CancellationToken) -> LinkResult<()> {
        let mut rx = self.tx.subscribe();
        tokio::select! {
            _ = cancel.cancelled() => Err(LinkError::Cancelled),
            result = async { rx.wait_for(|state| *state == ConnectionState::Connected).await.map(|_| ()) } => {
                result.map_err(|_| LinkError::internal("connectivity gate closed"))
            }
        }
    }
}
