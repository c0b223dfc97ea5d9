//! Thread-safe metrics for one broker connection
//!
//! Atomic counters updated from the background loops and read as a
//! serializable snapshot. Each `BrokerConnection` owns its own collector so
//! several connections in one process don't mix their numbers.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Thread-safe metrics collector using atomics
#[derive(Debug, Default)]
pub struct LinkMetrics {
    // Connection
    connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connections_lost: AtomicU64,
    connected_since: AtomicU64,

    // Publish queue
    publishes_queued: AtomicU64,
    publishes_pending: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    publish_stalls: AtomicU64,

    // Subscriptions
    subscriptions_registered: AtomicU64,
    subscribe_requests: AtomicU64,
    subscribe_failures: AtomicU64,
    patterns_rejected: AtomicU64,

    // Dispatch
    messages_received: AtomicU64,
    handlers_dispatched: AtomicU64,
    handler_failures: AtomicU64,
}

impl LinkMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
        self.connected_since
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Only counts a loss when the connection was up
    pub fn connection_lost(&self) {
        if self.connected.swap(false, Ordering::Relaxed) {
            self.connections_lost.fetch_add(1, Ordering::Relaxed);
            self.connected_since.store(0, Ordering::Relaxed);
        }
    }

    pub fn publish_queued(&self) {
        self.publishes_queued.fetch_add(1, Ordering::Relaxed);
        self.publishes_pending.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_succeeded(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
        self.decrement_pending();
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
        self.decrement_pending();
    }

    /// The head of the queue waited for a connection
    pub fn publish_stalled(&self) {
        self.publish_stalls.fetch_add(1, Ordering::Relaxed);
    }

    fn decrement_pending(&self) {
        let _ = self
            .publishes_pending
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn subscription_registered(&self) {
        self.subscriptions_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscribe_request(&self) {
        self.subscribe_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscribe_failed(&self) {
        self.subscribe_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pattern_rejected(&self) {
        self.patterns_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handlers_dispatched(&self, count: usize) {
        self.handlers_dispatched
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn handler_failed(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn calculate_connection_duration(&self, now: u64) -> u64 {
        let since = self.connected_since.load(Ordering::Relaxed);
        if since == 0 || !self.connected.load(Ordering::Relaxed) {
            0
        } else {
            now.saturating_sub(since)
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let connected_since = self.connected_since.load(Ordering::Relaxed);

        MetricsSnapshot {
            timestamp: now,
            connection: ConnectionMetrics {
                connected: self.connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                connections_lost: self.connections_lost.load(Ordering::Relaxed),
                connected_since: (connected_since != 0).then_some(connected_since),
                connection_duration_seconds: self.calculate_connection_duration(now),
            },
            publish: PublishMetrics {
                queued: self.publishes_queued.load(Ordering::Relaxed),
                pending: self.publishes_pending.load(Ordering::Relaxed),
                published: self.messages_published.load(Ordering::Relaxed),
                failed: self.publish_failures.load(Ordering::Relaxed),
                stalls: self.publish_stalls.load(Ordering::Relaxed),
            },
            subscription: SubscriptionMetrics {
                registered: self.subscriptions_registered.load(Ordering::Relaxed),
                requests: self.subscribe_requests.load(Ordering::Relaxed),
                request_failures: self.subscribe_failures.load(Ordering::Relaxed),
                patterns_rejected: self.patterns_rejected.load(Ordering::Relaxed),
            },
            dispatch: DispatchMetrics {
                messages_received: self.messages_received.load(Ordering::Relaxed),
                handlers_dispatched: self.handlers_dispatched.load(Ordering::Relaxed),
                handler_failures: self.handler_failures.load(Ordering::Relaxed),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub connection: ConnectionMetrics,
    pub publish: PublishMetrics,
    pub subscription: SubscriptionMetrics,
    pub dispatch: DispatchMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub connections_lost: u64,
    /// Unix seconds of the current connection, if any
    pub connected_since: Option<u64>,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishMetrics {
    pub queued: u64,
    pub pending: u64,
    pub published: u64,
    pub failed: u64,
    pub stalls: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionMetrics {
    pub registered: u64,
    pub requests: u64,
    pub request_failures: u64,
    pub patterns_rejected: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchMetrics {
    pub messages_received: u64,
    pub handlers_dispatched: u64,
    pub handler_failures: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
