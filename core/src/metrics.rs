//! # Broker metrics
//!
//! Lock-free counters updated on the packet and message paths. Every
//! counter is a relaxed atomic; [`MetricsRegistry::snapshot`] copies them
//! into a plain struct for logging and assertions. There is no export
//! endpoint: the server logs a snapshot when it stops.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;
use tracing::info;

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    connections_accepted: AtomicU64,
    connections_failed: AtomicU64,
    active_connections: AtomicI64,
    active_sessions: AtomicI64,
    packets_received: AtomicU64,
    packets_sent: AtomicU64,
    messages_routed: AtomicU64,
    messages_dropped: AtomicU64,
    duplicates_rejected: AtomicU64,
    messages_delivered: AtomicU64,
    messages_acknowledged: AtomicU64,
    messages_expired: AtomicU64,
    messages_paged: AtomicU64,
    messages_depaged: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_rolled_back: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub connections_failed: u64,
    pub active_connections: i64,
    pub active_sessions: i64,
    pub packets_received: u64,
    pub packets_sent: u64,
    pub messages_routed: u64,
    pub messages_dropped: u64,
    pub duplicates_rejected: u64,
    pub messages_delivered: u64,
    pub messages_acknowledged: u64,
    pub messages_expired: u64,
    pub messages_paged: u64,
    pub messages_depaged: u64,
    pub transactions_committed: u64,
    pub transactions_rolled_back: u64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self, failed: bool) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        if failed {
            self.connections_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn session_opened(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn packet_received(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_sent(&self) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_routed(&self) {
        self.messages_routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate_rejected(&self) {
        self.duplicates_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_delivered(&self) {
        self.messages_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_acknowledged(&self) {
        self.messages_acknowledged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_expired(&self) {
        self.messages_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_paged(&self) {
        self.messages_paged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_depaged(&self) {
        self.messages_depaged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transaction_committed(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transaction_rolled_back(&self) {
        self.transactions_rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            messages_routed: self.messages_routed.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            duplicates_rejected: self.duplicates_rejected.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            messages_acknowledged: self.messages_acknowledged.load(Ordering::Relaxed),
            messages_expired: self.messages_expired.load(Ordering::Relaxed),
            messages_paged: self.messages_paged.load(Ordering::Relaxed),
            messages_depaged: self.messages_depaged.load(Ordering::Relaxed),
            transactions_committed: self.transactions_committed.load(Ordering::Relaxed),
            transactions_rolled_back: self.transactions_rolled_back.load(Ordering::Relaxed),
        }
    }

    pub fn log_summary(&self) {
        let s = self.snapshot();
        info!(
            connections_accepted = s.connections_accepted,
            connections_failed = s.connections_failed,
            packets_received = s.packets_received,
            packets_sent = s.packets_sent,
            messages_routed = s.messages_routed,
            messages_delivered = s.messages_delivered,
            messages_acknowledged = s.messages_acknowledged,
            messages_paged = s.messages_paged,
            messages_depaged = s.messages_depaged,
            "Broker metrics"
        );
    }
}
