use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::{BroadcastReport, ConsumerState};

/// Process-lifetime counters behind `/debug/stats`. Kept separately from the
/// metrics recorder so they are readable without one installed.
#[derive(Debug, Default)]
pub struct RelayStats {
    connections_total: AtomicU64,
    connections_pruned: AtomicU64,
    messages_broadcast: AtomicU64,
    bytes_forwarded: AtomicU64,
    upstream_subscribes: AtomicU64,
    upstream_subscribe_failures: AtomicU64,
    upstream_closes: AtomicU64,
    upstream_pull_errors: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayStatsSnapshot {
    pub topic: String,
    pub consumer: ConsumerState,
    pub active_connections: usize,
    pub connections_total: u64,
    pub connections_pruned: u64,
    pub messages_broadcast: u64,
    pub bytes_forwarded: u64,
    pub upstream_subscribes: u64,
    pub upstream_subscribe_failures: u64,
    pub upstream_closes: u64,
    pub upstream_pull_errors: u64,
}

impl RelayStats {
    pub(crate) fn record_connection_added(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_broadcast(&self, report: &BroadcastReport) {
        self.messages_broadcast
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.bytes_forwarded
            .fetch_add(report.bytes as u64, Ordering::Relaxed);
        self.connections_pruned
            .fetch_add(report.pruned as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_subscribe_attempt(&self) {
        self.upstream_subscribes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_subscribe_failure(&self) {
        self.upstream_subscribe_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_upstream_close(&self) {
        self.upstream_closes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_pull_error(&self) {
        self.upstream_pull_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(
        &self,
        topic: &str,
        active_connections: usize,
        consumer: ConsumerState,
    ) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            topic: topic.to_string(),
            consumer,
            active_connections,
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_pruned: self.connections_pruned.load(Ordering::Relaxed),
            messages_broadcast: self.messages_broadcast.load(Ordering::Relaxed),
            bytes_forwarded: self.bytes_forwarded.load(Ordering::Relaxed),
            upstream_subscribes: self.upstream_subscribes.load(Ordering::Relaxed),
            upstream_subscribe_failures: self.upstream_subscribe_failures.load(Ordering::Relaxed),
            upstream_closes: self.upstream_closes.load(Ordering::Relaxed),
            upstream_pull_errors: self.upstream_pull_errors.load(Ordering::Relaxed),
        }
    }
}
