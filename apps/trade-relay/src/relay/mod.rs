//! Connection-gated fan-out of one upstream topic to streaming clients.
//!
//! The upstream subscription only exists while at least one client is
//! attached. Registry mutation and the start/stop decision for the feed
//! reader share one lock, so concurrent first attaches cannot spawn two
//! readers and a detach cannot race a restart.

mod broadcast;
mod gate;
mod reader;
mod registry;
mod stats;
#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use feed_bus::FeedSource;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use broadcast::BroadcastReport;
pub use gate::ConsumerState;
pub use registry::{AddOutcome, RemoveOutcome, Snapshot};
pub use stats::{RelayStats, RelayStatsSnapshot};

use gate::ConsumerGate;
use registry::ConnectionSet;

pub type ConnectionId = Uuid;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("client connection closed")]
    Closed,
    #[error("client transport error: {0}")]
    Transport(String),
    #[error("client write timed out after {0:?}")]
    TimedOut(Duration),
}

/// Outbound half of a client connection as the relay sees it.
#[async_trait]
pub trait ClientSink: Send + Sync + 'static {
    fn id(&self) -> ConnectionId;

    async fn send(&self, payload: Bytes) -> Result<(), SinkError>;

    /// Close the transport. Must tolerate being called more than once.
    async fn close(&self);
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Upper bound on a single upstream pull, and so on stop latency.
    pub poll_timeout: Duration,
    /// Upper bound on a single client write during a broadcast.
    pub write_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(1000),
            write_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    topic: String,
    feed: Arc<dyn FeedSource>,
    config: RelayConfig,
    state: Mutex<RelayState>,
    stats: RelayStats,
}

#[derive(Default)]
struct RelayState {
    connections: ConnectionSet,
    gate: ConsumerGate,
}

impl Relay {
    pub fn new(topic: impl Into<String>, feed: Arc<dyn FeedSource>, config: RelayConfig) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                topic: topic.into(),
                feed,
                config,
                state: Mutex::new(RelayState::default()),
                stats: RelayStats::default(),
            }),
        }
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> &RelayStats {
        &self.inner.stats
    }

    pub(crate) fn feed(&self) -> &dyn FeedSource {
        self.inner.feed.as_ref()
    }

    /// Register a connection and start the feed reader if none is running.
    pub fn add(&self, connection: Arc<dyn ClientSink>) -> AddOutcome {
        let id = connection.id();
        let (outcome, started) = {
            let mut state = self.inner.state.lock();
            let outcome = state.connections.add(connection);
            let started = if outcome.inserted {
                let relay = self.clone();
                state.gate.start_with(move |ticket, predecessor| {
                    tokio::spawn(reader::run(relay, ticket, predecessor))
                })
            } else {
                None
            };
            (outcome, started)
        };

        if outcome.inserted {
            self.inner.stats.record_connection_added();
            counter!("trade_relay_connections_total", 1);
            gauge!("trade_relay_connections_active", outcome.active as f64);
        }
        debug!(connection_id = %id, active = outcome.active, first = outcome.first, "client registered");
        if let Some(generation) = started {
            info!(topic = %self.inner.topic, generation, "starting upstream feed reader");
        }
        outcome
    }

    /// Deregister a connection; the last removal asks the reader to stop.
    pub fn remove(&self, id: ConnectionId) -> RemoveOutcome {
        let (outcome, stopping) = {
            let mut state = self.inner.state.lock();
            let outcome = state.connections.remove(id);
            let stopping = if outcome.last {
                state.gate.request_stop()
            } else {
                None
            };
            (outcome, stopping)
        };

        if outcome.removed {
            gauge!("trade_relay_connections_active", outcome.active as f64);
            debug!(connection_id = %id, active = outcome.active, "client deregistered");
        }
        if let Some(generation) = stopping {
            info!(topic = %self.inner.topic, generation, "last client left; stopping upstream feed reader");
        }
        outcome
    }

    /// Register `connection` for as long as the returned guard lives.
    pub fn attach(&self, connection: Arc<dyn ClientSink>) -> Registration {
        let id = connection.id();
        let outcome = self.add(connection);
        Registration {
            relay: self.clone(),
            id,
            first: outcome.first,
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.inner.state.lock().connections.snapshot()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().connections.len()
    }

    pub fn consumer_state(&self) -> ConsumerState {
        self.inner.state.lock().gate.state()
    }

    pub fn is_consumer_running(&self) -> bool {
        self.consumer_state().is_running()
    }

    pub async fn broadcast(&self, payload: Bytes) -> BroadcastReport {
        broadcast::fan_out(self, payload).await
    }

    pub fn stats_snapshot(&self) -> RelayStatsSnapshot {
        let (active, consumer) = {
            let state = self.inner.state.lock();
            (state.connections.len(), state.gate.state())
        };
        self.inner.stats.snapshot(&self.inner.topic, active, consumer)
    }

    /// Stop the feed reader for good and wait for it to close its
    /// subscription. Attaches after this never restart it.
    pub async fn shutdown(&self) {
        let handle = self.inner.state.lock().gate.shut_down();
        if let Some(handle) = handle {
            info!(topic = %self.inner.topic, "waiting for upstream feed reader to stop");
            if let Err(err) = handle.await {
                warn!(topic = %self.inner.topic, error = %err, "upstream feed reader ended abnormally");
            }
        }
    }

    pub(crate) fn reader_exited(&self, generation: u64) {
        let current = self.inner.state.lock().gate.reader_exited(generation);
        if current {
            debug!(topic = %self.inner.topic, generation, "feed reader marked stopped");
        }
    }
}

/// Keeps a connection registered; dropping it deregisters on every exit
/// path, including unwinding and task cancellation.
pub struct Registration {
    relay: Relay,
    id: ConnectionId,
    first: bool,
}

impl Registration {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Whether this registration took the relay from zero clients to one.
    pub fn was_first(&self) -> bool {
        self.first
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.relay.remove(self.id);
    }
}
