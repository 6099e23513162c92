use std::sync::Arc;

use bytes::Bytes;
use metrics::{counter, histogram};
use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, info};

use super::{ClientSink, Relay, SinkError};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub pruned: usize,
    pub bytes: usize,
}

/// Write `payload` to every connection in a snapshot of the registry, then
/// prune and close the ones whose write failed or timed out.
pub(crate) async fn fan_out(relay: &Relay, payload: Bytes) -> BroadcastReport {
    let snapshot = relay.snapshot();
    let write_timeout = relay.config().write_timeout;
    let mut report = BroadcastReport::default();
    let mut failed: Vec<Arc<dyn ClientSink>> = Vec::new();

    for connection in snapshot.iter() {
        let outcome = match timeout(write_timeout, connection.send(payload.clone())).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::TimedOut(write_timeout)),
        };
        match outcome {
            Ok(()) => {
                report.delivered += 1;
                report.bytes += payload.len();
            }
            Err(err) => {
                debug!(connection_id = %connection.id(), error = %err, "client write failed");
                failed.push(Arc::clone(connection));
            }
        }
    }

    for connection in failed {
        if relay.remove(connection.id()).removed {
            report.pruned += 1;
            info!(connection_id = %connection.id(), "pruned client after failed write");
        }
        connection.close().await;
    }

    relay.stats().record_broadcast(&report);
    histogram!("trade_relay_broadcast_fanout", snapshot.len() as f64);
    if report.delivered > 0 {
        counter!("trade_relay_messages_broadcast_total", report.delivered as u64);
        counter!("trade_relay_bytes_forwarded_total", report.bytes as u64);
    }
    if report.pruned > 0 {
        counter!("trade_relay_connections_pruned_total", report.pruned as u64);
    }

    report
}
