use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{ClientSink, ConnectionId, SinkError};

enum Behaviour {
    Accept,
    Fail,
    Stall,
}

/// Deliveries across several sinks, in the order the relay made them.
pub(crate) type Journal = Arc<Mutex<Vec<(ConnectionId, Bytes)>>>;

/// Client double that records what the relay wrote to it.
pub(crate) struct RecordingSink {
    id: ConnectionId,
    behaviour: Behaviour,
    received: Mutex<Vec<Bytes>>,
    journal: Option<Journal>,
    closed: AtomicBool,
}

impl RecordingSink {
    fn with(behaviour: Behaviour, journal: Option<Journal>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            behaviour,
            received: Mutex::new(Vec::new()),
            journal,
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn new() -> Arc<Self> {
        Self::with(Behaviour::Accept, None)
    }

    pub(crate) fn failing() -> Arc<Self> {
        Self::with(Behaviour::Fail, None)
    }

    /// Accepting sink that also appends each delivery to a shared journal.
    pub(crate) fn journaled(journal: &Journal) -> Arc<Self> {
        Self::with(Behaviour::Accept, Some(Arc::clone(journal)))
    }

    /// Writes never complete.
    pub(crate) fn stalled() -> Arc<Self> {
        Self::with(Behaviour::Stall, None)
    }

    pub(crate) fn received(&self) -> Vec<Bytes> {
        self.received.lock().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientSink for RecordingSink {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn send(&self, payload: Bytes) -> Result<(), SinkError> {
        match self.behaviour {
            Behaviour::Accept => {
                if let Some(journal) = &self.journal {
                    journal.lock().push((self.id, payload.clone()));
                }
                self.received.lock().push(payload);
                Ok(())
            }
            Behaviour::Fail => Err(SinkError::Transport("broken pipe".into())),
            Behaviour::Stall => std::future::pending().await,
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
