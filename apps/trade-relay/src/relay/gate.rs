use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;

/// Observable state of the upstream consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    Stopped,
    Running,
    /// Stop requested; the reader is finishing its in-flight pull.
    Stopping,
}

impl ConsumerState {
    /// True while a reader is alive or committed to starting.
    pub fn is_running(self) -> bool {
        !matches!(self, ConsumerState::Stopped)
    }
}

/// Handed to each reader task. The stop flag is level-triggered and only
/// ever flips from false to true.
#[derive(Debug, Clone)]
pub(crate) struct ReaderTicket {
    pub(crate) generation: u64,
    stop: Arc<AtomicBool>,
}

impl ReaderTicket {
    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

enum GateState {
    Stopped,
    Running {
        generation: u64,
        stop: Arc<AtomicBool>,
        handle: JoinHandle<()>,
    },
    Stopping {
        generation: u64,
        handle: JoinHandle<()>,
    },
}

/// Start/stop bookkeeping for the feed reader. Lives under the same lock as
/// the connection set so a registry transition and its gate decision are a
/// single critical section.
pub(crate) struct ConsumerGate {
    state: GateState,
    next_generation: u64,
    shut_down: bool,
}

impl Default for ConsumerGate {
    fn default() -> Self {
        Self {
            state: GateState::Stopped,
            next_generation: 1,
            shut_down: false,
        }
    }
}

impl ConsumerGate {
    pub(crate) fn state(&self) -> ConsumerState {
        match self.state {
            GateState::Stopped => ConsumerState::Stopped,
            GateState::Running { .. } => ConsumerState::Running,
            GateState::Stopping { .. } => ConsumerState::Stopping,
        }
    }

    /// Spawn a reader unless one is already running. A reader that is still
    /// stopping is passed to `spawn` so the new one can join it before
    /// subscribing.
    pub(crate) fn start_with<F>(&mut self, spawn: F) -> Option<u64>
    where
        F: FnOnce(ReaderTicket, Option<JoinHandle<()>>) -> JoinHandle<()>,
    {
        if self.shut_down || matches!(self.state, GateState::Running { .. }) {
            return None;
        }

        let predecessor = match std::mem::replace(&mut self.state, GateState::Stopped) {
            GateState::Stopping { handle, .. } => Some(handle),
            _ => None,
        };

        let generation = self.next_generation;
        self.next_generation += 1;
        let stop = Arc::new(AtomicBool::new(false));
        let ticket = ReaderTicket {
            generation,
            stop: Arc::clone(&stop),
        };

        let handle = spawn(ticket, predecessor);
        self.state = GateState::Running {
            generation,
            stop,
            handle,
        };
        Some(generation)
    }

    /// Ask the running reader to leave its pull loop. Returns the generation
    /// that was asked to stop.
    pub(crate) fn request_stop(&mut self) -> Option<u64> {
        match std::mem::replace(&mut self.state, GateState::Stopped) {
            GateState::Running {
                generation,
                stop,
                handle,
            } => {
                stop.store(true, Ordering::Release);
                self.state = GateState::Stopping { generation, handle };
                Some(generation)
            }
            other => {
                self.state = other;
                None
            }
        }
    }

    /// Record that reader `generation` has exited. Readers superseded by a
    /// newer generation leave the state alone.
    pub(crate) fn reader_exited(&mut self, generation: u64) -> bool {
        let current = match &self.state {
            GateState::Running { generation: g, .. } | GateState::Stopping { generation: g, .. } => {
                *g == generation
            }
            GateState::Stopped => false,
        };
        if current {
            self.state = GateState::Stopped;
        }
        current
    }

    /// Stop for good and hand back the reader's handle so the caller can
    /// join it outside the lock.
    pub(crate) fn shut_down(&mut self) -> Option<JoinHandle<()>> {
        self.shut_down = true;
        match std::mem::replace(&mut self.state, GateState::Stopped) {
            GateState::Running { stop, handle, .. } => {
                stop.store(true, Ordering::Release);
                Some(handle)
            }
            GateState::Stopping { handle, .. } => Some(handle),
            GateState::Stopped => None,
        }
    }
}
