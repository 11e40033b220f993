// ============================================================================
// OWNER DISPATCH: marshals worker results back onto the owning context
// ============================================================================
//
// Background jobs (persistence, batch units) never touch tabs directly. They hold
// a `Dispatcher` and post a `WorkspaceEvent`; the workspace drains its
// `EventQueue` on the owning thread and applies each event in one step.

use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::ops::batch::UnitOutput;
use crate::project::TabId;

/// Results produced off the owning thread.
#[derive(Debug)]
pub enum WorkspaceEvent {
    /// A background snapshot of `tab` at history `state` reached the cache.
    BackupWritten {
        tab: TabId,
        state: u64,
        path: PathBuf,
        at: DateTime<Utc>,
    },
    BackupFailed {
        tab: TabId,
        state: u64,
        error: String,
    },
    SessionWritten {
        generation: u64,
        path: PathBuf,
    },
    SessionWriteFailed {
        generation: u64,
        error: String,
    },
    BatchUnitFinished {
        batch: u64,
        tab: TabId,
        base_state: Option<u64>,
        outcome: Result<UnitOutput, String>,
    },
    BatchFinished {
        batch: u64,
    },
}

/// Sending half, cloned into every worker.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    tx: mpsc::Sender<WorkspaceEvent>,
}

impl Dispatcher {
    /// Queue an event for the owning context. A dropped workspace just means nobody
    /// is listening any more.
    pub fn post(&self, event: WorkspaceEvent) {
        if let Err(e) = self.tx.send(event) {
            log::debug!("dispatch: owner gone, dropping {:?}", e.0);
        }
    }
}

/// Receiving half, owned by the workspace.
#[derive(Debug)]
pub struct EventQueue {
    rx: mpsc::Receiver<WorkspaceEvent>,
}

impl EventQueue {
    pub fn try_next(&self) -> Option<WorkspaceEvent> {
        self.rx.try_recv().ok()
    }

    pub fn next_timeout(&self, timeout: Duration) -> Option<WorkspaceEvent> {
        self.rx.recv_timeout(timeout).ok()
    }
}

pub fn channel() -> (Dispatcher, EventQueue) {
    let (tx, rx) = mpsc::channel();
    (Dispatcher { tx }, EventQueue { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_cross_threads_in_order() {
        let (dispatcher, queue) = channel();
        let worker = dispatcher.clone();
        std::thread::spawn(move || {
            worker.post(WorkspaceEvent::BatchFinished { batch: 1 });
            worker.post(WorkspaceEvent::BatchFinished { batch: 2 });
        })
        .join()
        .unwrap();
        let first = queue.next_timeout(Duration::from_secs(1));
        assert!(matches!(first, Some(WorkspaceEvent::BatchFinished { batch: 1 })));
        assert!(matches!(queue.try_next(), Some(WorkspaceEvent::BatchFinished { batch: 2 })));
        assert!(queue.try_next().is_none());
    }
}
