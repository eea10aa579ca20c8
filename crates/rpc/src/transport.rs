//! The work-distribution transport seam.
//!
//! The bridge only needs a small surface from whatever actually moves
//! payloads between submitters and workers: submit a task and stream its
//! events back, register a worker function, and report what the transport
//! currently sees (capacity per server, running unique ids). Everything
//! protocol-shaped lives above this seam in [`crate::bridge`].

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use futures::future::BoxFuture;
use gearbox_core::state::JobPriority;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no worker registered for {method}")]
    NoWorker { method: String },
    #[error("transport closed")]
    Closed,
    #[error("transport backend error: {0}")]
    Backend(String),
}

/// Options attached to a task submission.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub priority: JobPriority,
    /// Coalescing/tracking key; tasks carrying one show up in
    /// [`Transport::running_unique_ids`] while a worker holds them.
    pub unique_id: Option<String>,
}

/// Events a worker streams back for a single task.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// A human-readable progress status line.
    Progress { status: String },
    Warning { message: String },
    /// Final success payload; last event for the task.
    Done { payload: Vec<u8> },
    /// Final failure payload; last event for the task.
    Failed { payload: Vec<u8> },
}

/// Worker-side handle for streaming [`TaskEvent`]s back to the submitter.
///
/// Sends are best-effort: a submitter that has gone away just drops the
/// events, which is the correct behavior for background tasks.
#[derive(Clone)]
pub struct TaskSink {
    tx: mpsc::UnboundedSender<TaskEvent>,
}

impl TaskSink {
    pub fn new(tx: mpsc::UnboundedSender<TaskEvent>) -> Self {
        Self { tx }
    }

    pub fn progress(&self, status: impl Into<String>) {
        let _ = self.tx.send(TaskEvent::Progress {
            status: status.into(),
        });
    }

    pub fn warn(&self, message: impl Into<String>) {
        let _ = self.tx.send(TaskEvent::Warning {
            message: message.into(),
        });
    }

    pub fn done(&self, payload: Vec<u8>) {
        let _ = self.tx.send(TaskEvent::Done { payload });
    }

    pub fn fail(&self, payload: Vec<u8>) {
        let _ = self.tx.send(TaskEvent::Failed { payload });
    }
}

/// One task as handed to a worker function.
pub struct WorkTask {
    pub payload: Vec<u8>,
    pub unique_id: String,
    pub sink: TaskSink,
}

/// A registered worker function. The future resolves when the task is
/// finished; the final `Done`/`Failed` event goes through the sink.
pub type WorkHandler = Arc<dyn Fn(WorkTask) -> BoxFuture<'static, ()> + Send + Sync>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Submit a task and stream its events back.
    async fn submit(
        &self,
        method: &str,
        payload: Vec<u8>,
        opts: SubmitOptions,
    ) -> Result<mpsc::UnboundedReceiver<TaskEvent>, TransportError>;

    /// Submit a task nobody will wait on. Events are discarded.
    async fn submit_background(
        &self,
        method: &str,
        payload: Vec<u8>,
        opts: SubmitOptions,
    ) -> Result<(), TransportError>;

    /// Register a worker function for `method`. Multiple registrations
    /// add capacity.
    async fn register_worker(&self, method: &str, handler: WorkHandler)
        -> Result<(), TransportError>;

    /// Worker counts per server, per function.
    async fn capacity(&self) -> Result<HashMap<String, HashMap<String, usize>>, TransportError>;

    /// Unique ids of tasks a worker currently holds.
    async fn running_unique_ids(&self) -> Result<HashSet<String>, TransportError>;

    /// Advertise a stable client identity to the transport.
    async fn set_client_id(&self, id: &str) -> Result<(), TransportError>;

    /// Fires whenever worker capacity is added, so submitters parked on
    /// "no worker" can retry.
    fn subscribe_connected(&self) -> broadcast::Receiver<()>;
}
