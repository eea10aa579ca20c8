//! Fully in-process [`Transport`] for local mode and tests.
//!
//! Workers run on the local task pool; there is no queueing, so priority
//! is accepted and ignored. The running-id set still behaves like a real
//! backend's: ids appear while a worker holds the task and disappear when
//! it finishes, and [`MemoryTransport::forget`] drops an id early to
//! simulate a worker crash.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;
use uuid::Uuid;

use crate::transport::{
    SubmitOptions, TaskEvent, TaskSink, Transport, TransportError, WorkHandler, WorkTask,
};

const SERVER_NAME: &str = "memory";

#[derive(Default)]
struct Registry {
    handlers: HashMap<String, Vec<WorkHandler>>,
    // Per-method rotation cursor for spreading tasks across workers.
    rotation: HashMap<String, usize>,
}

pub struct MemoryTransport {
    registry: Mutex<Registry>,
    running: Arc<Mutex<HashSet<String>>>,
    connected: broadcast::Sender<()>,
    client_id: Mutex<Option<String>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (connected, _) = broadcast::channel(16);
        Self {
            registry: Mutex::new(Registry::default()),
            running: Arc::new(Mutex::new(HashSet::new())),
            connected,
            client_id: Mutex::new(None),
        }
    }

    /// Drop a unique id from the running set without delivering a final
    /// event, as if the worker holding it died.
    pub fn forget(&self, unique_id: &str) {
        self.running.lock().unwrap().remove(unique_id);
    }

    fn pick_handler(&self, method: &str) -> Result<WorkHandler, TransportError> {
        let mut registry = self.registry.lock().unwrap();
        let count = match registry.handlers.get(method) {
            Some(handlers) if !handlers.is_empty() => handlers.len(),
            _ => {
                return Err(TransportError::NoWorker {
                    method: method.to_string(),
                })
            }
        };
        let cursor = registry.rotation.entry(method.to_string()).or_insert(0);
        let index = *cursor % count;
        *cursor = cursor.wrapping_add(1);
        Ok(registry.handlers[method][index].clone())
    }

    fn start(
        &self,
        method: &str,
        payload: Vec<u8>,
        opts: SubmitOptions,
    ) -> Result<mpsc::UnboundedReceiver<TaskEvent>, TransportError> {
        let handler = self.pick_handler(method)?;
        let unique_id = opts
            .unique_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let (tx, rx) = mpsc::unbounded_channel();

        self.running.lock().unwrap().insert(unique_id.clone());
        debug!(method, unique_id = %unique_id, "task started");

        let running = Arc::clone(&self.running);
        tokio::spawn(async move {
            let task = WorkTask {
                payload,
                unique_id: unique_id.clone(),
                sink: TaskSink::new(tx),
            };
            handler(task).await;
            running.lock().unwrap().remove(&unique_id);
        });
        Ok(rx)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn submit(
        &self,
        method: &str,
        payload: Vec<u8>,
        opts: SubmitOptions,
    ) -> Result<mpsc::UnboundedReceiver<TaskEvent>, TransportError> {
        self.start(method, payload, opts)
    }

    async fn submit_background(
        &self,
        method: &str,
        payload: Vec<u8>,
        opts: SubmitOptions,
    ) -> Result<(), TransportError> {
        // Dropping the receiver discards events; TaskSink sends are
        // best-effort so the worker never notices.
        self.start(method, payload, opts).map(drop)
    }

    async fn register_worker(
        &self,
        method: &str,
        handler: WorkHandler,
    ) -> Result<(), TransportError> {
        self.registry
            .lock()
            .unwrap()
            .handlers
            .entry(method.to_string())
            .or_default()
            .push(handler);
        debug!(method, "worker registered");
        let _ = self.connected.send(());
        Ok(())
    }

    async fn capacity(&self) -> Result<HashMap<String, HashMap<String, usize>>, TransportError> {
        let registry = self.registry.lock().unwrap();
        let functions = registry
            .handlers
            .iter()
            .map(|(method, handlers)| (method.clone(), handlers.len()))
            .collect();
        Ok(HashMap::from([(SERVER_NAME.to_string(), functions)]))
    }

    async fn running_unique_ids(&self) -> Result<HashSet<String>, TransportError> {
        Ok(self.running.lock().unwrap().clone())
    }

    async fn set_client_id(&self, id: &str) -> Result<(), TransportError> {
        *self.client_id.lock().unwrap() = Some(id.to_string());
        Ok(())
    }

    fn subscribe_connected(&self) -> broadcast::Receiver<()> {
        self.connected.subscribe()
    }
}
