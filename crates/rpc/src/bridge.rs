//! Request/response bridge over a [`Transport`].
//!
//! The submitter side wraps params in a JSON-RPC envelope with an
//! instance-scoped request id and waits for the matching reply; the worker
//! side wraps registered handlers so that every malformed payload, handler
//! error, and panic comes back as a structured error reply instead of
//! killing the worker.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::envelope;
use crate::error::{codes, RpcError};
use crate::transport::{SubmitOptions, TaskEvent, TaskSink, Transport, TransportError, WorkTask};

use gearbox_core::state::JobPriority;

/// Options for a single outgoing call.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub priority: JobPriority,
    /// Transport tracking key; also surfaced to the handler as
    /// `_meta.uniqueid`.
    pub unique_id: Option<String>,
    /// Extra `_meta` members for the handler.
    pub meta: Option<Map<String, Value>>,
}

/// Worker-side context for one request.
pub struct HandlerContext {
    /// The request's `_meta` block.
    pub meta: Map<String, Value>,
    sink: TaskSink,
}

impl HandlerContext {
    /// Report a progress status line back to the submitter.
    pub fn progress(&self, status: impl Into<String>) {
        self.sink.progress(status);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.sink.warn(message);
    }

    /// The `_meta.jobid` stamped by the dispatcher, when there is one.
    pub fn job_id(&self) -> Option<i64> {
        self.meta.get("jobid").and_then(Value::as_i64)
    }
}

pub type Handler =
    Arc<dyn Fn(Value, HandlerContext) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;

pub struct RpcBridge {
    transport: Arc<dyn Transport>,
    instance: String,
    counter: AtomicU64,
}

impl RpcBridge {
    pub fn new(transport: Arc<dyn Transport>, instance: impl Into<String>) -> Self {
        Self {
            transport,
            instance: instance.into(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{n}", self.instance)
    }

    /// Call `method` and wait for its result.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        opts: CallOptions,
    ) -> Result<Value, RpcError> {
        let id = self.next_id();
        let mut meta = opts.meta.unwrap_or_default();
        if let Some(unique_id) = &opts.unique_id {
            meta.insert("uniqueid".into(), Value::String(unique_id.clone()));
        }
        let pack = envelope::request(method, params, Some(&id), Some(meta));

        let submit = SubmitOptions {
            priority: opts.priority,
            unique_id: opts.unique_id,
        };
        let mut events = self
            .transport
            .submit(method, encode(&pack), submit)
            .await
            .map_err(|e| transport_error(method, e))?;

        loop {
            match events.recv().await {
                Some(TaskEvent::Progress { status }) => {
                    debug!(method, request_id = %id, status = %status, "task progress");
                }
                Some(TaskEvent::Warning { message }) => {
                    warn!(method, request_id = %id, message = %message, "task warning");
                }
                Some(TaskEvent::Done { payload }) => {
                    let reply = decode(&payload)?;
                    envelope::check_reply(&reply)?;
                    return envelope::extract_result(&id, reply);
                }
                Some(TaskEvent::Failed { payload }) => {
                    let reply = decode(&payload)?;
                    // A failed task must carry a structured error; anything
                    // else is a malformed peer.
                    return match envelope::check_reply(&reply) {
                        Err(err) => Err(err),
                        Ok(()) => Err(RpcError::new(
                            codes::REMOTE_MALFORMED_ERROR,
                            "task failed without an error member",
                        )
                        .with_data(reply)),
                    };
                }
                None => {
                    return Err(RpcError::new(codes::WENT_MISSING, "task abandoned by worker")
                        .with_data(Value::String(method.to_string())));
                }
            }
        }
    }

    /// Fire a notification: no id, no reply.
    pub async fn notify(
        &self,
        method: &str,
        params: Value,
        opts: CallOptions,
    ) -> Result<(), RpcError> {
        let mut meta = opts.meta.unwrap_or_default();
        if let Some(unique_id) = &opts.unique_id {
            meta.insert("uniqueid".into(), Value::String(unique_id.clone()));
        }
        let pack = envelope::request(method, params, None, Some(meta));
        self.transport
            .submit_background(
                method,
                encode(&pack),
                SubmitOptions {
                    priority: opts.priority,
                    unique_id: opts.unique_id,
                },
            )
            .await
            .map_err(|e| transport_error(method, e))
    }

    /// Register a handler for `method`, wrapped so every outcome becomes a
    /// well-formed reply: validation failures and handler errors produce
    /// error envelopes, and panics are caught and wrapped rather than
    /// tearing the worker down.
    pub async fn register(&self, method: &str, handler: Handler) -> Result<(), RpcError> {
        let method_owned = method.to_string();
        let work = Arc::new(move |task: WorkTask| {
            let handler = Arc::clone(&handler);
            let method = method_owned.clone();
            async move {
                let request = match envelope::parse_request(&task.payload, &method) {
                    Ok(request) => request,
                    Err(rejected) => {
                        warn!(
                            method = %method,
                            code = rejected.error.code,
                            "rejected malformed request"
                        );
                        let reply = envelope::error_reply(rejected.id.as_deref(), &rejected.error);
                        task.sink.fail(encode(&reply));
                        return;
                    }
                };

                let ctx = HandlerContext {
                    meta: request.meta,
                    sink: task.sink.clone(),
                };
                let outcome =
                    match AssertUnwindSafe(handler(request.params, ctx)).catch_unwind().await {
                        Ok(result) => result,
                        Err(panic) => Err(RpcError::new(
                            codes::HANDLER_FAILED,
                            format!("handler panicked: {}", panic_message(panic.as_ref())),
                        )),
                    };

                match (request.id, outcome) {
                    (Some(id), Ok(result)) => task.sink.done(encode(&envelope::respond(&id, result))),
                    (Some(id), Err(err)) => {
                        task.sink.fail(encode(&envelope::error_reply(Some(&id), &err)))
                    }
                    // Notifications have nobody to reply to.
                    (None, Ok(_)) => {}
                    (None, Err(err)) => {
                        warn!(method = %method, code = err.code, error = %err, "notification handler failed")
                    }
                }
            }
            .boxed()
        });

        self.transport
            .register_worker(method, work)
            .await
            .map_err(|e| transport_error(method, e))
    }
}

fn encode(value: &Value) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}

fn decode(payload: &[u8]) -> Result<Value, RpcError> {
    serde_json::from_slice(payload).map_err(|_| {
        RpcError::new(codes::NOT_JSONRPC, "invalid json reply")
            .with_data(Value::String(String::from_utf8_lossy(payload).into_owned()))
    })
}

fn transport_error(method: &str, err: TransportError) -> RpcError {
    match err {
        TransportError::NoWorker { method } => {
            RpcError::new(codes::NO_WORKER, "no worker available")
                .with_data(Value::String(method))
        }
        other => RpcError::new(codes::HANDLER_FAILED, other.to_string())
            .with_data(Value::String(method.to_string())),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
