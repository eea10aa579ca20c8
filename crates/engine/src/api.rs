//! The engine's RPC surface, registered under the `gearbox\core`
//! namespace on the engine's own bridge.

use std::sync::Arc;

use futures::FutureExt;
use gearbox_core::types::JobId;
use gearbox_rpc::{codes, RpcError};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::machine::{JobDataRequest, JobEngine, QueueRequest};

pub const NAMESPACE: &str = "gearbox\\core";

/// Fully qualified method name: `ns\sub::name`.
pub fn method(name: &str) -> String {
    format!("{NAMESPACE}::{name}")
}

fn params<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, RpcError> {
    let value = if value.is_null() { json!({}) } else { value };
    serde_json::from_value(value).map_err(|err| {
        RpcError::new(codes::NOT_JSONRPC, "invalid params").with_data(json!(err.to_string()))
    })
}

#[derive(Debug, Deserialize)]
struct WatchParams {
    id: JobId,
    #[serde(default = "default_wait")]
    wait: bool,
}

fn default_wait() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
struct StatusParams {
    #[serde(default)]
    ids: Option<Vec<JobId>>,
}

#[derive(Debug, Deserialize)]
struct StatsParams {
    method: String,
}

/// Register `queue`, `watch`, `job_data`, `status`, and `stats`.
pub async fn register_handlers(engine: Arc<JobEngine>) -> Result<(), RpcError> {
    let bridge = Arc::clone(engine.bridge());

    let queue_engine = Arc::clone(&engine);
    bridge
        .register(
            &method("queue"),
            Arc::new(move |value, _ctx| {
                let engine = Arc::clone(&queue_engine);
                async move {
                    let req: QueueRequest = params(value)?;
                    let id = engine.queue(req).await.map_err(RpcError::from)?;
                    Ok(json!({ "id": id }))
                }
                .boxed()
            }),
        )
        .await?;

    let watch_engine = Arc::clone(&engine);
    bridge
        .register(
            &method("watch"),
            Arc::new(move |value, _ctx| {
                let engine = Arc::clone(&watch_engine);
                async move {
                    let req: WatchParams = params(value)?;
                    if req.wait {
                        engine.watch(req.id).await.map_err(RpcError::from)
                    } else {
                        let job = engine.peek(req.id).await.map_err(RpcError::from)?;
                        serde_json::to_value(job).map_err(|e| RpcError::unexpected(&e))
                    }
                }
                .boxed()
            }),
        )
        .await?;

    let data_engine = Arc::clone(&engine);
    bridge
        .register(
            &method("job_data"),
            Arc::new(move |value, _ctx| {
                let engine = Arc::clone(&data_engine);
                async move {
                    let req: JobDataRequest = params(value)?;
                    engine.job_data(req).await.map_err(RpcError::from)?;
                    Ok(Value::Null)
                }
                .boxed()
            }),
        )
        .await?;

    let status_engine = Arc::clone(&engine);
    bridge
        .register(
            &method("status"),
            Arc::new(move |value, _ctx| {
                let engine = Arc::clone(&status_engine);
                async move {
                    let req: StatusParams = params(value)?;
                    let jobs = engine.status(req.ids).await.map_err(RpcError::from)?;
                    serde_json::to_value(jobs).map_err(|e| RpcError::unexpected(&e))
                }
                .boxed()
            }),
        )
        .await?;

    let stats_engine = Arc::clone(&engine);
    bridge
        .register(
            &method("stats"),
            Arc::new(move |value, _ctx| {
                let engine = Arc::clone(&stats_engine);
                async move {
                    let req: StatsParams = params(value)?;
                    let stats = engine.stats(&req.method).await.map_err(RpcError::from)?;
                    serde_json::to_value(stats).map_err(|e| RpcError::unexpected(&e))
                }
                .boxed()
            }),
        )
        .await?;

    Ok(())
}
