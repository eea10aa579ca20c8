//! Engine-level errors and their mapping onto the wire taxonomy.

use gearbox_core::types::JobId;
use gearbox_db::StoreError;
use gearbox_rpc::transport::TransportError;
use gearbox_rpc::{codes, RpcError};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no such job {0}")]
    NoSuchJob(JobId),

    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// Everything a remote caller can see becomes a structured `{code,
/// message, data}`; store and transport failures are wrapped as 500s
/// with their source chain attached.
impl From<EngineError> for RpcError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NoSuchJob(id) => {
                RpcError::new(codes::NO_SUCH_JOB, "no such job").with_data(json!(id))
            }
            EngineError::InvalidSubmission(message) => {
                RpcError::new(codes::MISSING_METHOD_NAME, message)
            }
            EngineError::ShuttingDown => {
                RpcError::new(codes::HANDLER_FAILED, "engine is shutting down")
            }
            EngineError::Store(StoreError::NotFound(id)) => {
                RpcError::new(codes::NO_SUCH_JOB, "no such job").with_data(json!(id))
            }
            EngineError::Store(store) => RpcError::unexpected(&store),
            EngineError::Transport(transport) => RpcError::unexpected(&transport),
            EngineError::Rpc(rpc) => rpc,
        }
    }
}
