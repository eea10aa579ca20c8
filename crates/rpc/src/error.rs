//! Structured RPC errors.
//!
//! Every failure crossing the bridge is `{code, message, data}`; no
//! stringly-typed errors reach a remote caller.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error codes used across the protocol and the engine.
pub mod codes {
    /// Payload is not a JSON-RPC 2.0 envelope / malformed JSON / invalid request.
    pub const NOT_JSONRPC: i64 = -32600;
    /// The envelope names a method this worker does not expose.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// A reply envelope arrived where a request was expected.
    pub const RESULT_AS_REQUEST: i64 = -32603;
    /// The remote error member was a bare string.
    pub const REMOTE_STRING_ERROR: i64 = -33020;
    /// The remote error member had an unrecognized shape.
    pub const REMOTE_MALFORMED_ERROR: i64 = -33040;

    /// Submission rejected: no method name.
    pub const MISSING_METHOD_NAME: i64 = 400;
    /// Watch/update on an unknown job id.
    pub const NO_SUCH_JOB: i64 = 404;
    /// A predecessor or blocker exhausted its retries and errored.
    pub const DEPENDENCY_FAILED: i64 = 410;
    /// An unexpected handler failure, wrapped with diagnostics.
    pub const HANDLER_FAILED: i64 = 500;
    /// No worker currently available for the method.
    pub const NO_WORKER: i64 = 503;
    /// The job disappeared from the transport past the grace period.
    pub const WENT_MISSING: i64 = 504;
    /// The worker posted a terminal status outside the known set.
    pub const INVALID_STATUS: i64 = 422;
}

/// A structured remote error: `{code, message, data}`.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("{message} (code {code})")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Wrap a failure that is not already structured, capturing the error's
    /// source chain under `data.stack` so the remote caller never sees an
    /// unstructured failure.
    pub fn unexpected(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut stack = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            stack.push(cause.to_string());
            source = cause.source();
        }
        Self {
            code: codes::HANDLER_FAILED,
            message: err.to_string(),
            data: Some(serde_json::json!({ "stack": stack })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_without_null_data() {
        let err = RpcError::new(codes::NO_WORKER, "no worker");
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(v, serde_json::json!({"code": 503, "message": "no worker"}));
    }

    #[derive(Debug, thiserror::Error)]
    #[error("pipeline stalled")]
    struct Stalled(#[from] std::io::Error);

    #[test]
    fn unexpected_captures_source_chain() {
        let err = Stalled::from(std::io::Error::other("disk on fire"));
        let wrapped = RpcError::unexpected(&err);
        assert_eq!(wrapped.code, codes::HANDLER_FAILED);
        assert_eq!(wrapped.message, "pipeline stalled");
        let stack = wrapped.data.unwrap()["stack"].clone();
        assert_eq!(stack, serde_json::json!(["disk on fire"]));
    }
}
