//! JSON-RPC 2.0 envelope construction and validation.
//!
//! Envelopes are handled as raw JSON objects rather than a fixed struct
//! because presence matters: a request carrying a `result` member must be
//! rejected even when that result is `null`, and a notification is exactly
//! a request without an `id` member.

use serde_json::{json, Map, Value};

use crate::error::{codes, RpcError};

pub const JSONRPC_VERSION: &str = "2.0";

/// The `_meta.host` tag stamped on every outgoing envelope.
pub const META_HOST: &str = "gearbox";

/// Build a request (with `id`) or notification (without) envelope.
pub fn request(
    method: &str,
    params: Value,
    id: Option<&str>,
    meta: Option<Map<String, Value>>,
) -> Value {
    let mut meta_block = Map::new();
    meta_block.insert("host".into(), Value::String(META_HOST.into()));
    if let Some(extra) = meta {
        meta_block.extend(extra);
    }

    let mut pack = Map::new();
    pack.insert("jsonrpc".into(), Value::String(JSONRPC_VERSION.into()));
    pack.insert("method".into(), Value::String(method.into()));
    pack.insert("params".into(), params);
    pack.insert("_meta".into(), Value::Object(meta_block));
    if let Some(id) = id {
        pack.insert("id".into(), Value::String(id.into()));
    }
    Value::Object(pack)
}

/// Build a success reply.
pub fn respond(id: &str, result: Value) -> Value {
    json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "result": result })
}

/// Build an error reply.
pub fn error_reply(id: Option<&str>, err: &RpcError) -> Value {
    let mut error = Map::new();
    error.insert("code".into(), json!(err.code));
    error.insert("message".into(), Value::String(err.message.clone()));
    if let Some(data) = &err.data {
        error.insert("data".into(), data.clone());
    }
    json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "error": Value::Object(error) })
}

/// Validate a reply envelope: must be JSON-RPC 2.0 and not carry an error.
///
/// An error member is surfaced as a structured [`RpcError`]; bare-string
/// errors and unrecognized error shapes get their own codes so the caller
/// can tell a broken peer from a failing handler.
pub fn check_reply(data: &Value) -> Result<(), RpcError> {
    let obj = data.as_object();
    if obj.and_then(|o| o.get("jsonrpc")).and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(RpcError::new(codes::NOT_JSONRPC, "not jsonrpc response")
            .with_data(data.clone()));
    }

    let Some(error) = obj.and_then(|o| o.get("error")) else {
        return Ok(());
    };

    if let Some(s) = error.as_str() {
        return Err(RpcError::new(codes::REMOTE_STRING_ERROR, s.to_string()));
    }
    if let Ok(err) = serde_json::from_value::<RpcError>(error.clone()) {
        return Err(err);
    }
    Err(
        RpcError::new(codes::REMOTE_MALFORMED_ERROR, error.to_string())
            .with_data(data.clone()),
    )
}

/// Extract the `result` member, verifying the correlation id.
pub fn extract_result(id: &str, data: Value) -> Result<Value, RpcError> {
    let Value::Object(mut obj) = data else {
        return Err(RpcError::new(codes::NOT_JSONRPC, "not jsonrpc result"));
    };
    if obj.get("id").and_then(Value::as_str) != Some(id) {
        return Err(RpcError::new(codes::NOT_JSONRPC, "unmatched request id"));
    }
    obj.remove("result")
        .ok_or_else(|| RpcError::new(codes::NOT_JSONRPC, "not jsonrpc result"))
}

/// A validated incoming request, ready for a handler.
#[derive(Debug)]
pub struct IncomingRequest {
    /// `None` for notifications: no reply payload is produced.
    pub id: Option<String>,
    pub params: Value,
    pub meta: Map<String, Value>,
}

/// A rejected incoming request. Carries the id when one could be
/// recovered, so the error reply can still be correlated.
#[derive(Debug)]
pub struct RequestRejected {
    pub id: Option<String>,
    pub error: RpcError,
}

/// Parse and validate an incoming request payload for `expected_method`.
pub fn parse_request(
    payload: &[u8],
    expected_method: &str,
) -> Result<IncomingRequest, RequestRejected> {
    let reject = |id: Option<String>, error: RpcError| RequestRejected { id, error };

    let data: Value = match serde_json::from_slice(payload) {
        Ok(v) => v,
        Err(_) => {
            return Err(reject(
                None,
                RpcError::new(codes::NOT_JSONRPC, "invalid json")
                    .with_data(Value::String(String::from_utf8_lossy(payload).into_owned())),
            ));
        }
    };

    let Value::Object(mut obj) = data else {
        return Err(reject(
            None,
            RpcError::new(codes::NOT_JSONRPC, "invalid request"),
        ));
    };
    let id = obj.get("id").and_then(Value::as_str).map(str::to_owned);

    if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(reject(
            id,
            RpcError::new(codes::NOT_JSONRPC, "not jsonrpc request"),
        ));
    }
    if obj.contains_key("result") {
        return Err(reject(
            id,
            RpcError::new(codes::RESULT_AS_REQUEST, "result sent as request"),
        ));
    }

    match obj.get("method").and_then(Value::as_str) {
        None | Some("") => {
            return Err(reject(
                id,
                RpcError::new(codes::NOT_JSONRPC, "invalid request"),
            ));
        }
        Some(method) if method != expected_method => {
            return Err(reject(
                id,
                RpcError::new(codes::METHOD_NOT_FOUND, "method not found")
                    .with_data(Value::String(method.to_string())),
            ));
        }
        Some(_) => {}
    }

    let meta = match obj.remove("_meta") {
        Some(Value::Object(m)) => m,
        _ => Map::new(),
    };
    let params = obj.remove("params").unwrap_or(Value::Null);

    Ok(IncomingRequest { id, params, meta })
}
