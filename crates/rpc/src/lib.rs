//! The gearbox dispatch bridge.
//!
//! Wraps a generic work-distribution [`transport::Transport`] in a
//! JSON-RPC-2.0-shaped request/response protocol: correlated request ids,
//! structured errors, and worker-side handler registration with a progress
//! side-channel. The [`memory::MemoryTransport`] provides a fully
//! in-process transport for local mode and tests.

pub mod bridge;
pub mod envelope;
pub mod error;
pub mod memory;
pub mod transport;

pub use bridge::{CallOptions, Handler, HandlerContext, RpcBridge};
pub use error::{codes, RpcError};
pub use transport::{SubmitOptions, Transport, TransportError};
