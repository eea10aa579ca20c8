//! The gearbox orchestration engine.
//!
//! Owns the job lifecycle end to end: accepts submissions, persists them
//! in the ledger, evaluates eligibility, dispatches work over the bridge,
//! tracks retries and missing jobs, and resolves watches. The engine's
//! entire caller-facing surface is the RPC methods registered in
//! [`api`]; `gearboxd` is the long-lived process hosting it.

pub mod api;
pub mod config;
pub mod error;
pub mod machine;
pub mod timers;
pub mod watch;

pub use config::EngineConfig;
pub use error::EngineError;
pub use machine::JobEngine;
