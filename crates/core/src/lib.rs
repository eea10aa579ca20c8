//! Pure domain logic for the gearbox job-orchestration engine.
//!
//! Everything in this crate is side-effect-free: the job state enum, the
//! state-machine decision function, retry backoff math, and scheduling
//! constants. No database or transport types appear here so the decision
//! logic can be unit-tested exhaustively and reused by any front end.

pub mod error;
pub mod scheduling;
pub mod state;
pub mod types;
