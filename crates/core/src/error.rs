//! Domain-level error type shared across the workspace.

/// Errors produced by pure domain logic.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A status string in the ledger did not match any known state.
    #[error("Unknown job status: {0:?}")]
    UnknownStatus(String),
}
