//! The narrow query/update contract the engine requires from the ledger.
//!
//! The engine only ever talks to `dyn JobStore`, so tests can drive the
//! full state machine against an in-memory store while production uses
//! [`crate::JobRepo`] over PostgreSQL.

use async_trait::async_trait;
use gearbox_core::types::JobId;

use crate::models::job::{Job, JobUpdate, JobWithPredecessor, NewJob};
use crate::models::stats::MethodStats;

/// Errors surfaced by a ledger backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No row with the given id.
    #[error("Job {0} not found")]
    NotFound(JobId),

    /// A query failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A non-sqlx backend failed (in-memory store, etc.).
    #[error("Store error: {0}")]
    Backend(String),
}

/// Durable record of every job. All access is per-job and scoped by id;
/// no bulk updates that could race with a concurrent evaluator.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new row and return it.
    async fn insert(&self, job: NewJob) -> Result<Job, StoreError>;

    /// Fetch one row with its predecessor's status joined in.
    async fn fetch(&self, id: JobId) -> Result<Option<JobWithPredecessor>, StoreError>;

    /// Narrow update-by-id. Errors with [`StoreError::NotFound`] if the
    /// row does not exist.
    async fn update(&self, id: JobId, update: JobUpdate) -> Result<(), StoreError>;

    /// All non-terminal jobs, newest first, with the predecessor join.
    async fn current_jobs(&self) -> Result<Vec<JobWithPredecessor>, StoreError>;

    /// Jobs whose `before_id` points at `id` and are not yet complete.
    async fn blocked_on(&self, id: JobId) -> Result<Vec<Job>, StoreError>;

    /// A `running` job carrying this disambiguator, excluding `exclude`.
    /// Best-effort: not atomic with the caller's subsequent update.
    async fn running_with_disambiguator(
        &self,
        disambiguator: &str,
        exclude: Option<JobId>,
    ) -> Result<Option<Job>, StoreError>;

    /// Aggregate statistics for one method name.
    async fn method_stats(&self, method_name: &str) -> Result<MethodStats, StoreError>;
}
