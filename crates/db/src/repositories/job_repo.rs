//! PostgreSQL implementation of the [`JobStore`] ledger contract.
//!
//! Every write is a narrow per-id statement; status strings come from
//! `gearbox_core::state::JobState::as_str` so the ledger and the state
//! machine can never disagree on spelling.

use async_trait::async_trait;
use gearbox_core::types::JobId;
use sqlx::PgPool;
use tracing::debug;

use crate::models::job::{Job, JobUpdate, JobWithPredecessor, NewJob};
use crate::models::stats::{MethodAggregates, MethodStats, StatusCount};
use crate::store::{JobStore, StoreError};

/// Column list for `gearbox_jobs` queries; the table is always aliased `j`
/// so the same list serves the predecessor join.
const COLUMNS: &str = "\
    j.id, j.method_name, j.arguments, j.priority, j.disambiguator, \
    j.after_date, j.after_id, j.before_id, \
    j.max_retries, j.retry_delay, j.retries, j.status, \
    j.runner_instance, j.result_data, j.progress_status, j.progress_updated, \
    j.see_other, j.created, j.updated, j.completed";

/// Joined predecessor columns (`after_id` row's status and retry budget).
const PREDECESSOR_COLUMNS: &str = "\
    p.status AS after_status, p.retries AS after_retries, \
    p.max_retries AS after_max_retries";

/// Rows that can never transition again. Errored rows are only terminal
/// once retries are exhausted, hence the extra predicate.
const NON_TERMINAL: &str = "\
    j.status NOT IN ('complete', 'invalid', 'duplicate') \
    AND NOT (j.status = 'errored' AND j.retries >= j.max_retries)";

/// The job ledger backed by PostgreSQL.
#[derive(Clone)]
pub struct JobRepo {
    pool: PgPool,
}

impl JobRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for JobRepo {
    async fn insert(&self, job: NewJob) -> Result<Job, StoreError> {
        let query = format!(
            "INSERT INTO gearbox_jobs AS j \
                 (method_name, arguments, priority, disambiguator, \
                  after_date, after_id, before_id, max_retries, retry_delay, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query_as::<_, Job>(&query)
            .bind(&job.method_name)
            .bind(&job.arguments)
            .bind(job.priority.as_str())
            .bind(&job.disambiguator)
            .bind(job.after_date)
            .bind(job.after_id)
            .bind(job.before_id)
            .bind(job.max_retries)
            .bind(job.retry_delay)
            .bind(job.status.as_str())
            .fetch_one(&self.pool)
            .await?;
        debug!(job_id = row.id, method = %row.method_name, "job row inserted");
        Ok(row)
    }

    async fn fetch(&self, id: JobId) -> Result<Option<JobWithPredecessor>, StoreError> {
        let query = format!(
            "SELECT {COLUMNS}, {PREDECESSOR_COLUMNS} \
             FROM gearbox_jobs j \
             LEFT JOIN gearbox_jobs p ON p.id = j.after_id \
             WHERE j.id = $1"
        );
        Ok(sqlx::query_as::<_, JobWithPredecessor>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn update(&self, id: JobId, update: JobUpdate) -> Result<(), StoreError> {
        // Build the SET list and track the next bind parameter index
        // (same pattern as the dynamic listing queries).
        let mut sets: Vec<String> = vec!["updated = NOW()".to_string()];
        let mut bind_idx: u32 = 1;
        let mut push = |sets: &mut Vec<String>, column: &str| {
            sets.push(format!("{column} = ${bind_idx}"));
            bind_idx += 1;
        };

        if update.status.is_some() {
            push(&mut sets, "status");
        }
        if update.retries.is_some() {
            push(&mut sets, "retries");
        }
        if update.after_date.is_some() {
            push(&mut sets, "after_date");
        }
        if update.runner_instance.is_some() {
            push(&mut sets, "runner_instance");
        }
        if update.result_data.is_some() {
            push(&mut sets, "result_data");
        }
        if update.progress_status.is_some() {
            push(&mut sets, "progress_status");
            sets.push("progress_updated = NOW()".to_string());
        }
        if update.see_other.is_some() {
            push(&mut sets, "see_other");
        }
        if update.completed.is_some() {
            push(&mut sets, "completed");
        }

        let query = format!(
            "UPDATE gearbox_jobs SET {} WHERE id = ${bind_idx}",
            sets.join(", "),
        );

        let mut q = sqlx::query(&query);
        if let Some(status) = update.status {
            q = q.bind(status.as_str());
        }
        if let Some(retries) = update.retries {
            q = q.bind(retries);
        }
        if let Some(after_date) = update.after_date {
            q = q.bind(after_date);
        }
        if let Some(runner) = update.runner_instance {
            q = q.bind(runner);
        }
        if let Some(result) = update.result_data {
            q = q.bind(result);
        }
        if let Some(progress) = update.progress_status {
            q = q.bind(progress);
        }
        if let Some(see_other) = update.see_other {
            q = q.bind(see_other);
        }
        if let Some(completed) = update.completed {
            q = q.bind(completed);
        }

        let result = q.bind(id).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        debug!(job_id = id, columns = sets.len(), "job row updated");
        Ok(())
    }

    async fn current_jobs(&self) -> Result<Vec<JobWithPredecessor>, StoreError> {
        let query = format!(
            "SELECT {COLUMNS}, {PREDECESSOR_COLUMNS} \
             FROM gearbox_jobs j \
             LEFT JOIN gearbox_jobs p ON p.id = j.after_id \
             WHERE {NON_TERMINAL} \
             ORDER BY j.created DESC"
        );
        Ok(sqlx::query_as::<_, JobWithPredecessor>(&query)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn blocked_on(&self, id: JobId) -> Result<Vec<Job>, StoreError> {
        let query = format!(
            "SELECT {COLUMNS} FROM gearbox_jobs j \
             WHERE j.before_id = $1 AND j.status != 'complete'"
        );
        Ok(sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn running_with_disambiguator(
        &self,
        disambiguator: &str,
        exclude: Option<JobId>,
    ) -> Result<Option<Job>, StoreError> {
        let query = format!(
            "SELECT {COLUMNS} FROM gearbox_jobs j \
             WHERE j.disambiguator = $1 AND j.status = 'running' \
               AND ($2::BIGINT IS NULL OR j.id != $2) \
             ORDER BY j.created ASC \
             LIMIT 1"
        );
        Ok(sqlx::query_as::<_, Job>(&query)
            .bind(disambiguator)
            .bind(exclude)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn method_stats(&self, method_name: &str) -> Result<MethodStats, StoreError> {
        let counts = sqlx::query_as::<_, StatusCount>(
            "SELECT status, COUNT(*) AS count \
             FROM gearbox_jobs \
             WHERE method_name = $1 \
             GROUP BY status \
             ORDER BY status",
        )
        .bind(method_name)
        .fetch_all(&self.pool)
        .await?;

        // Trimmed means exclude rows more than one stddev from the mean.
        let aggregates = sqlx::query_as::<_, MethodAggregates>(
            "WITH done AS ( \
                 SELECT retries::float8 AS retries, \
                        EXTRACT(EPOCH FROM (completed - created))::float8 AS latency \
                 FROM gearbox_jobs \
                 WHERE method_name = $1 AND completed IS NOT NULL \
             ), base AS ( \
                 SELECT AVG(retries) AS retries_mean, \
                        STDDEV_SAMP(retries) AS retries_stddev, \
                        AVG(latency) AS latency_mean_secs, \
                        STDDEV_SAMP(latency) AS latency_stddev_secs \
                 FROM done \
             ) \
             SELECT base.retries_mean, base.retries_stddev, \
                    base.latency_mean_secs, base.latency_stddev_secs, \
                    (SELECT AVG(d.retries) FROM done d \
                     WHERE base.retries_stddev IS NULL \
                        OR ABS(d.retries - base.retries_mean) <= base.retries_stddev) \
                        AS trimmed_retries_mean, \
                    (SELECT AVG(d.latency) FROM done d \
                     WHERE base.latency_stddev_secs IS NULL \
                        OR ABS(d.latency - base.latency_mean_secs) <= base.latency_stddev_secs) \
                        AS trimmed_latency_mean_secs \
             FROM base",
        )
        .bind(method_name)
        .fetch_optional(&self.pool)
        .await?
        .unwrap_or_default();

        Ok(MethodStats {
            method_name: method_name.to_string(),
            counts,
            aggregates,
        })
    }
}
