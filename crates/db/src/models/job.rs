//! Job row models and DTOs for the `gearbox_jobs` ledger table.

use gearbox_core::state::{DepStatus, JobPriority, JobSnapshot, JobState};
use gearbox_core::types::{JobId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// A row from `gearbox_jobs`.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Job {
    pub id: JobId,
    pub method_name: String,
    pub arguments: serde_json::Value,
    #[sqlx(try_from = "String")]
    pub priority: JobPriority,
    pub disambiguator: String,
    pub after_date: Option<Timestamp>,
    pub after_id: Option<JobId>,
    pub before_id: Option<JobId>,
    pub max_retries: i32,
    pub retry_delay: i32,
    pub retries: i32,
    #[sqlx(try_from = "String")]
    pub status: JobState,
    pub runner_instance: Option<String>,
    pub result_data: Option<serde_json::Value>,
    pub progress_status: Option<i16>,
    pub progress_updated: Option<Timestamp>,
    pub see_other: Option<JobId>,
    pub created: Timestamp,
    pub updated: Timestamp,
    pub completed: Option<Timestamp>,
}

impl Job {
    /// The pure-logic view of this row.
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            state: self.status,
            after_date: self.after_date,
            has_predecessor: self.after_id.is_some(),
            retries: self.retries,
            max_retries: self.max_retries,
            retry_delay_secs: self.retry_delay as i64,
            updated: self.updated,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.snapshot().is_terminal()
    }
}

/// A job row joined with its `after_id` predecessor's status columns.
#[derive(Debug, Clone, FromRow)]
pub struct JobWithPredecessor {
    #[sqlx(flatten)]
    pub job: Job,
    pub after_status: Option<String>,
    pub after_retries: Option<i32>,
    pub after_max_retries: Option<i32>,
}

impl JobWithPredecessor {
    /// Decode the joined predecessor columns, if the join matched.
    pub fn predecessor(&self) -> Option<DepStatus> {
        let id = self.job.after_id?;
        let state = JobState::parse(self.after_status.as_deref()?)?;
        Some(DepStatus {
            id,
            state,
            retries: self.after_retries.unwrap_or(0),
            max_retries: self.after_max_retries.unwrap_or(0),
        })
    }
}

/// Insert DTO for a new ledger row.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub method_name: String,
    pub arguments: serde_json::Value,
    pub priority: JobPriority,
    pub disambiguator: String,
    pub after_date: Option<Timestamp>,
    pub after_id: Option<JobId>,
    pub before_id: Option<JobId>,
    pub max_retries: i32,
    pub retry_delay: i32,
    pub status: JobState,
}

/// Narrow update-by-id. `None` fields are left untouched; `updated` is
/// always bumped, and setting `progress_status` also bumps
/// `progress_updated`.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobState>,
    pub retries: Option<i32>,
    pub after_date: Option<Timestamp>,
    pub runner_instance: Option<String>,
    pub result_data: Option<serde_json::Value>,
    pub progress_status: Option<i16>,
    pub see_other: Option<JobId>,
    pub completed: Option<Timestamp>,
}

impl JobUpdate {
    pub fn status(status: JobState) -> Self {
        JobUpdate {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.retries.is_none()
            && self.after_date.is_none()
            && self.runner_instance.is_none()
            && self.result_data.is_none()
            && self.progress_status.is_none()
            && self.see_other.is_none()
            && self.completed.is_none()
    }
}
