//! Aggregate per-method statistics models.

use serde::Serialize;
use sqlx::FromRow;

/// Count of jobs in one status for a method.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct StatusCount {
    pub status: String,
    pub count: i64,
}

/// Mean/stddev aggregates over retries and completion latency.
///
/// The `trimmed_*` variants exclude rows more than one standard deviation
/// from the mean, so a single pathological job does not skew the picture.
#[derive(Debug, Clone, Default, FromRow, Serialize)]
pub struct MethodAggregates {
    pub retries_mean: Option<f64>,
    pub retries_stddev: Option<f64>,
    pub latency_mean_secs: Option<f64>,
    pub latency_stddev_secs: Option<f64>,
    pub trimmed_retries_mean: Option<f64>,
    pub trimmed_latency_mean_secs: Option<f64>,
}

/// Full statistics bundle for one method name.
#[derive(Debug, Clone, Serialize)]
pub struct MethodStats {
    pub method_name: String,
    pub counts: Vec<StatusCount>,
    #[serde(flatten)]
    pub aggregates: MethodAggregates,
}
