/// All ledger primary keys are PostgreSQL BIGSERIAL.
pub type JobId = i64;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
