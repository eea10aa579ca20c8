//! Shared harness: an in-memory ledger plus the memory transport, so the
//! full engine runs without PostgreSQL.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use gearbox_core::state::{self, JobState};
use gearbox_core::types::JobId;
use gearbox_db::models::job::{Job, JobUpdate, JobWithPredecessor, NewJob};
use gearbox_db::models::stats::{MethodAggregates, MethodStats, StatusCount};
use gearbox_db::{JobStore, StoreError};
use gearbox_engine::machine::JobDataRequest;
use gearbox_engine::{api, EngineConfig, JobEngine};
use gearbox_rpc::memory::MemoryTransport;
use gearbox_rpc::transport::Transport;
use gearbox_rpc::RpcError;
use serde_json::{json, Value};

pub const INSTANCE: &str = "test-engine";

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: JobId,
    rows: BTreeMap<JobId, Job>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct row access for assertions.
    pub fn get(&self, id: JobId) -> Option<Job> {
        self.inner.lock().unwrap().rows.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().rows.len()
    }

    /// Shift a row's `updated` into the past, to exercise grace-period
    /// deadlines without real waiting.
    pub fn backdate_updated(&self, id: JobId, secs: i64) {
        if let Some(row) = self.inner.lock().unwrap().rows.get_mut(&id) {
            row.updated -= chrono::Duration::seconds(secs);
        }
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert(&self, job: NewJob) -> Result<Job, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let now = state::now();
        let row = Job {
            id: inner.next_id,
            method_name: job.method_name,
            arguments: job.arguments,
            priority: job.priority,
            disambiguator: job.disambiguator,
            after_date: job.after_date,
            after_id: job.after_id,
            before_id: job.before_id,
            max_retries: job.max_retries,
            retry_delay: job.retry_delay,
            retries: 0,
            status: job.status,
            runner_instance: None,
            result_data: None,
            progress_status: None,
            progress_updated: None,
            see_other: None,
            created: now,
            updated: now,
            completed: None,
        };
        inner.rows.insert(row.id, row.clone());
        Ok(row)
    }

    async fn fetch(&self, id: JobId) -> Result<Option<JobWithPredecessor>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.rows.get(&id).map(|job| {
            let predecessor = job.after_id.and_then(|p| inner.rows.get(&p));
            JobWithPredecessor {
                job: job.clone(),
                after_status: predecessor.map(|p| p.status.as_str().to_string()),
                after_retries: predecessor.map(|p| p.retries),
                after_max_retries: predecessor.map(|p| p.max_retries),
            }
        }))
    }

    async fn update(&self, id: JobId, update: JobUpdate) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let row = inner.rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let now = state::now();
        row.updated = now;
        if let Some(status) = update.status {
            row.status = status;
        }
        if let Some(retries) = update.retries {
            row.retries = retries;
        }
        if let Some(after_date) = update.after_date {
            row.after_date = Some(after_date);
        }
        if let Some(runner) = update.runner_instance {
            row.runner_instance = Some(runner);
        }
        if let Some(result) = update.result_data {
            row.result_data = Some(result);
        }
        if let Some(progress) = update.progress_status {
            row.progress_status = Some(progress);
            row.progress_updated = Some(now);
        }
        if let Some(see_other) = update.see_other {
            row.see_other = Some(see_other);
        }
        if let Some(completed) = update.completed {
            row.completed = Some(completed);
        }
        Ok(())
    }

    async fn current_jobs(&self) -> Result<Vec<JobWithPredecessor>, StoreError> {
        let ids: Vec<JobId> = {
            let inner = self.inner.lock().unwrap();
            let mut rows: Vec<&Job> = inner.rows.values().filter(|j| !j.is_terminal()).collect();
            rows.sort_by(|a, b| b.created.cmp(&a.created).then(b.id.cmp(&a.id)));
            rows.iter().map(|j| j.id).collect()
        };
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = self.fetch(id).await? {
                out.push(row);
            }
        }
        Ok(out)
    }

    async fn blocked_on(&self, id: JobId) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .rows
            .values()
            .filter(|j| j.before_id == Some(id) && j.status != JobState::Complete)
            .cloned()
            .collect())
    }

    async fn running_with_disambiguator(
        &self,
        disambiguator: &str,
        exclude: Option<JobId>,
    ) -> Result<Option<Job>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .rows
            .values()
            .filter(|j| {
                j.disambiguator == disambiguator
                    && j.status == JobState::Running
                    && Some(j.id) != exclude
            })
            .min_by_key(|j| (j.created, j.id))
            .cloned())
    }

    async fn method_stats(&self, method_name: &str) -> Result<MethodStats, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut by_status: BTreeMap<&'static str, i64> = BTreeMap::new();
        let mut done: Vec<(f64, f64)> = Vec::new();
        for job in inner.rows.values().filter(|j| j.method_name == method_name) {
            *by_status.entry(job.status.as_str()).or_default() += 1;
            if let Some(completed) = job.completed {
                let latency = (completed - job.created).num_milliseconds() as f64 / 1000.0;
                done.push((job.retries as f64, latency));
            }
        }
        let counts = by_status
            .into_iter()
            .map(|(status, count)| StatusCount {
                status: status.to_string(),
                count,
            })
            .collect();

        let retries: Vec<f64> = done.iter().map(|(r, _)| *r).collect();
        let latencies: Vec<f64> = done.iter().map(|(_, l)| *l).collect();
        let (retries_mean, retries_stddev, trimmed_retries_mean) = summarize(&retries);
        let (latency_mean_secs, latency_stddev_secs, trimmed_latency_mean_secs) =
            summarize(&latencies);
        Ok(MethodStats {
            method_name: method_name.to_string(),
            counts,
            aggregates: MethodAggregates {
                retries_mean,
                retries_stddev,
                latency_mean_secs,
                latency_stddev_secs,
                trimmed_retries_mean,
                trimmed_latency_mean_secs,
            },
        })
    }
}

/// Mean, sample stddev, and the one-stddev trimmed mean.
fn summarize(values: &[f64]) -> (Option<f64>, Option<f64>, Option<f64>) {
    if values.is_empty() {
        return (None, None, None);
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let stddev = if values.len() > 1 {
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
            / (values.len() - 1) as f64;
        Some(var.sqrt())
    } else {
        None
    };
    let trimmed: Vec<f64> = match stddev {
        Some(sd) => values
            .iter()
            .copied()
            .filter(|v| (v - mean).abs() <= sd)
            .collect(),
        None => values.to_vec(),
    };
    let trimmed_mean = if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.iter().sum::<f64>() / trimmed.len() as f64)
    };
    (Some(mean), stddev, trimmed_mean)
}

pub struct Harness {
    pub engine: Arc<JobEngine>,
    pub transport: Arc<MemoryTransport>,
    pub store: Arc<MemoryStore>,
}

pub async fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(MemoryTransport::new());
    let config = EngineConfig {
        database_url: String::new(),
        instance: INSTANCE.to_string(),
    };
    let engine = JobEngine::new(
        Arc::clone(&store) as Arc<dyn JobStore>,
        Arc::clone(&transport) as Arc<dyn Transport>,
        config,
    );
    api::register_handlers(Arc::clone(&engine))
        .await
        .expect("surface registration");
    Harness {
        engine,
        transport,
        store,
    }
}

impl Harness {
    /// Register a worker that echoes its params through `job_data` and
    /// completes.
    pub async fn completing_worker(&self, method: &str) {
        let engine = Arc::clone(&self.engine);
        self.engine
            .bridge()
            .register(
                method,
                Arc::new(move |params, ctx| {
                    let engine = Arc::clone(&engine);
                    async move {
                        let id = ctx.job_id().expect("jobid meta");
                        engine
                            .job_data(JobDataRequest {
                                id,
                                data: Some(json!({ "echo": params })),
                                status: Some("complete".to_string()),
                                progress: None,
                            })
                            .await
                            .map_err(RpcError::from)?;
                        Ok(Value::Null)
                    }
                    .boxed()
                }),
            )
            .await
            .expect("worker registration");
    }

    /// Register a worker that parks on `gate` before completing. Release
    /// it with `notify_one`, which stores a permit in case the worker has
    /// not parked yet.
    pub async fn gated_worker(&self, method: &str, gate: Arc<tokio::sync::Notify>) {
        let engine = Arc::clone(&self.engine);
        self.engine
            .bridge()
            .register(
                method,
                Arc::new(move |_params, ctx| {
                    let engine = Arc::clone(&engine);
                    let gate = Arc::clone(&gate);
                    async move {
                        gate.notified().await;
                        let id = ctx.job_id().expect("jobid meta");
                        engine
                            .job_data(JobDataRequest {
                                id,
                                data: Some(json!("released")),
                                status: Some("complete".to_string()),
                                progress: None,
                            })
                            .await
                            .map_err(RpcError::from)?;
                        Ok(Value::Null)
                    }
                    .boxed()
                }),
            )
            .await
            .expect("worker registration");
    }

    /// Poll until `predicate` holds for the row, panicking after ~2s.
    pub async fn wait_for(&self, id: JobId, predicate: impl Fn(&Job) -> bool, what: &str) {
        for _ in 0..200 {
            if self.store.get(id).as_ref().is_some_and(&predicate) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for job {id}: {what}");
    }
}
