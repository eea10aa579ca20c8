//! The job orchestrator.
//!
//! [`JobEngine`] drives every row of the ledger through the state
//! machine: it builds a [`WorldView`] from the store and the transport,
//! asks `gearbox_core::state::plan` for a decision, and applies it with
//! narrow per-id updates. Evaluation is idempotent and safe to trigger
//! redundantly — from the 60s sweep, per-job timers, submissions,
//! dispatch replies, `job_data` callbacks, and worker (re)connections.

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use futures::future::BoxFuture;
use gearbox_core::scheduling::{
    backoff_secs, jittered_secs, RECHECK_JITTER_MAX_SECS, RECHECK_JITTER_MIN_SECS, SWEEP_INTERVAL,
};
use gearbox_core::state::{self, Decision, DepStatus, JobPriority, JobState, WorldView};
use gearbox_core::types::{JobId, Timestamp};
use gearbox_db::models::job::{Job, JobUpdate, JobWithPredecessor, NewJob};
use gearbox_db::models::stats::MethodStats;
use gearbox_db::JobStore;
use gearbox_rpc::transport::Transport;
use gearbox_rpc::{codes, CallOptions, RpcBridge, RpcError};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::timers::RecheckTimers;
use crate::watch::WatchRegistry;

const DEFAULT_MAX_RETRIES: i32 = 3;
const DEFAULT_RETRY_DELAY_SECS: i32 = 10;

/// Cap on `see_other` hops while resolving a duplicate chain.
const MAX_DUPLICATE_HOPS: usize = 32;

/// A job submission, as carried in `queue` params.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub priority: Option<JobPriority>,
    #[serde(default)]
    pub disambiguator: Option<String>,
    #[serde(default)]
    pub after_date: Option<Timestamp>,
    #[serde(default)]
    pub after_id: Option<JobId>,
    #[serde(default)]
    pub before_id: Option<JobId>,
    #[serde(default)]
    pub max_retries: Option<i32>,
    #[serde(default)]
    pub retry_delay: Option<i32>,
}

/// The worker-side callback carried in `job_data` params.
#[derive(Debug, Clone, Deserialize)]
pub struct JobDataRequest {
    pub id: JobId,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub progress: Option<i16>,
}

pub struct JobEngine {
    store: Arc<dyn JobStore>,
    bridge: Arc<RpcBridge>,
    instance: String,
    timers: RecheckTimers,
    watches: WatchRegistry,
    shutdown: CancellationToken,
}

impl JobEngine {
    pub fn new(
        store: Arc<dyn JobStore>,
        transport: Arc<dyn Transport>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let shutdown = CancellationToken::new();
        Arc::new(Self {
            store,
            bridge: Arc::new(RpcBridge::new(transport, config.instance.clone())),
            instance: config.instance,
            timers: RecheckTimers::new(shutdown.clone()),
            watches: WatchRegistry::new(),
            shutdown,
        })
    }

    pub fn bridge(&self) -> &Arc<RpcBridge> {
        &self.bridge
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Request shutdown: stops the sweep loop, cancels every armed
    /// timer, and fails pending watches.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// The sweep loop. Runs until [`JobEngine::stop`]; an immediate
    /// first tick covers process start, and worker connections trigger
    /// an extra sweep so `no worker` rows get a prompt second look.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        let mut connected = self.bridge.transport().subscribe_connected();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("engine stopped");
                    return;
                }
                _ = ticker.tick() => {}
                event = connected.recv() => {
                    if event.is_err() {
                        // Lagged or sender replaced; the sweep below
                        // covers whatever was missed.
                    }
                    debug!("transport capacity changed");
                }
            }
            if let Err(err) = self.sweep().await {
                error!(error = %err, "sweep failed");
            }
        }
    }

    /// Evaluate every non-terminal row once.
    pub async fn sweep(self: &Arc<Self>) -> Result<(), EngineError> {
        let rows = self.store.current_jobs().await?;
        debug!(jobs = rows.len(), "sweeping current jobs");
        for row in rows {
            let id = row.job.id;
            if let Err(err) = self.evaluate(id).await {
                error!(job_id = id, error = %err, "evaluation failed");
            }
        }
        Ok(())
    }

    // -- submission ---------------------------------------------------------

    /// Accept a submission, persist it, and evaluate it immediately.
    ///
    /// A supplied disambiguator matching a currently running job returns
    /// that job's id without inserting. The check is best-effort: two
    /// racing submissions can both insert, and the loser is marked
    /// `duplicate` at dispatch time instead.
    pub async fn queue(self: &Arc<Self>, req: QueueRequest) -> Result<JobId, EngineError> {
        if req.name.trim().is_empty() {
            return Err(EngineError::InvalidSubmission(
                "missing method name".to_string(),
            ));
        }
        if let Some(key) = &req.disambiguator {
            if let Some(running) = self.store.running_with_disambiguator(key, None).await? {
                info!(
                    job_id = running.id,
                    disambiguator = %key,
                    "submission matches a running job"
                );
                return Ok(running.id);
            }
        }

        let status = initial_status(&req);
        let job = self
            .store
            .insert(NewJob {
                method_name: req.name,
                arguments: req.args,
                priority: req.priority.unwrap_or_default(),
                disambiguator: req
                    .disambiguator
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
                after_date: req.after_date,
                after_id: req.after_id,
                before_id: req.before_id,
                max_retries: req.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
                retry_delay: req.retry_delay.unwrap_or(DEFAULT_RETRY_DELAY_SECS),
                status,
            })
            .await?;
        info!(job_id = job.id, method = %job.method_name, status = %job.status, "job queued");

        if let Err(err) = self.evaluate(job.id).await {
            // The job is persisted; the sweep will pick it up.
            error!(job_id = job.id, error = %err, "post-queue evaluation failed");
        }
        Ok(job.id)
    }

    // -- evaluation ---------------------------------------------------------

    /// Re-read the row, decide, apply. Promotions loop back so a job can
    /// travel `waiting -> ready -> running` in one call.
    pub async fn evaluate(self: &Arc<Self>, id: JobId) -> Result<(), EngineError> {
        loop {
            let Some(row) = self.store.fetch(id).await? else {
                return Err(EngineError::NoSuchJob(id));
            };
            let job = &row.job;
            if job.is_terminal() {
                return Ok(());
            }

            let world = self.world_view(&row).await?;
            let decision = state::plan(&job.snapshot(), &world, state::now());
            debug!(job_id = id, status = %job.status, decision = ?decision, "evaluated");

            match decision {
                Decision::Nothing => return Ok(()),

                Decision::Sleep { until } => {
                    self.arm_recheck(id, until);
                    return Ok(());
                }

                Decision::PromoteReady => {
                    self.store.update(id, JobUpdate::status(JobState::Ready)).await?;
                    self.watches.notify(id);
                    info!(job_id = id, "job ready");
                }

                Decision::RetryNow => {
                    let mut update = JobUpdate::status(JobState::Ready);
                    update.retries = Some(job.retries + 1);
                    self.store.update(id, update).await?;
                    self.watches.notify(id);
                    info!(job_id = id, retry = job.retries + 1, max_retries = job.max_retries, "retrying job");
                }

                Decision::MarkDuplicate { of } => {
                    let mut update = JobUpdate::status(JobState::Duplicate);
                    update.see_other = Some(of);
                    update.completed = Some(state::now());
                    self.store.update(id, update).await?;
                    self.timers.disarm(id);
                    self.watches.notify(id);
                    info!(job_id = id, see_other = of, "job deduplicated");
                    return Ok(());
                }

                Decision::Dispatch => {
                    self.dispatch(job).await?;
                    return Ok(());
                }

                Decision::FailNoWorker => {
                    let err = RpcError::new(codes::NO_WORKER, "no worker available")
                        .with_data(json!(job.method_name));
                    self.fail(job, err).await?;
                    return Ok(());
                }

                Decision::FailDependency { dep } => {
                    self.fail_dependency(job, dep).await?;
                    return Ok(());
                }

                Decision::MarkMissing => {
                    self.store.update(id, JobUpdate::status(JobState::Missing)).await?;
                    warn!(job_id = id, "job vanished from transport");
                    // Re-plan: the missing branch arms the grace timer.
                }

                Decision::FailMissing => {
                    let err = RpcError::new(codes::WENT_MISSING, "job went missing")
                        .with_data(json!(job.method_name));
                    self.fail(job, err).await?;
                    return Ok(());
                }
            }
        }
    }

    /// Gather what [`state::plan`] needs, querying only what the current
    /// status can use.
    async fn world_view(&self, row: &JobWithPredecessor) -> Result<WorldView, EngineError> {
        let job = &row.job;
        let mut world = WorldView {
            predecessor: row.predecessor(),
            ..WorldView::default()
        };

        if matches!(job.status, JobState::Waiting | JobState::Ready) {
            world.blockers = self
                .store
                .blocked_on(job.id)
                .await?
                .into_iter()
                .map(dep_status)
                .collect();
        }

        if job.status == JobState::Ready {
            world.duplicate_of = self
                .store
                .running_with_disambiguator(&job.disambiguator, Some(job.id))
                .await?
                .map(|twin| twin.id);
            let capacity = self.bridge.transport().capacity().await?;
            world.worker_available = capacity
                .values()
                .any(|functions| functions.get(&job.method_name).is_some_and(|n| *n > 0));
        }

        if matches!(job.status, JobState::Running | JobState::Missing) {
            world.seen_on_transport = self
                .bridge
                .transport()
                .running_unique_ids()
                .await?
                .contains(&job.disambiguator);
            world.owned_by_us = job
                .runner_instance
                .as_deref()
                .map_or(true, |runner| runner == self.instance);
        }

        Ok(world)
    }

    // -- dispatch -----------------------------------------------------------

    /// Mark the row `running` and fire the bridge request in its own task.
    /// The reply settles the row: Ok lands in `almost-done` until the
    /// worker's `job_data` callback, Err takes the retry path.
    async fn dispatch(self: &Arc<Self>, job: &Job) -> Result<(), EngineError> {
        let mut update = JobUpdate::status(JobState::Running);
        update.runner_instance = Some(self.instance.clone());
        self.store.update(job.id, update).await?;
        self.watches.notify(job.id);
        info!(job_id = job.id, method = %job.method_name, "dispatching job");

        let engine = Arc::clone(self);
        let job = job.clone();
        tokio::spawn(async move {
            let mut meta = Map::new();
            meta.insert("jobid".into(), json!(job.id));
            let opts = CallOptions {
                priority: job.priority,
                unique_id: Some(job.disambiguator.clone()),
                meta: Some(meta),
            };
            let outcome = engine
                .bridge
                .request(&job.method_name, job.arguments.clone(), opts)
                .await;
            if let Err(err) = engine.settle(job.id, outcome).await {
                error!(job_id = job.id, error = %err, "settling reply failed");
            }
        });
        Ok(())
    }

    /// Apply a dispatch reply. The row is re-read first: it may have gone
    /// missing or terminal while the request was in flight, in which case
    /// the reply is stale and dropped.
    async fn settle(
        self: &Arc<Self>,
        id: JobId,
        outcome: Result<Value, RpcError>,
    ) -> Result<(), EngineError> {
        let Some(row) = self.store.fetch(id).await? else {
            return Ok(());
        };
        let job = row.job;
        if job.is_terminal() {
            debug!(job_id = id, "dropping stale reply for settled job");
            return Ok(());
        }
        match outcome {
            Ok(result) => {
                if job.status == JobState::Running {
                    let mut update = JobUpdate::status(JobState::AlmostDone);
                    // Provisional; the worker's job_data callback finalizes.
                    update.result_data = Some(result);
                    self.store.update(id, update).await?;
                    self.watches.notify(id);
                    debug!(job_id = id, "worker replied, awaiting job_data");
                }
                Ok(())
            }
            Err(err) => self.fail(&job, err).await,
        }
    }

    // -- failure paths ------------------------------------------------------

    /// Record a failure. With budget left the row goes `errored` with a
    /// backoff deadline; exhausted budget is terminal and cascades to
    /// dependents.
    async fn fail(self: &Arc<Self>, job: &Job, err: RpcError) -> Result<(), EngineError> {
        let recorded = serde_json::to_value(&err).unwrap_or(Value::Null);
        let mut update = JobUpdate::status(JobState::Errored);
        update.result_data = Some(recorded);

        if job.retries < job.max_retries {
            let delay = backoff_secs(job.retry_delay as i64, job.retries);
            let at = state::now() + ChronoDuration::seconds(delay);
            update.after_date = Some(at);
            self.store.update(job.id, update).await?;
            self.watches.notify(job.id);
            warn!(
                job_id = job.id,
                code = err.code,
                retries = job.retries,
                backoff_secs = delay,
                "job failed, retry scheduled"
            );
            self.arm_recheck(job.id, Some(at));
        } else {
            update.completed = Some(state::now());
            self.store.update(job.id, update).await?;
            self.timers.disarm(job.id);
            self.watches.notify(job.id);
            warn!(job_id = job.id, code = err.code, "job failed terminally");
            self.cascade(job).await?;
        }
        Ok(())
    }

    /// Transitive failure: a dead dependency can never complete, so
    /// retrying is pointless and the budget is exhausted on the spot.
    async fn fail_dependency(self: &Arc<Self>, job: &Job, dep: JobId) -> Result<(), EngineError> {
        let err = RpcError::new(codes::DEPENDENCY_FAILED, "dependency failed")
            .with_data(json!({ "dependency": dep }));
        let mut update = JobUpdate::status(JobState::Errored);
        update.retries = Some(job.max_retries);
        update.result_data = Some(serde_json::to_value(&err).unwrap_or(Value::Null));
        update.completed = Some(state::now());
        self.store.update(job.id, update).await?;
        self.timers.disarm(job.id);
        self.watches.notify(job.id);
        warn!(job_id = job.id, dependency = dep, "job failed with its dependency");
        self.cascade(job).await
    }

    /// Wake everything that depends on `job`: the row its `before_id`
    /// points at, and every current row gated on it via `after_id`.
    async fn cascade(self: &Arc<Self>, job: &Job) -> Result<(), EngineError> {
        if let Some(target) = job.before_id {
            self.spawn_evaluate(target);
        }
        for row in self.store.current_jobs().await? {
            if row.job.after_id == Some(job.id) {
                self.spawn_evaluate(row.job.id);
            }
        }
        Ok(())
    }

    // -- background evaluation ----------------------------------------------

    fn spawn_evaluate(self: &Arc<Self>, id: JobId) {
        let engine = Arc::clone(self);
        let fut: BoxFuture<'static, ()> = Box::pin(async move {
            if let Err(err) = engine.evaluate(id).await {
                warn!(job_id = id, error = %err, "background evaluation failed");
            }
        });
        tokio::spawn(fut);
    }

    /// Arm the job's recheck timer. `None` means no precise deadline
    /// exists, so the jitter band applies.
    fn arm_recheck(self: &Arc<Self>, id: JobId, until: Option<Timestamp>) {
        let delay = match until {
            Some(at) => (at - state::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO),
            None => std::time::Duration::from_secs(jittered_secs(
                RECHECK_JITTER_MIN_SECS,
                RECHECK_JITTER_MAX_SECS,
            )),
        };
        let token = self.timers.arm(id);
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => engine.spawn_evaluate(id),
            }
        });
    }

    // -- worker callback ----------------------------------------------------

    /// The worker-side `job_data` callback: progress updates, and the
    /// terminal status/data handoff that moves `almost-done` rows to
    /// their final state. Unrecognized terminal statuses are `invalid`.
    ///
    /// Delivery is at-least-once, so a duplicate or late callback can
    /// arrive after the row settled; terminal rows are left untouched.
    pub async fn job_data(self: &Arc<Self>, req: JobDataRequest) -> Result<(), EngineError> {
        let Some(row) = self.store.fetch(req.id).await? else {
            return Err(EngineError::NoSuchJob(req.id));
        };
        let job = row.job;
        if job.is_terminal() {
            debug!(job_id = job.id, status = %job.status, "dropping job_data for settled job");
            return Ok(());
        }

        if let Some(progress) = req.progress {
            let mut update = JobUpdate::default();
            update.progress_status = Some(progress);
            self.store.update(job.id, update).await?;
            debug!(job_id = job.id, progress, "progress update");
        }

        match req.status.as_deref() {
            None => Ok(()),
            Some("complete") => {
                let mut update = JobUpdate::status(JobState::Complete);
                update.result_data = req.data.or(job.result_data.clone());
                update.completed = Some(state::now());
                self.store.update(job.id, update).await?;
                self.timers.disarm(job.id);
                self.watches.notify(job.id);
                info!(job_id = job.id, "job complete");
                self.cascade(&job).await
            }
            Some("errored") => {
                let err = RpcError::new(codes::HANDLER_FAILED, "worker reported failure")
                    .with_data(req.data.unwrap_or(Value::Null));
                self.fail(&job, err).await
            }
            Some(other) => {
                let recorded = RpcError::new(codes::INVALID_STATUS, "invalid terminal status")
                    .with_data(json!(other));
                let mut update = JobUpdate::status(JobState::Invalid);
                update.result_data = Some(serde_json::to_value(&recorded).unwrap_or(Value::Null));
                update.completed = Some(state::now());
                self.store.update(job.id, update).await?;
                self.timers.disarm(job.id);
                self.watches.notify(job.id);
                warn!(job_id = job.id, status = other, "invalid terminal status");
                self.cascade(&job).await
            }
        }
    }

    // -- caller surface -----------------------------------------------------

    /// Block until the job is terminal. Duplicates are followed through
    /// `see_other`; terminal failures surface as the stored structured
    /// error.
    pub async fn watch(self: &Arc<Self>, id: JobId) -> Result<Value, EngineError> {
        let mut current = id;
        let mut hops = 0;
        loop {
            let Some(row) = self.store.fetch(current).await? else {
                return Err(EngineError::NoSuchJob(current));
            };
            let job = row.job;
            match job.status {
                JobState::Duplicate => match job.see_other {
                    Some(other) if hops < MAX_DUPLICATE_HOPS => {
                        debug!(job_id = current, see_other = other, "following duplicate");
                        hops += 1;
                        current = other;
                    }
                    _ => {
                        return Err(EngineError::Rpc(
                            RpcError::new(codes::NO_SUCH_JOB, "broken duplicate chain")
                                .with_data(json!(current)),
                        ));
                    }
                },
                JobState::Complete => return Ok(job.result_data.unwrap_or(Value::Null)),
                JobState::Invalid => {
                    return Err(EngineError::Rpc(stored_error(
                        job.result_data,
                        codes::INVALID_STATUS,
                        "job finished with an unrecognized status",
                    )));
                }
                JobState::Errored if job.is_terminal() => {
                    return Err(EngineError::Rpc(stored_error(
                        job.result_data,
                        codes::HANDLER_FAILED,
                        "job errored",
                    )));
                }
                _ => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(EngineError::ShuttingDown),
                        _ = self.watches.wait(current) => {}
                    }
                }
            }
        }
    }

    /// The current row for `id`, without waiting.
    pub async fn peek(&self, id: JobId) -> Result<Job, EngineError> {
        match self.store.fetch(id).await? {
            Some(row) => Ok(row.job),
            None => Err(EngineError::NoSuchJob(id)),
        }
    }

    /// All non-terminal jobs, or exactly the requested ids.
    pub async fn status(&self, ids: Option<Vec<JobId>>) -> Result<Vec<Job>, EngineError> {
        match ids {
            None => Ok(self
                .store
                .current_jobs()
                .await?
                .into_iter()
                .map(|row| row.job)
                .collect()),
            Some(ids) => {
                let mut jobs = Vec::with_capacity(ids.len());
                for id in ids {
                    jobs.push(self.peek(id).await?);
                }
                Ok(jobs)
            }
        }
    }

    pub async fn stats(&self, method_name: &str) -> Result<MethodStats, EngineError> {
        Ok(self.store.method_stats(method_name).await?)
    }
}

/// Gated submissions start `waiting`; everything else is `ready` and the
/// immediate evaluation decides whether it can dispatch.
fn initial_status(req: &QueueRequest) -> JobState {
    if req.after_date.is_some() || req.after_id.is_some() {
        JobState::Waiting
    } else {
        JobState::Ready
    }
}

fn dep_status(job: Job) -> DepStatus {
    DepStatus {
        id: job.id,
        state: job.status,
        retries: job.retries,
        max_retries: job.max_retries,
    }
}

/// Decode a stored structured error, falling back to a fresh one when
/// the row predates the format or carries free-form data.
fn stored_error(data: Option<Value>, code: i64, message: &str) -> RpcError {
    data.and_then(|v| serde_json::from_value::<RpcError>(v).ok())
        .unwrap_or_else(|| RpcError::new(code, message))
}
