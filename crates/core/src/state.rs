//! The job state machine.
//!
//! [`plan`] is the single decision point for every job: given a snapshot of
//! the ledger row, a view of its dependencies and the transport, and the
//! current instant, it returns the one [`Decision`] the engine should apply.
//! It is pure and total — calling it twice with the same inputs yields the
//! same decision, which is what makes redundant concurrent evaluation safe.
//!
//! The status enum is intentionally mirrored by `gearbox-db`'s sqlx-typed
//! enum; `core` must have zero internal deps.

use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduling::MISSING_GRACE;
use crate::types::{JobId, Timestamp};

// ---------------------------------------------------------------------------
// Status and priority
// ---------------------------------------------------------------------------

/// Lifecycle state of a job, as stored in the ledger's `status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    /// Eligible to dispatch as soon as a worker is available.
    Ready,
    /// Preconditions (delay, ordering) not yet met.
    Waiting,
    /// Dispatched to a worker; a reply is outstanding.
    Running,
    /// The worker replied; its terminal `job_data` callback is outstanding.
    AlmostDone,
    /// The transport no longer reports the job; grace period running.
    Missing,
    /// Terminal success.
    Complete,
    /// Failed. Terminal only once retries are exhausted.
    Errored,
    /// The worker posted an unrecognized terminal status. Terminal.
    Invalid,
    /// Resolved to another running job via `see_other`. Terminal.
    Duplicate,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Ready => "ready",
            JobState::Waiting => "waiting",
            JobState::Running => "running",
            JobState::AlmostDone => "almost-done",
            JobState::Missing => "missing",
            JobState::Complete => "complete",
            JobState::Errored => "errored",
            JobState::Invalid => "invalid",
            JobState::Duplicate => "duplicate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "ready" => JobState::Ready,
            "waiting" => JobState::Waiting,
            "running" => JobState::Running,
            "almost-done" => JobState::AlmostDone,
            "missing" => JobState::Missing,
            "complete" => JobState::Complete,
            "errored" => JobState::Errored,
            "invalid" => JobState::Invalid,
            "duplicate" => JobState::Duplicate,
            _ => return None,
        })
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for JobState {
    type Error = crate::error::CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        JobState::parse(&s).ok_or(crate::error::CoreError::UnknownStatus(s))
    }
}

/// Dispatch priority, forwarded to the transport and never interpreted by
/// the state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
}

impl JobPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            JobPriority::Low => "low",
            JobPriority::Normal => "normal",
            JobPriority::High => "high",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "low" => JobPriority::Low,
            "normal" => JobPriority::Normal,
            "high" => JobPriority::High,
            _ => return None,
        })
    }
}

impl TryFrom<String> for JobPriority {
    type Error = crate::error::CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        JobPriority::parse(&s).ok_or(crate::error::CoreError::UnknownStatus(s))
    }
}

// ---------------------------------------------------------------------------
// Inputs to the decision function
// ---------------------------------------------------------------------------

/// The ledger fields [`plan`] needs from a job row.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub id: JobId,
    pub state: JobState,
    pub after_date: Option<Timestamp>,
    pub has_predecessor: bool,
    pub retries: i32,
    pub max_retries: i32,
    pub retry_delay_secs: i64,
    /// The row's `updated` timestamp; used as "when the state was entered"
    /// for the missing-job grace period.
    pub updated: Timestamp,
}

impl JobSnapshot {
    /// True once no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        match self.state {
            JobState::Complete | JobState::Invalid | JobState::Duplicate => true,
            JobState::Errored => self.retries >= self.max_retries,
            _ => false,
        }
    }
}

/// Status of one dependency row (the `after_id` predecessor or a
/// `before_id` blocker).
#[derive(Debug, Clone)]
pub struct DepStatus {
    pub id: JobId,
    pub state: JobState,
    pub retries: i32,
    pub max_retries: i32,
}

impl DepStatus {
    /// Errored with no retries remaining — it will never complete.
    pub fn is_dead(&self) -> bool {
        self.state == JobState::Errored && self.retries >= self.max_retries
    }
}

/// Everything [`plan`] needs to know about the world around a job.
///
/// Populated by the engine from the ledger and the transport just before
/// evaluation; `plan` itself never performs I/O.
#[derive(Debug, Clone, Default)]
pub struct WorldView {
    /// The `after_id` row's status, if any.
    pub predecessor: Option<DepStatus>,
    /// Rows whose `before_id` points at this job ("blocked-by" query).
    pub blockers: Vec<DepStatus>,
    /// A currently running job sharing this job's disambiguator.
    pub duplicate_of: Option<JobId>,
    /// At least one worker has capacity for this job's `method_name`.
    pub worker_available: bool,
    /// The transport currently lists this job's unique id as in flight.
    /// Only meaningful for `running`/`missing` jobs.
    pub seen_on_transport: bool,
    /// `runner_instance` matches this engine instance.
    pub owned_by_us: bool,
}

// ---------------------------------------------------------------------------
// Derived blocker predicates
// ---------------------------------------------------------------------------

/// The `before_id` predicates folded into the waiting/ready decision.
///
/// Completed blockers are discharged: the ledger's blocked-on query filters
/// them out, and the fold drops any that slip through so the decision is
/// the same either way. A blocker that died irrecoverably fails the target
/// even when its siblings completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockerFold {
    /// No unfinished blockers remain (vacuously true with none).
    pub all_complete: bool,
    /// At least one unfinished blocker may still complete.
    pub some_remain: bool,
    /// Unfinished blockers remain and every one is irrecoverably errored.
    pub all_errored: bool,
}

pub fn fold_blockers(blockers: &[DepStatus]) -> BlockerFold {
    let unfinished: Vec<&DepStatus> = blockers
        .iter()
        .filter(|b| b.state != JobState::Complete)
        .collect();
    let all_complete = unfinished.is_empty();
    let all_errored = !unfinished.is_empty() && unfinished.iter().all(|b| b.is_dead());
    let some_remain = unfinished.iter().any(|b| !b.is_dead());
    BlockerFold {
        all_complete,
        some_remain,
        all_errored,
    }
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// What the engine should do with a job right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// No ledger write, no notification. Terminal rows, rows driven by
    /// another instance, and in-flight rows all land here.
    Nothing,
    /// `waiting` -> `ready`; notify watchers, then re-evaluate.
    PromoteReady,
    /// Stay put and re-arm the recheck timer. `until = None` means no
    /// precise deadline exists; use the jitter band.
    Sleep { until: Option<Timestamp> },
    /// `ready` -> `duplicate`, permanently deferring to `of`.
    MarkDuplicate { of: JobId },
    /// Dispatch to a worker and mark `running`.
    Dispatch,
    /// No worker is registered for the method. Errored path, retry
    /// policy applies.
    FailNoWorker,
    /// The predecessor or every blocker is irrecoverably errored.
    /// Terminal: transitive failures never retry.
    FailDependency { dep: JobId },
    /// `running` -> `missing`; the transport no longer lists the job.
    MarkMissing,
    /// Missing past the grace period. Errored path, retry policy applies.
    FailMissing,
    /// Errored with budget left and backoff elapsed: consume one retry
    /// and promote to `ready`.
    RetryNow,
}

// ---------------------------------------------------------------------------
// The decision function
// ---------------------------------------------------------------------------

/// Decide the next action for a job.
///
/// Safe to call redundantly and concurrently: the engine re-reads the row
/// before applying any decision, and terminal snapshots always produce
/// [`Decision::Nothing`].
pub fn plan(job: &JobSnapshot, world: &WorldView, now: Timestamp) -> Decision {
    match job.state {
        JobState::Complete | JobState::Invalid | JobState::Duplicate => Decision::Nothing,

        JobState::Errored => plan_errored(job, now),

        JobState::Waiting | JobState::Ready => plan_eligible(job, world, now),

        JobState::Running => {
            if !world.owned_by_us {
                // Another instance dispatched it; we only watch.
                return Decision::Nothing;
            }
            if world.seen_on_transport {
                Decision::Nothing
            } else {
                Decision::MarkMissing
            }
        }

        JobState::Missing => {
            let deadline = job.updated
                + ChronoDuration::from_std(MISSING_GRACE).unwrap_or(ChronoDuration::seconds(5));
            if now >= deadline {
                Decision::FailMissing
            } else {
                Decision::Sleep {
                    until: Some(deadline),
                }
            }
        }

        // Waiting for the worker's terminal job_data callback.
        JobState::AlmostDone => Decision::Nothing,
    }
}

fn plan_errored(job: &JobSnapshot, now: Timestamp) -> Decision {
    if job.retries >= job.max_retries {
        return Decision::Nothing;
    }
    match job.after_date {
        Some(at) if at > now => Decision::Sleep { until: Some(at) },
        _ => Decision::RetryNow,
    }
}

/// Shared waiting/ready logic: dependency gating first, then (for ready
/// jobs) dedup and dispatch.
fn plan_eligible(job: &JobSnapshot, world: &WorldView, now: Timestamp) -> Decision {
    let fold = fold_blockers(&world.blockers);

    // Irrecoverable dependencies fail the job transitively.
    if let Some(pred) = &world.predecessor {
        if pred.is_dead() {
            return Decision::FailDependency { dep: pred.id };
        }
    }
    if fold.all_errored {
        // Any dead blocker id serves for diagnostics.
        let dep = world
            .blockers
            .iter()
            .find(|b| b.is_dead())
            .map(|b| b.id)
            .unwrap_or_default();
        return Decision::FailDependency { dep };
    }

    // Not yet eligible: date gate, predecessor gate, blocker gate.
    let date_gate = job.after_date.filter(|at| *at > now);
    let pred_unmet = match &world.predecessor {
        Some(pred) => pred.state != JobState::Complete,
        None => job.has_predecessor, // join missed the row; stay cautious
    };
    if date_gate.is_some() || pred_unmet || fold.some_remain {
        return Decision::Sleep { until: date_gate };
    }

    if job.state == JobState::Waiting {
        return Decision::PromoteReady;
    }

    // Ready: dedup, then capacity, then dispatch.
    if let Some(of) = world.duplicate_of {
        if of != job.id {
            return Decision::MarkDuplicate { of };
        }
    }
    if !world.worker_available {
        return Decision::FailNoWorker;
    }
    Decision::Dispatch
}

/// Convenience for tests and the engine: `Utc::now`.
pub fn now() -> Timestamp {
    Utc::now()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as D;

    fn snap(state: JobState) -> JobSnapshot {
        JobSnapshot {
            id: 1,
            state,
            after_date: None,
            has_predecessor: false,
            retries: 0,
            max_retries: 3,
            retry_delay_secs: 10,
            updated: now(),
        }
    }

    fn open_world() -> WorldView {
        WorldView {
            worker_available: true,
            owned_by_us: true,
            seen_on_transport: true,
            ..Default::default()
        }
    }

    fn dep(id: JobId, state: JobState) -> DepStatus {
        DepStatus {
            id,
            state,
            retries: 0,
            max_retries: 3,
        }
    }

    fn dead_dep(id: JobId) -> DepStatus {
        DepStatus {
            id,
            state: JobState::Errored,
            retries: 3,
            max_retries: 3,
        }
    }

    // -- status round trip --------------------------------------------------

    #[test]
    fn status_strings_round_trip() {
        for s in [
            JobState::Ready,
            JobState::Waiting,
            JobState::Running,
            JobState::AlmostDone,
            JobState::Missing,
            JobState::Complete,
            JobState::Errored,
            JobState::Invalid,
            JobState::Duplicate,
        ] {
            assert_eq!(JobState::parse(s.as_str()), Some(s));
        }
        assert_eq!(JobState::parse("bogus"), None);
    }

    #[test]
    fn almost_done_uses_kebab_case() {
        assert_eq!(JobState::AlmostDone.as_str(), "almost-done");
    }

    // -- terminal states ----------------------------------------------------

    #[test]
    fn complete_is_inert() {
        assert_eq!(plan(&snap(JobState::Complete), &open_world(), now()), Decision::Nothing);
    }

    #[test]
    fn invalid_is_inert() {
        assert_eq!(plan(&snap(JobState::Invalid), &open_world(), now()), Decision::Nothing);
    }

    #[test]
    fn duplicate_is_inert() {
        assert_eq!(plan(&snap(JobState::Duplicate), &open_world(), now()), Decision::Nothing);
    }

    #[test]
    fn errored_without_budget_is_terminal() {
        let mut j = snap(JobState::Errored);
        j.retries = 3;
        assert!(j.is_terminal());
        assert_eq!(plan(&j, &open_world(), now()), Decision::Nothing);
    }

    // -- ready path ---------------------------------------------------------

    #[test]
    fn ready_dispatches_when_unconstrained() {
        assert_eq!(plan(&snap(JobState::Ready), &open_world(), now()), Decision::Dispatch);
    }

    #[test]
    fn ready_becomes_duplicate_of_running_twin() {
        let mut w = open_world();
        w.duplicate_of = Some(42);
        assert_eq!(
            plan(&snap(JobState::Ready), &w, now()),
            Decision::MarkDuplicate { of: 42 }
        );
    }

    #[test]
    fn ready_ignores_itself_as_duplicate() {
        let mut w = open_world();
        w.duplicate_of = Some(1); // same id as the snapshot
        assert_eq!(plan(&snap(JobState::Ready), &w, now()), Decision::Dispatch);
    }

    #[test]
    fn ready_fails_without_worker() {
        let mut w = open_world();
        w.worker_available = false;
        assert_eq!(plan(&snap(JobState::Ready), &w, now()), Decision::FailNoWorker);
    }

    #[test]
    fn dedup_checked_before_capacity() {
        let mut w = open_world();
        w.worker_available = false;
        w.duplicate_of = Some(9);
        assert_eq!(
            plan(&snap(JobState::Ready), &w, now()),
            Decision::MarkDuplicate { of: 9 }
        );
    }

    // -- waiting path -------------------------------------------------------

    #[test]
    fn waiting_promotes_when_gates_clear() {
        assert_eq!(
            plan(&snap(JobState::Waiting), &open_world(), now()),
            Decision::PromoteReady
        );
    }

    #[test]
    fn waiting_sleeps_until_after_date() {
        let at = now() + D::seconds(120);
        let mut j = snap(JobState::Waiting);
        j.after_date = Some(at);
        assert_eq!(
            plan(&j, &open_world(), now()),
            Decision::Sleep { until: Some(at) }
        );
    }

    #[test]
    fn waiting_promotes_once_after_date_passed() {
        let mut j = snap(JobState::Waiting);
        j.after_date = Some(now() - D::seconds(1));
        assert_eq!(plan(&j, &open_world(), now()), Decision::PromoteReady);
    }

    #[test]
    fn waiting_on_incomplete_predecessor_sleeps_jittered() {
        let mut j = snap(JobState::Waiting);
        j.has_predecessor = true;
        let mut w = open_world();
        w.predecessor = Some(dep(7, JobState::Running));
        assert_eq!(plan(&j, &w, now()), Decision::Sleep { until: None });
    }

    #[test]
    fn waiting_promotes_once_predecessor_completes() {
        let mut j = snap(JobState::Waiting);
        j.has_predecessor = true;
        let mut w = open_world();
        w.predecessor = Some(dep(7, JobState::Complete));
        assert_eq!(plan(&j, &w, now()), Decision::PromoteReady);
    }

    #[test]
    fn waiting_fails_when_predecessor_dead() {
        let mut j = snap(JobState::Waiting);
        j.has_predecessor = true;
        let mut w = open_world();
        w.predecessor = Some(dead_dep(7));
        assert_eq!(plan(&j, &w, now()), Decision::FailDependency { dep: 7 });
    }

    #[test]
    fn retryable_predecessor_error_keeps_waiting() {
        let mut j = snap(JobState::Waiting);
        j.has_predecessor = true;
        let mut w = open_world();
        // Errored but with retries left: it may still complete.
        w.predecessor = Some(DepStatus {
            id: 7,
            state: JobState::Errored,
            retries: 1,
            max_retries: 3,
        });
        assert_eq!(plan(&j, &w, now()), Decision::Sleep { until: None });
    }

    #[test]
    fn missing_predecessor_row_stays_waiting() {
        // after_id set but the join brought nothing back.
        let mut j = snap(JobState::Waiting);
        j.has_predecessor = true;
        assert_eq!(plan(&j, &open_world(), now()), Decision::Sleep { until: None });
    }

    // -- blocker folding ----------------------------------------------------

    #[test]
    fn no_blockers_fold_vacuously() {
        let f = fold_blockers(&[]);
        assert!(f.all_complete);
        assert!(!f.some_remain);
        assert!(!f.all_errored);
    }

    #[test]
    fn live_blocker_keeps_job_waiting() {
        let mut w = open_world();
        w.blockers = vec![dep(3, JobState::Running)];
        assert_eq!(
            plan(&snap(JobState::Waiting), &w, now()),
            Decision::Sleep { until: None }
        );
    }

    #[test]
    fn all_blockers_complete_promotes() {
        let mut w = open_world();
        w.blockers = vec![dep(3, JobState::Complete), dep(4, JobState::Complete)];
        assert_eq!(plan(&snap(JobState::Waiting), &w, now()), Decision::PromoteReady);
    }

    #[test]
    fn all_blockers_dead_fails_transitively() {
        let mut w = open_world();
        w.blockers = vec![dead_dep(3), dead_dep(4)];
        assert_eq!(
            plan(&snap(JobState::Waiting), &w, now()),
            Decision::FailDependency { dep: 3 }
        );
    }

    #[test]
    fn mixed_dead_and_live_blockers_keep_waiting() {
        let mut w = open_world();
        w.blockers = vec![dead_dep(3), dep(4, JobState::Running)];
        assert_eq!(
            plan(&snap(JobState::Waiting), &w, now()),
            Decision::Sleep { until: None }
        );
    }

    #[test]
    fn dead_blocker_fails_even_when_siblings_completed() {
        // The finished blocker is discharged; the dead one never ran and
        // never will, so the target fails transitively.
        let mut w = open_world();
        w.blockers = vec![dep(4, JobState::Complete), dead_dep(3)];
        assert_eq!(
            plan(&snap(JobState::Waiting), &w, now()),
            Decision::FailDependency { dep: 3 }
        );
    }

    // -- running / missing --------------------------------------------------

    #[test]
    fn running_seen_on_transport_is_left_alone() {
        assert_eq!(plan(&snap(JobState::Running), &open_world(), now()), Decision::Nothing);
    }

    #[test]
    fn running_gone_from_transport_goes_missing() {
        let mut w = open_world();
        w.seen_on_transport = false;
        assert_eq!(plan(&snap(JobState::Running), &w, now()), Decision::MarkMissing);
    }

    #[test]
    fn foreign_running_job_is_only_watched() {
        let mut w = open_world();
        w.owned_by_us = false;
        w.seen_on_transport = false;
        assert_eq!(plan(&snap(JobState::Running), &w, now()), Decision::Nothing);
    }

    #[test]
    fn missing_within_grace_sleeps_until_deadline() {
        let j = snap(JobState::Missing);
        match plan(&j, &open_world(), now()) {
            Decision::Sleep { until: Some(at) } => {
                assert!(at > now());
            }
            other => panic!("expected Sleep, got {other:?}"),
        }
    }

    #[test]
    fn missing_past_grace_fails() {
        let mut j = snap(JobState::Missing);
        j.updated = now() - D::seconds(10);
        assert_eq!(plan(&j, &open_world(), now()), Decision::FailMissing);
    }

    #[test]
    fn almost_done_waits_for_job_data() {
        assert_eq!(plan(&snap(JobState::AlmostDone), &open_world(), now()), Decision::Nothing);
    }

    // -- retry path ---------------------------------------------------------

    #[test]
    fn errored_with_budget_and_elapsed_backoff_retries() {
        let mut j = snap(JobState::Errored);
        j.retries = 1;
        j.after_date = Some(now() - D::seconds(1));
        assert_eq!(plan(&j, &open_world(), now()), Decision::RetryNow);
    }

    #[test]
    fn errored_with_budget_sleeps_through_backoff() {
        let at = now() + D::seconds(40);
        let mut j = snap(JobState::Errored);
        j.retries = 1;
        j.after_date = Some(at);
        assert_eq!(plan(&j, &open_world(), now()), Decision::Sleep { until: Some(at) });
    }

    #[test]
    fn errored_without_after_date_retries_immediately() {
        let mut j = snap(JobState::Errored);
        j.retries = 0;
        assert_eq!(plan(&j, &open_world(), now()), Decision::RetryNow);
    }
}
