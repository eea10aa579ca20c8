//! Scheduling constants and retry backoff math.
//!
//! These values govern how often the engine re-examines jobs. They live in
//! `core` (zero internal deps) so the engine, the ledger, and any future
//! CLI tooling agree on them.

use std::time::Duration;

use rand::Rng;

/// Fallback full sweep over all non-terminal jobs. Safety net only; the
/// engine normally reacts to explicit recheck signals and timers.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Jitter band for rechecking a waiting job that has no precise deadline.
/// Uniform random within the band to avoid thundering-herd re-evaluation.
pub const RECHECK_JITTER_MIN_SECS: u64 = 5;
pub const RECHECK_JITTER_MAX_SECS: u64 = 30;

/// Grace period before a job that vanished from the transport is treated
/// as failed.
pub const MISSING_GRACE: Duration = Duration::from_secs(5);

/// A watch resolves on notification or after this poll interval,
/// whichever comes first. The watch loop then re-fetches the job.
pub const WATCH_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Upper bound on a single retry backoff.
pub const BACKOFF_CAP_SECS: i64 = 3600;

/// Compute the backoff before retry attempt `retries + 1`.
///
/// Exponential: `retry_delay * 2^retries`, capped at [`BACKOFF_CAP_SECS`].
/// A non-positive `retry_delay` yields zero (retry immediately).
pub fn backoff_secs(retry_delay: i64, retries: i32) -> i64 {
    if retry_delay <= 0 {
        return 0;
    }
    let factor = 1i64 << retries.clamp(0, 62);
    retry_delay
        .saturating_mul(factor)
        .min(BACKOFF_CAP_SECS)
}

/// Pick a jittered delay within `[min, max]` seconds.
pub fn jittered_secs(min: u64, max: u64) -> u64 {
    if min >= max {
        return min;
    }
    rand::rng().random_range(min..=max)
}
