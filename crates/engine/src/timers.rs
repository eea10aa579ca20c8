//! Per-job recheck timers.
//!
//! Each job has at most one armed timer; re-arming cancels the previous
//! one so a burst of evaluations collapses into a single future recheck.
//! Tokens are children of the engine's shutdown token, so stopping the
//! engine silences every pending timer at once.

use std::collections::HashMap;
use std::sync::Mutex;

use gearbox_core::types::JobId;
use tokio_util::sync::CancellationToken;

pub struct RecheckTimers {
    parent: CancellationToken,
    armed: Mutex<HashMap<JobId, CancellationToken>>,
}

impl RecheckTimers {
    pub fn new(parent: CancellationToken) -> Self {
        Self {
            parent,
            armed: Mutex::new(HashMap::new()),
        }
    }

    /// Arm a timer for `id`, cancelling any previous one. The returned
    /// token cancels when the timer is re-armed, disarmed, or the engine
    /// shuts down.
    pub fn arm(&self, id: JobId) -> CancellationToken {
        let token = self.parent.child_token();
        let previous = self.armed.lock().unwrap().insert(id, token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }
        token
    }

    /// Cancel and forget the timer for `id`, if one is armed.
    pub fn disarm(&self, id: JobId) {
        if let Some(token) = self.armed.lock().unwrap().remove(&id) {
            token.cancel();
        }
    }
}
