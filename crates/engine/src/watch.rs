//! Watcher registry: wake anyone blocked on a job when it changes.
//!
//! A watch never errors and never waits forever in one step: it resolves
//! on notification or after the poll interval, whichever comes first, and
//! the caller re-fetches the row either way. Entries are purged when the
//! last waiter leaves.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use gearbox_core::scheduling::WATCH_POLL_INTERVAL;
use gearbox_core::types::JobId;
use tokio::sync::Notify;

#[derive(Default)]
pub struct WatchRegistry {
    waiters: Mutex<HashMap<JobId, Arc<Notify>>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `id` is notified or the poll interval elapses.
    pub async fn wait(&self, id: JobId) {
        let notify = {
            let mut waiters = self.waiters.lock().unwrap();
            Arc::clone(waiters.entry(id).or_default())
        };
        let _ = tokio::time::timeout(WATCH_POLL_INTERVAL, notify.notified()).await;

        let mut waiters = self.waiters.lock().unwrap();
        if let Some(entry) = waiters.get(&id) {
            // Map + our clone are the only references left: last one out.
            if Arc::strong_count(entry) <= 2 {
                waiters.remove(&id);
            }
        }
    }

    /// Wake every watcher of `id`. No-op when nobody is watching.
    pub fn notify(&self, id: JobId) {
        if let Some(entry) = self.waiters.lock().unwrap().get(&id) {
            entry.notify_waiters();
        }
    }
}
