//! Diagnostic watchdog: flags jobs whose loop has not turned for too long.
use std::{
    collections::HashMap,
    sync::Weak,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::{task::JoinHandle, time};

use crate::types::JobType;

use super::context::SubchainContext;

/// Last time each job did anything.
#[derive(Debug)]
pub(crate) struct Activity {
    last: Mutex<HashMap<JobType, Instant>>,
}

impl Activity {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            last: Mutex::new(JobType::ALL.into_iter().map(|kind| (kind, now)).collect()),
        }
    }

    pub fn touch(&self, kind: JobType) {
        self.last.lock().insert(kind, Instant::now());
    }

    /// Jobs idle for longer than `timeout` as of `now`, with their idle time.
    pub fn stalled(&self, now: Instant, timeout: Duration) -> Vec<(JobType, Duration)> {
        let mut out: Vec<_> = self
            .last
            .lock()
            .iter()
            .filter_map(|(kind, at)| {
                let idle = now.saturating_duration_since(*at);
                (idle > timeout).then_some((*kind, idle))
            })
            .collect();
        out.sort();
        out
    }
}

/// Periodically log stalled jobs. Never restarts anything.
pub(crate) fn spawn_watchdog(ctx: Weak<SubchainContext>, interval: Duration, timeout: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        // the first tick fires immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(ctx) = ctx.upgrade() else { break };
            for (kind, idle) in ctx.activity.stalled(Instant::now(), timeout) {
                tracing::warn!(
                    subchain = %ctx.id,
                    job = %kind,
                    idle_secs = idle.as_secs(),
                    "job appears stalled"
                );
            }
        }
    })
}
