//! Liveness tracking for the three agents. Each agent stamps
//! `last_progress` (unix millis) after handling a unit of work; the
//! `/health` route reports all three, grounded on the plain `/health`
//! route every service in the teacher's workspace exposes
//! (`matching_engine_service`, `accounts`, `market_data`), generalized here
//! to report per-agent progress rather than a bare "ok".

use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct AgentHeartbeat(Arc<AtomicI64>);

impl AgentHeartbeat {
    pub fn new() -> Self {
        Self(Arc::new(AtomicI64::new(now_millis())))
    }

    pub fn mark(&self) {
        self.0.store(now_millis(), Ordering::Relaxed);
    }

    pub fn last_progress_millis(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Clone, Default)]
pub struct HealthState {
    pub executor: AgentHeartbeat,
    pub processor: AgentHeartbeat,
    pub ingestor: AgentHeartbeat,
}

#[derive(Serialize)]
pub struct AgentStatus {
    pub last_progress_millis: i64,
    pub stale: bool,
}

#[derive(Serialize)]
pub struct HealthReport {
    pub executor: AgentStatus,
    pub processor: AgentStatus,
    pub ingestor: AgentStatus,
}

/// An agent is considered stale if it hasn't progressed in 30 seconds; this
/// is a liveness signal for a supervisor, not a correctness check.
const STALE_AFTER_MILLIS: i64 = 30_000;

impl HealthState {
    pub fn report(&self) -> HealthReport {
        let now = now_millis();
        let status_of = |hb: &AgentHeartbeat| {
            let last = hb.last_progress_millis();
            AgentStatus {
                last_progress_millis: last,
                stale: now.saturating_sub(last) > STALE_AFTER_MILLIS,
            }
        };
        HealthReport {
            executor: status_of(&self.executor),
            processor: status_of(&self.processor),
            ingestor: status_of(&self.ingestor),
        }
    }
}
