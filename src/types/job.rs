use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use super::states::JobState;

/// A single work item. Ids increase monotonically over the lifetime of the
/// broker instance and are never reused, including across restarts.
#[derive(Debug)]
pub struct Job {
    pub id: u64,
    /// Name of the tube this job belongs to. A job belongs to exactly one
    /// tube for its whole life.
    pub tube: String,
    /// Lower values are served first.
    pub pri: u32,
    pub data: Bytes,
    /// Delay most recently applied by put or release.
    pub delay: Duration,
    /// Time-to-run: how long a reservation may be held before timing out.
    pub ttr: Duration,
    pub state: JobState,
    pub created: Instant,

    // Diagnostic transition counters; never consulted for scheduling.
    pub reserves: u64,
    pub timeouts: u64,
    pub releases: u64,
    pub buries: u64,
    pub kicks: u64,
}

/// Read-only view of a job's bookkeeping, for the introspection surface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobInfo {
    pub id: u64,
    pub tube: String,
    pub state: &'static str,
    pub pri: u32,
    pub reserves: u64,
    pub timeouts: u64,
    pub releases: u64,
    pub buries: u64,
    pub kicks: u64,
}

impl Job {
    pub fn info(&self) -> JobInfo {
        JobInfo {
            id: self.id,
            tube: self.tube.clone(),
            state: self.state.name(),
            pri: self.pri,
            reserves: self.reserves,
            timeouts: self.timeouts,
            releases: self.releases,
            buries: self.buries,
            kicks: self.kicks,
        }
    }
}
