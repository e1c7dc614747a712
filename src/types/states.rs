use tokio::time::Instant;

use crate::session::SessionId;

/// The lifecycle state of a job, carrying the state-specific scheduling
/// data alongside it. A job is present in exactly one of its tube's
/// collections, keyed by the data held here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    /// Eligible for reservation; ordered by `(pri, order)`.
    Ready { pri: u32, order: u64 },
    /// Not yet eligible; becomes ready at `until`.
    Delayed { until: Instant, order: u64 },
    /// Held by `session` until `deadline`, at which point it times out
    /// back to ready.
    Reserved { session: SessionId, deadline: Instant },
    /// Quarantined from scheduling until kicked.
    Buried,
}

impl JobState {
    pub fn name(&self) -> &'static str {
        match self {
            JobState::Ready { .. } => "ready",
            JobState::Delayed { .. } => "delayed",
            JobState::Reserved { .. } => "reserved",
            JobState::Buried => "buried",
        }
    }
}
