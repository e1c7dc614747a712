use std::io;

use thiserror::Error;

/// Errors surfaced by the broker core.
///
/// `NotFound`, `NotOwner` and `InvalidArgument` are ordinary outcomes the
/// protocol layer renders as response codes. `Durability` and `Recovery`
/// are hard failures: the former aborts the affected operation before any
/// in-memory state changed, the latter aborts startup.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The job id is unknown, already deleted, or not in a state the
    /// operation accepts.
    #[error("job not found")]
    NotFound,
    /// The operation requires a reservation held by the calling session.
    #[error("job is not reserved by this session")]
    NotOwner,
    /// A caller-supplied value was rejected.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The durability log could not be appended or flushed. The operation
    /// that triggered the append was not applied in memory.
    #[error("durability log failure while {action}: {source}")]
    Durability {
        action: &'static str,
        #[source]
        source: io::Error,
    },
    /// The log or checkpoint was unreadable or inconsistent at startup.
    #[error("recovery failed: {0}")]
    Recovery(String),
}

pub type Result<T> = std::result::Result<T, BrokerError>;
