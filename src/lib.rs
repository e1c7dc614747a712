//! A beanstalkd-compatible work queue broker: tubes of prioritised jobs
//! with delays, time-to-run reservation leases, a buried quarantine, and
//! an optional write-ahead log for crash recovery.

pub mod config;
pub mod conn;
pub mod error;
pub mod line_reader;
pub mod parser;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod tube;
pub mod types;
pub mod util;
pub mod wal;
