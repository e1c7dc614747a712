use std::path::PathBuf;

/// Broker configuration, owned by the [`Broker`](crate::scheduler::Broker)
/// instance rather than read from ambient state, so tests can run several
/// independent brokers in one process.
#[derive(Debug, Clone)]
pub struct Config {
    /// Largest accepted job payload in bytes.
    pub max_job_size: u32,
    /// Directory for the write-ahead log and checkpoint files. `None`
    /// disables durability entirely.
    pub wal_dir: Option<PathBuf>,
    /// Number of log records appended before a checkpoint snapshot is
    /// taken and the log restarted.
    pub checkpoint_every: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_job_size: 65535,
            wal_dir: None,
            checkpoint_every: 1024,
        }
    }
}
