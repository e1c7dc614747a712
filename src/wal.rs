//! Write-ahead log and checkpointing.
//!
//! Every state-mutating operation appends one JSON record, newline
//! delimited, to `wal.log` and fsyncs it before the operation is
//! acknowledged. A checkpoint is a full-state JSON snapshot written to a
//! temporary file, fsynced, then renamed over `checkpoint.json`; only the
//! rename makes it authoritative, after which the live log restarts.
//! Startup loads the checkpoint (if any) and replays the log sequentially.
//!
//! Records carry wall-clock milliseconds; the in-memory engine runs on
//! monotonic instants, so recovery maps wall times back onto the new
//! process's timeline, clamping anything in the past to "now".

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{BrokerError, Result};

const LOG_FILE: &str = "wal.log";
const CHECKPOINT_FILE: &str = "checkpoint.json";
const CHECKPOINT_TMP: &str = "checkpoint.tmp";

/// Wall clock in milliseconds since the epoch.
pub fn wall_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// One replayable state transition. Fields are the minimum needed to
/// re-run the transition: timings are reconstructed from the record's
/// timestamp plus the duration fields.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum WalOp {
    Put {
        id: u64,
        tube: String,
        pri: u32,
        delay_ms: u64,
        ttr_ms: u64,
        #[serde(with = "b64")]
        data: Bytes,
    },
    Reserve {
        id: u64,
        session: u64,
    },
    Release {
        id: u64,
        pri: u32,
        delay_ms: u64,
    },
    Delete {
        id: u64,
    },
    Bury {
        id: u64,
        pri: u32,
    },
    Kick {
        id: u64,
    },
    Touch {
        id: u64,
    },
    /// Timer-driven reserved -> ready transition (TTR expiry).
    TtrTimeout {
        id: u64,
    },
    /// Timer-driven delayed -> ready transition.
    DelayDone {
        id: u64,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalRecord {
    pub seq: u64,
    pub at_ms: u64,
    #[serde(flatten)]
    pub op: WalOp,
}

/// Serialized job state inside a checkpoint. `order` stamps are preserved
/// so intra-priority FIFO ordering survives a restart.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum JobStateSnapshot {
    Ready { order: u64 },
    Delayed { until_ms: u64, order: u64 },
    Reserved { session: u64, deadline_ms: u64 },
    Buried { pos: u64 },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobSnapshot {
    pub id: u64,
    pub tube: String,
    pub pri: u32,
    #[serde(with = "b64")]
    pub data: Bytes,
    pub ttr_ms: u64,
    #[serde(flatten)]
    pub state: JobStateSnapshot,
    pub reserves: u64,
    pub timeouts: u64,
    pub releases: u64,
    pub buries: u64,
    pub kicks: u64,
}

/// A full in-memory state snapshot. Together with any log records of
/// higher sequence number, this is always sufficient to reconstruct the
/// broker's state.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    /// Highest record sequence folded into this snapshot.
    pub seq: u64,
    pub at_ms: u64,
    pub next_id: u64,
    pub next_order: u64,
    /// Session-id high-water mark; recovered session ids stay retired.
    pub last_session: u64,
    pub jobs: Vec<JobSnapshot>,
}

/// Everything found on disk at startup.
#[derive(Debug)]
pub struct LoadedLog {
    pub snapshot: Option<Snapshot>,
    /// Records newer than the snapshot, contiguous and in order.
    pub records: Vec<WalRecord>,
    /// Sequence high-water mark for the reopened writer.
    pub last_seq: u64,
}

fn durability(action: &'static str) -> impl FnOnce(io::Error) -> BrokerError {
    move |source| BrokerError::Durability { action, source }
}

/// The append side of the log. Exclusively owned by the scheduler; all
/// appends happen under its state lock, which provides the required total
/// order between the affecting order of mutations and the log order.
#[derive(Debug)]
pub struct Wal {
    dir: PathBuf,
    file: File,
    seq: u64,
    since_checkpoint: u64,
    checkpoint_every: u64,
}

impl Wal {
    /// Opens the log for appending, continuing from `last_seq` as found by
    /// [`load`].
    pub fn open(dir: &Path, last_seq: u64, checkpoint_every: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(LOG_FILE))
            .map_err(durability("opening log"))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            file,
            seq: last_seq,
            since_checkpoint: 0,
            checkpoint_every,
        })
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Appends one record and flushes it to stable storage. The sequence
    /// number only advances once the record is durable, so a failed append
    /// leaves the log exactly as it was.
    pub fn append(&mut self, at_ms: u64, op: WalOp) -> Result<u64> {
        let record = WalRecord { seq: self.seq + 1, at_ms, op };
        let mut line = serde_json::to_vec(&record).map_err(|e| {
            durability("encoding record")(io::Error::new(io::ErrorKind::InvalidData, e))
        })?;
        line.push(b'\n');
        self.file
            .write_all(&line)
            .map_err(durability("appending record"))?;
        self.file
            .sync_data()
            .map_err(durability("flushing record"))?;
        self.seq = record.seq;
        self.since_checkpoint += 1;
        Ok(record.seq)
    }

    pub fn wants_checkpoint(&self) -> bool {
        self.since_checkpoint >= self.checkpoint_every
    }

    /// Writes a snapshot and makes it authoritative, then restarts the
    /// live log. If the log truncation fails after the rename, recovery
    /// still works: replay skips records at or below the snapshot's
    /// sequence number.
    pub fn install_checkpoint(&mut self, snapshot: &Snapshot) -> Result<()> {
        let tmp = self.dir.join(CHECKPOINT_TMP);
        let buf = serde_json::to_vec(snapshot).map_err(|e| {
            durability("encoding checkpoint")(io::Error::new(io::ErrorKind::InvalidData, e))
        })?;
        {
            let mut f = File::create(&tmp).map_err(durability("creating checkpoint"))?;
            f.write_all(&buf).map_err(durability("writing checkpoint"))?;
            f.sync_all().map_err(durability("flushing checkpoint"))?;
        }
        fs::rename(&tmp, self.dir.join(CHECKPOINT_FILE))
            .map_err(durability("installing checkpoint"))?;
        if let Ok(d) = File::open(&self.dir) {
            let _ = d.sync_all();
        }

        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.dir.join(LOG_FILE))
            .map_err(durability("restarting log"))?;
        self.since_checkpoint = 0;
        Ok(())
    }
}

/// Reads the checkpoint and log from `dir`, validating sequence
/// contiguity. A torn final line is treated as an append that was never
/// acknowledged and dropped with a warning; corruption anywhere else is a
/// [`BrokerError::Recovery`], since continuing would silently lose jobs.
pub fn load(dir: &Path) -> Result<LoadedLog> {
    let corrupt = |msg: String| BrokerError::Recovery(msg);

    let cp_path = dir.join(CHECKPOINT_FILE);
    let snapshot: Option<Snapshot> = if cp_path.exists() {
        let f = File::open(&cp_path)
            .map_err(|e| corrupt(format!("opening checkpoint: {e}")))?;
        Some(
            serde_json::from_reader(BufReader::new(f))
                .map_err(|e| corrupt(format!("parsing checkpoint: {e}")))?,
        )
    } else {
        None
    };
    let base_seq = snapshot.as_ref().map_or(0, |s| s.seq);

    let mut records = Vec::new();
    let mut last_seq = base_seq;
    let log_path = dir.join(LOG_FILE);
    if log_path.exists() {
        let f = File::open(&log_path).map_err(|e| corrupt(format!("opening log: {e}")))?;
        let lines: Vec<String> = BufReader::new(f)
            .lines()
            .collect::<io::Result<_>>()
            .map_err(|e| corrupt(format!("reading log: {e}")))?;

        let mut prev_seq: Option<u64> = None;
        for (n, line) in lines.iter().enumerate() {
            let record: WalRecord = match serde_json::from_str(line) {
                Ok(r) => r,
                // A torn tail can only be the final line; the write was
                // never acknowledged, so dropping it is safe.
                Err(e) if n + 1 == lines.len() => {
                    warn!(line = n + 1, error = %e, "dropping torn log tail");
                    break;
                },
                Err(e) => {
                    return Err(corrupt(format!("log line {}: {e}", n + 1)));
                },
            };

            match prev_seq {
                Some(p) if record.seq != p + 1 => {
                    return Err(corrupt(format!(
                        "log sequence gap: {} follows {p}",
                        record.seq
                    )));
                },
                None if record.seq > base_seq + 1 => {
                    return Err(corrupt(format!(
                        "log starts at {} but checkpoint covers up to {base_seq}",
                        record.seq
                    )));
                },
                _ => {},
            }
            prev_seq = Some(record.seq);
            last_seq = last_seq.max(record.seq);

            // Records the checkpoint already covers appear only when a
            // post-checkpoint truncation failed; skip them.
            if record.seq > base_seq {
                records.push(record);
            }
        }
    }

    Ok(LoadedLog { snapshot, records, last_seq })
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD
            .decode(text)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
