//! The job store and scheduling engine.
//!
//! [`Broker`] owns every job, tube, and session for one broker instance
//! and is the only writer of the durability log. All mutating operations
//! serialise through one lock, and every one of them appends (and flushes)
//! its log record *before* touching in-memory state, so an acknowledged
//! mutation survives a crash and a failed append changes nothing.
//!
//! Blocked reservations wait on a broker-wide watch channel that is bumped
//! whenever any job enters a ready queue; the channel's version counter
//! makes the wakeup race-free. A single background sweep task promotes
//! delayed jobs and reclaims expired reservations.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{watch, Notify};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::error::{BrokerError, Result};
use crate::registry::TubeRegistry;
use crate::session::{IgnoreOutcome, SessionId, SessionLedger};
use crate::tube::{DelayedEntry, ReadyEntry, ReservedEntry};
use crate::types::job::{Job, JobInfo};
use crate::types::states::JobState;
use crate::wal::{
    self, JobSnapshot, JobStateSnapshot, Snapshot, Wal, WalOp, WalRecord,
};

/// Outcome of a reservation request. An elapsed timeout is a defined
/// outcome, not an error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reservation {
    Job { id: u64, data: Bytes },
    TimedOut,
}

/// Maps between the wall-clock milliseconds stored in log records and the
/// monotonic instants the engine runs on. Wall times in the past clamp to
/// the base instant, so a clock jump can never schedule work in the
/// process's past.
#[derive(Clone, Copy, Debug)]
struct WallClock {
    base_ms: u64,
    base: Instant,
}

impl WallClock {
    fn now() -> Self {
        Self { base_ms: wal::wall_now_ms(), base: Instant::now() }
    }

    fn instant(&self, wall_ms: u64) -> Instant {
        if wall_ms >= self.base_ms {
            self.base + Duration::from_millis(wall_ms - self.base_ms)
        } else {
            let back = Duration::from_millis(self.base_ms - wall_ms);
            self.base.checked_sub(back).unwrap_or(self.base)
        }
    }

    fn wall(&self, at: Instant) -> u64 {
        if at >= self.base {
            self.base_ms + (at - self.base).as_millis() as u64
        } else {
            self.base_ms
                .saturating_sub((self.base - at).as_millis() as u64)
        }
    }
}

struct State {
    jobs: HashMap<u64, Job>,
    tubes: TubeRegistry,
    ledger: SessionLedger,
    wal: Option<Wal>,
    next_id: u64,
    /// Broker-wide stamp for insertion-order tiebreaks; monotonic across
    /// restarts via the checkpoint high-water mark.
    next_order: u64,
}

/// The broker core: job store, tube registry, session ledger, scheduler
/// and durability log, owned as one value so tests can run independent
/// instances side by side.
pub struct Broker {
    cfg: Config,
    state: Mutex<State>,
    /// Bumped whenever a job enters any ready queue.
    ready_events: watch::Sender<u64>,
    /// Re-arms the sweep when a foreground operation schedules an earlier
    /// deadline than the one it is sleeping towards.
    sweep_wake: Notify,
}

impl Broker {
    /// Creates a broker, replaying any existing checkpoint and log in
    /// `cfg.wal_dir` first. Timer transitions that would have fired while
    /// the process was down are applied (and logged) before this returns.
    pub fn open(cfg: Config) -> Result<Self> {
        let mut state = State {
            jobs: HashMap::new(),
            tubes: TubeRegistry::new(),
            ledger: SessionLedger::new(),
            wal: None,
            next_id: 1,
            next_order: 0,
        };

        if let Some(dir) = &cfg.wal_dir {
            std::fs::create_dir_all(dir).map_err(|source| BrokerError::Durability {
                action: "creating wal directory",
                source,
            })?;
            let loaded = wal::load(dir)?;
            let clock = WallClock::now();
            if let Some(snapshot) = &loaded.snapshot {
                state.load_snapshot(snapshot, &clock)?;
            }
            for record in &loaded.records {
                state.apply_record(record, &clock)?;
            }
            state.wal = Some(Wal::open(dir, loaded.last_seq, cfg.checkpoint_every)?);

            // Timer-driven transitions that would have occurred had the
            // process kept running: apply them now, through the normal
            // logging path.
            let mut made_ready = 0;
            state.promote_due(Instant::now(), &mut made_ready)?;
            if !state.jobs.is_empty() || made_ready > 0 {
                debug!(
                    jobs = state.jobs.len(),
                    promoted = made_ready,
                    "recovered state from durability log"
                );
            }
        }

        let (ready_events, _) = watch::channel(0u64);
        Ok(Self { cfg, state: Mutex::new(state), ready_events, sweep_wake: Notify::new() })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ready_bump(&self) {
        self.ready_events.send_modify(|v| *v += 1);
    }

    // ---- producer side -------------------------------------------------

    /// Enqueues a new job on `tube`, delayed if `delay` is non-zero. A
    /// zero TTR is clamped to one second.
    pub fn put(
        &self,
        tube: &str,
        pri: u32,
        delay: Duration,
        ttr: Duration,
        data: Bytes,
    ) -> Result<u64> {
        if data.len() as u64 > u64::from(self.cfg.max_job_size) {
            return Err(BrokerError::InvalidArgument("payload exceeds maximum job size"));
        }
        let ttr = if ttr.is_zero() { Duration::from_secs(1) } else { ttr };

        let mut st = self.state();
        let id = st.next_id;
        st.append_wal(WalOp::Put {
            id,
            tube: tube.to_string(),
            pri,
            delay_ms: delay.as_millis() as u64,
            ttr_ms: ttr.as_millis() as u64,
            data: data.clone(),
        })?;
        st.next_id += 1;

        let now = Instant::now();
        let state = if delay.is_zero() {
            let order = st.stamp_order();
            st.tubes.get_or_create(tube).insert_ready(ReadyEntry { pri, order, id });
            JobState::Ready { pri, order }
        } else {
            let order = st.stamp_order();
            let until = now + delay;
            st.tubes
                .get_or_create(tube)
                .insert_delayed(DelayedEntry { until, order, id });
            JobState::Delayed { until, order }
        };
        st.jobs.insert(
            id,
            Job {
                id,
                tube: tube.to_string(),
                pri,
                data,
                delay,
                ttr,
                state,
                created: now,
                reserves: 0,
                timeouts: 0,
                releases: 0,
                buries: 0,
                kicks: 0,
            },
        );
        st.maybe_checkpoint();
        drop(st);

        if delay.is_zero() {
            self.ready_bump();
        } else {
            self.sweep_wake.notify_one();
        }
        Ok(id)
    }

    // ---- consumer side -------------------------------------------------

    /// Reserves the globally best ready job across the session's watched
    /// tubes, suspending until one arrives or `timeout` elapses. With no
    /// timeout, waits indefinitely (dropping the future is safe: nothing
    /// is mutated until a job is actually taken).
    pub async fn reserve(
        &self,
        session: SessionId,
        timeout: Option<Duration>,
    ) -> Result<Reservation> {
        let deadline = timeout.map(|t| Instant::now() + t);
        // Subscribing before the first attempt closes the wakeup race: any
        // ready-event after this point marks the channel changed.
        let mut ready = self.ready_events.subscribe();
        loop {
            let taken = {
                let mut st = self.state();
                st.try_reserve(session, Instant::now())?
            };
            if let Some((id, data)) = taken {
                self.sweep_wake.notify_one();
                return Ok(Reservation::Job { id, data });
            }

            match deadline {
                Some(at) => tokio::select! {
                    _ = ready.changed() => {},
                    _ = sleep_until(at) => return Ok(Reservation::TimedOut),
                },
                None => {
                    let _ = ready.changed().await;
                },
            }
        }
    }

    /// Returns a reserved job to ready (or delayed) with a new priority.
    pub fn release(
        &self,
        session: SessionId,
        id: u64,
        pri: u32,
        delay: Duration,
    ) -> Result<()> {
        let mut st = self.state();
        st.expect_owned(session, id)?;
        st.append_wal(WalOp::Release { id, pri, delay_ms: delay.as_millis() as u64 })?;
        st.detach(id)?;
        st.ledger.revoke(session, id);

        let job = st.job_mut(id)?;
        job.pri = pri;
        job.delay = delay;
        job.releases += 1;
        let tube = job.tube.clone();
        if delay.is_zero() {
            let order = st.stamp_order();
            st.set_state(id, JobState::Ready { pri, order })?;
            st.tubes.get_or_create(&tube).insert_ready(ReadyEntry { pri, order, id });
        } else {
            let order = st.stamp_order();
            let until = Instant::now() + delay;
            st.set_state(id, JobState::Delayed { until, order })?;
            st.tubes
                .get_or_create(&tube)
                .insert_delayed(DelayedEntry { until, order, id });
        }
        st.maybe_checkpoint();
        drop(st);

        if delay.is_zero() {
            self.ready_bump();
        } else {
            self.sweep_wake.notify_one();
        }
        Ok(())
    }

    /// Deletes a job. Ready, delayed, and buried jobs may be deleted
    /// without a reservation; a reserved job only by its owner.
    pub fn delete(&self, session: Option<SessionId>, id: u64) -> Result<()> {
        let mut st = self.state();
        let job = st.jobs.get(&id).ok_or(BrokerError::NotFound)?;
        if let JobState::Reserved { session: owner, .. } = job.state {
            if session != Some(owner) {
                return Err(BrokerError::NotOwner);
            }
        }
        st.append_wal(WalOp::Delete { id })?;
        if let Some(s) = session {
            st.ledger.revoke(s, id);
        }
        st.purge(id)?;
        st.maybe_checkpoint();
        Ok(())
    }

    /// Quarantines a reserved job with a new priority.
    pub fn bury(&self, session: SessionId, id: u64, pri: u32) -> Result<()> {
        let mut st = self.state();
        st.expect_owned(session, id)?;
        st.append_wal(WalOp::Bury { id, pri })?;
        st.detach(id)?;
        st.ledger.revoke(session, id);

        let job = st.job_mut(id)?;
        job.pri = pri;
        job.buries += 1;
        job.state = JobState::Buried;
        let tube = job.tube.clone();
        st.tubes.get_or_create(&tube).bury(id);
        st.maybe_checkpoint();
        Ok(())
    }

    /// Resets a reservation's deadline to now + TTR.
    pub fn touch(&self, session: SessionId, id: u64) -> Result<()> {
        let mut st = self.state();
        st.expect_owned(session, id)?;
        st.append_wal(WalOp::Touch { id })?;
        st.detach(id)?;

        let deadline = Instant::now() + st.job_mut(id)?.ttr;
        st.set_state(id, JobState::Reserved { session, deadline })?;
        let tube = st.job_mut(id)?.tube.clone();
        st.tubes
            .get_or_create(&tube)
            .insert_reserved(ReservedEntry { deadline, id });
        st.maybe_checkpoint();
        drop(st);
        self.sweep_wake.notify_one();
        Ok(())
    }

    /// Kicks up to `bound` buried jobs on `tube` back to ready; if the
    /// tube has no buried jobs at all, promotes delayed jobs instead.
    /// Returns how many jobs were kicked.
    pub fn kick(&self, tube: &str, bound: u64) -> Result<u64> {
        let mut st = self.state();
        let from_buried = match st.tubes.get(tube) {
            Some(t) => !t.buried.is_empty(),
            None => return Ok(0),
        };

        let mut kicked = 0;
        while kicked < bound {
            let candidate = match st.tubes.get(tube) {
                Some(t) if from_buried => t.peek_buried(),
                Some(t) => t.peek_delayed().map(|e| e.id),
                None => None,
            };
            let Some(id) = candidate else { break };
            st.kick_one(id)?;
            kicked += 1;
        }
        st.maybe_checkpoint();
        drop(st);

        if kicked > 0 {
            self.ready_bump();
        }
        Ok(kicked)
    }

    /// Kicks a single buried or delayed job by id.
    pub fn kick_job(&self, id: u64) -> Result<()> {
        let mut st = self.state();
        let job = st.jobs.get(&id).ok_or(BrokerError::NotFound)?;
        if !matches!(job.state, JobState::Buried | JobState::Delayed { .. }) {
            return Err(BrokerError::NotFound);
        }
        st.kick_one(id)?;
        st.maybe_checkpoint();
        drop(st);
        self.ready_bump();
        Ok(())
    }

    // ---- inspection ----------------------------------------------------

    /// Non-consuming read of any job's payload.
    pub fn peek(&self, id: u64) -> Result<Bytes> {
        let st = self.state();
        st.jobs.get(&id).map(|j| j.data.clone()).ok_or(BrokerError::NotFound)
    }

    pub fn peek_ready(&self, tube: &str) -> Result<Option<(u64, Bytes)>> {
        let st = self.state();
        let t = st.tubes.get(tube).ok_or(BrokerError::InvalidArgument("no such tube"))?;
        Ok(t.peek_ready().and_then(|e| st.jobs.get(&e.id)).map(|j| (j.id, j.data.clone())))
    }

    pub fn peek_delayed(&self, tube: &str) -> Result<Option<(u64, Bytes)>> {
        let st = self.state();
        let t = st.tubes.get(tube).ok_or(BrokerError::InvalidArgument("no such tube"))?;
        Ok(t.peek_delayed().and_then(|e| st.jobs.get(&e.id)).map(|j| (j.id, j.data.clone())))
    }

    pub fn peek_buried(&self, tube: &str) -> Result<Option<(u64, Bytes)>> {
        let st = self.state();
        let t = st.tubes.get(tube).ok_or(BrokerError::InvalidArgument("no such tube"))?;
        Ok(t.peek_buried().and_then(|id| st.jobs.get(&id)).map(|j| (j.id, j.data.clone())))
    }

    pub fn job_info(&self, id: u64) -> Result<JobInfo> {
        let st = self.state();
        st.jobs.get(&id).map(Job::info).ok_or(BrokerError::NotFound)
    }

    pub fn list_tubes(&self) -> Vec<String> {
        self.state().tubes.names()
    }

    // ---- session management --------------------------------------------

    /// Registers a new session, using and watching the default tube.
    pub fn open_session(&self) -> SessionId {
        let mut st = self.state();
        let session = st.ledger.open();
        let tube = st.tubes.get_or_create(crate::session::DEFAULT_TUBE);
        tube.users += 1;
        tube.watchers += 1;
        session
    }

    pub fn watch(&self, session: SessionId, tube: &str) -> Result<usize> {
        let mut st = self.state();
        let (count, newly) = st
            .ledger
            .watch(session, tube)
            .ok_or(BrokerError::InvalidArgument("unknown session"))?;
        if newly {
            st.tubes.get_or_create(tube).watchers += 1;
        }
        Ok(count)
    }

    pub fn ignore(&self, session: SessionId, tube: &str) -> Result<IgnoreOutcome> {
        let mut st = self.state();
        let outcome = st
            .ledger
            .ignore(session, tube)
            .ok_or(BrokerError::InvalidArgument("unknown session"))?;
        if matches!(outcome, IgnoreOutcome::Ignored(_)) {
            if let Some(t) = st.tubes.get_mut(tube) {
                t.watchers -= 1;
            }
            st.tubes.maybe_gc(tube);
        }
        Ok(outcome)
    }

    pub fn use_tube(&self, session: SessionId, tube: &str) -> Result<()> {
        let mut st = self.state();
        let old = st
            .ledger
            .use_tube(session, tube)
            .ok_or(BrokerError::InvalidArgument("unknown session"))?;
        st.tubes.get_or_create(tube).users += 1;
        if let Some(t) = st.tubes.get_mut(&old) {
            t.users -= 1;
        }
        st.tubes.maybe_gc(&old);
        Ok(())
    }

    pub fn tube_used(&self, session: SessionId) -> Result<String> {
        self.state()
            .ledger
            .used(session)
            .map(str::to_string)
            .ok_or(BrokerError::InvalidArgument("unknown session"))
    }

    pub fn list_tubes_watched(&self, session: SessionId) -> Result<Vec<String>> {
        self.state()
            .ledger
            .watching(session)
            .map(<[String]>::to_vec)
            .ok_or(BrokerError::InvalidArgument("unknown session"))
    }

    /// Teardown hook: releases every job the session still holds, then
    /// drops its tube references. Called exactly once per session, on
    /// connection close for any reason.
    pub fn on_session_closed(&self, session: SessionId) -> Result<()> {
        let mut st = self.state();
        let Some(closed) = st.ledger.close(session) else {
            return Ok(());
        };

        for tube in &closed.watching {
            if let Some(t) = st.tubes.get_mut(tube) {
                t.watchers -= 1;
            }
            st.tubes.maybe_gc(tube);
        }
        if let Some(t) = st.tubes.get_mut(&closed.using) {
            t.users -= 1;
        }
        st.tubes.maybe_gc(&closed.using);

        let mut released = 0;
        for &id in &closed.reserved {
            // If the log fails here, the remaining jobs stay reserved by a
            // dead session and the sweep returns them at their deadlines.
            let pri = st.jobs.get(&id).map_or(0, |j| j.pri);
            st.append_wal(WalOp::Release { id, pri, delay_ms: 0 })?;
            st.detach(id)?;
            let job = st.job_mut(id)?;
            job.releases += 1;
            let (pri, tube) = (job.pri, job.tube.clone());
            let order = st.stamp_order();
            st.set_state(id, JobState::Ready { pri, order })?;
            st.tubes.get_or_create(&tube).insert_ready(ReadyEntry { pri, order, id });
            released += 1;
        }
        st.maybe_checkpoint();
        drop(st);

        if released > 0 {
            debug!(session = session.0, released, "released reservations on close");
            self.ready_bump();
        }
        Ok(())
    }

    // ---- maintenance ---------------------------------------------------

    /// Forces a checkpoint snapshot now.
    pub fn checkpoint(&self) -> Result<()> {
        self.state().checkpoint_now()
    }

    /// The background timer sweep: one task per broker. Promotes delayed
    /// jobs whose wake instant has passed and returns expired reservations
    /// to ready, then sleeps until the earliest upcoming deadline. Runs
    /// until `cancel` fires.
    pub async fn run_sweep(&self, cancel: CancellationToken) {
        loop {
            let mut made_ready = 0;
            let (next_wake, log_failed) = {
                let mut st = self.state();
                let failed = match st.promote_due(Instant::now(), &mut made_ready) {
                    Ok(()) => false,
                    Err(error) => {
                        error!(%error, "sweep could not log timer transitions");
                        true
                    },
                };
                (st.next_wake(), failed)
            };
            if made_ready > 0 {
                self.ready_bump();
            }
            if log_failed {
                // Back off instead of spinning against a dead log.
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(Duration::from_secs(1)) => continue,
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.sweep_wake.notified() => {},
                _ = async {
                    match next_wake {
                        Some(at) => sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => {},
            }
        }
    }
}

impl State {
    fn stamp_order(&mut self) -> u64 {
        let order = self.next_order;
        self.next_order += 1;
        order
    }

    fn append_wal(&mut self, op: WalOp) -> Result<()> {
        if let Some(w) = &mut self.wal {
            w.append(wal::wall_now_ms(), op)?;
        }
        Ok(())
    }

    fn job_mut(&mut self, id: u64) -> Result<&mut Job> {
        self.jobs.get_mut(&id).ok_or(BrokerError::NotFound)
    }

    fn set_state(&mut self, id: u64, state: JobState) -> Result<()> {
        self.job_mut(id)?.state = state;
        Ok(())
    }

    /// Verifies `id` exists, is reserved, and is owned by `session`.
    fn expect_owned(&self, session: SessionId, id: u64) -> Result<()> {
        let job = self.jobs.get(&id).ok_or(BrokerError::NotFound)?;
        match job.state {
            JobState::Reserved { session: owner, .. } if owner == session => Ok(()),
            JobState::Reserved { .. } => Err(BrokerError::NotOwner),
            _ => Err(BrokerError::NotFound),
        }
    }

    /// Removes the job's entry from whichever tube collection its state
    /// says it is in. Every transition detaches before re-inserting,
    /// keeping the one-structure-at-a-time invariant.
    fn detach(&mut self, id: u64) -> Result<()> {
        let job = self.jobs.get(&id).ok_or(BrokerError::NotFound)?;
        let state = job.state;
        let tube = self
            .tubes
            .get_mut(&job.tube)
            .ok_or(BrokerError::NotFound)?;
        let removed = match state {
            JobState::Ready { pri, order } => {
                tube.remove_ready(&ReadyEntry { pri, order, id })
            },
            JobState::Delayed { until, order } => {
                tube.remove_delayed(&DelayedEntry { until, order, id })
            },
            JobState::Reserved { deadline, .. } => {
                tube.remove_reserved(&ReservedEntry { deadline, id })
            },
            JobState::Buried => tube.remove_buried(id),
        };
        if removed {
            Ok(())
        } else {
            Err(BrokerError::NotFound)
        }
    }

    /// Detaches, deletes, and GCs the tube if that left it idle.
    fn purge(&mut self, id: u64) -> Result<()> {
        self.detach(id)?;
        let tube = match self.jobs.remove(&id) {
            Some(job) => job.tube,
            None => return Err(BrokerError::NotFound),
        };
        self.tubes.maybe_gc(&tube);
        Ok(())
    }

    /// Moves a buried or delayed job to ready. Caller has checked the
    /// state and logs responsibility stays here.
    fn kick_one(&mut self, id: u64) -> Result<()> {
        self.append_wal(WalOp::Kick { id })?;
        self.detach(id)?;
        let job = self.job_mut(id)?;
        job.kicks += 1;
        let (pri, tube) = (job.pri, job.tube.clone());
        let order = self.stamp_order();
        self.set_state(id, JobState::Ready { pri, order })?;
        self.tubes.get_or_create(&tube).insert_ready(ReadyEntry { pri, order, id });
        Ok(())
    }

    /// Picks the single globally best `(pri, order)` candidate across the
    /// session's watched tubes and reserves it. `order` stamps are unique
    /// broker-wide, so the comparison is total and the watch-set iteration
    /// order only matters for determinism, which the insertion-ordered
    /// watch list provides.
    fn try_reserve(
        &mut self,
        session: SessionId,
        now: Instant,
    ) -> Result<Option<(u64, Bytes)>> {
        let watched = self
            .ledger
            .watching(session)
            .ok_or(BrokerError::InvalidArgument("unknown session"))?
            .to_vec();

        let mut best: Option<ReadyEntry> = None;
        for name in &watched {
            if let Some(entry) = self.tubes.get(name).and_then(|t| t.peek_ready()) {
                if best.map_or(true, |b| (entry.pri, entry.order) < (b.pri, b.order)) {
                    best = Some(*entry);
                }
            }
        }
        let Some(entry) = best else {
            return Ok(None);
        };

        let id = entry.id;
        self.append_wal(WalOp::Reserve { id, session: session.0 })?;
        self.detach(id)?;
        let job = self.job_mut(id)?;
        let deadline = now + job.ttr;
        job.state = JobState::Reserved { session, deadline };
        job.reserves += 1;
        let (tube, data) = (job.tube.clone(), job.data.clone());
        self.tubes
            .get_or_create(&tube)
            .insert_reserved(ReservedEntry { deadline, id });
        self.ledger.grant(session, id);
        Ok(Some((id, data)))
    }

    /// Applies every timer transition due at `now`: delayed jobs whose
    /// wake instant passed become ready, and reservations past their
    /// deadline time out back to ready. Within a tube, transitions apply
    /// in deadline order. `made_ready` counts jobs that entered ready even
    /// if a later log append fails.
    fn promote_due(&mut self, now: Instant, made_ready: &mut usize) -> Result<()> {
        for name in self.tubes.names() {
            loop {
                let due = {
                    let Some(tube) = self.tubes.get(&name) else { break };
                    let delay = tube
                        .peek_delayed()
                        .filter(|e| e.until <= now)
                        .map(|e| (e.until, e.id, false));
                    let ttr = tube
                        .reserved
                        .first()
                        .filter(|e| e.deadline <= now)
                        .map(|e| (e.deadline, e.id, true));
                    match (delay, ttr) {
                        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
                        (a, b) => a.or(b),
                    }
                };
                let Some((_, id, expired_reservation)) = due else { break };

                if expired_reservation {
                    self.append_wal(WalOp::TtrTimeout { id })?;
                    let owner = match self.jobs.get(&id).map(|j| j.state) {
                        Some(JobState::Reserved { session, .. }) => Some(session),
                        _ => None,
                    };
                    self.detach(id)?;
                    let job = self.job_mut(id)?;
                    job.timeouts += 1;
                    let (pri, tube) = (job.pri, job.tube.clone());
                    if let Some(owner) = owner {
                        self.ledger.revoke(owner, id);
                    }
                    let order = self.stamp_order();
                    self.set_state(id, JobState::Ready { pri, order })?;
                    self.tubes
                        .get_or_create(&tube)
                        .insert_ready(ReadyEntry { pri, order, id });
                } else {
                    self.append_wal(WalOp::DelayDone { id })?;
                    self.detach(id)?;
                    let job = self.job_mut(id)?;
                    let (pri, tube) = (job.pri, job.tube.clone());
                    let order = self.stamp_order();
                    self.set_state(id, JobState::Ready { pri, order })?;
                    self.tubes
                        .get_or_create(&tube)
                        .insert_ready(ReadyEntry { pri, order, id });
                }
                *made_ready += 1;
            }
        }
        Ok(())
    }

    /// Earliest instant at which any tube has timer work.
    fn next_wake(&self) -> Option<Instant> {
        self.tubes.iter().filter_map(|(_, t)| t.next_wake()).min()
    }

    fn maybe_checkpoint(&mut self) {
        if self.wal.as_ref().is_some_and(Wal::wants_checkpoint) {
            if let Err(error) = self.checkpoint_now() {
                warn!(%error, "checkpoint failed; continuing on the live log");
            }
        }
    }

    fn checkpoint_now(&mut self) -> Result<()> {
        if self.wal.is_none() {
            return Ok(());
        }
        let clock = WallClock::now();
        let snapshot = self.snapshot(&clock);
        match &mut self.wal {
            Some(w) => w.install_checkpoint(&snapshot),
            None => Ok(()),
        }
    }

    fn snapshot(&self, clock: &WallClock) -> Snapshot {
        let mut buried_pos = HashMap::new();
        for (_, tube) in self.tubes.iter() {
            for (pos, id) in tube.buried.iter().enumerate() {
                buried_pos.insert(*id, pos as u64);
            }
        }

        let mut jobs: Vec<JobSnapshot> = self
            .jobs
            .values()
            .map(|job| JobSnapshot {
                id: job.id,
                tube: job.tube.clone(),
                pri: job.pri,
                data: job.data.clone(),
                ttr_ms: job.ttr.as_millis() as u64,
                state: match job.state {
                    JobState::Ready { order, .. } => JobStateSnapshot::Ready { order },
                    JobState::Delayed { until, order } => JobStateSnapshot::Delayed {
                        until_ms: clock.wall(until),
                        order,
                    },
                    JobState::Reserved { session, deadline } => {
                        JobStateSnapshot::Reserved {
                            session: session.0,
                            deadline_ms: clock.wall(deadline),
                        }
                    },
                    JobState::Buried => JobStateSnapshot::Buried {
                        pos: buried_pos.get(&job.id).copied().unwrap_or(0),
                    },
                },
                reserves: job.reserves,
                timeouts: job.timeouts,
                releases: job.releases,
                buries: job.buries,
                kicks: job.kicks,
            })
            .collect();
        jobs.sort_by_key(|j| j.id);

        Snapshot {
            seq: self.wal.as_ref().map_or(0, Wal::seq),
            at_ms: clock.base_ms,
            next_id: self.next_id,
            next_order: self.next_order,
            last_session: self.ledger.last_id(),
            jobs,
        }
    }

    fn load_snapshot(&mut self, snapshot: &Snapshot, clock: &WallClock) -> Result<()> {
        let corrupt = |msg: String| BrokerError::Recovery(msg);
        self.next_id = snapshot.next_id;
        self.next_order = snapshot.next_order;
        self.ledger.skip_past(snapshot.last_session);

        let mut buried: HashMap<String, Vec<(u64, u64)>> = HashMap::new();
        for js in &snapshot.jobs {
            let state = match js.state {
                JobStateSnapshot::Ready { order } => {
                    self.next_order = self.next_order.max(order + 1);
                    self.tubes.get_or_create(&js.tube).insert_ready(ReadyEntry {
                        pri: js.pri,
                        order,
                        id: js.id,
                    });
                    JobState::Ready { pri: js.pri, order }
                },
                JobStateSnapshot::Delayed { until_ms, order } => {
                    self.next_order = self.next_order.max(order + 1);
                    let until = clock.instant(until_ms);
                    self.tubes.get_or_create(&js.tube).insert_delayed(DelayedEntry {
                        until,
                        order,
                        id: js.id,
                    });
                    JobState::Delayed { until, order }
                },
                JobStateSnapshot::Reserved { session, deadline_ms } => {
                    let deadline = clock.instant(deadline_ms);
                    self.tubes.get_or_create(&js.tube).insert_reserved(ReservedEntry {
                        deadline,
                        id: js.id,
                    });
                    JobState::Reserved { session: SessionId(session), deadline }
                },
                JobStateSnapshot::Buried { pos } => {
                    buried.entry(js.tube.clone()).or_default().push((pos, js.id));
                    JobState::Buried
                },
            };
            self.next_id = self.next_id.max(js.id + 1);
            let prior = self.jobs.insert(
                js.id,
                Job {
                    id: js.id,
                    tube: js.tube.clone(),
                    pri: js.pri,
                    data: js.data.clone(),
                    delay: Duration::ZERO,
                    ttr: Duration::from_millis(js.ttr_ms),
                    state,
                    created: clock.base,
                    reserves: js.reserves,
                    timeouts: js.timeouts,
                    releases: js.releases,
                    buries: js.buries,
                    kicks: js.kicks,
                },
            );
            if prior.is_some() {
                return Err(corrupt(format!("duplicate job {} in checkpoint", js.id)));
            }
        }

        for (tube, mut entries) in buried {
            entries.sort_unstable();
            let t = self.tubes.get_or_create(&tube);
            for (_, id) in entries {
                t.bury(id);
            }
        }
        Ok(())
    }

    /// Replays one log record. Shares the low-level transition helpers
    /// with the live paths but never appends to the log itself.
    fn apply_record(&mut self, record: &WalRecord, clock: &WallClock) -> Result<()> {
        self.apply_op(record, clock).map_err(|e| {
            BrokerError::Recovery(format!("replaying record {}: {e}", record.seq))
        })
    }

    fn apply_op(&mut self, record: &WalRecord, clock: &WallClock) -> Result<()> {
        match &record.op {
            WalOp::Put { id, tube, pri, delay_ms, ttr_ms, data } => {
                let (id, pri) = (*id, *pri);
                let state = if *delay_ms > 0 {
                    let order = self.stamp_order();
                    let until = clock.instant(record.at_ms + delay_ms);
                    self.tubes
                        .get_or_create(tube)
                        .insert_delayed(DelayedEntry { until, order, id });
                    JobState::Delayed { until, order }
                } else {
                    let order = self.stamp_order();
                    self.tubes
                        .get_or_create(tube)
                        .insert_ready(ReadyEntry { pri, order, id });
                    JobState::Ready { pri, order }
                };
                self.jobs.insert(
                    id,
                    Job {
                        id,
                        tube: tube.clone(),
                        pri,
                        data: data.clone(),
                        delay: Duration::from_millis(*delay_ms),
                        ttr: Duration::from_millis(*ttr_ms),
                        state,
                        created: clock.instant(record.at_ms),
                        reserves: 0,
                        timeouts: 0,
                        releases: 0,
                        buries: 0,
                        kicks: 0,
                    },
                );
                self.next_id = self.next_id.max(id + 1);
            },
            WalOp::Reserve { id, session } => {
                let id = *id;
                // The reserving session belonged to the previous process;
                // its id must never be handed out again.
                self.ledger.skip_past(*session);
                self.detach(id)?;
                let ttr = self.job_mut(id)?.ttr;
                let deadline = clock.instant(record.at_ms + ttr.as_millis() as u64);
                let job = self.job_mut(id)?;
                job.state = JobState::Reserved { session: SessionId(*session), deadline };
                job.reserves += 1;
                let tube = job.tube.clone();
                self.tubes
                    .get_or_create(&tube)
                    .insert_reserved(ReservedEntry { deadline, id });
            },
            WalOp::Release { id, pri, delay_ms } => {
                let (id, pri) = (*id, *pri);
                self.detach(id)?;
                let job = self.job_mut(id)?;
                job.pri = pri;
                job.releases += 1;
                let tube = job.tube.clone();
                if *delay_ms > 0 {
                    let order = self.stamp_order();
                    let until = clock.instant(record.at_ms + delay_ms);
                    self.set_state(id, JobState::Delayed { until, order })?;
                    self.tubes
                        .get_or_create(&tube)
                        .insert_delayed(DelayedEntry { until, order, id });
                } else {
                    let order = self.stamp_order();
                    self.set_state(id, JobState::Ready { pri, order })?;
                    self.tubes
                        .get_or_create(&tube)
                        .insert_ready(ReadyEntry { pri, order, id });
                }
            },
            WalOp::Delete { id } => self.purge(*id)?,
            WalOp::Bury { id, pri } => {
                let (id, pri) = (*id, *pri);
                self.detach(id)?;
                let job = self.job_mut(id)?;
                job.pri = pri;
                job.buries += 1;
                job.state = JobState::Buried;
                let tube = job.tube.clone();
                self.tubes.get_or_create(&tube).bury(id);
            },
            WalOp::Kick { id } => self.kick_one(*id)?,
            WalOp::Touch { id } => {
                let id = *id;
                self.detach(id)?;
                let job = self.job_mut(id)?;
                let JobState::Reserved { session, .. } = job.state else {
                    return Err(BrokerError::NotFound);
                };
                let deadline =
                    clock.instant(record.at_ms + job.ttr.as_millis() as u64);
                job.state = JobState::Reserved { session, deadline };
                let tube = job.tube.clone();
                self.tubes
                    .get_or_create(&tube)
                    .insert_reserved(ReservedEntry { deadline, id });
            },
            WalOp::TtrTimeout { id } => {
                let id = *id;
                self.detach(id)?;
                let job = self.job_mut(id)?;
                job.timeouts += 1;
                let (pri, tube) = (job.pri, job.tube.clone());
                let order = self.stamp_order();
                self.set_state(id, JobState::Ready { pri, order })?;
                self.tubes
                    .get_or_create(&tube)
                    .insert_ready(ReadyEntry { pri, order, id });
            },
            WalOp::DelayDone { id } => {
                let id = *id;
                self.detach(id)?;
                let job = self.job_mut(id)?;
                let (pri, tube) = (job.pri, job.tube.clone());
                let order = self.stamp_order();
                self.set_state(id, JobState::Ready { pri, order })?;
                self.tubes
                    .get_or_create(&tube)
                    .insert_ready(ReadyEntry { pri, order, id });
            },
        }
        Ok(())
    }
}
