use std::collections::{BTreeSet, HashMap};

/// Tube every session uses and watches until told otherwise.
pub const DEFAULT_TUBE: &str = "default";

/// Opaque handle for one consumer/producer connection. Ids are unique for
/// the lifetime of a broker instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

/// Per-session scheduling state: the insertion-ordered watch set drawn on
/// by reserve, the single tube puts target, and the jobs currently held in
/// reservation (so teardown can hand them back).
#[derive(Debug)]
pub struct SessionState {
    pub watching: Vec<String>,
    pub using: String,
    pub reserved: BTreeSet<u64>,
}

/// Result of an ignore call; removing the last watched tube is refused.
#[derive(Debug, PartialEq, Eq)]
pub enum IgnoreOutcome {
    /// Removed; the new watch count.
    Ignored(usize),
    /// The tube wasn't watched; count unchanged.
    NotWatched(usize),
    /// Refused: it was the only watched tube.
    LastTube,
}

/// Tracks all live sessions for one broker instance.
#[derive(Debug, Default)]
pub struct SessionLedger {
    sessions: HashMap<SessionId, SessionState>,
    next_id: u64,
}

impl SessionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self) -> SessionId {
        self.next_id += 1;
        let id = SessionId(self.next_id);
        self.sessions.insert(
            id,
            SessionState {
                watching: vec![DEFAULT_TUBE.to_string()],
                using: DEFAULT_TUBE.to_string(),
                reserved: BTreeSet::new(),
            },
        );
        id
    }

    /// Removes the session, returning its state so the caller can release
    /// reservations and drop tube references.
    pub fn close(&mut self, session: SessionId) -> Option<SessionState> {
        self.sessions.remove(&session)
    }

    /// Raises the id floor so ids at or below `id` are never handed out.
    /// Recovered reservations reference sessions of a previous process;
    /// those ids must stay dead or a new connection could collide with
    /// one and mutate a reservation it never held.
    pub fn skip_past(&mut self, id: u64) {
        self.next_id = self.next_id.max(id);
    }

    /// Highest session id handed out so far.
    pub fn last_id(&self) -> u64 {
        self.next_id
    }

    pub fn watching(&self, session: SessionId) -> Option<&[String]> {
        self.sessions.get(&session).map(|s| s.watching.as_slice())
    }

    pub fn used(&self, session: SessionId) -> Option<&str> {
        self.sessions.get(&session).map(|s| s.using.as_str())
    }

    /// Switches the put target, returning the previously used tube name.
    pub fn use_tube(&mut self, session: SessionId, tube: &str) -> Option<String> {
        let state = self.sessions.get_mut(&session)?;
        Some(std::mem::replace(&mut state.using, tube.to_string()))
    }

    /// Adds to the watch set, preserving insertion order. Returns the new
    /// count and whether the tube was newly added.
    pub fn watch(&mut self, session: SessionId, tube: &str) -> Option<(usize, bool)> {
        let state = self.sessions.get_mut(&session)?;
        let newly = !state.watching.iter().any(|t| t == tube);
        if newly {
            state.watching.push(tube.to_string());
        }
        Some((state.watching.len(), newly))
    }

    pub fn ignore(&mut self, session: SessionId, tube: &str) -> Option<IgnoreOutcome> {
        let state = self.sessions.get_mut(&session)?;
        let Some(pos) = state.watching.iter().position(|t| t == tube) else {
            return Some(IgnoreOutcome::NotWatched(state.watching.len()));
        };
        if state.watching.len() == 1 {
            return Some(IgnoreOutcome::LastTube);
        }
        state.watching.remove(pos);
        Some(IgnoreOutcome::Ignored(state.watching.len()))
    }

    pub fn grant(&mut self, session: SessionId, job: u64) {
        if let Some(state) = self.sessions.get_mut(&session) {
            state.reserved.insert(job);
        }
    }

    /// Tolerates unknown sessions: recovered reservations belong to
    /// sessions that died with the previous process.
    pub fn revoke(&mut self, session: SessionId, job: u64) {
        if let Some(state) = self.sessions.get_mut(&session) {
            state.reserved.remove(&job);
        }
    }

    pub fn contains(&self, session: SessionId) -> bool {
        self.sessions.contains_key(&session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_on_default_tube() {
        let mut ledger = SessionLedger::new();
        let s = ledger.open();
        assert_eq!(ledger.used(s), Some(DEFAULT_TUBE));
        assert_eq!(ledger.watching(s).unwrap(), &[DEFAULT_TUBE.to_string()]);
    }

    #[test]
    fn watch_preserves_insertion_order() {
        let mut ledger = SessionLedger::new();
        let s = ledger.open();
        assert_eq!(ledger.watch(s, "b"), Some((2, true)));
        assert_eq!(ledger.watch(s, "a"), Some((3, true)));
        assert_eq!(ledger.watch(s, "b"), Some((3, false)));
        assert_eq!(
            ledger.watching(s).unwrap(),
            &["default".to_string(), "b".to_string(), "a".to_string()]
        );
    }

    #[test]
    fn cannot_ignore_last_tube() {
        let mut ledger = SessionLedger::new();
        let s = ledger.open();
        assert_eq!(ledger.ignore(s, "default"), Some(IgnoreOutcome::LastTube));
        ledger.watch(s, "other");
        assert_eq!(
            ledger.ignore(s, "default"),
            Some(IgnoreOutcome::Ignored(1))
        );
        assert_eq!(
            ledger.ignore(s, "default"),
            Some(IgnoreOutcome::NotWatched(1))
        );
    }

    #[test]
    fn skip_past_keeps_prior_ids_dead() {
        let mut ledger = SessionLedger::new();
        ledger.skip_past(7);
        assert_eq!(ledger.open(), SessionId(8));
        // Never lowers the floor.
        ledger.skip_past(3);
        assert_eq!(ledger.open(), SessionId(9));
        assert_eq!(ledger.last_id(), 9);
    }

    #[test]
    fn close_returns_held_reservations() {
        let mut ledger = SessionLedger::new();
        let s = ledger.open();
        ledger.grant(s, 3);
        ledger.grant(s, 1);
        ledger.revoke(s, 3);
        ledger.grant(s, 2);

        let state = ledger.close(s).unwrap();
        assert_eq!(state.reserved.into_iter().collect::<Vec<_>>(), vec![1, 2]);
        assert!(!ledger.contains(s));
        assert!(ledger.close(s).is_none());
    }
}
