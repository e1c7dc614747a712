use std::collections::{BTreeSet, VecDeque};

use tokio::time::Instant;

/// Key for a job in the ready structure. Derived `Ord` gives strict
/// priority order with insertion-order tiebreak: `order` is a broker-wide
/// monotonic stamp assigned on every entry into ready, so equal-priority
/// jobs come out in the order they arrived.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReadyEntry {
    pub pri: u32,
    pub order: u64,
    pub id: u64,
}

/// Key for a job in the delayed structure, ordered by absolute wake
/// instant, then insertion order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct DelayedEntry {
    pub until: Instant,
    pub order: u64,
    pub id: u64,
}

/// Key for a job in the reserved structure, ordered by TTR deadline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReservedEntry {
    pub deadline: Instant,
    pub id: u64,
}

/// A named queue: four disjoint collections, one per schedulable state.
/// Buried jobs carry no scheduling order beyond FIFO arrival and are
/// invisible to reservation until kicked.
#[derive(Debug, Default)]
pub struct Tube {
    pub(crate) ready: BTreeSet<ReadyEntry>,
    pub(crate) delayed: BTreeSet<DelayedEntry>,
    pub(crate) reserved: BTreeSet<ReservedEntry>,
    pub(crate) buried: VecDeque<u64>,
    /// Number of live sessions watching this tube.
    pub(crate) watchers: usize,
    /// Number of live sessions using this tube.
    pub(crate) users: usize,
}

impl Tube {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peek_ready(&self) -> Option<&ReadyEntry> {
        self.ready.first()
    }

    pub fn peek_delayed(&self) -> Option<&DelayedEntry> {
        self.delayed.first()
    }

    pub fn peek_buried(&self) -> Option<u64> {
        self.buried.front().copied()
    }

    pub(crate) fn insert_ready(&mut self, entry: ReadyEntry) {
        self.ready.insert(entry);
    }

    pub(crate) fn remove_ready(&mut self, entry: &ReadyEntry) -> bool {
        self.ready.remove(entry)
    }

    pub(crate) fn insert_delayed(&mut self, entry: DelayedEntry) {
        self.delayed.insert(entry);
    }

    pub(crate) fn remove_delayed(&mut self, entry: &DelayedEntry) -> bool {
        self.delayed.remove(entry)
    }

    pub(crate) fn insert_reserved(&mut self, entry: ReservedEntry) {
        self.reserved.insert(entry);
    }

    pub(crate) fn remove_reserved(&mut self, entry: &ReservedEntry) -> bool {
        self.reserved.remove(entry)
    }

    pub(crate) fn bury(&mut self, id: u64) {
        self.buried.push_back(id);
    }

    pub(crate) fn remove_buried(&mut self, id: u64) -> bool {
        match self.buried.iter().position(|&b| b == id) {
            Some(pos) => {
                self.buried.remove(pos);
                true
            },
            None => false,
        }
    }

    /// The earliest instant at which the sweep has work to do here: the
    /// nearer of the next delayed wake and the next reservation deadline.
    pub fn next_wake(&self) -> Option<Instant> {
        let delay = self.delayed.first().map(|e| e.until);
        let ttr = self.reserved.first().map(|e| e.deadline);
        match (delay, ttr) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// True when the tube holds no jobs and no session references it, in
    /// which case the registry may drop it.
    pub fn is_idle(&self) -> bool {
        self.ready.is_empty()
            && self.delayed.is_empty()
            && self.reserved.is_empty()
            && self.buried.is_empty()
            && self.watchers == 0
            && self.users == 0
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn ready_orders_by_priority_then_arrival() {
        let mut t = Tube::new();
        t.insert_ready(ReadyEntry { pri: 10, order: 0, id: 1 });
        t.insert_ready(ReadyEntry { pri: 5, order: 1, id: 2 });
        t.insert_ready(ReadyEntry { pri: 5, order: 2, id: 3 });

        assert_eq!(t.peek_ready().map(|e| e.id), Some(2));
        let head = *t.peek_ready().unwrap();
        t.remove_ready(&head);
        assert_eq!(t.peek_ready().map(|e| e.id), Some(3));
        let head = *t.peek_ready().unwrap();
        t.remove_ready(&head);
        assert_eq!(t.peek_ready().map(|e| e.id), Some(1));
    }

    #[test]
    fn delayed_orders_by_wake_instant() {
        let mut t = Tube::new();
        let base = Instant::now();
        t.insert_delayed(DelayedEntry {
            until: base + Duration::from_secs(9),
            order: 0,
            id: 1,
        });
        t.insert_delayed(DelayedEntry {
            until: base + Duration::from_secs(3),
            order: 1,
            id: 2,
        });

        assert_eq!(t.peek_delayed().map(|e| e.id), Some(2));
        assert_eq!(t.next_wake(), Some(base + Duration::from_secs(3)));
    }

    #[test]
    fn next_wake_covers_both_timer_sources() {
        let mut t = Tube::new();
        let base = Instant::now();
        t.insert_delayed(DelayedEntry {
            until: base + Duration::from_secs(9),
            order: 0,
            id: 1,
        });
        t.insert_reserved(ReservedEntry {
            deadline: base + Duration::from_secs(4),
            id: 2,
        });

        assert_eq!(t.next_wake(), Some(base + Duration::from_secs(4)));
    }

    #[test]
    fn buried_is_fifo_and_blocks_idle() {
        let mut t = Tube::new();
        t.bury(7);
        t.bury(8);
        assert_eq!(t.peek_buried(), Some(7));
        assert!(!t.is_idle());

        assert!(t.remove_buried(7));
        assert!(t.remove_buried(8));
        assert!(!t.remove_buried(8));
        assert!(t.is_idle());
    }
}
