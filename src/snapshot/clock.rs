use std::collections::BTreeMap;

use super::message::Pid;

/// The peer's own logical clock plus the highest clock seen from every other
/// peer.
#[derive(Clone, Debug, Default)]
pub struct ClockTracker {
    clock: u64,
    last_known: BTreeMap<Pid, u64>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Observation {
    Advanced,
    Stale { known: u64 },
}

impl ClockTracker {
    pub fn new() -> Self {
        ClockTracker::default()
    }

    /// Starts every listed peer at zero so recorded states cover peers that
    /// have not sent anything yet.
    pub fn with_peers(peers: impl IntoIterator<Item = Pid>) -> Self {
        ClockTracker {
            clock: 0,
            last_known: peers.into_iter().map(|pid| (pid, 0)).collect(),
        }
    }

    pub fn observe(&mut self, sender: Pid, sender_clock: u64) -> Observation {
        match self.last_known.get_mut(&sender) {
            Some(known) if *known >= sender_clock => Observation::Stale { known: *known },
            Some(known) => {
                *known = sender_clock;
                Observation::Advanced
            }
            None => {
                let _ = self.last_known.insert(sender, sender_clock);
                Observation::Advanced
            }
        }
    }

    pub fn next_clock(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn last_known(&self, sender: Pid) -> Option<u64> {
        self.last_known.get(&sender).copied()
    }

    pub fn last_known_all(&self) -> &BTreeMap<Pid, u64> {
        &self.last_known
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_clock_is_strictly_increasing() {
        let mut tracker = ClockTracker::new();
        let first = tracker.next_clock();
        let second = tracker.next_clock();

        assert_eq!(first, 1);
        assert!(second > first);
        assert_eq!(tracker.clock(), second);
    }

    #[test]
    fn test_observe_never_decreases() {
        let mut tracker = ClockTracker::new();
        let observations = [3, 1, 5, 5, 2, 9, 4];
        let mut previous = 0;

        for clock in observations {
            tracker.observe(7, clock);
            let known = tracker.last_known(7).unwrap();
            assert!(known >= previous);
            previous = known;
        }

        assert_eq!(tracker.last_known(7), Some(9));
    }

    #[test]
    fn test_observe_reports_stale_values() {
        let mut tracker = ClockTracker::new();

        assert_eq!(tracker.observe(1, 4), Observation::Advanced);
        assert_eq!(tracker.observe(1, 2), Observation::Stale { known: 4 });
        assert_eq!(tracker.observe(1, 4), Observation::Stale { known: 4 });
        assert_eq!(tracker.observe(2, 1), Observation::Advanced);
        assert_eq!(tracker.last_known(1), Some(4));
    }

    #[test]
    fn test_with_peers_starts_at_zero() {
        let mut tracker = ClockTracker::with_peers([1, 2]);

        assert_eq!(tracker.last_known(1), Some(0));
        assert_eq!(tracker.last_known(3), None);
        assert_eq!(tracker.observe(2, 1), Observation::Advanced);
        assert_eq!(tracker.last_known_all().len(), 2);
    }
}
