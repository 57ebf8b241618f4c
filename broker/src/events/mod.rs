// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Event sequencing and per-rank distribution state.

mod publisher;

pub use publisher::Publisher;

use tracing::error;

/// Tracks the event sequence observed at this rank. Every broker sees
/// events in strictly increasing sequence order; duplicates are dropped
/// and gaps logged.
#[derive(Default)]
pub struct EventState {
    last_seen: u32,
}

impl EventState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_seen(&self) -> u32 {
        self.last_seen
    }

    /// Accounts for an incoming event. Returns false if it must be dropped
    /// as a duplicate. Missed events are logged, except before the first
    /// one is seen (a late-joining broker is not "missing" history).
    pub fn observe(&mut self, seq: u32) -> bool {
        if seq <= self.last_seen {
            return false;
        }
        if self.last_seen > 0 {
            let first = self.last_seen + 1;
            let count = seq - first;
            if count > 1 {
                error!("lost events {}-{}", first, seq - 1);
            } else if count == 1 {
                error!("lost event {}", first);
            }
        }
        self.last_seen = seq;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_delivery() {
        let mut state = EventState::new();
        for seq in 1..=5 {
            assert!(state.observe(seq));
        }
        assert_eq!(state.last_seen(), 5);
    }

    #[test]
    fn test_duplicates_dropped() {
        let mut state = EventState::new();
        assert!(state.observe(3));
        assert!(!state.observe(3));
        assert!(!state.observe(2));
        assert_eq!(state.last_seen(), 3);
    }

    #[test]
    fn test_gap_advances_cursor() {
        let mut state = EventState::new();
        assert!(state.observe(1));
        assert!(state.observe(4));
        assert_eq!(state.last_seen(), 4);
        // the skipped range is gone; replays of it are duplicates
        assert!(!state.observe(2));
    }

    #[test]
    fn test_initial_events_not_counted_as_lost() {
        let mut state = EventState::new();
        // first observation may start anywhere
        assert!(state.observe(17));
        assert_eq!(state.last_seen(), 17);
    }
}
