//! Wrap-around arithmetic for 9-bit sequence ids and the ack bitmap.

use super::{NET_ACK_PREVIOUS_SEQUENCES, NET_SEQUENCE_COUNT};

pub type SequenceId = u16;

/// Sentinel meaning "nothing received yet". Compares older than every real
/// sequence for first-frame logic.
pub const NET_SEQUENCE_INVALID: SequenceId = NET_SEQUENCE_COUNT;

/// True iff `s1` is within the forward half of the sequence space from `s2`.
pub fn sequence_more_recent(s1: SequenceId, s2: SequenceId) -> bool {
    ((s1 > s2) && (s1 - s2 <= NET_SEQUENCE_COUNT / 2))
        || ((s2 > s1) && (s2 - s1 > NET_SEQUENCE_COUNT / 2))
}

/// Signed distance from `s2` to `s1`; positive iff `sequence_more_recent`.
pub fn sequence_relative_to(s1: SequenceId, s2: SequenceId) -> i32 {
    if sequence_more_recent(s1, s2) {
        if s1 < s2 {
            (s1 as i32 + NET_SEQUENCE_COUNT as i32) - s2 as i32
        } else {
            s1 as i32 - s2 as i32
        }
    } else if s1 < s2 {
        s1 as i32 - s2 as i32
    } else {
        s1 as i32 - (s2 as i32 + NET_SEQUENCE_COUNT as i32)
    }
}

pub fn sequence_advance(start: SequenceId, delta: i32) -> SequenceId {
    debug_assert!(start < NET_SEQUENCE_COUNT);
    let mut result = start as i32 + delta;
    while result < 0 {
        result += NET_SEQUENCE_COUNT as i32;
    }
    while result >= NET_SEQUENCE_COUNT as i32 {
        result -= NET_SEQUENCE_COUNT as i32;
    }
    result as SequenceId
}

/// The receiver's claim about what it has seen: the most recent sequence id,
/// plus one bit per older id within the ack window.
#[derive(Debug, Clone, Copy)]
pub struct Ack {
    pub sequence_id: SequenceId,
    pub previous_sequences: u64,
}

impl Default for Ack {
    fn default() -> Self {
        Self {
            sequence_id: NET_SEQUENCE_INVALID,
            previous_sequences: 0,
        }
    }
}

impl Ack {
    /// Whether `sequence_id` is covered by this ack.
    pub fn get(&self, sequence_id: SequenceId) -> bool {
        if self.sequence_id == NET_SEQUENCE_INVALID {
            return false;
        }
        if sequence_more_recent(sequence_id, self.sequence_id) {
            return false;
        }
        if sequence_id == self.sequence_id {
            return true;
        }
        let relative = sequence_relative_to(sequence_id, self.sequence_id);
        debug_assert!(relative < 0);
        if relative < -NET_ACK_PREVIOUS_SEQUENCES {
            false
        } else {
            self.previous_sequences & (1u64 << (-relative - 1)) != 0
        }
    }
}

/// Short log of recently resent (or recently seen) sequence ids.
#[derive(Debug, Clone, Copy)]
pub struct SequenceHistoryEntry {
    pub id: SequenceId,
    pub timestamp: f32,
}

#[derive(Debug, Default)]
pub struct SequenceHistory {
    entries: Vec<SequenceHistoryEntry>,
    capacity: usize,
}

impl SequenceHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn add(&mut self, id: SequenceId, timestamp: f32) {
        if self.entries.len() == self.capacity {
            self.entries.pop();
        }
        self.entries.insert(0, SequenceHistoryEntry { id, timestamp });
    }

    /// True if `id` is present with a timestamp newer than the cutoff.
    pub fn contains_newer_than(&self, id: SequenceId, timestamp_cutoff: f32) -> bool {
        self.entries
            .iter()
            .any(|e| e.id == id && e.timestamp > timestamp_cutoff)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_more_recent_basic() {
        assert!(sequence_more_recent(2, 1));
        assert!(!sequence_more_recent(1, 2));
        assert!(!sequence_more_recent(5, 5));
    }

    #[test]
    fn test_more_recent_wraps() {
        assert!(sequence_more_recent(0, NET_SEQUENCE_COUNT - 1));
        assert!(!sequence_more_recent(NET_SEQUENCE_COUNT - 1, 0));
        assert!(sequence_more_recent(10, NET_SEQUENCE_COUNT - 20));
    }

    #[test]
    fn test_relative_matches_more_recent_sign() {
        let pairs = [(2, 1), (1, 2), (0, 511), (511, 0), (300, 44), (44, 300)];
        for (a, b) in pairs {
            let rel = sequence_relative_to(a, b);
            if sequence_more_recent(a, b) {
                assert!(rel > 0, "({a},{b}) -> {rel}");
            } else if a != b {
                assert!(rel < 0, "({a},{b}) -> {rel}");
            }
        }
    }

    #[test]
    fn test_advance_inverts_relative() {
        for (start, delta) in [(0u16, 5), (500, 20), (5, -10), (0, -1)] {
            let advanced = sequence_advance(start, delta);
            assert_eq!(sequence_relative_to(advanced, start), delta);
        }
    }

    #[test]
    fn test_ack_get_window() {
        let ack = Ack {
            sequence_id: 10,
            previous_sequences: 0b1011,
        };
        assert!(ack.get(10));
        assert!(ack.get(9)); // bit 0
        assert!(ack.get(8)); // bit 1
        assert!(!ack.get(7)); // bit 2 clear
        assert!(ack.get(6)); // bit 3
        assert!(!ack.get(11)); // newer than the ack
        assert!(!ack.get(sequence_advance(10, -(NET_ACK_PREVIOUS_SEQUENCES + 1))));
    }

    #[test]
    fn test_sequence_history_cutoff() {
        let mut history = SequenceHistory::new(4);
        history.add(3, 1.0);
        history.add(4, 2.0);
        assert!(history.contains_newer_than(3, 0.5));
        assert!(!history.contains_newer_than(3, 1.5));
        assert!(!history.contains_newer_than(9, 0.0));
    }

    #[test]
    fn test_sequence_history_evicts_oldest() {
        let mut history = SequenceHistory::new(2);
        history.add(1, 1.0);
        history.add(2, 2.0);
        history.add(3, 3.0);
        assert!(!history.contains_newer_than(1, 0.0));
        assert!(history.contains_newer_than(2, 0.0));
        assert!(history.contains_newer_than(3, 0.0));
    }
}
