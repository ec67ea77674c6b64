//! Event Stamps
//!
//! An `Event` identifies one logical transaction processed by the graph: a
//! monotonically increasing sequence number, a wall-clock timestamp, and the
//! free-text cause that initiated it. Resources remember the last two events
//! at which they changed, which is what makes "did this update during the
//! current event?" and trace reads possible.
//!
//! Sequence `0` is reserved for the "unknown past": the stamp carried by
//! resources that have never been updated.

use std::time::SystemTime;

/// A logical-clock stamp for one graph transaction.
///
/// Events are immutable once created. Two events compare equal only if they
/// carry the same sequence, timestamp, and cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    sequence: u64,
    timestamp: SystemTime,
    cause: Option<String>,
}

impl Event {
    pub(crate) fn new(sequence: u64, timestamp: SystemTime, cause: Option<String>) -> Self {
        Self {
            sequence,
            timestamp,
            cause,
        }
    }

    /// The stamp carried by resources that have never been updated.
    pub fn unknown_past() -> Self {
        Self {
            sequence: 0,
            timestamp: SystemTime::UNIX_EPOCH,
            cause: None,
        }
    }

    /// The event's position in the graph's logical clock. `0` means the
    /// unknown past.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Wall-clock time at which the event began.
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// The cause string supplied when the action was submitted.
    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }

    /// True iff this event is known (not the unknown past) and happened at or
    /// after the given sequence.
    pub fn happened_since(&self, sequence: u64) -> bool {
        self.sequence > 0 && self.sequence >= sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn unknown_past_has_sequence_zero() {
        let event = Event::unknown_past();
        assert_eq!(event.sequence(), 0);
        assert_eq!(event.cause(), None);
    }

    #[test]
    fn happened_since_excludes_unknown_past() {
        let past = Event::unknown_past();
        assert!(!past.happened_since(0));
        assert!(!past.happened_since(1));
    }

    #[test]
    fn happened_since_compares_sequences() {
        let timestamp = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let event = Event::new(5, timestamp, Some("test".into()));

        assert!(event.happened_since(1));
        assert!(event.happened_since(5));
        assert!(!event.happened_since(6));
    }

    #[test]
    fn events_compare_by_all_fields() {
        let timestamp = SystemTime::UNIX_EPOCH + Duration::from_secs(7);
        let a = Event::new(3, timestamp, Some("click".into()));
        let b = Event::new(3, timestamp, Some("click".into()));
        let c = Event::new(3, timestamp, Some("keypress".into()));

        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
