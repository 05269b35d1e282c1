//! Recognition of messages the plugin injected itself.
//!
//! Every self-sent prompt carries an opaque marker that the host reflects on the
//! resulting `message.updated` event. Hosts that drop the marker fall back to a
//! wall-clock proximity check against the last injection of each source.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Proximity window for marker-less echo detection.
pub const ECHO_WINDOW_MS: i64 = 2_000;

/// Which scheduler produced an injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InjectionSource {
    Todo,
    Iteration,
}

impl InjectionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            InjectionSource::Todo => "todo",
            InjectionSource::Iteration => "iteration",
        }
    }
}

#[derive(Debug, Clone)]
struct Injected {
    marker: String,
    sent_at_ms: i64,
}

/// Per-session record of the last injection of each source.
#[derive(Debug, Default)]
pub struct EchoTracker {
    sessions: Mutex<HashMap<String, HashMap<InjectionSource, Injected>>>,
}

impl EchoTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, session_id: &str, source: InjectionSource, marker: &str, sent_at_ms: i64) {
        self.lock().entry(session_id.to_string()).or_default().insert(
            source,
            Injected {
                marker: marker.to_string(),
                sent_at_ms,
            },
        );
    }

    /// Whether a user message created at `created_ms` is one of ours.
    ///
    /// A present marker decides on its own; the time window applies only when
    /// the host did not reflect a marker.
    pub fn is_echo(&self, session_id: &str, marker: Option<&str>, created_ms: i64) -> bool {
        let sessions = self.lock();
        let Some(injected) = sessions.get(session_id) else {
            return false;
        };
        match marker {
            Some(marker) => injected.values().any(|entry| entry.marker == marker),
            None => injected
                .values()
                .any(|entry| (created_ms - entry.sent_at_ms).abs() <= ECHO_WINDOW_MS),
        }
    }

    pub fn forget(&self, session_id: &str) {
        self.lock().remove(session_id);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, HashMap<InjectionSource, Injected>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Milliseconds since the Unix epoch, the unit hosts use for `time.created`.
pub fn wall_clock_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_marker_is_echo() {
        let tracker = EchoTracker::new();
        tracker.record("s1", InjectionSource::Todo, "todo-abc", 1_000);
        assert!(tracker.is_echo("s1", Some("todo-abc"), 90_000));
    }

    #[test]
    fn foreign_marker_is_not_echo_even_inside_window() {
        let tracker = EchoTracker::new();
        tracker.record("s1", InjectionSource::Todo, "todo-abc", 1_000);
        assert!(!tracker.is_echo("s1", Some("user-typed"), 1_100));
    }

    #[test]
    fn markerless_event_uses_time_window() {
        let tracker = EchoTracker::new();
        tracker.record("s1", InjectionSource::Iteration, "iter-1", 10_000);
        assert!(tracker.is_echo("s1", None, 11_500));
        assert!(tracker.is_echo("s1", None, 9_000));
        assert!(!tracker.is_echo("s1", None, 12_500));
    }

    #[test]
    fn sessions_are_independent_and_forgettable() {
        let tracker = EchoTracker::new();
        tracker.record("s1", InjectionSource::Todo, "m", 0);
        assert!(!tracker.is_echo("s2", Some("m"), 0));
        tracker.forget("s1");
        assert!(!tracker.is_echo("s1", Some("m"), 0));
    }

    #[test]
    fn later_injection_replaces_earlier_for_same_source() {
        let tracker = EchoTracker::new();
        tracker.record("s1", InjectionSource::Todo, "first", 0);
        tracker.record("s1", InjectionSource::Todo, "second", 50_000);
        assert!(!tracker.is_echo("s1", Some("first"), 50_000));
        assert!(tracker.is_echo("s1", Some("second"), 50_000));
    }
}
