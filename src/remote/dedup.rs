//! Push event de-duplication
//!
//! Realtime backends occasionally redeliver the same change (reconnects,
//! overlapping poll windows). An event id seen within the window is dropped.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default de-duplication window
pub const EVENT_DEDUP_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct EventDeduplicator {
    window: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl Default for EventDeduplicator {
    fn default() -> Self {
        Self::new(EVENT_DEDUP_WINDOW)
    }
}

impl EventDeduplicator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record `event_id` and report whether it was already seen in the window
    pub fn is_duplicate(&self, event_id: &str) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());

        seen.retain(|_, at| now.duration_since(*at) <= self.window);

        if seen.contains_key(event_id) {
            return true;
        }
        seen.insert(event_id.to_string(), now);
        false
    }

    /// Number of ids currently remembered
    pub fn tracked(&self) -> usize {
        self.seen.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeat_within_window_is_duplicate() {
        let dedup = EventDeduplicator::default();
        assert!(!dedup.is_duplicate("INSERT_1_followers"));
        assert!(dedup.is_duplicate("INSERT_1_followers"));
        assert!(!dedup.is_duplicate("INSERT_1_following"));
        assert_eq!(dedup.tracked(), 2);
    }

    #[test]
    fn test_ids_expire_after_window() {
        let dedup = EventDeduplicator::new(Duration::from_millis(20));
        assert!(!dedup.is_duplicate("DELETE_7_followers"));
        std::thread::sleep(Duration::from_millis(40));
        assert!(!dedup.is_duplicate("DELETE_7_followers"));
    }
}
