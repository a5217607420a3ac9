//! Controllable clock

use peerlink_core::{TimeSource, Timestamp};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Mock time source for deterministic testing
///
/// Clones share the same clock, so a test can hand one copy to the runtime
/// and keep another to move time forward.
#[derive(Debug, Clone)]
pub struct MockTimeSource {
    current_time: Arc<AtomicU64>,
}

impl MockTimeSource {
    /// Start at time 0
    pub fn new() -> Self {
        Self::new_at(0)
    }

    /// Start at a specific millisecond timestamp
    pub fn new_at(start_time: u64) -> Self {
        Self {
            current_time: Arc::new(AtomicU64::new(start_time)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.current_time
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_time(&self, millis: u64) {
        self.current_time.store(millis, Ordering::SeqCst);
    }

    pub fn current_time(&self) -> u64 {
        self.current_time.load(Ordering::SeqCst)
    }
}

impl Default for MockTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MockTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.current_time.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_clock() {
        let clock = MockTimeSource::new_at(1_000);
        let handle = clock.clone();
        handle.advance(Duration::from_secs(61));
        assert_eq!(clock.now(), Timestamp::new(62_000));

        clock.set_time(5);
        assert_eq!(handle.current_time(), 5);
    }
}
