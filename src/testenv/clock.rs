//! Virtual clock for workflow-observed time.

use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Mock clock. Starts at the epoch and only moves when the test
/// environment fires a timer.
pub(crate) struct MockClock {
    now: Mutex<SystemTime>,
}

impl MockClock {
    pub(crate) fn new() -> Self {
        MockClock {
            now: Mutex::new(UNIX_EPOCH),
        }
    }

    pub(crate) fn now(&self) -> SystemTime {
        *self.now.lock().unwrap()
    }

    /// Move forward to `t`; never moves backwards.
    pub(crate) fn advance_to(&self, t: SystemTime) {
        let mut now = self.now.lock().unwrap();
        if t > *now {
            *now = t;
        }
    }

    /// Time remaining until `t`, zero if already reached.
    pub(crate) fn until(&self, t: SystemTime) -> Duration {
        t.duration_since(self.now()).unwrap_or(Duration::ZERO)
    }
}
