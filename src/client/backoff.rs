// Linear reconnect backoff: 1s, 1.5s, 2s, ... capped at 10s

use std::time::Duration;

pub const MIN_DELAY: Duration = Duration::from_millis(1000);
pub const MAX_DELAY: Duration = Duration::from_millis(10_000);
pub const STEP: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct BackoffDelay {
    min: Duration,
    max: Duration,
    step: Duration,
    current: Duration,
}

impl Default for BackoffDelay {
    fn default() -> Self {
        Self::new(MIN_DELAY, MAX_DELAY, STEP)
    }
}

impl BackoffDelay {
    pub fn new(min: Duration, max: Duration, step: Duration) -> Self {
        Self {
            min,
            max,
            step,
            current: min,
        }
    }

    /// Delay to wait now; the next call waits one step longer
    pub fn get(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current + self.step).min(self.max);
        delay
    }

    /// Back to the minimum after a successful connection
    pub fn reset(&mut self) {
        self.current = self.min;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}
