use std::thread;
use std::time::Duration;

use tracing::{error, warn};

use crate::error::Result;

/// Bounded retry of recoverable faults.
///
/// Only errors for which [`ControlError::is_recoverable`](crate::ControlError::is_recoverable)
/// holds are retried; anything else is returned at once. When every attempt failed, the last
/// fault is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// A single attempt, no retry.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Run `op` until it succeeds, fails with a non-recoverable error, or attempts run out.
    /// `op` receives the 1-based attempt number.
    pub fn run<T>(&self, mut op: impl FnMut(u32) -> Result<T>) -> Result<T> {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_recoverable() && attempt < self.attempts => {
                    warn!(attempt, "{e}; retrying in {:?}", self.delay);
                    thread::sleep(self.delay);
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_recoverable() {
                        error!(attempts = self.attempts, "giving up: {e}");
                    }
                    return Err(e);
                }
            }
        }
    }
}
