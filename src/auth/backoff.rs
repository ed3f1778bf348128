use std::time::Duration;

use rand::Rng;

use crate::config::{DEFAULT_MAX_BACKOFF, DEFAULT_MIN_BACKOFF};

/// Exponential backoff with multiplicative jitter.
///
/// Each wait is `current * (1 + j)` with `j` in `[0, 1]`, clamped to
/// `[min, max]`; `current` doubles per failure and resets on success.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_BACKOFF, DEFAULT_MAX_BACKOFF)
    }
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let min = if min.is_zero() { DEFAULT_MIN_BACKOFF } else { min };
        let max = if max < min { min } else { max };
        Self {
            min,
            max,
            current: min,
        }
    }

    pub fn next_wait(&mut self) -> Duration {
        let jitter: f64 = rand::thread_rng().gen_range(0.0..=1.0);
        let wait = self.current.mul_f64(1.0 + jitter).clamp(self.min, self.max);
        self.current = (self.current * 2).min(self.max);
        wait
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}
