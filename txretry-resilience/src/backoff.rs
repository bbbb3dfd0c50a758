//! Backoff delays between transaction retries

use rand::Rng;
use std::time::Duration;

/// Base delay used once the configured wait times run out
pub const SATURATION_DELAY: Duration = Duration::from_secs(32);

/// Wait-time table with optional fuzzing
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    wait_times: Vec<Duration>,
    fuzz: bool,
}

impl Backoff {
    /// Create a backoff from per-retry base delays
    pub fn new(wait_times: Vec<Duration>, fuzz: bool) -> Self {
        Self { wait_times, fuzz }
    }

    pub fn wait_times(&self) -> &[Duration] {
        &self.wait_times
    }

    pub fn is_fuzzed(&self) -> bool {
        self.fuzz
    }

    /// Base delay for a retry (1-indexed)
    ///
    /// Retries past the end of the table all use [`SATURATION_DELAY`], not
    /// the last table entry.
    pub fn base_delay(&self, retry_count: u32) -> Duration {
        retry_count
            .checked_sub(1)
            .and_then(|index| self.wait_times.get(index as usize))
            .copied()
            .unwrap_or(SATURATION_DELAY)
    }

    /// Delay before a retry, fuzzed with the thread-local generator
    pub fn delay(&self, retry_count: u32) -> Duration {
        self.delay_with(retry_count, &mut rand::thread_rng())
    }

    /// Delay before a retry, fuzzed with the given generator
    ///
    /// With fuzzing the delay is drawn uniformly from
    /// `base ± max(base / 4, 1s)`. Draws at or below zero mean no wait,
    /// draws past [`Duration::MAX`] saturate.
    pub fn delay_with<R: Rng + ?Sized>(&self, retry_count: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(retry_count);
        if !self.fuzz {
            return base;
        }

        let base = base.as_secs_f64();
        let fuzz_factor = (base * 0.25).max(1.0);
        let seconds = base + (rng.gen::<f64>() * 2.0 - 1.0) * fuzz_factor;

        if seconds > 0.0 {
            Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
        } else {
            Duration::ZERO
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            txretry_config::DEFAULT_WAIT_TIMES
                .iter()
                .copied()
                .map(Duration::from_secs)
                .collect(),
            true,
        )
    }
}
