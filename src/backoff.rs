//! Exponential retry backoff with bounded jitter.
//!
//! Used by the stream processor when fetching from the broker fails. Each
//! consecutive failure doubles the base wait up to a cap; every wait gets a
//! uniformly random jitter added so that processor instances do not retry in
//! lockstep. A successful fetch resets the base to its initial value.

use std::time::Duration;

use rand::Rng;

// ---

/// Exponential backoff state for a single consumer loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    // ---
    initial: Duration,
    max: Duration,
    max_jitter: Duration,
    current: Duration,
}

impl Default for Backoff {
    /// 1s initial, 30s cap, up to 500ms jitter.
    fn default() -> Self {
        Backoff::new(
            Duration::from_secs(1),
            Duration::from_secs(30),
            Duration::from_millis(500),
        )
    }
}

impl Backoff {
    // ---
    pub fn new(initial: Duration, max: Duration, max_jitter: Duration) -> Self {
        Backoff {
            initial,
            max,
            max_jitter,
            current: initial,
        }
    }

    /// The base wait the next failure will use, without jitter.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with(&mut rand::thread_rng())
    }

    /// Like [`Backoff::next_delay`] with a caller-supplied random source.
    pub fn next_delay_with<R: Rng>(&mut self, rng: &mut R) -> Duration {
        // ---
        let jitter_ms = rng.gen_range(0..=self.max_jitter.as_millis() as u64);
        let delay = self.current + Duration::from_millis(jitter_ms);

        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Record a success.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
