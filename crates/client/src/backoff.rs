//! Capped exponential backoff with full jitter, shared by every protocol
//! client's reconnect loop.

use std::time::Duration;

use rand::Rng;

/// Capped exponential backoff with full jitter (base 1 s, cap 60 s by
/// default), as specified for every client's reconnection loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl Backoff {
    /// Creates a new backoff with the given base and cap delays.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap, attempt: 0 }
    }

    /// Returns the number of consecutive attempts recorded since the last
    /// reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Computes the next delay and advances the attempt counter. Delay is
    /// `min(cap, base * 2^attempt)` with full jitter: a uniform random
    /// draw in `[0, delay]`.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(32);
        self.attempt += 1;

        let unjittered = self.base.checked_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX)).unwrap_or(self.cap);
        let capped = unjittered.min(self.cap);

        let jittered_millis = rand::thread_rng().gen_range(0..=capped.as_millis().max(1) as u64);
        Duration::from_millis(jittered_millis)
    }

    /// Resets the attempt counter, e.g. after a successful reconnect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn delay_never_exceeds_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_secs(60));
        }
    }

    #[test]
    fn reset_restarts_from_base() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let _ = backoff.next_delay();
        let _ = backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
    }
}
