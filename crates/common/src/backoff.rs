//! Retry pacing for worker jobs.
//!
//! Visibility and connection failures during a restore cluster in time: one
//! CREATE TABLE committing late makes several workers fail the same way at
//! the same moment. Delays therefore double per attempt up to a cap, and
//! each sleep is fully jittered so retrying workers spread out instead of
//! hammering the server in lockstep.

use std::time::Duration;

use rand::Rng;

/// Doubling the base more than this many times is past any sane cap.
const MAX_DOUBLINGS: u32 = 16;

pub struct RetryDelay {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl RetryDelay {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// The sleep before the next attempt: `base * 2^attempt`, capped at
    /// `cap`, scaled by a uniform random fraction.
    pub fn next_delay(&mut self, rng: &mut impl Rng) -> Duration {
        let doublings = self.attempt.min(MAX_DOUBLINGS);
        self.attempt += 1;
        let uncapped = self.base.saturating_mul(1 << doublings);
        uncapped.min(self.cap).mul_f64(rng.gen::<f64>())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand::{
        rngs::StdRng,
        SeedableRng,
    };

    use super::RetryDelay;

    #[test]
    fn test_delays_never_exceed_the_cap() {
        let mut rng = StdRng::seed_from_u64(17);
        let mut retry = RetryDelay::new(Duration::from_millis(500), Duration::from_secs(5));
        for _ in 0..40 {
            assert!(retry.next_delay(&mut rng) <= Duration::from_secs(5));
        }
    }

    #[test]
    fn test_first_delay_is_within_the_base() {
        let mut rng = StdRng::seed_from_u64(17);
        let mut retry = RetryDelay::new(Duration::from_millis(500), Duration::from_secs(5));
        assert!(retry.next_delay(&mut rng) <= Duration::from_millis(500));
    }

    #[test]
    fn test_zero_base_stays_zero() {
        let mut rng = StdRng::seed_from_u64(17);
        let mut retry = RetryDelay::new(Duration::ZERO, Duration::from_secs(5));
        for _ in 0..5 {
            assert_eq!(retry.next_delay(&mut rng), Duration::ZERO);
        }
    }
}
