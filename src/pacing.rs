//! Delays between attempts and items.
//!
//! Every wait in the relay goes through [`Sleeper`] so tests can observe the
//! schedule without actually blocking.

use rand::Rng;
use std::ops::Range;
use std::time::Duration;

pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

/// Blocks the current thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Uniformly random duration inside `range` (seconds). An empty range yields
/// its start.
pub fn jitter(range: Range<f64>) -> Duration {
    if range.is_empty() {
        return Duration::from_secs_f64(range.start.max(0.0));
    }
    let secs = rand::thread_rng().gen_range(range);
    Duration::from_secs_f64(secs.max(0.0))
}

/// Exponential delay for `attempt` (1-based): `initial * 2^(attempt-1)`,
/// clamped to `ceiling`.
pub fn exponential_backoff(initial: Duration, attempt: u32, ceiling: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    initial
        .checked_mul(1u32 << exponent)
        .unwrap_or(ceiling)
        .min(ceiling)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_in_range() {
        for _ in 0..50 {
            let value = jitter(5.0..12.0).as_secs_f64();
            assert!((5.0..12.0).contains(&value));
        }
    }

    #[test]
    fn jitter_handles_degenerate_range() {
        assert_eq!(jitter(2.0..2.0), Duration::from_secs(2));
    }

    #[test]
    fn exponential_backoff_doubles_until_ceiling() {
        let initial = Duration::from_secs(4);
        let ceiling = Duration::from_secs(60);
        assert_eq!(exponential_backoff(initial, 1, ceiling), Duration::from_secs(4));
        assert_eq!(exponential_backoff(initial, 2, ceiling), Duration::from_secs(8));
        assert_eq!(exponential_backoff(initial, 3, ceiling), Duration::from_secs(16));
        assert_eq!(exponential_backoff(initial, 9, ceiling), ceiling);
    }
}
