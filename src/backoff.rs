//! Retry backoff for failed jobs.
//!
//! A failed job becomes eligible again `base ^ attempts` seconds after the
//! failure. With the default base of 2 that gives 2s, 4s, 8s, 16s…
//!
//! ```
//! # use queuectl::backoff::Exponential;
//! # use chrono::TimeDelta;
//! let strategy = Exponential::new(2.0);
//!
//! assert_eq!(strategy.backoff(1), TimeDelta::seconds(2));
//! assert_eq!(strategy.backoff(2), TimeDelta::seconds(4));
//! assert_eq!(strategy.backoff(3), TimeDelta::seconds(8));
//! ```

use chrono::TimeDelta;

/// Exponential backoff strategy.
///
/// Grows exponentially with each attempt; a maximum can be applied with
/// [`Exponential::with_max`]. Bases below 1 are treated as 1 (constant
/// one-second backoff), keeping the delay non-decreasing in the attempt
/// count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Exponential {
    base: f64,
    max: Option<TimeDelta>,
}

impl Exponential {
    pub const fn new(base: f64) -> Self {
        Self { base, max: None }
    }

    pub const fn with_max(self, max: TimeDelta) -> Self {
        Self {
            max: Some(max),
            ..self
        }
    }

    pub fn backoff(&self, attempt: u32) -> TimeDelta {
        let base = self.base.max(1.0);
        let millis = base.powi(attempt.min(i32::MAX as u32) as i32) * 1_000.0;
        let millis = if millis.is_finite() && millis < i64::MAX as f64 {
            millis as i64
        } else {
            i64::MAX
        };
        let mut delay = TimeDelta::try_milliseconds(millis).unwrap_or(TimeDelta::MAX);
        if let Some(max) = self.max {
            delay = delay.min(max);
        }
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_with_default_base() {
        let strategy = Exponential::new(2.0);
        assert_eq!(strategy.backoff(1), TimeDelta::seconds(2));
        assert_eq!(strategy.backoff(2), TimeDelta::seconds(4));
        assert_eq!(strategy.backoff(3), TimeDelta::seconds(8));
        assert_eq!(strategy.backoff(4), TimeDelta::seconds(16));
    }

    #[test]
    fn supports_fractional_bases() {
        let strategy = Exponential::new(1.5);
        assert_eq!(strategy.backoff(1), TimeDelta::milliseconds(1_500));
        assert_eq!(strategy.backoff(2), TimeDelta::milliseconds(2_250));
    }

    #[test]
    fn non_decreasing_for_bases_of_at_least_one() {
        for base in [1.0, 1.1, 2.0, 3.0, 10.0] {
            let strategy = Exponential::new(base);
            let mut previous = TimeDelta::zero();
            for attempt in 1..=20 {
                let delay = strategy.backoff(attempt);
                assert!(delay >= previous, "base {base} attempt {attempt}");
                previous = delay;
            }
        }
    }

    #[test]
    fn saturates_instead_of_overflowing() {
        let strategy = Exponential::new(10.0);
        assert!(strategy.backoff(u32::MAX) > TimeDelta::days(365));
    }

    #[test]
    fn max_caps_the_delay() {
        let strategy = Exponential::new(2.0).with_max(TimeDelta::seconds(5));
        assert_eq!(strategy.backoff(1), TimeDelta::seconds(2));
        assert_eq!(strategy.backoff(10), TimeDelta::seconds(5));
    }
}
