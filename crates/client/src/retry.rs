use std::time::Duration;

use rand::Rng;

/// Exponential backoff shape for retries against a single host.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(5000),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Uncapped-by-jitter delay for a 1-based attempt number:
    /// `min(max_delay, initial * base^(attempt-1))`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis =
            self.initial_delay.as_millis() as f64 * self.exponential_base.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Backoff delay with jitter in `[0.5, 1.5)` applied, bounding each
    /// sleep by `1.5 * max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter {
            return base;
        }
        let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_millis((base.as_millis() as f64 * factor) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(5000),
            exponential_base: 2.0,
            jitter: true,
        }
    }

    #[test]
    fn base_delay_doubles_then_caps() {
        let policy = policy();
        assert_eq!(policy.base_delay(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay(3), Duration::from_millis(400));
        // 100 * 2^9 = 51200 is over the cap.
        assert_eq!(policy.base_delay(10), Duration::from_millis(5000));
    }

    #[test]
    fn jittered_delay_stays_within_half_to_one_and_a_half() {
        let policy = policy();
        for attempt in 1..=6 {
            let base = policy.base_delay(attempt).as_millis() as f64;
            for _ in 0..50 {
                let delay = policy.delay(attempt).as_millis() as f64;
                assert!(
                    delay >= base * 0.5 - 1.0 && delay < base * 1.5 + 1.0,
                    "attempt {attempt}: delay {delay} outside [{}, {})",
                    base * 0.5,
                    base * 1.5
                );
            }
        }
    }

    #[test]
    fn disabling_jitter_gives_deterministic_delays() {
        let mut policy = policy();
        policy.jitter = false;
        assert_eq!(policy.delay(3), Duration::from_millis(400));
    }
}
