//! Retry and repeat pacing

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with an optional random jitter
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Delay before the first retry (milliseconds)
    pub initial_delay_millis: u64,
    /// Maximum delay cap (milliseconds)
    pub max_delay_millis: u64,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
    /// Upper bound (exclusive) of the random jitter added to each delay (milliseconds)
    pub jitter_millis: u64,
}

impl RetryPolicy {
    /// Backoff between attempts of one transaction
    pub fn transaction() -> Self {
        Self {
            initial_delay_millis: 1,
            max_delay_millis: 100,
            backoff_multiplier: 10.0,
            jitter_millis: 10,
        }
    }

    /// Backoff between repeats of one operation
    pub fn operation() -> Self {
        Self {
            jitter_millis: 0,
            ..Self::transaction()
        }
    }

    /// Backoff between attempts to remove a client from the client record
    pub fn client_record_removal() -> Self {
        Self {
            initial_delay_millis: 1,
            max_delay_millis: 250,
            backoff_multiplier: 2.0,
            jitter_millis: 10,
        }
    }

    /// Calculate delay for a given attempt (1-indexed), without jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::from_millis(0);
        }

        let delay = self.initial_delay_millis as f64 * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = delay.min(self.max_delay_millis as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay for `attempt` plus jitter
    pub fn jittered_delay_for_attempt(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_millis == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..self.jitter_millis)
        };
        self.delay_for_attempt(attempt) + Duration::from_millis(jitter)
    }
}

/// How an operation waits before repeating itself
#[derive(Clone, Debug)]
pub enum RepeatDelay {
    /// Same short delay every time
    Fixed(Duration),
    /// Growing delay
    Backoff(RetryPolicy),
    /// Repeat straight away
    Immediate,
}

impl RepeatDelay {
    /// 3 ms between repeats
    pub fn short() -> Self {
        Self::Fixed(Duration::from_millis(3))
    }

    /// Operation backoff between repeats
    pub fn backoff() -> Self {
        Self::Backoff(RetryPolicy::operation())
    }

    /// Delay before repeat number `repeat` (1-indexed)
    pub fn delay(&self, repeat: u32) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Backoff(policy) => policy.delay_for_attempt(repeat),
            Self::Immediate => Duration::ZERO,
        }
    }

    /// Wait before repeat number `repeat`
    pub async fn wait(&self, repeat: u32) {
        let delay = self.delay(repeat);
        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_backoff() {
        let policy = RetryPolicy::transaction();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(0));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(100));
        // Would be 1000 but capped at max
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy::transaction();
        for _ in 0..100 {
            let delay = policy.jittered_delay_for_attempt(2);
            assert!(delay >= Duration::from_millis(10));
            assert!(delay < Duration::from_millis(20));
        }
        assert_eq!(RetryPolicy::operation().jittered_delay_for_attempt(2), Duration::from_millis(10));
    }

    #[test]
    fn test_repeat_delays() {
        assert_eq!(RepeatDelay::short().delay(7), Duration::from_millis(3));
        assert_eq!(RepeatDelay::backoff().delay(3), Duration::from_millis(100));
        assert_eq!(RepeatDelay::Immediate.delay(3), Duration::ZERO);
        assert_eq!(RetryPolicy::client_record_removal().delay_for_attempt(5), Duration::from_millis(16));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_uses_tokio_time() {
        let started = tokio::time::Instant::now();
        RepeatDelay::backoff().wait(2).await;
        assert!(started.elapsed() >= Duration::from_millis(10));
    }
}
