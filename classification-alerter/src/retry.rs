//! Backoff for retryable failures (catalog lookups, alert delivery, checkpoint writes).

use std::time::Duration;

use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Multiplier applied to the interval for every past attempt.
    pub backoff_coefficient: u32,
    /// Backoff before the first retry.
    pub initial_interval: Duration,
    pub maximum_interval: Duration,
}

impl RetryPolicy {
    pub fn build(backoff_coefficient: u32, initial_interval: Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Interval to wait before retry number `attempt` (1-based).
    pub fn retry_interval(&self, attempt: u32) -> Duration {
        let candidate = self
            .backoff_coefficient
            .checked_pow(attempt.saturating_sub(1))
            .and_then(|factor| self.initial_interval.checked_mul(factor))
            .unwrap_or(self.maximum_interval);

        std::cmp::min(candidate, self.maximum_interval)
    }

    /// Sleep before retry number `attempt`. Returns `false` if cancelled while
    /// waiting, in which case the caller should give up instead of retrying.
    pub async fn backoff(&self, attempt: u32, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.retry_interval(attempt)) => true,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

pub struct RetryPolicyBuilder {
    backoff_coefficient: u32,
    initial_interval: Duration,
    maximum_interval: Duration,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: Duration::from_millis(500),
            maximum_interval: Duration::from_secs(30),
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn maximum_interval(mut self, interval: Duration) -> RetryPolicyBuilder {
        self.maximum_interval = interval;
        self
    }

    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: std::cmp::max(self.maximum_interval, self.initial_interval),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_interval() {
        let policy = RetryPolicy::build(1, Duration::from_secs(2)).provide();
        assert_eq!(policy.retry_interval(1), Duration::from_secs(2));
        assert_eq!(policy.retry_interval(3), Duration::from_secs(2));
    }

    #[test]
    fn interval_grows_up_to_maximum() {
        let policy = RetryPolicy::build(2, Duration::from_secs(2))
            .maximum_interval(Duration::from_secs(10))
            .provide();
        assert_eq!(policy.retry_interval(1), Duration::from_secs(2));
        assert_eq!(policy.retry_interval(2), Duration::from_secs(4));
        assert_eq!(policy.retry_interval(3), Duration::from_secs(8));
        assert_eq!(policy.retry_interval(4), Duration::from_secs(10));
        assert_eq!(policy.retry_interval(200), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn backoff_stops_on_cancel() {
        let policy = RetryPolicy::build(1, Duration::from_secs(60)).provide();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!policy.backoff(1, &cancel).await);

        let quick = RetryPolicy::build(1, Duration::from_millis(1)).provide();
        assert!(quick.backoff(1, &CancellationToken::new()).await);
    }
}
