//! Exponential backoff with jitter for delivery retries.

use std::time::{Duration, SystemTime};

/// Retry pacing configuration.
#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    /// Delivery attempts per batch before it is written to the spool.
    pub max_retries: usize,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Maximum random jitter added to each delay.
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            max_retries: 4,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
        }
    }
}

/// Per-batch retry state. Delays double on every step, capped by the
/// policy.
#[derive(Debug)]
pub(crate) struct Backoff {
    policy: BackoffPolicy,
    delay: Duration,
    attempts: usize,
}

impl Backoff {
    pub(crate) fn new(policy: BackoffPolicy) -> Self {
        Backoff {
            delay: policy.initial_delay,
            attempts: 0,
            policy,
        }
    }

    /// Retries taken so far.
    pub(crate) fn attempts(&self) -> usize {
        self.attempts
    }

    /// Whether the batch has retries left under the policy.
    pub(crate) fn exhausted(&self) -> bool {
        self.attempts >= self.policy.max_retries
    }

    /// Advances the state and returns how long to pause.
    pub(crate) fn next_delay(&mut self) -> Duration {
        self.attempts += 1;
        let jitter = generate_jitter(self.policy.jitter);
        let delay = (self.delay + jitter).min(self.policy.max_delay);
        self.delay = (self.delay * 2).min(self.policy.max_delay);
        delay
    }
}

/// Pseudo-random jitter from the clock's subsecond noise; good enough
/// for spreading retries without a randomness dependency.
fn generate_jitter(max_jitter: Duration) -> Duration {
    let max_millis = max_jitter.as_millis() as u64;
    if max_millis == 0 {
        return Duration::ZERO;
    }
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    Duration::from_millis(u64::from(nanos) % (max_millis + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter_policy() -> BackoffPolicy {
        BackoffPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            jitter: Duration::ZERO,
        }
    }

    #[test]
    fn delays_double_up_to_the_cap() {
        let mut backoff = Backoff::new(no_jitter_policy());
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
    }

    #[test]
    fn exhausted_after_max_retries() {
        let mut backoff = Backoff::new(no_jitter_policy());
        assert!(!backoff.exhausted());
        for _ in 0..3 {
            let _ = backoff.next_delay();
        }
        assert!(backoff.exhausted());
        assert_eq!(backoff.attempts(), 3);
    }

    #[test]
    fn jitter_is_bounded() {
        for _ in 0..32 {
            assert!(generate_jitter(Duration::from_millis(50)) <= Duration::from_millis(50));
        }
    }
}
