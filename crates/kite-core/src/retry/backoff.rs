use std::time::Duration;

/// How long to wait between two attempts.
#[derive(Clone, Debug, PartialEq)]
pub enum Backoff {
    /// Same delay after every failure.
    Constant(Duration),
    /// `first * factor^(n-1)` after the n-th failure, capped at `max`.
    Exponential {
        first: Duration,
        max: Duration,
        factor: f64,
    },
}

impl Backoff {
    /// Delay to apply after the `attempt`-th failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Constant(d) => *d,
            Backoff::Exponential { first, max, factor } => {
                let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let secs = first.as_secs_f64() * factor.powi(exp);
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    *max
                } else {
                    Duration::from_secs_f64(secs.max(0.0))
                }
            }
        }
    }
}

/// Declarative retry policy consumed by [`crate::retry`].
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one; `None` retries forever.
    pub max_attempts: Option<u32>,
    pub backoff: Backoff,
    /// Upper bound of a uniformly random delay added to every backoff.
    pub jitter: Option<Duration>,
    /// Overall time budget for all attempts and waits.
    pub deadline: Option<Duration>,
}

impl RetryPolicy {
    /// Constant delay, unlimited attempts.
    pub fn constant(delay: Duration) -> Self {
        Self {
            max_attempts: None,
            backoff: Backoff::Constant(delay),
            jitter: None,
            deadline: None,
        }
    }

    /// Doubling delay starting at `first`, capped at `max`, unlimited attempts.
    pub fn exponential(first: Duration, max: Duration) -> Self {
        Self {
            max_attempts: None,
            backoff: Backoff::Exponential {
                first,
                max,
                factor: 2.0,
            },
            jitter: None,
            deadline: None,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }

    pub fn forever(mut self) -> Self {
        self.max_attempts = None;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = Some(jitter);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Delay after the `attempt`-th failure, including jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.backoff.delay(attempt);
        match self.jitter {
            Some(jitter) if !jitter.is_zero() => base + jitter.mul_f64(rand::random::<f64>()),
            _ => base,
        }
    }

    /// Returns `true` if another attempt is allowed after `attempt` failures.
    #[inline]
    pub fn allows_another(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt < max)
    }
}
