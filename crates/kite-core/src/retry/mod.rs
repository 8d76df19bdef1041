//! Retry executor with bounded or unbounded attempts.
//!
//! The retried body receives a [`RetryState`] snapshot and reports each failure
//! as either [`AttemptError::Fail`] (retry according to the policy) or
//! [`AttemptError::Fatal`] (stop immediately). Every wait observes the supplied
//! [`CancellationToken`], so a canceled context unblocks a pending attempt or
//! backoff sleep right away.
use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

mod backoff;
pub use backoff::{Backoff, RetryPolicy};

/// Snapshot handed to every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Time since the first attempt started.
    pub elapsed: Duration,
}

/// Outcome of a failed attempt.
#[derive(Debug)]
pub enum AttemptError<E> {
    /// Transient failure; the executor may try again.
    Fail(E),
    /// Non-retryable failure; the executor stops immediately.
    Fatal(E),
}

impl<E> AttemptError<E> {
    #[inline]
    pub fn fail(error: E) -> Self {
        AttemptError::Fail(error)
    }

    #[inline]
    pub fn fatal(error: E) -> Self {
        AttemptError::Fatal(error)
    }

    pub fn into_inner(self) -> E {
        match self {
            AttemptError::Fail(e) | AttemptError::Fatal(e) => e,
        }
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
    #[error("non-retryable failure on attempt {attempt}: {error}")]
    Aborted { attempt: u32, error: E },
    #[error("deadline exceeded after {attempts} attempts")]
    DeadlineExceeded { attempts: u32, last: Option<E> },
    #[error("canceled after {attempts} attempts")]
    Canceled { attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::DeadlineExceeded { attempts, .. }
            | RetryError::Canceled { attempts } => *attempts,
            RetryError::Aborted { attempt, .. } => *attempt,
        }
    }

    /// The last error reported by the body, if any.
    pub fn into_last(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Aborted { error, .. } => Some(error),
            RetryError::DeadlineExceeded { last, .. } => last,
            RetryError::Canceled { .. } => None,
        }
    }
}

/// Run `op` until it succeeds, fails fatally, or the policy gives up.
///
/// `name` only labels log records.
pub async fn retry<T, E, F, Fut>(
    name: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(RetryState) -> Fut,
    Fut: Future<Output = Result<T, AttemptError<E>>>,
    E: fmt::Display,
{
    let started = Instant::now();
    let deadline = policy.deadline.map(|d| started + d);
    let mut attempt = 0u32;

    loop {
        attempt = attempt.saturating_add(1);
        let state = RetryState {
            attempt,
            elapsed: started.elapsed(),
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(target: "kite.retry", op = name, attempt, "canceled while attempting");
                return Err(RetryError::Canceled { attempts: attempt });
            }
            res = until(deadline, op(state)) => res,
        };

        let error = match outcome {
            Some(Ok(value)) => return Ok(value),
            Some(Err(AttemptError::Fatal(error))) => {
                warn!(target: "kite.retry", op = name, attempt, %error, "non-retryable failure");
                return Err(RetryError::Aborted { attempt, error });
            }
            Some(Err(AttemptError::Fail(error))) => error,
            None => {
                warn!(target: "kite.retry", op = name, attempt, "deadline exceeded during attempt");
                return Err(RetryError::DeadlineExceeded {
                    attempts: attempt,
                    last: None,
                });
            }
        };

        if !policy.allows_another(attempt) {
            warn!(target: "kite.retry", op = name, attempt, %error, "giving up");
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: error,
            });
        }

        let delay = policy.delay_for(attempt);
        if let Some(deadline) = deadline
            && Instant::now() + delay >= deadline
        {
            warn!(target: "kite.retry", op = name, attempt, %error, "deadline exceeded");
            return Err(RetryError::DeadlineExceeded {
                attempts: attempt,
                last: Some(error),
            });
        }

        warn!(
            target: "kite.retry",
            op = name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            %error,
            "attempt failed; retrying"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(target: "kite.retry", op = name, attempt, "canceled during backoff");
                return Err(RetryError::Canceled { attempts: attempt });
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn until<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}
