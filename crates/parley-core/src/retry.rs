use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{classify, Failure, ParleyError};

/// Exclusive upper bound of the random jitter added to each backoff delay.
pub const JITTER_MAX_MS: u64 = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the initial attempt. 0 disables retrying.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    8000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Capped exponential delay before retry number `attempt` (zero-indexed),
    /// without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        let nominal = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(nominal.min(self.max_delay_ms))
    }
}

/// Drawn independently for every delay so concurrent clients spread out.
fn jitter() -> Duration {
    Duration::from_millis(rand::rng().random_range(0..JITTER_MAX_MS))
}

/// Called with the 1-indexed retry number and the full delay, right before
/// the delay starts.
pub type RetryObserver<'a> = &'a mut (dyn FnMut(u32, Duration) + Send);

/// Run `operation` until it succeeds, fails with a non-retryable kind, or
/// `policy.max_retries` retries have been spent.
///
/// The final failure is returned exactly as classified. Cancelling `cancel`
/// abandons the in-flight attempt or pending delay and yields
/// [`ParleyError::Cancelled`] without calling `operation` again.
pub async fn execute<F, Fut, T, E>(
    mut operation: F,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut on_retry: Option<RetryObserver<'_>>,
) -> Result<T, ParleyError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<Failure>,
{
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(ParleyError::Cancelled);
        }

        let outcome = tokio::select! {
            outcome = operation() => outcome,
            _ = cancel.cancelled() => return Err(ParleyError::Cancelled),
        };

        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(failure) => classify(Some(failure.into())),
        };

        if !err.is_retryable() {
            tracing::debug!(kind = err.kind(), "not retrying: {err}");
            return Err(err.into());
        }
        if attempt >= policy.max_retries {
            tracing::warn!(attempts = attempt + 1, kind = err.kind(), "retries exhausted: {err}");
            return Err(err.into());
        }

        let delay = policy.backoff(attempt) + jitter();
        attempt += 1;

        tracing::warn!(
            attempt,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            kind = err.kind(),
            "retrying after failure: {err}"
        );

        if let Some(observer) = on_retry.as_deref_mut() {
            observer(attempt, delay);
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return Err(ParleyError::Cancelled),
        }
    }
}
