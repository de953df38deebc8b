//! Backoff and cancellation for the blocking parts of the protocol.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::RunnerError;

/// Exponential backoff with an optional attempt ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// `None` retries until success or cancellation.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// Run `op` until it yields a value.
    ///
    /// `Ok(None)` means "not yet" and is retried after a backoff; errors are
    /// returned immediately. Fails with [`RunnerError::RetriesExhausted`]
    /// once the ceiling is reached and [`RunnerError::Cancelled`] when the
    /// cancel signal fires.
    pub async fn run<T, F, Fut>(
        &self,
        what: &str,
        cancel: &mut watch::Receiver<bool>,
        mut op: F,
    ) -> Result<T, RunnerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, RunnerError>>,
    {
        let mut attempt = 0u32;
        loop {
            if *cancel.borrow() {
                return Err(RunnerError::Cancelled);
            }

            attempt += 1;
            let result = tokio::select! {
                result = op() => result?,
                _ = cancelled(cancel) => return Err(RunnerError::Cancelled),
            };
            if let Some(value) = result {
                debug!("{} succeeded after {} attempt(s)", what, attempt);
                return Ok(value);
            }

            if self.max_attempts.is_some_and(|max| attempt >= max) {
                warn!("{} gave up after {} attempts", what, attempt);
                return Err(RunnerError::RetriesExhausted { attempts: attempt });
            }

            let delay = self.backoff(attempt);
            warn!("{} attempt {} yielded nothing, retrying in {:?}", what, attempt, delay);
            sleep_or_cancel(delay, cancel).await?;
        }
    }
}

/// Resolve once the signal is set to `true`. Never resolves if the sender
/// is dropped without signalling.
pub async fn cancelled(signal: &mut watch::Receiver<bool>) {
    if signal.wait_for(|set| *set).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Sleep for `duration` unless the signal fires first.
pub async fn sleep_or_cancel(
    duration: Duration,
    signal: &mut watch::Receiver<bool>,
) -> Result<(), RunnerError> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = cancelled(signal) => Err(RunnerError::Cancelled),
    }
}
