//! Retry loop for transient transport failures.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::saturating_millis;
use crate::error::{DispatchError, Result, TransportError};

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 5;

/// Delay between attempts.
///
/// The delay before retry `n` (1-based) is `initial_ms * multiplier^(n-1)`,
/// capped at `max_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial_ms: u64,
    /// Upper bound for any delay.
    pub max_ms: u64,
    /// Growth factor per retry; `1.0` gives a fixed delay.
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1), 1.5, Duration::from_secs(5))
    }
}

impl BackoffPolicy {
    /// Same delay before every retry.
    pub fn fixed(delay: Duration) -> Self {
        let ms = saturating_millis(delay);
        Self {
            initial_ms: ms,
            max_ms: ms,
            multiplier: 1.0,
        }
    }

    /// Exponentially growing delay.
    pub fn exponential(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            initial_ms: saturating_millis(initial),
            max_ms: saturating_millis(max),
            multiplier,
        }
    }

    /// Retry immediately.
    pub fn none() -> Self {
        Self::fixed(Duration::ZERO)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(64) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let ms = (self.initial_ms as f64 * factor).min(self.max_ms as f64);
        Duration::from_millis(ms as u64)
    }
}

/// Run `op` until it succeeds, fails permanently, or `max_retries` retries
/// have failed transiently.
///
/// `op` receives the 1-based attempt number. With `max_retries = N` the
/// operation runs at most `N + 1` times. Cancellation during a backoff sleep
/// ends the loop with [`DispatchError::Cancelled`].
pub(crate) async fn with_retry<T, F, Fut>(
    policy: &BackoffPolicy,
    max_retries: u32,
    cancel: &CancellationToken,
    command: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => e,
            Err(e) => return Err(e),
        };

        if attempt > max_retries {
            warn!(attempt, command, error = %err, "giving up after transient failures");
            return Err(exhausted(attempt, err));
        }

        let delay = policy.delay_for(attempt);
        debug!(attempt, command, error = %err, ?delay, "transient failure, retrying");

        tokio::select! {
            _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn exhausted(attempts: u32, err: DispatchError) -> DispatchError {
    match err {
        DispatchError::Transport(last) => DispatchError::Transport(TransportError::RetriesExhausted {
            attempts,
            last: Box::new(last),
        }),
        other => other,
    }
}
