//! Retry with exponential backoff for status reports.
//!
//! Only transient failures (network errors, timeouts, 5xx/429 responses)
//! are retried. Client-side rejections fail immediately, and cancellation
//! interrupts both the call and the backoff sleep.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::ReportingError;

/// Retry policy for orchestrator calls.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Shortest pause between two report attempts.
const MIN_BACKOFF: Duration = Duration::from_millis(100);

/// Pause before retry number `attempt` (zero based).
///
/// The delay doubles per attempt up to `max_delay` and is then shifted by a
/// random amount of at most a quarter either way, never below
/// [`MIN_BACKOFF`].
pub(crate) fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let doubled = 1u32
        .checked_shl(attempt)
        .and_then(|factor| config.base_delay.checked_mul(factor))
        .unwrap_or(config.max_delay);
    let capped = doubled.min(config.max_delay);

    let spread = capped / 4;
    let jittered = if spread.is_zero() {
        capped
    } else {
        let offset = rand::thread_rng().gen_range(Duration::ZERO..=spread * 2);
        (capped + offset).saturating_sub(spread)
    };
    jittered.max(MIN_BACKOFF)
}

/// Run `send` until it succeeds, fails permanently, or runs out of retries.
///
/// Every attempt re-sends the same notification; the caller builds it once.
pub async fn retry_report<F, Fut>(
    operation: &str,
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut send: F,
) -> Result<(), ReportingError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), ReportingError>>,
{
    let mut attempt = 0u32;
    loop {
        let err = match send().await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        if !err.is_transient() || attempt >= config.max_retries {
            return Err(err);
        }

        let delay = backoff_delay(config, attempt);
        attempt += 1;
        tracing::warn!(
            operation,
            attempt,
            max_retries = config.max_retries,
            delay_ms = delay.as_millis() as u64,
            "Status report failed, retrying: {}",
            err
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ReportingError::Cancelled { operation: operation.to_string() });
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
