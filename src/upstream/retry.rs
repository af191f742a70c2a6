//! Retry manager for transient upstream failures
//!
//! The upstream enforces fixed per-window quotas, so a rate-limited call is
//! retried after the wait the upstream asked for, or at the start of the next
//! quota window when it did not say. There is no attempt ceiling: only a
//! fatal error ends the loop.

use crate::config::RetryConfig;
use crate::error::{ErrorKind, RetryableError};
use crate::otel::SyncMetrics;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry manager driven by the upstream's quota window
#[derive(Clone)]
pub struct RetryManager {
    config: RetryConfig,
    metrics: Option<SyncMetrics>,
}

impl RetryManager {
    /// Create a new RetryManager with the given configuration
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            metrics: None,
        }
    }

    /// Count every retry in `metrics`
    pub fn with_metrics(mut self, metrics: SyncMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Execute an async operation, retrying transient errors
    ///
    /// The operation receives the error that caused the previous attempt to
    /// be retried, or `None` on the first attempt. Fatal errors are returned
    /// as they are.
    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut(Option<E>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryableError + std::fmt::Display,
    {
        let mut attempt = 0u64;
        let mut last_error: Option<E> = None;

        loop {
            attempt += 1;

            match operation(last_error.take()).await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    if err.kind() == ErrorKind::Fatal {
                        if attempt > 1 {
                            warn!(attempt, error = %err, "Fatal error after retries");
                        }
                        return Err(err);
                    }

                    let wait = err
                        .retry_after()
                        .unwrap_or_else(|| self.until_next_window());

                    debug!(
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %err,
                        "Retrying after transient error"
                    );

                    if let Some(metrics) = &self.metrics {
                        metrics.record_rate_limit_retry();
                    }

                    tokio::time::sleep(wait).await;
                    last_error = Some(err);
                }
            }
        }
    }

    /// Wait until the start of the next quota window from now
    pub fn until_next_window(&self) -> Duration {
        until_next_window(
            chrono::Utc::now().timestamp_millis(),
            self.config.quota_window(),
        )
    }
}

/// Time from `now_ms` (Unix milliseconds) to the next multiple of `window`
///
/// Always positive; exactly on a boundary the full window is returned.
pub fn until_next_window(now_ms: i64, window: Duration) -> Duration {
    let window = (window.as_millis() as u64).max(1);
    let into_window = now_ms.rem_euclid(window as i64) as u64;
    Duration::from_millis(window - into_window)
}
