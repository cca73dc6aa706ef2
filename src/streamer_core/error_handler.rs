use crate::error::{Result, SyncError};
use crate::pipeline::config::PipelineConfig;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: u64,
    max_delay: u64,
    max_retries: u32,
    current_attempt: u32,
}

#[derive(Debug, Error)]
#[error("Maximum retry attempts exceeded")]
pub struct MaxRetriesExceeded;

impl ExponentialBackoff {
    pub fn new(initial: u64, max: u64, retries: u32) -> Self {
        Self {
            initial_delay: initial,
            max_delay: max,
            max_retries: retries,
            current_attempt: 0,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.retry_initial_delay_secs,
            config.retry_max_delay_secs,
            config.retry_max_attempts,
        )
    }

    /// Delay before the next attempt, in seconds.
    pub fn next_delay(&self) -> u64 {
        let factor = 2_u64.checked_pow(self.current_attempt).unwrap_or(u64::MAX);
        std::cmp::min(self.initial_delay.saturating_mul(factor), self.max_delay)
    }

    pub async fn sleep(&mut self) -> std::result::Result<(), MaxRetriesExceeded> {
        if self.current_attempt >= self.max_retries {
            return Err(MaxRetriesExceeded);
        }

        let delay = self.next_delay();

        log::warn!(
            "⏳ Retry attempt {} of {} in {}s",
            self.current_attempt + 1,
            self.max_retries,
            delay
        );

        sleep(Duration::from_secs(delay)).await;
        self.current_attempt += 1;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// backoff is exhausted. The last error is returned in the latter cases.
pub async fn retry_with_backoff<T, F, Fut>(
    mut backoff: ExponentialBackoff,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                log::warn!("⚠️  {} failed: {}", what, e);
                if backoff.sleep().await.is_err() {
                    log::error!("❌ {} giving up after retries", what);
                    return Err(e);
                }
            }
            Err(e) => return Err(e),
        }
    }
}
