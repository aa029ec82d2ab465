//! Shared retry policy for network calls.
//!
//! Classification and synthesis requests both go through [`RetryPolicy`] so
//! backoff behavior lives in one place instead of at every call site.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self::new(cfg.max_attempts, Duration::from_millis(cfg.base_delay_ms))
    }

    /// Run `op` until it succeeds or `max_attempts` is reached, sleeping an
    /// exponentially growing delay between attempts. The final error is
    /// returned unchanged.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    log::warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        label,
                        attempt,
                        self.max_attempts,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    log::error!(
                        "{} failed after {} attempts: {}",
                        label,
                        self.max_attempts,
                        e
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Exponential delay with up to a quarter of the base as jitter, derived
    /// from the clock's subsecond nanos to avoid a rand dependency.
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1 << (attempt - 1).min(8));
        let jitter_range = (self.base_delay.as_millis() as u64 / 4).max(1);
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64)
            .unwrap_or(0);
        exp + Duration::from_millis(nanos % jitter_range)
    }
}
