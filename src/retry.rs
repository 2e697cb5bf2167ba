use rand::Rng;
use tokio::time::{sleep, Duration};

use crate::error::{AuctionError, AuctionResult};
use crate::logging::log_conflict_retry;

/// Retry configuration for ledger conflicts
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 5,
            max_delay_ms: 200,
            jitter_factor: 0.5,
        }
    }
}

impl RetryConfig {
    /// Calculate delay with exponential backoff and jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64 * 2.0_f64.powi(attempt as i32);
        let clamped = base.min(self.max_delay_ms as f64);

        // ±jitter_factor of the delay
        let jitter_range = clamped * self.jitter_factor;
        let jitter: f64 = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        let final_delay = (clamped + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }
}

/// Run `operation` until it succeeds, fails with a non-conflict error, or
/// the retry budget is spent. Each attempt must re-read ledger state.
pub async fn retry_on_conflict<F, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> AuctionResult<T>
where
    F: FnMut() -> AuctionResult<T>,
{
    let mut attempt = 0;
    loop {
        match operation() {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                let delay = config.delay_for_attempt(attempt);
                let key = match &e {
                    AuctionError::Conflict { key } => key.as_str(),
                    _ => "",
                };
                log_conflict_retry(
                    operation_name,
                    attempt + 1,
                    config.max_retries + 1,
                    key,
                    delay.as_millis() as u64,
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
