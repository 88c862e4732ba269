// src/utils/retry.rs
use crate::config::NetworkConfig;
use crate::error::ConnectorError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// Bounded exponential backoff for transient HTTP failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base: Duration,
    pub cap: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn from_config(cfg: &NetworkConfig) -> Self {
        Self {
            attempts: cfg.retry_attempts.max(1),
            base: Duration::from_millis(cfg.backoff_base_ms),
            cap: Duration::from_millis(cfg.backoff_cap_ms),
            jitter: cfg.jitter,
        }
    }

    /// Delay after a failed `attempt` (1-based): base * 2^(attempt-1), capped,
    /// then scaled by 0.8..1.2 when jitter is on.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let raw = self.base.saturating_mul(1u32 << exp).min(self.cap);
        if !self.jitter {
            return raw;
        }
        let factor = rand::thread_rng().gen_range(0.8..=1.2);
        raw.mul_f64(factor)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or attempts run out.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, ConnectorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ConnectorError>>,
    {
        let mut last_err = ConnectorError::Unavailable(format!("{label}: no attempts made"));
        for attempt in 1..=self.attempts {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if !e.is_retryable() => {
                    error!("{} non-retryable error: {} (attempt {}/{})", label, e, attempt, self.attempts);
                    return Err(e);
                }
                Err(e) => {
                    warn!("{} transient error: {} (attempt {}/{})", label, e, attempt, self.attempts);
                    last_err = e;
                }
            }
            if attempt < self.attempts {
                tokio::time::sleep(self.delay_for(attempt)).await;
            }
        }
        error!("{} failed after {} attempts: {}", label, self.attempts, last_err);
        Err(last_err)
    }
}
