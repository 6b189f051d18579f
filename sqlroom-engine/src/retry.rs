//! Bounded exponential backoff for transaction conflicts.

use rand::Rng;
use std::time::Duration;

use crate::error::EngineError;

/// Retry policy for transient conflicts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Extra random delay as a fraction of the capped delay (0.0..=1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            jitter: 0.3,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before retry number `attempt`, including random jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_backoff(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..jitter);
        base + base.mul_f64(extra)
    }

    /// Run `op` until it succeeds, fails with a non-conflict error, or the
    /// retry budget is spent. `sleep` is called between attempts.
    pub fn run<T>(
        &self,
        mut op: impl FnMut() -> Result<T, EngineError>,
        mut sleep: impl FnMut(Duration),
    ) -> Result<T, EngineError> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_conflict() => {
                    if attempt >= self.max_retries {
                        return Err(match err {
                            EngineError::Database(source) if self.max_retries > 0 => {
                                EngineError::ConflictRetriesExhausted {
                                    attempts: attempt,
                                    source,
                                }
                            }
                            other => other,
                        });
                    }
                    let delay = self.backoff(attempt);
                    log::warn!(
                        "Transaction conflict, retry {}/{} in {delay:?}: {err}",
                        attempt + 1,
                        self.max_retries
                    );
                    sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
