use std::future::Future;
use std::time::Duration;

use crate::error::{retry_exhausted, EntglResult};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_DELAY: Duration = Duration::from_millis(200);

/// Retries transient failures with linear backoff (`delay * attempt`).
///
/// Transient means network, timeout, or I/O-class persistence failures;
/// anything else bubbles immediately. Exhaustion wraps the last cause as
/// `RETRY_EXHAUSTED`.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    pub async fn execute<T, F, Fut>(&self, name: &str, mut op: F) -> EntglResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EntglResult<T>>,
    {
        let mut attempt = 1u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) if attempt >= self.max_attempts => {
                    return Err(retry_exhausted(name, attempt, err));
                }
                Err(err) => {
                    log::debug!(
                        "retrying `{name}` after attempt {attempt}: {err}"
                    );
                    tokio::time::sleep(self.delay * attempt).await;
                    attempt += 1;
                }
            }
        }
    }
}
