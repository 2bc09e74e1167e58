//! Retry helpers shared by the RPC client, git operations and the scheduler.
use std::{future::Future, time::Duration};

use rand::Rng;

#[derive(Debug, Clone)]
pub enum Backoff {
    Constant(Duration),
    /// Doubles from `initial` up to `max`, with up to 20% jitter.
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Constant(d) => *d,
            Backoff::Exponential { initial, max } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                let base = initial.saturating_mul(factor).min(*max);
                let jitter = rand::thread_rng().gen_range(0.0..0.2);
                base.mul_f64(1.0 + jitter).min(*max)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn constant(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Constant(interval),
        }
    }

    pub fn exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential { initial, max },
        }
    }

    /// Runs `op` until it succeeds, returns a non retriable error, or the
    /// attempts are exhausted. The last error is returned on exhaustion.
    pub async fn run<T, E, F, Fut, R>(&self, mut op: F, retriable: R) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(err) if attempt < self.max_attempts.max(1) && retriable(&err) => {
                    let delay = self.backoff.delay(attempt);
                    tracing::debug!(attempt, error = %err, "retrying after {:?}", delay);
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
