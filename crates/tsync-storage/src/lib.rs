//! Local content-store access: retry policy, subprocess seam, content fetcher, public IP.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

mod fetcher;
mod public_ip;
mod runner;

pub use fetcher::{
    clear_store_lock, is_daemon_running, ContentFetcher, FetchObserver, FetchOutcome,
    TracingObserver, EMPTY_ID_ERROR, LOCK_SIGNATURE, TIMEOUT_ERROR,
};
pub use public_ip::{build_http_client, detect_public_ip, IP_SERVICES, UNKNOWN_IP};
pub use runner::{CommandOutput, CommandRunner, CommandSpec, ProcessRunner, RunError};

pub const CRATE_NAME: &str = "tsync-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `step * n` after the n-th failed attempt.
    Linear { step: Duration },
    /// `base * 2^(n-1)` after the n-th failed attempt, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

/// One retry shape for every call site; sites differ only in attempts, curve and predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Store-lock contention inside one fetch.
    pub fn lock() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Linear {
                step: Duration::from_millis(500),
            },
        }
    }

    /// Row-level fetch retry in the enrichment pool.
    pub fn fetch() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Linear {
                step: Duration::from_millis(100),
            },
        }
    }

    /// Network-class replica write failures.
    pub fn network() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                base: Duration::from_secs(1),
                max: Duration::from_secs(8),
            },
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Delay to wait after `failed_attempts` attempts have failed (1-based).
    pub fn delay_after(&self, failed_attempts: u32) -> Duration {
        let n = failed_attempts.max(1);
        match self.backoff {
            Backoff::Linear { step } => step.saturating_mul(n),
            Backoff::Exponential { base, max } => {
                let factor = 1u32.checked_shl(n - 1).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(max)
            }
        }
    }

    /// Run `op` until it succeeds, `classify` says stop, or attempts run out.
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut, C>(&self, mut op: F, mut classify: C) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnMut(&E) -> RetryDisposition,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= max_attempts || classify(&err) == RetryDisposition::NonRetryable {
                        return Err(err);
                    }
                    let delay = self.delay_after(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
