//! Content retrieval through the store's CLI binary (`<binary> cat <id>`).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info_span, warn, Instrument};

use crate::runner::{CommandRunner, CommandSpec, RunError};
use crate::{RetryDisposition, RetryPolicy};

/// Substring of the binary's stderr that signals store-lock contention.
pub const LOCK_SIGNATURE: &str = "repo.lock";
pub const TIMEOUT_ERROR: &str = "timeout";
pub const EMPTY_ID_ERROR: &str = "empty identifier";

const STORE_ENV: &str = "IPFS_PATH";
const MAX_ERROR_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub payload: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub attempts: u32,
    pub duration: Duration,
}

impl FetchOutcome {
    fn failed(error: impl Into<String>, attempts: u32, started: Instant) -> Self {
        Self {
            payload: None,
            success: false,
            error: Some(error.into()),
            attempts,
            duration: started.elapsed(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.error.as_deref() == Some(TIMEOUT_ERROR)
    }
}

/// Receives every fetch outcome. Replaces the per-fetch side log.
pub trait FetchObserver: Send + Sync {
    fn observe(&self, item_id: &str, store: &Path, outcome: &FetchOutcome);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl FetchObserver for TracingObserver {
    fn observe(&self, item_id: &str, store: &Path, outcome: &FetchOutcome) {
        let size = outcome.payload.as_ref().map(String::len).unwrap_or(0);
        if outcome.success {
            debug!(
                target: "tsync::fetch",
                token_id = item_id,
                store = %store.display(),
                duration_ms = outcome.duration.as_millis() as u64,
                size,
                attempts = outcome.attempts,
                "fetched"
            );
        } else {
            debug!(
                target: "tsync::fetch",
                token_id = item_id,
                store = %store.display(),
                duration_ms = outcome.duration.as_millis() as u64,
                attempts = outcome.attempts,
                error = outcome.error.as_deref().unwrap_or_default(),
                "fetch failed"
            );
        }
    }
}

enum AttemptError {
    Locked(String),
    LockStuck(String),
    Timeout,
    Other(String),
}

impl AttemptError {
    fn into_message(self) -> String {
        match self {
            AttemptError::Locked(msg) | AttemptError::LockStuck(msg) | AttemptError::Other(msg) => {
                msg
            }
            AttemptError::Timeout => TIMEOUT_ERROR.to_string(),
        }
    }
}

pub struct ContentFetcher {
    runner: Arc<dyn CommandRunner>,
    observer: Arc<dyn FetchObserver>,
    timeout: Duration,
    working_dir: Option<PathBuf>,
    lock_policy: RetryPolicy,
}

impl std::fmt::Debug for ContentFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentFetcher")
            .field("timeout", &self.timeout)
            .field("working_dir", &self.working_dir)
            .field("lock_policy", &self.lock_policy)
            .finish_non_exhaustive()
    }
}

impl ContentFetcher {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self {
            runner,
            observer: Arc::new(TracingObserver),
            timeout,
            working_dir: None,
            lock_policy: RetryPolicy::lock(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn FetchObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_lock_policy(mut self, policy: RetryPolicy) -> Self {
        self.lock_policy = policy;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Fetch one item. Never returns an error; failures are carried in the outcome.
    pub async fn fetch(&self, item_id: &str, store: &Path, binary: &Path) -> FetchOutcome {
        let started = Instant::now();
        let item_id = item_id.trim();
        if item_id.is_empty() {
            let outcome = FetchOutcome::failed(EMPTY_ID_ERROR, 0, started);
            self.observer.observe(item_id, store, &outcome);
            return outcome;
        }

        let span = info_span!("content_fetch", token_id = item_id, store = %store.display());
        let outcome = self
            .fetch_with_lock_retry(item_id, store, binary, started)
            .instrument(span)
            .await;
        self.observer.observe(item_id, store, &outcome);
        outcome
    }

    async fn fetch_with_lock_retry(
        &self,
        item_id: &str,
        store: &Path,
        binary: &Path,
        started: Instant,
    ) -> FetchOutcome {
        let max_attempts = self.lock_policy.max_attempts.max(1);
        let mut attempts = 0;

        let result = self
            .lock_policy
            .run(
                |attempt| {
                    attempts = attempt;
                    self.attempt(item_id, store, binary, attempt < max_attempts)
                },
                |err| match err {
                    AttemptError::Locked(_) => RetryDisposition::Retryable,
                    _ => RetryDisposition::NonRetryable,
                },
            )
            .await;

        match result {
            Ok(stdout) => {
                let trimmed = stdout.trim();
                FetchOutcome {
                    payload: (!trimmed.is_empty()).then(|| trimmed.to_string()),
                    success: true,
                    error: None,
                    attempts,
                    duration: started.elapsed(),
                }
            }
            Err(err) => {
                if let AttemptError::Locked(_) = &err {
                    warn!(
                        token_id = item_id,
                        attempts,
                        daemon_running = is_daemon_running(store),
                        "store lock contention persisted"
                    );
                }
                FetchOutcome::failed(err.into_message(), attempts, started)
            }
        }
    }

    async fn attempt(
        &self,
        item_id: &str,
        store: &Path,
        binary: &Path,
        may_retry: bool,
    ) -> Result<String, AttemptError> {
        let spec = CommandSpec::new(binary, self.timeout)
            .arg("cat")
            .arg(item_id)
            .env(STORE_ENV, store.as_os_str())
            .current_dir(self.working_dir.clone());

        let output = match self.runner.run(&spec).await {
            Ok(output) => output,
            Err(RunError::Timeout) => return Err(AttemptError::Timeout),
            Err(err) => return Err(AttemptError::Other(cap_error(&err.to_string()))),
        };

        if output.success {
            return Ok(output.stdout);
        }

        let stderr = cap_error(&output.stderr);
        if output.stderr.contains(LOCK_SIGNATURE) {
            if !may_retry {
                return Err(AttemptError::Locked(stderr));
            }
            debug!(token_id = item_id, "lock contention, clearing store lock");
            return match clear_store_lock(store).await {
                Ok(_) => Err(AttemptError::Locked(stderr)),
                Err(err) => {
                    warn!(store = %store.display(), error = %err, "failed to clear store lock");
                    Err(AttemptError::LockStuck(stderr))
                }
            };
        }

        Err(AttemptError::Other(stderr))
    }
}

fn cap_error(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "unknown error".to_string();
    }
    trimmed.chars().take(MAX_ERROR_CHARS).collect()
}

/// Remove `<store>/repo.lock`. `Ok(false)` when there was no lock to remove.
pub async fn clear_store_lock(store: &Path) -> std::io::Result<bool> {
    match tokio::fs::remove_file(store.join(LOCK_SIGNATURE)).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

/// A daemon owning the store leaves an `api` file behind.
pub fn is_daemon_running(store: &Path) -> bool {
    store.join("api").exists()
}
