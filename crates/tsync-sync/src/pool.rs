use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use tsync_core::{validate, EnrichedRecord, RawRow, RecordOrigin};
use tsync_storage::{ContentFetcher, FetchOutcome, RetryDisposition, RetryPolicy, EMPTY_ID_ERROR};

pub const NO_STORE_ERROR: &str = "no store path found";
pub const MISSING_ID_ERROR: &str = "missing token id";
pub const PREVIOUSLY_FETCHED: &str = "previously fetched";

/// Per-source inputs shared by every row of a batch.
#[derive(Debug, Clone)]
pub struct BatchContext {
    pub origin: RecordOrigin,
    pub binary: PathBuf,
    /// Token ids whose content is already in the replica; these are not fetched again.
    pub already_fetched: Arc<HashSet<String>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnrichmentStats {
    pub fetched: u64,
    pub failed: u64,
    pub skipped: u64,
    pub validation_failures: u64,
    pub panicked: u64,
}

#[derive(Debug, Clone, Default)]
pub struct BatchEnrichment {
    pub records: Vec<EnrichedRecord>,
    pub stats: EnrichmentStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tally {
    Fetched,
    Failed,
    Skipped,
    Panicked,
}

/// Fans a page of rows out over a bounded set of fetch tasks.
pub struct EnrichmentPool {
    fetcher: Arc<ContentFetcher>,
    workers: usize,
    fetch_policy: RetryPolicy,
}

impl EnrichmentPool {
    pub fn new(fetcher: Arc<ContentFetcher>, workers: usize) -> Self {
        Self {
            fetcher,
            workers: workers.max(1),
            fetch_policy: RetryPolicy::fetch(),
        }
    }

    pub fn with_fetch_policy(mut self, policy: RetryPolicy) -> Self {
        self.fetch_policy = policy;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Enrich every row. Output order matches input order; one record per row.
    pub async fn enrich(&self, rows: Vec<RawRow>, ctx: &BatchContext) -> BatchEnrichment {
        let total = rows.len();
        let permits = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();

        for (index, row) in rows.iter().cloned().enumerate() {
            let permits = permits.clone();
            let fetcher = self.fetcher.clone();
            let policy = self.fetch_policy;
            let ctx = ctx.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let attempt = AssertUnwindSafe(enrich_row(row.clone(), &ctx, &fetcher, policy))
                    .catch_unwind()
                    .await;
                let done = match attempt {
                    Ok(done) => done,
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        warn!(row = index, error = %message, "enrichment task panicked");
                        (failed_record(&row, &ctx, format!("worker panicked: {message}")), Tally::Panicked)
                    }
                };
                (index, done)
            });
        }

        let mut slots: Vec<Option<(EnrichedRecord, Tally)>> = vec![None; total];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, done)) => slots[index] = Some(done),
                Err(err) => warn!(error = %err, "enrichment task lost"),
            }
        }

        let mut stats = EnrichmentStats::default();
        let records: Vec<EnrichedRecord> = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                let (record, tally) = slot.unwrap_or_else(|| {
                    (failed_record(&rows[index], ctx, "worker cancelled".to_string()), Tally::Panicked)
                });
                match tally {
                    Tally::Fetched => stats.fetched += 1,
                    Tally::Failed => stats.failed += 1,
                    Tally::Skipped => stats.skipped += 1,
                    Tally::Panicked => {
                        stats.failed += 1;
                        stats.panicked += 1;
                    }
                }
                if !record.validation_errors.is_empty() {
                    stats.validation_failures += 1;
                }
                record
            })
            .collect();

        debug!(
            node = %ctx.origin.node_name,
            rows = total,
            fetched = stats.fetched,
            failed = stats.failed,
            skipped = stats.skipped,
            "batch enriched"
        );
        BatchEnrichment { records, stats }
    }
}

fn failed_record(row: &RawRow, ctx: &BatchContext, error: String) -> EnrichedRecord {
    let mut record = EnrichedRecord::from_raw(row, &ctx.origin);
    record.fetch_error = Some(error);
    record
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn fetch_disposition(outcome: &FetchOutcome) -> RetryDisposition {
    match outcome.error.as_deref() {
        _ if outcome.is_timeout() => RetryDisposition::NonRetryable,
        Some(EMPTY_ID_ERROR) => RetryDisposition::NonRetryable,
        _ => RetryDisposition::Retryable,
    }
}

async fn enrich_row(
    row: RawRow,
    ctx: &BatchContext,
    fetcher: &ContentFetcher,
    policy: RetryPolicy,
) -> (EnrichedRecord, Tally) {
    let mut record = EnrichedRecord::from_raw(&row, &ctx.origin);
    let tally = fetch_into(&mut record, &row, ctx, fetcher, policy).await;
    let validation = validate(&record);
    record.validation_errors = validation.errors;
    (record, tally)
}

async fn fetch_into(
    record: &mut EnrichedRecord,
    row: &RawRow,
    ctx: &BatchContext,
    fetcher: &ContentFetcher,
    policy: RetryPolicy,
) -> Tally {
    let Some(store) = ctx.origin.store_path.as_deref() else {
        record.fetch_error = Some(NO_STORE_ERROR.to_string());
        return Tally::Failed;
    };
    let Some(item_id) = row.fetch_id() else {
        record.fetch_error = Some(MISSING_ID_ERROR.to_string());
        return Tally::Failed;
    };
    if ctx.already_fetched.contains(item_id) {
        record.fetch_error = Some(PREVIOUSLY_FETCHED.to_string());
        return Tally::Skipped;
    }

    let result = policy
        .run(
            |_| async move {
                let outcome = fetcher.fetch(item_id, store, &ctx.binary).await;
                if outcome.success {
                    Ok(outcome)
                } else {
                    Err(outcome)
                }
            },
            fetch_disposition,
        )
        .await;

    match result {
        Ok(outcome) => {
            record.content = outcome.payload;
            record.content_fetched = true;
            record.fetch_error = None;
            Tally::Fetched
        }
        Err(outcome) => {
            record.fetch_error = outcome.error;
            Tally::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tsync_core::Column;
    use tsync_storage::{Backoff, CommandOutput, CommandRunner, CommandSpec, RunError};

    /// Echoes the requested id; ids starting with `slow` time out, `bad` fail, `boom` panic.
    struct EchoRunner {
        calls: AtomicUsize,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl EchoRunner {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CommandRunner for EchoRunner {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            let id = spec.args.get(1).cloned().unwrap_or_default();
            if id.starts_with("boom") {
                panic!("runner exploded");
            }
            if id.starts_with("slow") {
                return Err(RunError::Timeout);
            }
            if id.starts_with("bad") {
                return Ok(CommandOutput {
                    success: false,
                    code: Some(1),
                    stderr: "merkledag: not found".into(),
                    ..CommandOutput::default()
                });
            }
            Ok(CommandOutput {
                success: true,
                code: Some(0),
                stdout: format!("content of {id} padded\n"),
                ..CommandOutput::default()
            })
        }
    }

    fn row(id: Option<&str>) -> RawRow {
        RawRow {
            token_id: Column::Present(id.map(str::to_string)),
            did: Column::value("did:rubix:0123456789".into()),
            ..RawRow::default()
        }
    }

    fn setup(workers: usize, store: Option<PathBuf>) -> (Arc<EchoRunner>, EnrichmentPool, BatchContext, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("rubix.db");
        std::fs::write(&db_path, b"").expect("db");
        let runner = Arc::new(EchoRunner::new());
        let fetcher = Arc::new(ContentFetcher::new(runner.clone(), Duration::from_secs(2)));
        let pool = EnrichmentPool::new(fetcher, workers).with_fetch_policy(RetryPolicy::fetch().with_backoff(
            Backoff::Linear {
                step: Duration::from_millis(1),
            },
        ));
        let ctx = BatchContext {
            origin: RecordOrigin {
                source_ip: "10.0.0.1".into(),
                node_name: "node1".into(),
                db_path,
                store_path: store,
                db_modified: Utc::now(),
            },
            binary: PathBuf::from("ipfs"),
            already_fetched: Arc::new(HashSet::new()),
        };
        (runner, pool, ctx, dir)
    }

    #[tokio::test]
    async fn one_record_per_row_in_input_order() {
        let (runner, pool, ctx, _dir) = setup(4, Some(PathBuf::from("/store/.ipfs")));
        let rows: Vec<_> = (0..20).map(|i| row(Some(&format!("Qm{i}")))).collect();
        let out = pool.enrich(rows, &ctx).await;
        assert_eq!(out.records.len(), 20);
        assert_eq!(out.stats.fetched, 20);
        assert_eq!(
            out.records[7].content.as_deref(),
            Some("content of Qm7 padded")
        );
        assert!(runner.peak.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn missing_store_and_missing_id_skip_the_fetch() {
        let (runner, pool, ctx, _dir) = setup(2, None);
        let out = pool.enrich(vec![row(Some("Qm1"))], &ctx).await;
        assert_eq!(out.records[0].fetch_error.as_deref(), Some(NO_STORE_ERROR));

        let (runner2, pool2, ctx2, _dir2) = setup(2, Some(PathBuf::from("/s")));
        let out = pool2.enrich(vec![row(None), row(Some("   "))], &ctx2).await;
        assert!(out
            .records
            .iter()
            .all(|r| r.fetch_error.as_deref() == Some(MISSING_ID_ERROR)));
        assert_eq!(out.stats.failed, 2);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
        assert_eq!(runner2.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn timeouts_are_not_retried_but_failures_are() {
        let (runner, pool, ctx, _dir) = setup(1, Some(PathBuf::from("/s")));
        let out = pool.enrich(vec![row(Some("slow1"))], &ctx).await;
        assert_eq!(out.records[0].fetch_error.as_deref(), Some("timeout"));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);

        let out = pool.enrich(vec![row(Some("bad1"))], &ctx).await;
        assert_eq!(
            out.records[0].fetch_error.as_deref(),
            Some("merkledag: not found")
        );
        assert_eq!(runner.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn previously_fetched_rows_are_skipped() {
        let (runner, pool, mut ctx, _dir) = setup(2, Some(PathBuf::from("/s")));
        ctx.already_fetched = Arc::new(HashSet::from(["Qm1".to_string()]));
        let out = pool.enrich(vec![row(Some("Qm1")), row(Some("Qm2"))], &ctx).await;
        assert_eq!(out.stats.skipped, 1);
        assert_eq!(out.stats.fetched, 1);
        assert_eq!(out.records[0].fetch_error.as_deref(), Some(PREVIOUSLY_FETCHED));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_task_becomes_failed_record() {
        let (_runner, pool, ctx, _dir) = setup(2, Some(PathBuf::from("/s")));
        let out = pool
            .enrich(vec![row(Some("Qm1")), row(Some("boom")), row(Some("Qm3"))], &ctx)
            .await;
        assert_eq!(out.records.len(), 3);
        assert_eq!(out.stats.panicked, 1);
        let failed = &out.records[1];
        assert_eq!(failed.token_key(), "boom");
        assert!(failed
            .fetch_error
            .as_deref()
            .is_some_and(|e| e.starts_with("worker panicked")));
        assert!(out.records[2].content_fetched);
    }

    #[tokio::test]
    async fn validation_failures_are_counted_and_kept() {
        let (_runner, pool, ctx, _dir) = setup(2, Some(PathBuf::from("/s")));
        let long_id = "Q".repeat(501);
        let out = pool.enrich(vec![row(Some(&long_id))], &ctx).await;
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.stats.validation_failures, 1);
        assert!(!out.records[0].validation_errors.is_empty());
    }
}
