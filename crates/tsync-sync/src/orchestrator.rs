use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures_util::{pin_mut, StreamExt};
use tracing::{debug, error, info, info_span, warn, Instrument};
use tsync_adapters::{discover, SourceLocator, TokenExtractor};
use tsync_core::{
    Column, EnrichedRecord, ErrorKind, ProcessedSourceRecord, RecordOrigin, ResolvedPaths,
    RunMetrics, RunSession, RunStatus, SourceDatabase, ESSENTIAL_CAPTURE_MARKER,
    ESSENTIAL_STATUS_MARKER,
};
use tsync_storage::{CommandRunner, ContentFetcher, RetryPolicy};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::notify::{CompletionSummary, Notifier, NotifyEvent, ProgressSnapshot};
use crate::pool::{BatchContext, EnrichmentPool};
use crate::report::{log_executive_summary, write_reports, RunReport, SourceReport, SourceStatus};
use crate::store::{ReplicaStore, Watermarks};
use crate::writer::{ReplicationWriter, WriteReport};

/// Rows removed per statement by [`cleanup_lock_errors`].
pub const LOCK_CLEANUP_BATCH: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Init,
    Discover,
    MapStores,
    LoadWatermarks,
    ProcessSources,
    Report,
    Done,
    Failed,
    Interrupted,
}

impl RunPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            RunPhase::Init => "init",
            RunPhase::Discover => "discover",
            RunPhase::MapStores => "map_stores",
            RunPhase::LoadWatermarks => "load_watermarks",
            RunPhase::ProcessSources => "process_sources",
            RunPhase::Report => "report",
            RunPhase::Done => "done",
            RunPhase::Failed => "failed",
            RunPhase::Interrupted => "interrupted",
        }
    }
}

/// A source is stale when it has no watermark or its mtime moved strictly forward.
pub fn needs_processing(path: &Path, modified: DateTime<Utc>, watermarks: &Watermarks) -> bool {
    match watermarks.get(path) {
        Some(mark) => modified > *mark,
        None => true,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Treat every source as stale and re-fetch content the replica already holds.
    pub force_refetch: bool,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub session_id: Uuid,
    pub status: RunStatus,
    pub metrics: RunMetrics,
    pub sources: Vec<SourceReport>,
    pub report_dir: Option<PathBuf>,
}

enum SourceRun {
    Finished(SourceReport),
    Interrupted(SourceReport),
}

pub struct Orchestrator {
    config: SyncConfig,
    store: Arc<dyn ReplicaStore>,
    locator: SourceLocator,
    fetcher: Arc<ContentFetcher>,
    pool: EnrichmentPool,
    writer: ReplicationWriter,
    notifier: Arc<dyn Notifier>,
    source_ip: String,
    interrupted: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn ReplicaStore>,
        runner: Arc<dyn CommandRunner>,
        notifier: Arc<dyn Notifier>,
        source_ip: impl Into<String>,
    ) -> Self {
        let fetcher = Arc::new(
            ContentFetcher::new(runner.clone(), config.fetch_timeout)
                .with_working_dir(config.script_dir.clone()),
        );
        Self {
            locator: SourceLocator::new(runner),
            pool: EnrichmentPool::new(fetcher.clone(), config.workers),
            fetcher,
            writer: ReplicationWriter::new(store.clone(), config.insert_chunk),
            config,
            store,
            notifier,
            source_ip: source_ip.into(),
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_locator(mut self, locator: SourceLocator) -> Self {
        self.locator = locator;
        self
    }

    pub fn with_policies(mut self, fetch: RetryPolicy, network: RetryPolicy) -> Self {
        self.pool =
            EnrichmentPool::new(self.fetcher.clone(), self.config.workers).with_fetch_policy(fetch);
        self.writer = ReplicationWriter::new(self.store.clone(), self.config.insert_chunk)
            .with_network_policy(network);
        self
    }

    /// Flag observed between batches; setting it stops the run after the current batch.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupted.clone()
    }

    /// Set the interrupt flag on Ctrl-C.
    pub fn install_ctrl_c(&self) {
        let flag = self.interrupted.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping after the current batch");
                flag.store(true, Ordering::SeqCst);
            }
        });
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Incremental sync of every stale source.
    pub async fn run(&self, options: RunOptions) -> Result<RunOutcome> {
        let span = info_span!("sync_run", source_ip = %self.source_ip, mode = "incremental");
        self.run_incremental(options).instrument(span).await
    }

    async fn run_incremental(&self, options: RunOptions) -> Result<RunOutcome> {
        let mut session = self.start_session().await?;
        let mut metrics = RunMetrics::new(session.started_at);
        let mut sources = Vec::new();

        let status = match self.run_phases(options, &mut metrics, &mut sources).await {
            Ok(status) => status,
            Err(err) => {
                error!(error = %format!("{err:#}"), "run failed");
                self.record_error(
                    &mut metrics,
                    ErrorKind::System,
                    format!("{err:#}"),
                    BTreeMap::new(),
                    false,
                )
                .await;
                RunStatus::Failed
            }
        };

        Ok(self
            .finish(&mut session, status, metrics, sources, "incremental")
            .await)
    }

    async fn start_session(&self) -> Result<RunSession> {
        debug!(phase = RunPhase::Init.as_str());
        self.store
            .ensure_schema()
            .await
            .context("ensuring replica schema")?;
        let session = RunSession::start(self.source_ip.clone());
        self.store
            .create_session(&session)
            .await
            .context("creating sync session")?;
        info!(session_id = %session.session_id, "sync session started");
        self.notifier
            .notify(NotifyEvent::RunStarted {
                session_id: session.session_id,
                source_ip: self.source_ip.clone(),
                scan_root: self.config.scan_root.display().to_string(),
            })
            .await;
        Ok(session)
    }

    async fn run_phases(
        &self,
        options: RunOptions,
        metrics: &mut RunMetrics,
        reports: &mut Vec<SourceReport>,
    ) -> Result<RunStatus> {
        debug!(phase = RunPhase::Discover.as_str(), root = %self.config.scan_root.display());
        let sources = discover(&self.config.scan_root)
            .with_context(|| format!("discovering sources under {}", self.config.scan_root.display()))?;
        metrics.databases_found = sources.len() as u64;
        info!(found = sources.len(), "sources discovered");

        debug!(phase = RunPhase::MapStores.as_str());
        let store_map = self.locator.build_store_map(&sources).await;
        let default_binary = self.locator.default_binary().await;

        debug!(phase = RunPhase::LoadWatermarks.as_str());
        let watermarks = self
            .store
            .load_watermarks()
            .await
            .context("loading source watermarks")?;

        let pending: Vec<&SourceDatabase> = sources
            .iter()
            .filter(|s| options.force_refetch || needs_processing(&s.path, s.modified, &watermarks))
            .collect();
        metrics.databases_skipped = (sources.len() - pending.len()) as u64;
        info!(
            pending = pending.len(),
            unchanged = metrics.databases_skipped,
            force_refetch = options.force_refetch,
            "sources selected"
        );

        debug!(phase = RunPhase::ProcessSources.as_str());
        let total = pending.len();
        for (index, source) in pending.into_iter().enumerate() {
            if self.is_interrupted() {
                return Ok(RunStatus::Interrupted);
            }
            let resolved = store_map.get(&source.path).cloned().unwrap_or_default();
            let binary = resolved.binary.clone().unwrap_or_else(|| default_binary.clone());
            let span = info_span!("source", node = %source.node_name, db_path = %source.path.display());

            let run = self
                .sync_source(source, &resolved, binary, options.force_refetch, metrics)
                .instrument(span.clone())
                .await;

            match run {
                Ok(SourceRun::Finished(report)) => {
                    self.settle_source(source, &report, metrics).instrument(span).await;
                    reports.push(report);
                }
                Ok(SourceRun::Interrupted(report)) => {
                    warn!(node = %source.node_name, "interrupted mid-source, watermark left unchanged");
                    reports.push(report);
                    return Ok(RunStatus::Interrupted);
                }
                Err(err) => {
                    let report = self
                        .source_failed(source, &resolved, err, metrics)
                        .instrument(span)
                        .await;
                    reports.push(report);
                }
            }

            let done = index + 1;
            if done % self.config.progress_every.max(1) == 0 || done == total {
                self.report_progress(done as u64, total as u64, metrics).await;
            }
        }

        debug!(phase = RunPhase::Report.as_str());
        Ok(if self.is_interrupted() {
            RunStatus::Interrupted
        } else {
            RunStatus::Completed
        })
    }

    async fn sync_source(
        &self,
        source: &SourceDatabase,
        resolved: &ResolvedPaths,
        binary: PathBuf,
        force: bool,
        metrics: &mut RunMetrics,
    ) -> Result<SourceRun> {
        let started = Instant::now();
        let mut report = SourceReport {
            db_path: source.path.clone(),
            node_name: source.node_name.clone(),
            status: SourceStatus::Synced,
            records: 0,
            batches_total: 0,
            batches_ok: 0,
            fetch_success: 0,
            fetch_failed: 0,
            fetch_skipped: 0,
            replica_errors: 0,
            validation_errors: 0,
            duration_secs: 0.0,
            error: None,
        };

        let Some(mut extractor) = TokenExtractor::open(&source.path).await? else {
            report.duration_secs = started.elapsed().as_secs_f64();
            return Ok(SourceRun::Finished(report));
        };
        let total_rows = extractor.count().await?;

        let already_fetched = if force {
            HashSet::new()
        } else {
            self.store
                .fetched_tokens(&self.source_ip, &source.node_name)
                .await
                .context("loading previously fetched tokens")?
        };
        let ctx = BatchContext {
            origin: RecordOrigin {
                source_ip: self.source_ip.clone(),
                node_name: source.node_name.clone(),
                db_path: source.path.clone(),
                store_path: resolved.store.clone(),
                db_modified: source.modified,
            },
            binary,
            already_fetched: Arc::new(already_fetched),
        };
        info!(
            rows = total_rows,
            store = %resolved.store.as_ref().map(|p| p.display().to_string()).unwrap_or_default(),
            already_fetched = ctx.already_fetched.len(),
            "processing source"
        );

        let pages = extractor.rows(self.config.batch_size);
        pin_mut!(pages);
        while let Some(page) = pages.next().await {
            let page = page?;
            let rows = page.len() as u64;
            let enriched = self.pool.enrich(page, &ctx).await;
            let written = self.writer.insert_batch(&enriched.records, force).await;

            report.batches_total += 1;
            if written.is_clean() {
                report.batches_ok += 1;
            }
            report.records += rows;
            report.fetch_success += enriched.stats.fetched;
            report.fetch_failed += enriched.stats.failed;
            report.fetch_skipped += enriched.stats.skipped;
            report.validation_errors += enriched.stats.validation_failures;
            report.replica_errors += written.failed;

            metrics.records_processed += rows;
            metrics.fetch_success += enriched.stats.fetched;
            metrics.fetch_failures += enriched.stats.failed;
            metrics.fetch_skipped += enriched.stats.skipped;
            metrics.validation_errors += enriched.stats.validation_failures;
            metrics.replica_inserts += written.written;
            metrics.replica_errors += written.failed;
            if !written.is_clean() {
                self.record_write_failures(source, &written, metrics).await;
            }

            let elapsed = started.elapsed().as_secs_f64();
            let rate = if elapsed > 0.0 { report.records as f64 / elapsed } else { 0.0 };
            let remaining = total_rows.saturating_sub(report.records);
            info!(
                batch = report.batches_total,
                rows,
                done = report.records,
                total = total_rows,
                fetched = enriched.stats.fetched,
                written = written.written,
                write_errors = written.failed,
                rows_per_sec = %format!("{rate:.1}"),
                eta_secs = if rate > 0.0 { (remaining as f64 / rate) as u64 } else { 0 },
                "batch done"
            );

            if self.is_interrupted() {
                report.duration_secs = started.elapsed().as_secs_f64();
                report.error = Some("interrupted".to_string());
                return Ok(SourceRun::Interrupted(report));
            }
        }

        report.duration_secs = started.elapsed().as_secs_f64();
        if report.batch_success_ratio() < self.config.min_batch_success {
            report.status = SourceStatus::BelowThreshold;
            report.error = Some(format!(
                "{}/{} batches written cleanly, below {:.0}%",
                report.batches_ok,
                report.batches_total,
                self.config.min_batch_success * 100.0
            ));
        }
        Ok(SourceRun::Finished(report))
    }

    /// Count the source and advance its watermark when it met the batch threshold.
    async fn settle_source(
        &self,
        source: &SourceDatabase,
        report: &SourceReport,
        metrics: &mut RunMetrics,
    ) {
        if report.status != SourceStatus::Synced {
            metrics.databases_failed += 1;
            let message = report.error.clone().unwrap_or_default();
            warn!(error = %message, "source below batch success threshold, will retry next run");
            self.record_error(metrics, ErrorKind::Source, message, source_context(source), false)
                .await;
            return;
        }

        metrics.databases_processed += 1;
        let record = ProcessedSourceRecord {
            db_path: source.path.clone(),
            last_modified: source.modified,
            last_processed: Utc::now(),
            record_count: report.records,
            fetch_success: report.fetch_success,
            fetch_failed: report.fetch_failed,
            validation_errors: report.validation_errors,
            processing_duration_secs: report.duration_secs,
        };
        match self.store.record_processed_source(&record).await {
            Ok(()) => info!(
                records = report.records,
                batches = report.batches_total,
                duration_secs = %format!("{:.1}", report.duration_secs),
                "source synced"
            ),
            Err(err) => {
                self.record_error(
                    metrics,
                    ErrorKind::Database,
                    format!("saving watermark: {err}"),
                    source_context(source),
                    false,
                )
                .await
            }
        }
    }

    async fn source_failed(
        &self,
        source: &SourceDatabase,
        resolved: &ResolvedPaths,
        err: anyhow::Error,
        metrics: &mut RunMetrics,
    ) -> SourceReport {
        let message = format!("{err:#}");
        error!(error = %message, "source failed, capturing essential metadata instead");
        metrics.databases_failed += 1;
        self.record_error(metrics, ErrorKind::Source, message.clone(), source_context(source), true)
            .await;

        let mut report = SourceReport {
            db_path: source.path.clone(),
            node_name: source.node_name.clone(),
            status: SourceStatus::Failed,
            records: 0,
            batches_total: 0,
            batches_ok: 0,
            fetch_success: 0,
            fetch_failed: 0,
            fetch_skipped: 0,
            replica_errors: 0,
            validation_errors: 0,
            duration_secs: 0.0,
            error: Some(message),
        };
        match self.capture_essential(source, resolved.store.clone()).await {
            Ok(written) => {
                report.status = SourceStatus::EssentialFallback;
                report.records = written.written;
                report.replica_errors = written.failed;
                metrics.replica_inserts += written.written;
                metrics.replica_errors += written.failed;
            }
            Err(err) => warn!(error = %format!("{err:#}"), "essential fallback failed"),
        }
        report
    }

    /// Merge only identifiers and provenance for one source. Stored content is never touched.
    async fn capture_essential(
        &self,
        source: &SourceDatabase,
        store_path: Option<PathBuf>,
    ) -> Result<WriteReport> {
        let mut total = WriteReport::default();
        let Some(mut extractor) = TokenExtractor::open(&source.path).await? else {
            return Ok(total);
        };
        let origin = RecordOrigin {
            source_ip: self.source_ip.clone(),
            node_name: source.node_name.clone(),
            db_path: source.path.clone(),
            store_path,
            db_modified: source.modified,
        };

        let batch = self.config.batch_size;
        let mut offset = 0;
        loop {
            let page = extractor.essential_page(offset, batch).await?;
            if page.is_empty() {
                break;
            }
            offset += page.len() as u64;
            let records: Vec<EnrichedRecord> = page
                .iter()
                .filter(|row| row.fetch_id().is_some())
                .map(|row| {
                    let mut record = EnrichedRecord::from_raw(row, &origin);
                    record.token_status = Column::value(ESSENTIAL_STATUS_MARKER.to_string());
                    record.fetch_error = Some(ESSENTIAL_CAPTURE_MARKER.to_string());
                    record
                })
                .collect();
            let written = self.writer.merge_essential(&records).await;
            total.written += written.written;
            total.failed += written.failed;
            total.failures.extend(written.failures);
        }
        extractor.close().await;
        info!(node = %source.node_name, merged = total.written, failed = total.failed, "essential capture done");
        Ok(total)
    }

    /// Essential capture for every discovered source; no fetches, no watermark changes.
    pub async fn run_essential_only(&self) -> Result<RunOutcome> {
        let span = info_span!("sync_run", source_ip = %self.source_ip, mode = "essential");
        self.run_essential().instrument(span).await
    }

    async fn run_essential(&self) -> Result<RunOutcome> {
        let mut session = self.start_session().await?;
        let mut metrics = RunMetrics::new(session.started_at);
        let mut reports = Vec::new();

        let sources = match discover(&self.config.scan_root) {
            Ok(sources) => sources,
            Err(err) => {
                self.record_error(
                    &mut metrics,
                    ErrorKind::System,
                    err.to_string(),
                    BTreeMap::new(),
                    false,
                )
                .await;
                return Ok(self
                    .finish(&mut session, RunStatus::Failed, metrics, reports, "essential")
                    .await);
            }
        };
        metrics.databases_found = sources.len() as u64;

        for source in &sources {
            if self.is_interrupted() {
                break;
            }
            let started = Instant::now();
            let store_path = self.locator.resolve_store(&source.path);
            let mut report = SourceReport {
                db_path: source.path.clone(),
                node_name: source.node_name.clone(),
                status: SourceStatus::EssentialFallback,
                records: 0,
                batches_total: 0,
                batches_ok: 0,
                fetch_success: 0,
                fetch_failed: 0,
                fetch_skipped: 0,
                replica_errors: 0,
                validation_errors: 0,
                duration_secs: 0.0,
                error: None,
            };
            match self
                .capture_essential(source, store_path)
                .instrument(info_span!("source", node = %source.node_name))
                .await
            {
                Ok(written) => {
                    metrics.databases_processed += 1;
                    metrics.records_processed += written.written + written.failed;
                    metrics.replica_inserts += written.written;
                    metrics.replica_errors += written.failed;
                    report.records = written.written;
                    report.replica_errors = written.failed;
                }
                Err(err) => {
                    metrics.databases_failed += 1;
                    report.status = SourceStatus::Failed;
                    report.error = Some(format!("{err:#}"));
                    self.record_error(
                        &mut metrics,
                        ErrorKind::Source,
                        format!("{err:#}"),
                        source_context(source),
                        true,
                    )
                    .await;
                }
            }
            report.duration_secs = started.elapsed().as_secs_f64();
            reports.push(report);
        }

        let status = if self.is_interrupted() {
            RunStatus::Interrupted
        } else if metrics.databases_processed > 0 {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        Ok(self
            .finish(&mut session, status, metrics, reports, "essential")
            .await)
    }

    async fn finish(
        &self,
        session: &mut RunSession,
        status: RunStatus,
        mut metrics: RunMetrics,
        sources: Vec<SourceReport>,
        mode: &'static str,
    ) -> RunOutcome {
        let terminal = match status {
            RunStatus::Failed => RunPhase::Failed,
            RunStatus::Interrupted => RunPhase::Interrupted,
            RunStatus::Running | RunStatus::Completed => RunPhase::Done,
        };
        debug!(phase = terminal.as_str(), status = status.as_str());
        metrics.finished_at = Some(Utc::now());
        session.finish(status, &metrics);
        if let Err(err) = self.store.finish_session(session).await {
            warn!(error = %err, "could not close sync session");
        }

        let report = RunReport {
            session: session.clone(),
            metrics,
            mode,
            sources,
        };
        let report_dir = match write_reports(&self.config.reports_dir, &report).await {
            Ok(dir) => {
                info!(dir = %dir.display(), "reports written");
                Some(dir)
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "could not write reports");
                None
            }
        };
        log_executive_summary(&report);

        let m = &report.metrics;
        self.notifier
            .notify(NotifyEvent::RunCompleted(CompletionSummary {
                session_id: session.session_id,
                status,
                databases_found: m.databases_found,
                databases_processed: m.databases_processed,
                databases_failed: m.databases_failed,
                records_processed: m.records_processed,
                fetch_success_rate: m.fetch_success_rate(),
                write_success_rate: m.write_success_rate(),
                elapsed_secs: m.elapsed_secs(),
            }))
            .await;

        RunOutcome {
            session_id: session.session_id,
            status,
            metrics: report.metrics,
            sources: report.sources,
            report_dir,
        }
    }

    async fn report_progress(&self, done: u64, total: u64, metrics: &RunMetrics) {
        let rate = metrics.records_per_sec();
        let elapsed = metrics.elapsed_secs();
        let eta_secs = (done > 0 && done < total)
            .then(|| ((elapsed / done as f64) * (total - done) as f64) as u64);
        info!(
            sources_done = done,
            sources_total = total,
            records = metrics.records_processed,
            records_per_sec = %format!("{rate:.1}"),
            eta_secs = eta_secs.unwrap_or(0),
            "progress"
        );
        self.notifier
            .notify(NotifyEvent::Progress(ProgressSnapshot {
                sources_done: done,
                sources_total: total,
                records: metrics.records_processed,
                fetch_success: metrics.fetch_success,
                fetch_failures: metrics.fetch_failures,
                records_per_sec: rate,
                eta_secs,
            }))
            .await;
    }

    async fn record_write_failures(
        &self,
        source: &SourceDatabase,
        written: &WriteReport,
        metrics: &mut RunMetrics,
    ) {
        let first = written
            .failures
            .first()
            .map(|f| format!("{} ({})", f.message, f.token_id))
            .unwrap_or_default();
        let mut context = source_context(source);
        context.insert("rows".to_string(), written.failed.to_string());
        self.record_error(
            metrics,
            ErrorKind::Database,
            format!("{} rows rejected by replica: {first}", written.failed),
            context,
            false,
        )
        .await;
    }

    async fn record_error(
        &self,
        metrics: &mut RunMetrics,
        kind: ErrorKind,
        message: String,
        context: BTreeMap<String, String>,
        always_notify: bool,
    ) {
        let entry = metrics.record_error(kind, message, context);
        if always_notify || kind.is_notifiable() {
            let event = NotifyEvent::Error {
                kind,
                message: entry.message.clone(),
                context: entry.context.clone(),
            };
            self.notifier.notify(event).await;
        }
    }

    /// Close the replica pool and deliver queued notifications.
    pub async fn shutdown(&self) {
        self.notifier.flush().await;
        self.store.close().await;
    }
}

fn source_context(source: &SourceDatabase) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("db_path".to_string(), source.path.display().to_string()),
        ("node".to_string(), source.node_name.clone()),
    ])
}

/// Delete every token record and watermark after `confirm` accepts the row count.
/// `Ok(None)` means the operator declined.
pub async fn clear_replica(
    store: &dyn ReplicaStore,
    confirm: impl FnOnce(u64) -> bool,
) -> Result<Option<u64>> {
    let count = store.count_records().await.context("counting token records")?;
    if count == 0 {
        // Still drop stale watermarks so the next run re-reads every source.
        store.clear_records().await.context("clearing watermarks")?;
        info!("replica already empty");
        return Ok(Some(0));
    }
    if !confirm(count) {
        warn!(records = count, "clear declined");
        return Ok(None);
    }
    let deleted = store.clear_records().await.context("clearing token records")?;
    info!(deleted, "replica cleared");
    Ok(Some(deleted))
}

/// Remove rows whose fetch failed on store-lock contention so the next run retries them.
pub async fn cleanup_lock_errors(
    store: &dyn ReplicaStore,
    batch: u64,
    confirm: impl FnOnce(u64) -> bool,
) -> Result<Option<u64>> {
    let count = store
        .count_lock_errors()
        .await
        .context("counting lock-error records")?;
    if count == 0 {
        info!("no lock-error records");
        return Ok(Some(0));
    }
    if !confirm(count) {
        warn!(records = count, "lock cleanup declined");
        return Ok(None);
    }

    let started = Instant::now();
    let mut deleted = 0u64;
    loop {
        let n = store
            .delete_lock_errors(batch.max(1))
            .await
            .context("deleting lock-error records")?;
        if n == 0 {
            break;
        }
        deleted += n;
        let elapsed = started.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 { deleted as f64 / elapsed } else { 0.0 };
        let remaining = count.saturating_sub(deleted);
        info!(
            deleted,
            total = count,
            rows_per_sec = %format!("{rate:.0}"),
            eta_secs = if rate > 0.0 { (remaining as f64 / rate) as u64 } else { 0 },
            "lock cleanup progress"
        );
    }
    if deleted < count {
        return Err(anyhow!("removed {deleted} of {count} lock-error records"));
    }
    Ok(Some(deleted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryReplicaStore, ReplicaRow};
    use chrono::TimeZone;

    #[test]
    fn staleness_is_strictly_greater() {
        let path = PathBuf::from("/n/a/Rubix/rubix.db");
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).single().expect("ts");
        let t1 = Utc.timestamp_opt(1_700_000_001, 0).single().expect("ts");
        let mut marks = Watermarks::new();
        assert!(needs_processing(&path, t0, &marks));
        marks.insert(path.clone(), t0);
        assert!(!needs_processing(&path, t0, &marks));
        assert!(needs_processing(&path, t1, &marks));
        marks.insert(path.clone(), t1);
        assert!(!needs_processing(&path, t0, &marks));
    }

    fn lock_row(token: &str, error: Option<&str>) -> ReplicaRow {
        ReplicaRow {
            source_ip: "10.0.0.1".into(),
            node_name: "node1".into(),
            did: None,
            token_id: token.into(),
            created_at: None,
            updated_at: None,
            token_status: None,
            parent_token_id: None,
            token_value: None,
            content: None,
            content_fetched: false,
            fetch_error: error.map(str::to_string),
            db_path: "/n/node1/Rubix/rubix.db".into(),
            store_path: None,
            db_last_modified: None,
            synced_at: Utc::now(),
            validation_errors: None,
            missing_columns: None,
        }
    }

    #[tokio::test]
    async fn clear_respects_confirmation() {
        let store = MemoryReplicaStore::new();
        store.insert_row(lock_row("a", None));
        store.insert_row(lock_row("b", None));

        let declined = clear_replica(&store, |_| false).await.expect("clear");
        assert_eq!(declined, None);
        assert_eq!(store.count_records().await.expect("count"), 2);

        let mut seen = 0;
        let cleared = clear_replica(&store, |n| {
            seen = n;
            true
        })
        .await
        .expect("clear");
        assert_eq!((seen, cleared), (2, Some(2)));
        assert_eq!(store.count_records().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn lock_cleanup_deletes_only_lock_rows_in_batches() {
        let store = MemoryReplicaStore::new();
        for i in 0..7 {
            store.insert_row(lock_row(&format!("l{i}"), Some("Error: lock /s/.ipfs/repo.lock: someone else has the lock")));
        }
        store.insert_row(lock_row("other", Some("merkledag: not found")));
        store.insert_row(lock_row("clean", None));

        let removed = cleanup_lock_errors(&store, 3, |n| n == 7)
            .await
            .expect("cleanup");
        assert_eq!(removed, Some(7));
        assert_eq!(store.count_records().await.expect("count"), 2);
        assert_eq!(
            cleanup_lock_errors(&store, 3, |_| panic!("nothing to confirm"))
                .await
                .expect("cleanup"),
            Some(0)
        );
    }
}
