use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::fs;
use tracing::info;
use tsync_core::{RunMetrics, RunSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Synced,
    BelowThreshold,
    EssentialFallback,
    Failed,
}

/// What happened to one source database during the run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceReport {
    pub db_path: PathBuf,
    pub node_name: String,
    pub status: SourceStatus,
    pub records: u64,
    pub batches_total: u64,
    pub batches_ok: u64,
    pub fetch_success: u64,
    pub fetch_failed: u64,
    pub fetch_skipped: u64,
    pub replica_errors: u64,
    pub validation_errors: u64,
    pub duration_secs: f64,
    pub error: Option<String>,
}

impl SourceReport {
    pub fn batch_success_ratio(&self) -> f64 {
        if self.batches_total == 0 {
            1.0
        } else {
            self.batches_ok as f64 / self.batches_total as f64
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub session: RunSession,
    pub metrics: RunMetrics,
    pub mode: &'static str,
    pub sources: Vec<SourceReport>,
}

/// Write `run_summary.json` and `summary.md` under `<reports_dir>/<session_id>/`.
pub async fn write_reports(reports_dir: &Path, report: &RunReport) -> Result<PathBuf> {
    let dir = reports_dir.join(report.session.session_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing run summary")?;
    fs::write(dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;

    fs::write(dir.join("summary.md"), render_markdown(report))
        .await
        .context("writing summary.md")?;

    Ok(dir)
}

fn render_markdown(report: &RunReport) -> String {
    let m = &report.metrics;
    let s = &report.session;
    let mut out = format!(
        "# Token Sync Run\n\n- Session: `{}`\n- Mode: {}\n- Status: {}\n- Source IP: {}\n- Started: {}\n- Finished: {}\n- Elapsed: {:.1}s\n\n\
         ## Totals\n- Databases: {} found, {} processed, {} failed, {} unchanged\n- Records: {} ({:.1}/s)\n\
         - Fetch: {} ok, {} failed, {} skipped ({:.1}% success)\n- Replica: {} written, {} errors ({:.1}% success)\n\
         - Validation errors: {}\n",
        s.session_id,
        report.mode,
        s.status.as_str(),
        s.source_ip,
        s.started_at,
        s.ended_at
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string()),
        m.elapsed_secs(),
        m.databases_found,
        m.databases_processed,
        m.databases_failed,
        m.databases_skipped,
        m.records_processed,
        m.records_per_sec(),
        m.fetch_success,
        m.fetch_failures,
        m.fetch_skipped,
        m.fetch_success_rate(),
        m.replica_inserts,
        m.replica_errors,
        m.write_success_rate(),
        m.validation_errors,
    );

    if !report.sources.is_empty() {
        out.push_str("\n## Sources\n| node | status | records | batches | fetch ok | fetch failed | seconds |\n|---|---|---|---|---|---|---|\n");
        for src in &report.sources {
            out.push_str(&format!(
                "| {} | {:?} | {} | {}/{} | {} | {} | {:.1} |\n",
                src.node_name,
                src.status,
                src.records,
                src.batches_ok,
                src.batches_total,
                src.fetch_success,
                src.fetch_failed,
                src.duration_secs
            ));
        }
    }

    if !m.errors.is_empty() {
        out.push_str("\n## Recent Errors\n");
        let start = m.errors.len().saturating_sub(10);
        for e in &m.errors[start..] {
            out.push_str(&format!("- {} [{}] {}\n", e.at, e.kind.as_str(), e.message));
        }
        if m.errors_dropped > 0 {
            out.push_str(&format!("- ({} older errors dropped)\n", m.errors_dropped));
        }
    }
    out
}

pub fn log_executive_summary(report: &RunReport) {
    let m = &report.metrics;
    info!(
        session_id = %report.session.session_id,
        status = report.session.status.as_str(),
        mode = report.mode,
        databases_found = m.databases_found,
        databases_processed = m.databases_processed,
        databases_failed = m.databases_failed,
        databases_unchanged = m.databases_skipped,
        records = m.records_processed,
        records_per_sec = %format!("{:.1}", m.records_per_sec()),
        fetch_success_pct = %format!("{:.1}", m.fetch_success_rate()),
        write_success_pct = %format!("{:.1}", m.write_success_rate()),
        validation_errors = m.validation_errors,
        errors_logged = m.errors.len(),
        elapsed_secs = %format!("{:.1}", m.elapsed_secs()),
        "run summary"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tsync_core::{ErrorKind, RunStatus};

    #[tokio::test]
    async fn writes_json_and_markdown_under_session_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut metrics = RunMetrics::default();
        metrics.databases_found = 2;
        metrics.databases_processed = 1;
        metrics.record_error(ErrorKind::Source, "TokensTable missing", BTreeMap::new());
        let mut session = RunSession::start("10.0.0.1");
        session.finish(RunStatus::Completed, &metrics);
        let report = RunReport {
            session: session.clone(),
            metrics,
            mode: "incremental",
            sources: vec![SourceReport {
                db_path: PathBuf::from("/n/node1/Rubix/rubix.db"),
                node_name: "node1".into(),
                status: SourceStatus::Synced,
                records: 3,
                batches_total: 1,
                batches_ok: 1,
                fetch_success: 3,
                fetch_failed: 0,
                fetch_skipped: 0,
                replica_errors: 0,
                validation_errors: 0,
                duration_secs: 0.2,
                error: None,
            }],
        };

        let out = write_reports(dir.path(), &report).await.expect("reports");
        assert_eq!(out, dir.path().join(session.session_id.to_string()));

        let json: serde_json::Value = serde_json::from_slice(
            &std::fs::read(out.join("run_summary.json")).expect("json file"),
        )
        .expect("json");
        assert_eq!(json["session"]["status"], "COMPLETED");
        assert_eq!(json["sources"][0]["status"], "synced");

        let md = std::fs::read_to_string(out.join("summary.md")).expect("md");
        assert!(md.contains("| node1 | Synced | 3 | 1/1 |"));
        assert!(md.contains("TokensTable missing"));
    }

    #[test]
    fn empty_source_counts_as_full_success() {
        let src = SourceReport {
            db_path: PathBuf::new(),
            node_name: String::new(),
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
        assert_eq!(src.batch_success_ratio(), 1.0);
    }
}
