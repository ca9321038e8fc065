//! Core domain model for the token sync pipeline.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod coerce;
mod validate;

pub use coerce::{parse_timestamp, safe_str, safe_timestamp};
pub use validate::{validate, Validation, KNOWN_STATUSES};

pub const CRATE_NAME: &str = "tsync-core";

/// Text stored for a column the source schema does not have at all.
pub const NOT_FOUND_SENTINEL: &str = "c not found";

/// `fetch_error` value written by the essential capture path.
pub const ESSENTIAL_CAPTURE_MARKER: &str = "essential_capture_only";

/// `token_status` value written by the essential capture path.
pub const ESSENTIAL_STATUS_MARKER: &str = "essential_only";

/// Columns read from `TokensTable`, in projection order.
pub const EXPECTED_COLUMNS: [&str; 7] = [
    "did",
    "token_id",
    "created_at",
    "updated_at",
    "token_status",
    "parent_token_id",
    "token_value",
];

/// Numeric token states that are worth replicating.
pub const STATUS_ALLOWLIST: [i64; 12] = [0, 1, 2, 3, 5, 9, 12, 13, 14, 15, 16, 17];

/// Upper bound on the error entries kept in [`RunMetrics`].
pub const MAX_ERROR_LOG: usize = 1000;

/// A column value that distinguishes "the column is missing from the source schema"
/// from "the column exists and this row holds NULL".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Column<T> {
    Present(Option<T>),
    AbsentInSchema,
}

impl<T> Default for Column<T> {
    fn default() -> Self {
        Column::Present(None)
    }
}

impl<T> Column<T> {
    pub fn value(value: T) -> Self {
        Column::Present(Some(value))
    }

    pub fn null() -> Self {
        Column::Present(None)
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Column::AbsentInSchema)
    }

    pub fn as_present(&self) -> Option<&T> {
        match self {
            Column::Present(Some(v)) => Some(v),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Column<U> {
        match self {
            Column::Present(v) => Column::Present(v.map(f)),
            Column::AbsentInSchema => Column::AbsentInSchema,
        }
    }
}

impl Column<String> {
    /// Storage-boundary text: the sentinel for an absent column, SQL NULL for a null value.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Column::Present(v) => v.clone(),
            Column::AbsentInSchema => Some(NOT_FOUND_SENTINEL.to_string()),
        }
    }

    /// Text as seen by validation and logging, sentinel included.
    pub fn text(&self) -> Option<&str> {
        match self {
            Column::Present(v) => v.as_deref(),
            Column::AbsentInSchema => Some(NOT_FOUND_SENTINEL),
        }
    }
}

impl<T: Copy> Column<T> {
    /// Value for a typed storage column; absent columns are reported via `missing_columns`.
    pub fn to_option(&self) -> Option<T> {
        match self {
            Column::Present(v) => *v,
            Column::AbsentInSchema => None,
        }
    }
}

/// A discovered SQLite source database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDatabase {
    pub path: PathBuf,
    pub modified: DateTime<Utc>,
    pub node_name: String,
}

impl SourceDatabase {
    pub fn new(path: PathBuf, modified: DateTime<Utc>) -> Self {
        let node_name = node_name_for(&path);
        Self {
            path,
            modified: truncate_to_millis(modified),
            node_name,
        }
    }
}

/// Name of the directory two levels above the database file.
pub fn node_name_for(db_path: &Path) -> String {
    db_path
        .parent()
        .and_then(Path::parent)
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Millisecond precision survives every replica timestamp column, so watermarks compare exactly.
pub fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(TimeDelta::milliseconds(1)).unwrap_or(ts)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPaths {
    pub store: Option<PathBuf>,
    pub binary: Option<PathBuf>,
    /// The binary sat next to a `rubixgoplatform` executable.
    pub binary_beside_platform: bool,
}

/// Database path -> resolved store and binary, built once per run.
pub type StoreMap = BTreeMap<PathBuf, ResolvedPaths>;

/// One row as read from `TokensTable`, before coercion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRow {
    pub did: Column<String>,
    pub token_id: Column<String>,
    pub created_at: Column<String>,
    pub updated_at: Column<String>,
    pub token_status: Column<String>,
    pub parent_token_id: Column<String>,
    pub token_value: Column<String>,
}

impl RawRow {
    pub fn missing_columns(&self) -> Vec<String> {
        let cols = [
            ("did", self.did.is_absent()),
            ("token_id", self.token_id.is_absent()),
            ("created_at", self.created_at.is_absent()),
            ("updated_at", self.updated_at.is_absent()),
            ("token_status", self.token_status.is_absent()),
            ("parent_token_id", self.parent_token_id.is_absent()),
            ("token_value", self.token_value.is_absent()),
        ];
        cols.into_iter()
            .filter(|(_, absent)| *absent)
            .map(|(name, _)| name.to_string())
            .collect()
    }

    /// Usable fetch identifier, if any.
    pub fn fetch_id(&self) -> Option<&str> {
        match &self.token_id {
            Column::Present(Some(id)) if !id.trim().is_empty() => Some(id.trim()),
            _ => None,
        }
    }
}

/// A row merged with its fetched content and provenance, ready for replication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub source_ip: String,
    pub node_name: String,
    pub did: Column<String>,
    pub token_id: Column<String>,
    pub created_at: Column<DateTime<Utc>>,
    pub updated_at: Column<DateTime<Utc>>,
    pub token_status: Column<String>,
    pub parent_token_id: Column<String>,
    pub token_value: Column<String>,
    pub content: Option<String>,
    pub content_fetched: bool,
    pub fetch_error: Option<String>,
    pub db_path: PathBuf,
    pub store_path: Option<PathBuf>,
    pub db_modified: DateTime<Utc>,
    pub validation_errors: Vec<String>,
    pub missing_columns: Vec<String>,
}

/// Provenance shared by every record produced from one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOrigin {
    pub source_ip: String,
    pub node_name: String,
    pub db_path: PathBuf,
    pub store_path: Option<PathBuf>,
    pub db_modified: DateTime<Utc>,
}

impl EnrichedRecord {
    /// Coerce a raw row; content fields start empty.
    pub fn from_raw(row: &RawRow, origin: &RecordOrigin) -> Self {
        Self {
            source_ip: origin.source_ip.clone(),
            node_name: origin.node_name.clone(),
            did: safe_str(&row.did),
            token_id: safe_str(&row.token_id),
            created_at: safe_timestamp(&row.created_at),
            updated_at: safe_timestamp(&row.updated_at),
            token_status: safe_str(&row.token_status),
            parent_token_id: safe_str(&row.parent_token_id),
            token_value: safe_str(&row.token_value),
            content: None,
            content_fetched: false,
            fetch_error: None,
            db_path: origin.db_path.clone(),
            store_path: origin.store_path.clone(),
            db_modified: origin.db_modified,
            validation_errors: Vec::new(),
            missing_columns: row.missing_columns(),
        }
    }

    /// Value of the `token_id` key column. Missing ids collapse to the empty string.
    pub fn token_key(&self) -> String {
        self.token_id.to_text().unwrap_or_default()
    }

    pub fn replica_key(&self) -> (String, String, String) {
        (
            self.source_ip.clone(),
            self.node_name.clone(),
            self.token_key(),
        )
    }
}

/// Per-source watermark row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedSourceRecord {
    pub db_path: PathBuf,
    pub last_modified: DateTime<Utc>,
    pub last_processed: DateTime<Utc>,
    pub record_count: u64,
    pub fetch_success: u64,
    pub fetch_failed: u64,
    pub validation_errors: u64,
    pub processing_duration_secs: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Interrupted => "INTERRUPTED",
            RunStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "RUNNING" => Some(RunStatus::Running),
            "COMPLETED" => Some(RunStatus::Completed),
            "INTERRUPTED" => Some(RunStatus::Interrupted),
            "FAILED" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSession {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub source_ip: String,
    pub databases_found: u64,
    pub databases_processed: u64,
    pub records_processed: u64,
    pub fetch_success: u64,
    pub fetch_failures: u64,
    pub replica_inserts: u64,
    pub replica_errors: u64,
    pub validation_errors: u64,
    pub status: RunStatus,
    pub error_summary: Option<String>,
}

impl RunSession {
    pub fn start(source_ip: impl Into<String>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            started_at: truncate_to_millis(Utc::now()),
            ended_at: None,
            source_ip: source_ip.into(),
            databases_found: 0,
            databases_processed: 0,
            records_processed: 0,
            fetch_success: 0,
            fetch_failures: 0,
            replica_inserts: 0,
            replica_errors: 0,
            validation_errors: 0,
            status: RunStatus::Running,
            error_summary: None,
        }
    }

    /// Copy the aggregate counters from `metrics` and close the session.
    pub fn finish(&mut self, status: RunStatus, metrics: &RunMetrics) {
        self.ended_at = Some(truncate_to_millis(Utc::now()));
        self.status = status;
        self.databases_found = metrics.databases_found;
        self.databases_processed = metrics.databases_processed;
        self.records_processed = metrics.records_processed;
        self.fetch_success = metrics.fetch_success;
        self.fetch_failures = metrics.fetch_failures;
        self.replica_inserts = metrics.replica_inserts;
        self.replica_errors = metrics.replica_errors;
        self.validation_errors = metrics.validation_errors;
        self.error_summary = metrics.error_summary(10, 4000);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Database,
    Connection,
    System,
    Source,
    Fetch,
    Validation,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Database => "database",
            ErrorKind::Connection => "connection",
            ErrorKind::System => "system",
            ErrorKind::Source => "source",
            ErrorKind::Fetch => "fetch",
            ErrorKind::Validation => "validation",
        }
    }

    /// Kinds forwarded to the notifier as they happen.
    pub fn is_notifiable(self) -> bool {
        matches!(
            self,
            ErrorKind::Database | ErrorKind::Connection | ErrorKind::System
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub at: DateTime<Utc>,
    pub kind: ErrorKind,
    pub message: String,
    pub context: BTreeMap<String, String>,
}

/// Run-wide counters plus a bounded error log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub databases_found: u64,
    pub databases_processed: u64,
    pub databases_failed: u64,
    pub databases_skipped: u64,
    pub records_processed: u64,
    pub fetch_success: u64,
    pub fetch_failures: u64,
    pub fetch_skipped: u64,
    pub replica_inserts: u64,
    pub replica_errors: u64,
    pub validation_errors: u64,
    pub errors: Vec<ErrorEntry>,
    pub errors_dropped: u64,
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl RunMetrics {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: None,
            databases_found: 0,
            databases_processed: 0,
            databases_failed: 0,
            databases_skipped: 0,
            records_processed: 0,
            fetch_success: 0,
            fetch_failures: 0,
            fetch_skipped: 0,
            replica_inserts: 0,
            replica_errors: 0,
            validation_errors: 0,
            errors: Vec::new(),
            errors_dropped: 0,
        }
    }

    /// Append an error; once [`MAX_ERROR_LOG`] entries are held the oldest is evicted.
    pub fn record_error(
        &mut self,
        kind: ErrorKind,
        message: impl Into<String>,
        context: BTreeMap<String, String>,
    ) -> &ErrorEntry {
        if self.errors.len() >= MAX_ERROR_LOG {
            self.errors.remove(0);
            self.errors_dropped += 1;
        }
        self.errors.push(ErrorEntry {
            at: Utc::now(),
            kind,
            message: message.into(),
            context,
        });
        &self.errors[self.errors.len() - 1]
    }

    pub fn elapsed_secs(&self) -> f64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        ((end - self.started_at).num_milliseconds().max(0) as f64) / 1000.0
    }

    pub fn records_per_sec(&self) -> f64 {
        let secs = self.elapsed_secs();
        if secs > 0.0 {
            self.records_processed as f64 / secs
        } else {
            0.0
        }
    }

    pub fn fetch_success_rate(&self) -> f64 {
        percentage(self.fetch_success, self.fetch_success + self.fetch_failures)
    }

    pub fn write_success_rate(&self) -> f64 {
        percentage(self.replica_inserts, self.replica_inserts + self.replica_errors)
    }

    /// JSON list of the last `last_n` errors, cut to `max_chars`.
    pub fn error_summary(&self, last_n: usize, max_chars: usize) -> Option<String> {
        if self.errors.is_empty() {
            return None;
        }
        let start = self.errors.len().saturating_sub(last_n);
        let tail: Vec<_> = self.errors[start..]
            .iter()
            .map(|e| {
                serde_json::json!({
                    "at": e.at.to_rfc3339(),
                    "kind": e.kind.as_str(),
                    "message": e.message,
                })
            })
            .collect();
        let text = serde_json::Value::Array(tail).to_string();
        Some(text.chars().take(max_chars).collect())
    }
}

fn percentage(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (part as f64 / total as f64) * 100.0
    }
}
