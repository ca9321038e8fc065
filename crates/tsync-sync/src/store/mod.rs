//! Replica store contract, row conversion and conflict rules.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tsync_core::{EnrichedRecord, ProcessedSourceRecord, RunSession, ESSENTIAL_CAPTURE_MARKER};

mod memory;
mod postgres;

pub use memory::MemoryReplicaStore;
pub use postgres::PgReplicaStore;

/// Last processed modification time per source database.
pub type Watermarks = HashMap<PathBuf, DateTime<Utc>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("value too long for {column}: {len} > {max}")]
    ValueTooLong {
        column: &'static str,
        len: usize,
        max: usize,
    },
    #[error("replica unavailable: {0}")]
    Unavailable(String),
    #[error("duplicate key in one statement: {0}")]
    DuplicateKey(String),
}

impl StoreError {
    /// Network-class failures worth retrying on a fresh connection.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Sqlx(err) => is_transient_sqlx(err),
            StoreError::Unavailable(_) => true,
            StoreError::ValueTooLong { .. } | StoreError::DuplicateKey(_) => false,
        }
    }
}

pub fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db.code().is_some_and(|code| {
            code.starts_with("08") || code.starts_with("57P0") || code == "40001" || code == "40P01"
        }),
        _ => false,
    }
}

/// A record flattened into the replica's column types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaRow {
    pub source_ip: String,
    pub node_name: String,
    pub did: Option<String>,
    pub token_id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub token_status: Option<String>,
    pub parent_token_id: Option<String>,
    pub token_value: Option<String>,
    pub content: Option<String>,
    pub content_fetched: bool,
    pub fetch_error: Option<String>,
    pub db_path: String,
    pub store_path: Option<String>,
    pub db_last_modified: Option<DateTime<Utc>>,
    pub synced_at: DateTime<Utc>,
    pub validation_errors: Option<String>,
    pub missing_columns: Option<String>,
}

impl From<&EnrichedRecord> for ReplicaRow {
    fn from(record: &EnrichedRecord) -> Self {
        Self {
            source_ip: record.source_ip.clone(),
            node_name: record.node_name.clone(),
            did: record.did.to_text(),
            token_id: record.token_key(),
            created_at: record.created_at.to_option(),
            updated_at: record.updated_at.to_option(),
            token_status: record.token_status.to_text(),
            parent_token_id: record.parent_token_id.to_text(),
            token_value: record.token_value.to_text(),
            content: record.content.clone(),
            content_fetched: record.content_fetched,
            fetch_error: record.fetch_error.clone(),
            db_path: record.db_path.display().to_string(),
            store_path: record.store_path.as_ref().map(|p| p.display().to_string()),
            db_last_modified: Some(record.db_modified),
            synced_at: Utc::now(),
            validation_errors: json_list(&record.validation_errors),
            missing_columns: json_list(&record.missing_columns),
        }
    }
}

fn json_list(items: &[String]) -> Option<String> {
    if items.is_empty() {
        None
    } else {
        serde_json::to_string(items).ok()
    }
}

impl ReplicaRow {
    pub fn key(&self) -> (String, String, String) {
        (
            self.source_ip.clone(),
            self.node_name.clone(),
            self.token_id.clone(),
        )
    }
}

fn non_empty(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.is_empty())
}

/// Conflict rule for the bulk path: the incoming row wins, except that stored fetched
/// content survives an incoming row without a successful fetch unless `force` is set.
pub fn merge_full_row(existing: &ReplicaRow, incoming: &ReplicaRow, force: bool) -> ReplicaRow {
    let mut merged = incoming.clone();
    let take_content = force || incoming.content_fetched || !existing.content_fetched;
    if !take_content {
        merged.content = existing.content.clone();
        merged.content_fetched = existing.content_fetched;
        merged.fetch_error = existing.fetch_error.clone();
    }
    merged
}

/// Conflict rule for the essential path. Content only fills gaps; metadata is held
/// steady once the stored row reflects a successful fetch.
pub fn merge_essential_row(existing: &ReplicaRow, incoming: &ReplicaRow) -> ReplicaRow {
    let mut merged = existing.clone();

    merged.content = if non_empty(&existing.content) {
        existing.content.clone()
    } else if non_empty(&incoming.content) {
        incoming.content.clone()
    } else {
        existing.content.clone()
    };

    merged.content_fetched = existing.content_fetched || incoming.content_fetched;

    merged.fetch_error = if existing.content_fetched {
        existing.fetch_error.clone()
    } else if incoming.content_fetched {
        incoming.fetch_error.clone()
    } else if existing
        .fetch_error
        .as_deref()
        .is_some_and(|e| !e.is_empty() && e != ESSENTIAL_CAPTURE_MARKER)
    {
        existing.fetch_error.clone()
    } else {
        incoming.fetch_error.clone()
    };

    merged.did = incoming.did.clone().or_else(|| existing.did.clone());
    merged.db_path = incoming.db_path.clone();

    if !existing.content_fetched {
        merged.token_status = incoming
            .token_status
            .clone()
            .or_else(|| existing.token_status.clone());
        merged.db_last_modified = incoming.db_last_modified.or(existing.db_last_modified);
    }

    merged.synced_at = incoming.synced_at;
    merged
}

/// A row the store rejected, keyed by its token id.
#[derive(Debug)]
pub struct RowError {
    pub token_id: String,
    pub error: StoreError,
}

#[derive(Debug, Default)]
pub struct MergeReport {
    pub merged: u64,
    pub errors: Vec<RowError>,
}

#[async_trait]
pub trait ReplicaStore: Send + Sync {
    /// Create tables and indexes if they are missing.
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    /// Upsert `rows` in one transaction; all rows commit or none do.
    async fn upsert_chunk(&self, rows: &[ReplicaRow], force: bool) -> Result<u64, StoreError>;

    async fn upsert_one(&self, row: &ReplicaRow, force: bool) -> Result<(), StoreError>;

    /// Per-row essential merge, committed once for the whole chunk. Row failures are
    /// reported individually and do not abort the others.
    async fn merge_essential_chunk(&self, rows: &[ReplicaRow]) -> Result<MergeReport, StoreError>;

    async fn load_watermarks(&self) -> Result<Watermarks, StoreError>;

    async fn record_processed_source(&self, record: &ProcessedSourceRecord) -> Result<(), StoreError>;

    /// Token ids already holding fetched content for one node.
    async fn fetched_tokens(&self, source_ip: &str, node_name: &str)
        -> Result<HashSet<String>, StoreError>;

    async fn create_session(&self, session: &RunSession) -> Result<(), StoreError>;

    async fn finish_session(&self, session: &RunSession) -> Result<(), StoreError>;

    async fn count_records(&self) -> Result<u64, StoreError>;

    /// Delete every token record and watermark.
    async fn clear_records(&self) -> Result<u64, StoreError>;

    async fn count_lock_errors(&self) -> Result<u64, StoreError>;

    /// Delete up to `limit` rows whose fetch error mentions lock contention.
    async fn delete_lock_errors(&self, limit: u64) -> Result<u64, StoreError>;

    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(token: &str) -> ReplicaRow {
        ReplicaRow {
            source_ip: "10.0.0.1".into(),
            node_name: "node1".into(),
            did: Some("did:old".into()),
            token_id: token.into(),
            created_at: None,
            updated_at: None,
            token_status: Some("1".into()),
            parent_token_id: None,
            token_value: None,
            content: None,
            content_fetched: false,
            fetch_error: Some("timeout".into()),
            db_path: "/n/node1/Rubix/rubix.db".into(),
            store_path: None,
            db_last_modified: None,
            synced_at: Utc::now(),
            validation_errors: None,
            missing_columns: None,
        }
    }

    fn fetched(token: &str, content: &str) -> ReplicaRow {
        ReplicaRow {
            content: Some(content.into()),
            content_fetched: true,
            fetch_error: None,
            ..row(token)
        }
    }

    #[test]
    fn bulk_merge_keeps_fetched_content_against_failed_fetch() {
        let existing = fetched("Qm1", "payload");
        let incoming = row("Qm1");
        let merged = merge_full_row(&existing, &incoming, false);
        assert_eq!(merged.content.as_deref(), Some("payload"));
        assert!(merged.content_fetched);
        assert_eq!(merged.fetch_error, None);

        let forced = merge_full_row(&existing, &incoming, true);
        assert_eq!(forced.content, None);
        assert!(!forced.content_fetched);
    }

    #[test]
    fn bulk_merge_takes_new_success() {
        let merged = merge_full_row(&fetched("Qm1", "old"), &fetched("Qm1", "new"), false);
        assert_eq!(merged.content.as_deref(), Some("new"));
    }

    #[test]
    fn essential_merge_never_clobbers_content() {
        let existing = ReplicaRow {
            token_status: Some("ACTIVE".into()),
            ..fetched("Qm1", "payload")
        };
        let incoming = ReplicaRow {
            did: Some("did:new".into()),
            token_status: Some("essential_only".into()),
            fetch_error: Some(ESSENTIAL_CAPTURE_MARKER.into()),
            ..row("Qm1")
        };
        let once = merge_essential_row(&existing, &incoming);
        let twice = merge_essential_row(&once, &incoming);
        assert_eq!(once.content.as_deref(), Some("payload"));
        assert!(once.content_fetched);
        assert_eq!(once.fetch_error, None);
        assert_eq!(once.token_status.as_deref(), Some("ACTIVE"));
        assert_eq!(once.did.as_deref(), Some("did:new"));
        assert_eq!(
            (twice.content, twice.token_status, twice.fetch_error),
            (once.content, once.token_status, once.fetch_error)
        );
    }

    #[test]
    fn essential_merge_prefers_real_error_over_marker() {
        let existing = row("Qm1");
        let incoming = ReplicaRow {
            fetch_error: Some(ESSENTIAL_CAPTURE_MARKER.into()),
            token_status: Some("essential_only".into()),
            ..row("Qm1")
        };
        let merged = merge_essential_row(&existing, &incoming);
        assert_eq!(merged.fetch_error.as_deref(), Some("timeout"));
        assert_eq!(merged.token_status.as_deref(), Some("essential_only"));

        let marker_only = ReplicaRow {
            fetch_error: Some(ESSENTIAL_CAPTURE_MARKER.into()),
            ..row("Qm1")
        };
        let merged = merge_essential_row(&marker_only, &incoming);
        assert_eq!(merged.fetch_error.as_deref(), Some(ESSENTIAL_CAPTURE_MARKER));
    }

    #[test]
    fn empty_stored_error_yields_to_marker() {
        let existing = ReplicaRow {
            fetch_error: Some(String::new()),
            ..row("Qm1")
        };
        let incoming = ReplicaRow {
            fetch_error: Some(ESSENTIAL_CAPTURE_MARKER.into()),
            ..row("Qm1")
        };
        let merged = merge_essential_row(&existing, &incoming);
        assert_eq!(merged.fetch_error.as_deref(), Some(ESSENTIAL_CAPTURE_MARKER));
    }

    #[test]
    fn essential_merge_fills_empty_content() {
        let existing = ReplicaRow {
            content: Some(String::new()),
            ..row("Qm1")
        };
        let merged = merge_essential_row(&existing, &fetched("Qm1", "late"));
        assert_eq!(merged.content.as_deref(), Some("late"));
        assert!(merged.content_fetched);
        assert_eq!(merged.fetch_error, None);
    }

    #[test]
    fn transient_classification() {
        assert!(StoreError::Sqlx(sqlx::Error::PoolTimedOut).is_transient());
        assert!(StoreError::Unavailable("reset".into()).is_transient());
        assert!(!StoreError::Sqlx(sqlx::Error::RowNotFound).is_transient());
        assert!(!StoreError::DuplicateKey("Qm1".into()).is_transient());
        assert!(!StoreError::ValueTooLong {
            column: "token_id",
            len: 501,
            max: 500
        }
        .is_transient());
    }
}
