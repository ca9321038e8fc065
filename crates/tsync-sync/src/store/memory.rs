use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tsync_core::{ProcessedSourceRecord, RunSession};
use uuid::Uuid;

use super::{
    merge_essential_row, merge_full_row, MergeReport, ReplicaRow, ReplicaStore, RowError, StoreError,
    Watermarks,
};

type Key = (String, String, String);

#[derive(Debug, Default)]
struct State {
    rows: BTreeMap<Key, ReplicaRow>,
    sources: HashMap<std::path::PathBuf, ProcessedSourceRecord>,
    sessions: HashMap<Uuid, RunSession>,
}

/// In-process replica used by tests and dry runs. Mirrors the column limits and
/// conflict rules of the Postgres store.
#[derive(Debug, Default)]
pub struct MemoryReplicaStore {
    state: Mutex<State>,
    failing_writes: AtomicU32,
    write_attempts: AtomicU64,
}

fn check_len(column: &'static str, value: Option<&str>, max: usize) -> Result<(), StoreError> {
    let len = value.map(|v| v.chars().count()).unwrap_or(0);
    if len > max {
        return Err(StoreError::ValueTooLong { column, len, max });
    }
    Ok(())
}

fn check_row(row: &ReplicaRow) -> Result<(), StoreError> {
    check_len("source_ip", Some(&row.source_ip), 45)?;
    check_len("node_name", Some(&row.node_name), 255)?;
    check_len("did", row.did.as_deref(), 1000)?;
    check_len("token_id", Some(&row.token_id), 500)?;
    check_len("token_status", row.token_status.as_deref(), 50)?;
    check_len("parent_token_id", row.parent_token_id.as_deref(), 500)?;
    check_len("fetch_error", row.fetch_error.as_deref(), 1000)?;
    check_len("db_path", Some(&row.db_path), 500)?;
    check_len("store_path", row.store_path.as_deref(), 500)
}

impl MemoryReplicaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` write calls fail with a transient error.
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Number of write calls seen so far, failed ones included.
    pub fn write_attempts(&self) -> u64 {
        self.write_attempts.load(Ordering::SeqCst)
    }

    pub fn rows(&self) -> Vec<ReplicaRow> {
        self.lock().rows.values().cloned().collect()
    }

    pub fn row(&self, source_ip: &str, node_name: &str, token_id: &str) -> Option<ReplicaRow> {
        self.lock()
            .rows
            .get(&(source_ip.to_string(), node_name.to_string(), token_id.to_string()))
            .cloned()
    }

    pub fn session(&self, id: Uuid) -> Option<RunSession> {
        self.lock().sessions.get(&id).cloned()
    }

    pub fn insert_row(&self, row: ReplicaRow) {
        self.lock().rows.insert(row.key(), row);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn begin_write(&self) -> Result<(), StoreError> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        let pending = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match pending {
            Ok(_) => Err(StoreError::Unavailable("connection reset by peer".into())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl ReplicaStore for MemoryReplicaStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn upsert_chunk(&self, rows: &[ReplicaRow], force: bool) -> Result<u64, StoreError> {
        self.begin_write()?;
        for row in rows {
            check_row(row)?;
        }
        let mut state = self.lock();
        let mut seen = HashSet::new();
        for row in rows {
            if !seen.insert(row.key()) {
                return Err(StoreError::DuplicateKey(row.token_id.clone()));
            }
        }
        for row in rows {
            let merged = match state.rows.get(&row.key()) {
                Some(existing) => merge_full_row(existing, row, force),
                None => row.clone(),
            };
            state.rows.insert(row.key(), merged);
        }
        Ok(rows.len() as u64)
    }

    async fn upsert_one(&self, row: &ReplicaRow, force: bool) -> Result<(), StoreError> {
        self.upsert_chunk(std::slice::from_ref(row), force)
            .await
            .map(|_| ())
    }

    async fn merge_essential_chunk(&self, rows: &[ReplicaRow]) -> Result<MergeReport, StoreError> {
        self.begin_write()?;
        let mut state = self.lock();
        let mut report = MergeReport::default();
        for row in rows {
            if let Err(error) = check_row(row) {
                report.errors.push(RowError {
                    token_id: row.token_id.clone(),
                    error,
                });
                continue;
            }
            let merged = match state.rows.get(&row.key()) {
                Some(existing) => merge_essential_row(existing, row),
                None => row.clone(),
            };
            state.rows.insert(row.key(), merged);
            report.merged += 1;
        }
        Ok(report)
    }

    async fn load_watermarks(&self) -> Result<Watermarks, StoreError> {
        Ok(self
            .lock()
            .sources
            .iter()
            .map(|(path, rec)| (path.clone(), rec.last_modified))
            .collect())
    }

    async fn record_processed_source(&self, record: &ProcessedSourceRecord) -> Result<(), StoreError> {
        self.lock()
            .sources
            .insert(record.db_path.clone(), record.clone());
        Ok(())
    }

    async fn fetched_tokens(
        &self,
        source_ip: &str,
        node_name: &str,
    ) -> Result<HashSet<String>, StoreError> {
        Ok(self
            .lock()
            .rows
            .values()
            .filter(|r| r.source_ip == source_ip && r.node_name == node_name && r.content_fetched)
            .map(|r| r.token_id.clone())
            .collect())
    }

    async fn create_session(&self, session: &RunSession) -> Result<(), StoreError> {
        self.lock().sessions.insert(session.session_id, session.clone());
        Ok(())
    }

    async fn finish_session(&self, session: &RunSession) -> Result<(), StoreError> {
        self.lock().sessions.insert(session.session_id, session.clone());
        Ok(())
    }

    async fn count_records(&self) -> Result<u64, StoreError> {
        Ok(self.lock().rows.len() as u64)
    }

    async fn clear_records(&self) -> Result<u64, StoreError> {
        let mut state = self.lock();
        let deleted = state.rows.len() as u64;
        state.rows.clear();
        state.sources.clear();
        Ok(deleted)
    }

    async fn count_lock_errors(&self) -> Result<u64, StoreError> {
        Ok(self
            .lock()
            .rows
            .values()
            .filter(|r| is_lock_error(r))
            .count() as u64)
    }

    async fn delete_lock_errors(&self, limit: u64) -> Result<u64, StoreError> {
        let mut state = self.lock();
        let doomed: Vec<Key> = state
            .rows
            .iter()
            .filter(|(_, r)| is_lock_error(r))
            .map(|(k, _)| k.clone())
            .take(limit as usize)
            .collect();
        for key in &doomed {
            state.rows.remove(key);
        }
        Ok(doomed.len() as u64)
    }

    async fn close(&self) {}
}

fn is_lock_error(row: &ReplicaRow) -> bool {
    row.fetch_error
        .as_deref()
        .is_some_and(|e| e.contains(tsync_storage::LOCK_SIGNATURE))
}
