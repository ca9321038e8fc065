use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};
use tsync_core::EnrichedRecord;
use tsync_storage::{RetryDisposition, RetryPolicy};

use crate::store::{ReplicaRow, ReplicaStore, StoreError};

/// A row the replica refused, kept for the run's error log.
#[derive(Debug, Clone, PartialEq)]
pub struct RowFailure {
    pub token_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteReport {
    pub written: u64,
    pub failed: u64,
    pub failures: Vec<RowFailure>,
}

impl WriteReport {
    fn fail(&mut self, token_id: &str, err: &StoreError) {
        self.failed += 1;
        self.failures.push(RowFailure {
            token_id: token_id.to_string(),
            message: err.to_string(),
        });
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

fn classify(err: &StoreError) -> RetryDisposition {
    if err.is_transient() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Collapse rows sharing a replica key; the last occurrence wins and keeps its position.
pub fn dedupe_rows(rows: impl IntoIterator<Item = ReplicaRow>) -> Vec<ReplicaRow> {
    let mut out: Vec<ReplicaRow> = Vec::new();
    let mut slots: HashMap<(String, String, String), usize> = HashMap::new();
    for row in rows {
        match slots.get(&row.key()) {
            Some(&slot) => out[slot] = row,
            None => {
                slots.insert(row.key(), out.len());
                out.push(row);
            }
        }
    }
    out
}

/// Writes enriched batches to the replica in chunked transactions.
pub struct ReplicationWriter {
    store: Arc<dyn ReplicaStore>,
    chunk_size: usize,
    network_policy: RetryPolicy,
}

impl ReplicationWriter {
    pub fn new(store: Arc<dyn ReplicaStore>, chunk_size: usize) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
            network_policy: RetryPolicy::network(),
        }
    }

    pub fn with_network_policy(mut self, policy: RetryPolicy) -> Self {
        self.network_policy = policy;
        self
    }

    /// Upsert `records`. A chunk that still fails after network retries is replayed row by
    /// row so one bad row costs only itself.
    pub async fn insert_batch(&self, records: &[EnrichedRecord], force: bool) -> WriteReport {
        let rows = dedupe_rows(records.iter().map(ReplicaRow::from));
        let mut report = WriteReport::default();

        for (index, chunk) in rows.chunks(self.chunk_size).enumerate() {
            let started = Instant::now();
            let store = &self.store;
            let result = self
                .network_policy
                .run(
                    |attempt| async move {
                        let result = store.upsert_chunk(chunk, force).await;
                        match &result {
                            Ok(_) => debug!(chunk = index, attempt, rows = chunk.len(), "chunk committed"),
                            Err(err) => warn!(
                                chunk = index,
                                attempt,
                                rows = chunk.len(),
                                transient = err.is_transient(),
                                error = %err,
                                "chunk write failed"
                            ),
                        }
                        result
                    },
                    classify,
                )
                .await;

            match result {
                Ok(_) => {
                    report.written += chunk.len() as u64;
                    info!(
                        chunk = index,
                        rows = chunk.len(),
                        duration_ms = started.elapsed().as_millis() as u64,
                        "chunk written"
                    );
                }
                Err(err) => {
                    warn!(chunk = index, rows = chunk.len(), error = %err, "falling back to row-by-row insert");
                    self.insert_rows(chunk, force, &mut report).await;
                    info!(
                        chunk = index,
                        rows = chunk.len(),
                        duration_ms = started.elapsed().as_millis() as u64,
                        "row-by-row fallback finished"
                    );
                }
            }
        }
        report
    }

    async fn insert_rows(&self, rows: &[ReplicaRow], force: bool, report: &mut WriteReport) {
        for row in rows {
            match self.store.upsert_one(row, force).await {
                Ok(()) => report.written += 1,
                Err(err) => {
                    debug!(token_id = %row.token_id, error = %err, "row insert failed");
                    report.fail(&row.token_id, &err);
                }
            }
        }
    }

    /// Essential capture merge; never overwrites stored content.
    pub async fn merge_essential(&self, records: &[EnrichedRecord]) -> WriteReport {
        let rows = dedupe_rows(records.iter().map(ReplicaRow::from));
        let mut report = WriteReport::default();

        for (index, chunk) in rows.chunks(self.chunk_size).enumerate() {
            let store = &self.store;
            let result = self
                .network_policy
                .run(
                    |attempt| async move {
                        let result = store.merge_essential_chunk(chunk).await;
                        if let Err(err) = &result {
                            warn!(chunk = index, attempt, error = %err, "essential merge failed");
                        }
                        result
                    },
                    classify,
                )
                .await;

            match result {
                Ok(merge) => {
                    report.written += merge.merged;
                    report.failed += merge.errors.len() as u64;
                    report
                        .failures
                        .extend(merge.errors.into_iter().map(|row| RowFailure {
                            token_id: row.token_id,
                            message: row.error.to_string(),
                        }));
                }
                Err(err) => {
                    for row in chunk {
                        report.fail(&row.token_id, &err);
                    }
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryReplicaStore;
    use chrono::Utc;
    use std::path::PathBuf;
    use std::time::Duration;
    use tsync_core::{Column, RawRow, RecordOrigin};
    use tsync_storage::Backoff;

    fn record(token: &str) -> EnrichedRecord {
        let raw = RawRow {
            token_id: Column::value(token.to_string()),
            did: Column::value("did:rubix:abcdef".into()),
            ..RawRow::default()
        };
        let origin = RecordOrigin {
            source_ip: "10.0.0.1".into(),
            node_name: "node1".into(),
            db_path: PathBuf::from("/n/node1/Rubix/rubix.db"),
            store_path: None,
            db_modified: Utc::now(),
        };
        EnrichedRecord::from_raw(&raw, &origin)
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::network().with_backoff(Backoff::Linear {
            step: Duration::from_millis(1),
        })
    }

    #[test]
    fn dedupe_keeps_last_occurrence() {
        let mut first = ReplicaRow::from(&record("Qm1"));
        first.content = Some("old".into());
        let mut second = first.clone();
        second.content = Some("new".into());
        let other = ReplicaRow::from(&record("Qm2"));
        let rows = dedupe_rows(vec![first, other, second]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].content.as_deref(), Some("new"));
        assert_eq!(rows[1].token_id, "Qm2");
    }

    #[tokio::test]
    async fn bad_row_falls_back_to_row_by_row() {
        let store = Arc::new(MemoryReplicaStore::new());
        let writer = ReplicationWriter::new(store.clone(), 1000).with_network_policy(fast_policy());
        let mut records: Vec<_> = (0..999).map(|i| record(&format!("Qm{i}"))).collect();
        records.push(record(&"x".repeat(600)));

        let report = writer.insert_batch(&records, false).await;
        assert_eq!(report.written, 999);
        assert_eq!(report.failed, 1);
        assert!(report.failures[0].message.contains("token_id"));
        assert_eq!(store.count_records().await.expect("count"), 999);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_then_committed() {
        let store = Arc::new(MemoryReplicaStore::new());
        store.fail_next_writes(2);
        let writer = ReplicationWriter::new(store.clone(), 1000).with_network_policy(fast_policy());
        let report = writer
            .insert_batch(&[record("Qm1"), record("Qm2")], false)
            .await;
        assert!(report.is_clean());
        assert_eq!(report.written, 2);
        assert_eq!(store.write_attempts(), 3);
    }

    #[tokio::test]
    async fn duplicate_keys_in_one_batch_do_not_fail_the_chunk() {
        let store = Arc::new(MemoryReplicaStore::new());
        let writer = ReplicationWriter::new(store.clone(), 1000);
        let report = writer
            .insert_batch(&[record("Qm1"), record("Qm1")], false)
            .await;
        assert_eq!((report.written, report.failed), (1, 0));
        assert_eq!(store.write_attempts(), 1);
    }

    #[tokio::test]
    async fn chunks_split_by_size() {
        let store = Arc::new(MemoryReplicaStore::new());
        let writer = ReplicationWriter::new(store.clone(), 2);
        let records: Vec<_> = (0..5).map(|i| record(&format!("Qm{i}"))).collect();
        let report = writer.insert_batch(&records, false).await;
        assert_eq!(report.written, 5);
        assert_eq!(store.write_attempts(), 3);
    }

    #[tokio::test]
    async fn essential_row_failure_names_the_token() {
        let store = Arc::new(MemoryReplicaStore::new());
        let writer = ReplicationWriter::new(store.clone(), 1000);
        let mut oversized = record("Qm-bad");
        oversized.did = Column::value("d".repeat(1001));

        let report = writer.merge_essential(&[record("Qm1"), oversized]).await;
        assert_eq!((report.written, report.failed), (1, 1));
        assert_eq!(report.failures[0].token_id, "Qm-bad");
        assert!(report.failures[0].message.contains("did"));
    }

    #[tokio::test]
    async fn essential_merge_is_idempotent() {
        let store = Arc::new(MemoryReplicaStore::new());
        let writer = ReplicationWriter::new(store.clone(), 1000);
        let records = vec![record("Qm1"), record("Qm2")];
        writer.merge_essential(&records).await;
        let snapshot: Vec<_> = store
            .rows()
            .into_iter()
            .map(|r| (r.token_id, r.content, r.content_fetched, r.fetch_error))
            .collect();
        writer.merge_essential(&records).await;
        let again: Vec<_> = store
            .rows()
            .into_iter()
            .map(|r| (r.token_id, r.content, r.content_fetched, r.fetch_error))
            .collect();
        assert_eq!(snapshot, again);
        assert_eq!(snapshot.len(), 2);
    }
}
