use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Connection, Postgres, QueryBuilder};
use tracing::{debug, warn};
use tsync_core::{ProcessedSourceRecord, RunSession};

use super::{
    is_transient_sqlx, MergeReport, ReplicaRow, ReplicaStore, RowError, StoreError, Watermarks,
};

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS token_records (
        id BIGSERIAL PRIMARY KEY,
        source_ip VARCHAR(45) NOT NULL,
        node_name VARCHAR(255) NOT NULL,
        did VARCHAR(1000),
        token_id VARCHAR(500) NOT NULL DEFAULT '',
        created_at TIMESTAMPTZ,
        updated_at TIMESTAMPTZ,
        token_status VARCHAR(50),
        parent_token_id VARCHAR(500),
        token_value TEXT,
        content TEXT,
        content_fetched BOOLEAN NOT NULL DEFAULT FALSE,
        fetch_error VARCHAR(1000),
        db_path VARCHAR(500) NOT NULL,
        store_path VARCHAR(500),
        db_last_modified TIMESTAMPTZ,
        synced_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        validation_errors TEXT,
        missing_columns TEXT
    )"#,
    "CREATE UNIQUE INDEX IF NOT EXISTS ux_token_records_key ON token_records (source_ip, node_name, token_id)",
    "CREATE INDEX IF NOT EXISTS ix_token_records_token_id ON token_records (token_id) INCLUDE (did, content_fetched)",
    "CREATE INDEX IF NOT EXISTS ix_token_records_did ON token_records (did) INCLUDE (token_id, node_name)",
    "CREATE INDEX IF NOT EXISTS ix_token_records_node_name ON token_records (node_name) INCLUDE (source_ip, synced_at)",
    "CREATE INDEX IF NOT EXISTS ix_token_records_source_ip ON token_records (source_ip)",
    "CREATE INDEX IF NOT EXISTS ix_token_records_db_path ON token_records (db_path)",
    "CREATE INDEX IF NOT EXISTS ix_token_records_content_fetched ON token_records (content_fetched) INCLUDE (fetch_error)",
    "CREATE INDEX IF NOT EXISTS ix_token_records_synced_at ON token_records (synced_at) INCLUDE (node_name, source_ip)",
    r#"CREATE TABLE IF NOT EXISTS processed_sources (
        db_path VARCHAR(500) PRIMARY KEY,
        last_modified TIMESTAMPTZ NOT NULL,
        last_processed TIMESTAMPTZ NOT NULL,
        record_count BIGINT NOT NULL DEFAULT 0,
        fetch_success_count BIGINT NOT NULL DEFAULT 0,
        fetch_fail_count BIGINT NOT NULL DEFAULT 0,
        validation_error_count BIGINT NOT NULL DEFAULT 0,
        processing_duration_seconds DOUBLE PRECISION NOT NULL DEFAULT 0
    )"#,
    r#"CREATE TABLE IF NOT EXISTS sync_sessions (
        session_id UUID PRIMARY KEY,
        start_time TIMESTAMPTZ NOT NULL,
        end_time TIMESTAMPTZ,
        source_ip VARCHAR(45) NOT NULL,
        total_databases_found BIGINT NOT NULL DEFAULT 0,
        total_databases_processed BIGINT NOT NULL DEFAULT 0,
        total_records_processed BIGINT NOT NULL DEFAULT 0,
        total_fetch_success BIGINT NOT NULL DEFAULT 0,
        total_fetch_failures BIGINT NOT NULL DEFAULT 0,
        total_replica_inserts BIGINT NOT NULL DEFAULT 0,
        total_replica_errors BIGINT NOT NULL DEFAULT 0,
        total_validation_errors BIGINT NOT NULL DEFAULT 0,
        status VARCHAR(20) NOT NULL DEFAULT 'RUNNING',
        error_summary TEXT
    )"#,
];

const FULL_COLUMNS: &str = "INSERT INTO token_records AS t (source_ip, node_name, did, token_id, \
    created_at, updated_at, token_status, parent_token_id, token_value, content, content_fetched, \
    fetch_error, db_path, store_path, db_last_modified, synced_at, validation_errors, missing_columns) ";

const ESSENTIAL_MERGE: &str = r#"
    INSERT INTO token_records AS t (source_ip, node_name, did, token_id, db_path, content,
        content_fetched, fetch_error, token_status, db_last_modified, missing_columns, synced_at,
        store_path)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
    ON CONFLICT (source_ip, node_name, token_id) DO UPDATE SET
        content = CASE
            WHEN t.content IS NOT NULL AND t.content <> '' THEN t.content
            WHEN EXCLUDED.content IS NOT NULL AND EXCLUDED.content <> '' THEN EXCLUDED.content
            ELSE t.content
        END,
        content_fetched = t.content_fetched OR EXCLUDED.content_fetched,
        fetch_error = CASE
            WHEN t.content_fetched THEN t.fetch_error
            WHEN EXCLUDED.content_fetched THEN EXCLUDED.fetch_error
            WHEN t.fetch_error <> '' AND t.fetch_error <> 'essential_capture_only' THEN t.fetch_error
            ELSE EXCLUDED.fetch_error
        END,
        did = COALESCE(EXCLUDED.did, t.did),
        db_path = EXCLUDED.db_path,
        token_status = CASE
            WHEN t.content_fetched THEN t.token_status
            ELSE COALESCE(EXCLUDED.token_status, t.token_status)
        END,
        db_last_modified = CASE
            WHEN t.content_fetched THEN t.db_last_modified
            ELSE COALESCE(EXCLUDED.db_last_modified, t.db_last_modified)
        END,
        synced_at = EXCLUDED.synced_at
"#;

const SCHEMA_LOCK_KEY: i64 = 0x7473_796e_6300;

const LOCK_ERROR_FILTER: &str = "fetch_error LIKE '%repo.lock%'";

/// Conflict clause for the bulk path, mirroring [`super::merge_full_row`].
fn full_upsert_tail(force: bool) -> String {
    let take = if force {
        "TRUE".to_string()
    } else {
        "(EXCLUDED.content_fetched OR NOT t.content_fetched)".to_string()
    };
    format!(
        " ON CONFLICT (source_ip, node_name, token_id) DO UPDATE SET \
        did = EXCLUDED.did, created_at = EXCLUDED.created_at, updated_at = EXCLUDED.updated_at, \
        token_status = EXCLUDED.token_status, parent_token_id = EXCLUDED.parent_token_id, \
        token_value = EXCLUDED.token_value, db_path = EXCLUDED.db_path, \
        store_path = EXCLUDED.store_path, db_last_modified = EXCLUDED.db_last_modified, \
        synced_at = EXCLUDED.synced_at, validation_errors = EXCLUDED.validation_errors, \
        missing_columns = EXCLUDED.missing_columns, \
        content = CASE WHEN {take} THEN EXCLUDED.content ELSE t.content END, \
        content_fetched = CASE WHEN {take} THEN EXCLUDED.content_fetched ELSE t.content_fetched END, \
        fetch_error = CASE WHEN {take} THEN EXCLUDED.fetch_error ELSE t.fetch_error END"
    )
}

fn push_full_insert<'a>(rows: &'a [ReplicaRow], force: bool) -> QueryBuilder<'a, Postgres> {
    let mut qb = QueryBuilder::<Postgres>::new(FULL_COLUMNS);
    qb.push_values(rows, |mut b, row| {
        b.push_bind(&row.source_ip)
            .push_bind(&row.node_name)
            .push_bind(&row.did)
            .push_bind(&row.token_id)
            .push_bind(row.created_at)
            .push_bind(row.updated_at)
            .push_bind(&row.token_status)
            .push_bind(&row.parent_token_id)
            .push_bind(&row.token_value)
            .push_bind(&row.content)
            .push_bind(row.content_fetched)
            .push_bind(&row.fetch_error)
            .push_bind(&row.db_path)
            .push_bind(&row.store_path)
            .push_bind(row.db_last_modified)
            .push_bind(row.synced_at)
            .push_bind(&row.validation_errors)
            .push_bind(&row.missing_columns);
    });
    qb.push(full_upsert_tail(force));
    qb
}

async fn upsert_in_tx(
    conn: &mut PgConnection,
    rows: &[ReplicaRow],
    force: bool,
) -> Result<u64, sqlx::Error> {
    let mut tx = conn.begin().await?;
    let done = push_full_insert(rows, force).build().execute(&mut *tx).await?;
    tx.commit().await?;
    Ok(done.rows_affected())
}

async fn essential_in_tx(
    conn: &mut PgConnection,
    rows: &[ReplicaRow],
) -> Result<MergeReport, sqlx::Error> {
    let mut report = MergeReport::default();
    let mut tx = conn.begin().await?;
    for row in rows {
        let mut savepoint = tx.begin().await?;
        let result = sqlx::query(ESSENTIAL_MERGE)
            .bind(&row.source_ip)
            .bind(&row.node_name)
            .bind(&row.did)
            .bind(&row.token_id)
            .bind(&row.db_path)
            .bind(&row.content)
            .bind(row.content_fetched)
            .bind(&row.fetch_error)
            .bind(&row.token_status)
            .bind(row.db_last_modified)
            .bind(&row.missing_columns)
            .bind(row.synced_at)
            .bind(&row.store_path)
            .execute(&mut *savepoint)
            .await;
        match result {
            Ok(_) => {
                savepoint.commit().await?;
                report.merged += 1;
            }
            Err(err) if is_transient_sqlx(&err) => return Err(err),
            Err(err) => {
                savepoint.rollback().await?;
                debug!(token_id = %row.token_id, error = %err, "essential merge row failed");
                report.errors.push(RowError {
                    token_id: row.token_id.clone(),
                    error: StoreError::Sqlx(err),
                });
            }
        }
    }
    tx.commit().await?;
    Ok(report)
}

/// A connection that failed with a network-class error is closed, never handed back.
async fn release<T>(
    conn: PoolConnection<Postgres>,
    result: Result<T, sqlx::Error>,
) -> Result<T, StoreError> {
    match result {
        Ok(value) => Ok(value),
        Err(err) => {
            if is_transient_sqlx(&err) {
                warn!(error = %err, "closing connection after network failure");
                if let Err(close_err) = conn.close().await {
                    debug!(error = %close_err, "closing failed connection");
                }
            }
            Err(StoreError::Sqlx(err))
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgReplicaStore {
    pool: PgPool,
}

impl PgReplicaStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ReplicaStore for PgReplicaStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        // Concurrent `IF NOT EXISTS` DDL from several hosts can still collide.
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(SCHEMA_LOCK_KEY)
            .execute(&mut *tx)
            .await?;
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn upsert_chunk(&self, rows: &[ReplicaRow], force: bool) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.pool.acquire().await?;
        let result = upsert_in_tx(&mut conn, rows, force).await;
        release(conn, result).await
    }

    async fn upsert_one(&self, row: &ReplicaRow, force: bool) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        let result = upsert_in_tx(&mut conn, std::slice::from_ref(row), force).await;
        release(conn, result).await.map(|_| ())
    }

    async fn merge_essential_chunk(&self, rows: &[ReplicaRow]) -> Result<MergeReport, StoreError> {
        if rows.is_empty() {
            return Ok(MergeReport::default());
        }
        let mut conn = self.pool.acquire().await?;
        let result = essential_in_tx(&mut conn, rows).await;
        release(conn, result).await
    }

    async fn load_watermarks(&self) -> Result<Watermarks, StoreError> {
        let rows: Vec<(String, DateTime<Utc>)> =
            sqlx::query_as("SELECT db_path, last_modified FROM processed_sources")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(path, ts)| (PathBuf::from(path), ts))
            .collect())
    }

    async fn record_processed_source(&self, record: &ProcessedSourceRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO processed_sources (db_path, last_modified, last_processed, record_count,
                   fetch_success_count, fetch_fail_count, validation_error_count,
                   processing_duration_seconds)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               ON CONFLICT (db_path) DO UPDATE SET
                   last_modified = EXCLUDED.last_modified,
                   last_processed = EXCLUDED.last_processed,
                   record_count = EXCLUDED.record_count,
                   fetch_success_count = EXCLUDED.fetch_success_count,
                   fetch_fail_count = EXCLUDED.fetch_fail_count,
                   validation_error_count = EXCLUDED.validation_error_count,
                   processing_duration_seconds = EXCLUDED.processing_duration_seconds"#,
        )
        .bind(record.db_path.display().to_string())
        .bind(record.last_modified)
        .bind(record.last_processed)
        .bind(record.record_count as i64)
        .bind(record.fetch_success as i64)
        .bind(record.fetch_failed as i64)
        .bind(record.validation_errors as i64)
        .bind(record.processing_duration_secs)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetched_tokens(
        &self,
        source_ip: &str,
        node_name: &str,
    ) -> Result<HashSet<String>, StoreError> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT token_id FROM token_records \
             WHERE source_ip = $1 AND node_name = $2 AND content_fetched",
        )
        .bind(source_ip)
        .bind(node_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().collect())
    }

    async fn create_session(&self, session: &RunSession) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sync_sessions (session_id, start_time, source_ip, status) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(session.session_id)
        .bind(session.started_at)
        .bind(&session.source_ip)
        .bind(session.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_session(&self, session: &RunSession) -> Result<(), StoreError> {
        sqlx::query(
            r#"UPDATE sync_sessions SET
                   end_time = $2,
                   total_databases_found = $3,
                   total_databases_processed = $4,
                   total_records_processed = $5,
                   total_fetch_success = $6,
                   total_fetch_failures = $7,
                   total_replica_inserts = $8,
                   total_replica_errors = $9,
                   total_validation_errors = $10,
                   status = $11,
                   error_summary = $12
               WHERE session_id = $1"#,
        )
        .bind(session.session_id)
        .bind(session.ended_at)
        .bind(session.databases_found as i64)
        .bind(session.databases_processed as i64)
        .bind(session.records_processed as i64)
        .bind(session.fetch_success as i64)
        .bind(session.fetch_failures as i64)
        .bind(session.replica_inserts as i64)
        .bind(session.replica_errors as i64)
        .bind(session.validation_errors as i64)
        .bind(session.status.as_str())
        .bind(&session.error_summary)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_records(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM token_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn clear_records(&self) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM token_records")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM processed_sources")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(deleted)
    }

    async fn count_lock_errors(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM token_records WHERE {LOCK_ERROR_FILTER}"
        ))
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn delete_lock_errors(&self, limit: u64) -> Result<u64, StoreError> {
        let deleted = sqlx::query(&format!(
            "DELETE FROM token_records WHERE id IN \
             (SELECT id FROM token_records WHERE {LOCK_ERROR_FILTER} LIMIT $1)"
        ))
        .bind(limit as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(deleted)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
