//! Read-only access to a node's `TokensTable`, tolerant of schema drift.

use std::path::{Path, PathBuf};

use futures_util::stream::{self, Stream};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{ConnectOptions, Connection, Row};
use thiserror::Error;
use tracing::{debug, warn};
use tsync_core::{Column, RawRow, EXPECTED_COLUMNS, STATUS_ALLOWLIST};

pub const TOKENS_TABLE: &str = "TokensTable";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("sqlite error reading {path}: {source}")]
    Sqlite {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },
}

pub struct TokenExtractor {
    path: PathBuf,
    conn: SqliteConnection,
    present: [bool; EXPECTED_COLUMNS.len()],
}

impl std::fmt::Debug for TokenExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenExtractor")
            .field("path", &self.path)
            .field("present", &self.present)
            .finish_non_exhaustive()
    }
}

impl TokenExtractor {
    /// Open `db_path` read-only. `Ok(None)` when the database has no token table.
    pub async fn open(db_path: &Path) -> Result<Option<Self>, ExtractError> {
        let sqlite_err = |source| ExtractError::Sqlite {
            path: db_path.to_path_buf(),
            source,
        };

        let mut conn = SqliteConnectOptions::new()
            .filename(db_path)
            .read_only(true)
            .create_if_missing(false)
            .connect()
            .await
            .map_err(sqlite_err)?;

        let table: Option<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(TOKENS_TABLE)
                .fetch_optional(&mut conn)
                .await
                .map_err(sqlite_err)?;
        if table.is_none() {
            warn!(db_path = %db_path.display(), "no {TOKENS_TABLE} in database; skipping");
            if let Err(err) = conn.close().await {
                debug!(db_path = %db_path.display(), error = %err, "closing sqlite connection");
            }
            return Ok(None);
        }

        let columns: Vec<String> = sqlx::query(&format!("PRAGMA table_info({TOKENS_TABLE})"))
            .fetch_all(&mut conn)
            .await
            .map_err(sqlite_err)?
            .iter()
            .map(|row| row.try_get::<String, _>("name"))
            .collect::<Result<_, _>>()
            .map_err(sqlite_err)?;

        let mut present = [false; EXPECTED_COLUMNS.len()];
        for (idx, name) in EXPECTED_COLUMNS.iter().enumerate() {
            present[idx] = columns.iter().any(|c| c.eq_ignore_ascii_case(name));
        }

        let extractor = Self {
            path: db_path.to_path_buf(),
            conn,
            present,
        };
        let missing = extractor.missing_columns();
        if !missing.is_empty() {
            warn!(db_path = %db_path.display(), ?missing, "schema drift: columns absent");
        }
        Ok(Some(extractor))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn missing_columns(&self) -> Vec<&'static str> {
        EXPECTED_COLUMNS
            .iter()
            .zip(self.present)
            .filter(|(_, present)| !present)
            .map(|(name, _)| *name)
            .collect()
    }

    fn has(&self, column: &str) -> bool {
        EXPECTED_COLUMNS
            .iter()
            .position(|c| *c == column)
            .is_some_and(|idx| self.present[idx])
    }

    fn status_filter(&self) -> String {
        if !self.has("token_status") {
            return String::new();
        }
        let allowed = STATUS_ALLOWLIST
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        format!(" WHERE \"token_status\" IN ({allowed})")
    }

    fn projection(&self, columns: &[&str]) -> String {
        columns
            .iter()
            .map(|col| {
                if self.has(col) {
                    format!("CAST(\"{col}\" AS TEXT) AS \"{col}\"")
                } else {
                    format!("NULL AS \"{col}\"")
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn err(&self, source: sqlx::Error) -> ExtractError {
        ExtractError::Sqlite {
            path: self.path.clone(),
            source,
        }
    }

    /// Rows that pass the status filter.
    pub async fn count(&mut self) -> Result<u64, ExtractError> {
        let sql = format!("SELECT COUNT(*) FROM {TOKENS_TABLE}{}", self.status_filter());
        let count: i64 = sqlx::query_scalar(&sql)
            .fetch_one(&mut self.conn)
            .await
            .map_err(|e| self.err(e))?;
        Ok(count.max(0) as u64)
    }

    /// One page of full rows, in rowid order.
    pub async fn page(&mut self, offset: u64, limit: u64) -> Result<Vec<RawRow>, ExtractError> {
        self.fetch_page(&EXPECTED_COLUMNS, offset, limit).await
    }

    /// One page projecting only `did` and `token_id`; other fields are left NULL.
    pub async fn essential_page(
        &mut self,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<RawRow>, ExtractError> {
        self.fetch_page(&["did", "token_id"], offset, limit).await
    }

    async fn fetch_page(
        &mut self,
        columns: &[&str],
        offset: u64,
        limit: u64,
    ) -> Result<Vec<RawRow>, ExtractError> {
        let sql = format!(
            "SELECT {} FROM {TOKENS_TABLE}{} ORDER BY rowid LIMIT ? OFFSET ?",
            self.projection(columns),
            self.status_filter()
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&mut self.conn)
            .await
            .map_err(|e| self.err(e))?;
        debug!(db_path = %self.path.display(), offset, rows = rows.len(), "read page");

        rows.iter()
            .map(|row| self.decode(row, columns))
            .collect::<Result<_, _>>()
            .map_err(|e| self.err(e))
    }

    fn decode(&self, row: &SqliteRow, columns: &[&str]) -> Result<RawRow, sqlx::Error> {
        let get = |col: &str| -> Result<Column<String>, sqlx::Error> {
            if !self.has(col) {
                return Ok(Column::AbsentInSchema);
            }
            if !columns.contains(&col) {
                return Ok(Column::null());
            }
            Ok(Column::Present(row.try_get::<Option<String>, _>(col)?))
        };
        Ok(RawRow {
            did: get("did")?,
            token_id: get("token_id")?,
            created_at: get("created_at")?,
            updated_at: get("updated_at")?,
            token_status: get("token_status")?,
            parent_token_id: get("parent_token_id")?,
            token_value: get("token_value")?,
        })
    }

    /// Lazily page through all rows; each item is one page of at most `batch_size` rows.
    pub fn rows(self, batch_size: u64) -> impl Stream<Item = Result<Vec<RawRow>, ExtractError>> {
        let batch_size = batch_size.max(1);
        stream::try_unfold((self, 0u64), move |(mut extractor, offset)| async move {
            let page = extractor.page(offset, batch_size).await?;
            if page.is_empty() {
                extractor.close().await;
                return Ok(None);
            }
            let next = offset + page.len() as u64;
            Ok(Some((page, (extractor, next))))
        })
    }

    pub async fn close(self) {
        if let Err(err) = self.conn.close().await {
            debug!(db_path = %self.path.display(), error = %err, "closing sqlite connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;
    use sqlx::Executor;
    use tempfile::tempdir;

    async fn fixture(path: &Path, ddl: &str, inserts: &[&str]) {
        let mut conn = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .connect()
            .await
            .expect("create fixture");
        conn.execute(ddl).await.expect("ddl");
        for stmt in inserts {
            conn.execute(*stmt).await.expect("insert");
        }
        conn.close().await.expect("close");
    }

    const FULL_DDL: &str = "CREATE TABLE TokensTable (did TEXT, token_id TEXT, created_at TEXT, \
        updated_at TEXT, token_status INTEGER, parent_token_id TEXT, token_value REAL)";

    #[tokio::test]
    async fn status_filter_keeps_allowlisted_rows() {
        let dir = tempdir().expect("tempdir");
        let db = dir.path().join("rubix.db");
        fixture(
            &db,
            FULL_DDL,
            &[
                "INSERT INTO TokensTable VALUES ('did:a', 'Qm1', '2024-01-01 00:00:00', NULL, 1, NULL, 1.5)",
                "INSERT INTO TokensTable VALUES ('did:b', 'Qm2', NULL, NULL, 4, NULL, 1.0)",
                "INSERT INTO TokensTable VALUES ('did:c', 'Qm3', NULL, NULL, 2, 'Qm1', 0.25)",
            ],
        )
        .await;

        let mut ex = TokenExtractor::open(&db).await.expect("open").expect("table");
        assert_eq!(ex.count().await.expect("count"), 2);
        let rows = ex.page(0, 100).await.expect("page");
        let ids: Vec<_> = rows.iter().map(|r| r.token_id.clone()).collect();
        assert_eq!(
            ids,
            vec![Column::value("Qm1".to_string()), Column::value("Qm3".to_string())]
        );
        assert_eq!(rows[0].token_status, Column::value("1".to_string()));
        assert_eq!(rows[0].token_value, Column::value("1.5".to_string()));
        assert_eq!(rows[0].updated_at, Column::null());
    }

    #[tokio::test]
    async fn absent_columns_are_marked_not_nulled() {
        let dir = tempdir().expect("tempdir");
        let db = dir.path().join("rubix.db");
        fixture(
            &db,
            "CREATE TABLE TokensTable (did TEXT, token_id TEXT)",
            &["INSERT INTO TokensTable VALUES ('did:a', 'Qm1')"],
        )
        .await;

        let mut ex = TokenExtractor::open(&db).await.expect("open").expect("table");
        assert_eq!(ex.missing_columns().len(), 5);
        let rows = ex.page(0, 10).await.expect("page");
        assert_eq!(rows.len(), 1, "no status column means no filter");
        assert_eq!(rows[0].token_status, Column::AbsentInSchema);
        assert_eq!(rows[0].parent_token_id, Column::AbsentInSchema);
        assert_eq!(rows[0].did, Column::value("did:a".to_string()));
    }

    #[tokio::test]
    async fn missing_table_is_none_and_missing_file_is_error() {
        let dir = tempdir().expect("tempdir");
        let db = dir.path().join("rubix.db");
        fixture(&db, "CREATE TABLE Other (x TEXT)", &[]).await;
        assert!(TokenExtractor::open(&db).await.expect("open").is_none());

        let err = TokenExtractor::open(&dir.path().join("nope.db"))
            .await
            .expect_err("missing file");
        assert!(matches!(err, ExtractError::Sqlite { .. }));
    }

    #[tokio::test]
    async fn stream_pages_through_every_row() {
        let dir = tempdir().expect("tempdir");
        let db = dir.path().join("rubix.db");
        let inserts: Vec<String> = (0..7)
            .map(|i| format!("INSERT INTO TokensTable VALUES ('did:{i}', 'Qm{i}', NULL, NULL, 0, NULL, NULL)"))
            .collect();
        let refs: Vec<&str> = inserts.iter().map(String::as_str).collect();
        fixture(&db, FULL_DDL, &refs).await;

        let ex = TokenExtractor::open(&db).await.expect("open").expect("table");
        let pages: Vec<Vec<RawRow>> = ex.rows(3).try_collect().await.expect("stream");
        assert_eq!(pages.iter().map(Vec::len).collect::<Vec<_>>(), vec![3, 3, 1]);
    }

    #[tokio::test]
    async fn essential_page_leaves_other_fields_null() {
        let dir = tempdir().expect("tempdir");
        let db = dir.path().join("rubix.db");
        fixture(
            &db,
            FULL_DDL,
            &["INSERT INTO TokensTable VALUES ('did:a', 'Qm1', '2024-01-01', NULL, 3, 'p', 2.0)"],
        )
        .await;
        let mut ex = TokenExtractor::open(&db).await.expect("open").expect("table");
        let rows = ex.essential_page(0, 10).await.expect("page");
        assert_eq!(rows[0].token_id, Column::value("Qm1".to_string()));
        assert_eq!(rows[0].created_at, Column::null());
        assert_eq!(rows[0].token_value, Column::null());
    }
}
