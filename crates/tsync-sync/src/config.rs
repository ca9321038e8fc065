use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no database url configured (set DATABASE_URL or TSYNC_CONNECTION_FILE)")]
    MissingDatabaseUrl,
    #[error("database url still contains a password placeholder; edit the credential first")]
    PlaceholderCredential,
    #[error("reading connection file {path}: {source}")]
    ConnectionFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    database_url: Option<String>,
    connection_file: Option<PathBuf>,
    pub scan_root: PathBuf,
    pub reports_dir: PathBuf,
    pub script_dir: PathBuf,
    pub fetch_timeout: Duration,
    pub workers: usize,
    pub batch_size: u64,
    pub insert_chunk: usize,
    pub pool_size: u32,
    pub min_batch_success: f64,
    pub progress_every: usize,
    pub notify_interval: Duration,
    pub notify_webhook: Option<String>,
    pub source_ip: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let vars = Vars(lookup);
        let var = |key: &str| vars.get(key);

        let scan_root = var("TSYNC_SCAN_ROOT").map(PathBuf::from).unwrap_or_else(|| {
            let node_root = PathBuf::from("../Node");
            if node_root.is_dir() {
                node_root
            } else {
                PathBuf::from("..")
            }
        });

        let script_dir = var("TSYNC_SCRIPT_DIR")
            .map(PathBuf::from)
            .or_else(|| {
                std::env::current_exe()
                    .ok()
                    .and_then(|exe| exe.parent().map(Path::to_path_buf))
            })
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            database_url: var("DATABASE_URL"),
            connection_file: var("TSYNC_CONNECTION_FILE").map(PathBuf::from),
            scan_root,
            reports_dir: var("TSYNC_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./reports")),
            script_dir,
            fetch_timeout: Duration::from_secs(
                vars.parse("TSYNC_FETCH_TIMEOUT_SECS").unwrap_or(12),
            ),
            workers: vars
                .parse("TSYNC_WORKERS")
                .filter(|n: &usize| *n > 0)
                .unwrap_or_else(default_workers),
            batch_size: vars
                .parse("TSYNC_BATCH_SIZE")
                .filter(|n: &u64| *n > 0)
                .unwrap_or(1000),
            insert_chunk: vars
                .parse("TSYNC_INSERT_CHUNK")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(1000),
            pool_size: vars
                .parse("TSYNC_POOL_SIZE")
                .filter(|n: &u32| *n > 0)
                .unwrap_or(10),
            min_batch_success: vars
                .parse("TSYNC_MIN_BATCH_SUCCESS")
                .filter(|r: &f64| (0.0..=1.0).contains(r))
                .unwrap_or(0.8),
            progress_every: vars
                .parse("TSYNC_PROGRESS_EVERY")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(100),
            notify_interval: Duration::from_secs(
                vars.parse("TSYNC_NOTIFY_INTERVAL_SECS").unwrap_or(300),
            ),
            notify_webhook: var("TSYNC_NOTIFY_WEBHOOK"),
            source_ip: var("TSYNC_SOURCE_IP"),
        }
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Resolved connection string. The connection file is read on demand.
    pub fn database_url(&self) -> Result<String, ConfigError> {
        let url = match (&self.database_url, &self.connection_file) {
            (Some(url), _) => url.trim().to_string(),
            (None, Some(path)) => read_connection_file(path)?,
            (None, None) => return Err(ConfigError::MissingDatabaseUrl),
        };
        if url.is_empty() {
            return Err(ConfigError::MissingDatabaseUrl);
        }
        if has_password_placeholder(&url) {
            return Err(ConfigError::PlaceholderCredential);
        }
        Ok(url)
    }
}

struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(4)
}

fn read_connection_file(path: &Path) -> Result<String, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ConnectionFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .unwrap_or_default()
        .to_string())
}

/// `{your_password}` style templates left in a credential.
fn has_password_placeholder(url: &str) -> bool {
    let mut rest = url;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            return false;
        };
        if after[..close].to_ascii_lowercase().contains("password") {
            return true;
        }
        rest = &after[close + 1..];
    }
    false
}
