//! Discovery of node databases and per-node resolution of the content store and binary.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};
use tsync_core::{ResolvedPaths, SourceDatabase, StoreMap};
use tsync_storage::{CommandRunner, CommandSpec};
use walkdir::WalkDir;

pub const STORE_DIR_NAME: &str = ".ipfs";
pub const STORE_MARKERS: [&str; 5] = ["config", "datastore", "keystore", "blocks", "version"];
pub const BINARY_NAME: &str = "ipfs";
pub const PLATFORM_BINARY: &str = "rubixgoplatform";
pub const SYSTEM_BINARY_PATHS: [&str; 3] = ["/usr/local/bin/ipfs", "/usr/bin/ipfs", "/bin/ipfs"];
pub const MAX_WALK_LEVELS: usize = 10;

const DB_DIR_NAME: &str = "Rubix";
const DB_FILE_NAME: &str = "rubix.db";
const VALIDATE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("scan root {path} is not accessible: {source}")]
    Root {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("scan root {0} is not a directory")]
    NotADirectory(PathBuf),
}

/// Find every `Rubix/rubix.db` below `root`, sorted by path.
///
/// An inaccessible root is fatal; unreadable subdirectories are skipped with a warning.
pub fn discover(root: &Path) -> Result<Vec<SourceDatabase>, DiscoveryError> {
    let meta = std::fs::metadata(root).map_err(|source| DiscoveryError::Root {
        path: root.to_path_buf(),
        source,
    })?;
    if !meta.is_dir() {
        return Err(DiscoveryError::NotADirectory(root.to_path_buf()));
    }

    let mut found = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "skipping unreadable path during discovery");
                continue;
            }
        };
        if !entry.file_type().is_file() || entry.file_name() != DB_FILE_NAME {
            continue;
        }
        let in_db_dir = entry
            .path()
            .parent()
            .and_then(Path::file_name)
            .is_some_and(|name| name == DB_DIR_NAME);
        if !in_db_dir {
            continue;
        }

        let modified = match entry.metadata().ok().and_then(|m| m.modified().ok()) {
            Some(ts) => DateTime::<Utc>::from(ts),
            None => {
                warn!(path = %entry.path().display(), "no modification time; skipping");
                continue;
            }
        };
        let path = std::fs::canonicalize(entry.path()).unwrap_or_else(|_| entry.path().to_path_buf());
        found.push(SourceDatabase::new(path, modified));
    }

    found.sort_by(|a, b| a.path.cmp(&b.path));
    info!(root = %root.display(), count = found.len(), "discovered source databases");
    Ok(found)
}

fn ancestors_of(db_path: &Path) -> impl Iterator<Item = &Path> {
    db_path.parent().into_iter().flat_map(Path::ancestors).take(MAX_WALK_LEVELS)
}

fn looks_like_store(dir: &Path) -> bool {
    dir.is_dir() && STORE_MARKERS.iter().any(|marker| dir.join(marker).exists())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Resolves stores and binaries per source; binaries are validated by running them.
pub struct SourceLocator {
    runner: Arc<dyn CommandRunner>,
    cwd: Option<PathBuf>,
    home: Option<PathBuf>,
    system_paths: Vec<PathBuf>,
}

impl SourceLocator {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            cwd: std::env::current_dir().ok(),
            home: dirs::home_dir(),
            system_paths: SYSTEM_BINARY_PATHS.iter().map(PathBuf::from).collect(),
        }
    }

    pub fn with_fallback_dirs(mut self, cwd: Option<PathBuf>, home: Option<PathBuf>) -> Self {
        self.cwd = cwd;
        self.home = home;
        self
    }

    pub fn with_system_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.system_paths = paths;
        self
    }

    /// Nearest `.ipfs` directory that carries a store marker, walking up from the database.
    pub fn resolve_store(&self, db_path: &Path) -> Option<PathBuf> {
        if let Some(found) = ancestors_of(db_path)
            .map(|level| level.join(STORE_DIR_NAME))
            .find(|candidate| looks_like_store(candidate))
        {
            return Some(found);
        }

        let node_dir = db_path.parent().and_then(Path::parent);
        [node_dir.map(Path::to_path_buf), self.cwd.clone(), self.home.clone()]
            .into_iter()
            .flatten()
            .map(|dir| dir.join(STORE_DIR_NAME))
            .find(|candidate| looks_like_store(candidate))
    }

    /// Nearest working binary. Candidates beside the platform executable are tried first.
    pub async fn resolve_binary(&self, db_path: &Path) -> Option<(PathBuf, bool)> {
        let mut candidates: Vec<(PathBuf, bool)> = ancestors_of(db_path)
            .filter_map(|level| {
                let candidate = level.join(BINARY_NAME);
                is_executable(&candidate)
                    .then(|| (candidate, level.join(PLATFORM_BINARY).is_file()))
            })
            .collect();
        candidates.sort_by_key(|(_, beside_platform)| !*beside_platform);

        for (candidate, beside_platform) in candidates {
            if self.validate_binary(&candidate).await {
                return Some((candidate, beside_platform));
            }
            debug!(binary = %candidate.display(), "candidate binary failed validation");
        }

        for candidate in &self.system_paths {
            if is_executable(candidate) && self.validate_binary(candidate).await {
                return Some((candidate.clone(), false));
            }
        }
        None
    }

    /// `ipfs` from `PATH` when it validates, otherwise the bare name.
    pub async fn default_binary(&self) -> PathBuf {
        if let Ok(found) = which::which(BINARY_NAME) {
            if self.validate_binary(&found).await {
                return found;
            }
        }
        PathBuf::from(BINARY_NAME)
    }

    pub async fn validate_binary(&self, binary: &Path) -> bool {
        let spec = CommandSpec::new(binary, VALIDATE_TIMEOUT).arg("version");
        matches!(self.runner.run(&spec).await, Ok(out) if out.success)
    }

    pub async fn resolve(&self, db_path: &Path) -> ResolvedPaths {
        let store = self.resolve_store(db_path);
        let (binary, binary_beside_platform) = match self.resolve_binary(db_path).await {
            Some((path, beside)) => (Some(path), beside),
            None => (None, false),
        };
        ResolvedPaths {
            store,
            binary,
            binary_beside_platform,
        }
    }

    /// Resolve every source once and log how stores are shared across nodes.
    pub async fn build_store_map(&self, sources: &[SourceDatabase]) -> StoreMap {
        let mut map = StoreMap::new();
        for source in sources {
            let resolved = self.resolve(&source.path).await;
            debug!(
                node = %source.node_name,
                store = ?resolved.store,
                binary = ?resolved.binary,
                "resolved source paths"
            );
            map.insert(source.path.clone(), resolved);
        }

        let mut nodes_per_store: BTreeMap<&Path, usize> = BTreeMap::new();
        for resolved in map.values() {
            if let Some(store) = &resolved.store {
                *nodes_per_store.entry(store.as_path()).or_default() += 1;
            }
        }
        let with_store = map.values().filter(|r| r.store.is_some()).count();
        let with_binary = map.values().filter(|r| r.binary.is_some()).count();
        info!(
            sources = map.len(),
            with_store,
            without_store = map.len() - with_store,
            with_binary,
            unique_stores = nodes_per_store.len(),
            "store mapping complete"
        );
        for (store, nodes) in nodes_per_store.iter().filter(|(_, n)| **n > 1) {
            info!(store = %store.display(), nodes, "store shared by several nodes");
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::tempdir;
    use tsync_storage::{CommandOutput, RunError};

    /// Succeeds only for binaries in `working`; records every call.
    struct VersionRunner {
        working: Vec<PathBuf>,
        calls: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl CommandRunner for VersionRunner {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunError> {
            self.calls.lock().expect("calls").push(spec.program.clone());
            Ok(CommandOutput {
                success: self.working.contains(&spec.program),
                ..CommandOutput::default()
            })
        }
    }

    fn locator(working: Vec<PathBuf>) -> SourceLocator {
        SourceLocator::new(Arc::new(VersionRunner {
            working,
            calls: Mutex::new(Vec::new()),
        }))
        .with_fallback_dirs(None, None)
        .with_system_paths(Vec::new())
    }

    fn make_db(root: &Path, node: &str) -> PathBuf {
        let dir = root.join(node).join("Rubix");
        std::fs::create_dir_all(&dir).expect("mkdir");
        let db = dir.join("rubix.db");
        std::fs::write(&db, b"").expect("db");
        db
    }

    #[cfg(unix)]
    fn make_executable(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        std::fs::write(path, b"#!/bin/sh\n").expect("write");
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    }

    #[test]
    fn discover_finds_only_rubix_databases_sorted() {
        let root = tempdir().expect("tempdir");
        make_db(root.path(), "node2");
        make_db(root.path(), "node1");
        std::fs::write(root.path().join("rubix.db"), b"").expect("stray");
        std::fs::create_dir_all(root.path().join("node3/Other")).expect("mkdir");
        std::fs::write(root.path().join("node3/Other/rubix.db"), b"").expect("other");

        let found = discover(root.path()).expect("discover");
        let nodes: Vec<_> = found.iter().map(|s| s.node_name.as_str()).collect();
        assert_eq!(nodes, vec!["node1", "node2"]);
        assert!(found.iter().all(|s| s.path.is_absolute()));
    }

    #[test]
    fn discover_rejects_missing_root() {
        let err = discover(Path::new("/definitely/not/a/scan/root")).expect_err("missing");
        assert!(matches!(err, DiscoveryError::Root { .. }));
    }

    #[test]
    fn store_requires_marker_when_walking_up() {
        let root = tempdir().expect("tempdir");
        let db = make_db(root.path(), "node1");
        std::fs::create_dir_all(root.path().join("node1/Rubix/.ipfs")).expect("bare store");
        std::fs::create_dir_all(root.path().join(".ipfs/datastore")).expect("marked store");

        let store = locator(Vec::new()).resolve_store(&db).expect("store");
        assert_eq!(store, root.path().join(".ipfs"));
    }

    #[test]
    fn store_falls_back_to_home_only_when_marked() {
        let root = tempdir().expect("tempdir");
        let home = tempdir().expect("home");
        let db = make_db(root.path(), "node1");
        std::fs::create_dir_all(home.path().join(".ipfs")).expect("bare home store");

        let with_home = || {
            locator(Vec::new()).with_fallback_dirs(None, Some(home.path().to_path_buf()))
        };
        assert_eq!(with_home().resolve_store(&db), None);

        std::fs::write(home.path().join(".ipfs/config"), b"{}").expect("marker");
        assert_eq!(with_home().resolve_store(&db), Some(home.path().join(".ipfs")));
    }

    #[test]
    fn unmarked_node_store_is_rejected() {
        let root = tempdir().expect("tempdir");
        let db = make_db(root.path(), "node1");
        std::fs::create_dir_all(root.path().join("node1/.ipfs")).expect("bare store");
        assert_eq!(locator(Vec::new()).resolve_store(&db), None);
    }

    #[test]
    fn store_missing_everywhere_is_none() {
        let root = tempdir().expect("tempdir");
        let db = make_db(root.path(), "node1");
        assert_eq!(locator(Vec::new()).resolve_store(&db), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn binary_must_validate_and_prefers_platform_sibling() {
        let root = tempdir().expect("tempdir");
        let db = make_db(root.path(), "node1");
        let near = root.path().join("node1/Rubix/ipfs");
        let beside_platform = root.path().join("node1/ipfs");
        make_executable(&near);
        make_executable(&beside_platform);
        make_executable(&root.path().join("node1/rubixgoplatform"));

        let found = locator(vec![near.clone(), beside_platform.clone()])
            .resolve_binary(&db)
            .await
            .expect("binary");
        assert_eq!(found, (beside_platform, true));

        let found = locator(vec![near.clone()]).resolve_binary(&db).await.expect("binary");
        assert_eq!(found, (near, false));

        assert_eq!(locator(Vec::new()).resolve_binary(&db).await, None);
    }

    #[tokio::test]
    async fn store_map_has_one_entry_per_source() {
        let root = tempdir().expect("tempdir");
        make_db(root.path(), "node1");
        make_db(root.path(), "node2");
        std::fs::create_dir_all(root.path().join(".ipfs/config")).expect("shared store");
        let sources = discover(root.path()).expect("discover");
        let map = locator(Vec::new()).build_store_map(&sources).await;
        assert_eq!(map.len(), 2);
        assert!(map.values().all(|r| r.store.is_some() && r.binary.is_none()));
    }
}
