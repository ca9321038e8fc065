//! Enrichment, replication and run orchestration.

mod config;
mod notify;
mod orchestrator;
mod pool;
mod report;
pub mod store;
mod writer;

pub use config::{ConfigError, SyncConfig};
pub use notify::{
    CompletionSummary, FanoutNotifier, Notifier, NotifyEvent, ProgressSnapshot, RateLimited,
    TracingNotifier, WebhookNotifier,
};
pub use orchestrator::{
    cleanup_lock_errors, clear_replica, needs_processing, Orchestrator, RunOptions, RunOutcome,
    RunPhase, LOCK_CLEANUP_BATCH,
};
pub use pool::{
    BatchContext, BatchEnrichment, EnrichmentPool, EnrichmentStats, MISSING_ID_ERROR,
    NO_STORE_ERROR, PREVIOUSLY_FETCHED,
};
pub use report::{write_reports, RunReport, SourceReport, SourceStatus};
pub use store::{MemoryReplicaStore, PgReplicaStore, ReplicaRow, ReplicaStore, StoreError};
pub use writer::{dedupe_rows, ReplicationWriter, RowFailure, WriteReport};

pub const CRATE_NAME: &str = "tsync-sync";
