//! Operational notifications. Delivery is best effort: no notifier failure reaches the run.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tsync_core::{ErrorKind, RunStatus};
use uuid::Uuid;

const WEBHOOK_QUEUE: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub sources_done: u64,
    pub sources_total: u64,
    pub records: u64,
    pub fetch_success: u64,
    pub fetch_failures: u64,
    pub records_per_sec: f64,
    pub eta_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionSummary {
    pub session_id: Uuid,
    pub status: RunStatus,
    pub databases_found: u64,
    pub databases_processed: u64,
    pub databases_failed: u64,
    pub records_processed: u64,
    pub fetch_success_rate: f64,
    pub write_success_rate: f64,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotifyEvent {
    RunStarted {
        session_id: Uuid,
        source_ip: String,
        scan_root: String,
    },
    Progress(ProgressSnapshot),
    Error {
        kind: ErrorKind,
        message: String,
        context: BTreeMap<String, String>,
    },
    RunCompleted(CompletionSummary),
}

impl NotifyEvent {
    pub fn name(&self) -> &'static str {
        match self {
            NotifyEvent::RunStarted { .. } => "run_started",
            NotifyEvent::Progress(_) => "progress",
            NotifyEvent::Error { .. } => "error",
            NotifyEvent::RunCompleted(_) => "run_completed",
        }
    }

    /// Flat key/value view used by text sinks.
    pub fn fields(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        let mut put = |k: &str, v: String| {
            out.insert(k.to_string(), v);
        };
        match self {
            NotifyEvent::RunStarted {
                session_id,
                source_ip,
                scan_root,
            } => {
                put("session_id", session_id.to_string());
                put("source_ip", source_ip.clone());
                put("scan_root", scan_root.clone());
            }
            NotifyEvent::Progress(p) => {
                put("sources", format!("{}/{}", p.sources_done, p.sources_total));
                put("records", p.records.to_string());
                put("fetch_success", p.fetch_success.to_string());
                put("fetch_failures", p.fetch_failures.to_string());
                put("records_per_sec", format!("{:.1}", p.records_per_sec));
                if let Some(eta) = p.eta_secs {
                    put("eta_secs", eta.to_string());
                }
            }
            NotifyEvent::Error {
                kind,
                message,
                context,
            } => {
                put("kind", kind.as_str().to_string());
                put("message", message.clone());
                for (k, v) in context {
                    put(k, v.clone());
                }
            }
            NotifyEvent::RunCompleted(s) => {
                put("session_id", s.session_id.to_string());
                put("status", s.status.as_str().to_string());
                put(
                    "databases",
                    format!("{}/{}", s.databases_processed, s.databases_found),
                );
                put("databases_failed", s.databases_failed.to_string());
                put("records", s.records_processed.to_string());
                put("fetch_success_rate", format!("{:.1}%", s.fetch_success_rate));
                put("write_success_rate", format!("{:.1}%", s.write_success_rate));
                put("elapsed_secs", format!("{:.1}", s.elapsed_secs));
            }
        }
        out
    }

    pub fn text(&self) -> String {
        let body = self
            .fields()
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        format!("[tsync] {} {body}", self.name())
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: NotifyEvent);

    /// Deliver anything still queued. Called once during run cleanup.
    async fn flush(&self) {}
}

#[async_trait]
impl<N: Notifier + ?Sized> Notifier for Arc<N> {
    async fn notify(&self, event: NotifyEvent) {
        (**self).notify(event).await;
    }

    async fn flush(&self) {
        (**self).flush().await;
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, event: NotifyEvent) {
        match &event {
            NotifyEvent::Error { .. } => error!(target: "tsync::notify", "{}", event.text()),
            _ => info!(target: "tsync::notify", "{}", event.text()),
        }
    }
}

/// Drops progress events that arrive within `interval` of the last one delivered.
pub struct RateLimited<N> {
    inner: N,
    interval: Duration,
    last_progress: std::sync::Mutex<Option<Instant>>,
}

impl<N: Notifier> RateLimited<N> {
    pub fn new(inner: N, interval: Duration) -> Self {
        Self {
            inner,
            interval,
            last_progress: std::sync::Mutex::new(None),
        }
    }

    fn admit_progress(&self) -> bool {
        let mut last = self
            .last_progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

#[async_trait]
impl<N: Notifier> Notifier for RateLimited<N> {
    async fn notify(&self, event: NotifyEvent) {
        if matches!(event, NotifyEvent::Progress(_)) && !self.admit_progress() {
            return;
        }
        self.inner.notify(event).await;
    }

    async fn flush(&self) {
        self.inner.flush().await;
    }
}

#[derive(Default)]
pub struct FanoutNotifier {
    sinks: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn Notifier>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn notify(&self, event: NotifyEvent) {
        for sink in &self.sinks {
            sink.notify(event.clone()).await;
        }
    }

    async fn flush(&self) {
        for sink in &self.sinks {
            sink.flush().await;
        }
    }
}

/// Posts each event as JSON from a background task. A full queue drops the event.
pub struct WebhookNotifier {
    tx: Mutex<Option<mpsc::Sender<NotifyEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WebhookNotifier {
    pub fn spawn(client: reqwest::Client, url: impl Into<String>) -> Self {
        let url = url.into();
        let (tx, mut rx) = mpsc::channel::<NotifyEvent>(WEBHOOK_QUEUE);
        let worker = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let payload = serde_json::json!({
                    "text": event.text(),
                    "event": &event,
                });
                match client.post(&url).json(&payload).send().await {
                    Ok(resp) if resp.status().is_success() => {}
                    Ok(resp) => warn!(status = %resp.status(), event = event.name(), "webhook rejected notification"),
                    Err(err) => warn!(error = %err, event = event.name(), "webhook delivery failed"),
                }
            }
        });
        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: NotifyEvent) {
        let guard = self.tx.lock().await;
        let Some(tx) = guard.as_ref() else {
            return;
        };
        if let Err(err) = tx.try_send(event) {
            warn!(error = %err, "notification queue full, dropping event");
        }
    }

    async fn flush(&self) {
        self.tx.lock().await.take();
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(err) = worker.await {
                warn!(error = %err, "webhook worker ended abnormally");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Captures every event it receives.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub events: std::sync::Mutex<Vec<NotifyEvent>>,
    }

    impl RecordingNotifier {
        pub fn names(&self) -> Vec<&'static str> {
            self.events
                .lock()
                .expect("events")
                .iter()
                .map(NotifyEvent::name)
                .collect()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, event: NotifyEvent) {
            self.events.lock().expect("events").push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingNotifier;
    use super::*;

    fn progress(done: u64) -> NotifyEvent {
        NotifyEvent::Progress(ProgressSnapshot {
            sources_done: done,
            sources_total: 10,
            records: done * 100,
            fetch_success: done * 90,
            fetch_failures: done * 10,
            records_per_sec: 12.5,
            eta_secs: Some(30),
        })
    }

    #[tokio::test]
    async fn progress_inside_interval_is_dropped() {
        let recorder = Arc::new(RecordingNotifier::default());
        let limited = RateLimited::new(recorder.clone(), Duration::from_secs(300));
        limited.notify(progress(1)).await;
        limited.notify(progress(2)).await;
        limited
            .notify(NotifyEvent::Error {
                kind: ErrorKind::Database,
                message: "connection reset".into(),
                context: BTreeMap::new(),
            })
            .await;
        assert_eq!(recorder.names(), vec!["progress", "error"]);
    }

    #[tokio::test]
    async fn zero_interval_admits_every_progress() {
        let recorder = Arc::new(RecordingNotifier::default());
        let limited = RateLimited::new(recorder.clone(), Duration::ZERO);
        limited.notify(progress(1)).await;
        limited.notify(progress(2)).await;
        assert_eq!(recorder.names().len(), 2);
    }

    #[test]
    fn fields_flatten_error_context() {
        let mut context = BTreeMap::new();
        context.insert("db_path".to_string(), "/n/a/Rubix/rubix.db".to_string());
        let event = NotifyEvent::Error {
            kind: ErrorKind::System,
            message: "disk full".into(),
            context,
        };
        let fields = event.fields();
        assert_eq!(fields.get("kind").map(String::as_str), Some("system"));
        assert_eq!(
            fields.get("db_path").map(String::as_str),
            Some("/n/a/Rubix/rubix.db")
        );
        assert!(event.text().starts_with("[tsync] error "));
    }

    #[test]
    fn events_serialize_with_tag() {
        let value = serde_json::to_value(progress(3)).expect("json");
        assert_eq!(value["event"], "progress");
        assert_eq!(value["sources_done"], 3);
    }

    #[tokio::test]
    async fn webhook_flush_without_server_does_not_fail() {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(200))
            .build()
            .expect("client");
        let hook = WebhookNotifier::spawn(client, "http://127.0.0.1:9/hook");
        hook.notify(progress(1)).await;
        hook.flush().await;
        hook.notify(progress(2)).await;
    }
}
