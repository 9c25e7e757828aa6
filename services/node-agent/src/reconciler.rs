//! Reconciliation loop.
//!
//! The reconciler:
//! - Consumes desired-state events from the control plane
//! - Folds backend observation batches into pod status
//! - Periodically retries pods whose start never reached the backend
//! - Reports status transitions and removals back to the control plane
//!
//! Each event is handled on its own task, so a slow backend call for one pod
//! never delays observations or events for another. Reports go out from a
//! separate reporter task, so a slow control plane never delays either.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::observe;
use crate::client::{PodStatusReport, StatusSink};
use crate::error::ProviderError;
use crate::pod::{PodKey, PodSpec};
use crate::pods::PodManager;

pub type Reply = oneshot::Sender<Result<(), ProviderError>>;

/// A desired-state change delivered by the control plane.
///
/// Delivery is at-least-once and possibly out of order, so every upsert is
/// treated as "apply this spec now", never as a diff. `Update` is the same
/// but refuses pods the agent does not track.
#[derive(Debug)]
pub enum PodEvent {
    Upsert { spec: PodSpec, reply: Option<Reply> },
    Update { spec: PodSpec, reply: Option<Reply> },
    Delete { key: PodKey, reply: Option<Reply> },
}

impl PodEvent {
    pub fn upsert(spec: PodSpec) -> Self {
        PodEvent::Upsert { spec, reply: None }
    }

    pub fn delete(key: PodKey) -> Self {
        PodEvent::Delete { key, reply: None }
    }
}

/// Reconciliation loop configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Poll interval for backends without native subscriptions.
    pub observe_interval: Duration,

    /// Interval between retries of stalled pods and failed reports.
    pub resync_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            observe_interval: Duration::from_secs(2),
            resync_interval: Duration::from_secs(30),
        }
    }
}

pub struct Reconciler {
    pods: Arc<PodManager>,
    sink: Arc<dyn StatusSink>,
    config: ReconcilerConfig,
}

fn log_failure(op: &str, pod: &PodKey, err: &ProviderError) {
    match err {
        ProviderError::AdmissionRejected { .. } | ProviderError::NotFound(_) => {
            info!(pod = %pod, op, error = %err, "Pod event refused");
        }
        ProviderError::BackendUnavailable(_) | ProviderError::QuotaExceeded(_) => {
            warn!(pod = %pod, op, error = %err, "Pod event failed, will retry");
        }
        _ => {
            error!(pod = %pod, op, error = %err, "Pod event failed");
        }
    }
}

impl Reconciler {
    pub fn new(pods: Arc<PodManager>, sink: Arc<dyn StatusSink>, config: ReconcilerConfig) -> Self {
        Self { pods, sink, config }
    }

    /// Run until shutdown.
    pub async fn run(&self, mut events: mpsc::Receiver<PodEvent>, mut shutdown: watch::Receiver<bool>) {
        info!(
            observe_interval_ms = self.config.observe_interval.as_millis() as u64,
            resync_interval_secs = self.config.resync_interval.as_secs(),
            backend = self.pods.backend().name(),
            "Starting reconciliation loop"
        );

        let reporter = tokio::spawn(
            self.reporter()
                .run(self.config.resync_interval, shutdown.clone()),
        );

        let backend = Arc::clone(self.pods.backend());
        let mut observations = observe(Arc::clone(&backend), self.config.observe_interval);
        let mut resync_interval = tokio::time::interval(self.config.resync_interval);
        let mut resync_task: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    self.dispatch(event);
                }
                batch = observations.next() => match batch {
                    Some(batch) => {
                        let changed = self.pods.apply_observations(&batch).await;
                        if changed > 0 {
                            debug!(changed, "Applied backend observations");
                        }
                    }
                    None => {
                        warn!("Observation stream ended, resubscribing");
                        observations = observe(Arc::clone(&backend), self.config.observe_interval);
                    }
                },
                _ = resync_interval.tick() => {
                    if resync_task.as_ref().is_none_or(|t| t.is_finished()) {
                        let pods = Arc::clone(&self.pods);
                        resync_task = Some(tokio::spawn(async move {
                            let retried = pods.resync().await;
                            if retried > 0 {
                                debug!(retried, "Resync retried stalled pods");
                            }
                        }));
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        }

        if let Some(task) = resync_task {
            task.abort();
        }
        // Unsent reports stay pending.
        reporter.abort();
    }

    fn reporter(&self) -> Reporter {
        Reporter {
            pods: Arc::clone(&self.pods),
            sink: Arc::clone(&self.sink),
        }
    }

    /// Handle one event on its own task.
    pub fn dispatch(&self, event: PodEvent) {
        let pods = Arc::clone(&self.pods);
        tokio::spawn(async move {
            match event {
                PodEvent::Upsert { spec, reply } => {
                    let key = spec.key();
                    let result = pods.create(spec).await;
                    if let Err(e) = &result {
                        log_failure("upsert", &key, e);
                    }
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                }
                PodEvent::Update { spec, reply } => {
                    let key = spec.key();
                    let result = pods.update(spec).await;
                    if let Err(e) = &result {
                        log_failure("update", &key, e);
                    }
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                }
                PodEvent::Delete { key, reply } => {
                    let result = pods.delete(&key).await;
                    if let Err(e) = &result {
                        log_failure("delete", &key, e);
                    }
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                }
            }
        });
    }

    /// Publish removals and unreported status transitions.
    ///
    /// Failed publications stay pending and are retried on the next pass.
    pub async fn report_pending(&self) -> usize {
        self.reporter().report_pending().await
    }
}

/// Publishes pod status upstream, off the reconciliation loop.
struct Reporter {
    pods: Arc<PodManager>,
    sink: Arc<dyn StatusSink>,
}

impl Reporter {
    /// Report on every change notification, and on `interval` to retry
    /// publications that failed.
    async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut retry = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = self.pods.wait_changed() => {}
                _ = retry.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            self.report_pending().await;
        }
    }

    async fn report_pending(&self) -> usize {
        let mut reported = 0;

        let removed = self.pods.take_removed().await;
        let mut failed = Vec::new();
        for key in removed {
            match self.sink.remove_pod(&key).await {
                Ok(()) => reported += 1,
                Err(e) => {
                    warn!(pod = %key, error = %e, "Failed to report pod removal");
                    failed.push(key);
                }
            }
        }
        if !failed.is_empty() {
            self.pods.requeue_removed(failed).await;
        }

        for pending in self.pods.pending_status_reports().await {
            let report = PodStatusReport {
                namespace: pending.key.namespace.clone(),
                name: pending.key.name.clone(),
                uid: pending.uid,
                status: pending.status,
            };
            match self.sink.upsert_pod_status(&report).await {
                Ok(()) => {
                    self.pods
                        .mark_status_reported(&pending.key, pending.revision)
                        .await;
                    reported += 1;
                }
                Err(e) => {
                    warn!(pod = %pending.key, error = %e, "Failed to report pod status");
                }
            }
        }

        reported
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::client::{ChannelSink, SinkEvent};
    use crate::pod::ContainerSpec;
    use crate::pods::PodSettings;

    #[tokio::test]
    async fn test_report_pending_only_sends_transitions() {
        let backend = Arc::new(MockBackend::new());
        let pods = Arc::new(PodManager::new(backend, PodSettings::default()));
        let (sink, mut rx) = ChannelSink::new();
        let reconciler = Reconciler::new(pods.clone(), Arc::new(sink), ReconcilerConfig::default());

        pods.create(PodSpec::new(
            "default",
            "a",
            vec![ContainerSpec::new("app", "app:v1")],
        ))
        .await
        .unwrap();

        assert_eq!(reconciler.report_pending().await, 1);
        assert!(matches!(rx.try_recv(), Ok(SinkEvent::PodStatus(_))));
        assert_eq!(reconciler.report_pending().await, 0);
    }

    #[tokio::test]
    async fn test_failed_reports_are_retried() {
        let backend = Arc::new(MockBackend::new());
        let pods = Arc::new(PodManager::new(backend, PodSettings::default()));
        let (sink, mut rx) = ChannelSink::new();
        let sink = Arc::new(sink);
        let reconciler = Reconciler::new(pods.clone(), sink.clone(), ReconcilerConfig::default());

        pods.create(PodSpec::new(
            "default",
            "a",
            vec![ContainerSpec::new("app", "app:v1")],
        ))
        .await
        .unwrap();

        sink.set_failing(true);
        assert_eq!(reconciler.report_pending().await, 0);
        sink.set_failing(false);
        assert_eq!(reconciler.report_pending().await, 1);
        assert!(matches!(rx.try_recv(), Ok(SinkEvent::PodStatus(_))));
    }
}
