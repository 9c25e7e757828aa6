//! Backend adapter interface.
//!
//! A backend is whatever actually runs pod workloads: a cloud API, a batch
//! system, a simulator. The agent only talks to it through [`Backend`]:
//! - Start/stop/update workloads keyed by a deterministic [`BackendHandle`]
//! - Observe container states, by polling or native subscription
//! - Open byte streams for logs, exec, attach, and port-forward
//! - Sample per-container resource usage
//!
//! Transport failures are converted to [`BackendError`] inside the adapter
//! and never reach the reconciler raw.

pub mod mock;

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::warn;

use crate::pod::{ContainerRunState, ContainerSpec, PodKey, PodSpec, RestartPolicy};

pub use mock::MockBackend;

// =============================================================================
// Handles and Errors
// =============================================================================

/// Backend-side reference to a pod workload.
///
/// Derived from the pod identity alone, so a start retried after a transient
/// failure lands on the same workload instead of creating a second one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BackendHandle(String);

impl BackendHandle {
    pub fn for_pod(key: &PodKey) -> Self {
        let digest = Sha256::digest(key.to_string().as_bytes());
        Self(format!("vn-{}", hex::encode(&digest[..8])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

/// How a backend applies a changed pod spec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdatePolicy {
    /// Forward only the changed containers via [`Backend::update`].
    InPlace,
    /// Stop the workload and start it again with the new spec.
    Recreate,
    /// Record the new spec without touching the running workload.
    #[default]
    Ignore,
}

// =============================================================================
// Spec Delta
// =============================================================================

/// Difference between the last applied spec and the desired one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecDelta {
    /// Containers that are new or whose spec changed.
    pub changed: Vec<ContainerSpec>,
    /// Names of containers no longer desired.
    pub removed: Vec<String>,
    pub restart_policy: Option<RestartPolicy>,
}

impl SpecDelta {
    pub fn between(applied: &PodSpec, desired: &PodSpec) -> Self {
        let changed = desired
            .containers
            .iter()
            .filter(|c| applied.container(&c.name) != Some(*c))
            .cloned()
            .collect();
        let removed = applied
            .containers
            .iter()
            .filter(|c| desired.container(&c.name).is_none())
            .map(|c| c.name.clone())
            .collect();
        let restart_policy =
            (applied.restart_policy != desired.restart_policy).then_some(desired.restart_policy);

        Self {
            changed,
            removed,
            restart_policy,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty() && self.restart_policy.is_none()
    }
}

// =============================================================================
// Observations, Streams, Usage
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerObservation {
    pub name: String,
    pub state: ContainerRunState,
}

/// Latest known state of one backend workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub handle: BackendHandle,
    pub containers: Vec<ContainerObservation>,
    pub pod_ip: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogOptions {
    #[serde(default)]
    pub follow: bool,
    #[serde(default)]
    pub tail_lines: Option<usize>,
    #[serde(default)]
    pub since_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timestamps: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOptions {
    pub command: Vec<String>,
    pub tty: bool,
    pub stdin: bool,
}

/// A bidirectional byte channel to the backend.
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DuplexStream for T {}

pub type BoxedDuplex = Box<dyn DuplexStream>;

pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

pub type ObservationStream = Pin<Box<dyn Stream<Item = Vec<Observation>> + Send>>;

/// Point-in-time usage of one container. Unknown fields stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerUsage {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_nano_cores: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_working_set_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_rx_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_tx_bytes: Option<u64>,
}

// =============================================================================
// Backend Trait
// =============================================================================

/// Capability set every execution backend implements.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name, used in logs and the node taint.
    fn name(&self) -> &str;

    fn update_policy(&self) -> UpdatePolicy {
        UpdatePolicy::Ignore
    }

    /// Start the workload for `spec`. Must be idempotent per pod identity.
    async fn start(&self, spec: &PodSpec) -> Result<BackendHandle, BackendError>;

    /// Tear down a workload. Best-effort; `NotFound` means already gone.
    async fn stop(&self, handle: &BackendHandle) -> Result<(), BackendError>;

    /// Apply a spec delta in place. Only called under [`UpdatePolicy::InPlace`].
    async fn update(
        &self,
        _handle: &BackendHandle,
        _delta: &SpecDelta,
    ) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("update".to_string()))
    }

    /// Current state of every workload the backend knows about.
    async fn poll(&self) -> Result<Vec<Observation>, BackendError>;

    /// Native change notifications, if the backend has them.
    fn subscribe(&self) -> Option<ObservationStream> {
        None
    }

    /// Cheap reachability probe.
    async fn ping(&self) -> Result<(), BackendError>;

    async fn logs(
        &self,
        handle: &BackendHandle,
        container: &str,
        opts: &LogOptions,
    ) -> Result<ByteStream, BackendError>;

    async fn exec(
        &self,
        handle: &BackendHandle,
        container: &str,
        opts: &ExecOptions,
    ) -> Result<BoxedDuplex, BackendError>;

    async fn attach(
        &self,
        handle: &BackendHandle,
        container: &str,
    ) -> Result<BoxedDuplex, BackendError>;

    async fn port_forward(
        &self,
        handle: &BackendHandle,
        port: u16,
    ) -> Result<BoxedDuplex, BackendError>;

    async fn stats(&self, handle: &BackendHandle) -> Result<Vec<ContainerUsage>, BackendError>;
}

/// Lazy, restartable sequence of observation batches.
///
/// Uses the backend's subscription when it has one, otherwise polls every
/// `interval`. Poll failures are logged and skipped; the stream only ends if
/// a native subscription ends, in which case callers call `observe` again.
pub fn observe(backend: Arc<dyn Backend>, interval: Duration) -> ObservationStream {
    if let Some(subscription) = backend.subscribe() {
        return subscription;
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    Box::pin(stream::unfold(
        (backend, ticker),
        |(backend, mut ticker)| async move {
            loop {
                ticker.tick().await;
                match backend.poll().await {
                    Ok(batch) => return Some((batch, (backend, ticker))),
                    Err(e) => {
                        warn!(backend = backend.name(), error = %e, "Backend poll failed");
                    }
                }
            }
        },
    ))
}

/// Bound a backend call by `timeout`; an elapsed deadline counts as unavailable.
pub async fn with_deadline<T, F>(timeout: Duration, op: &str, fut: F) -> Result<T, BackendError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Unavailable(format!(
            "{op} timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}
