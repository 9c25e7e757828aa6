//! Outward reporting channel to the control plane.
//!
//! Pod status and the node descriptor are published as idempotent upserts
//! keyed by identity, so resending an unchanged document is harmless:
//! - `PUT /v1/nodes/{node}` for the node descriptor
//! - `PUT /v1/nodes/{node}/pods/{namespace}/{name}/status` for pod status
//! - `DELETE /v1/nodes/{node}/pods/{namespace}/{name}` once a pod is gone

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::config::Config;
use crate::node::NodeDescriptor;
use crate::pod::{PodKey, PodStatus};

/// Pod status as published to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatusReport {
    pub namespace: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    pub status: PodStatus,
}

/// Destination for status and node updates.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn upsert_pod_status(&self, report: &PodStatusReport) -> Result<()>;

    async fn remove_pod(&self, key: &PodKey) -> Result<()>;

    async fn upsert_node(&self, node: &NodeDescriptor) -> Result<()>;
}

// =============================================================================
// HTTP Client
// =============================================================================

/// Control plane API client.
pub struct ControlPlaneClient {
    client: reqwest::Client,
    base_url: String,
    node_name: String,
}

impl ControlPlaneClient {
    pub fn new(base_url: impl Into<String>, node_name: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            node_name: node_name.into(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(&config.control_plane_url, &config.node_name)
    }

    fn node_url(&self) -> String {
        format!("{}/v1/nodes/{}", self.base_url, self.node_name)
    }

    fn pod_url(&self, namespace: &str, name: &str) -> String {
        format!("{}/pods/{}/{}", self.node_url(), namespace, name)
    }
}

#[async_trait]
impl StatusSink for ControlPlaneClient {
    async fn upsert_pod_status(&self, report: &PodStatusReport) -> Result<()> {
        let url = format!("{}/status", self.pod_url(&report.namespace, &report.name));
        debug!(
            namespace = %report.namespace,
            name = %report.name,
            phase = %report.status.phase,
            "Reporting pod status"
        );

        let response = self.client.put(&url).json(report).send().await?;

        if !response.status().is_success() {
            let status_code = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status_code, body = %body, "Failed to report pod status");
            anyhow::bail!("Failed to report pod status: {} - {}", status_code, body);
        }

        Ok(())
    }

    async fn remove_pod(&self, key: &PodKey) -> Result<()> {
        let url = self.pod_url(&key.namespace, &key.name);
        debug!(pod = %key, "Reporting pod removal");

        let response = self.client.delete(&url).send().await?;

        // Already gone counts as removed.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        if !response.status().is_success() {
            let status_code = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status_code, body = %body, "Failed to report pod removal");
            anyhow::bail!("Failed to report pod removal: {} - {}", status_code, body);
        }

        Ok(())
    }

    async fn upsert_node(&self, node: &NodeDescriptor) -> Result<()> {
        let response = self
            .client
            .put(self.node_url())
            .json(node)
            .timeout(Duration::from_secs(5))
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("Node update failed with status: {}", response.status());
        }

        Ok(())
    }
}

// =============================================================================
// In-Process Sink
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    PodStatus(PodStatusReport),
    PodRemoved(PodKey),
    Node(NodeDescriptor),
}

/// Sink that forwards every update over a channel.
///
/// Used when the agent is embedded in-process and by tests, which can make it
/// fail on demand to exercise redelivery, or stall to stand in for a control
/// plane that never answers.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
    failing: AtomicBool,
    stalled: AtomicBool,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                failing: AtomicBool::new(false),
                stalled: AtomicBool::new(false),
            },
            rx,
        )
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// While stalled, every publication blocks forever.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    async fn send(&self, event: SinkEvent) -> Result<()> {
        if self.stalled.load(Ordering::SeqCst) {
            futures_util::future::pending::<()>().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("sink unavailable");
        }
        self.tx
            .send(event)
            .map_err(|_| anyhow::anyhow!("sink receiver dropped"))
    }
}

#[async_trait]
impl StatusSink for ChannelSink {
    async fn upsert_pod_status(&self, report: &PodStatusReport) -> Result<()> {
        self.send(SinkEvent::PodStatus(report.clone())).await
    }

    async fn remove_pod(&self, key: &PodKey) -> Result<()> {
        self.send(SinkEvent::PodRemoved(key.clone())).await
    }

    async fn upsert_node(&self, node: &NodeDescriptor) -> Result<()> {
        self.send(SinkEvent::Node(node.clone())).await
    }
}
