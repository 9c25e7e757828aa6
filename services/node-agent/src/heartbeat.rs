//! Node advertisement loop.
//!
//! On every tick the advertiser:
//! - Probes the backend and derives the Ready condition from it
//! - Recomputes allocatable resources
//! - Publishes the node descriptor through the status sink
//!
//! Ready stays true through short backend outages and flips to false only
//! once the backend has been unreachable for longer than the grace period.
//! Before the first successful probe the node is not Ready.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backend::with_deadline;
use crate::client::StatusSink;
use crate::node::{NodeConditionType, NodeDescriptor};
use crate::pod::ConditionStatus;
use crate::pods::PodManager;

struct AdvertiserState {
    descriptor: NodeDescriptor,
    last_backend_ok: Option<Instant>,
}

/// Maintains the node descriptor.
pub struct NodeAdvertiser {
    pods: Arc<PodManager>,
    grace_period: Duration,
    state: Mutex<AdvertiserState>,
}

impl NodeAdvertiser {
    pub fn new(pods: Arc<PodManager>, descriptor: NodeDescriptor, grace_period: Duration) -> Self {
        Self {
            pods,
            grace_period,
            state: Mutex::new(AdvertiserState {
                descriptor,
                last_backend_ok: None,
            }),
        }
    }

    /// Latest descriptor without probing.
    pub async fn descriptor(&self) -> NodeDescriptor {
        self.state.lock().await.descriptor.clone()
    }

    /// Probe, recompute, and return the descriptor to publish.
    pub async fn tick(&self) -> NodeDescriptor {
        let backend = self.pods.backend();
        let timeout = self.pods.settings().backend_timeout;
        let probe = with_deadline(timeout, "ping", backend.ping()).await;
        let allocatable = self.pods.allocatable().await;

        let now = Instant::now();
        let wall = Utc::now();
        let mut state = self.state.lock().await;
        let was_ready = state.descriptor.is_ready();

        if probe.is_ok() {
            state.last_backend_ok = Some(now);
        }
        let within_grace = state
            .last_backend_ok
            .is_some_and(|ok| now.duration_since(ok) <= self.grace_period);

        let descriptor = &mut state.descriptor;
        descriptor.touch(wall);
        descriptor.allocatable = allocatable;

        match (&probe, within_grace) {
            (Ok(()), _) => {
                descriptor.set_condition(
                    NodeConditionType::Ready,
                    ConditionStatus::True,
                    "KubeletReady",
                    "kubelet is ready.",
                    wall,
                );
            }
            (Err(e), true) => {
                debug!(backend = backend.name(), error = %e, "Backend probe failed within grace period");
            }
            (Err(e), false) => {
                let message = format!("backend {} unreachable: {e}", backend.name());
                descriptor.set_condition(
                    NodeConditionType::Ready,
                    ConditionStatus::False,
                    "BackendUnreachable",
                    &message,
                    wall,
                );
            }
        }

        let ready = descriptor.is_ready();
        if ready != was_ready {
            if ready {
                info!(node = %descriptor.name, "Node is ready");
            } else {
                warn!(node = %descriptor.name, "Node is not ready, backend unreachable");
            }
        }

        descriptor.clone()
    }
}

/// Run the heartbeat loop until shutdown.
pub async fn run_heartbeat_loop(
    advertiser: Arc<NodeAdvertiser>,
    sink: Arc<dyn StatusSink>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!(
        interval_secs = interval.as_secs(),
        "Starting heartbeat loop"
    );

    let mut consecutive_failures = 0u32;
    let mut interval_timer = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                let descriptor = advertiser.tick().await;

                match sink.upsert_node(&descriptor).await {
                    Ok(()) => {
                        consecutive_failures = 0;
                        debug!(
                            ready = descriptor.is_ready(),
                            allocatable_cpu = %descriptor.allocatable.cpu,
                            "Node status published"
                        );
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures <= 3 {
                            warn!(
                                error = %e,
                                consecutive_failures,
                                "Node status publication failed"
                            );
                        } else {
                            error!(
                                error = %e,
                                consecutive_failures,
                                "Node status publication failed repeatedly"
                            );
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Heartbeat loop shutting down");
                    break;
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::pods::PodSettings;

    fn advertiser(backend: Arc<MockBackend>, grace: Duration) -> NodeAdvertiser {
        let settings = PodSettings::default();
        let descriptor = NodeDescriptor::new(
            "vk-node",
            "mock",
            settings.capacity,
            settings.capacity,
            None,
            10250,
        );
        let pods = Arc::new(PodManager::new(backend, settings));
        NodeAdvertiser::new(pods, descriptor, grace)
    }

    #[tokio::test]
    async fn test_not_ready_before_first_successful_probe() {
        let backend = Arc::new(MockBackend::new());
        backend.set_reachable(false);
        let advertiser = advertiser(backend.clone(), Duration::from_secs(30));

        let node = advertiser.tick().await;
        assert!(!node.is_ready());
        let ready = node.condition(NodeConditionType::Ready).unwrap();
        assert_eq!(ready.reason, "BackendUnreachable");

        backend.set_reachable(true);
        assert!(advertiser.tick().await.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_survives_outage_within_grace() {
        let backend = Arc::new(MockBackend::new());
        let advertiser = advertiser(backend.clone(), Duration::from_secs(30));
        assert!(advertiser.tick().await.is_ready());

        backend.set_reachable(false);
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(advertiser.tick().await.is_ready());

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(!advertiser.tick().await.is_ready());
    }
}
