//! Virtual node agent.
//!
//! Registers a virtual node with the control plane and runs its pods on a
//! remote workload backend.
//!
//! ## Architecture
//!
//! - **Heartbeat Loop**: Publishes the node descriptor periodically
//! - **Reconciler**: Applies pod events and folds backend observations into status
//! - **HTTP Server**: Provider API, interactive streams, and usage stats
//! - **Backend**: Abstracts workload lifecycle (mock in dev)

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vnode_agent::backend::{Backend, MockBackend};
use vnode_agent::client::{ControlPlaneClient, StatusSink};
use vnode_agent::config::Config;
use vnode_agent::heartbeat::{self, NodeAdvertiser};
use vnode_agent::node::NodeDescriptor;
use vnode_agent::pods::PodManager;
use vnode_agent::reconciler::Reconciler;
use vnode_agent::server::{self, AppState};
use vnode_agent::stats::StatsExporter;
use vnode_agent::streams::StreamRouter;

const EVENT_QUEUE: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting virtual node agent");
    info!(
        node_name = %config.node_name,
        control_plane_url = %config.control_plane_url,
        listen_addr = %config.listen_addr,
        cpu_capacity = %config.capacity.cpu,
        memory_capacity = %config.capacity.memory,
        max_pods = config.capacity.pods,
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let backend: Arc<dyn Backend> = Arc::new(MockBackend::new());
    let pods = Arc::new(PodManager::new(Arc::clone(&backend), config.pod_settings()));
    let sink: Arc<dyn StatusSink> = Arc::new(ControlPlaneClient::from_config(&config)?);

    let descriptor = NodeDescriptor::new(
        &config.node_name,
        backend.name(),
        config.capacity,
        config.allocatable(),
        config.internal_ip.clone(),
        config.listen_addr.port(),
    );
    let advertiser = Arc::new(NodeAdvertiser::new(
        Arc::clone(&pods),
        descriptor,
        config.backend_grace_period,
    ));

    let heartbeat_handle = tokio::spawn({
        let sink = Arc::clone(&sink);
        let interval = config.heartbeat_interval;
        let shutdown_rx = shutdown_rx.clone();
        async move { heartbeat::run_heartbeat_loop(advertiser, sink, interval, shutdown_rx).await }
    });

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
    let reconciler = Reconciler::new(Arc::clone(&pods), sink, config.reconciler_config());
    let reconciler_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { reconciler.run(events_rx, shutdown_rx).await }
    });

    let state = AppState {
        streams: Arc::new(StreamRouter::new(
            Arc::clone(&pods),
            config.stream_idle_timeout,
            shutdown_rx.clone(),
        )),
        stats: Arc::new(StatsExporter::new(Arc::clone(&pods), &config.node_name)),
        pods,
        events: events_tx,
    };
    let server_handle = tokio::spawn({
        let addr = config.listen_addr;
        let shutdown_rx = shutdown_rx.clone();
        async move { server::serve(addr, state, shutdown_rx).await }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = heartbeat_handle => {
            match result {
                Ok(Ok(())) => info!("Heartbeat loop exited normally"),
                Ok(Err(e)) => error!(error = %e, "Heartbeat loop error"),
                Err(e) => error!(error = %e, "Heartbeat task panicked"),
            }
        }
        _ = reconciler_handle => {
            info!("Reconciler exited");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("HTTP server exited"),
                Ok(Err(e)) => error!(error = %e, "HTTP server error"),
                Err(e) => error!(error = %e, "HTTP server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    info!("Node agent shutdown complete");
    Ok(())
}
