//! Virtual node agent library.
//!
//! The agent presents a remote workload backend to the control plane as a
//! single schedulable node. It admits pods against the node's advertised
//! capacity, drives them onto the backend, folds backend observations back
//! into pod status, and bridges interactive streams to running containers.
//!
//! ## Architecture
//!
//! - **Pod manager** (`pods`): admission, start/update/teardown with retry,
//!   and the authoritative pod status table
//! - **Reconciler** (`reconciler`): consumes pod events, observation batches
//!   and resync ticks; reports status transitions upstream
//! - **Node advertiser** (`heartbeat`): periodic node descriptor with
//!   conditions derived from backend reachability
//! - **Stream router** (`streams`): logs, exec, attach, and port-forward sessions
//! - **Stats exporter** (`stats`): pull-based usage summary and metrics
//! - **Backend** (`backend`): the capability trait plus an in-memory mock

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod node;
pub mod pod;
pub mod pods;
pub mod reconciler;
pub mod resources;
pub mod server;
pub mod stats;
pub mod streams;

// Re-export commonly used types
pub use backend::{Backend, BackendError, BackendHandle, MockBackend};
pub use client::{ControlPlaneClient, StatusSink};
pub use error::ProviderError;
pub use pod::{Pod, PodKey, PodPhase, PodSpec, PodStatus};
pub use pods::{PodManager, PodSettings};
