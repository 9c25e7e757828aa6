//! Pod record set and lifecycle operations.
//!
//! The pod manager:
//! - Admits pod specs against the node's allocatable resources
//! - Dispatches starts, updates, and teardowns to the backend with bounded retry
//! - Folds backend observations into pod status
//! - Tracks which status changes still need to be reported
//!
//! It is the only writer of pod status. Backend calls are made without the
//! record lock held, so a slow backend never blocks reads or observations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, error, info, warn};
use vnode_reconcile::{BackoffPolicy, RetryTracker, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW};

use crate::backend::{
    with_deadline, Backend, BackendError, BackendHandle, Observation, SpecDelta, UpdatePolicy,
};
use crate::error::ProviderError;
use crate::pod::{
    compute_phase, ContainerRunState, Pod, PodConditionType, PodKey, PodPhase, PodSpec, PodStatus,
};
use crate::resources::{Cpu, Memory, ResourceList};

/// Settings the pod manager is constructed with.
#[derive(Debug, Clone)]
pub struct PodSettings {
    pub capacity: ResourceList,
    pub reserved: ResourceList,
    /// Subtract committed pod requests from allocatable.
    pub dynamic_allocatable: bool,
    pub backoff: BackoffPolicy,
    /// Retries after the first failed backend call.
    pub max_retries: u32,
    /// Deadline for a single backend call.
    pub backend_timeout: Duration,
    /// Reported as `hostIP` on every pod.
    pub host_ip: Option<String>,
}

impl Default for PodSettings {
    fn default() -> Self {
        Self {
            capacity: ResourceList::new(Cpu::from_cores(20), Memory::from_gibibytes(10), 100),
            reserved: ResourceList::default(),
            dynamic_allocatable: false,
            backoff: BackoffPolicy::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            backend_timeout: Duration::from_secs(10),
            host_ip: None,
        }
    }
}

/// A pod status change not yet acknowledged by the control plane.
#[derive(Debug, Clone)]
pub struct PendingReport {
    pub key: PodKey,
    pub uid: Option<String>,
    pub revision: u64,
    pub status: PodStatus,
}

#[derive(Debug, Clone)]
struct PodRecord {
    spec: PodSpec,
    /// Spec last accepted by the backend, for computing update deltas.
    applied: Option<PodSpec>,
    status: PodStatus,
    handle: Option<BackendHandle>,
    revision: u64,
    reported_revision: Option<u64>,
}

impl PodRecord {
    fn new(spec: PodSpec, host_ip: Option<String>) -> Self {
        let status = PodStatus::accepted(&spec, host_ip);
        Self {
            spec,
            applied: None,
            status,
            handle: None,
            revision: 1,
            reported_revision: None,
        }
    }

    fn bump(&mut self) {
        self.revision += 1;
    }

    fn needs_status_report(&self) -> bool {
        self.reported_revision != Some(self.revision)
    }

    fn is_terminating(&self) -> bool {
        self.status.phase == PodPhase::Terminating
    }

    fn snapshot(&self) -> Pod {
        Pod {
            spec: self.spec.clone(),
            status: self.status.clone(),
        }
    }
}

/// Recompute phase and readiness from the container states.
fn refresh_derived(spec: &PodSpec, status: &mut PodStatus) {
    let states: Vec<ContainerRunState> = status
        .container_statuses
        .iter()
        .map(|c| c.state.clone())
        .collect();
    status.phase = compute_phase(spec.restart_policy, &states);

    let started = states
        .iter()
        .any(|s| !matches!(s, ContainerRunState::Waiting { .. }));
    let ready = status.all_containers_running();
    let not_ready = (!ready).then_some("ContainersNotReady");

    status.set_condition(PodConditionType::Initialized, started, None, None);
    status.set_condition(PodConditionType::ContainersReady, ready, not_ready, None);
    status.set_condition(PodConditionType::Ready, ready, not_ready, None);
}

/// Owner of the pod record set.
pub struct PodManager {
    backend: Arc<dyn Backend>,
    settings: PodSettings,
    pods: RwLock<HashMap<PodKey, PodRecord>>,
    /// Pods removed since the last report.
    removed: Mutex<Vec<PodKey>>,
    /// Teardown failures per pod.
    stop_failures: Mutex<RetryTracker<PodKey>>,
    changed: Notify,
}

impl PodManager {
    pub fn new(backend: Arc<dyn Backend>, settings: PodSettings) -> Self {
        let stop_failures = RetryTracker::new(settings.max_retries, DEFAULT_RETRY_WINDOW);
        Self {
            backend,
            settings,
            pods: RwLock::new(HashMap::new()),
            removed: Mutex::new(Vec::new()),
            stop_failures: Mutex::new(stop_failures),
            changed: Notify::new(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn settings(&self) -> &PodSettings {
        &self.settings
    }

    /// Resolves once some pod status has changed or a pod was removed.
    pub async fn wait_changed(&self) {
        self.changed.notified().await;
    }

    fn notify(&self) {
        self.changed.notify_one();
    }

    // =========================================================================
    // Admission
    // =========================================================================

    /// Requests of every pod still holding resources, except `exclude`.
    fn committed_in(pods: &HashMap<PodKey, PodRecord>, exclude: Option<&PodKey>) -> ResourceList {
        pods.iter()
            .filter(|(key, _)| Some(*key) != exclude)
            .filter(|(_, record)| !record.status.phase.is_terminal())
            .map(|(_, record)| record.spec.total_requests())
            .sum()
    }

    fn allocatable_in(
        &self,
        pods: &HashMap<PodKey, PodRecord>,
        exclude: Option<&PodKey>,
    ) -> ResourceList {
        let base = self.settings.capacity.saturating_sub(&self.settings.reserved);
        if self.settings.dynamic_allocatable {
            base.saturating_sub(&Self::committed_in(pods, exclude))
        } else {
            base
        }
    }

    fn admit(&self, pods: &HashMap<PodKey, PodRecord>, spec: &PodSpec) -> Result<(), ProviderError> {
        let key = spec.key();
        let reject = |reason: String| ProviderError::AdmissionRejected {
            pod: key.clone(),
            reason,
        };

        spec.validate().map_err(reject)?;

        let allocatable = self.allocatable_in(pods, Some(&key));
        for container in &spec.containers {
            let exceeded = container.resources.as_list().exceeded(&allocatable);
            if !exceeded.is_empty() {
                return Err(reject(format!(
                    "container {} exceeds allocatable: {}",
                    container.name,
                    exceeded.join(", ")
                )));
            }
        }

        if self.settings.dynamic_allocatable {
            let exceeded = spec.total_requests().exceeded(&allocatable);
            if !exceeded.is_empty() {
                return Err(reject(format!(
                    "pod requests exceed allocatable: {}",
                    exceeded.join(", ")
                )));
            }
        }

        let others = pods.keys().filter(|k| **k != key).count() as u64;
        if others >= self.settings.capacity.pods {
            return Err(reject(format!(
                "node is at its pod limit of {}",
                self.settings.capacity.pods
            )));
        }

        Ok(())
    }

    // =========================================================================
    // Lifecycle Operations
    // =========================================================================

    /// Admit a pod and dispatch it to the backend.
    ///
    /// Redelivery of a known pod is applied as the current desired spec, so
    /// repeating a create never produces a second backend workload.
    pub async fn create(&self, spec: PodSpec) -> Result<(), ProviderError> {
        let key = spec.key();
        {
            let mut pods = self.pods.write().await;
            self.admit(&pods, &spec)?;

            let existing = pods
                .get(&key)
                .map(|r| (r.is_terminating(), r.handle.is_some()));
            match existing {
                Some((true, _)) => {
                    return Err(ProviderError::BackendUnavailable(format!(
                        "pod {key} is still terminating"
                    )));
                }
                Some((false, true)) => {
                    drop(pods);
                    debug!(pod = %key, "Create for known pod, applying as update");
                    return self.update(spec).await;
                }
                Some((false, false)) => {
                    // An earlier start never reached the backend; retry it.
                    if let Some(record) = pods.get_mut(&key) {
                        record.spec = spec.clone();
                        record
                            .status
                            .align_containers(&record.spec, "ContainerCreating");
                        record.bump();
                    }
                }
                None => {
                    info!(
                        pod = %key,
                        containers = spec.containers.len(),
                        "Admitted pod"
                    );
                    pods.insert(
                        key.clone(),
                        PodRecord::new(spec.clone(), self.settings.host_ip.clone()),
                    );
                }
            }
        }
        self.notify();

        self.start_with_retry(&key, &spec).await
    }

    async fn start_with_retry(&self, key: &PodKey, spec: &PodSpec) -> Result<(), ProviderError> {
        let mut attempt = 0u32;
        let result = loop {
            let started = with_deadline(
                self.settings.backend_timeout,
                "start",
                self.backend.start(spec),
            )
            .await;
            match started {
                Ok(handle) => break Ok(handle),
                Err(BackendError::Unavailable(msg)) if attempt < self.settings.max_retries => {
                    let delay = self.settings.backoff.delay(attempt);
                    attempt += 1;
                    warn!(
                        pod = %key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %msg,
                        "Backend start failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => break Err(e),
            }
        };

        let mut pods = self.pods.write().await;
        if !pods.contains_key(key) {
            drop(pods);
            let handle = result?;
            // Deleted while the start was in flight.
            warn!(pod = %key, handle = %handle, "Pod deleted during start, stopping workload");
            let stopped = with_deadline(
                self.settings.backend_timeout,
                "stop",
                self.backend.stop(&handle),
            )
            .await;
            if let Err(e) = stopped {
                error!(pod = %key, handle = %handle, error = %e, "Failed to stop workload of deleted pod");
            }
            return Ok(());
        }

        let outcome = match result {
            Ok(handle) => {
                info!(pod = %key, handle = %handle, "Pod dispatched to backend");
                if let Some(record) = pods.get_mut(key) {
                    record.handle = Some(handle);
                    record.applied = Some(spec.clone());
                    record.status.message = None;
                    record.bump();
                }
                Ok(())
            }
            Err(BackendError::Unavailable(msg)) => {
                warn!(pod = %key, error = %msg, "Backend unavailable, pod stays pending");
                if let Some(record) = pods.get_mut(key) {
                    record.status.message = Some(format!("backend unavailable: {msg}"));
                    record.bump();
                }
                Err(ProviderError::BackendUnavailable(msg))
            }
            Err(e) => {
                warn!(pod = %key, error = %e, "Backend refused pod");
                pods.remove(key);
                self.removed.lock().await.push(key.clone());
                Err(e.into())
            }
        };
        drop(pods);
        self.notify();
        outcome
    }

    /// Apply a changed spec to a known pod.
    pub async fn update(&self, spec: PodSpec) -> Result<(), ProviderError> {
        let key = spec.key();
        let (handle, applied) = {
            let mut pods = self.pods.write().await;
            if !pods.contains_key(&key) {
                return Err(ProviderError::not_found(format!("pod {key}")));
            }
            self.admit(&pods, &spec)?;
            let Some(record) = pods.get_mut(&key) else {
                return Err(ProviderError::not_found(format!("pod {key}")));
            };
            if record.is_terminating() {
                return Err(ProviderError::BackendUnavailable(format!(
                    "pod {key} is terminating"
                )));
            }

            record.spec.uid = spec.uid.clone();
            record.spec.labels = spec.labels.clone();
            record.spec.annotations = spec.annotations.clone();

            if record.spec.workload_hash() == spec.workload_hash() {
                debug!(pod = %key, "No workload change");
                return Ok(());
            }

            let Some(handle) = record.handle.clone() else {
                record.spec = spec;
                record.status.align_containers(&record.spec, "ContainerCreating");
                record.bump();
                return Ok(());
            };
            let applied = record.applied.clone().unwrap_or_else(|| record.spec.clone());
            (handle, applied)
        };

        match self.backend.update_policy() {
            UpdatePolicy::Ignore => {
                info!(pod = %key, "Backend does not apply updates, kept metadata only");
                Ok(())
            }
            UpdatePolicy::InPlace => {
                let delta = SpecDelta::between(&applied, &spec);
                info!(
                    pod = %key,
                    changed = delta.changed.len(),
                    removed = delta.removed.len(),
                    "Updating pod in place"
                );
                with_deadline(
                    self.settings.backend_timeout,
                    "update",
                    self.backend.update(&handle, &delta),
                )
                .await?;

                if let Some(record) = self.pods.write().await.get_mut(&key) {
                    record.spec = spec.clone();
                    record.applied = Some(spec);
                    record.status.align_containers(&record.spec, "ContainerCreating");
                    refresh_derived(&record.spec, &mut record.status);
                    record.bump();
                }
                self.notify();
                Ok(())
            }
            UpdatePolicy::Recreate => {
                info!(pod = %key, handle = %handle, "Recreating pod for new spec");
                match with_deadline(
                    self.settings.backend_timeout,
                    "stop",
                    self.backend.stop(&handle),
                )
                .await
                {
                    Ok(()) | Err(BackendError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }

                if let Some(record) = self.pods.write().await.get_mut(&key) {
                    record.handle = None;
                    record.applied = None;
                    record.spec = spec.clone();
                    record.status = PodStatus::accepted(&spec, self.settings.host_ip.clone());
                    record.bump();
                }
                self.start_with_retry(&key, &spec).await
            }
        }
    }

    /// Begin teardown. The pod stays listed as Terminating until the backend
    /// confirms the stop.
    pub async fn delete(self: &Arc<Self>, key: &PodKey) -> Result<(), ProviderError> {
        let handle = {
            let mut pods = self.pods.write().await;
            let record = pods
                .get_mut(key)
                .ok_or_else(|| ProviderError::not_found(format!("pod {key}")))?;

            let Some(handle) = record.handle.clone() else {
                pods.remove(key);
                drop(pods);
                info!(pod = %key, "Removed pod that never reached the backend");
                self.removed.lock().await.push(key.clone());
                self.notify();
                return Ok(());
            };

            if record.is_terminating()
                && !record.status.is_condition_true(PodConditionType::OrphanTimeout)
            {
                debug!(pod = %key, "Teardown already in progress");
                return Ok(());
            }

            record.status.phase = PodPhase::Terminating;
            record
                .status
                .set_condition(PodConditionType::Ready, false, Some("Terminating"), None);
            if record.status.condition(PodConditionType::OrphanTimeout).is_some() {
                record
                    .status
                    .set_condition(PodConditionType::OrphanTimeout, false, None, None);
            }
            record.bump();
            handle
        };
        self.notify();
        self.stop_failures.lock().await.clear(key);

        info!(pod = %key, handle = %handle, "Tearing down pod");
        let manager = Arc::clone(self);
        let key = key.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.teardown(key.clone(), handle).await {
                warn!(pod = %key, error = %e, "Teardown failed");
            }
        });

        Ok(())
    }

    async fn teardown(&self, key: PodKey, handle: BackendHandle) -> Result<(), ProviderError> {
        let mut attempt = 0u32;
        loop {
            let stopped = with_deadline(
                self.settings.backend_timeout,
                "stop",
                self.backend.stop(&handle),
            )
            .await;

            let err = match stopped {
                Ok(()) | Err(BackendError::NotFound(_)) => {
                    self.stop_failures.lock().await.clear(&key);
                    if self.pods.write().await.remove(&key).is_some() {
                        self.removed.lock().await.push(key.clone());
                    }
                    self.notify();
                    info!(pod = %key, handle = %handle, "Pod removed after backend teardown");
                    return Ok(());
                }
                Err(e) => e,
            };

            attempt += 1;
            let exhausted = self.stop_failures.lock().await.record_failure(&key);
            if exhausted {
                error!(
                    pod = %key,
                    handle = %handle,
                    attempts = attempt,
                    error = %err,
                    "Backend teardown not confirmed, pod left orphaned"
                );
                if let Some(record) = self.pods.write().await.get_mut(&key) {
                    let message = format!("stop not confirmed after {attempt} attempts: {err}");
                    record.status.set_condition(
                        PodConditionType::OrphanTimeout,
                        true,
                        Some("TeardownUnconfirmed"),
                        Some(&message),
                    );
                    record.bump();
                }
                self.notify();
                return Err(ProviderError::OrphanTimeout {
                    pod: key,
                    attempts: attempt,
                });
            }

            let delay = self.settings.backoff.delay(attempt - 1);
            warn!(
                pod = %key,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Backend stop failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Retry starts for pods that never reached the backend.
    pub async fn resync(&self) -> usize {
        let stalled: Vec<PodSpec> = {
            let pods = self.pods.read().await;
            pods.values()
                .filter(|r| r.handle.is_none() && !r.is_terminating())
                .map(|r| r.spec.clone())
                .collect()
        };

        let pruned = self.stop_failures.lock().await.prune();
        if pruned > 0 {
            debug!(pruned, "Dropped expired teardown failure counts");
        }

        let count = stalled.len();
        for spec in stalled {
            let key = spec.key();
            debug!(pod = %key, "Retrying start");
            if let Err(e) = self.start_with_retry(&key, &spec).await {
                debug!(pod = %key, error = %e, "Start still failing");
            }
        }
        count
    }

    // =========================================================================
    // Observations
    // =========================================================================

    /// Fold a batch of backend observations into pod status.
    ///
    /// Returns the number of pods whose status changed.
    pub async fn apply_observations(&self, batch: &[Observation]) -> usize {
        let by_handle: HashMap<&BackendHandle, &Observation> =
            batch.iter().map(|o| (&o.handle, o)).collect();

        let mut changed = 0;
        {
            let mut pods = self.pods.write().await;
            for (key, record) in pods.iter_mut() {
                if record.is_terminating() {
                    continue;
                }
                let Some(observation) = record.handle.as_ref().and_then(|h| by_handle.get(h))
                else {
                    continue;
                };

                let before = record.status.clone();
                for status in &mut record.status.container_statuses {
                    if let Some(seen) = observation
                        .containers
                        .iter()
                        .find(|c| c.name == status.name)
                    {
                        status.state = seen.state.clone();
                        status.ready = seen.state.is_running();
                    }
                }
                if observation.pod_ip.is_some() {
                    record.status.pod_ip = observation.pod_ip.clone();
                }
                refresh_derived(&record.spec, &mut record.status);

                if record.status != before {
                    if record.status.phase != before.phase {
                        info!(
                            pod = %key,
                            from = %before.phase,
                            to = %record.status.phase,
                            "Pod phase changed"
                        );
                    }
                    record.bump();
                    changed += 1;
                }
            }
        }

        if changed > 0 {
            self.notify();
        }
        changed
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get(&self, key: &PodKey) -> Option<Pod> {
        self.pods.read().await.get(key).map(PodRecord::snapshot)
    }

    /// All pods, ordered by key.
    pub async fn list(&self) -> Vec<Pod> {
        let pods = self.pods.read().await;
        let mut list: Vec<Pod> = pods.values().map(PodRecord::snapshot).collect();
        list.sort_by(|a, b| a.spec.key().cmp(&b.spec.key()));
        list
    }

    pub async fn list_namespace(&self, namespace: &str) -> Vec<Pod> {
        self.list()
            .await
            .into_iter()
            .filter(|p| p.spec.namespace == namespace)
            .collect()
    }

    pub async fn get_status(&self, key: &PodKey) -> Result<PodStatus, ProviderError> {
        self.pods
            .read()
            .await
            .get(key)
            .map(|r| r.status.clone())
            .ok_or_else(|| ProviderError::not_found(format!("pod {key}")))
    }

    pub async fn pod_count(&self) -> usize {
        self.pods.read().await.len()
    }

    pub async fn handle(&self, key: &PodKey) -> Option<BackendHandle> {
        self.pods.read().await.get(key).and_then(|r| r.handle.clone())
    }

    /// Handle for an interactive stream into `container`.
    ///
    /// With `require_running`, the container must currently be running;
    /// otherwise it only has to have been started (logs of exited containers
    /// stay readable).
    pub async fn stream_target(
        &self,
        key: &PodKey,
        container: &str,
        require_running: bool,
    ) -> Result<BackendHandle, ProviderError> {
        let pods = self.pods.read().await;
        let record = pods
            .get(key)
            .ok_or_else(|| ProviderError::not_found(format!("pod {key}")))?;
        let handle = record
            .handle
            .clone()
            .filter(|_| !record.is_terminating())
            .ok_or_else(|| ProviderError::not_found(format!("pod {key} is not running")))?;
        let status = record
            .status
            .container_statuses
            .iter()
            .find(|c| c.name == container)
            .ok_or_else(|| ProviderError::not_found(format!("container {container} in {key}")))?;

        let usable = match &status.state {
            ContainerRunState::Running { .. } => true,
            ContainerRunState::Terminated { .. } => !require_running,
            ContainerRunState::Waiting { .. } => false,
        };
        if !usable {
            return Err(ProviderError::not_found(format!(
                "container {container} in {key} is not running"
            )));
        }
        Ok(handle)
    }

    /// Handle for a pod-level stream (port-forward): the pod must be Running.
    pub async fn running_pod(&self, key: &PodKey) -> Result<BackendHandle, ProviderError> {
        let pods = self.pods.read().await;
        let record = pods
            .get(key)
            .ok_or_else(|| ProviderError::not_found(format!("pod {key}")))?;
        match (&record.handle, record.status.phase) {
            (Some(handle), PodPhase::Running) => Ok(handle.clone()),
            _ => Err(ProviderError::not_found(format!("pod {key} is not running"))),
        }
    }

    /// Pods with a backend workload, for stats collection.
    pub async fn tracked_handles(&self) -> Vec<(PodKey, Option<String>, BackendHandle)> {
        let pods = self.pods.read().await;
        let mut handles: Vec<_> = pods
            .iter()
            .filter_map(|(key, r)| {
                r.handle
                    .clone()
                    .map(|h| (key.clone(), r.spec.uid.clone(), h))
            })
            .collect();
        handles.sort_by(|a, b| a.0.cmp(&b.0));
        handles
    }

    /// Requests of pods that still hold resources.
    pub async fn committed(&self) -> ResourceList {
        let pods = self.pods.read().await;
        let mut committed = Self::committed_in(&pods, None);
        committed.pods = pods.len() as u64;
        committed
    }

    pub async fn allocatable(&self) -> ResourceList {
        let pods = self.pods.read().await;
        let mut allocatable = self.allocatable_in(&pods, None);
        allocatable.pods = self.settings.capacity.pods;
        allocatable
    }

    // =========================================================================
    // Status Reporting
    // =========================================================================

    /// Pods whose current status has not been reported yet.
    pub async fn pending_status_reports(&self) -> Vec<PendingReport> {
        let pods = self.pods.read().await;
        pods.iter()
            .filter(|(_, r)| r.needs_status_report())
            .map(|(key, r)| PendingReport {
                key: key.clone(),
                uid: r.spec.uid.clone(),
                revision: r.revision,
                status: r.status.clone(),
            })
            .collect()
    }

    /// Record that `revision` of a pod's status reached the control plane.
    pub async fn mark_status_reported(&self, key: &PodKey, revision: u64) {
        if let Some(record) = self.pods.write().await.get_mut(key) {
            if record.reported_revision.is_none_or(|r| r < revision) {
                record.reported_revision = Some(revision);
            }
        }
    }

    pub async fn take_removed(&self) -> Vec<PodKey> {
        std::mem::take(&mut *self.removed.lock().await)
    }

    /// Put back removals whose report failed.
    pub async fn requeue_removed(&self, keys: Vec<PodKey>) {
        self.removed.lock().await.extend(keys);
    }
}
