//! Pod model: desired spec, observed status, and the phase computation.
//!
//! ## State Machine
//!
//! ```text
//! Pending -> Running -> Succeeded | Failed
//!    |          |
//!    +----------+------> Terminating -> (removed)
//! ```
//!
//! Transitions into Running, Succeeded, and Failed come only from backend
//! observations, via [`compute_phase`]. Terminating is entered by a delete.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resources::{Cpu, Memory, ResourceList};

// =============================================================================
// Identity
// =============================================================================

/// Pod identity: namespace and name are unique together.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

impl PodKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// =============================================================================
// Desired Spec
// =============================================================================

/// Restart policy applied by the backend to exited containers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RestartPolicy {
    #[default]
    Always,
    OnFailure,
    Never,
}

impl RestartPolicy {
    /// Whether a container that exited with `exit_code` is restarted.
    pub fn restarts(&self, exit_code: i32) -> bool {
        match self {
            RestartPolicy::Always => true,
            RestartPolicy::OnFailure => exit_code != 0,
            RestartPolicy::Never => false,
        }
    }
}

/// Resource requests for a single container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequests {
    #[serde(default)]
    pub cpu: Cpu,
    #[serde(default)]
    pub memory: Memory,
}

impl ResourceRequests {
    pub fn as_list(&self) -> ResourceList {
        ResourceList::new(self.cpu, self.memory, 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub resources: ResourceRequests,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            command: Vec::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            ports: Vec::new(),
            resources: ResourceRequests::default(),
        }
    }

    pub fn with_requests(mut self, cpu: Cpu, memory: Memory) -> Self {
        self.resources = ResourceRequests { cpu, memory };
        self
    }
}

/// Desired pod spec as delivered by the control plane. Read-only input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    pub containers: Vec<ContainerSpec>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
}

/// The part of a spec the backend acts on; metadata changes never reach it.
#[derive(Serialize)]
struct WorkloadView<'a> {
    containers: &'a [ContainerSpec],
    restart_policy: RestartPolicy,
}

impl PodSpec {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        containers: Vec<ContainerSpec>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            uid: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            containers,
            restart_policy: RestartPolicy::default(),
        }
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    pub fn key(&self) -> PodKey {
        PodKey::new(self.namespace.clone(), self.name.clone())
    }

    pub fn container(&self, name: &str) -> Option<&ContainerSpec> {
        self.containers.iter().find(|c| c.name == name)
    }

    /// Sum of container requests, counting the pod itself as one pod slot.
    pub fn total_requests(&self) -> ResourceList {
        let mut total: ResourceList = self
            .containers
            .iter()
            .map(|c| c.resources.as_list())
            .sum();
        total.pods = 1;
        total
    }

    /// Hash of the backend-relevant part of the spec.
    pub fn workload_hash(&self) -> vnode_reconcile::SpecHash {
        vnode_reconcile::SpecHash::of(&WorkloadView {
            containers: &self.containers,
            restart_policy: self.restart_policy,
        })
    }

    /// Structural problems that make the spec unschedulable anywhere.
    pub fn validate(&self) -> Result<(), String> {
        if self.namespace.is_empty() || self.name.is_empty() {
            return Err("namespace and name are required".to_string());
        }
        if self.containers.is_empty() {
            return Err("pod has no containers".to_string());
        }
        let mut seen = std::collections::BTreeSet::new();
        for container in &self.containers {
            if container.name.is_empty() {
                return Err("container name is required".to_string());
            }
            if !seen.insert(container.name.as_str()) {
                return Err(format!("duplicate container name '{}'", container.name));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Observed Status
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Terminating,
}

impl PodPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Terminating => "Terminating",
        };
        f.write_str(s)
    }
}

/// Run state of one container, as last observed on the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ContainerRunState {
    Waiting {
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    Running {
        started_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Terminated {
        exit_code: i32,
        reason: String,
        finished_at: DateTime<Utc>,
    },
}

impl ContainerRunState {
    pub fn waiting(reason: impl Into<String>) -> Self {
        ContainerRunState::Waiting {
            reason: reason.into(),
        }
    }

    pub fn running_now() -> Self {
        ContainerRunState::Running {
            started_at: Utc::now(),
        }
    }

    pub fn terminated(exit_code: i32, reason: impl Into<String>) -> Self {
        ContainerRunState::Terminated {
            exit_code,
            reason: reason.into(),
            finished_at: Utc::now(),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ContainerRunState::Running { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatus {
    pub name: String,
    pub image: String,
    pub state: ContainerRunState,
    pub ready: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PodConditionType {
    PodScheduled,
    Initialized,
    ContainersReady,
    Ready,
    /// Teardown could not be confirmed within the retry ceiling.
    OrphanTimeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodCondition {
    #[serde(rename = "type")]
    pub condition_type: PodConditionType,
    pub status: ConditionStatus,
    pub last_transition_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    pub phase: PodPhase,
    pub conditions: Vec<PodCondition>,
    pub container_statuses: Vec<ContainerStatus>,
    #[serde(rename = "hostIP", skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    #[serde(rename = "podIP", skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PodStatus {
    /// Initial status for an accepted pod: Pending, one waiting entry per container.
    pub fn accepted(spec: &PodSpec, host_ip: Option<String>) -> Self {
        let now = Utc::now();
        let mut status = Self {
            phase: PodPhase::Pending,
            conditions: Vec::new(),
            container_statuses: spec
                .containers
                .iter()
                .map(|c| ContainerStatus {
                    name: c.name.clone(),
                    image: c.image.clone(),
                    state: ContainerRunState::waiting("ContainerCreating"),
                    ready: false,
                })
                .collect(),
            host_ip,
            pod_ip: None,
            start_time: Some(now),
            message: None,
        };
        status.set_condition(PodConditionType::PodScheduled, true, None, None);
        status.set_condition(PodConditionType::Initialized, false, None, None);
        status.set_condition(PodConditionType::ContainersReady, false, None, None);
        status.set_condition(PodConditionType::Ready, false, None, None);
        status
    }

    pub fn condition(&self, condition_type: PodConditionType) -> Option<&PodCondition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    pub fn is_condition_true(&self, condition_type: PodConditionType) -> bool {
        self.condition(condition_type)
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false)
    }

    /// Upsert a condition. Returns true if anything changed.
    ///
    /// The transition time moves only when the status flips.
    pub fn set_condition(
        &mut self,
        condition_type: PodConditionType,
        status: bool,
        reason: Option<&str>,
        message: Option<&str>,
    ) -> bool {
        let status = ConditionStatus::from(status);
        let reason = reason.map(str::to_string);
        let message = message.map(str::to_string);

        match self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition_type)
        {
            Some(existing) => {
                if existing.status == status
                    && existing.reason == reason
                    && existing.message == message
                {
                    return false;
                }
                if existing.status != status {
                    existing.last_transition_time = Utc::now();
                }
                existing.status = status;
                existing.reason = reason;
                existing.message = message;
                true
            }
            None => {
                self.conditions.push(PodCondition {
                    condition_type,
                    status,
                    last_transition_time: Utc::now(),
                    reason,
                    message,
                });
                true
            }
        }
    }

    /// Reset container entries to match `spec`, preserving known states by name.
    pub fn align_containers(&mut self, spec: &PodSpec, reason: &str) {
        let previous = std::mem::take(&mut self.container_statuses);
        self.container_statuses = spec
            .containers
            .iter()
            .map(|c| {
                previous
                    .iter()
                    .find(|p| p.name == c.name && p.image == c.image)
                    .cloned()
                    .unwrap_or_else(|| ContainerStatus {
                        name: c.name.clone(),
                        image: c.image.clone(),
                        state: ContainerRunState::waiting(reason),
                        ready: false,
                    })
            })
            .collect();
    }

    pub fn all_containers_running(&self) -> bool {
        !self.container_statuses.is_empty()
            && self.container_statuses.iter().all(|c| c.state.is_running())
    }
}

/// Full snapshot of a tracked pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub spec: PodSpec,
    pub status: PodStatus,
}

// =============================================================================
// Phase Computation
// =============================================================================

/// Derive the pod phase from observed container states.
///
/// - `Failed` if any container exited non-zero and will not be restarted
/// - `Succeeded` if every container exited zero and none will be restarted
/// - `Running` if at least one container runs, or exited containers are
///   about to be restarted (ambiguity resolves toward Running)
/// - `Pending` otherwise
pub fn compute_phase(policy: RestartPolicy, states: &[ContainerRunState]) -> PodPhase {
    let mut any_running = false;
    let mut any_terminated = false;
    let mut all_succeeded = !states.is_empty();

    for state in states {
        match state {
            ContainerRunState::Running { .. } => {
                any_running = true;
                all_succeeded = false;
            }
            ContainerRunState::Terminated { exit_code, .. } => {
                if *exit_code != 0 && !policy.restarts(*exit_code) {
                    return PodPhase::Failed;
                }
                any_terminated = true;
                if *exit_code != 0 || policy.restarts(*exit_code) {
                    all_succeeded = false;
                }
            }
            ContainerRunState::Waiting { .. } => {
                all_succeeded = false;
            }
        }
    }

    if all_succeeded {
        return PodPhase::Succeeded;
    }
    if any_running || (any_terminated && policy != RestartPolicy::Never) {
        return PodPhase::Running;
    }
    PodPhase::Pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn waiting() -> ContainerRunState {
        ContainerRunState::waiting("ContainerCreating")
    }

    fn running() -> ContainerRunState {
        ContainerRunState::running_now()
    }

    fn exited(code: i32) -> ContainerRunState {
        ContainerRunState::terminated(code, if code == 0 { "Completed" } else { "Error" })
    }

    #[rstest]
    #[case(RestartPolicy::Always, vec![waiting()], PodPhase::Pending)]
    #[case(RestartPolicy::Always, vec![running()], PodPhase::Running)]
    #[case(RestartPolicy::Always, vec![running(), waiting()], PodPhase::Running)]
    #[case(RestartPolicy::Never, vec![exited(0), exited(0)], PodPhase::Succeeded)]
    #[case(RestartPolicy::OnFailure, vec![exited(0)], PodPhase::Succeeded)]
    #[case(RestartPolicy::Never, vec![running(), exited(1)], PodPhase::Failed)]
    #[case(RestartPolicy::Never, vec![exited(0), waiting()], PodPhase::Pending)]
    #[case(RestartPolicy::OnFailure, vec![exited(1)], PodPhase::Running)]
    #[case(RestartPolicy::Always, vec![exited(0)], PodPhase::Running)]
    #[case(RestartPolicy::Always, vec![exited(2), waiting()], PodPhase::Running)]
    #[case(RestartPolicy::Always, vec![], PodPhase::Pending)]
    fn test_compute_phase(
        #[case] policy: RestartPolicy,
        #[case] states: Vec<ContainerRunState>,
        #[case] expected: PodPhase,
    ) {
        assert_eq!(compute_phase(policy, &states), expected);
    }

    #[test]
    fn test_accepted_status_matches_container_count() {
        let spec = PodSpec::new(
            "default",
            "a",
            vec![ContainerSpec::new("web", "nginx"), ContainerSpec::new("side", "envoy")],
        );
        let status = PodStatus::accepted(&spec, Some("10.0.0.1".to_string()));
        assert_eq!(status.phase, PodPhase::Pending);
        assert_eq!(status.container_statuses.len(), 2);
        assert!(status.is_condition_true(PodConditionType::PodScheduled));
        assert!(!status.is_condition_true(PodConditionType::Ready));
    }

    #[test]
    fn test_set_condition_only_moves_transition_on_flip() {
        let spec = PodSpec::new("default", "a", vec![ContainerSpec::new("c", "img")]);
        let mut status = PodStatus::accepted(&spec, None);
        let before = status.condition(PodConditionType::Ready).unwrap().clone();

        assert!(!status.set_condition(PodConditionType::Ready, false, None, None));
        assert!(status.set_condition(PodConditionType::Ready, true, None, None));
        let after = status.condition(PodConditionType::Ready).unwrap();
        assert_eq!(after.status, ConditionStatus::True);
        assert!(after.last_transition_time >= before.last_transition_time);
    }

    #[test]
    fn test_validate() {
        let ok = PodSpec::new("default", "a", vec![ContainerSpec::new("c", "img")]);
        assert!(ok.validate().is_ok());

        let empty = PodSpec::new("default", "a", vec![]);
        assert!(empty.validate().is_err());

        let dup = PodSpec::new(
            "default",
            "a",
            vec![ContainerSpec::new("c", "img"), ContainerSpec::new("c", "img2")],
        );
        assert!(dup.validate().unwrap_err().contains("duplicate"));
    }

    #[test]
    fn test_workload_hash_ignores_metadata() {
        let spec = PodSpec::new("default", "a", vec![ContainerSpec::new("c", "img:v1")]);
        let mut labelled = spec.clone();
        labelled.labels.insert("team".to_string(), "infra".to_string());
        assert_eq!(spec.workload_hash(), labelled.workload_hash());

        let mut bumped = spec.clone();
        bumped.containers[0].image = "img:v2".to_string();
        assert_ne!(spec.workload_hash(), bumped.workload_hash());
    }

    #[test]
    fn test_spec_deserializes_quantities() {
        let spec: PodSpec = serde_json::from_value(serde_json::json!({
            "namespace": "default",
            "name": "a",
            "containers": [{"name": "c", "resources": {"cpu": "1", "memory": "1Gi"}}]
        }))
        .unwrap();
        assert_eq!(spec.restart_policy, RestartPolicy::Always);
        assert_eq!(spec.total_requests().cpu, Cpu::from_cores(1));
        assert_eq!(spec.total_requests().memory, Memory::from_gibibytes(1));
        assert_eq!(spec.total_requests().pods, 1);
    }
}
