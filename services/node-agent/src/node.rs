//! Node descriptor advertised to the control plane.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pod::ConditionStatus;
use crate::resources::ResourceList;

pub const TAINT_KEY: &str = "virtual-kubelet.io/provider";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeConditionType {
    Ready,
    OutOfDisk,
    MemoryPressure,
    DiskPressure,
    NetworkUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCondition {
    #[serde(rename = "type")]
    pub condition_type: NodeConditionType,
    pub status: ConditionStatus,
    pub last_heartbeat_time: DateTime<Utc>,
    pub last_transition_time: DateTime<Utc>,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressType {
    InternalIP,
    Hostname,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    #[serde(rename = "type")]
    pub address_type: AddressType,
    pub address: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    pub value: String,
    pub effect: TaintEffect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub operating_system: String,
    pub architecture: String,
    pub kubelet_version: String,
}

/// Everything the control plane knows about this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDescriptor {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub taints: Vec<Taint>,
    pub capacity: ResourceList,
    pub allocatable: ResourceList,
    pub conditions: Vec<NodeCondition>,
    pub addresses: Vec<NodeAddress>,
    /// Port for control-plane-initiated connections (logs, exec, metrics).
    pub daemon_endpoint_port: u16,
    pub node_info: NodeInfo,
}

impl NodeDescriptor {
    /// Descriptor as created at startup: everything healthy except Ready,
    /// which waits for the first successful backend probe.
    pub fn new(
        name: impl Into<String>,
        backend_name: &str,
        capacity: ResourceList,
        allocatable: ResourceList,
        internal_ip: Option<String>,
        daemon_endpoint_port: u16,
    ) -> Self {
        let name = name.into();
        let now = Utc::now();

        let labels = [
            ("type", "virtual-kubelet"),
            ("kubernetes.io/role", "agent"),
            ("kubernetes.io/hostname", name.as_str()),
            ("node.kubernetes.io/exclude-from-external-load-balancers", "true"),
            ("alpha.service-controller.kubernetes.io/exclude-balancer", "true"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let mut addresses = Vec::new();
        if let Some(ip) = internal_ip {
            addresses.push(NodeAddress {
                address_type: AddressType::InternalIP,
                address: ip,
            });
        }
        addresses.push(NodeAddress {
            address_type: AddressType::Hostname,
            address: name.clone(),
        });

        let condition = |condition_type, status, reason: &str, message: &str| NodeCondition {
            condition_type,
            status,
            last_heartbeat_time: now,
            last_transition_time: now,
            reason: reason.to_string(),
            message: message.to_string(),
        };

        Self {
            labels,
            taints: vec![Taint {
                key: TAINT_KEY.to_string(),
                value: backend_name.to_string(),
                effect: TaintEffect::NoSchedule,
            }],
            capacity,
            allocatable,
            conditions: vec![
                condition(
                    NodeConditionType::Ready,
                    ConditionStatus::Unknown,
                    "BackendPending",
                    "waiting for the first backend probe",
                ),
                condition(
                    NodeConditionType::OutOfDisk,
                    ConditionStatus::False,
                    "KubeletHasSufficientDisk",
                    "kubelet has sufficient disk space available",
                ),
                condition(
                    NodeConditionType::MemoryPressure,
                    ConditionStatus::False,
                    "KubeletHasSufficientMemory",
                    "kubelet has sufficient memory available",
                ),
                condition(
                    NodeConditionType::DiskPressure,
                    ConditionStatus::False,
                    "KubeletHasNoDiskPressure",
                    "kubelet has no disk pressure",
                ),
                condition(
                    NodeConditionType::NetworkUnavailable,
                    ConditionStatus::False,
                    "RouteCreated",
                    "RouteController created a route",
                ),
            ],
            addresses,
            daemon_endpoint_port,
            node_info: NodeInfo {
                operating_system: "Linux".to_string(),
                architecture: "amd64".to_string(),
                kubelet_version: format!("vnode-agent/{}", env!("CARGO_PKG_VERSION")),
            },
            name,
        }
    }

    pub fn condition(&self, condition_type: NodeConditionType) -> Option<&NodeCondition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    pub fn is_ready(&self) -> bool {
        self.condition(NodeConditionType::Ready)
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false)
    }

    /// Update a condition in place, stamping the heartbeat time.
    ///
    /// The transition time moves only when the status flips.
    pub fn set_condition(
        &mut self,
        condition_type: NodeConditionType,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition_type)
        {
            Some(existing) => {
                if existing.status != status {
                    existing.last_transition_time = now;
                }
                existing.status = status;
                existing.last_heartbeat_time = now;
                existing.reason = reason.to_string();
                existing.message = message.to_string();
            }
            None => self.conditions.push(NodeCondition {
                condition_type,
                status,
                last_heartbeat_time: now,
                last_transition_time: now,
                reason: reason.to_string(),
                message: message.to_string(),
            }),
        }
    }

    /// Stamp the heartbeat time on every condition.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        for condition in &mut self.conditions {
            condition.last_heartbeat_time = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{Cpu, Memory};

    fn descriptor(internal_ip: Option<&str>) -> NodeDescriptor {
        let capacity = ResourceList::new(Cpu::from_cores(20), Memory::from_gibibytes(10), 100);
        NodeDescriptor::new(
            "vk-node",
            "mock",
            capacity,
            capacity,
            internal_ip.map(str::to_string),
            10250,
        )
    }

    #[test]
    fn test_initial_descriptor() {
        let node = descriptor(Some("10.0.0.5"));

        assert_eq!(node.labels.get("type").map(String::as_str), Some("virtual-kubelet"));
        assert_eq!(node.taints[0].key, TAINT_KEY);
        assert_eq!(node.taints[0].value, "mock");
        assert_eq!(node.conditions.len(), 5);
        assert!(!node.is_ready());
        assert_eq!(node.addresses[0].address_type, AddressType::InternalIP);
        assert_eq!(node.addresses[1].address, "vk-node");
        assert_eq!(node.node_info.operating_system, "Linux");
    }

    #[test]
    fn test_set_condition_transition_time() {
        let mut node = descriptor(None);
        let t0 = Utc::now();
        node.set_condition(
            NodeConditionType::Ready,
            ConditionStatus::True,
            "KubeletReady",
            "kubelet is ready.",
            t0,
        );
        let t1 = t0 + chrono::Duration::seconds(10);
        node.set_condition(
            NodeConditionType::Ready,
            ConditionStatus::True,
            "KubeletReady",
            "kubelet is ready.",
            t1,
        );

        let ready = node.condition(NodeConditionType::Ready).unwrap();
        assert_eq!(ready.last_transition_time, t0);
        assert_eq!(ready.last_heartbeat_time, t1);
        assert!(node.is_ready());
    }

    #[test]
    fn test_serializes_camel_case() {
        let json = serde_json::to_value(descriptor(None)).unwrap();
        assert_eq!(json["daemonEndpointPort"], 10250);
        assert_eq!(json["capacity"]["memory"], "10Gi");
        assert_eq!(json["conditions"][0]["type"], "Ready");
    }
}
