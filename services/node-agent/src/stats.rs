//! Pull-based resource usage export.
//!
//! Every scrape walks the tracked pods and asks the backend for a fresh
//! sample. Nothing is cached between scrapes. Containers without a sample are
//! left out rather than reported as zero, and aggregates are absent when no
//! sample contributed to them.

use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::backend::{with_deadline, ContainerUsage};
use crate::pods::PodManager;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodReference {
    pub namespace: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStats {
    pub pod_ref: PodReference,
    pub containers: Vec<ContainerUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_nano_cores: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_working_set_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    pub node_name: String,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_nano_cores: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_working_set_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSummary {
    pub node: NodeStats,
    pub pods: Vec<PodStats>,
    pub collected_at: DateTime<Utc>,
}

/// Sum of the present values; `None` when none are present.
fn sum_present(values: impl IntoIterator<Item = Option<u64>>) -> Option<u64> {
    values
        .into_iter()
        .flatten()
        .fold(None, |acc, v| Some(acc.unwrap_or(0).saturating_add(v)))
}

pub struct StatsExporter {
    pods: Arc<PodManager>,
    node_name: String,
    started_at: DateTime<Utc>,
}

impl StatsExporter {
    pub fn new(pods: Arc<PodManager>, node_name: impl Into<String>) -> Self {
        Self {
            pods,
            node_name: node_name.into(),
            started_at: Utc::now(),
        }
    }

    /// Snapshot usage of every tracked pod.
    pub async fn summary(&self) -> StatsSummary {
        let backend = self.pods.backend();
        let timeout = self.pods.settings().backend_timeout;
        let mut pods = Vec::new();

        for (key, uid, handle) in self.pods.tracked_handles().await {
            let containers = match with_deadline(timeout, "stats", backend.stats(&handle)).await {
                Ok(containers) => containers,
                Err(e) => {
                    debug!(pod = %key, error = %e, "No stats for pod");
                    continue;
                }
            };
            if containers.is_empty() {
                continue;
            }

            pods.push(PodStats {
                cpu_nano_cores: sum_present(containers.iter().map(|c| c.cpu_nano_cores)),
                memory_working_set_bytes: sum_present(
                    containers.iter().map(|c| c.memory_working_set_bytes),
                ),
                pod_ref: PodReference {
                    namespace: key.namespace,
                    name: key.name,
                    uid,
                },
                containers,
            });
        }

        StatsSummary {
            node: NodeStats {
                node_name: self.node_name.clone(),
                start_time: self.started_at,
                cpu_nano_cores: sum_present(pods.iter().map(|p| p.cpu_nano_cores)),
                memory_working_set_bytes: sum_present(
                    pods.iter().map(|p| p.memory_working_set_bytes),
                ),
            },
            pods,
            collected_at: Utc::now(),
        }
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

struct Family {
    name: &'static str,
    help: &'static str,
    samples: Vec<(String, u64)>,
}

impl Family {
    fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            samples: Vec::new(),
        }
    }

    fn push(&mut self, labels: String, value: Option<u64>) {
        if let Some(value) = value {
            self.samples.push((labels, value));
        }
    }

    fn render(&self, out: &mut String, timestamp_ms: i64) {
        if self.samples.is_empty() {
            return;
        }
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} gauge", self.name);
        for (labels, value) in &self.samples {
            if labels.is_empty() {
                let _ = writeln!(out, "{} {} {}", self.name, value, timestamp_ms);
            } else {
                let _ = writeln!(out, "{}{{{}}} {} {}", self.name, labels, value, timestamp_ms);
            }
        }
    }
}

/// Render a summary in the Prometheus text exposition format.
pub fn render_resource_metrics(summary: &StatsSummary) -> String {
    let mut node_cpu = Family::new(
        "node_cpu_usage_nano_cores",
        "CPU usage of the node in nanocores",
    );
    let mut node_memory = Family::new(
        "node_memory_working_set_bytes",
        "Memory working set of the node in bytes",
    );
    let mut pod_cpu = Family::new("pod_cpu_usage_nano_cores", "CPU usage of the pod in nanocores");
    let mut pod_memory = Family::new(
        "pod_memory_working_set_bytes",
        "Memory working set of the pod in bytes",
    );
    let mut container_cpu = Family::new(
        "container_cpu_usage_nano_cores",
        "CPU usage of the container in nanocores",
    );
    let mut container_memory = Family::new(
        "container_memory_working_set_bytes",
        "Memory working set of the container in bytes",
    );

    node_cpu.push(String::new(), summary.node.cpu_nano_cores);
    node_memory.push(String::new(), summary.node.memory_working_set_bytes);

    for pod in &summary.pods {
        let pod_labels = format!(
            "namespace=\"{}\",pod=\"{}\"",
            escape_label(&pod.pod_ref.namespace),
            escape_label(&pod.pod_ref.name)
        );
        pod_cpu.push(pod_labels.clone(), pod.cpu_nano_cores);
        pod_memory.push(pod_labels.clone(), pod.memory_working_set_bytes);

        for container in &pod.containers {
            let labels = format!("container=\"{}\",{}", escape_label(&container.name), pod_labels);
            container_cpu.push(labels.clone(), container.cpu_nano_cores);
            container_memory.push(labels, container.memory_working_set_bytes);
        }
    }

    let timestamp_ms = summary.collected_at.timestamp_millis();
    let mut out = String::new();
    for family in [
        &node_cpu,
        &node_memory,
        &pod_cpu,
        &pod_memory,
        &container_cpu,
        &container_memory,
    ] {
        family.render(&mut out, timestamp_ms);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(name: &str, cpu: Option<u64>, memory: Option<u64>) -> ContainerUsage {
        ContainerUsage {
            name: name.to_string(),
            timestamp: Utc::now(),
            cpu_nano_cores: cpu,
            memory_working_set_bytes: memory,
            ..Default::default()
        }
    }

    #[test]
    fn test_sum_present() {
        assert_eq!(sum_present([None, None]), None);
        assert_eq!(sum_present([Some(1), None, Some(2)]), Some(3));
        assert_eq!(sum_present(Vec::<Option<u64>>::new()), None);
    }

    #[test]
    fn test_render_omits_missing_samples() {
        let summary = StatsSummary {
            node: NodeStats {
                node_name: "vk-node".to_string(),
                start_time: Utc::now(),
                cpu_nano_cores: Some(500),
                memory_working_set_bytes: None,
            },
            pods: vec![PodStats {
                pod_ref: PodReference {
                    namespace: "default".to_string(),
                    name: "a".to_string(),
                    uid: None,
                },
                containers: vec![usage("app", Some(500), None)],
                cpu_nano_cores: Some(500),
                memory_working_set_bytes: None,
            }],
            collected_at: Utc::now(),
        };

        let text = render_resource_metrics(&summary);
        assert!(text.contains("# TYPE node_cpu_usage_nano_cores gauge"));
        assert!(text.contains(
            "container_cpu_usage_nano_cores{container=\"app\",namespace=\"default\",pod=\"a\"} 500"
        ));
        assert!(!text.contains("memory_working_set_bytes"));
    }

    #[test]
    fn test_escape_label() {
        assert_eq!(escape_label("a\"b\\c\n"), "a\\\"b\\\\c\\n");
    }
}
