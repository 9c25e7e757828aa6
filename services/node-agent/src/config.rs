//! Configuration for the virtual node agent.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use vnode_reconcile::BackoffPolicy;

use crate::pods::PodSettings;
use crate::reconciler::ReconcilerConfig;
use crate::resources::{Cpu, Memory, ResourceList};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}' ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Retry behaviour for backend calls.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub backoff: BackoffPolicy,
    /// Retries after the first attempt.
    pub max_retries: u32,
}

/// Virtual node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Node name registered with the control plane.
    pub node_name: String,

    /// Control plane API URL.
    pub control_plane_url: String,

    /// Listen address for the stream, provider, and metrics endpoints.
    pub listen_addr: SocketAddr,

    /// Static node capacity.
    pub capacity: ResourceList,

    /// Held back from allocatable.
    pub reserved: ResourceList,

    /// Recompute allocatable from committed pod requests on every tick.
    pub dynamic_allocatable: bool,

    /// Node status publication interval.
    pub heartbeat_interval: Duration,

    /// How long the backend may be unreachable before the node is not Ready.
    pub backend_grace_period: Duration,

    /// Deadline for a single backend call.
    pub backend_timeout: Duration,

    /// Backend poll interval.
    pub observe_interval: Duration,

    /// Interval for retrying stalled pods and failed reports.
    pub resync_interval: Duration,

    pub retry: RetryConfig,

    /// Idle timeout for interactive stream sessions.
    pub stream_idle_timeout: Duration,

    /// Address advertised as the node's InternalIP and pods' hostIP.
    pub internal_ip: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: "vk-node".to_string(),
            control_plane_url: "http://127.0.0.1:8080".to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 10250)),
            capacity: ResourceList::new(Cpu::from_cores(20), Memory::from_gibibytes(10), 100),
            reserved: ResourceList::default(),
            dynamic_allocatable: false,
            heartbeat_interval: Duration::from_secs(10),
            backend_grace_period: Duration::from_secs(30),
            backend_timeout: Duration::from_secs(10),
            observe_interval: Duration::from_secs(2),
            resync_interval: Duration::from_secs(30),
            retry: RetryConfig {
                backoff: BackoffPolicy::default(),
                max_retries: vnode_reconcile::DEFAULT_MAX_RETRIES,
            },
            stream_idle_timeout: Duration::from_secs(300),
            internal_ip: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let env = Env { lookup };

        let mut backoff = defaults.retry.backoff.clone();
        backoff.base = env.millis("VNODE_RETRY_BASE_MS", backoff.base)?;
        backoff.max = env.millis("VNODE_RETRY_MAX_MS", backoff.max)?;

        Ok(Self {
            node_name: env.string("VNODE_NODE_NAME", defaults.node_name),
            control_plane_url: env.string("VNODE_CONTROL_PLANE_URL", defaults.control_plane_url),
            listen_addr: env.parsed("VNODE_LISTEN_ADDR", defaults.listen_addr)?,
            capacity: ResourceList::new(
                env.parsed("VNODE_CPU_CAPACITY", defaults.capacity.cpu)?,
                env.parsed("VNODE_MEMORY_CAPACITY", defaults.capacity.memory)?,
                env.parsed("VNODE_MAX_PODS", defaults.capacity.pods)?,
            ),
            reserved: ResourceList::new(
                env.parsed("VNODE_CPU_RESERVED", defaults.reserved.cpu)?,
                env.parsed("VNODE_MEMORY_RESERVED", defaults.reserved.memory)?,
                0,
            ),
            dynamic_allocatable: env.parsed("VNODE_DYNAMIC_ALLOCATABLE", defaults.dynamic_allocatable)?,
            heartbeat_interval: env.period("VNODE_HEARTBEAT_INTERVAL", defaults.heartbeat_interval)?,
            backend_grace_period: env
                .secs("VNODE_BACKEND_GRACE_PERIOD", defaults.backend_grace_period)?,
            backend_timeout: env.period("VNODE_BACKEND_TIMEOUT", defaults.backend_timeout)?,
            observe_interval: env.period("VNODE_OBSERVE_INTERVAL", defaults.observe_interval)?,
            resync_interval: env.period("VNODE_RESYNC_INTERVAL", defaults.resync_interval)?,
            retry: RetryConfig {
                backoff,
                max_retries: env.parsed("VNODE_MAX_RETRIES", defaults.retry.max_retries)?,
            },
            stream_idle_timeout: env
                .period("VNODE_STREAM_IDLE_TIMEOUT", defaults.stream_idle_timeout)?,
            internal_ip: env.optional("VNODE_INTERNAL_IP"),
            log_level: env.string("VNODE_LOG_LEVEL", defaults.log_level),
        })
    }

    pub fn pod_settings(&self) -> PodSettings {
        PodSettings {
            capacity: self.capacity,
            reserved: self.reserved,
            dynamic_allocatable: self.dynamic_allocatable,
            backoff: self.retry.backoff.clone(),
            max_retries: self.retry.max_retries,
            backend_timeout: self.backend_timeout,
            host_ip: self.internal_ip.clone(),
        }
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            observe_interval: self.observe_interval,
            resync_interval: self.resync_interval,
        }
    }

    /// Capacity minus reserved.
    pub fn allocatable(&self) -> ResourceList {
        let mut allocatable = self.capacity.saturating_sub(&self.reserved);
        allocatable.pods = self.capacity.pods;
        allocatable
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn optional(&self, var: &str) -> Option<String> {
        (self.lookup)(var).filter(|v| !v.trim().is_empty())
    }

    fn string(&self, var: &str, default: String) -> String {
        self.optional(var).unwrap_or(default)
    }

    fn parsed<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(var) {
            Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            }),
            None => Ok(default),
        }
    }

    fn secs(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parsed(var, default.as_secs()).map(Duration::from_secs)
    }

    /// Like `secs`, but zero is refused; these feed timers and deadlines.
    fn period(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let period = self.secs(var, default)?;
        if period.is_zero() {
            return Err(ConfigError::Invalid {
                var,
                value: "0".to_string(),
                reason: "must be at least one second".to_string(),
            });
        }
        Ok(period)
    }

    fn millis(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parsed(var, default.as_millis() as u64)
            .map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.node_name, "vk-node");
        assert_eq!(config.listen_addr.port(), 10250);
        assert_eq!(config.capacity.cpu, Cpu::from_cores(20));
        assert_eq!(config.capacity.memory, Memory::from_gibibytes(10));
        assert_eq!(config.capacity.pods, 100);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.retry.max_retries, 4);
        assert!(config.internal_ip.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("VNODE_NODE_NAME", "edge-1"),
            ("VNODE_CPU_CAPACITY", "8"),
            ("VNODE_MEMORY_CAPACITY", "32Gi"),
            ("VNODE_CPU_RESERVED", "500m"),
            ("VNODE_BACKEND_GRACE_PERIOD", "45"),
            ("VNODE_RETRY_BASE_MS", "50"),
            ("VNODE_INTERNAL_IP", "10.1.2.3"),
        ])
        .unwrap();

        assert_eq!(config.node_name, "edge-1");
        assert_eq!(config.allocatable().cpu, Cpu::from_millis(7500));
        assert_eq!(config.allocatable().memory, Memory::from_gibibytes(32));
        assert_eq!(config.backend_grace_period, Duration::from_secs(45));
        assert_eq!(config.retry.backoff.base, Duration::from_millis(50));
        assert_eq!(config.pod_settings().host_ip.as_deref(), Some("10.1.2.3"));
    }

    #[test]
    fn test_invalid_value_is_an_error() {
        let err = load(&[("VNODE_MEMORY_CAPACITY", "lots")]).unwrap_err();
        assert!(err.to_string().contains("VNODE_MEMORY_CAPACITY"));

        assert!(load(&[("VNODE_HEARTBEAT_INTERVAL", "-1")]).is_err());
        assert!(load(&[("VNODE_LISTEN_ADDR", "nowhere")]).is_err());

        for var in [
            "VNODE_HEARTBEAT_INTERVAL",
            "VNODE_OBSERVE_INTERVAL",
            "VNODE_RESYNC_INTERVAL",
            "VNODE_BACKEND_TIMEOUT",
            "VNODE_STREAM_IDLE_TIMEOUT",
        ] {
            let err = load(&[(var, "0")]).unwrap_err();
            assert!(err.to_string().contains(var), "{var}: {err}");
        }
    }
}
