//! In-memory backend for development and tests.
//!
//! Workloads live in a map keyed by handle. Containers start Waiting and move
//! to Running on the next poll (unless auto-run is disabled). Failures can be
//! scripted: unreachable backend, a number of failing starts or stops, and a
//! workload quota.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use super::{
    Backend, BackendError, BackendHandle, BoxedDuplex, ByteStream, ContainerObservation,
    ContainerUsage, ExecOptions, LogOptions, Observation, SpecDelta, UpdatePolicy,
};
use crate::pod::{ContainerRunState, ContainerSpec, PodKey, PodSpec, RestartPolicy};

const STREAM_BUFFER: usize = 8 * 1024;

struct MockContainer {
    spec: ContainerSpec,
    state: ContainerRunState,
    logs: Vec<(DateTime<Utc>, String)>,
}

struct MockWorkload {
    key: PodKey,
    restart_policy: RestartPolicy,
    containers: Vec<MockContainer>,
    pod_ip: String,
    log_tx: broadcast::Sender<(String, DateTime<Utc>, String)>,
}

impl MockWorkload {
    fn container(&self, name: &str) -> Option<&MockContainer> {
        self.containers.iter().find(|c| c.spec.name == name)
    }

    fn container_mut(&mut self, name: &str) -> Option<&mut MockContainer> {
        self.containers.iter_mut().find(|c| c.spec.name == name)
    }

    fn observation(&self, handle: &BackendHandle) -> Observation {
        Observation {
            handle: handle.clone(),
            containers: self
                .containers
                .iter()
                .map(|c| ContainerObservation {
                    name: c.spec.name.clone(),
                    state: c.state.clone(),
                })
                .collect(),
            pod_ip: Some(self.pod_ip.clone()),
        }
    }
}

fn new_container(spec: ContainerSpec) -> MockContainer {
    MockContainer {
        spec,
        state: ContainerRunState::waiting("ContainerCreating"),
        logs: Vec::new(),
    }
}

/// Mock backend for testing and development.
pub struct MockBackend {
    workloads: RwLock<HashMap<BackendHandle, MockWorkload>>,
    update_policy: UpdatePolicy,
    auto_run: bool,
    reachable: AtomicBool,
    failing_starts: AtomicU32,
    failing_stops: AtomicU32,
    /// `usize::MAX` means unlimited.
    quota: AtomicUsize,
    start_calls: AtomicU32,
    stop_calls: AtomicU32,
    ip_counter: AtomicU32,
    open_streams: Arc<AtomicUsize>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            workloads: RwLock::new(HashMap::new()),
            update_policy: UpdatePolicy::InPlace,
            auto_run: true,
            reachable: AtomicBool::new(true),
            failing_starts: AtomicU32::new(0),
            failing_stops: AtomicU32::new(0),
            quota: AtomicUsize::new(usize::MAX),
            start_calls: AtomicU32::new(0),
            stop_calls: AtomicU32::new(0),
            ip_counter: AtomicU32::new(0),
            open_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_update_policy(mut self, policy: UpdatePolicy) -> Self {
        self.update_policy = policy;
        self
    }

    /// Keep containers Waiting until a test moves them explicitly.
    pub fn without_auto_run(mut self) -> Self {
        self.auto_run = false;
        self
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn fail_next_starts(&self, count: u32) {
        self.failing_starts.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_stops(&self, count: u32) {
        self.failing_stops.store(count, Ordering::SeqCst);
    }

    pub fn set_quota(&self, max_workloads: Option<usize>) {
        self.quota
            .store(max_workloads.unwrap_or(usize::MAX), Ordering::SeqCst);
    }

    /// Successful `start` calls that reached the workload map.
    pub fn start_calls(&self) -> u32 {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> u32 {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    pub async fn workload_count(&self) -> usize {
        self.workloads.read().await.len()
    }

    pub async fn contains(&self, key: &PodKey) -> bool {
        self.workloads
            .read()
            .await
            .contains_key(&BackendHandle::for_pod(key))
    }

    /// Override a container's state. Returns false if the container is unknown.
    pub async fn set_container_state(
        &self,
        key: &PodKey,
        container: &str,
        state: ContainerRunState,
    ) -> bool {
        let mut workloads = self.workloads.write().await;
        match workloads
            .get_mut(&BackendHandle::for_pod(key))
            .and_then(|w| w.container_mut(container))
        {
            Some(c) => {
                c.state = state;
                true
            }
            None => false,
        }
    }

    pub async fn terminate(&self, key: &PodKey, container: &str, exit_code: i32) -> bool {
        let reason = if exit_code == 0 { "Completed" } else { "Error" };
        self.set_container_state(key, container, ContainerRunState::terminated(exit_code, reason))
            .await
    }

    /// Append a log line, delivering it to any following readers.
    pub async fn append_log(&self, key: &PodKey, container: &str, line: &str) -> bool {
        let mut workloads = self.workloads.write().await;
        let Some(workload) = workloads.get_mut(&BackendHandle::for_pod(key)) else {
            return false;
        };
        let now = Utc::now();
        let tx = workload.log_tx.clone();
        let Some(c) = workload.container_mut(container) else {
            return false;
        };
        c.logs.push((now, line.to_string()));
        let _ = tx.send((container.to_string(), now, line.to_string()));
        true
    }

    fn check_reachable(&self) -> Result<(), BackendError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Unavailable(
                "mock backend unreachable".to_string(),
            ))
        }
    }

    fn take_injected(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn next_pod_ip(&self) -> String {
        let n = self.ip_counter.fetch_add(1, Ordering::SeqCst) + 2;
        format!("10.42.{}.{}", (n >> 8) & 0xff, n & 0xff)
    }

    async fn running_container(
        &self,
        handle: &BackendHandle,
        container: &str,
    ) -> Result<(), BackendError> {
        let workloads = self.workloads.read().await;
        let workload = workloads
            .get(handle)
            .ok_or_else(|| BackendError::NotFound(handle.to_string()))?;
        match workload.container(container) {
            Some(c) if c.state.is_running() => Ok(()),
            Some(_) => Err(BackendError::NotFound(format!(
                "container {container} is not running"
            ))),
            None => Err(BackendError::NotFound(format!("container {container}"))),
        }
    }

    /// In-process stream whose far end is served by `serve`.
    fn open_stream<F, Fut>(&self, serve: F) -> BoxedDuplex
    where
        F: FnOnce(tokio::io::DuplexStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (client, server) = tokio::io::duplex(STREAM_BUFFER);
        let open = self.open_streams.clone();
        open.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            serve(server).await;
            open.fetch_sub(1, Ordering::SeqCst);
        });
        Box::new(client)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Echo everything back until the peer closes.
async fn echo(mut server: tokio::io::DuplexStream) {
    let mut buf = [0u8; 1024];
    loop {
        match server.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if server.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = server.shutdown().await;
}

fn format_log_line(timestamps: bool, at: &DateTime<Utc>, line: &str) -> Bytes {
    if timestamps {
        Bytes::from(format!("{} {}\n", at.to_rfc3339(), line))
    } else {
        Bytes::from(format!("{line}\n"))
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn update_policy(&self) -> UpdatePolicy {
        self.update_policy
    }

    async fn start(&self, spec: &PodSpec) -> Result<BackendHandle, BackendError> {
        self.check_reachable()?;
        if Self::take_injected(&self.failing_starts) {
            return Err(BackendError::Unavailable(
                "injected start failure".to_string(),
            ));
        }

        let key = spec.key();
        let handle = BackendHandle::for_pod(&key);
        let mut workloads = self.workloads.write().await;

        if workloads.contains_key(&handle) {
            debug!(pod = %key, handle = %handle, "[MOCK] Workload already exists");
            return Ok(handle);
        }
        if workloads.len() >= self.quota.load(Ordering::SeqCst) {
            return Err(BackendError::QuotaExceeded(format!(
                "{} workloads already running",
                workloads.len()
            )));
        }

        info!(
            pod = %key,
            handle = %handle,
            containers = spec.containers.len(),
            "[MOCK] Starting workload"
        );

        let (log_tx, _) = broadcast::channel(64);
        workloads.insert(
            handle.clone(),
            MockWorkload {
                key,
                restart_policy: spec.restart_policy,
                containers: spec.containers.iter().cloned().map(new_container).collect(),
                pod_ip: self.next_pod_ip(),
                log_tx,
            },
        );
        self.start_calls.fetch_add(1, Ordering::SeqCst);

        Ok(handle)
    }

    async fn stop(&self, handle: &BackendHandle) -> Result<(), BackendError> {
        self.check_reachable()?;
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_injected(&self.failing_stops) {
            return Err(BackendError::Unavailable("injected stop failure".to_string()));
        }

        match self.workloads.write().await.remove(handle) {
            Some(workload) => {
                info!(pod = %workload.key, handle = %handle, "[MOCK] Workload stopped");
                Ok(())
            }
            None => Err(BackendError::NotFound(handle.to_string())),
        }
    }

    async fn update(&self, handle: &BackendHandle, delta: &SpecDelta) -> Result<(), BackendError> {
        self.check_reachable()?;
        let mut workloads = self.workloads.write().await;
        let workload = workloads
            .get_mut(handle)
            .ok_or_else(|| BackendError::NotFound(handle.to_string()))?;

        workload
            .containers
            .retain(|c| !delta.removed.contains(&c.spec.name));
        for spec in &delta.changed {
            match workload.container_mut(&spec.name) {
                Some(existing) => *existing = new_container(spec.clone()),
                None => workload.containers.push(new_container(spec.clone())),
            }
        }
        if let Some(policy) = delta.restart_policy {
            workload.restart_policy = policy;
        }

        info!(
            pod = %workload.key,
            changed = delta.changed.len(),
            removed = delta.removed.len(),
            "[MOCK] Workload updated in place"
        );
        Ok(())
    }

    async fn poll(&self) -> Result<Vec<Observation>, BackendError> {
        self.check_reachable()?;
        let mut workloads = self.workloads.write().await;
        let mut batch = Vec::with_capacity(workloads.len());

        for (handle, workload) in workloads.iter_mut() {
            if self.auto_run {
                let policy = workload.restart_policy;
                for c in &mut workload.containers {
                    let start = match &c.state {
                        ContainerRunState::Waiting { .. } => true,
                        ContainerRunState::Terminated { exit_code, .. } => {
                            policy.restarts(*exit_code)
                        }
                        ContainerRunState::Running { .. } => false,
                    };
                    if start {
                        c.state = ContainerRunState::running_now();
                    }
                }
            }
            batch.push(workload.observation(handle));
        }

        Ok(batch)
    }

    async fn ping(&self) -> Result<(), BackendError> {
        self.check_reachable()
    }

    async fn logs(
        &self,
        handle: &BackendHandle,
        container: &str,
        opts: &LogOptions,
    ) -> Result<ByteStream, BackendError> {
        self.check_reachable()?;
        let workloads = self.workloads.read().await;
        let workload = workloads
            .get(handle)
            .ok_or_else(|| BackendError::NotFound(handle.to_string()))?;
        let c = workload
            .container(container)
            .ok_or_else(|| BackendError::NotFound(format!("container {container}")))?;

        let timestamps = opts.timestamps;
        let mut backlog: Vec<_> = c
            .logs
            .iter()
            .filter(|(at, _)| opts.since_time.is_none_or(|since| *at >= since))
            .map(|(at, line)| format_log_line(timestamps, at, line))
            .collect();
        if let Some(tail) = opts.tail_lines {
            let skip = backlog.len().saturating_sub(tail);
            backlog.drain(..skip);
        }
        let backlog = stream::iter(backlog.into_iter().map(Ok));

        if !opts.follow {
            return Ok(Box::pin(backlog));
        }

        // Subscribed under the read lock so no line falls between backlog and live.
        let rx = workload.log_tx.subscribe();
        let container = container.to_string();
        let live = stream::unfold(rx, move |mut rx| {
            let container = container.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok((name, at, line)) if name == container => {
                            return Some((Ok(format_log_line(timestamps, &at, &line)), rx));
                        }
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(Box::pin(backlog.chain(live)))
    }

    async fn exec(
        &self,
        handle: &BackendHandle,
        container: &str,
        opts: &ExecOptions,
    ) -> Result<BoxedDuplex, BackendError> {
        self.check_reachable()?;
        self.running_container(handle, container).await?;

        debug!(handle = %handle, container, command = ?opts.command, "[MOCK] Exec");

        // `echo ...` prints its arguments and exits, `yes` writes until the
        // channel closes, anything else is an interactive echo.
        match opts.command.split_first() {
            Some((program, _)) if program == "yes" => Ok(self.open_stream(|mut server| async move {
                while server.write_all(b"y\n").await.is_ok() {}
            })),
            Some((program, args)) if program == "echo" => {
                let output = format!("{}\n", args.join(" "));
                Ok(self.open_stream(move |mut server| async move {
                    let _ = server.write_all(output.as_bytes()).await;
                    let _ = server.shutdown().await;
                }))
            }
            _ => Ok(self.open_stream(echo)),
        }
    }

    async fn attach(
        &self,
        handle: &BackendHandle,
        container: &str,
    ) -> Result<BoxedDuplex, BackendError> {
        self.check_reachable()?;
        self.running_container(handle, container).await?;
        Ok(self.open_stream(echo))
    }

    async fn port_forward(
        &self,
        handle: &BackendHandle,
        port: u16,
    ) -> Result<BoxedDuplex, BackendError> {
        self.check_reachable()?;
        if !self.workloads.read().await.contains_key(handle) {
            return Err(BackendError::NotFound(handle.to_string()));
        }
        debug!(handle = %handle, port, "[MOCK] Port forward");
        Ok(self.open_stream(echo))
    }

    async fn stats(&self, handle: &BackendHandle) -> Result<Vec<ContainerUsage>, BackendError> {
        self.check_reachable()?;
        let workloads = self.workloads.read().await;
        let workload = workloads
            .get(handle)
            .ok_or_else(|| BackendError::NotFound(handle.to_string()))?;

        // Only running containers have something to report.
        let now = Utc::now();
        Ok(workload
            .containers
            .iter()
            .filter(|c| c.state.is_running())
            .map(|c| ContainerUsage {
                name: c.spec.name.clone(),
                timestamp: now,
                cpu_nano_cores: Some(c.spec.resources.cpu.millis() * 1_000_000 / 2),
                memory_working_set_bytes: Some(c.spec.resources.memory.bytes() / 2),
                network_rx_bytes: None,
                network_tx_bytes: None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{Cpu, Memory};

    fn spec(name: &str) -> PodSpec {
        PodSpec::new(
            "default",
            name,
            vec![ContainerSpec::new("app", "app:v1")
                .with_requests(Cpu::from_cores(1), Memory::from_gibibytes(1))],
        )
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let backend = MockBackend::new();
        let first = backend.start(&spec("a")).await.unwrap();
        let second = backend.start(&spec("a")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(backend.workload_count().await, 1);
        assert_eq!(backend.start_calls(), 1);
    }

    #[tokio::test]
    async fn test_poll_runs_waiting_containers() {
        let backend = MockBackend::new();
        let handle = backend.start(&spec("a")).await.unwrap();

        let batch = backend.poll().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].handle, handle);
        assert!(batch[0].containers[0].state.is_running());
        assert!(batch[0].pod_ip.is_some());
    }

    #[tokio::test]
    async fn test_without_auto_run_stays_waiting() {
        let backend = MockBackend::new().without_auto_run();
        backend.start(&spec("a")).await.unwrap();
        let batch = backend.poll().await.unwrap();
        assert!(!batch[0].containers[0].state.is_running());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let backend = MockBackend::new();
        backend.fail_next_starts(1);
        assert!(matches!(
            backend.start(&spec("a")).await,
            Err(BackendError::Unavailable(_))
        ));
        let handle = backend.start(&spec("a")).await.unwrap();

        backend.fail_next_stops(2);
        assert!(backend.stop(&handle).await.is_err());
        assert!(backend.stop(&handle).await.is_err());
        backend.stop(&handle).await.unwrap();
        assert_eq!(
            backend.stop(&handle).await,
            Err(BackendError::NotFound(handle.to_string()))
        );
    }

    #[tokio::test]
    async fn test_quota() {
        let backend = MockBackend::new();
        backend.set_quota(Some(1));
        backend.start(&spec("a")).await.unwrap();
        assert!(matches!(
            backend.start(&spec("b")).await,
            Err(BackendError::QuotaExceeded(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable() {
        let backend = MockBackend::new();
        backend.set_reachable(false);
        assert!(backend.ping().await.is_err());
        assert!(backend.poll().await.is_err());
    }

    #[tokio::test]
    async fn test_logs_tail() {
        let backend = MockBackend::new();
        let key = PodKey::new("default", "a");
        let handle = backend.start(&spec("a")).await.unwrap();
        for line in ["one", "two", "three"] {
            assert!(backend.append_log(&key, "app", line).await);
        }

        let opts = LogOptions {
            tail_lines: Some(2),
            ..Default::default()
        };
        let chunks: Vec<_> = backend
            .logs(&handle, "app", &opts)
            .await
            .unwrap()
            .collect()
            .await;
        let text: String = chunks
            .into_iter()
            .map(|c| String::from_utf8(c.unwrap().to_vec()).unwrap())
            .collect();
        assert_eq!(text, "two\nthree\n");
    }

    #[tokio::test]
    async fn test_stats_only_for_running_containers() {
        let backend = MockBackend::new().without_auto_run();
        let handle = backend.start(&spec("a")).await.unwrap();
        assert!(backend.stats(&handle).await.unwrap().is_empty());

        backend
            .set_container_state(
                &PodKey::new("default", "a"),
                "app",
                ContainerRunState::running_now(),
            )
            .await;
        let usage = backend.stats(&handle).await.unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].cpu_nano_cores, Some(500_000_000));
    }

    #[tokio::test]
    async fn test_exec_echo_command_closes() {
        let backend = MockBackend::new();
        let handle = backend.start(&spec("a")).await.unwrap();
        backend.poll().await.unwrap();

        let opts = ExecOptions {
            command: vec!["echo".into(), "hello".into()],
            ..Default::default()
        };
        let mut stream = backend.exec(&handle, "app", &opts).await.unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello\n");
    }
}
