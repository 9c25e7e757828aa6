//! Interactive stream router: logs, exec, attach, and port-forward.
//!
//! Each request becomes one session that owns a client-facing channel and a
//! backend-facing channel. Sessions are independent tasks; a stuck session
//! never affects another one on the same pod.
//!
//! ## Session lifetime
//!
//! ```text
//! open (backend side) -> pump -> ClientClosed | BackendClosed | IdleTimeout
//!                                | ClientError | BackendError | Shutdown
//! ```
//!
//! Whatever ends the pump, both sides are shut down before it returns, so
//! closing the client never leaves a backend stream behind.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::backend::{with_deadline, BoxedDuplex, ByteStream, ExecOptions, LogOptions};
use crate::error::ProviderError;
use crate::pod::PodKey;
use crate::pods::PodManager;

const PUMP_BUFFER: usize = 16 * 1024;
const CLOSE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionKind {
    Logs,
    Exec,
    Attach,
    PortForward,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: Uuid,
    pub kind: SessionKind,
    pub pod: PodKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub opened_at: DateTime<Utc>,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    ClientClosed,
    BackendClosed,
    IdleTimeout,
    ClientError,
    BackendError,
    Shutdown,
}

// =============================================================================
// Session Registry
// =============================================================================

#[derive(Default)]
struct SessionRegistry {
    sessions: Mutex<HashMap<Uuid, SessionInfo>>,
}

impl SessionRegistry {
    fn open(self: &Arc<Self>, info: SessionInfo) -> SessionGuard {
        let id = info.id;
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, info);
        SessionGuard {
            id,
            registry: Arc::clone(self),
        }
    }

    fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<_> = sessions.values().cloned().collect();
        list.sort_by_key(|s| s.opened_at);
        list
    }
}

/// Deregisters its session when dropped.
struct SessionGuard {
    id: Uuid,
    registry: Arc<SessionRegistry>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

// =============================================================================
// Pump
// =============================================================================

/// How one direction of a pump stopped.
enum Transfer {
    ReadClosed,
    ReadFailed,
    WriteFailed,
}

/// Copy `rd` into `wr`, stamping `last` each time a chunk is delivered.
async fn transfer<R, W>(rd: &mut R, wr: &mut W, last: &Mutex<Instant>) -> Transfer
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PUMP_BUFFER];
    loop {
        let n = match rd.read(&mut buf).await {
            Ok(0) => return Transfer::ReadClosed,
            Ok(n) => n,
            Err(_) => return Transfer::ReadFailed,
        };
        if wr.write_all(&buf[..n]).await.is_err() {
            return Transfer::WriteFailed;
        }
        *last.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }
}

/// Copy bytes both ways until either side closes, errors, or goes idle.
///
/// The two directions run concurrently, so a peer that stops reading stalls
/// only its own direction. The idle timer restarts whenever a chunk is
/// delivered in either direction; a stalled write does not count.
pub async fn pump<C, B>(
    client: C,
    backend: B,
    idle_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> SessionEnd
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut backend_rd, mut backend_wr) = tokio::io::split(backend);
    let last = Mutex::new(Instant::now());

    let end = {
        let upstream = transfer(&mut client_rd, &mut backend_wr, &last);
        let downstream = transfer(&mut backend_rd, &mut client_wr, &last);

        let idle = async {
            loop {
                let deadline = *last.lock().unwrap_or_else(PoisonError::into_inner) + idle_timeout;
                if Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep_until(deadline).await;
            }
        };

        let stopped = async {
            loop {
                if shutdown.changed().await.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        };

        tokio::select! {
            up = upstream => match up {
                Transfer::ReadClosed => SessionEnd::ClientClosed,
                Transfer::ReadFailed => SessionEnd::ClientError,
                Transfer::WriteFailed => SessionEnd::BackendError,
            },
            down = downstream => match down {
                Transfer::ReadClosed => SessionEnd::BackendClosed,
                Transfer::ReadFailed => SessionEnd::BackendError,
                Transfer::WriteFailed => SessionEnd::ClientError,
            },
            _ = idle => SessionEnd::IdleTimeout,
            _ = stopped => SessionEnd::Shutdown,
        }
    };

    // A writer whose peer stopped reading may never flush; bound the close.
    let _ = tokio::time::timeout(CLOSE_GRACE, backend_wr.shutdown()).await;
    let _ = tokio::time::timeout(CLOSE_GRACE, client_wr.shutdown()).await;
    end
}

// =============================================================================
// Router
// =============================================================================

/// An opened backend channel waiting for its client side.
pub struct Session {
    info: SessionInfo,
    backend: BoxedDuplex,
    idle_timeout: Duration,
    shutdown: watch::Receiver<bool>,
    _guard: SessionGuard,
}

impl Session {
    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Bridge `client` to the backend until the session ends.
    pub async fn run<C>(self, client: C) -> SessionEnd
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let Session {
            info,
            backend,
            idle_timeout,
            shutdown,
            _guard,
        } = self;

        let end = pump(client, backend, idle_timeout, shutdown).await;
        info!(
            session = %info.id,
            kind = ?info.kind,
            pod = %info.pod,
            end = ?end,
            "Stream session closed"
        );
        end
    }
}

pub struct StreamRouter {
    pods: Arc<PodManager>,
    idle_timeout: Duration,
    shutdown: watch::Receiver<bool>,
    registry: Arc<SessionRegistry>,
}

impl StreamRouter {
    pub fn new(pods: Arc<PodManager>, idle_timeout: Duration, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            pods,
            idle_timeout,
            shutdown,
            registry: Arc::new(SessionRegistry::default()),
        }
    }

    pub fn active_sessions(&self) -> Vec<SessionInfo> {
        self.registry.list()
    }

    fn session_info(
        kind: SessionKind,
        pod: &PodKey,
        container: Option<&str>,
        port: Option<u16>,
    ) -> SessionInfo {
        SessionInfo {
            id: Uuid::new_v4(),
            kind,
            pod: pod.clone(),
            container: container.map(str::to_string),
            port,
            opened_at: Utc::now(),
        }
    }

    fn session(&self, info: SessionInfo, backend: BoxedDuplex) -> Session {
        debug!(session = %info.id, kind = ?info.kind, pod = %info.pod, "Stream session opened");
        let guard = self.registry.open(info.clone());
        Session {
            info,
            backend,
            idle_timeout: self.idle_timeout,
            shutdown: self.shutdown.clone(),
            _guard: guard,
        }
    }

    /// Container log stream; unbounded when following.
    pub async fn open_logs(
        &self,
        pod: &PodKey,
        container: &str,
        opts: &LogOptions,
    ) -> Result<ByteStream, ProviderError> {
        let handle = self.pods.stream_target(pod, container, false).await?;
        let backend = self.pods.backend();
        let stream = with_deadline(
            self.pods.settings().backend_timeout,
            "logs",
            backend.logs(&handle, container, opts),
        )
        .await?;

        let info = Self::session_info(SessionKind::Logs, pod, Some(container), None);
        debug!(session = %info.id, pod = %pod, container, follow = opts.follow, "Log stream opened");
        let guard = self.registry.open(info);

        // The guard lives as long as the stream does.
        Ok(Box::pin(stream.map(move |chunk| {
            let _ = &guard;
            chunk
        })))
    }

    pub async fn exec(
        &self,
        pod: &PodKey,
        container: &str,
        opts: &ExecOptions,
    ) -> Result<Session, ProviderError> {
        let handle = self.pods.stream_target(pod, container, true).await?;
        let backend = self.pods.backend();
        let channel = with_deadline(
            self.pods.settings().backend_timeout,
            "exec",
            backend.exec(&handle, container, opts),
        )
        .await?;
        Ok(self.session(
            Self::session_info(SessionKind::Exec, pod, Some(container), None),
            channel,
        ))
    }

    pub async fn attach(&self, pod: &PodKey, container: &str) -> Result<Session, ProviderError> {
        let handle = self.pods.stream_target(pod, container, true).await?;
        let backend = self.pods.backend();
        let channel = with_deadline(
            self.pods.settings().backend_timeout,
            "attach",
            backend.attach(&handle, container),
        )
        .await?;
        Ok(self.session(
            Self::session_info(SessionKind::Attach, pod, Some(container), None),
            channel,
        ))
    }

    pub async fn port_forward(&self, pod: &PodKey, port: u16) -> Result<Session, ProviderError> {
        let handle = self.pods.running_pod(pod).await?;
        let backend = self.pods.backend();
        let channel = with_deadline(
            self.pods.settings().backend_timeout,
            "port-forward",
            backend.port_forward(&handle, port),
        )
        .await?;
        Ok(self.session(
            Self::session_info(SessionKind::PortForward, pod, None, Some(port)),
            channel,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pump_copies_both_ways_until_client_closes() {
        let (client, mut client_peer) = tokio::io::duplex(64);
        let (backend, mut backend_peer) = tokio::io::duplex(64);
        let (_tx, rx) = watch::channel(false);

        let task = tokio::spawn(pump(client, backend, Duration::from_secs(60), rx));

        client_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        backend_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        backend_peer.write_all(b"pong").await.unwrap();
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client_peer);
        assert_eq!(task.await.unwrap(), SessionEnd::ClientClosed);

        // Backend side observes EOF.
        let mut rest = Vec::new();
        backend_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_pump_shutdown_signal() {
        let (client, _client_peer) = tokio::io::duplex(64);
        let (backend, _backend_peer) = tokio::io::duplex(64);
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(pump(client, backend, Duration::from_secs(60), rx));
        tx.send(true).unwrap();
        assert_eq!(task.await.unwrap(), SessionEnd::Shutdown);
    }

    /// Backend peer that writes until its channel closes.
    fn flood(mut peer: tokio::io::DuplexStream) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let chunk = [b'x'; 512];
            while peer.write_all(&chunk).await.is_ok() {}
        })
    }

    #[tokio::test]
    async fn test_pump_idle_timeout_with_stalled_reader() {
        // The client never reads, so the client-bound write blocks.
        let (client, _client_peer) = tokio::io::duplex(64);
        let (backend, backend_peer) = tokio::io::duplex(64);
        let (_tx, rx) = watch::channel(false);
        let flooder = flood(backend_peer);

        let end = tokio::time::timeout(
            Duration::from_secs(3),
            pump(client, backend, Duration::from_millis(100), rx),
        )
        .await
        .expect("pump did not end on idle");
        assert_eq!(end, SessionEnd::IdleTimeout);

        // The backend writer sees its channel close.
        tokio::time::timeout(Duration::from_secs(1), flooder)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_pump_shutdown_with_stalled_reader() {
        let (client, _client_peer) = tokio::io::duplex(64);
        let (backend, backend_peer) = tokio::io::duplex(64);
        let (tx, rx) = watch::channel(false);
        let _flooder = flood(backend_peer);

        let task = tokio::spawn(pump(client, backend, Duration::from_secs(60), rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let end = tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("pump did not end on shutdown")
            .unwrap();
        assert_eq!(end, SessionEnd::Shutdown);
    }

    #[test]
    fn test_registry_guard_deregisters() {
        let registry = Arc::new(SessionRegistry::default());
        let pod = PodKey::new("default", "a");
        let guard = registry.open(StreamRouter::session_info(
            SessionKind::Exec,
            &pod,
            Some("app"),
            None,
        ));
        assert_eq!(registry.list().len(), 1);
        drop(guard);
        assert!(registry.list().is_empty());
    }
}
