//! Integration tests for interactive stream sessions.
//!
//! Verifies that sessions:
//! - Carry bytes both ways between client and backend
//! - Release the backend channel whichever side closes first
//! - End on idle timeout and on shutdown, even when a peer stops reading
//! - Refuse containers that are not running

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;

use vnode_agent::backend::{Backend, ExecOptions, LogOptions, MockBackend};
use vnode_agent::pod::{ContainerSpec, PodKey, PodSpec};
use vnode_agent::pods::{PodManager, PodSettings};
use vnode_agent::streams::{SessionEnd, SessionKind, StreamRouter};
use vnode_agent::ProviderError;

struct Fixture {
    backend: Arc<MockBackend>,
    router: StreamRouter,
    key: PodKey,
    shutdown: watch::Sender<bool>,
}

async fn running_pod(idle_timeout: Duration) -> Fixture {
    let backend = Arc::new(MockBackend::new());
    let pods = Arc::new(PodManager::new(backend.clone(), PodSettings::default()));
    let spec = PodSpec::new("default", "shell", vec![ContainerSpec::new("app", "busybox")]);
    let key = spec.key();

    pods.create(spec).await.unwrap();
    let batch = backend.poll().await.unwrap();
    pods.apply_observations(&batch).await;

    let (shutdown, shutdown_rx) = watch::channel(false);
    Fixture {
        router: StreamRouter::new(pods, idle_timeout, shutdown_rx),
        backend,
        key,
        shutdown,
    }
}

fn command(args: &[&str]) -> ExecOptions {
    ExecOptions {
        command: args.iter().map(|s| s.to_string()).collect(),
        tty: false,
        stdin: true,
    }
}

async fn wait_for_streams(backend: &MockBackend, expected: usize) -> bool {
    for _ in 0..200 {
        if backend.open_streams() == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

#[tokio::test]
async fn test_exec_output_then_backend_close() {
    let f = running_pod(Duration::from_secs(60)).await;
    let session = f
        .router
        .exec(&f.key, "app", &command(&["echo", "hello", "world"]))
        .await
        .unwrap();
    assert_eq!(session.info().kind, SessionKind::Exec);

    let (client, mut peer) = tokio::io::duplex(1024);
    let task = tokio::spawn(session.run(client));

    let mut output = String::new();
    peer.read_to_string(&mut output).await.unwrap();
    assert_eq!(output, "hello world\n");
    assert_eq!(task.await.unwrap(), SessionEnd::BackendClosed);
    assert!(wait_for_streams(&f.backend, 0).await);
}

#[tokio::test]
async fn test_client_close_releases_backend_stream() {
    let f = running_pod(Duration::from_secs(60)).await;
    let session = f.router.exec(&f.key, "app", &command(&["sh"])).await.unwrap();
    assert_eq!(f.backend.open_streams(), 1);
    assert_eq!(f.router.active_sessions().len(), 1);

    let (client, mut peer) = tokio::io::duplex(1024);
    let task = tokio::spawn(session.run(client));

    peer.write_all(b"ls\n").await.unwrap();
    let mut buf = [0u8; 3];
    peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ls\n");

    drop(peer);
    assert_eq!(task.await.unwrap(), SessionEnd::ClientClosed);
    assert!(wait_for_streams(&f.backend, 0).await);
    assert!(f.router.active_sessions().is_empty());
}

#[tokio::test]
async fn test_idle_session_times_out() {
    let f = running_pod(Duration::from_millis(50)).await;
    let session = f.router.attach(&f.key, "app").await.unwrap();

    let (client, _peer) = tokio::io::duplex(1024);
    let end = tokio::time::timeout(Duration::from_secs(5), session.run(client))
        .await
        .unwrap();
    assert_eq!(end, SessionEnd::IdleTimeout);
    assert!(wait_for_streams(&f.backend, 0).await);
}

#[tokio::test]
async fn test_idle_timeout_when_client_stops_reading() {
    let f = running_pod(Duration::from_millis(100)).await;
    let session = f.router.exec(&f.key, "app", &command(&["yes"])).await.unwrap();
    assert_eq!(f.backend.open_streams(), 1);

    // The client never reads, so output backs up behind it.
    let (client, _peer) = tokio::io::duplex(1024);
    let end = tokio::time::timeout(Duration::from_secs(5), session.run(client))
        .await
        .expect("session did not end");
    assert_eq!(end, SessionEnd::IdleTimeout);
    assert!(wait_for_streams(&f.backend, 0).await);
    assert!(f.router.active_sessions().is_empty());
}

#[tokio::test]
async fn test_client_disconnect_cancels_busy_backend_stream() {
    let f = running_pod(Duration::from_secs(60)).await;
    let session = f.router.exec(&f.key, "app", &command(&["yes"])).await.unwrap();

    let (client, mut peer) = tokio::io::duplex(1024);
    let task = tokio::spawn(session.run(client));

    let mut buf = [0u8; 4];
    peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"y\ny\n");
    drop(peer);

    let end = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("session did not end")
        .unwrap();
    assert!(
        matches!(end, SessionEnd::ClientClosed | SessionEnd::ClientError),
        "unexpected end: {end:?}"
    );
    assert!(wait_for_streams(&f.backend, 0).await);
}

#[tokio::test]
async fn test_shutdown_ends_session_with_stalled_client() {
    let f = running_pod(Duration::from_secs(60)).await;
    let session = f.router.exec(&f.key, "app", &command(&["yes"])).await.unwrap();

    let (client, _peer) = tokio::io::duplex(1024);
    let task = tokio::spawn(session.run(client));
    tokio::time::sleep(Duration::from_millis(50)).await;
    f.shutdown.send(true).unwrap();

    let end = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("session did not end")
        .unwrap();
    assert_eq!(end, SessionEnd::Shutdown);
    assert!(wait_for_streams(&f.backend, 0).await);
}

#[tokio::test]
async fn test_shutdown_ends_sessions() {
    let f = running_pod(Duration::from_secs(60)).await;
    let session = f.router.port_forward(&f.key, 8080).await.unwrap();
    assert_eq!(session.info().port, Some(8080));

    let (client, _peer) = tokio::io::duplex(1024);
    let task = tokio::spawn(session.run(client));
    f.shutdown.send(true).unwrap();
    assert_eq!(task.await.unwrap(), SessionEnd::Shutdown);
}

#[tokio::test]
async fn test_exec_into_unknown_container() {
    let f = running_pod(Duration::from_secs(60)).await;
    let err = f
        .router
        .exec(&f.key, "sidecar", &command(&["sh"]))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, ProviderError::NotFound(_)));
    assert_eq!(f.backend.open_streams(), 0);
}

#[tokio::test]
async fn test_exec_into_waiting_container() {
    let backend = Arc::new(MockBackend::new().without_auto_run());
    let pods = Arc::new(PodManager::new(backend.clone(), PodSettings::default()));
    let spec = PodSpec::new("default", "slow", vec![ContainerSpec::new("app", "busybox")]);
    let key = spec.key();
    pods.create(spec).await.unwrap();

    let (_tx, rx) = watch::channel(false);
    let router = StreamRouter::new(pods, Duration::from_secs(60), rx);
    let err = router.exec(&key, "app", &command(&["sh"])).await.err().unwrap();
    assert!(matches!(err, ProviderError::NotFound(_)));

    let err = router.port_forward(&key, 80).await.err().unwrap();
    assert!(matches!(err, ProviderError::NotFound(_)));
}

#[tokio::test]
async fn test_follow_logs() {
    let f = running_pod(Duration::from_secs(60)).await;
    f.backend.append_log(&f.key, "app", "first").await;

    let opts = LogOptions {
        follow: true,
        ..Default::default()
    };
    let mut logs = f.router.open_logs(&f.key, "app", &opts).await.unwrap();
    assert_eq!(f.router.active_sessions().len(), 1);

    let chunk = logs.next().await.unwrap().unwrap();
    assert_eq!(&chunk[..], b"first\n");

    f.backend.append_log(&f.key, "app", "second").await;
    let chunk = logs.next().await.unwrap().unwrap();
    assert_eq!(&chunk[..], b"second\n");

    drop(logs);
    assert!(f.router.active_sessions().is_empty());
}

#[tokio::test]
async fn test_tail_lines() {
    let f = running_pod(Duration::from_secs(60)).await;
    for line in ["a", "b", "c"] {
        f.backend.append_log(&f.key, "app", line).await;
    }

    let opts = LogOptions {
        tail_lines: Some(2),
        ..Default::default()
    };
    let chunks: Vec<_> = f
        .router
        .open_logs(&f.key, "app", &opts)
        .await
        .unwrap()
        .collect()
        .await;
    let text: String = chunks
        .into_iter()
        .map(|c| String::from_utf8(c.unwrap().to_vec()).unwrap())
        .collect();
    assert_eq!(text, "b\nc\n");
}
