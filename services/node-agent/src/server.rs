//! HTTP surface of the node agent.
//!
//! Serves the provider API used by the control plane (pod create, update,
//! delete, get, list, status), the interactive stream endpoints (logs, exec,
//! attach, port-forward) and the pull-based usage endpoints.
//!
//! Pod mutations go through the reconciler's event channel so that they share
//! one path with desired state delivered any other way. The handler waits on
//! the event's reply and maps the outcome onto a problem response.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::backend::{ExecOptions, LogOptions};
use crate::error::ProviderError;
use crate::pod::{Pod, PodKey, PodSpec, PodStatus};
use crate::pods::PodManager;
use crate::reconciler::PodEvent;
use crate::stats::{render_resource_metrics, StatsExporter, StatsSummary};
use crate::streams::{Session, SessionInfo, StreamRouter};

const WS_BUFFER: usize = 16 * 1024;

// =============================================================================
// Problem Responses
// =============================================================================

#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub code: String,
    pub retryable: bool,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, detail: impl Into<String>) -> Self {
        Self {
            status,
            problem: Box::new(ProblemDetails {
                r#type: format!("about:blank#{code}"),
                title: status.canonical_reason().unwrap_or("Unknown Error").to_string(),
                status: status.as_u16(),
                detail: detail.into(),
                code: code.to_string(),
                retryable: false,
            }),
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", detail)
    }

    fn retryable(mut self) -> Self {
        self.problem.retryable = true;
        self
    }
}

impl From<ProviderError> for ApiError {
    fn from(err: ProviderError) -> Self {
        let detail = err.to_string();
        match err {
            ProviderError::AdmissionRejected { .. } => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, "admission_rejected", detail)
            }
            ProviderError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, "not_found", detail),
            ProviderError::BackendUnavailable(_) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "backend_unavailable", detail)
                    .retryable()
            }
            ProviderError::QuotaExceeded(_) => {
                Self::new(StatusCode::TOO_MANY_REQUESTS, "quota_exceeded", detail).retryable()
            }
            ProviderError::OrphanTimeout { .. } => {
                Self::new(StatusCode::CONFLICT, "orphan_timeout", detail)
            }
            ProviderError::Unsupported(_) => {
                Self::new(StatusCode::NOT_IMPLEMENTED, "unsupported", detail)
            }
            ProviderError::Internal(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", detail)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

type ApiResult<T> = Result<T, ApiError>;

// =============================================================================
// Router
// =============================================================================

#[derive(Clone)]
pub struct AppState {
    pub pods: Arc<PodManager>,
    pub streams: Arc<StreamRouter>,
    pub stats: Arc<StatsExporter>,
    pub events: mpsc::Sender<PodEvent>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/pods", get(list_pods).post(create_pod))
        .route(
            "/pods/{namespace}/{name}",
            get(get_pod).put(update_pod).delete(delete_pod),
        )
        .route("/pods/{namespace}/{name}/status", get(get_pod_status))
        .route(
            "/containerLogs/{namespace}/{pod}/{container}",
            get(container_logs),
        )
        .route("/exec/{namespace}/{pod}/{container}", get(exec))
        .route("/attach/{namespace}/{pod}/{container}", get(attach))
        .route("/portForward/{namespace}/{pod}", get(port_forward))
        .route("/sessions", get(list_sessions))
        .route("/stats/summary", get(stats_summary))
        .route("/metrics/resource", get(resource_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the shutdown signal flips.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

// =============================================================================
// Pods
// =============================================================================

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    namespace: Option<String>,
}

async fn list_pods(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Json<Vec<Pod>> {
    let pods = match query.namespace {
        Some(namespace) => state.pods.list_namespace(&namespace).await,
        None => state.pods.list().await,
    };
    Json(pods)
}

/// Send an event to the reconciler and wait for its outcome.
async fn submit<F>(state: &AppState, event: F) -> ApiResult<()>
where
    F: FnOnce(oneshot::Sender<Result<(), ProviderError>>) -> PodEvent,
{
    let (tx, rx) = oneshot::channel();
    state.events.send(event(tx)).await.map_err(|_| {
        ApiError::from(ProviderError::Internal("reconciler is not running".into()))
    })?;
    rx.await
        .map_err(|_| ApiError::from(ProviderError::Internal("reconciler dropped the request".into())))?
        .map_err(ApiError::from)
}

async fn created(state: &AppState, key: &PodKey) -> ApiResult<(StatusCode, Json<Pod>)> {
    let pod = state
        .pods
        .get(key)
        .await
        .ok_or_else(|| ProviderError::not_found(format!("pod {key}")))?;
    Ok((StatusCode::CREATED, Json(pod)))
}

async fn create_pod(
    State(state): State<AppState>,
    Json(spec): Json<PodSpec>,
) -> ApiResult<(StatusCode, Json<Pod>)> {
    let key = spec.key();
    debug!(pod = %key, "Create requested");
    submit(&state, |reply| PodEvent::Upsert {
        spec,
        reply: Some(reply),
    })
    .await?;
    created(&state, &key).await
}

async fn update_pod(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(spec): Json<PodSpec>,
) -> ApiResult<Json<Pod>> {
    let key = PodKey::new(namespace, name);
    if spec.key() != key {
        return Err(ApiError::bad_request(format!(
            "body names pod {}, path names {key}",
            spec.key()
        )));
    }
    debug!(pod = %key, "Update requested");
    submit(&state, |reply| PodEvent::Update {
        spec,
        reply: Some(reply),
    })
    .await?;
    let pod = state
        .pods
        .get(&key)
        .await
        .ok_or_else(|| ProviderError::not_found(format!("pod {key}")))?;
    Ok(Json(pod))
}

async fn delete_pod(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let key = PodKey::new(namespace, name);
    debug!(pod = %key, "Delete requested");
    submit(&state, |reply| PodEvent::Delete {
        key,
        reply: Some(reply),
    })
    .await?;
    Ok(StatusCode::ACCEPTED)
}

async fn get_pod(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> ApiResult<Json<Pod>> {
    let key = PodKey::new(namespace, name);
    let pod = state
        .pods
        .get(&key)
        .await
        .ok_or_else(|| ProviderError::not_found(format!("pod {key}")))?;
    Ok(Json(pod))
}

async fn get_pod_status(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> ApiResult<Json<PodStatus>> {
    let status = state.pods.get_status(&PodKey::new(namespace, name)).await?;
    Ok(Json(status))
}

// =============================================================================
// Streams
// =============================================================================

async fn container_logs(
    State(state): State<AppState>,
    Path((namespace, pod, container)): Path<(String, String, String)>,
    Query(opts): Query<LogOptions>,
) -> ApiResult<Response> {
    let key = PodKey::new(namespace, pod);
    let stream = state.streams.open_logs(&key, &container, &opts).await?;
    Ok((
        [(CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(stream),
    )
        .into_response())
}

/// Exec parameters arrive as repeated `command=` pairs plus flags.
fn exec_options(params: &[(String, String)]) -> ApiResult<ExecOptions> {
    let command: Vec<String> = params
        .iter()
        .filter(|(k, _)| k == "command")
        .map(|(_, v)| v.clone())
        .collect();
    if command.is_empty() {
        return Err(ApiError::bad_request("at least one command parameter is required"));
    }
    let flag = |name: &str| {
        params
            .iter()
            .any(|(k, v)| k == name && matches!(v.as_str(), "1" | "true"))
    };
    Ok(ExecOptions {
        command,
        tty: flag("tty"),
        stdin: flag("stdin"),
    })
}

async fn exec(
    State(state): State<AppState>,
    Path((namespace, pod, container)): Path<(String, String, String)>,
    Query(params): Query<Vec<(String, String)>>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let opts = exec_options(&params)?;
    let session = state
        .streams
        .exec(&PodKey::new(namespace, pod), &container, &opts)
        .await?;
    Ok(upgrade(ws, session))
}

async fn attach(
    State(state): State<AppState>,
    Path((namespace, pod, container)): Path<(String, String, String)>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let session = state
        .streams
        .attach(&PodKey::new(namespace, pod), &container)
        .await?;
    Ok(upgrade(ws, session))
}

#[derive(Debug, Deserialize)]
struct PortQuery {
    port: u16,
}

async fn port_forward(
    State(state): State<AppState>,
    Path((namespace, pod)): Path<(String, String)>,
    Query(query): Query<PortQuery>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let session = state
        .streams
        .port_forward(&PodKey::new(namespace, pod), query.port)
        .await?;
    Ok(upgrade(ws, session))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.streams.active_sessions())
}

/// The backend side is opened before upgrading so that lookup failures
/// still surface as problem responses.
fn upgrade(ws: WebSocketUpgrade, session: Session) -> Response {
    ws.on_upgrade(move |socket| bridge(socket, session))
}

/// Carry binary frames between the websocket and the session.
async fn bridge(socket: WebSocket, session: Session) {
    let (local, remote) = tokio::io::duplex(WS_BUFFER);

    let relay = async move {
        let (mut remote_rd, mut remote_wr) = tokio::io::split(remote);
        let (mut ws_tx, mut ws_rx) = socket.split();

        let to_client = async {
            let mut buf = vec![0u8; WS_BUFFER];
            loop {
                match remote_rd.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let frame = Bytes::copy_from_slice(&buf[..n]);
                        if ws_tx.send(Message::Binary(frame)).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = ws_tx.send(Message::Close(None)).await;
        };

        let to_session = async {
            while let Some(msg) = ws_rx.next().await {
                let written = match msg {
                    Ok(Message::Binary(data)) => remote_wr.write_all(&data).await,
                    Ok(Message::Text(text)) => remote_wr.write_all(text.as_str().as_bytes()).await,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                if written.is_err() {
                    break;
                }
            }
        };

        tokio::select! {
            _ = to_client => {}
            _ = to_session => {}
        }

        // Both remote halves drop here, so the session sees its client close
        // even when it is blocked writing toward a websocket that went away.
        let _ = remote_wr.shutdown().await;
    };

    tokio::join!(session.run(local), relay);
}

// =============================================================================
// Stats
// =============================================================================

async fn stats_summary(State(state): State<AppState>) -> Json<StatsSummary> {
    Json(state.stats.summary().await)
}

async fn resource_metrics(State(state): State<AppState>) -> Response {
    let summary = state.stats.summary().await;
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        render_resource_metrics(&summary),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, MockBackend};
    use crate::pod::ContainerSpec;
    use crate::pods::PodSettings;
    use crate::client::ChannelSink;
    use crate::reconciler::{Reconciler, ReconcilerConfig};
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    struct Harness {
        app: Router,
        pods: Arc<PodManager>,
        backend: Arc<MockBackend>,
        _shutdown: watch::Sender<bool>,
    }

    fn harness() -> Harness {
        harness_with(true)
    }

    /// Without a running reconciler, every mutation fails to submit.
    fn harness_with(run_reconciler: bool) -> Harness {
        let backend = Arc::new(MockBackend::new());
        let pods = Arc::new(PodManager::new(backend.clone(), PodSettings::default()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel(16);
        let (sink, _rx) = ChannelSink::new();

        if run_reconciler {
            let reconciler =
                Reconciler::new(pods.clone(), Arc::new(sink), ReconcilerConfig::default());
            let rx = shutdown_rx.clone();
            tokio::spawn(async move { reconciler.run(events_rx, rx).await });
        } else {
            drop(events_rx);
        }

        let state = AppState {
            streams: Arc::new(StreamRouter::new(
                pods.clone(),
                Duration::from_secs(60),
                shutdown_rx,
            )),
            stats: Arc::new(StatsExporter::new(pods.clone(), "vk-node")),
            pods: pods.clone(),
            events: events_tx,
        };
        Harness {
            app: router(state),
            pods,
            backend,
            _shutdown: shutdown_tx,
        }
    }

    impl Harness {
        /// One observation pass, so started containers show as running.
        async fn observe(&self) {
            let batch = self.backend.poll().await.unwrap();
            self.pods.apply_observations(&batch).await;
        }
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Response) {
        let response = app.clone().oneshot(request).await.unwrap();
        (response.status(), response)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_pod(spec: &PodSpec) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/pods")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(spec).unwrap()))
            .unwrap()
    }

    fn put_pod(spec: &PodSpec) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri(format!("/pods/{}/{}", spec.namespace, spec.name))
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(spec).unwrap()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_healthz() {
        let h = harness();
        let (status, _) = send(&h.app, get("/healthz")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let h = harness();
        let spec = PodSpec::new("default", "web", vec![ContainerSpec::new("app", "app:v1")]);

        let (status, response) = send(&h.app, post_pod(&spec)).await;
        assert_eq!(status, StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["spec"]["name"], "web");
        assert!(h.backend.contains(&spec.key()).await);

        let (status, response) = send(&h.app, get("/pods/default/web/status")).await;
        assert_eq!(status, StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["conditions"].is_array());

        let (status, response) = send(&h.app, get("/pods?namespace=default")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body_json(response).await.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_goes_through_reconciler() {
        let h = harness();
        let spec = PodSpec::new("default", "web", vec![ContainerSpec::new("app", "app:v1")]);

        let (status, _) = send(&h.app, put_pod(&spec)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        send(&h.app, post_pod(&spec)).await;
        let updated = PodSpec::new("default", "web", vec![ContainerSpec::new("app", "app:v2")]);
        let (status, response) = send(&h.app, put_pod(&updated)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body_json(response).await["spec"]["containers"][0]["image"], "app:v2");
    }

    #[tokio::test]
    async fn test_mutations_need_the_reconciler() {
        let h = harness_with(false);
        let spec = PodSpec::new("default", "web", vec![ContainerSpec::new("app", "app:v1")]);

        let (status, _) = send(&h.app, post_pod(&spec)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let (status, _) = send(&h.app, put_pod(&spec)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(h.pods.pod_count().await, 0);
    }

    #[tokio::test]
    async fn test_admission_rejection_is_unprocessable() {
        let h = harness();
        let spec = PodSpec::new(
            "default",
            "big",
            vec![ContainerSpec::new("app", "app:v1").with_requests(
                crate::resources::Cpu::from_cores(50),
                crate::resources::Memory::from_gibibytes(1),
            )],
        );

        let (status, response) = send(&h.app, post_pod(&spec)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );
        let body = body_json(response).await;
        assert_eq!(body["code"], "admission_rejected");

        let (status, _) = send(&h.app, get("/pods/default/big")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_transient_errors_are_retryable() {
        let err = ApiError::from(ProviderError::BackendUnavailable("down".into()));
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(err.problem.retryable);

        let err = ApiError::from(ProviderError::Unsupported("attach".into()));
        assert_eq!(err.status, StatusCode::NOT_IMPLEMENTED);
        assert!(!err.problem.retryable);
    }

    #[tokio::test]
    async fn test_logs_for_unknown_pod() {
        let h = harness();
        let (status, response) = send(&h.app, get("/containerLogs/default/nope/app")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], "not_found");
    }

    #[tokio::test]
    async fn test_logs_body() {
        let h = harness();
        let spec = PodSpec::new("default", "web", vec![ContainerSpec::new("app", "app:v1")]);
        send(&h.app, post_pod(&spec)).await;
        h.observe().await;
        h.backend.append_log(&spec.key(), "app", "hello").await;

        let (status, response) = send(&h.app, get("/containerLogs/default/web/app")).await;
        assert_eq!(status, StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("hello"));
    }

    #[tokio::test]
    async fn test_delete_unknown_pod_is_not_found() {
        let h = harness();
        let request = Request::builder()
            .method("DELETE")
            .uri("/pods/default/ghost")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&h.app, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_exec_options_from_repeated_params() {
        let params = vec![
            ("command".to_string(), "echo".to_string()),
            ("command".to_string(), "hi".to_string()),
            ("tty".to_string(), "true".to_string()),
        ];
        let opts = exec_options(&params).unwrap();
        assert_eq!(opts.command, vec!["echo", "hi"]);
        assert!(opts.tty);
        assert!(!opts.stdin);

        let err = exec_options(&[]).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_metrics_content_type() {
        let h = harness();
        let spec = PodSpec::new("default", "web", vec![ContainerSpec::new("app", "app:v1")]);
        send(&h.app, post_pod(&spec)).await;
        h.observe().await;

        let (status, response) = send(&h.app, get("/metrics/resource")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; version=0.0.4"
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("pod_cpu_usage_nano_cores"));
    }
}
