//! HTTP surface: SSE and streamable HTTP frontends plus `/status`.
//!
//! Endpoint map:
//! - `GET /status` introspection
//! - `GET /sse` + `POST /messages/?session_id=…` for the root endpoint
//! - `POST|GET|DELETE /mcp` streamable HTTP for the root endpoint
//! - the same trio under `/servers/{name}/` for direct access to one backend
//!
//! The root endpoint is the aggregated bridge in bridge mode, or the default
//! server in named-server mode.

use crate::error::{BridgeError, Result};
use crate::proxy::{ProxyCore, ProxySession};
use crate::rpc::{self, Message};
use crate::supervisor::{BackendSet, BackendSnapshot};
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, Request as HttpRequest, StatusCode, header};
use axum::middleware::{Next, from_fn_with_state};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::StreamExt as _;
use futures::stream;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use uuid::Uuid;

const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";
const PORT_ATTEMPTS: u16 = 20;
const OUTBOUND_BUFFER: usize = 64;

/// One attached HTTP frontend, reachable by session id.
pub struct SessionEntry {
    proxy: Arc<ProxySession>,
    outbound_tx: mpsc::Sender<Message>,
    /// Parked until a GET opens the server-initiated stream (streamable
    /// HTTP) or the SSE stream claims it.
    outbound_rx: tokio::sync::Mutex<Option<mpsc::Receiver<Message>>>,
}

pub struct AppState {
    /// Aggregated bridge, or the default server in named-server mode.
    pub root: Option<Arc<ProxyCore>>,
    pub named: HashMap<String, Arc<ProxyCore>>,
    pub backends: Arc<BackendSet>,
    pub stateless: bool,
    pub allow_origins: Vec<String>,
    pub api_key: Option<String>,
    sessions: parking_lot::RwLock<HashMap<String, Arc<SessionEntry>>>,
    last_activity: parking_lot::RwLock<DateTime<Utc>>,
}

impl AppState {
    pub fn new(
        root: Option<Arc<ProxyCore>>,
        named: HashMap<String, Arc<ProxyCore>>,
        backends: Arc<BackendSet>,
        stateless: bool,
        allow_origins: Vec<String>,
        api_key: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            root,
            named,
            backends,
            stateless,
            allow_origins,
            api_key,
            sessions: parking_lot::RwLock::new(HashMap::new()),
            last_activity: parking_lot::RwLock::new(Utc::now()),
        })
    }

    fn touch(&self) {
        *self.last_activity.write() = Utc::now();
    }

    fn open_session(&self, core: Arc<ProxyCore>) -> (String, Arc<SessionEntry>) {
        let session_id = Uuid::new_v4().simple().to_string();
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let proxy = ProxySession::new(core, tx.clone(), session_id.clone());
        let entry = Arc::new(SessionEntry {
            proxy,
            outbound_tx: tx,
            outbound_rx: tokio::sync::Mutex::new(Some(rx)),
        });
        self.sessions
            .write()
            .insert(session_id.clone(), entry.clone());
        tracing::debug!(session_id = %session_id, "frontend session opened");
        (session_id, entry)
    }

    fn session(&self, id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.read().get(id).cloned()
    }

    fn remove_session(&self, id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.write().remove(id)
    }
}

/// Removes and closes the session when its SSE stream is dropped.
struct SessionGuard {
    id: String,
    state: Arc<AppState>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(entry) = self.state.remove_session(&self.id)
            && let Ok(handle) = tokio::runtime::Handle::try_current()
        {
            handle.spawn(async move {
                entry.proxy.close().await;
            });
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let app = Router::new()
        .route("/status", get(status))
        .route("/sse", get(sse_root))
        .route("/messages/", axum::routing::post(messages))
        .route(
            "/mcp",
            axum::routing::post(mcp_post_root)
                .get(mcp_get_root)
                .delete(mcp_delete),
        )
        .route("/servers/{name}/sse", get(sse_named))
        .route("/servers/{name}/messages/", axum::routing::post(messages))
        .route(
            "/servers/{name}/mcp",
            axum::routing::post(mcp_post_named)
                .get(mcp_get_named)
                .delete(mcp_delete),
        );

    let app = app.layer(from_fn_with_state(state.clone(), api_key_gate));
    let app = app.layer(from_fn_with_state(state.clone(), cors));
    app.with_state(state)
}

/// Bind the listener, trying the next ports when the requested one is taken.
pub async fn bind_with_increment(host: &str, port: u16) -> Result<(TcpListener, u16)> {
    let mut last_err = None;
    for offset in 0..PORT_ATTEMPTS {
        let Some(candidate) = port.checked_add(offset) else {
            break;
        };
        match TcpListener::bind((host, candidate)).await {
            Ok(listener) => {
                let bound = listener
                    .local_addr()
                    .map(|addr| addr.port())
                    .unwrap_or(candidate);
                if offset > 0 {
                    tracing::info!(
                        requested = port,
                        bound,
                        "requested port was in use, using next free port"
                    );
                }
                return Ok((listener, bound));
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(BridgeError::Startup(format!(
        "no free port in {port}..{} on {host}: {}",
        port.saturating_add(PORT_ATTEMPTS - 1),
        last_err.map_or_else(|| "unknown".to_string(), |e| e.to_string())
    )))
}

// ============================================================================
// Middleware
// ============================================================================

async fn cors(
    State(state): State<Arc<AppState>>,
    request: HttpRequest<Body>,
    next: Next,
) -> Response {
    if state.allow_origins.is_empty() {
        return next.run(request).await;
    }

    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let allowed = match &origin {
        Some(origin) => {
            state.allow_origins.iter().any(|o| o == "*") || state.allow_origins.contains(origin)
        }
        None => false,
    };
    let header_value = if state.allow_origins.iter().any(|o| o == "*") {
        Some("*".to_string())
    } else if allowed {
        origin
    } else {
        None
    };

    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(request).await
    };

    if let Some(value) = header_value
        && let Ok(value) = value.parse()
    {
        let headers = response.headers_mut();
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            header::HeaderValue::from_static("*"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            header::HeaderValue::from_static("*"),
        );
    }
    response
}

/// When `API_ACCESS_TOKEN` is configured, MCP endpoints require a matching
/// `x-api-key` header. `/status` and preflight stay open.
async fn api_key_gate(
    State(state): State<Arc<AppState>>,
    request: HttpRequest<Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(request).await;
    };
    let path = request.uri().path();
    if request.method() == Method::OPTIONS || path == "/status" {
        return next.run(request).await;
    }

    let presented = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if presented != expected {
        tracing::warn!(method = %request.method(), path, "rejected request with bad api key");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Unauthorized" })),
        )
            .into_response();
    }
    next.run(request).await
}

// ============================================================================
// Status
// ============================================================================

#[derive(serde::Serialize)]
struct StatusResponse {
    api_last_activity: String,
    server_instances: BTreeMap<String, BackendSnapshot>,
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let server_instances = state
        .backends
        .iter()
        .map(|b| (b.name().to_string(), b.snapshot()))
        .collect();
    Json(StatusResponse {
        api_last_activity: state.last_activity.read().to_rfc3339(),
        server_instances,
    })
}

// ============================================================================
// SSE frontend
// ============================================================================

fn resolve_root(state: &AppState) -> std::result::Result<Arc<ProxyCore>, Response> {
    state.root.clone().ok_or_else(|| {
        (StatusCode::NOT_FOUND, "no root endpoint configured").into_response()
    })
}

fn resolve_named(state: &AppState, name: &str) -> std::result::Result<Arc<ProxyCore>, Response> {
    state.named.get(name).cloned().ok_or_else(|| {
        (StatusCode::NOT_FOUND, format!("unknown server '{name}'")).into_response()
    })
}

async fn sse_root(State(state): State<Arc<AppState>>) -> Response {
    match resolve_root(&state) {
        Ok(core) => serve_sse(state, core, "/messages/".to_string()),
        Err(resp) => resp,
    }
}

async fn sse_named(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    match resolve_named(&state, &name) {
        Ok(core) => serve_sse(state, core, format!("/servers/{name}/messages/")),
        Err(resp) => resp,
    }
}

fn serve_sse(state: Arc<AppState>, core: Arc<ProxyCore>, messages_path: String) -> Response {
    state.touch();
    let (session_id, entry) = state.open_session(core);
    let endpoint = format!("{messages_path}?session_id={session_id}");

    let rx = entry
        .outbound_rx
        .try_lock()
        .ok()
        .and_then(|mut guard| guard.take());
    let Some(rx) = rx else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "session stream unavailable").into_response();
    };

    let guard = SessionGuard {
        id: session_id,
        state,
    };

    let first = stream::once(async move {
        Ok::<_, Infallible>(Event::default().event("endpoint").data(endpoint))
    });
    let frames = stream::unfold((rx, guard), |(mut rx, guard)| async move {
        rx.recv().await.map(|msg| {
            let event = Event::default().event("message").data(msg.to_json());
            (Ok::<_, Infallible>(event), (rx, guard))
        })
    });

    Sse::new(first.chain(frames))
        .keep_alive(KeepAlive::default())
        .into_response()
}

#[derive(Deserialize)]
struct MessagesQuery {
    session_id: String,
}

async fn messages(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MessagesQuery>,
    body: String,
) -> Response {
    state.touch();
    let Some(entry) = state.session(&query.session_id) else {
        return (StatusCode::NOT_FOUND, "unknown session_id").into_response();
    };
    let msg = match Message::from_str(&body) {
        Ok(msg) => msg,
        Err(err) => {
            tracing::warn!(error = %err, "dropping malformed frontend frame");
            return (StatusCode::BAD_REQUEST, err).into_response();
        }
    };

    // Responses travel back over the event stream, never the POST body.
    if let Some(reply) = entry.proxy.process(msg).await
        && entry.outbound_tx.send(reply).await.is_err()
    {
        return (StatusCode::GONE, "session closed").into_response();
    }
    StatusCode::ACCEPTED.into_response()
}

// ============================================================================
// Streamable HTTP frontend
// ============================================================================

async fn mcp_post_root(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    match resolve_root(&state) {
        Ok(core) => serve_mcp_post(state, core, headers, body).await,
        Err(resp) => resp,
    }
}

async fn mcp_post_named(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Response {
    match resolve_named(&state, &name) {
        Ok(core) => serve_mcp_post(state, core, headers, body).await,
        Err(resp) => resp,
    }
}

async fn serve_mcp_post(
    state: Arc<AppState>,
    core: Arc<ProxyCore>,
    headers: HeaderMap,
    body: String,
) -> Response {
    state.touch();
    let msg = match Message::from_str(&body) {
        Ok(msg) => msg,
        Err(err) => return (StatusCode::BAD_REQUEST, err).into_response(),
    };

    if state.stateless {
        // Every POST is a complete exchange; no session id is issued and
        // server-initiated traffic has nowhere to go.
        let (tx, _rx) = mpsc::channel(OUTBOUND_BUFFER);
        let proxy = ProxySession::new(core, tx, "stateless".to_string());
        let reply = proxy.process(msg).await;
        proxy.close().await;
        return match reply {
            Some(reply) => Json(reply.to_value()).into_response(),
            None => StatusCode::ACCEPTED.into_response(),
        };
    }

    let presented = headers
        .get(MCP_SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match presented {
        Some(session_id) => {
            let Some(entry) = state.session(&session_id) else {
                return (StatusCode::NOT_FOUND, "session not found").into_response();
            };
            respond_json(entry.proxy.process(msg).await, &session_id)
        }
        None => {
            // A new session starts with initialize.
            let is_initialize = msg.method() == Some(rpc::methods::INITIALIZE);
            if !is_initialize {
                return (
                    StatusCode::BAD_REQUEST,
                    "no valid session ID provided",
                )
                    .into_response();
            }
            let (session_id, entry) = state.open_session(core);
            respond_json(entry.proxy.process(msg).await, &session_id)
        }
    }
}

fn respond_json(reply: Option<Message>, session_id: &str) -> Response {
    let mut response = match reply {
        Some(reply) => Json(reply.to_value()).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    };
    if let Ok(value) = session_id.parse() {
        response
            .headers_mut()
            .insert(MCP_SESSION_ID_HEADER, value);
    }
    response
}

async fn mcp_get_root(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if state.root.is_none() {
        return (StatusCode::NOT_FOUND, "no root endpoint configured").into_response();
    }
    serve_mcp_get(state, headers).await
}

async fn mcp_get_named(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !state.named.contains_key(&name) {
        return (StatusCode::NOT_FOUND, format!("unknown server '{name}'")).into_response();
    }
    serve_mcp_get(state, headers).await
}

/// Server-initiated stream for a stateful streamable HTTP session.
async fn serve_mcp_get(state: Arc<AppState>, headers: HeaderMap) -> Response {
    if state.stateless {
        return (StatusCode::METHOD_NOT_ALLOWED, "stateless mode has no stream").into_response();
    }
    let Some(session_id) = headers
        .get(MCP_SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return (StatusCode::BAD_REQUEST, "missing Mcp-Session-Id").into_response();
    };
    let Some(entry) = state.session(&session_id) else {
        return (StatusCode::NOT_FOUND, "session not found").into_response();
    };
    let Some(rx) = entry.outbound_rx.lock().await.take() else {
        return (StatusCode::CONFLICT, "stream already claimed").into_response();
    };

    let frames = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|msg| {
            let event = Event::default().data(msg.to_json());
            (Ok::<_, Infallible>(event), rx)
        })
    });
    Sse::new(frames)
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn mcp_delete(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(session_id) = headers
        .get(MCP_SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
    else {
        return (StatusCode::BAD_REQUEST, "missing Mcp-Session-Id").into_response();
    };
    match state.remove_session(session_id) {
        Some(entry) => {
            entry.proxy.close().await;
            StatusCode::OK.into_response()
        }
        None => (StatusCode::NOT_FOUND, "session not found").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::methods;
    use crate::session::ClientSession;
    use crate::supervisor::{
        BackendEvent, BackendSettings, CapabilityCache, ManagedBackend,
    };
    use crate::transport::{Transport, duplex};
    use serde_json::json;

    fn scripted_backend(name: &str, tools: Vec<Value>) -> Arc<ManagedBackend> {
        let (event_tx, _event_rx) = mpsc::unbounded_channel::<BackendEvent>();
        let config =
            crate::config::ServerConfig::stdio("cmd".to_string(), vec![], HashMap::new());
        let backend = ManagedBackend::new(
            name.to_string(),
            config,
            BackendSettings::default(),
            event_tx,
        );
        let (near, far) = duplex::pair();
        let far: Arc<dyn Transport> = Arc::new(far);
        tokio::spawn(async move {
            while let Some(msg) = far.recv().await {
                if let Message::Request(req) = msg {
                    let result = match req.method.as_str() {
                        methods::TOOLS_LIST => json!({ "tools": [{"name": "echo"}] }),
                        methods::TOOLS_CALL => json!({ "result": "hi" }),
                        _ => json!({}),
                    };
                    let _ = far.send(Message::response(req.id, result)).await;
                }
            }
        });
        let session = ClientSession::new(name.to_string(), Arc::new(near));
        backend.install_for_tests(
            session,
            CapabilityCache {
                server_info: json!({"name": name, "version": "0"}),
                server_capabilities: json!({"tools": {}}),
                tools,
                resources: vec![],
                resource_templates: vec![],
                prompts: vec![],
            },
        );
        backend
    }

    async fn spawn_app(state: Arc<AppState>) -> String {
        let (listener, port) = bind_with_increment("127.0.0.1", 0).await.unwrap();
        let app = router(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://127.0.0.1:{port}")
    }

    fn app_state(stateless: bool, api_key: Option<String>) -> Arc<AppState> {
        let backend = scripted_backend("echo", vec![json!({"name": "echo"})]);
        let core = ProxyCore::direct(backend.clone());
        let backends = BackendSet::for_tests(vec![backend]);
        AppState::new(
            Some(core),
            HashMap::new(),
            backends,
            stateless,
            vec![],
            api_key,
        )
    }

    #[tokio::test]
    async fn status_reports_server_instances() {
        let base = spawn_app(app_state(false, None)).await;
        let body: Value = reqwest::get(format!("{base}/status"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(body["api_last_activity"].is_string());
        let echo = &body["server_instances"]["echo"];
        assert_eq!(echo["status"], "connected");
        assert_eq!(echo["failure_count"], 0);
        assert_eq!(echo["capabilities"]["tools"], 1);
        assert_eq!(echo["config"]["priority"], 100);
    }

    #[tokio::test]
    async fn stateless_mcp_round_trip() {
        let base = spawn_app(app_state(true, None)).await;
        let client = reqwest::Client::new();

        let init = Message::request(1, methods::INITIALIZE, Some(json!({"clientInfo": {}})));
        let resp = client
            .post(format!("{base}/mcp"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(init.to_json())
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());
        assert!(resp.headers().get(MCP_SESSION_ID_HEADER).is_none());
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["result"]["serverInfo"]["name"], "echo");

        let call = Message::request(
            2,
            methods::TOOLS_CALL,
            Some(json!({"name": "echo", "arguments": {"x": "hi"}})),
        );
        let body: Value = client
            .post(format!("{base}/mcp"))
            .body(call.to_json())
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["id"], 2);
        assert_eq!(body["result"]["result"], "hi");
    }

    #[tokio::test]
    async fn stateful_mcp_issues_and_requires_session_id() {
        let base = spawn_app(app_state(false, None)).await;
        let client = reqwest::Client::new();

        // Non-initialize without a session id is rejected.
        let bare = Message::request(1, methods::TOOLS_LIST, None);
        let resp = client
            .post(format!("{base}/mcp"))
            .body(bare.to_json())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let init = Message::request(1, methods::INITIALIZE, None);
        let resp = client
            .post(format!("{base}/mcp"))
            .body(init.to_json())
            .send()
            .await
            .unwrap();
        let session_id = resp
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();

        let list = Message::request(2, methods::TOOLS_LIST, None);
        let body: Value = client
            .post(format!("{base}/mcp"))
            .header(MCP_SESSION_ID_HEADER, &session_id)
            .body(list.to_json())
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["result"]["tools"][0]["name"], "echo");

        // Unknown session ids are a 404 so clients know to re-initialize.
        let resp = client
            .post(format!("{base}/mcp"))
            .header(MCP_SESSION_ID_HEADER, "bogus")
            .body(list.to_json())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn api_key_gate_protects_mcp_but_not_status() {
        let base = spawn_app(app_state(true, Some("sekrit".to_string()))).await;
        let client = reqwest::Client::new();

        let resp = reqwest::get(format!("{base}/status")).await.unwrap();
        assert!(resp.status().is_success());

        let init = Message::request(1, methods::INITIALIZE, None);
        let resp = client
            .post(format!("{base}/mcp"))
            .body(init.to_json())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = client
            .post(format!("{base}/mcp"))
            .header("x-api-key", "sekrit")
            .body(init.to_json())
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());
    }

    #[tokio::test]
    async fn cors_preflight_and_headers() {
        let backend = scripted_backend("echo", vec![]);
        let core = ProxyCore::direct(backend.clone());
        let state = AppState::new(
            Some(core),
            HashMap::new(),
            BackendSet::for_tests(vec![backend]),
            true,
            vec!["*".to_string()],
            None,
        );
        let base = spawn_app(state).await;
        let client = reqwest::Client::new();

        let resp = client
            .request(Method::OPTIONS, format!("{base}/mcp"))
            .header(header::ORIGIN, "http://example.com")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            resp.headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "*"
        );

        let resp = reqwest::get(format!("{base}/status")).await.unwrap();
        assert_eq!(
            resp.headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn port_auto_increment_moves_to_next_port() {
        let (first, port) = bind_with_increment("127.0.0.1", 0).await.unwrap();
        let (_second, next) = bind_with_increment("127.0.0.1", port).await.unwrap();
        assert_ne!(port, next);
        drop(first);
    }

    #[tokio::test]
    async fn sse_handshake_emits_endpoint_event() {
        let base = spawn_app(app_state(false, None)).await;
        let resp = reqwest::Client::new()
            .get(format!("{base}/sse"))
            .send()
            .await
            .unwrap();
        assert!(resp.status().is_success());
        assert!(
            resp.headers()
                .get(header::CONTENT_TYPE)
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("text/event-stream")
        );

        // The first frame names the messages endpoint for this session.
        let mut stream = resp.bytes_stream();
        use futures::StreamExt as _;
        let chunk = tokio::time::timeout(std::time::Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let text = String::from_utf8_lossy(&chunk);
        assert!(text.contains("event: endpoint"), "got: {text}");
        assert!(text.contains("/messages/?session_id="), "got: {text}");
    }
}
