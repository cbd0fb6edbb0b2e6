//! Proxy session engine.
//!
//! A [`ProxySession`] attaches one frontend to a router — either a single
//! backend (direct proxy) or the aggregating bridge — and forwards traffic in
//! both directions. Frontend ids are never reused toward backends: the
//! backend session allocates its own ids, and the frontend id only reappears
//! in the response the engine constructs. The id pair is tracked so a
//! frontend cancellation reaches the matching backend request.

use crate::aggregator::{Aggregator, effective_namespace};
use crate::error::{BridgeError, Result};
use crate::rpc::{self, Message, Notification, Request, RequestId, RpcError, methods};
use crate::session::{CancelSlot, SessionHandler};
use crate::supervisor::{
    BackendEvent, BackendSet, BackendStatus, CapabilityKind, ManagedBackend,
};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

const REVERSE_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const EVENT_CHANNEL_CAPACITY: usize = 256;

fn required_str(params: &Option<Value>, key: &str) -> Result<String> {
    params
        .as_ref()
        .and_then(|p| p.get(key))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            BridgeError::Rpc(RpcError::invalid_params(format!("missing '{key}' parameter")))
        })
}

fn with_field(params: Option<Value>, key: &str, value: Value) -> Option<Value> {
    let mut params = params.unwrap_or_else(|| json!({}));
    params[key] = value;
    Some(params)
}

/// What a frontend session is routed to.
pub enum RouterKind {
    /// One backend, forwarded transparently.
    Direct(Arc<ManagedBackend>),
    /// The aggregate union over all backends.
    Aggregate {
        aggregator: Arc<Aggregator>,
        backends: Arc<BackendSet>,
    },
}

/// Shared per-endpoint router: dispatch plus the notification fan-out feed
/// every attached frontend subscribes to.
pub struct ProxyCore {
    kind: RouterKind,
    events: broadcast::Sender<Notification>,
}

impl ProxyCore {
    pub fn direct(backend: Arc<ManagedBackend>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            kind: RouterKind::Direct(backend),
            events,
        })
    }

    pub fn aggregate(aggregator: Arc<Aggregator>, backends: Arc<BackendSet>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            kind: RouterKind::Aggregate {
                aggregator,
                backends,
            },
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.events.subscribe()
    }

    /// Wire backend-initiated requests back to the given frontend session.
    ///
    /// Only meaningful for a direct router with a single attached frontend
    /// (client mode); aggregated backends answer `-32601` instead.
    pub fn register_reverse(&self, handler: Arc<dyn SessionHandler>) {
        if let RouterKind::Direct(backend) = &self.kind {
            backend.set_reverse_handler(handler);
        }
    }

    /// Push a notification to every attached frontend.
    pub fn publish(&self, note: Notification) {
        let _ = self.events.send(note);
    }

    fn server_label(&self) -> &str {
        match &self.kind {
            RouterKind::Direct(backend) => backend.name(),
            RouterKind::Aggregate { .. } => "bridge",
        }
    }

    /// The synthetic `InitializeResult` advertised to frontends.
    pub fn initialize_result(&self) -> Value {
        match &self.kind {
            RouterKind::Direct(backend) => {
                let caps = backend.capabilities();
                let server_info = if caps.server_info.is_null() {
                    json!({ "name": backend.name(), "version": env!("CARGO_PKG_VERSION") })
                } else {
                    caps.server_info.clone()
                };
                json!({
                    "protocolVersion": rpc::PROTOCOL_VERSION,
                    "capabilities": caps.server_capabilities,
                    "serverInfo": server_info,
                })
            }
            RouterKind::Aggregate { aggregator, .. } => json!({
                "protocolVersion": rpc::PROTOCOL_VERSION,
                "capabilities": aggregator.snapshot().capabilities,
                "serverInfo": {
                    "name": "mcp-switchboard",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        }
    }

    async fn dispatch(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &Arc<CancelSlot>,
    ) -> Result<Value> {
        match &self.kind {
            RouterKind::Direct(backend) => {
                backend.request(method, params, None, Some(cancel)).await
            }
            RouterKind::Aggregate {
                aggregator,
                backends,
            } => {
                self.dispatch_aggregate(aggregator, backends, method, params, cancel)
                    .await
            }
        }
    }

    async fn dispatch_aggregate(
        &self,
        aggregator: &Aggregator,
        backends: &BackendSet,
        method: &str,
        params: Option<Value>,
        cancel: &Arc<CancelSlot>,
    ) -> Result<Value> {
        let snapshot = aggregator.snapshot();
        match method {
            methods::PING => Ok(json!({})),
            methods::TOOLS_LIST => Ok(json!({ "tools": snapshot.tools })),
            methods::RESOURCES_LIST => Ok(json!({ "resources": snapshot.resources })),
            methods::RESOURCE_TEMPLATES_LIST => {
                Ok(json!({ "resourceTemplates": snapshot.resource_templates }))
            }
            methods::PROMPTS_LIST => Ok(json!({ "prompts": snapshot.prompts })),

            methods::TOOLS_CALL => {
                let name = required_str(&params, "name")?;
                let Some(target) = snapshot.route_tool(&name) else {
                    return Err(BridgeError::Rpc(RpcError::method_not_found(&format!(
                        "tools/call {name}"
                    ))));
                };
                let backend = self.backend_for(backends, &target.server)?;
                let params = with_field(params, "name", json!(target.original));
                backend
                    .request(methods::TOOLS_CALL, params, None, Some(cancel))
                    .await
            }

            methods::RESOURCES_READ
            | methods::RESOURCES_SUBSCRIBE
            | methods::RESOURCES_UNSUBSCRIBE => {
                let uri = required_str(&params, "uri")?;
                match snapshot.route_resource(&uri) {
                    Some(target) => {
                        let backend = self.backend_for(backends, &target.server)?;
                        let params = with_field(params, "uri", json!(target.original));
                        backend.request(method, params, None, Some(cancel)).await
                    }
                    None => {
                        self.try_by_priority(backends, snapshot.priority_order(), method, params, cancel)
                            .await
                    }
                }
            }

            methods::PROMPTS_GET => {
                let name = required_str(&params, "name")?;
                match snapshot.route_prompt(&name) {
                    Some(target) => {
                        let backend = self.backend_for(backends, &target.server)?;
                        let params = with_field(params, "name", json!(target.original));
                        backend
                            .request(methods::PROMPTS_GET, params, None, Some(cancel))
                            .await
                    }
                    None => {
                        self.try_by_priority(backends, snapshot.priority_order(), method, params, cancel)
                            .await
                    }
                }
            }

            methods::COMPLETION_COMPLETE => {
                let reference = params
                    .as_ref()
                    .and_then(|p| p.get("ref"))
                    .cloned()
                    .unwrap_or_default();
                let routed = match reference.get("type").and_then(Value::as_str) {
                    Some("ref/prompt") => reference
                        .get("name")
                        .and_then(Value::as_str)
                        .and_then(|name| snapshot.route_prompt(name))
                        .map(|t| (t, "name")),
                    Some("ref/resource") => reference
                        .get("uri")
                        .and_then(Value::as_str)
                        .and_then(|uri| snapshot.route_resource(uri))
                        .map(|t| (t, "uri")),
                    _ => None,
                };
                match routed {
                    Some((target, key)) => {
                        let backend = self.backend_for(backends, &target.server)?;
                        let mut params = params.unwrap_or_else(|| json!({}));
                        params["ref"][key] = json!(target.original);
                        backend
                            .request(methods::COMPLETION_COMPLETE, Some(params), None, Some(cancel))
                            .await
                    }
                    None => {
                        self.try_by_priority(backends, snapshot.priority_order(), method, params, cancel)
                            .await
                    }
                }
            }

            methods::LOGGING_SET_LEVEL => {
                // Broadcast; a backend that rejects it does not fail the call.
                for backend in backends.iter() {
                    if backend.status() != BackendStatus::Connected {
                        continue;
                    }
                    if let Err(e) = backend
                        .request(methods::LOGGING_SET_LEVEL, params.clone(), None, None)
                        .await
                    {
                        tracing::debug!(
                            server = backend.name(),
                            error = %e,
                            "logging/setLevel rejected"
                        );
                    }
                }
                Ok(json!({}))
            }

            other => Err(BridgeError::Rpc(RpcError::method_not_found(other))),
        }
    }

    fn backend_for<'a>(
        &self,
        backends: &'a BackendSet,
        server: &str,
    ) -> Result<&'a Arc<ManagedBackend>> {
        backends.get(server).ok_or_else(|| BridgeError::Unavailable {
            server: server.to_string(),
            reason: "backend not registered".to_string(),
        })
    }

    /// Fallback for un-namespaced names: try connected backends in priority
    /// order until one answers without error.
    async fn try_by_priority(
        &self,
        backends: &BackendSet,
        order: &[String],
        method: &str,
        params: Option<Value>,
        cancel: &Arc<CancelSlot>,
    ) -> Result<Value> {
        let mut last_err = None;
        for server in order {
            let Some(backend) = backends.get(server) else {
                continue;
            };
            match backend.request(method, params.clone(), None, Some(cancel)).await {
                Ok(value) => return Ok(value),
                Err(BridgeError::Cancelled) => return Err(BridgeError::Cancelled),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            BridgeError::Rpc(RpcError::method_not_found(method))
        }))
    }

    async fn forward_notification(&self, method: &str, params: Option<Value>) {
        match &self.kind {
            RouterKind::Direct(backend) => backend.notify(method, params).await,
            RouterKind::Aggregate { .. } => {
                // Aggregated progress has no single owner; drop quietly.
                tracing::debug!(method, "dropping frontend notification in aggregate mode");
            }
        }
    }
}

/// One attached frontend.
pub struct ProxySession {
    core: Arc<ProxyCore>,
    session_id: String,
    outbound: mpsc::Sender<Message>,
    inflight: parking_lot::Mutex<HashMap<RequestId, Arc<CancelSlot>>>,
    reverse_pending:
        parking_lot::Mutex<HashMap<RequestId, oneshot::Sender<std::result::Result<Value, RpcError>>>>,
    next_reverse_id: AtomicI64,
    initialized: AtomicBool,
    closed: AtomicBool,
    fanout: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ProxySession {
    pub fn new(core: Arc<ProxyCore>, outbound: mpsc::Sender<Message>, session_id: String) -> Arc<Self> {
        let session = Arc::new(Self {
            core: core.clone(),
            session_id,
            outbound: outbound.clone(),
            inflight: parking_lot::Mutex::new(HashMap::new()),
            reverse_pending: parking_lot::Mutex::new(HashMap::new()),
            next_reverse_id: AtomicI64::new(1),
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            fanout: parking_lot::Mutex::new(None),
        });

        // Relay server-initiated notifications (list_changed fan-out and
        // forwarded backend notifications) to this frontend.
        let mut events = core.subscribe();
        let weak = Arc::downgrade(&session);
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(note) => {
                        let Some(session) = weak.upgrade() else { break };
                        if session.closed.load(Ordering::Acquire) {
                            break;
                        }
                        if session
                            .outbound
                            .send(Message::Notification(note))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "frontend event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *session.fanout.lock() = Some(task);
        session
    }

    /// Handle one frontend frame. Returns the response message for requests;
    /// notifications and responses produce `None`.
    pub async fn process(&self, msg: Message) -> Option<Message> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        match msg {
            Message::Request(req) => self.process_request(req).await,
            Message::Notification(note) => {
                self.process_notification(note).await;
                None
            }
            Message::Response(resp) => {
                self.resolve_reverse(&resp.id, Ok(resp.result));
                None
            }
            Message::Error(err) => {
                self.resolve_reverse(&err.id, Err(err.error));
                None
            }
        }
    }

    async fn process_request(&self, req: Request) -> Option<Message> {
        let started = std::time::Instant::now();
        tracing::debug!(
            session_id = %self.session_id,
            method = %req.method,
            id = %req.id,
            "frontend request"
        );

        if req.method == methods::INITIALIZE {
            if self.initialized.swap(true, Ordering::AcqRel) {
                return Some(Message::error(
                    req.id,
                    RpcError::invalid_request("session already initialized"),
                ));
            }
            if let Some(client) = req.params.as_ref().and_then(|p| p.get("clientInfo")) {
                tracing::debug!(session_id = %self.session_id, client = %client, "frontend initialize");
            }
            return Some(Message::response(req.id, self.core.initialize_result()));
        }

        let cancel = CancelSlot::new();
        self.inflight.lock().insert(req.id.clone(), cancel.clone());
        let outcome = self.core.dispatch(&req.method, req.params, &cancel).await;
        self.inflight.lock().remove(&req.id);

        match outcome {
            Ok(result) => Some(Message::response(req.id, result)),
            // The frontend cancelled this id; it must never see an answer.
            Err(BridgeError::Cancelled) => None,
            Err(err) => {
                tracing::debug!(
                    session_id = %self.session_id,
                    method = %req.method,
                    error = %err,
                    elapsed = ?started.elapsed(),
                    "frontend request failed"
                );
                Some(Message::error(
                    req.id,
                    err.to_rpc_error(self.core.server_label()),
                ))
            }
        }
    }

    async fn process_notification(&self, note: Notification) {
        match note.method.as_str() {
            // The synthetic handshake ends here; backends were initialized
            // when they connected.
            methods::INITIALIZED => {}
            methods::NOTIFY_CANCELLED => {
                let Some(id) = note
                    .params
                    .as_ref()
                    .and_then(|p| p.get("requestId"))
                    .and_then(|v| serde_json::from_value::<RequestId>(v.clone()).ok())
                else {
                    tracing::debug!("cancellation without a usable requestId");
                    return;
                };
                let reason = note
                    .params
                    .as_ref()
                    .and_then(|p| p.get("reason"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let slot = self.inflight.lock().remove(&id);
                match slot {
                    Some(slot) => slot.cancel(reason).await,
                    None => {
                        tracing::debug!(%id, "cancellation for unknown request id");
                    }
                }
            }
            _ => self.core.forward_notification(&note.method, note.params).await,
        }
    }

    fn resolve_reverse(&self, id: &RequestId, outcome: std::result::Result<Value, RpcError>) {
        if let Some(tx) = self.reverse_pending.lock().remove(id) {
            let _ = tx.send(outcome);
        } else {
            tracing::debug!(%id, "frontend response with unknown id dropped");
        }
    }

    /// Tear the session down: in-flight backend requests are cancelled and
    /// their waiters dropped.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let slots: Vec<_> = self.inflight.lock().drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            slot.cancel(Some("frontend disconnected".to_string())).await;
        }
        self.reverse_pending.lock().clear();
        if let Some(task) = self.fanout.lock().take() {
            task.abort();
        }
        tracing::debug!(session_id = %self.session_id, "frontend session closed");
    }
}

/// Backend-initiated requests and notifications are remapped onto the
/// frontend with ids of the engine's own choosing.
#[async_trait]
impl SessionHandler for ProxySession {
    async fn handle_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> std::result::Result<Value, RpcError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError {
                code: rpc::SERVER_ERROR,
                message: "frontend session closed".to_string(),
                data: None,
            });
        }
        let id = RequestId::String(format!(
            "swb-{}",
            self.next_reverse_id.fetch_add(1, Ordering::Relaxed)
        ));
        let (tx, rx) = oneshot::channel();
        self.reverse_pending.lock().insert(id.clone(), tx);

        let sent = self
            .outbound
            .send(Message::Request(Request {
                id: id.clone(),
                method: method.to_string(),
                params,
            }))
            .await;
        if sent.is_err() {
            self.reverse_pending.lock().remove(&id);
            return Err(RpcError {
                code: rpc::SERVER_ERROR,
                message: "frontend unreachable".to_string(),
                data: None,
            });
        }

        match tokio::time::timeout(REVERSE_REQUEST_TIMEOUT, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) | Err(_) => {
                self.reverse_pending.lock().remove(&id);
                Err(RpcError {
                    code: rpc::SERVER_ERROR,
                    message: format!("no frontend answer for {method}"),
                    data: None,
                })
            }
        }
    }

    async fn handle_notification(&self, method: &str, params: Option<Value>) {
        let _ = self
            .outbound
            .send(Message::notification(method, params))
            .await;
    }
}

// ============================================================================
// Backend event loop
// ============================================================================

/// Consume supervisor events: refresh stale capability caches, re-union the
/// aggregate view, and fan notifications out to attached frontends.
///
/// Events are drained in batches so a burst of `list_changed` notifications
/// coalesces into one refresh.
pub fn spawn_event_loop(
    backends: Arc<BackendSet>,
    aggregator: Option<Arc<Aggregator>>,
    aggregate_core: Option<Arc<ProxyCore>>,
    direct_cores: HashMap<String, Arc<ProxyCore>>,
    mut events: mpsc::UnboundedReceiver<BackendEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(first) = events.recv().await {
            let mut batch = vec![first];
            while let Ok(event) = events.try_recv() {
                batch.push(event);
            }

            let mut stale: Vec<(String, CapabilityKind)> = Vec::new();
            let mut refreshed: HashSet<String> = HashSet::new();
            let mut forwards: Vec<(String, String, Option<Value>)> = Vec::new();
            for event in batch {
                match event {
                    BackendEvent::Refreshed { server } => {
                        refreshed.insert(server);
                    }
                    BackendEvent::ListChanged { server, kind } => {
                        if !stale.contains(&(server.clone(), kind)) {
                            stale.push((server, kind));
                        }
                    }
                    BackendEvent::Forward {
                        server,
                        method,
                        params,
                    } => forwards.push((server, method, params)),
                }
            }

            // Stale caches first, so the re-union below sees fresh lists.
            for (server, _) in &stale {
                if let Some(backend) = backends.get(server)
                    && let Err(e) = backend.refresh_capabilities().await
                {
                    tracing::warn!(server, error = %e, "capability refresh failed");
                }
            }

            let registry_changed = !stale.is_empty() || !refreshed.is_empty();
            if registry_changed && let Some(aggregator) = &aggregator {
                aggregator.rebuild(&backends);
            }

            // Changed-list notifications toward frontends. A wholesale
            // refresh announces all three kinds.
            let kinds_for = |server: &str| -> Vec<CapabilityKind> {
                if refreshed.contains(server) {
                    vec![
                        CapabilityKind::Tools,
                        CapabilityKind::Resources,
                        CapabilityKind::Prompts,
                    ]
                } else {
                    stale
                        .iter()
                        .filter(|(s, _)| s == server)
                        .map(|(_, k)| *k)
                        .collect()
                }
            };

            let mut announced: HashSet<&'static str> = HashSet::new();
            for server in refreshed.iter().chain(stale.iter().map(|(s, _)| s)) {
                for kind in kinds_for(server) {
                    let method = kind.list_changed_method();
                    if let Some(core) = direct_cores.get(server) {
                        core.publish(Notification {
                            method: method.to_string(),
                            params: None,
                        });
                    }
                    // Duplicate list_changed within one batch collapses.
                    if announced.insert(method)
                        && let Some(core) = &aggregate_core
                    {
                        core.publish(Notification {
                            method: method.to_string(),
                            params: None,
                        });
                    }
                }
            }

            for (server, method, params) in forwards {
                if let Some(core) = direct_cores.get(&server) {
                    core.publish(Notification {
                        method: method.clone(),
                        params: params.clone(),
                    });
                }
                if let Some(core) = &aggregate_core {
                    let params = if method == methods::NOTIFY_RESOURCE_UPDATED {
                        rename_updated_uri(&backends, aggregator.as_deref(), &server, params)
                    } else {
                        params
                    };
                    core.publish(Notification { method, params });
                }
            }
        }
    })
}

/// Rewrite the backend-local URI in `notifications/resources/updated` to the
/// exposed namespaced form before it reaches aggregate frontends.
fn rename_updated_uri(
    backends: &BackendSet,
    aggregator: Option<&Aggregator>,
    server: &str,
    params: Option<Value>,
) -> Option<Value> {
    let aggregator = aggregator?;
    let mut params = params?;
    if let Some(uri) = params.get("uri").and_then(Value::as_str)
        && let Some(backend) = backends.get(server)
        && let Some(ns) = effective_namespace(
            server,
            backend.config(),
            aggregator.settings(),
            CapabilityKind::Resources,
        )
    {
        params["uri"] = json!(crate::aggregator::rename(
            uri,
            &ns,
            CapabilityKind::Resources
        ));
    }
    Some(params)
}
