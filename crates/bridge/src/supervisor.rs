//! Backend supervision and lifecycle management.
//!
//! Each configured server is wrapped in a [`ManagedBackend`] that owns its
//! transport and session, drives the connect/retry/recovery state machine,
//! caches the backend's capability lists, and reports liveness for `/status`.

use crate::config::{FailoverConfig, ServerConfig, TransportType};
use crate::error::{BridgeError, Result};
use crate::rpc::{self, RpcError, methods};
use crate::session::{CancelSlot, ClientSession, SessionHandler};
use crate::transport::{
    HttpTransport, SseTransport, StdioTransport, Transport, header_map, masked_headers,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

const MAX_BACKOFF: Duration = Duration::from_secs(30);
const REMOTE_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Lifecycle state of a managed backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    Disabled,
    Connecting,
    Connected,
    Failed,
    Disconnected,
}

impl std::fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackendStatus::Disabled => "disabled",
            BackendStatus::Connecting => "connecting",
            BackendStatus::Connected => "connected",
            BackendStatus::Failed => "failed",
            BackendStatus::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKind {
    Tools,
    Resources,
    Prompts,
}

impl CapabilityKind {
    pub fn list_changed_method(self) -> &'static str {
        match self {
            CapabilityKind::Tools => methods::NOTIFY_TOOLS_CHANGED,
            CapabilityKind::Resources => methods::NOTIFY_RESOURCES_CHANGED,
            CapabilityKind::Prompts => methods::NOTIFY_PROMPTS_CHANGED,
        }
    }
}

/// Events a backend pushes to the bridge runtime.
#[derive(Debug)]
pub enum BackendEvent {
    /// The backend's capability caches were replaced wholesale (connect,
    /// reconnect); the aggregate view must be rebuilt.
    Refreshed { server: String },
    /// The backend announced a list change; caches are stale.
    ListChanged {
        server: String,
        kind: CapabilityKind,
    },
    /// A backend-initiated notification to relay toward frontends.
    Forward {
        server: String,
        method: String,
        params: Option<Value>,
    },
}

/// Raw capability lists as the backend reported them.
#[derive(Debug, Clone, Default)]
pub struct CapabilityCache {
    pub server_info: Value,
    pub server_capabilities: Value,
    pub tools: Vec<Value>,
    pub resources: Vec<Value>,
    pub resource_templates: Vec<Value>,
    pub prompts: Vec<Value>,
}

#[derive(Debug, Clone)]
struct Health {
    status: BackendStatus,
    last_seen: DateTime<Utc>,
    failure_count: u32,
    last_error: Option<String>,
}

/// Point-in-time view of a backend for `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct BackendSnapshot {
    pub enabled: bool,
    pub command: String,
    pub status: BackendStatus,
    pub last_seen: DateTime<Utc>,
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub capabilities: CapabilityCounts,
    pub config: ConfigEcho,
}

#[derive(Debug, Clone, Serialize)]
pub struct CapabilityCounts {
    pub tools: usize,
    pub resources: usize,
    pub prompts: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigEcho {
    pub enabled: bool,
    pub command: String,
    pub args: Vec<String>,
    pub priority: i64,
    pub tags: Vec<String>,
}

/// Supervisor-level knobs that are not part of the server descriptor.
#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub remote_retries: u32,
    pub failover: FailoverConfig,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            remote_retries: 0,
            failover: FailoverConfig::default(),
        }
    }
}

fn client_info() -> Value {
    json!({ "name": "mcp-switchboard", "version": env!("CARGO_PKG_VERSION") })
}

fn compute_backoff(retry_delay: Duration, attempt: u32) -> Duration {
    let exp = attempt.min(16);
    retry_delay
        .saturating_mul(1u32 << exp)
        .min(MAX_BACKOFF)
}

/// One backend together with its supervisor state.
pub struct ManagedBackend {
    name: String,
    config: ServerConfig,
    settings: BackendSettings,
    me: Weak<ManagedBackend>,
    session: Mutex<Option<ClientSession>>,
    http_transport: parking_lot::Mutex<Option<Arc<HttpTransport>>>,
    health: parking_lot::RwLock<Health>,
    caps: parking_lot::RwLock<CapabilityCache>,
    ping_supported: parking_lot::RwLock<Option<bool>>,
    event_tx: mpsc::UnboundedSender<BackendEvent>,
    connect_lock: Mutex<()>,
    recovery_scheduled: AtomicBool,
    shutting_down: AtomicBool,
    reverse: parking_lot::RwLock<Option<Arc<dyn SessionHandler>>>,
}

impl ManagedBackend {
    pub fn new(
        name: String,
        config: ServerConfig,
        settings: BackendSettings,
        event_tx: mpsc::UnboundedSender<BackendEvent>,
    ) -> Arc<Self> {
        let status = if config.enabled {
            BackendStatus::Connecting
        } else {
            BackendStatus::Disabled
        };
        Arc::new_cyclic(|me| Self {
            name,
            config,
            settings,
            me: me.clone(),
            session: Mutex::new(None),
            http_transport: parking_lot::Mutex::new(None),
            health: parking_lot::RwLock::new(Health {
                status,
                last_seen: Utc::now(),
                failure_count: 0,
                last_error: None,
            }),
            caps: parking_lot::RwLock::new(CapabilityCache::default()),
            ping_supported: parking_lot::RwLock::new(None),
            event_tx,
            connect_lock: Mutex::new(()),
            recovery_scheduled: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            reverse: parking_lot::RwLock::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn status(&self) -> BackendStatus {
        self.health.read().status
    }

    pub fn capabilities(&self) -> CapabilityCache {
        self.caps.read().clone()
    }

    pub fn snapshot(&self) -> BackendSnapshot {
        let health = self.health.read().clone();
        let caps = self.caps.read();
        BackendSnapshot {
            enabled: self.config.enabled,
            command: self.config.command.clone(),
            status: health.status,
            last_seen: health.last_seen,
            failure_count: health.failure_count,
            last_error: health.last_error,
            capabilities: CapabilityCounts {
                tools: caps.tools.len(),
                resources: caps.resources.len(),
                prompts: caps.prompts.len(),
            },
            config: ConfigEcho {
                enabled: self.config.enabled,
                command: self.config.command.clone(),
                args: self.config.args.clone(),
                priority: self.config.priority,
                tags: self.config.tags.clone(),
            },
        }
    }

    /// Register the handler that receives backend-initiated requests
    /// (sampling and friends). Only the direct proxy wires this.
    pub fn set_reverse_handler(&self, handler: Arc<dyn SessionHandler>) {
        *self.reverse.write() = Some(handler);
    }

    /// Bring the backend to CONNECTED, retrying with exponential backoff up
    /// to `retryAttempts`. On exhaustion the backend enters FAILED and a
    /// recovery attempt is scheduled.
    pub async fn connect(&self) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let _guard = self.connect_lock.lock().await;
        if self.status() == BackendStatus::Connected && self.session.lock().await.is_some() {
            return Ok(());
        }

        let attempts = self.config.retry_attempts;
        for attempt in 0..=attempts {
            self.health.write().status = BackendStatus::Connecting;
            match self.try_connect().await {
                Ok(()) => {
                    {
                        let mut health = self.health.write();
                        health.status = BackendStatus::Connected;
                        health.failure_count = 0;
                        health.last_error = None;
                        health.last_seen = Utc::now();
                    }
                    tracing::info!(server = %self.name, "backend connected");
                    let _ = self.event_tx.send(BackendEvent::Refreshed {
                        server: self.name.clone(),
                    });
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(
                        server = %self.name,
                        attempt,
                        error = %err,
                        "backend connect failed"
                    );
                    {
                        let mut health = self.health.write();
                        health.failure_count = health.failure_count.saturating_add(1);
                        health.last_error = Some(err.to_string());
                    }
                    if let Some(session) = self.session.lock().await.take() {
                        session.close().await;
                    }
                    if attempt < attempts {
                        tokio::time::sleep(compute_backoff(
                            self.config.retry_delay_duration(),
                            attempt,
                        ))
                        .await;
                    }
                }
            }
        }

        self.health.write().status = BackendStatus::Failed;
        self.schedule_recovery();
        Err(BridgeError::Startup(format!(
            "backend '{}' failed to connect after {} attempts",
            self.name,
            attempts + 1
        )))
    }

    async fn try_connect(&self) -> Result<()> {
        let transport = self.build_transport().await?;
        let session = ClientSession::new(self.name.clone(), transport);
        session.set_handler(Arc::new(BackendSessionHandler {
            backend: self.me.clone(),
        }));

        let init = session
            .initialize(client_info(), self.config.timeout_duration())
            .await?;

        let caps = prime_capabilities(&session, &self.name, &init, self.config.timeout_duration())
            .await;
        *self.caps.write() = caps;
        *self.session.lock().await = Some(session);
        Ok(())
    }

    async fn build_transport(&self) -> Result<Arc<dyn Transport>> {
        match self.config.transport_type {
            TransportType::Stdio => {
                let transport = StdioTransport::spawn(
                    &self.name,
                    &self.config.command,
                    &self.config.args,
                    &self.config.env,
                    self.config.cwd.as_ref(),
                )?;
                Ok(Arc::new(transport))
            }
            TransportType::Sse | TransportType::Http => {
                let url = self.config.url.as_deref().ok_or_else(|| {
                    BridgeError::Config(format!("server '{}' has no url", self.name))
                })?;
                tracing::debug!(
                    server = %self.name,
                    url,
                    headers = ?masked_headers(&self.config.headers),
                    "connecting remote backend"
                );
                let headers = header_map(&self.config.headers)?;
                if self.config.transport_type == TransportType::Sse {
                    // Waiting for the endpoint event is part of the handshake
                    // budget.
                    let connect = SseTransport::connect(&self.name, url, headers);
                    let transport =
                        tokio::time::timeout(self.config.timeout_duration(), connect)
                            .await
                            .map_err(|_| BridgeError::Startup(format!(
                                "SSE connect to {url} timed out"
                            )))??;
                    Ok(Arc::new(transport))
                } else {
                    let transport =
                        Arc::new(HttpTransport::new(&self.name, url, headers, false)?);
                    *self.http_transport.lock() = Some(transport.clone());
                    Ok(transport)
                }
            }
        }
    }

    /// Issue one request to the backend, with the single-retry policy for
    /// remote transports: on reset/404/session-terminated, clear the cached
    /// session id, re-run `initialize`, and reissue once per retry budget.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
        cancel: Option<&Arc<CancelSlot>>,
    ) -> Result<Value> {
        let timeout = timeout.unwrap_or_else(|| self.config.timeout_duration());
        let is_remote = self.config.transport_type != TransportType::Stdio;
        let mut retries_left = if is_remote {
            self.settings.remote_retries
        } else {
            0
        };

        loop {
            let session = self.session.lock().await.clone().ok_or_else(|| {
                BridgeError::Unavailable {
                    server: self.name.clone(),
                    reason: self
                        .health
                        .read()
                        .last_error
                        .clone()
                        .unwrap_or_else(|| format!("backend is {}", self.status())),
                }
            })?;

            let outcome = async {
                let pending = session.begin_request(method, params.clone()).await?;
                if let Some(slot) = cancel {
                    slot.arm(session.clone(), pending.id.clone()).await;
                }
                pending.wait(timeout).await
            }
            .await;

            match outcome {
                Ok(value) => {
                    self.record_success();
                    return Ok(value);
                }
                // A JSON-RPC error is still a live response from the backend.
                Err(BridgeError::Rpc(err)) => {
                    self.record_success();
                    return Err(BridgeError::Rpc(err));
                }
                Err(BridgeError::Cancelled) => return Err(BridgeError::Cancelled),
                Err(err) if err.is_retryable() && retries_left > 0 => {
                    retries_left -= 1;
                    tracing::warn!(
                        server = %self.name,
                        method,
                        error = %err,
                        "re-initializing remote session and retrying"
                    );
                    if let Some(http) = self.http_transport.lock().clone() {
                        http.clear_session();
                    }
                    tokio::time::sleep(REMOTE_RETRY_BACKOFF).await;
                    if let Err(reinit_err) = self.reinitialize(&session).await {
                        self.record_failure(&reinit_err).await;
                        return Err(reinit_err);
                    }
                }
                Err(err) => {
                    self.record_failure(&err).await;
                    return Err(match err {
                        BridgeError::Closed => BridgeError::Unavailable {
                            server: self.name.clone(),
                            reason: "backend session closed".to_string(),
                        },
                        other => other,
                    });
                }
            }
        }
    }

    async fn reinitialize(&self, session: &ClientSession) -> Result<()> {
        if session.is_closed() {
            self.session.lock().await.take();
            self.connect().await
        } else {
            session
                .initialize(client_info(), self.config.timeout_duration())
                .await
                .map(|_| ())
        }
    }

    /// Fire a notification at the backend, best-effort.
    pub async fn notify(&self, method: &str, params: Option<Value>) {
        let session = self.session.lock().await.clone();
        if let Some(session) = session
            && let Err(e) = session.notify(method, params).await
        {
            tracing::debug!(server = %self.name, method, error = %e, "notify failed");
        }
    }

    fn record_success(&self) {
        let mut health = self.health.write();
        health.last_seen = Utc::now();
        health.failure_count = 0;
        health.last_error = None;
    }

    async fn record_failure(&self, err: &BridgeError) {
        let failed_threshold = {
            let mut health = self.health.write();
            health.failure_count = health.failure_count.saturating_add(1);
            health.last_error = Some(err.to_string());
            self.settings.failover.enabled
                && health.failure_count >= self.settings.failover.max_failures
        };

        // A closed session is definitively dead; don't wait for the failure
        // threshold.
        let session_dead = matches!(err, BridgeError::Closed | BridgeError::Unavailable { .. })
            || self
                .session
                .lock()
                .await
                .as_ref()
                .is_some_and(ClientSession::is_closed);

        if failed_threshold || session_dead {
            self.mark_failed(&err.to_string()).await;
        }
    }

    async fn mark_failed(&self, reason: &str) {
        if self.status() == BackendStatus::Failed {
            return;
        }
        tracing::warn!(server = %self.name, reason, "marking backend as failed");
        self.health.write().status = BackendStatus::Failed;
        if let Some(session) = self.session.lock().await.take() {
            session.close().await;
        }
        self.schedule_recovery();
    }

    fn schedule_recovery(&self) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        if !self.settings.failover.enabled {
            return;
        }
        if self.recovery_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(backend) = self.me.upgrade() else {
            return;
        };
        let delay = Duration::from_millis(self.settings.failover.recovery_interval);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            backend.recovery_scheduled.store(false, Ordering::Release);
            if backend.shutting_down.load(Ordering::Acquire) {
                return;
            }
            if backend.status() == BackendStatus::Failed {
                tracing::info!(server = %backend.name, "attempting scheduled recovery");
                let _ = backend.connect().await;
            }
        });
    }

    /// One health-check probe: `ping` where the backend honors it, otherwise
    /// `tools/list`.
    pub async fn probe(&self) {
        if self.status() != BackendStatus::Connected {
            return;
        }
        let timeout = Duration::from_millis(self.config.health_check.timeout);
        let use_ping = *self.ping_supported.read() != Some(false);
        let method = if use_ping {
            methods::PING
        } else {
            methods::TOOLS_LIST
        };

        let session = self.session.lock().await.clone();
        let Some(session) = session else {
            self.mark_failed("no session").await;
            return;
        };

        match session.request(method, None, timeout).await {
            Ok(_) => {
                if use_ping {
                    *self.ping_supported.write() = Some(true);
                }
                self.record_success();
            }
            Err(BridgeError::Rpc(err)) if err.code == rpc::METHOD_NOT_FOUND && use_ping => {
                // Backend lacks ping; fall back to a cheap list next round.
                *self.ping_supported.write() = Some(false);
                self.record_success();
            }
            // Any JSON-RPC error is still a live response.
            Err(BridgeError::Rpc(_)) => self.record_success(),
            Err(err) => {
                tracing::warn!(server = %self.name, error = %err, "health check failed");
                self.record_failure(&err).await;
            }
        }
    }

    pub fn spawn_health_loop(&self, ct: CancellationToken) {
        if !self.config.health_check.enabled || !self.config.enabled {
            return;
        }
        let Some(backend) = self.me.upgrade() else {
            return;
        };
        let interval = Duration::from_millis(self.config.health_check.interval.max(1000));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => break,
                    () = tokio::time::sleep(interval) => backend.probe().await,
                }
            }
        });
    }

    /// Re-request the capability lists after a `list_changed` notification.
    pub async fn refresh_capabilities(&self) -> Result<()> {
        let session = self
            .session
            .lock()
            .await
            .clone()
            .ok_or(BridgeError::Closed)?;
        let init = session.server_info().unwrap_or_default();
        let caps =
            prime_capabilities(&session, &self.name, &init, self.config.timeout_duration()).await;
        *self.caps.write() = caps;
        Ok(())
    }

    /// Graceful shutdown: stop sending, close the transport, and for stdio
    /// children close stdin then wait out the grace period.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.health.write().status = BackendStatus::Disconnected;
        if let Some(session) = self.session.lock().await.take() {
            session.close().await;
        }
    }

    /// Test hook: install a pre-connected session and capability cache.
    #[cfg(test)]
    pub fn install_for_tests(&self, session: ClientSession, caps: CapabilityCache) {
        *self.caps.write() = caps;
        self.health.write().status = BackendStatus::Connected;
        *self.session.try_lock().expect("unlocked") = Some(session);
    }
}

async fn prime_capabilities(
    session: &ClientSession,
    server: &str,
    init: &Value,
    timeout: Duration,
) -> CapabilityCache {
    let mut caps = CapabilityCache {
        server_info: init.get("serverInfo").cloned().unwrap_or_default(),
        server_capabilities: init.get("capabilities").cloned().unwrap_or_default(),
        ..CapabilityCache::default()
    };

    for (method, field) in [
        (methods::TOOLS_LIST, "tools"),
        (methods::RESOURCES_LIST, "resources"),
        (methods::RESOURCE_TEMPLATES_LIST, "resourceTemplates"),
        (methods::PROMPTS_LIST, "prompts"),
    ] {
        let items = match session.request(method, None, timeout).await {
            Ok(result) => result
                .get(field)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            Err(BridgeError::Rpc(err)) if err.code == rpc::METHOD_NOT_FOUND => {
                // The backend simply lacks this capability.
                Vec::new()
            }
            Err(err) => {
                tracing::warn!(server, method, error = %err, "capability discovery failed");
                Vec::new()
            }
        };
        match field {
            "tools" => caps.tools = items,
            "resources" => caps.resources = items,
            "resourceTemplates" => caps.resource_templates = items,
            _ => caps.prompts = items,
        }
    }

    tracing::info!(
        server,
        tools = caps.tools.len(),
        resources = caps.resources.len(),
        prompts = caps.prompts.len(),
        "capability discovery complete"
    );
    caps
}

/// Routes backend-initiated traffic into the supervisor.
struct BackendSessionHandler {
    backend: Weak<ManagedBackend>,
}

#[async_trait]
impl SessionHandler for BackendSessionHandler {
    async fn handle_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> std::result::Result<Value, RpcError> {
        let Some(backend) = self.backend.upgrade() else {
            return Err(RpcError::method_not_found(method));
        };
        let reverse = backend.reverse.read().clone();
        match reverse {
            Some(handler) => handler.handle_request(method, params).await,
            None => Err(RpcError::method_not_found(method)),
        }
    }

    async fn handle_notification(&self, method: &str, params: Option<Value>) {
        let Some(backend) = self.backend.upgrade() else {
            return;
        };
        let event = match method {
            methods::NOTIFY_TOOLS_CHANGED => BackendEvent::ListChanged {
                server: backend.name.clone(),
                kind: CapabilityKind::Tools,
            },
            methods::NOTIFY_RESOURCES_CHANGED => BackendEvent::ListChanged {
                server: backend.name.clone(),
                kind: CapabilityKind::Resources,
            },
            methods::NOTIFY_PROMPTS_CHANGED => BackendEvent::ListChanged {
                server: backend.name.clone(),
                kind: CapabilityKind::Prompts,
            },
            _ => BackendEvent::Forward {
                server: backend.name.clone(),
                method: method.to_string(),
                params,
            },
        };
        let _ = backend.event_tx.send(event);
    }
}

// ============================================================================
// Backend set
// ============================================================================

/// All managed backends, in configuration order.
pub struct BackendSet {
    backends: Vec<Arc<ManagedBackend>>,
    by_name: HashMap<String, usize>,
}

impl BackendSet {
    pub fn new(
        servers: Vec<(String, ServerConfig)>,
        settings: BackendSettings,
        event_tx: mpsc::UnboundedSender<BackendEvent>,
    ) -> Arc<Self> {
        let mut backends = Vec::new();
        let mut by_name = HashMap::new();
        for (name, config) in servers {
            let backend =
                ManagedBackend::new(name.clone(), config, settings.clone(), event_tx.clone());
            by_name.insert(name, backends.len());
            backends.push(backend);
        }
        Arc::new(Self { backends, by_name })
    }

    /// Test hook: assemble a set from pre-built backends.
    #[cfg(test)]
    pub fn for_tests(backends: Vec<Arc<ManagedBackend>>) -> Arc<Self> {
        let by_name = backends
            .iter()
            .enumerate()
            .map(|(i, b)| (b.name().to_string(), i))
            .collect();
        Arc::new(Self { backends, by_name })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ManagedBackend>> {
        self.by_name.get(name).map(|&i| &self.backends[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ManagedBackend>> {
        self.backends.iter()
    }

    /// Connect every enabled backend concurrently and start health loops.
    /// Waits up to 30 seconds for the initial round; stragglers keep
    /// connecting in the background.
    pub async fn start_all(&self, ct: &CancellationToken) {
        let mut handles = Vec::new();
        for backend in &self.backends {
            backend.spawn_health_loop(ct.clone());
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                let _ = backend.connect().await;
            }));
        }
        let initial_round = futures::future::join_all(handles);
        if tokio::time::timeout(Duration::from_secs(30), initial_round)
            .await
            .is_err()
        {
            tracing::warn!("some servers took longer than 30 seconds to connect");
        }

        let connected = self
            .backends
            .iter()
            .filter(|b| b.status() == BackendStatus::Connected)
            .count();
        tracing::info!(
            connected,
            configured = self.backends.len(),
            "backend startup round complete"
        );
    }

    pub async fn shutdown_all(&self) {
        for backend in &self.backends {
            backend.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_channel() -> (
        mpsc::UnboundedSender<BackendEvent>,
        mpsc::UnboundedReceiver<BackendEvent>,
    ) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(1000);
        assert_eq!(compute_backoff(base, 0), Duration::from_millis(1000));
        assert_eq!(compute_backoff(base, 1), Duration::from_millis(2000));
        assert_eq!(compute_backoff(base, 2), Duration::from_millis(4000));
        assert_eq!(compute_backoff(base, 10), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn disabled_backend_never_connects() {
        let (tx, _rx) = event_channel();
        let mut config = ServerConfig::stdio("definitely-missing".to_string(), vec![], HashMap::new());
        config.enabled = false;
        let backend = ManagedBackend::new(
            "off".to_string(),
            config,
            BackendSettings::default(),
            tx,
        );
        backend.connect().await.unwrap();
        assert_eq!(backend.status(), BackendStatus::Disabled);
    }

    #[tokio::test]
    async fn connect_failure_exhausts_retries_and_fails() {
        let (tx, _rx) = event_channel();
        // `true` exits immediately, so the handshake sees EOF.
        let mut config = ServerConfig::stdio("true".to_string(), vec![], HashMap::new());
        config.retry_attempts = 0;
        config.retry_delay = 1;
        config.timeout = 1;
        let backend = ManagedBackend::new(
            "dead".to_string(),
            config,
            BackendSettings::default(),
            tx,
        );

        let err = backend.connect().await.unwrap_err();
        assert!(matches!(err, BridgeError::Startup(_)));
        assert_eq!(backend.status(), BackendStatus::Failed);
        let snapshot = backend.snapshot();
        assert!(snapshot.failure_count >= 1);
        assert!(snapshot.last_error.is_some());
    }

    #[tokio::test]
    async fn failed_probe_on_dead_session_marks_backend_failed() {
        use crate::transport::duplex;

        let (tx, _rx) = event_channel();
        let config = ServerConfig::stdio("cmd".to_string(), vec![], HashMap::new());
        let backend = ManagedBackend::new(
            "flaky".to_string(),
            config,
            BackendSettings::default(),
            tx,
        );
        let (near, far) = event_session_pair("flaky");
        backend.install_for_tests(near, CapabilityCache::default());
        assert_eq!(backend.status(), BackendStatus::Connected);

        // Kill the peer; the next probe must flip the backend to FAILED.
        far.close().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        backend.probe().await;
        assert_eq!(backend.status(), BackendStatus::Failed);
        assert!(backend.snapshot().last_error.is_some());

        fn event_session_pair(name: &str) -> (ClientSession, Arc<dyn Transport>) {
            let (near, far) = duplex::pair();
            (
                ClientSession::new(name.to_string(), Arc::new(near)),
                Arc::new(far),
            )
        }
    }

    /// A streamable-HTTP upstream that 404s one request after an idle
    /// recycle. With a retry budget of one, the supervisor clears the session
    /// id, re-runs `initialize`, and reissues the request.
    #[tokio::test]
    async fn remote_404_triggers_reinit_and_retry() {
        use axum::http::HeaderMap as AxumHeaderMap;
        use axum::response::IntoResponse;

        #[derive(Default)]
        struct Upstream {
            sessions_issued: u32,
            current: Option<String>,
            recycled: bool,
        }

        async fn mcp(
            axum::extract::State(state): axum::extract::State<Arc<parking_lot::Mutex<Upstream>>>,
            headers: AxumHeaderMap,
            body: String,
        ) -> axum::response::Response {
            let msg = crate::rpc::Message::from_str(&body).unwrap();
            let presented = headers
                .get("mcp-session-id")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);

            match msg {
                crate::rpc::Message::Request(req) if req.method == methods::INITIALIZE => {
                    let session = {
                        let mut st = state.lock();
                        st.sessions_issued += 1;
                        let session = format!("session-{}", st.sessions_issued);
                        st.current = Some(session.clone());
                        session
                    };
                    let reply = crate::rpc::Message::response(
                        req.id,
                        json!({
                            "protocolVersion": crate::rpc::PROTOCOL_VERSION,
                            "capabilities": { "tools": {} },
                            "serverInfo": { "name": "upstream", "version": "0" },
                        }),
                    );
                    (
                        [("mcp-session-id", session)],
                        axum::Json(reply.to_value()),
                    )
                        .into_response()
                }
                crate::rpc::Message::Request(req) => {
                    let mut st = state.lock();
                    if presented != st.current {
                        return axum::http::StatusCode::NOT_FOUND.into_response();
                    }
                    if req.method == methods::TOOLS_CALL && !st.recycled {
                        // Simulate the idle recycle: the session is gone.
                        st.recycled = true;
                        st.current = None;
                        return axum::http::StatusCode::NOT_FOUND.into_response();
                    }
                    let result = match req.method.as_str() {
                        methods::TOOLS_CALL => json!({ "result": "hi" }),
                        _ => json!({ "tools": [], "resources": [], "resourceTemplates": [], "prompts": [] }),
                    };
                    axum::Json(crate::rpc::Message::response(req.id, result).to_value())
                        .into_response()
                }
                _ => axum::http::StatusCode::ACCEPTED.into_response(),
            }
        }

        let upstream = Arc::new(parking_lot::Mutex::new(Upstream::default()));
        let app = axum::Router::new()
            .route("/mcp", axum::routing::post(mcp))
            .with_state(upstream.clone());
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (tx, _rx) = event_channel();
        let mut config = ServerConfig::remote(
            format!("http://127.0.0.1:{port}/mcp"),
            TransportType::Http,
            HashMap::new(),
        );
        config.timeout = 5;
        config.retry_attempts = 0;
        let backend = ManagedBackend::new(
            "remote".to_string(),
            config,
            BackendSettings {
                remote_retries: 1,
                failover: FailoverConfig::default(),
            },
            tx,
        );

        backend.connect().await.unwrap();
        assert_eq!(backend.status(), BackendStatus::Connected);

        // The first tools/call hits the recycled session; one re-init and
        // reissue later the frontend-visible result is normal.
        let result = backend
            .request(
                methods::TOOLS_CALL,
                Some(json!({"name": "t", "arguments": {}})),
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(result["result"], "hi");
        assert_eq!(upstream.lock().sessions_issued, 2);
        assert_eq!(backend.status(), BackendStatus::Connected);
    }

    #[tokio::test]
    async fn request_without_session_is_unavailable() {
        let (tx, _rx) = event_channel();
        let config = ServerConfig::stdio("cmd".to_string(), vec![], HashMap::new());
        let backend = ManagedBackend::new(
            "gone".to_string(),
            config,
            BackendSettings::default(),
            tx,
        );
        let err = backend
            .request(methods::TOOLS_LIST, None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Unavailable { .. }));
    }
}
