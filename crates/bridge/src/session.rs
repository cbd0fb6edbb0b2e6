//! JSON-RPC peer session over one transport.
//!
//! A [`ClientSession`] drives the MCP handshake, allocates monotonic request
//! ids, and correlates responses back to waiters. Incoming requests and
//! notifications from the remote side are dispatched to a [`SessionHandler`]
//! registered after construction, which breaks the reference cycle between
//! the session and the proxy engine: the engine owns the session, the session
//! holds a non-owning handler seam.

use crate::error::{BridgeError, Result};
use crate::rpc::{
    self, Message, Notification, Request, RequestId, RpcError, methods,
};
use crate::transport::Transport;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

/// How a registered waiter resolves.
enum Outcome {
    Result(Value),
    Error(RpcError),
    Cancelled,
    Closed,
}

/// Receives requests and notifications initiated by the remote peer.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    async fn handle_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> std::result::Result<Value, RpcError>;

    async fn handle_notification(&self, method: &str, params: Option<Value>);
}

struct SessionInner {
    server: String,
    transport: Arc<dyn Transport>,
    next_id: AtomicI64,
    pending: parking_lot::Mutex<HashMap<RequestId, oneshot::Sender<Outcome>>>,
    handler: parking_lot::RwLock<Option<Arc<dyn SessionHandler>>>,
    closed: AtomicBool,
    server_info: parking_lot::RwLock<Option<Value>>,
}

impl SessionInner {
    fn resolve(&self, id: &RequestId, outcome: Outcome) {
        let waiter = self.pending.lock().remove(id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => {
                // A peer answering with an id we never issued (or answered
                // late) must not terminate the session.
                tracing::debug!(server = %self.server, %id, "dropping response with unknown id");
            }
        }
    }

    fn drain(&self, outcome_for: fn() -> Outcome) {
        let waiters: Vec<_> = self.pending.lock().drain().collect();
        for (_, tx) in waiters {
            let _ = tx.send(outcome_for());
        }
    }
}

/// A stateful JSON-RPC peer bound to one transport.
#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<SessionInner>,
}

impl ClientSession {
    /// Wrap a transport and start its inbound reader task.
    pub fn new(server: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        let inner = Arc::new(SessionInner {
            server: server.into(),
            transport,
            next_id: AtomicI64::new(1),
            pending: parking_lot::Mutex::new(HashMap::new()),
            handler: parking_lot::RwLock::new(None),
            closed: AtomicBool::new(false),
            server_info: parking_lot::RwLock::new(None),
        });

        let reader = inner.clone();
        tokio::spawn(async move {
            read_loop(reader).await;
        });

        Self { inner }
    }

    pub fn server_name(&self) -> &str {
        &self.inner.server
    }

    pub fn set_handler(&self, handler: Arc<dyn SessionHandler>) {
        *self.inner.handler.write() = Some(handler);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// The `InitializeResult` recorded from the last successful handshake.
    pub fn server_info(&self) -> Option<Value> {
        self.inner.server_info.read().clone()
    }

    /// Run the MCP handshake: `initialize`, then `notifications/initialized`.
    pub async fn initialize(&self, client_info: Value, timeout: Duration) -> Result<Value> {
        let params = json!({
            "protocolVersion": rpc::PROTOCOL_VERSION,
            "capabilities": { "roots": {}, "sampling": {} },
            "clientInfo": client_info,
        });
        let result = self
            .request(methods::INITIALIZE, Some(params), timeout)
            .await?;

        let version = result
            .get("protocolVersion")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                BridgeError::Protocol("initialize result lacks protocolVersion".to_string())
            })?;
        if !rpc::SUPPORTED_PROTOCOL_VERSIONS.contains(&version) {
            return Err(BridgeError::Startup(format!(
                "protocol version mismatch: server offered '{version}'"
            )));
        }

        *self.inner.server_info.write() = Some(result.clone());
        self.notify(methods::INITIALIZED, None).await?;
        Ok(result)
    }

    /// Allocate an id, register a waiter, and write the request.
    pub async fn begin_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<PendingRequest> {
        if self.is_closed() {
            return Err(BridgeError::Closed);
        }

        let id = RequestId::Number(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id.clone(), tx);

        let msg = Message::Request(Request {
            id: id.clone(),
            method: method.to_string(),
            params,
        });
        if let Err(e) = self.inner.transport.send(msg).await {
            self.inner.pending.lock().remove(&id);
            return Err(e);
        }

        Ok(PendingRequest {
            session: self.clone(),
            id,
            rx,
        })
    }

    /// Send a request and wait for its response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        self.begin_request(method, params).await?.wait(timeout).await
    }

    /// Fire-and-forget notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        if self.is_closed() {
            return Err(BridgeError::Closed);
        }
        self.inner
            .transport
            .send(Message::Notification(Notification {
                method: method.to_string(),
                params,
            }))
            .await
    }

    /// Drop the waiter for `id` and tell the remote side via
    /// `notifications/cancelled`. A late answer for the id is discarded.
    pub async fn cancel(&self, id: &RequestId, reason: Option<String>) {
        let waiter = self.inner.pending.lock().remove(id);
        if let Some(tx) = waiter {
            let _ = tx.send(Outcome::Cancelled);
        }

        let mut params = json!({ "requestId": id });
        if let Some(reason) = reason {
            params["reason"] = json!(reason);
        }
        if let Err(e) = self.notify(methods::NOTIFY_CANCELLED, Some(params)).await {
            tracing::debug!(server = %self.inner.server, %id, error = %e, "failed to send cancellation");
        }
    }

    /// Close the session: no message is delivered past this point, and every
    /// outstanding waiter completes with a synthetic error.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.drain(|| Outcome::Closed);
        self.inner.transport.close().await;
    }

    fn forget(&self, id: &RequestId) {
        self.inner.pending.lock().remove(id);
    }
}

/// An issued request whose response has not arrived yet.
pub struct PendingRequest {
    session: ClientSession,
    pub id: RequestId,
    rx: oneshot::Receiver<Outcome>,
}

impl PendingRequest {
    /// Wait for the response, a timeout, or session close.
    ///
    /// On timeout the waiter is removed without sending a cancellation; the
    /// remote may still answer and the late response will be dropped.
    pub async fn wait(mut self, timeout: Duration) -> Result<Value> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(Outcome::Result(value))) => Ok(value),
            Ok(Ok(Outcome::Error(error))) => Err(BridgeError::Rpc(error)),
            Ok(Ok(Outcome::Cancelled)) => Err(BridgeError::Cancelled),
            Ok(Ok(Outcome::Closed)) | Ok(Err(_)) => Err(BridgeError::Closed),
            Err(_) => {
                self.session.forget(&self.id);
                Err(BridgeError::Timeout {
                    server: self.session.server_name().to_string(),
                    ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

/// A handle through which a forwarded request can be cancelled once the
/// backend id it maps to is known.
///
/// The proxy engine keeps one slot per in-flight frontend request; the
/// backend call arms it after the backend id is allocated. Arming and
/// cancelling may race, so both sides re-check.
pub struct CancelSlot {
    cancelled: AtomicBool,
    reason: parking_lot::Mutex<Option<String>>,
    target: tokio::sync::Mutex<Option<(ClientSession, RequestId)>>,
}

impl CancelSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            reason: parking_lot::Mutex::new(None),
            target: tokio::sync::Mutex::new(None),
        })
    }

    pub async fn arm(&self, session: ClientSession, id: RequestId) {
        if self.cancelled.load(Ordering::Acquire) {
            let reason = self.reason.lock().clone();
            session.cancel(&id, reason).await;
            return;
        }
        *self.target.lock().await = Some((session, id));
        if self.cancelled.load(Ordering::Acquire)
            && let Some((session, id)) = self.target.lock().await.take()
        {
            let reason = self.reason.lock().clone();
            session.cancel(&id, reason).await;
        }
    }

    pub async fn cancel(&self, reason: Option<String>) {
        *self.reason.lock() = reason.clone();
        self.cancelled.store(true, Ordering::Release);
        if let Some((session, id)) = self.target.lock().await.take() {
            session.cancel(&id, reason).await;
        }
    }
}

async fn read_loop(inner: Arc<SessionInner>) {
    loop {
        let Some(msg) = inner.transport.recv().await else {
            break;
        };
        if inner.closed.load(Ordering::Acquire) {
            break;
        }

        match msg {
            Message::Response(resp) => inner.resolve(&resp.id, Outcome::Result(resp.result)),
            Message::Error(err) => inner.resolve(&err.id, Outcome::Error(err.error)),
            Message::Request(req) => {
                let handler = inner.handler.read().clone();
                let reply = match handler {
                    Some(handler) => {
                        match handler.handle_request(&req.method, req.params).await {
                            Ok(result) => Message::response(req.id, result),
                            Err(error) => Message::error(req.id, error),
                        }
                    }
                    None => Message::error(req.id, RpcError::method_not_found(&req.method)),
                };
                if inner.transport.send(reply).await.is_err() {
                    break;
                }
            }
            Message::Notification(note) => {
                let handler = inner.handler.read().clone();
                match handler {
                    Some(handler) => {
                        handler.handle_notification(&note.method, note.params).await;
                    }
                    None => {
                        tracing::debug!(
                            server = %inner.server,
                            method = %note.method,
                            "notification with no handler"
                        );
                    }
                }
            }
        }
    }

    // Peer gone: complete outstanding waiters so nothing leaks.
    inner.closed.store(true, Ordering::Release);
    inner.drain(|| Outcome::Closed);
    tracing::debug!(server = %inner.server, "session reader finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::duplex;

    /// Serve the far side of a duplex pair with a canned responder.
    fn spawn_peer<F>(transport: Arc<dyn Transport>, mut respond: F)
    where
        F: FnMut(Request) -> Option<Message> + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(msg) = transport.recv().await {
                if let Message::Request(req) = msg
                    && let Some(reply) = respond(req)
                {
                    let _ = transport.send(reply).await;
                }
            }
        });
    }

    fn init_result() -> Value {
        json!({
            "protocolVersion": rpc::PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "serverInfo": { "name": "peer", "version": "0.0.0" },
        })
    }

    #[tokio::test]
    async fn initialize_handshake_records_server_info() {
        let (near, far) = duplex::pair();
        let far: Arc<dyn Transport> = Arc::new(far);
        spawn_peer(far, |req| {
            assert_eq!(req.method, methods::INITIALIZE);
            Some(Message::response(req.id, init_result()))
        });

        let session = ClientSession::new("peer", Arc::new(near));
        let result = session
            .initialize(json!({"name": "test", "version": "0"}), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(result["serverInfo"]["name"], "peer");
        assert!(session.server_info().is_some());
    }

    #[tokio::test]
    async fn initialize_rejects_unknown_protocol_version() {
        let (near, far) = duplex::pair();
        let far: Arc<dyn Transport> = Arc::new(far);
        spawn_peer(far, |req| {
            Some(Message::response(
                req.id,
                json!({ "protocolVersion": "1999-01-01", "capabilities": {} }),
            ))
        });

        let session = ClientSession::new("peer", Arc::new(near));
        let err = session
            .initialize(json!({}), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Startup(_)));
    }

    #[tokio::test]
    async fn request_correlates_by_id() {
        let (near, far) = duplex::pair();
        let far: Arc<dyn Transport> = Arc::new(far);
        spawn_peer(far, |req| Some(Message::response(req.id, json!({"m": req.method}))));

        let session = ClientSession::new("peer", Arc::new(near));
        let a = session.request("tools/list", None, Duration::from_secs(2));
        let b = session.request("prompts/list", None, Duration::from_secs(2));
        let (a, b) = tokio::join!(a, b);
        assert_eq!(a.unwrap()["m"], "tools/list");
        assert_eq!(b.unwrap()["m"], "prompts/list");
    }

    #[tokio::test]
    async fn backend_error_is_relayed_verbatim() {
        let (near, far) = duplex::pair();
        let far: Arc<dyn Transport> = Arc::new(far);
        spawn_peer(far, |req| {
            Some(Message::error(
                req.id,
                RpcError {
                    code: rpc::INVALID_PARAMS,
                    message: "bad args".to_string(),
                    data: Some(json!({"field": "x"})),
                },
            ))
        });

        let session = ClientSession::new("peer", Arc::new(near));
        let err = session
            .request("tools/call", None, Duration::from_secs(2))
            .await
            .unwrap_err();
        let BridgeError::Rpc(rpc_err) = err else { panic!("expected rpc error") };
        assert_eq!(rpc_err.code, rpc::INVALID_PARAMS);
        assert_eq!(rpc_err.data, Some(json!({"field": "x"})));
    }

    #[tokio::test]
    async fn timeout_leaves_no_waiter_and_drops_late_answer() {
        let (near, far) = duplex::pair();
        let far: Arc<dyn Transport> = Arc::new(far);
        let session = ClientSession::new("peer", Arc::new(near));

        let pending = session.begin_request("slow", None).await.unwrap();
        let id = pending.id.clone();
        let err = pending.wait(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { .. }));

        // A late answer for the timed-out id must be dropped silently.
        far.send(Message::response(id, json!({}))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn close_drains_outstanding_waiters() {
        let (near, _far) = duplex::pair();
        let session = ClientSession::new("peer", Arc::new(near));

        let pending = session.begin_request("hang", None).await.unwrap();
        session.close().await;
        let err = pending.wait(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, BridgeError::Closed));
    }

    #[tokio::test]
    async fn cancel_resolves_waiter_and_notifies_peer() {
        let (near, far) = duplex::pair();
        let session = ClientSession::new("peer", Arc::new(near));

        let pending = session.begin_request("slow", None).await.unwrap();
        let id = pending.id.clone();

        // The peer sees the request first, then the cancellation.
        let Message::Request(_) = far.recv().await.unwrap() else {
            panic!("expected request")
        };
        session.cancel(&id, Some("frontend went away".to_string())).await;

        let err = pending.wait(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, BridgeError::Cancelled));

        let Message::Notification(note) = far.recv().await.unwrap() else {
            panic!("expected notification")
        };
        assert_eq!(note.method, methods::NOTIFY_CANCELLED);
        assert_eq!(note.params.unwrap()["requestId"], json!(id));
    }

    #[tokio::test]
    async fn peer_requests_reach_the_handler() {
        struct Echo;
        #[async_trait]
        impl SessionHandler for Echo {
            async fn handle_request(
                &self,
                method: &str,
                _params: Option<Value>,
            ) -> std::result::Result<Value, RpcError> {
                Ok(json!({ "echoed": method }))
            }
            async fn handle_notification(&self, _method: &str, _params: Option<Value>) {}
        }

        let (near, far) = duplex::pair();
        let session = ClientSession::new("peer", Arc::new(near));
        session.set_handler(Arc::new(Echo));

        far.send(Message::request(9, "sampling/createMessage", None))
            .await
            .unwrap();
        let Message::Response(resp) = far.recv().await.unwrap() else {
            panic!("expected response")
        };
        assert_eq!(resp.id, RequestId::Number(9));
        assert_eq!(resp.result["echoed"], "sampling/createMessage");
    }

    #[tokio::test]
    async fn unknown_response_id_is_dropped_not_fatal() {
        let (near, far) = duplex::pair();
        let session = ClientSession::new("peer", Arc::new(near));

        far.send(Message::response(RequestId::Number(999), json!({})))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!session.is_closed());

        // The session still works afterwards.
        spawn_peer(Arc::new(far) as Arc<dyn Transport>, |req| {
            Some(Message::response(req.id, json!(1)))
        });
        let v = session.request("ping", None, Duration::from_secs(2)).await.unwrap();
        assert_eq!(v, json!(1));
    }
}
