//! Transport adapters.
//!
//! Every transport presents the same duplex contract: an inbound stream of
//! [`Message`]s, an outbound sink, and `close()`. Framing above this layer
//! never sees transport details.
//!
//! Malformed frames are dropped with a warning; they never tear down the
//! transport.

use crate::error::{BridgeError, Result};
use crate::rpc::Message;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc};

const UPSTREAM_HINT: &str = "check backend health/path/auth";
const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one message. Writes are serialized per transport.
    async fn send(&self, msg: Message) -> Result<()>;

    /// Next inbound message, or `None` once the peer is gone.
    async fn recv(&self) -> Option<Message>;

    async fn close(&self);
}

/// Convert configured headers into a reqwest header map.
pub fn header_map(headers: &HashMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| BridgeError::Config(format!("invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| BridgeError::Config(format!("invalid header value for '{name:?}': {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Header pairs with sensitive values replaced, for logging.
pub fn masked_headers(headers: &HashMap<String, String>) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let lower = name.to_ascii_lowercase();
            let sensitive = lower == "authorization"
                || lower == "x-api-key"
                || lower.contains("token")
                || lower.contains("secret");
            let shown = if sensitive { "***".to_string() } else { value.clone() };
            (name.clone(), shown)
        })
        .collect()
}

fn parse_frame(server: &str, text: &str) -> Option<Message> {
    match Message::from_str(text) {
        Ok(msg) => Some(msg),
        Err(err) => {
            tracing::warn!(server, error = %err, "dropping malformed frame");
            None
        }
    }
}

// ============================================================================
// Child stdio
// ============================================================================

/// Line-delimited JSON over a child process's stdin/stdout. Stderr is
/// forwarded to the host logger; protocol bytes never mix with it.
pub struct StdioTransport {
    server: String,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    inbound: Mutex<mpsc::Receiver<Message>>,
}

impl StdioTransport {
    pub fn spawn(
        server: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&PathBuf>,
    ) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| BridgeError::Startup(format!("failed to spawn '{command}': {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Startup("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Startup("failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BridgeError::Startup("failed to capture stderr".to_string()))?;

        let (inbound_tx, inbound_rx) = mpsc::channel::<Message>(64);

        let name = server.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                if let Some(msg) = parse_frame(&name, &line)
                    && inbound_tx.send(msg).await.is_err()
                {
                    break;
                }
            }
            // Dropping inbound_tx closes the stream with EOF.
            tracing::debug!(server = %name, "child stdout closed");
        });

        let name = server.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(server = %name, "child stderr: {line}");
            }
        });

        Ok(Self {
            server: server.to_string(),
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(Some(stdin)),
            inbound: Mutex::new(inbound_rx),
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, msg: Message) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| BridgeError::Transport("child stdin closed".to_string()))?;
        let mut line = msg.to_json();
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| BridgeError::Transport(format!("broken pipe to child: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| BridgeError::Transport(format!("broken pipe to child: {e}")))?;
        Ok(())
    }

    async fn recv(&self) -> Option<Message> {
        self.inbound.lock().await.recv().await
    }

    async fn close(&self) {
        // Close stdin first so a well-behaved child can exit on its own.
        drop(self.stdin.lock().await.take());

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(server = %self.server, %status, "child exited");
                }
                Ok(Err(e)) => {
                    tracing::warn!(server = %self.server, error = %e, "error awaiting child exit");
                }
                Err(_) => {
                    tracing::warn!(server = %self.server, "child did not exit in time, killing");
                    let _ = child.kill().await;
                }
            }
        }
    }
}

// ============================================================================
// Outbound SSE
// ============================================================================

/// Client side of the SSE transport: a long-lived GET event stream for
/// server-to-client frames plus short POSTs for client-to-server frames.
///
/// The server's initial `endpoint` event names the POST URL; subsequent
/// `message` events carry JSON-RPC payloads.
pub struct SseTransport {
    server: String,
    client: reqwest::Client,
    endpoint_url: reqwest::Url,
    headers: HeaderMap,
    inbound: Mutex<mpsc::Receiver<Message>>,
    listener: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SseTransport {
    pub async fn connect(server: &str, url: &str, headers: HeaderMap) -> Result<Self> {
        let base = reqwest::Url::parse(url)
            .map_err(|e| BridgeError::Config(format!("invalid SSE URL '{url}': {e}")))?;
        let client = reqwest::Client::new();

        let request = client.get(base.clone()).headers(headers.clone());
        let mut events = reqwest_eventsource::EventSource::new(request)
            .map_err(|e| BridgeError::Transport(format!("failed to open SSE stream: {e}")))?;

        // The first meaningful event names the POST endpoint.
        let endpoint_url = loop {
            match events.next().await {
                Some(Ok(reqwest_eventsource::Event::Open)) => {}
                Some(Ok(reqwest_eventsource::Event::Message(ev))) if ev.event == "endpoint" => {
                    break base.join(ev.data.trim()).map_err(|e| {
                        BridgeError::Transport(format!("invalid endpoint event '{}': {e}", ev.data))
                    })?;
                }
                Some(Ok(reqwest_eventsource::Event::Message(ev))) => {
                    tracing::debug!(server, event = %ev.event, "ignoring pre-endpoint event");
                }
                Some(Err(err)) => {
                    events.close();
                    return Err(sse_stream_error(url, err));
                }
                None => {
                    return Err(BridgeError::Transport(format!(
                        "SSE stream from {url} ended before endpoint event"
                    )));
                }
            }
        };

        tracing::debug!(server, endpoint = %endpoint_url, "SSE endpoint negotiated");

        let (inbound_tx, inbound_rx) = mpsc::channel::<Message>(64);
        let name = server.to_string();
        let listener = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    Ok(reqwest_eventsource::Event::Open) => {}
                    Ok(reqwest_eventsource::Event::Message(ev)) => {
                        if ev.event != "message" {
                            tracing::debug!(server = %name, event = %ev.event, "ignoring event");
                            continue;
                        }
                        if let Some(msg) = parse_frame(&name, &ev.data)
                            && inbound_tx.send(msg).await.is_err()
                        {
                            break;
                        }
                    }
                    Err(reqwest_eventsource::Error::StreamEnded) => break,
                    Err(err) => {
                        tracing::warn!(server = %name, error = %err, "SSE stream error");
                        break;
                    }
                }
            }
            events.close();
            tracing::debug!(server = %name, "SSE stream closed");
        });

        Ok(Self {
            server: server.to_string(),
            client,
            endpoint_url,
            headers,
            inbound: Mutex::new(inbound_rx),
            listener: Mutex::new(Some(listener)),
        })
    }
}

fn sse_stream_error(url: &str, err: reqwest_eventsource::Error) -> BridgeError {
    match err {
        reqwest_eventsource::Error::InvalidStatusCode(status, _) => BridgeError::Upstream {
            url: url.to_string(),
            status: status.as_u16(),
            hint: UPSTREAM_HINT.to_string(),
        },
        other => BridgeError::Transport(format!("SSE connect to {url} failed: {other}")),
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn send(&self, msg: Message) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint_url.clone())
            .headers(self.headers.clone())
            .json(&msg.to_value())
            .send()
            .await
            .map_err(|e| BridgeError::Transport(format!("POST to SSE endpoint failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BridgeError::Upstream {
                url: self.endpoint_url.to_string(),
                status: status.as_u16(),
                hint: UPSTREAM_HINT.to_string(),
            });
        }
        // 2xx only acknowledges receipt; the response frame arrives over the
        // event stream.
        Ok(())
    }

    async fn recv(&self) -> Option<Message> {
        self.inbound.lock().await.recv().await
    }

    async fn close(&self) {
        if let Some(task) = self.listener.lock().await.take() {
            task.abort();
        }
        tracing::debug!(server = %self.server, "SSE transport closed");
    }
}

// ============================================================================
// Outbound streamable HTTP
// ============================================================================

/// Client side of the streamable HTTP transport: every frame goes out as a
/// POST to a single URL; responses come back as JSON bodies or as an SSE body
/// attached to the POST. A server-issued `Mcp-Session-Id` is threaded on every
/// POST in stateful mode.
pub struct HttpTransport {
    server: String,
    client: reqwest::Client,
    url: reqwest::Url,
    headers: HeaderMap,
    stateless: bool,
    session_id: parking_lot::Mutex<Option<String>>,
    inbound_tx: mpsc::Sender<Message>,
    inbound: Mutex<mpsc::Receiver<Message>>,
    readers: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl HttpTransport {
    pub fn new(server: &str, url: &str, headers: HeaderMap, stateless: bool) -> Result<Self> {
        let url = reqwest::Url::parse(url)
            .map_err(|e| BridgeError::Config(format!("invalid HTTP URL '{url}': {e}")))?;
        let (inbound_tx, inbound_rx) = mpsc::channel::<Message>(64);
        Ok(Self {
            server: server.to_string(),
            client: reqwest::Client::new(),
            url,
            headers,
            stateless,
            session_id: parking_lot::Mutex::new(None),
            inbound_tx,
            inbound: Mutex::new(inbound_rx),
            readers: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Forget the server-issued session id. The retry path calls this before
    /// re-running `initialize`.
    pub fn clear_session(&self) {
        *self.session_id.lock() = None;
    }

    fn spawn_sse_body_reader(&self, response: reqwest::Response) {
        use eventsource_stream::Eventsource;

        let name = self.server.clone();
        let inbound_tx = self.inbound_tx.clone();
        let task = tokio::spawn(async move {
            let mut stream = response.bytes_stream().eventsource();
            while let Some(event) = stream.next().await {
                match event {
                    Ok(ev) => {
                        if ev.data.trim().is_empty() {
                            continue;
                        }
                        if let Some(msg) = parse_frame(&name, &ev.data)
                            && inbound_tx.send(msg).await.is_err()
                        {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(server = %name, error = %err, "SSE response body error");
                        break;
                    }
                }
            }
        });
        self.readers.lock().push(task);
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, msg: Message) -> Result<()> {
        let session = self.session_id.lock().clone();
        let had_session = session.is_some();

        let mut request = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .header(
                reqwest::header::ACCEPT,
                "application/json, text/event-stream",
            )
            .json(&msg.to_value());
        if let Some(session) = &session {
            request = request.header(MCP_SESSION_ID_HEADER, session);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BridgeError::Transport(format!("POST to {} failed: {e}", self.url)))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND && had_session {
            // Common after upstream idle recycles: the session is gone and a
            // fresh initialize is required.
            return Err(BridgeError::SessionTerminated {
                url: self.url.to_string(),
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(BridgeError::Upstream {
                url: self.url.to_string(),
                status: status.as_u16(),
                hint: UPSTREAM_HINT.to_string(),
            });
        }

        if !self.stateless
            && let Some(session) = response
                .headers()
                .get(MCP_SESSION_ID_HEADER)
                .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock() = Some(session.to_string());
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if status == reqwest::StatusCode::ACCEPTED {
            return Ok(());
        }

        if content_type.starts_with("text/event-stream") {
            self.spawn_sse_body_reader(response);
            return Ok(());
        }

        let body = response
            .text()
            .await
            .map_err(|e| BridgeError::Transport(format!("reading response body: {e}")))?;
        if body.trim().is_empty() {
            return Ok(());
        }
        if let Some(reply) = parse_frame(&self.server, &body) {
            let _ = self.inbound_tx.send(reply).await;
        }
        Ok(())
    }

    async fn recv(&self) -> Option<Message> {
        self.inbound.lock().await.recv().await
    }

    async fn close(&self) {
        for task in self.readers.lock().drain(..) {
            task.abort();
        }
        tracing::debug!(server = %self.server, "HTTP transport closed");
    }
}

// ============================================================================
// In-memory duplex (test support)
// ============================================================================

#[cfg(test)]
pub mod duplex {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// One side of an in-memory transport pair.
    pub struct DuplexTransport {
        tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<Message>>>,
        rx: Mutex<mpsc::UnboundedReceiver<Message>>,
        closed: AtomicBool,
    }

    pub fn pair() -> (DuplexTransport, DuplexTransport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            DuplexTransport {
                tx: parking_lot::Mutex::new(Some(a_tx)),
                rx: Mutex::new(b_rx),
                closed: AtomicBool::new(false),
            },
            DuplexTransport {
                tx: parking_lot::Mutex::new(Some(b_tx)),
                rx: Mutex::new(a_rx),
                closed: AtomicBool::new(false),
            },
        )
    }

    #[async_trait]
    impl Transport for DuplexTransport {
        async fn send(&self, msg: Message) -> Result<()> {
            let guard = self.tx.lock();
            let tx = guard
                .as_ref()
                .ok_or(BridgeError::Closed)?;
            tx.send(msg).map_err(|_| BridgeError::Closed)
        }

        async fn recv(&self) -> Option<Message> {
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.rx.lock().await.recv().await
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::Release);
            self.tx.lock().take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_headers_hides_sensitive_values() {
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), "Bearer abc".to_string());
        headers.insert("X-Api-Key".to_string(), "k".to_string());
        headers.insert("My-Token-Header".to_string(), "t".to_string());
        headers.insert("Content-Type".to_string(), "application/json".to_string());

        let masked: HashMap<_, _> = masked_headers(&headers).into_iter().collect();
        assert_eq!(masked["Authorization"], "***");
        assert_eq!(masked["X-Api-Key"], "***");
        assert_eq!(masked["My-Token-Header"], "***");
        assert_eq!(masked["Content-Type"], "application/json");
    }

    #[test]
    fn header_map_rejects_bad_names() {
        let mut headers = HashMap::new();
        headers.insert("bad header\n".to_string(), "v".to_string());
        assert!(header_map(&headers).is_err());
    }

    #[tokio::test]
    async fn duplex_pair_round_trips() {
        let (a, b) = duplex::pair();
        a.send(Message::request(1, "ping", None)).await.unwrap();
        let got = b.recv().await.unwrap();
        assert_eq!(got.method(), Some("ping"));

        b.close().await;
        assert!(matches!(
            b.send(Message::request(2, "ping", None)).await,
            Err(BridgeError::Closed)
        ));
        assert!(b.recv().await.is_none());
    }

    #[tokio::test]
    async fn stdio_transport_talks_to_child() {
        // `cat` echoes each line back, which is enough to exercise framing.
        let transport = StdioTransport::spawn(
            "echo-test",
            "cat",
            &[],
            &HashMap::new(),
            None,
        )
        .unwrap();

        let msg = Message::request(1, "ping", None);
        transport.send(msg.clone()).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), transport.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, msg);

        transport.close().await;
    }

    #[tokio::test]
    async fn stdio_transport_eof_on_child_exit() {
        let transport = StdioTransport::spawn(
            "true-test",
            "true",
            &[],
            &HashMap::new(),
            None,
        )
        .unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), transport.recv())
            .await
            .unwrap();
        assert!(got.is_none());
        transport.close().await;
    }
}
