//! Error taxonomy for the bridge runtime.

use crate::rpc::{self, RpcError};
use serde_json::json;

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors produced by the bridge core.
///
/// `Rpc` carries a backend JSON-RPC error verbatim so the proxy can relay it
/// unchanged. The other variants are synthesized at the proxy boundary via
/// [`BridgeError::to_rpc_error`].
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("startup error: {0}")]
    Startup(String),

    /// A JSON-RPC error returned by a backend, relayed as-is.
    #[error("backend error {}: {}", .0.code, .0.message)]
    Rpc(RpcError),

    #[error("request to '{server}' timed out after {ms}ms")]
    Timeout { server: String, ms: u64 },

    #[error("backend '{server}' unavailable: {reason}")]
    Unavailable { server: String, reason: String },

    /// The upstream signalled end-of-session (streamable HTTP).
    #[error("session terminated by {url} (HTTP {status})")]
    SessionTerminated { url: String, status: u16 },

    /// An upstream HTTP failure; the hint points at likely causes.
    #[error("upstream {url} returned HTTP {status} ({hint})")]
    Upstream {
        url: String,
        status: u16,
        hint: String,
    },

    #[error("transport error: {0}")]
    Transport(String),

    /// The session closed while a request was in flight.
    #[error("session closed")]
    Closed,

    /// The request waiter was cancelled by the caller.
    #[error("request cancelled")]
    Cancelled,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl BridgeError {
    /// Whether the client-mode single-retry policy applies: connection resets,
    /// idle-recycle 404s and session termination all take the re-init path.
    pub fn is_retryable(&self) -> bool {
        match self {
            BridgeError::SessionTerminated { .. } | BridgeError::Transport(_) => true,
            BridgeError::Upstream { status, .. } => {
                (400..500).contains(status) || *status == 503
            }
            BridgeError::Closed => true,
            _ => false,
        }
    }

    /// Render this error as the JSON-RPC error the frontend should see.
    ///
    /// Backend errors pass through verbatim; synthetic errors carry
    /// `data.server` and, for transport failures, the upstream URL and status.
    pub fn to_rpc_error(&self, server: &str) -> RpcError {
        match self {
            BridgeError::Rpc(err) => err.clone(),
            BridgeError::Timeout { server, ms } => RpcError {
                code: rpc::SERVER_ERROR,
                message: format!("request timed out after {ms}ms"),
                data: Some(json!({ "timeout": true, "server": server })),
            },
            BridgeError::Unavailable { server, reason } => RpcError {
                code: rpc::SERVER_ERROR,
                message: "backend unavailable".to_string(),
                data: Some(json!({
                    "unavailable": true,
                    "server": server,
                    "reason": reason,
                })),
            },
            BridgeError::SessionTerminated { url, status } => RpcError {
                code: rpc::SERVER_ERROR,
                message: "backend unavailable".to_string(),
                data: Some(json!({
                    "unavailable": true,
                    "server": server,
                    "upstream_status": status,
                    "url": url,
                })),
            },
            BridgeError::Upstream { url, status, hint } => RpcError {
                code: rpc::SERVER_ERROR,
                message: format!("backend unavailable: {hint}"),
                data: Some(json!({
                    "unavailable": true,
                    "server": server,
                    "upstream_status": status,
                    "url": url,
                })),
            },
            BridgeError::Closed | BridgeError::Transport(_) => RpcError {
                code: rpc::SERVER_ERROR,
                message: "backend unavailable".to_string(),
                data: Some(json!({
                    "unavailable": true,
                    "server": server,
                    "reason": self.to_string(),
                })),
            },
            BridgeError::Protocol(msg) => RpcError {
                code: rpc::INVALID_REQUEST,
                message: msg.clone(),
                data: None,
            },
            other => RpcError {
                code: rpc::INTERNAL_ERROR,
                message: other.to_string(),
                data: Some(json!({ "server": server })),
            },
        }
    }
}
