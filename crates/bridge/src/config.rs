//! Configuration parsing and validation.
//!
//! Three sources feed the bridge: CLI arguments, the named-server JSON file
//! (`mcpServers` only), and the bridge JSON file (`mcpServers` + `bridge`).
//! `${VAR}` / `${VAR:default}` references are expanded through every string of
//! a config file before deserialization.

use crate::error::{BridgeError, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 1000;
const DEFAULT_PRIORITY: i64 = 100;
const DEFAULT_HEALTH_INTERVAL_MS: u64 = 30_000;
const DEFAULT_HEALTH_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_FAILURES: u32 = 3;
const DEFAULT_RECOVERY_INTERVAL_MS: u64 = 60_000;

// ============================================================================
// CLI
// ============================================================================

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientTransport {
    #[value(name = "sse")]
    Sse,
    #[value(name = "streamablehttp")]
    StreamableHttp,
}

/// CLI arguments for the proxy/bridge.
#[derive(Parser, Debug, Clone)]
#[command(name = "mcp-switchboard")]
#[command(
    version,
    about = "Transport-switching proxy and aggregating bridge for MCP servers",
    after_help = "Examples:\n  \
        mcp-switchboard http://localhost:8080/sse\n  \
        mcp-switchboard --transport streamablehttp http://localhost:8080/mcp\n  \
        mcp-switchboard --port 8080 -- your-command --arg1 value1\n  \
        mcp-switchboard --named-server fetch 'uvx mcp-server-fetch' --port 8080\n  \
        mcp-switchboard --bridge-config bridge.json --port 8080"
)]
pub struct CliArgs {
    /// Command or URL to connect to. A URL starts client mode over
    /// SSE/streamable HTTP; anything else is the default stdio server command.
    #[arg(env = "SSE_URL")]
    pub command_or_url: Option<String>,

    /// Extra arguments for the default stdio server command.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Headers for the remote server (client mode). Repeatable.
    #[arg(short = 'H', long = "headers", num_args = 2, value_names = ["KEY", "VALUE"], action = clap::ArgAction::Append)]
    pub headers: Vec<String>,

    /// Transport for client mode.
    #[arg(long, value_enum, default_value = "sse")]
    pub transport: ClientTransport,

    /// Environment variables for the default stdio server. Repeatable.
    #[arg(short = 'e', long = "env", num_args = 2, value_names = ["KEY", "VALUE"], action = clap::ArgAction::Append)]
    pub env: Vec<String>,

    /// Working directory for the default stdio server.
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Pass through the proxy's environment to all spawned servers.
    #[arg(long)]
    pub pass_environment: bool,

    /// Enable debug logging.
    #[arg(long)]
    pub debug: bool,

    /// Define a named stdio server: NAME and a single command string.
    /// Repeatable; NAME becomes the URL path /servers/NAME/.
    #[arg(long = "named-server", num_args = 2, value_names = ["NAME", "COMMAND_STRING"], action = clap::ArgAction::Append)]
    pub named_server: Vec<String>,

    /// JSON config file for named stdio servers (mcpServers format).
    /// Takes precedence over --named-server arguments.
    #[arg(long = "named-server-config")]
    pub named_server_config: Option<PathBuf>,

    /// Bridge config file (mcpServers + bridge). Starts the aggregating
    /// bridge; other server options are ignored.
    #[arg(long = "bridge-config")]
    pub bridge_config: Option<PathBuf>,

    /// Port to listen on.
    #[arg(long)]
    pub port: Option<u16>,

    /// Host to listen on.
    #[arg(long)]
    pub host: Option<String>,

    /// Stateless mode for inbound streamable HTTP.
    #[arg(long)]
    pub stateless: bool,

    /// (deprecated) Same as --port.
    #[arg(long = "sse-port", hide = true)]
    pub sse_port: Option<u16>,

    /// (deprecated) Same as --host.
    #[arg(long = "sse-host", hide = true)]
    pub sse_host: Option<String>,

    /// Allowed CORS origin. Repeatable; default is no CORS.
    #[arg(long = "allow-origin", action = clap::ArgAction::Append)]
    pub allow_origin: Vec<String>,

    /// Retry a remote request once after re-initializing the session.
    #[arg(long = "retry-remote")]
    pub retry_remote: bool,

    /// Remote retry budget. 0 disables retries; --retry-remote implies 1.
    #[arg(long = "remote-retries")]
    pub remote_retries: Option<u32>,
}

impl CliArgs {
    pub fn port(&self) -> u16 {
        self.port.or(self.sse_port).unwrap_or(DEFAULT_PORT)
    }

    pub fn host(&self) -> String {
        self.host
            .clone()
            .or_else(|| self.sse_host.clone())
            .unwrap_or_else(|| DEFAULT_HOST.to_string())
    }

    pub fn remote_retries(&self) -> u32 {
        match self.remote_retries {
            Some(n) => n,
            None if self.retry_remote => 1,
            None => 0,
        }
    }

    pub fn header_pairs(&self) -> HashMap<String, String> {
        pairs(&self.headers)
    }

    pub fn env_pairs(&self) -> HashMap<String, String> {
        pairs(&self.env)
    }

    pub fn named_server_pairs(&self) -> Vec<(String, String)> {
        self.named_server
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect()
    }
}

fn pairs(flat: &[String]) -> HashMap<String, String> {
    flat.chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect()
}

/// Base environment inherited by every spawned server process.
pub fn base_environment(pass_environment: bool) -> HashMap<String, String> {
    if pass_environment {
        std::env::vars().collect()
    } else {
        HashMap::new()
    }
}

/// Split a command string into command + args, honoring quotes the way a
/// shell would for simple cases.
pub fn split_command(input: &str) -> Result<Vec<String>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = input.chars();
    let mut in_quote: Option<char> = None;
    let mut has_token = false;

    while let Some(c) = chars.next() {
        match in_quote {
            Some(q) => {
                if c == q {
                    in_quote = None;
                } else {
                    current.push(c);
                }
            }
            None => match c {
                '\'' | '"' => {
                    in_quote = Some(c);
                    has_token = true;
                }
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                        has_token = true;
                    }
                }
                c if c.is_whitespace() => {
                    if has_token {
                        parts.push(std::mem::take(&mut current));
                        has_token = false;
                    }
                }
                c => {
                    current.push(c);
                    has_token = true;
                }
            },
        }
    }
    if in_quote.is_some() {
        return Err(BridgeError::Config(format!(
            "unterminated quote in command string: {input}"
        )));
    }
    if has_token {
        parts.push(current);
    }
    Ok(parts)
}

// ============================================================================
// Server descriptor
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    #[default]
    Stdio,
    Sse,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Milliseconds between probes.
    #[serde(default = "default_health_interval")]
    pub interval: u64,
    /// Milliseconds per probe.
    #[serde(default = "default_health_timeout")]
    pub timeout: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: DEFAULT_HEALTH_INTERVAL_MS,
            timeout: DEFAULT_HEALTH_TIMEOUT_MS,
        }
    }
}

/// One backend server, as configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Seconds; covers the handshake and individual requests.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub transport_type: TransportType,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Milliseconds; doubled per attempt.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub tool_namespace: Option<String>,
    #[serde(default)]
    pub resource_namespace: Option<String>,
    #[serde(default)]
    pub prompt_namespace: Option<String>,
    /// Lower wins in priority conflict resolution.
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Working directory for the spawned process (default server only).
    #[serde(skip)]
    pub cwd: Option<PathBuf>,
}

impl ServerConfig {
    pub fn stdio(command: String, args: Vec<String>, env: HashMap<String, String>) -> Self {
        Self {
            enabled: true,
            command,
            args,
            env,
            timeout: DEFAULT_TIMEOUT_SECS,
            transport_type: TransportType::Stdio,
            url: None,
            headers: HashMap::new(),
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY_MS,
            health_check: HealthCheckConfig::default(),
            tool_namespace: None,
            resource_namespace: None,
            prompt_namespace: None,
            priority: DEFAULT_PRIORITY,
            tags: Vec::new(),
            cwd: None,
        }
    }

    pub fn remote(
        url: String,
        transport_type: TransportType,
        headers: HashMap<String, String>,
    ) -> Self {
        let mut config = Self::stdio(String::new(), Vec::new(), HashMap::new());
        config.transport_type = transport_type;
        config.url = Some(url);
        config.headers = headers;
        config
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout.max(1))
    }

    pub fn retry_delay_duration(&self) -> Duration {
        Duration::from_millis(self.retry_delay)
    }
}

fn default_true() -> bool {
    true
}
fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}
fn default_retry_attempts() -> u32 {
    DEFAULT_RETRY_ATTEMPTS
}
fn default_retry_delay() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}
fn default_priority() -> i64 {
    DEFAULT_PRIORITY
}
fn default_health_interval() -> u64 {
    DEFAULT_HEALTH_INTERVAL_MS
}
fn default_health_timeout() -> u64 {
    DEFAULT_HEALTH_TIMEOUT_MS
}

// ============================================================================
// Bridge settings
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictResolution {
    #[default]
    Namespace,
    Priority,
    First,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationConfig {
    #[serde(default = "default_true")]
    pub tools: bool,
    #[serde(default = "default_true")]
    pub resources: bool,
    #[serde(default = "default_true")]
    pub prompts: bool,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            tools: true,
            resources: true,
            prompts: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    /// Milliseconds before a FAILED backend is retried.
    #[serde(default = "default_recovery_interval")]
    pub recovery_interval: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_failures: DEFAULT_MAX_FAILURES,
            recovery_interval: DEFAULT_RECOVERY_INTERVAL_MS,
        }
    }
}

fn default_max_failures() -> u32 {
    DEFAULT_MAX_FAILURES
}
fn default_recovery_interval() -> u64 {
    DEFAULT_RECOVERY_INTERVAL_MS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeSettings {
    #[serde(default)]
    pub conflict_resolution: ConflictResolution,
    #[serde(default = "default_true")]
    pub default_namespace: bool,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub failover: FailoverConfig,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            conflict_resolution: ConflictResolution::default(),
            default_namespace: true,
            aggregation: AggregationConfig::default(),
            failover: FailoverConfig::default(),
        }
    }
}

/// The full bridge configuration: all servers plus bridge behavior.
///
/// Server order follows the config file; the `first` conflict policy depends
/// on it.
#[derive(Debug, Clone)]
pub struct BridgeConfiguration {
    pub servers: Vec<(String, ServerConfig)>,
    pub bridge: BridgeSettings,
}

// ============================================================================
// File loaders
// ============================================================================

fn read_config_root(path: &Path) -> Result<serde_json::Map<String, Value>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| BridgeError::Config(format!("failed to read {}: {e}", path.display())))?;
    let mut root: Value = serde_json::from_str(&text)
        .map_err(|e| BridgeError::Config(format!("failed to parse {}: {e}", path.display())))?;
    switchboard_env::expand_value(&mut root);

    let Value::Object(root) = root else {
        return Err(BridgeError::Config(format!(
            "invalid config file {}: top level must be an object",
            path.display()
        )));
    };
    if !root.get("mcpServers").is_some_and(Value::is_object) {
        return Err(BridgeError::Config(format!(
            "invalid config file {}: missing 'mcpServers' object",
            path.display()
        )));
    }
    Ok(root)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NamedServerEntry {
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
}

/// Load the named-server config file (`mcpServers` only).
///
/// Disabled or malformed single entries are logged and skipped; a malformed
/// top-level file is a configuration error.
pub fn load_named_server_file(
    path: &Path,
    base_env: &HashMap<String, String>,
) -> Result<Vec<(String, ServerConfig)>> {
    tracing::info!(path = %path.display(), "loading named server configurations");
    let root = read_config_root(path)?;
    let servers = root["mcpServers"].as_object().cloned().unwrap_or_default();

    let mut out = Vec::new();
    for (name, entry) in servers {
        let entry: NamedServerEntry = match serde_json::from_value(entry) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(server = %name, error = %e, "skipping invalid server entry");
                continue;
            }
        };
        if !entry.enabled {
            tracing::info!(server = %name, "server disabled, skipping");
            continue;
        }
        if entry.command.is_empty() {
            tracing::warn!(server = %name, "server is missing 'command', skipping");
            continue;
        }

        let mut env = base_env.clone();
        env.extend(entry.env);
        tracing::info!(
            server = %name,
            command = %entry.command,
            args = ?entry.args,
            "configured named server"
        );
        out.push((name, ServerConfig::stdio(entry.command, entry.args, env)));
    }
    Ok(out)
}

/// Load the bridge config file (`mcpServers` + `bridge`).
pub fn load_bridge_config_file(
    path: &Path,
    base_env: &HashMap<String, String>,
) -> Result<BridgeConfiguration> {
    tracing::info!(path = %path.display(), "loading bridge configuration");
    let root = read_config_root(path)?;
    let servers_obj = root["mcpServers"].as_object().cloned().unwrap_or_default();

    let mut servers = Vec::new();
    for (name, entry) in servers_obj {
        let mut config: ServerConfig = match serde_json::from_value(entry) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(server = %name, error = %e, "skipping invalid server entry");
                continue;
            }
        };
        for warning in validate_server(&name, &config) {
            tracing::warn!("{warning}");
        }
        if config.transport_type == TransportType::Stdio && config.command.is_empty() {
            tracing::warn!(server = %name, "server is missing 'command', skipping");
            continue;
        }
        if config.transport_type != TransportType::Stdio && config.url.is_none() {
            tracing::warn!(server = %name, "remote server is missing 'url', skipping");
            continue;
        }

        let mut env = base_env.clone();
        env.extend(std::mem::take(&mut config.env));
        config.env = env;

        tracing::info!(
            server = %name,
            command = %config.command,
            transport = ?config.transport_type,
            "configured bridge server"
        );
        servers.push((name, config));
    }

    let bridge: BridgeSettings = match root.get("bridge") {
        Some(section) => serde_json::from_value(section.clone())
            .map_err(|e| BridgeError::Config(format!("invalid 'bridge' section: {e}")))?,
        None => BridgeSettings::default(),
    };

    Ok(BridgeConfiguration { servers, bridge })
}

fn validate_server(name: &str, config: &ServerConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    if config.timeout == 0 {
        warnings.push(format!("server '{name}' has timeout 0; treating as 1s"));
    }
    for (field, ns) in [
        ("toolNamespace", &config.tool_namespace),
        ("resourceNamespace", &config.resource_namespace),
        ("promptNamespace", &config.prompt_namespace),
    ] {
        if ns.as_deref().is_some_and(|s| s.trim().is_empty()) {
            warnings.push(format!("server '{name}' has empty '{field}' value"));
        }
    }
    if config.priority < 0 {
        warnings.push(format!("server '{name}' has negative priority"));
    }
    if config.health_check.interval < 1000 || config.health_check.timeout < 1000 {
        warnings.push(format!(
            "server '{name}' healthCheck interval/timeout below 1000ms"
        ));
    }
    warnings
}
