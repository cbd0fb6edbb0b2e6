//! mcp-switchboard
//!
//! Transport-switching proxy and aggregating bridge for MCP servers. Runs in
//! one of three modes: client mode (stdio frontend tunnelling to a remote
//! URL), named-server mode (stdio children exposed over HTTP), or bridge
//! mode (aggregated union over the servers of a bridge config file).

mod aggregator;
mod config;
mod error;
mod http;
mod proxy;
mod rpc;
mod session;
mod stdio_front;
mod supervisor;
mod transport;

use crate::aggregator::Aggregator;
use crate::config::{
    CliArgs, ClientTransport, ServerConfig, TransportType, base_environment,
    load_bridge_config_file, load_named_server_file, split_command,
};
use crate::error::{BridgeError, Result};
use crate::http::{AppState, bind_with_increment};
use crate::proxy::{ProxyCore, spawn_event_loop};
use crate::supervisor::{BackendEvent, BackendSet, BackendSettings};
use clap::Parser;
use std::collections::HashMap;
use std::io::IsTerminal as _;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

const DEFAULT_SERVER_NAME: &str = "default";

fn main() -> ExitCode {
    let cli = CliArgs::parse();
    init_logging(cli.debug);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "exiting");
            match err {
                BridgeError::Config(_) => ExitCode::from(1),
                _ => ExitCode::from(2),
            }
        }
    }
}

/// Logs go to stderr so client mode can own stdout for protocol frames.
fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|spec| EnvFilter::try_new(spec).ok())
        .unwrap_or_else(|| EnvFilter::new(default_level));

    if std::io::stderr().is_terminal() {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .json(),
            )
            .init();
    }
}

#[tokio::main]
async fn run(cli: CliArgs) -> Result<()> {
    if let Some(path) = cli.bridge_config.clone() {
        return run_bridge_mode(&cli, &path).await;
    }

    let is_url = cli
        .command_or_url
        .as_deref()
        .is_some_and(|v| v.starts_with("http://") || v.starts_with("https://"));
    if is_url {
        return run_client_mode(&cli).await;
    }

    run_named_server_mode(&cli).await
}

// ============================================================================
// Client mode
// ============================================================================

async fn run_client_mode(cli: &CliArgs) -> Result<()> {
    let url = cli
        .command_or_url
        .clone()
        .expect("client mode requires a URL");
    if !cli.named_server_pairs().is_empty() {
        tracing::warn!("--named-server arguments are ignored in client mode");
    }

    let mut headers = cli.header_pairs();
    if let Ok(token) = std::env::var("API_ACCESS_TOKEN")
        && !token.is_empty()
    {
        headers.insert("Authorization".to_string(), format!("Bearer {token}"));
    }
    let transport_type = match cli.transport {
        ClientTransport::Sse => TransportType::Sse,
        ClientTransport::StreamableHttp => TransportType::Http,
    };
    tracing::info!(url = %url, transport = ?transport_type, "starting client proxy");

    let (event_tx, event_rx) = mpsc::unbounded_channel::<BackendEvent>();
    let settings = BackendSettings {
        remote_retries: cli.remote_retries(),
        ..BackendSettings::default()
    };
    let backends = BackendSet::new(
        vec![(
            "remote".to_string(),
            ServerConfig::remote(url, transport_type, headers),
        )],
        settings,
        event_tx,
    );
    let backend = backends
        .get("remote")
        .expect("remote backend registered")
        .clone();
    backend.connect().await?;

    let ct = CancellationToken::new();
    backend.spawn_health_loop(ct.clone());

    let core = ProxyCore::direct(backend);
    let direct_cores = HashMap::from([("remote".to_string(), core.clone())]);
    spawn_event_loop(backends.clone(), None, None, direct_cores, event_rx);

    let result = stdio_front::run(core).await;
    ct.cancel();
    backends.shutdown_all().await;
    result
}

// ============================================================================
// Named-server mode
// ============================================================================

async fn run_named_server_mode(cli: &CliArgs) -> Result<()> {
    let base_env = base_environment(cli.pass_environment);
    let mut servers: Vec<(String, ServerConfig)> = Vec::new();

    if let Some(command) = cli.command_or_url.clone().filter(|c| !c.is_empty()) {
        let mut env = base_env.clone();
        env.extend(cli.env_pairs());
        let mut config = ServerConfig::stdio(command.clone(), cli.args.clone(), env);
        config.cwd = cli.cwd.clone();
        tracing::info!(command = %command, args = ?cli.args, "configured default server");
        servers.push((DEFAULT_SERVER_NAME.to_string(), config));
    }

    if let Some(path) = &cli.named_server_config {
        if !cli.named_server_pairs().is_empty() {
            tracing::warn!(
                "--named-server arguments are ignored when --named-server-config is provided"
            );
        }
        servers.extend(load_named_server_file(path, &base_env)?);
    } else {
        for (name, command_string) in cli.named_server_pairs() {
            let parts = split_command(&command_string)?;
            let Some((command, args)) = parts.split_first() else {
                tracing::warn!(server = %name, "empty command string, skipping");
                continue;
            };
            tracing::info!(server = %name, command = %command_string, "configured named server");
            servers.push((
                name,
                ServerConfig::stdio(command.clone(), args.to_vec(), base_env.clone()),
            ));
        }
    }

    if servers.is_empty() {
        return Err(BridgeError::Config(
            "no servers configured: provide a command, --named-server, \
             --named-server-config, or --bridge-config"
                .to_string(),
        ));
    }

    let (event_tx, event_rx) = mpsc::unbounded_channel::<BackendEvent>();
    let backends = BackendSet::new(servers, BackendSettings::default(), event_tx);
    let ct = CancellationToken::new();
    backends.start_all(&ct).await;

    let mut cores: HashMap<String, Arc<ProxyCore>> = HashMap::new();
    for backend in backends.iter() {
        cores.insert(backend.name().to_string(), ProxyCore::direct(backend.clone()));
    }
    let root = cores.get(DEFAULT_SERVER_NAME).cloned();
    let named: HashMap<_, _> = cores
        .iter()
        .filter(|(name, _)| name.as_str() != DEFAULT_SERVER_NAME)
        .map(|(name, core)| (name.clone(), core.clone()))
        .collect();

    spawn_event_loop(backends.clone(), None, None, cores, event_rx);
    serve_http(cli, root, named, backends, ct).await
}

// ============================================================================
// Bridge mode
// ============================================================================

async fn run_bridge_mode(cli: &CliArgs, path: &std::path::Path) -> Result<()> {
    let base_env = base_environment(cli.pass_environment);
    let bridge_config = load_bridge_config_file(path, &base_env)?;
    if bridge_config.servers.is_empty() {
        return Err(BridgeError::Config(format!(
            "no runnable servers in {}",
            path.display()
        )));
    }
    tracing::info!(
        servers = bridge_config.servers.len(),
        "starting in bridge mode"
    );

    let (event_tx, event_rx) = mpsc::unbounded_channel::<BackendEvent>();
    let settings = BackendSettings {
        remote_retries: cli.remote_retries(),
        failover: bridge_config.bridge.failover.clone(),
    };
    let backends = BackendSet::new(bridge_config.servers, settings, event_tx);
    let ct = CancellationToken::new();
    backends.start_all(&ct).await;

    let aggregator = Arc::new(Aggregator::new(bridge_config.bridge));
    aggregator.rebuild(&backends);
    let aggregate_core = ProxyCore::aggregate(aggregator.clone(), backends.clone());

    let mut named: HashMap<String, Arc<ProxyCore>> = HashMap::new();
    for backend in backends.iter() {
        named.insert(backend.name().to_string(), ProxyCore::direct(backend.clone()));
    }

    spawn_event_loop(
        backends.clone(),
        Some(aggregator),
        Some(aggregate_core.clone()),
        named.clone(),
        event_rx,
    );
    serve_http(cli, Some(aggregate_core), named, backends, ct).await
}

// ============================================================================
// HTTP serving
// ============================================================================

async fn serve_http(
    cli: &CliArgs,
    root: Option<Arc<ProxyCore>>,
    named: HashMap<String, Arc<ProxyCore>>,
    backends: Arc<BackendSet>,
    ct: CancellationToken,
) -> Result<()> {
    let api_key = std::env::var("API_ACCESS_TOKEN")
        .ok()
        .filter(|t| !t.is_empty());
    let state = AppState::new(
        root.clone(),
        named.clone(),
        backends.clone(),
        cli.stateless,
        cli.allow_origin.clone(),
        api_key,
    );
    let app = http::router(state);

    let host = cli.host();
    let (listener, port) = bind_with_increment(&host, cli.port()).await?;

    let base = format!("http://{host}:{port}");
    tracing::info!("serving MCP servers:");
    if root.is_some() {
        tracing::info!("  - {base}/sse");
        tracing::info!("  - {base}/mcp");
    }
    let mut names: Vec<_> = named.keys().collect();
    names.sort();
    for name in names {
        tracing::info!("  - {base}/servers/{name}/sse");
    }
    tracing::info!("  - {base}/status");

    let shutdown_ct = ct.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_ct.cancel();
    });

    let serve_ct = ct.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { serve_ct.cancelled().await })
        .await
        .map_err(|e| BridgeError::Transport(format!("http server failed: {e}")))?;

    // Shutdown cascades: the listener has stopped accepting, frontends are
    // gone, now bring the children down.
    backends.shutdown_all().await;
    tracing::info!("shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        () = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
