//! Client-mode frontend: a local stdio MCP server tunnelling to one remote.
//!
//! Frames arrive as lines on stdin and leave as lines on stdout. Requests
//! are handled in their own tasks so a cancellation on stdin can reach an
//! in-flight request; stdout writes go through a single writer task.

use crate::error::Result;
use crate::proxy::{ProxyCore, ProxySession};
use crate::rpc::Message;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

pub async fn run(core: Arc<ProxyCore>) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<Message>(64);
    let session = ProxySession::new(core.clone(), tx.clone(), "stdio".to_string());
    core.register_reverse(session.clone());

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(msg) = rx.recv().await {
            let mut line = msg.to_json();
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        match Message::from_str(&line) {
            Ok(msg) => {
                let session = session.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Some(reply) = session.process(msg).await {
                        let _ = tx.send(reply).await;
                    }
                });
            }
            Err(err) => {
                tracing::warn!(error = %err, "dropping malformed frame from stdin");
            }
        }
    }

    tracing::debug!("stdin closed, shutting down client proxy");
    session.close().await;
    drop(tx);
    let _ = writer.await;
    Ok(())
}
