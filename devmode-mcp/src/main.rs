// Dev-mode MCP Server - Liberty dev mode and debugger attach via Model Context Protocol
//
// Runs dev-mode sessions per project and keeps a debugger attached to them

use anyhow::{Context, Result};
use devmode_core::DevModeConfig;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

mod handlers;
mod protocol;
mod session;
mod tools;

use handlers::RequestHandler;
use protocol::*;

#[tokio::main]
async fn main() -> Result<()> {
    // Tracing to stderr only - stdout is reserved for JSON-RPC protocol
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("devmode_mcp=info".parse()?)
                .add_directive("devmode_core=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Starting dev-mode MCP server...");

    let config = DevModeConfig::load().context("failed to load configuration")?;
    debug!("Configuration: {:?}", config);
    let handler = Arc::new(RequestHandler::new(config));

    // Requests run concurrently; one task owns stdout so responses never interleave
    let (response_tx, mut response_rx) = mpsc::channel::<JsonRpcResponse>(32);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(response) = response_rx.recv().await {
            if let Err(e) = send(&mut stdout, &response).await {
                error!("Write error: {}", e);
                break;
            }
        }
    });

    let stdin = tokio::io::stdin();
    let mut reader = BufReader::new(stdin);

    info!("Dev-mode MCP server ready, waiting for requests...");

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                info!("Client disconnected");
                break;
            }
            Ok(_) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                debug!("Received: {}", line);

                match serde_json::from_str::<Value>(line) {
                    // Requests carry an id, notifications don't
                    Ok(value) if value.get("id").is_some() => {
                        match serde_json::from_value::<JsonRpcRequest>(value) {
                            Ok(request) => {
                                handler.track(&request.id);
                                let handler = Arc::clone(&handler);
                                let response_tx = response_tx.clone();
                                tokio::spawn(async move {
                                    let response = handler.handle_request(request).await;
                                    response_tx.send(response).await.ok();
                                });
                            }
                            Err(e) => {
                                error!("Invalid request: {}", e);
                                let response = JsonRpcResponse::failure(
                                    Value::Null,
                                    JsonRpcError::new(INVALID_REQUEST, "Invalid request"),
                                );
                                response_tx.send(response).await.ok();
                            }
                        }
                    }
                    Ok(value) => match serde_json::from_value::<JsonRpcNotification>(value) {
                        Ok(notification) => handler.handle_notification(notification).await,
                        Err(e) => error!("Invalid notification: {}", e),
                    },
                    Err(e) => {
                        error!("Parse error: {}", e);
                        let response = JsonRpcResponse::failure(
                            Value::Null,
                            JsonRpcError::new(PARSE_ERROR, "Parse error"),
                        );
                        response_tx.send(response).await.ok();
                    }
                }
            }
            Err(e) => {
                error!("Read error: {}", e);
                break;
            }
        }
    }

    // Nobody is left to wait on long-running calls; let them answer and drain
    handler.cancel_all();
    drop(response_tx);
    writer.await.ok();

    info!("Dev-mode MCP server shutting down");
    Ok(())
}

async fn send<W, T>(out: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let text = serde_json::to_string(message)?;
    debug!("Sending: {}", text);
    out.write_all(text.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await?;
    Ok(())
}
