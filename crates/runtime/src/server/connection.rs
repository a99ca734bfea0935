//! Unix domain socket connection handling and command dispatch.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{oneshot, watch};
use tracing::info;

use crate::engine::{CycleOutcome, EngineRequest};
use crate::{ClientCommand, ServerEvent};

use super::ServerContext;

pub(super) async fn handle_connection(
    stream: UnixStream,
    context: Arc<ServerContext>,
    shutdown_tx: watch::Sender<bool>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(());
    }

    let command: ClientCommand = match serde_json::from_str(line.trim()) {
        Ok(command) => command,
        Err(err) => {
            send_event(&mut write_half, ServerEvent::Error(format!("bad request: {err}"))).await?;
            return Ok(());
        }
    };

    match command {
        ClientCommand::GetStatus => {
            send_event(&mut write_half, ServerEvent::Status(Box::new(context.status()))).await?;
        }
        ClientCommand::Ping => {
            send_event(&mut write_half, ServerEvent::Ack("pong".to_string())).await?;
        }
        ClientCommand::CheckpointNow => {
            let (reply_tx, reply_rx) = oneshot::channel();
            let event = if context
                .requests
                .send(EngineRequest::CheckpointNow { reply: reply_tx })
                .await
                .is_err()
            {
                ServerEvent::Error("engine is not running".to_string())
            } else {
                match reply_rx.await {
                    Ok(CycleOutcome::Failed(reason)) => ServerEvent::Error(reason),
                    Ok(outcome) => ServerEvent::Ack(outcome.describe()),
                    Err(_) => ServerEvent::Error("engine stopped before replying".to_string()),
                }
            };
            send_event(&mut write_half, event).await?;
        }
        ClientCommand::Shutdown => {
            info!("shutdown requested over control socket");
            send_event(&mut write_half, ServerEvent::Ack("shutting down".to_string())).await?;
            let _ = shutdown_tx.send(true);
        }
    }

    Ok(())
}

async fn send_event(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    event: ServerEvent,
) -> Result<()> {
    let encoded = serde_json::to_string(&event)?;
    writer.write_all(encoded.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
