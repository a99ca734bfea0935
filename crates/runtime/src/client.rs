use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::{ClientCommand, DaemonStatus, ServerEvent};

#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket_path: PathBuf,
}

impl DaemonClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    pub async fn ping(&self) -> Result<()> {
        for event in self.request_events(ClientCommand::Ping).await? {
            if let ServerEvent::Ack(_) = event {
                return Ok(());
            }
        }
        bail!("daemon ping response missing")
    }

    pub async fn get_status(&self) -> Result<DaemonStatus> {
        let events = self.request_events(ClientCommand::GetStatus).await?;
        for event in events {
            if let ServerEvent::Status(status) = event {
                return Ok(*status);
            }
        }
        bail!("daemon status response missing")
    }

    /// Ask the daemon to checkpoint pending work now.  Returns the daemon's
    /// one-line summary of what happened.
    pub async fn checkpoint_now(&self) -> Result<String> {
        for event in self.request_events(ClientCommand::CheckpointNow).await? {
            match event {
                ServerEvent::Ack(summary) => return Ok(summary),
                ServerEvent::Error(err) => bail!("{err}"),
                ServerEvent::Status(_) => {}
            }
        }
        bail!("daemon checkpoint response missing")
    }

    pub async fn graceful_shutdown(&self) -> Result<()> {
        let _ = self.request_events(ClientCommand::Shutdown).await?;
        Ok(())
    }

    async fn request_events(&self, command: ClientCommand) -> Result<Vec<ServerEvent>> {
        let stream = UnixStream::connect(&self.socket_path).await?;
        let (read_half, mut write_half) = stream.into_split();

        let request = serde_json::to_string(&command)?;
        write_half.write_all(request.as_bytes()).await?;
        write_half.write_all(b"\n").await?;
        write_half.flush().await?;

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        let mut events = Vec::new();
        loop {
            line.clear();
            let bytes = reader.read_line(&mut line).await?;
            if bytes == 0 {
                break;
            }
            let event: ServerEvent = serde_json::from_str(line.trim())?;
            let done = matches!(
                event,
                ServerEvent::Ack(_) | ServerEvent::Status(_) | ServerEvent::Error(_)
            );
            events.push(event);
            if done {
                break;
            }
        }

        Ok(events)
    }
}
