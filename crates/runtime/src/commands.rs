use serde::{Deserialize, Serialize};

use crate::engine::EngineStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub pid: u32,
    pub root: String,
    pub uptime_secs: u64,
    pub engine: EngineStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientCommand {
    GetStatus,
    /// Commit everything pending now, regardless of trigger thresholds.
    CheckpointNow,
    Shutdown,
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerEvent {
    Status(Box<DaemonStatus>),
    Ack(String),
    Error(String),
}
