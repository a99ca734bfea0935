//! Checkpoint engine and daemon plumbing.
//!
//! The engine watches a working tree, buffers changes since the last
//! checkpoint, and commits them at natural boundaries: deterministic trigger
//! rules first, an optional advisory model second.

pub mod advisor;
pub mod buffer;
pub mod classifier;
pub mod client;
pub mod commands;
pub mod detector;
pub mod engine;
pub mod error;
pub mod executor;
pub mod message;
pub mod paths;
pub mod policy;
pub mod propagation;
pub mod server;
pub mod snapshot;
pub mod trigger;

#[cfg(test)]
mod testing;

pub use buffer::{ChangeBuffer, ChangeRecord};
pub use classifier::{ChangeCategory, Classifier};
pub use client::DaemonClient;
pub use commands::{ClientCommand, DaemonStatus, ServerEvent};
pub use engine::{
    AdvisoryHealth, Component, ComponentError, CycleOutcome, Engine, EnginePhase, EngineRequest,
    EngineStatus, preflight,
};
pub use error::EngineError;
pub use executor::{CheckpointRecord, PushStatus};
pub use paths::RuntimePaths;
pub use policy::{Decision, DecisionBasis};
pub use server::run_daemon;
pub use snapshot::{SnapshotState, SnapshotStore};
pub use trigger::{Rule, TriggerSignal};
