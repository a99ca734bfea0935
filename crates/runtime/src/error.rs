//! Engine error taxonomy.
//!
//! Only [`EngineError::Configuration`] is fatal, and only at startup.  Every
//! other variant is recovered inside the scan loop and surfaced through the
//! status report.

use std::path::PathBuf;

use thiserror::Error;

use waypoint_exec::VcsError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A single file could not be read during a scan; the file is skipped.
    #[error("cannot read {path}: {message}")]
    ScanIo { path: String, message: String },

    /// Timeout, connection failure or malformed advisory payload.
    #[error("advisory unavailable: {0}")]
    AdvisoryUnavailable(String),

    /// The commit was refused by hooks even with hooks bypassed.
    #[error("commit rejected by hooks: {0}")]
    CommitHookRejected(String),

    #[error("commit failed: {0}")]
    Commit(#[source] VcsError),

    #[error("push failed: {0}")]
    PushFailed(String),

    /// The persisted snapshot could not be decoded; the engine starts over.
    #[error("snapshot state at {} is corrupt: {reason}", path.display())]
    StateCorrupt { path: PathBuf, reason: String },

    #[error("cannot persist snapshot state at {}: {message}", path.display())]
    StatePersist { path: PathBuf, message: String },

    /// Fatal at startup: bad config, target is not a repository, ...
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl EngineError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

impl From<VcsError> for EngineError {
    fn from(err: VcsError) -> Self {
        match err {
            VcsError::HookRejected { stderr, .. } => Self::CommitHookRejected(stderr),
            other => Self::Commit(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_rejection_maps_to_dedicated_variant() {
        let err: EngineError = VcsError::HookRejected {
            op: "commit".to_string(),
            stderr: "lint".to_string(),
        }
        .into();
        assert!(matches!(err, EngineError::CommitHookRejected(ref s) if s == "lint"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn only_configuration_is_fatal() {
        assert!(EngineError::Configuration("not a repo".into()).is_fatal());
        assert!(!EngineError::PushFailed("offline".into()).is_fatal());
        let corrupt = EngineError::StateCorrupt {
            path: PathBuf::from("/tmp/state.json"),
            reason: "eof".into(),
        };
        assert!(corrupt.to_string().contains("/tmp/state.json"));
    }
}
