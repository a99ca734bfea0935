use std::path::{Path, PathBuf};

use waypoint_config::WAYPOINT_DIR;

/// Per-repository runtime files, all under `<root>/.waypoint/runtime/`.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    pub root: PathBuf,
    pub runtime_dir: PathBuf,
    pub state_file: PathBuf,
    pub pid_file: PathBuf,
    pub lock_file: PathBuf,
    pub socket: PathBuf,
    pub log_file: PathBuf,
}

impl RuntimePaths {
    pub fn for_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let runtime_dir = root.join(WAYPOINT_DIR).join("runtime");
        Self {
            state_file: runtime_dir.join("state.json"),
            pid_file: runtime_dir.join("daemon.pid"),
            lock_file: runtime_dir.join("daemon.lock"),
            socket: runtime_dir.join("daemon.sock"),
            log_file: runtime_dir.join("daemon.log"),
            runtime_dir,
            root,
        }
    }

    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.runtime_dir)
    }
}
