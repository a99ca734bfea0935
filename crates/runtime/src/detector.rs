//! Working-tree scanning and content hashing.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};

use globset::GlobSet;
use ignore::WalkBuilder;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use waypoint_config::{ClassifierConfig, WAYPOINT_DIR};

use crate::buffer::ChangeBuffer;
use crate::classifier::build_globset;
use crate::error::EngineError;
use crate::snapshot::SnapshotState;

const ALWAYS_SKIPPED: &[&str] = &[".git", WAYPOINT_DIR];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedChange {
    pub path: String,
    pub kind: ChangeKind,
    /// Hash of the content on disk; `None` for deletions.
    pub hash: Option<String>,
}

/// Hashes of every scannable file plus the paths that could not be read.
#[derive(Debug, Default)]
pub struct TreeListing {
    pub hashes: BTreeMap<String, String>,
    pub errors: Vec<EngineError>,
    unreadable: BTreeSet<String>,
}

impl TreeListing {
    /// File the hashing result for `rel`.  A file removed between the walk
    /// and the read is simply absent.
    fn record(&mut self, rel: String, hashed: std::io::Result<String>) {
        match hashed {
            Ok(hash) => {
                self.hashes.insert(rel, hash);
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %rel, "scan: file vanished before hashing");
            }
            Err(err) => {
                warn!(path = %rel, error = %err, "scan: cannot hash file; skipping");
                self.errors.push(EngineError::ScanIo {
                    path: rel.clone(),
                    message: err.to_string(),
                });
                self.unreadable.insert(rel);
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct ScanReport {
    pub changes: Vec<DetectedChange>,
    /// Per-file read failures; the affected files were skipped.
    pub errors: Vec<EngineError>,
}

#[derive(Clone)]
pub struct ChangeDetector {
    root: PathBuf,
    ignore: GlobSet,
    respect_gitignore: bool,
}

impl ChangeDetector {
    pub fn new(root: impl Into<PathBuf>, config: &ClassifierConfig) -> Result<Self, EngineError> {
        Ok(Self {
            root: root.into(),
            ignore: build_globset("ignore_globs", &config.ignore_globs)?,
            respect_gitignore: config.respect_gitignore,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Walk the tree and hash every regular file.  Unreadable files are
    /// reported, never fatal.  Blocks on file I/O.
    pub fn list(&self) -> TreeListing {
        let mut listing = TreeListing::default();
        let root = self.root.clone();
        let ignore = self.ignore.clone();

        let walker = WalkBuilder::new(&self.root)
            .hidden(false)
            .parents(false)
            .require_git(false)
            .git_ignore(self.respect_gitignore)
            .git_exclude(self.respect_gitignore)
            .git_global(self.respect_gitignore)
            .ignore(false)
            .follow_links(false)
            .filter_entry(move |entry| {
                let Some(rel) = relative_path(&root, entry.path()) else {
                    return true;
                };
                let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
                if !is_dir {
                    return !ignore.is_match(&rel);
                }
                let name = entry.file_name().to_string_lossy();
                if ALWAYS_SKIPPED.contains(&name.as_ref()) {
                    return false;
                }
                // Submodules and nested repositories belong to another work tree.
                if entry.path().join(".git").symlink_metadata().is_ok() {
                    return false;
                }
                // Prune a directory when anything inside it would be ignored.
                !ignore.is_match(format!("{rel}/_"))
            })
            .build();

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(error = %err, "scan: walk error");
                    listing.errors.push(EngineError::ScanIo {
                        path: String::new(),
                        message: err.to_string(),
                    });
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let Some(rel) = relative_path(&self.root, entry.path()) else {
                continue;
            };
            let hashed = hash_file(entry.path());
            listing.record(rel, hashed);
        }

        listing
    }

    /// Walk, hash and compare in one blocking call.
    pub fn scan(&self, snapshot: &SnapshotState, buffer: &ChangeBuffer) -> ScanReport {
        self.diff(self.list(), snapshot, buffer)
    }

    /// Compare a listing against the best-known state of each path: the
    /// buffered record when one exists, otherwise the snapshot.
    pub fn diff(&self, listing: TreeListing, snapshot: &SnapshotState, buffer: &ChangeBuffer) -> ScanReport {
        let mut changes = Vec::new();

        for (path, hash) in &listing.hashes {
            let known = match buffer.get(path) {
                Some(record) => record.content_hash.as_deref(),
                None => snapshot.hash_of(path),
            };
            if known == Some(hash.as_str()) {
                continue;
            }
            let kind = if snapshot.hash_of(path).is_some() {
                ChangeKind::Modified
            } else {
                ChangeKind::Created
            };
            changes.push(DetectedChange {
                path: path.clone(),
                kind,
                hash: Some(hash.clone()),
            });
        }

        let known_present = snapshot
            .path_hashes
            .keys()
            .filter(|path| buffer.get(path).is_none_or(|r| !r.is_deletion()))
            .chain(buffer.iter().filter(|r| !r.is_deletion()).map(|r| &r.path))
            .collect::<BTreeSet<_>>();

        for path in known_present {
            if listing.hashes.contains_key(path) || listing.unreadable.contains(path) {
                continue;
            }
            // Paths that merely became ignored still exist on disk.
            if self.root.join(path).symlink_metadata().is_ok() {
                continue;
            }
            changes.push(DetectedChange {
                path: path.clone(),
                kind: ChangeKind::Deleted,
                hash: None,
            });
        }

        debug!(
            files = listing.hashes.len(),
            changes = changes.len(),
            errors = listing.errors.len(),
            "scan complete"
        );

        ScanReport {
            changes,
            errors: listing.errors,
        }
    }

    /// Line count of an untracked file, `None` above `max_bytes` or for
    /// binary content.
    pub fn count_lines(&self, path: &str, max_bytes: u64) -> Option<u64> {
        let full = self.root.join(path);
        let metadata = full.metadata().ok()?;
        if metadata.len() > max_bytes {
            return None;
        }
        let mut reader = BufReader::new(File::open(full).ok()?);
        let mut lines = 0u64;
        let mut chunk = Vec::new();
        loop {
            chunk.clear();
            let read = reader.read_until(b'\n', &mut chunk).ok()?;
            if read == 0 {
                break;
            }
            if chunk.contains(&0) {
                return None;
            }
            lines += 1;
        }
        Some(lines)
    }
}

pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    if rel.as_os_str().is_empty() {
        return None;
    }
    let parts = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>();
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ChangeCategory;
    use chrono::Utc;
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn detector(root: &Path) -> ChangeDetector {
        ChangeDetector::new(root, &ClassifierConfig::default()).unwrap()
    }

    fn baseline(det: &ChangeDetector) -> SnapshotState {
        SnapshotState::new(Utc::now(), det.list().hashes)
    }

    #[test]
    fn lists_files_and_skips_internal_and_ignored_dirs() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, "src/main.rs", "fn main() {}\n");
        write(root, ".git/HEAD", "ref: refs/heads/main\n");
        write(root, ".waypoint/runtime/state.json", "{}");
        write(root, "node_modules/pkg/index.js", "x");
        write(root, "target/debug/out", "bin");
        write(root, ".env", "KEY=1\n");

        let listing = detector(root).list();
        let paths: Vec<_> = listing.hashes.keys().cloned().collect();
        assert_eq!(paths, vec![".env", "src/main.rs"]);
        assert!(listing.errors.is_empty());
    }

    #[test]
    fn honours_gitignore_when_configured() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, ".gitignore", "*.log\n");
        write(root, "app.log", "noise");
        write(root, "app.rs", "fn x() {}");

        let listing = detector(root).list();
        assert!(listing.hashes.contains_key("app.rs"));
        assert!(!listing.hashes.contains_key("app.log"));

        let config = ClassifierConfig {
            respect_gitignore: false,
            ..ClassifierConfig::default()
        };
        let listing = ChangeDetector::new(root, &config).unwrap().list();
        assert!(listing.hashes.contains_key("app.log"));
    }

    #[test]
    fn detects_created_modified_and_deleted() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, "keep.rs", "a");
        write(root, "edit.rs", "b");
        write(root, "gone.rs", "c");
        let det = detector(root);
        let snapshot = baseline(&det);

        write(root, "edit.rs", "b2");
        write(root, "new.rs", "d");
        fs::remove_file(root.join("gone.rs")).unwrap();

        let report = det.scan(&snapshot, &ChangeBuffer::new());
        let summary: Vec<_> = report.changes.iter().map(|c| (c.path.as_str(), c.kind)).collect();
        assert_eq!(
            summary,
            vec![
                ("edit.rs", ChangeKind::Modified),
                ("new.rs", ChangeKind::Created),
                ("gone.rs", ChangeKind::Deleted),
            ]
        );
        assert!(report.changes[2].hash.is_none());
    }

    #[test]
    fn buffered_state_suppresses_repeat_detection() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, "a.rs", "1");
        write(root, "b.rs", "1");
        let det = detector(root);
        let snapshot = baseline(&det);

        write(root, "a.rs", "2");
        fs::remove_file(root.join("b.rs")).unwrap();
        let mut buffer = ChangeBuffer::new();
        let now = Utc::now();
        for change in det.scan(&snapshot, &buffer).changes {
            let baseline = snapshot.hash_of(&change.path);
            buffer.observe(&change.path, ChangeCategory::Source, change.hash, baseline, now);
        }
        assert_eq!(buffer.len(), 2);

        // Nothing moved since the last scan.
        assert!(det.scan(&snapshot, &buffer).changes.is_empty());

        // Reverting a.rs is reported so the buffer can drop it.
        write(root, "a.rs", "1");
        let report = det.scan(&snapshot, &buffer);
        assert_eq!(report.changes.len(), 1);
        assert_eq!(report.changes[0].path, "a.rs");
        assert_eq!(report.changes[0].hash.as_deref(), snapshot.hash_of("a.rs"));
    }

    #[test]
    fn newly_ignored_paths_are_not_reported_deleted() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, "build/output.rs", "x");
        let config = ClassifierConfig {
            ignore_globs: vec![],
            ..ClassifierConfig::default()
        };
        let snapshot = SnapshotState::new(
            Utc::now(),
            ChangeDetector::new(root, &config).unwrap().list().hashes,
        );
        assert!(snapshot.hash_of("build/output.rs").is_some());

        let report = detector(root).scan(&snapshot, &ChangeBuffer::new());
        assert!(report.changes.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_file_is_reported_and_skipped() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, "ok.rs", "1");
        write(root, "secret.rs", "2");
        let det = detector(root);
        let snapshot = baseline(&det);

        let secret = root.join("secret.rs");
        fs::set_permissions(&secret, fs::Permissions::from_mode(0o000)).unwrap();
        if File::open(&secret).is_ok() {
            // Running as root: permissions are not enforced.
            return;
        }
        write(root, "ok.rs", "changed");

        let report = det.scan(&snapshot, &ChangeBuffer::new());
        assert_eq!(report.changes.len(), 1);
        assert_eq!(report.changes[0].path, "ok.rs");
        assert!(matches!(
            &report.errors[0],
            EngineError::ScanIo { path, .. } if path == "secret.rs"
        ));
    }

    #[test]
    fn counts_lines_with_size_limit() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, "a.txt", "one\ntwo\nthree");
        write(root, "big.txt", &"x\n".repeat(100));
        fs::write(root.join("blob.bin"), [0u8, 1, 2, b'\n']).unwrap();
        let det = detector(root);
        assert_eq!(det.count_lines("a.txt", 1024), Some(3));
        assert_eq!(det.count_lines("big.txt", 10), None);
        assert_eq!(det.count_lines("blob.bin", 1024), None);
        assert_eq!(det.count_lines("missing.txt", 1024), None);
    }

    #[test]
    fn file_vanishing_mid_scan_is_not_an_error() {
        let mut listing = TreeListing::default();
        let missing = hash_file(Path::new("/nonexistent/waypoint/file.rs"));
        listing.record("file.rs".to_string(), missing);
        assert!(listing.errors.is_empty());
        assert!(listing.unreadable.is_empty());
        assert!(listing.hashes.is_empty());

        let denied = Err(std::io::Error::from(ErrorKind::PermissionDenied));
        listing.record("secret.rs".to_string(), denied);
        assert_eq!(listing.errors.len(), 1);
        assert!(listing.unreadable.contains("secret.rs"));
    }

    #[test]
    fn vanished_file_is_reported_deleted_in_the_same_scan() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, "a.rs", "1");
        write(root, "b.rs", "2");
        let det = detector(root);
        let snapshot = baseline(&det);

        // The walk saw b.rs, the read did not.
        let mut listing = TreeListing::default();
        listing.record("a.rs".to_string(), hash_file(&root.join("a.rs")));
        fs::remove_file(root.join("b.rs")).unwrap();
        listing.record("b.rs".to_string(), hash_file(&root.join("b.rs")));

        let report = det.diff(listing, &snapshot, &ChangeBuffer::new());
        assert!(report.errors.is_empty());
        assert_eq!(report.changes.len(), 1);
        assert_eq!(report.changes[0].path, "b.rs");
        assert_eq!(report.changes[0].kind, ChangeKind::Deleted);
    }

    #[test]
    fn nested_repositories_are_not_scanned() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, "src/lib.rs", "1");
        write(root, "libs/dep/.git", "gitdir: ../../.git/modules/dep\n");
        write(root, "libs/dep/src/lib.rs", "2");
        write(root, "tools/inner/.git/HEAD", "ref: refs/heads/main\n");
        write(root, "tools/inner/main.rs", "3");

        let listing = detector(root).list();
        let paths: Vec<_> = listing.hashes.keys().cloned().collect();
        assert_eq!(paths, vec!["src/lib.rs"]);
    }
}
