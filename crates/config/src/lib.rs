use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Directory (relative to the watched repository root) holding the config
/// file and the daemon's runtime files.
pub const WAYPOINT_DIR: &str = ".waypoint";

// ── Trigger priorities ────────────────────────────────────────────────────────

/// Priority attached to a trigger rule.
///
/// | Priority | Decision behaviour                                        |
/// |----------|-----------------------------------------------------------|
/// | `high`   | Commit regardless of advisory outcome.                    |
/// | `medium` | Follow a confident advisory, otherwise commit.            |
/// | `low`    | Safety net: follow a confident "yes", never vetoed.       |
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(label)
    }
}

/// How the trigger evaluator picks a winner when several rules match in the
/// same scan cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TieBreak {
    /// Highest priority wins; equal priorities resolve by rule table order.
    #[default]
    Priority,
    /// The first matching rule in table order wins, whatever its priority.
    TableOrder,
}

// ── Engine ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Seconds between working-tree scans.
    pub scan_interval_secs: u64,
    /// Number of checkpoint records kept in memory as advisory context.
    pub history_size: usize,
    /// Seconds an in-flight push may keep running after a shutdown request.
    pub shutdown_grace_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 5,
            history_size: 20,
            shutdown_grace_secs: 5,
        }
    }
}

// ── Trigger rules ─────────────────────────────────────────────────────────────

/// Optional per-rule priority overrides.  `None` keeps the built-in priority.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RulePriorities {
    pub critical_file: Option<Priority>,
    pub test_after_source: Option<Priority>,
    pub file_count: Option<Priority>,
    pub line_volume: Option<Priority>,
    pub config_cluster: Option<Priority>,
    pub time_ceiling: Option<Priority>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Minimum changed test files for the test-after-source boundary.
    pub min_test_files: usize,
    /// Minimum changed source files for the test-after-source boundary.
    pub min_source_files: usize,
    /// Distinct changed paths that fire the file-count rule.
    pub file_count: usize,
    /// Added + removed lines that fire the line-volume rule.
    pub line_volume: u64,
    /// Changed configuration files that fire the config-cluster rule.
    pub config_cluster: usize,
    /// Minutes since the last checkpoint after which any pending change is
    /// committed.
    pub time_ceiling_minutes: u64,
    pub tie_break: TieBreak,
    pub priorities: RulePriorities,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            min_test_files: 2,
            min_source_files: 1,
            file_count: 5,
            line_volume: 300,
            config_cluster: 3,
            time_ceiling_minutes: 30,
            tie_break: TieBreak::Priority,
            priorities: RulePriorities::default(),
        }
    }
}

// ── Classifier ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Extra glob patterns classified as tests (checked before built-ins).
    pub test_globs: Vec<String>,
    /// Extra glob patterns classified as critical.
    pub critical_globs: Vec<String>,
    /// Extra glob patterns classified as documentation.
    pub doc_globs: Vec<String>,
    /// Extra glob patterns classified as configuration.
    pub config_globs: Vec<String>,
    /// Paths never scanned.  `.git/` and `.waypoint/` are always excluded.
    pub ignore_globs: Vec<String>,
    /// Honour `.gitignore` files while walking the tree.
    pub respect_gitignore: bool,
    /// Files above this size are hashed but their lines are not counted.
    pub max_line_count_bytes: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            test_globs: vec![],
            critical_globs: vec![],
            doc_globs: vec![],
            config_globs: vec![],
            ignore_globs: vec![
                "**/node_modules/**".to_string(),
                "**/target/**".to_string(),
                "**/vendor/**".to_string(),
                "**/__pycache__/**".to_string(),
                "**/.venv/**".to_string(),
                "**/dist/**".to_string(),
                "**/build/**".to_string(),
            ],
            respect_gitignore: true,
            max_line_count_bytes: 2 * 1024 * 1024,
        }
    }
}

// ── Advisory ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisoryConfig {
    /// `ollama`, `http`, or `disabled`.
    pub provider: String,
    /// Base URL of the advisory endpoint.  Overridden at runtime by
    /// `WAYPOINT_ADVISORY_URL` (any provider) or `OLLAMA_BASE_URL` (ollama).
    pub base_url: String,
    /// Model name sent to the ollama provider.
    pub model: String,
    /// Hard deadline for a single advisory call.
    pub timeout_secs: u64,
    /// Confidence at or above which advice is followed for non-high triggers.
    pub confidence_threshold: f64,
    /// Longest accepted summary line for an advisory commit message.
    pub max_message_len: usize,
}

impl Default for AdvisoryConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            base_url: "http://127.0.0.1:11434".to_string(),
            model: "llama3.1:8b".to_string(),
            timeout_secs: 5,
            confidence_threshold: 0.7,
            max_message_len: 72,
        }
    }
}

impl AdvisoryConfig {
    pub fn is_disabled(&self) -> bool {
        self.provider.eq_ignore_ascii_case("disabled") || self.provider.eq_ignore_ascii_case("none")
    }
}

// ── Git ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    /// Executable used for every version-control call.
    pub binary: String,
    /// Deadline for stage / commit / status subprocesses.
    pub command_timeout_secs: u64,
    /// Deadline for a single push attempt.
    pub push_timeout_secs: u64,
    /// Propagate checkpoints to the upstream remote after each commit.
    pub push_enabled: bool,
    /// Push attempts per checkpoint before giving up until the next one.
    pub push_retries: u32,
    /// Author identity for checkpoint commits.  Empty keeps the repository's
    /// configured identity.
    pub author_name: String,
    pub author_email: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            binary: "git".to_string(),
            command_timeout_secs: 30,
            push_timeout_secs: 60,
            push_enabled: true,
            push_retries: 3,
            author_name: String::new(),
            author_email: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub trigger: TriggerConfig,
    pub classifier: ClassifierConfig,
    pub advisory: AdvisoryConfig,
    pub git: GitConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Location of the config file for a watched repository.
    pub fn path_for_root(root: impl AsRef<Path>) -> PathBuf {
        root.as_ref().join(WAYPOINT_DIR).join("config.toml")
    }

    /// Load `<root>/.waypoint/config.toml`, falling back to defaults when the
    /// file does not exist.
    pub fn load_for_root(root: impl AsRef<Path>) -> Result<Self> {
        Self::load_from(Self::path_for_root(root))
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)
                .with_context(|| format!("invalid config file {}", path.display()))?;
        }

        config.apply_env_overrides(|key| env::var(key).ok());
        Ok(config)
    }

    /// Apply environment overrides through `lookup` so tests never touch the
    /// process environment.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(url) = non_empty("OLLAMA_BASE_URL") {
            if self.advisory.provider.eq_ignore_ascii_case("ollama") {
                self.advisory.base_url = url;
            }
        }

        // Generic override wins over the provider-specific one.
        if let Some(url) = non_empty("WAYPOINT_ADVISORY_URL") {
            self.advisory.base_url = url;
        }

        if let Some(level) = non_empty("WAYPOINT_LOG") {
            self.telemetry.log_level = level;
        }
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
