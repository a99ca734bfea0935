//! Deterministic checkpoint-boundary rules.
//!
//! Every rule is evaluated each cycle; the winner is chosen by
//! [`TieBreak`].  The full list of matches is kept on the signal so the
//! decision policy can tell whether the time ceiling is among them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use waypoint_config::{Priority, TieBreak, TriggerConfig};

use crate::buffer::ChangeBuffer;
use crate::classifier::ChangeCategory;

/// Rule identifiers in table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Rule {
    CriticalFile,
    TestAfterSource,
    FileCount,
    LineVolume,
    ConfigCluster,
    TimeCeiling,
    /// Explicit checkpoint requested over the control socket.
    Manual,
}

impl Rule {
    pub const TABLE: [Rule; 6] = [
        Rule::CriticalFile,
        Rule::TestAfterSource,
        Rule::FileCount,
        Rule::LineVolume,
        Rule::ConfigCluster,
        Rule::TimeCeiling,
    ];

    pub fn default_priority(self) -> Priority {
        match self {
            Self::CriticalFile | Self::TestAfterSource | Self::Manual => Priority::High,
            Self::FileCount | Self::LineVolume | Self::ConfigCluster => Priority::Medium,
            Self::TimeCeiling => Priority::Low,
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::CriticalFile => "critical-file",
            Self::TestAfterSource => "test-after-source",
            Self::FileCount => "file-count",
            Self::LineVolume => "line-volume",
            Self::ConfigCluster => "config-cluster",
            Self::TimeCeiling => "time-ceiling",
            Self::Manual => "manual",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMatch {
    pub rule: Rule,
    pub priority: Priority,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSignal {
    pub fired: bool,
    pub reason: String,
    pub priority: Option<Priority>,
    pub matched_rule: Option<Rule>,
    /// Every rule that matched, in table order.
    pub matches: Vec<RuleMatch>,
}

impl TriggerSignal {
    pub fn quiet() -> Self {
        Self {
            fired: false,
            reason: String::new(),
            priority: None,
            matched_rule: None,
            matches: Vec::new(),
        }
    }

    pub fn manual() -> Self {
        let m = RuleMatch {
            rule: Rule::Manual,
            priority: Rule::Manual.default_priority(),
            reason: "checkpoint requested".to_string(),
        };
        Self::from_winner(m.clone(), vec![m])
    }

    fn from_winner(winner: RuleMatch, matches: Vec<RuleMatch>) -> Self {
        Self {
            fired: true,
            reason: winner.reason,
            priority: Some(winner.priority),
            matched_rule: Some(winner.rule),
            matches,
        }
    }

    pub fn includes(&self, rule: Rule) -> bool {
        self.matches.iter().any(|m| m.rule == rule)
    }
}

pub struct TriggerEvaluator {
    config: TriggerConfig,
}

impl TriggerEvaluator {
    pub fn new(config: TriggerConfig) -> Self {
        Self { config }
    }

    pub fn priority_of(&self, rule: Rule) -> Priority {
        let overrides = &self.config.priorities;
        let configured = match rule {
            Rule::CriticalFile => overrides.critical_file,
            Rule::TestAfterSource => overrides.test_after_source,
            Rule::FileCount => overrides.file_count,
            Rule::LineVolume => overrides.line_volume,
            Rule::ConfigCluster => overrides.config_cluster,
            Rule::TimeCeiling => overrides.time_ceiling,
            Rule::Manual => None,
        };
        configured.unwrap_or_else(|| rule.default_priority())
    }

    /// Evaluate all rules against the buffer.  An empty buffer never fires.
    pub fn evaluate(
        &self,
        buffer: &ChangeBuffer,
        last_checkpoint_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> TriggerSignal {
        if buffer.is_empty() {
            return TriggerSignal::quiet();
        }

        let matches: Vec<RuleMatch> = Rule::TABLE
            .iter()
            .filter_map(|&rule| {
                self.check(rule, buffer, last_checkpoint_at, now)
                    .map(|reason| RuleMatch {
                        rule,
                        priority: self.priority_of(rule),
                        reason,
                    })
            })
            .collect();

        let winner = match self.config.tie_break {
            // max_by_key returns the last maximum; scan in reverse so the
            // earliest table entry wins among equals.
            TieBreak::Priority => matches.iter().rev().max_by_key(|m| m.priority),
            TieBreak::TableOrder => matches.first(),
        };

        match winner.cloned() {
            Some(winner) => TriggerSignal::from_winner(winner, matches),
            None => TriggerSignal::quiet(),
        }
    }

    fn check(
        &self,
        rule: Rule,
        buffer: &ChangeBuffer,
        last_checkpoint_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let cfg = &self.config;
        match rule {
            Rule::CriticalFile => {
                let critical = buffer.paths_in(ChangeCategory::Critical);
                (!critical.is_empty()).then(|| format!("critical file changed: {}", critical.join(", ")))
            }
            Rule::TestAfterSource => {
                let tests = buffer.count(ChangeCategory::Test);
                let sources = buffer.count(ChangeCategory::Source);
                (tests >= cfg.min_test_files && sources >= cfg.min_source_files).then(|| {
                    format!("{tests} test files changed alongside {sources} source files")
                })
            }
            Rule::FileCount => (buffer.len() >= cfg.file_count)
                .then(|| format!("{} files changed (threshold {})", buffer.len(), cfg.file_count)),
            Rule::LineVolume => {
                let lines = buffer.total_lines();
                (lines >= cfg.line_volume)
                    .then(|| format!("{lines} lines changed (threshold {})", cfg.line_volume))
            }
            Rule::ConfigCluster => {
                let configs = buffer.count(ChangeCategory::Config);
                (configs >= cfg.config_cluster)
                    .then(|| format!("{configs} configuration files changed"))
            }
            Rule::TimeCeiling => {
                let elapsed = now.signed_duration_since(last_checkpoint_at);
                let ceiling = chrono::Duration::minutes(cfg.time_ceiling_minutes as i64);
                (elapsed >= ceiling).then(|| {
                    format!("{} minutes since last checkpoint", elapsed.num_minutes())
                })
            }
            Rule::Manual => None,
        }
    }
}
