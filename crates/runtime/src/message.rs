//! Conventional-commit style checkpoint messages.

use waypoint_llm::DetectedPattern;

use crate::buffer::ChangeBuffer;
use crate::classifier::ChangeCategory;
use crate::trigger::Rule;

/// Return `&text[..limit]` rounded down to a UTF-8 char boundary.
pub fn safe_truncate(text: &str, limit: usize) -> &str {
    if limit >= text.len() {
        return text;
    }
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Truncate to at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => safe_truncate(text, byte_index),
        None => text,
    }
}

fn plural(count: usize, noun: &str) -> String {
    if count == 1 {
        format!("{count} {noun}")
    } else {
        format!("{count} {noun}s")
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Pattern implied by the buffer contents when no advice is available.
pub fn infer_pattern(rule: Option<Rule>, buffer: &ChangeBuffer) -> DetectedPattern {
    match rule {
        Some(Rule::TestAfterSource) => DetectedPattern::Test,
        Some(Rule::CriticalFile) | Some(Rule::ConfigCluster) => DetectedPattern::Chore,
        _ => match dominant_category(buffer) {
            Some(ChangeCategory::Test) => DetectedPattern::Test,
            Some(ChangeCategory::Doc) => DetectedPattern::Docs,
            Some(ChangeCategory::Config | ChangeCategory::Critical) => DetectedPattern::Chore,
            _ => DetectedPattern::Unknown,
        },
    }
}

/// Category with the most buffered paths; ties favour the earlier entry of
/// the precedence list.
fn dominant_category(buffer: &ChangeBuffer) -> Option<ChangeCategory> {
    const ORDER: [ChangeCategory; 6] = [
        ChangeCategory::Test,
        ChangeCategory::Critical,
        ChangeCategory::Doc,
        ChangeCategory::Config,
        ChangeCategory::Source,
        ChangeCategory::Other,
    ];
    ORDER
        .iter()
        .rev()
        .map(|&category| (category, buffer.count(category)))
        .filter(|(_, count)| *count > 0)
        .max_by_key(|(_, count)| *count)
        .map(|(category, _)| category)
}

/// Build a deterministic message for the buffered work, capped at
/// `max_len` characters.  A known `pattern` overrides the type prefix.
pub fn generate(
    rule: Option<Rule>,
    pattern: DetectedPattern,
    buffer: &ChangeBuffer,
    max_len: usize,
) -> String {
    let total = buffer.len();
    let (default_type, summary) = match rule {
        Some(Rule::TestAfterSource) => {
            let tests = buffer.count(ChangeCategory::Test);
            let sources = buffer.count(ChangeCategory::Source);
            (
                "test",
                format!(
                    "add/update {} ({} touched)",
                    plural(tests, "test file"),
                    plural(sources, "source file")
                ),
            )
        }
        Some(Rule::CriticalFile) => {
            let critical = buffer.paths_in(ChangeCategory::Critical);
            let names: Vec<&str> = critical.iter().map(|p| file_name(p)).take(2).collect();
            let remaining = critical.len().saturating_sub(names.len());
            let mut summary = format!("update {}", names.join(", "));
            if remaining > 0 {
                summary.push_str(&format!(" and {remaining} more"));
            }
            ("build", summary)
        }
        Some(Rule::ConfigCluster) => (
            "chore(config)",
            format!("update {}", plural(buffer.count(ChangeCategory::Config), "config file")),
        ),
        Some(Rule::FileCount) | Some(Rule::LineVolume) => {
            let lines = format!(
                "checkpoint {} (+{}/-{})",
                plural(total, "file"),
                buffer.iter().map(|r| r.lines_added).sum::<u64>(),
                buffer.iter().map(|r| r.lines_removed).sum::<u64>()
            );
            match dominant_category(buffer) {
                Some(ChangeCategory::Test) => ("test", format!("update {}", plural(total, "test file"))),
                Some(ChangeCategory::Doc) => ("docs", format!("update {}", plural(total, "file"))),
                Some(ChangeCategory::Source) => ("feat", lines),
                _ => ("chore", lines),
            }
        }
        Some(Rule::TimeCeiling) | Some(Rule::Manual) | None => {
            ("chore", format!("checkpoint {}", plural(total, "file")))
        }
    };

    let commit_type = pattern.commit_type().unwrap_or(default_type);
    let message = format!("{commit_type}: {summary}");
    truncate_chars(&message, max_len).trim_end().to_string()
}

/// Whether an advisory-suggested message can be used as-is.
pub fn is_well_formed(message: &str, max_len: usize) -> bool {
    let trimmed = message.trim();
    !trimmed.is_empty()
        && trimmed.chars().count() <= max_len
        && !trimmed.chars().any(char::is_control)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use waypoint_exec::LineDelta;

    fn buffer_with(paths: &[(&str, ChangeCategory)]) -> ChangeBuffer {
        let mut buffer = ChangeBuffer::new();
        let now = Utc::now();
        for (i, (path, category)) in paths.iter().enumerate() {
            buffer.observe(path, *category, Some(format!("h{i}")), None, now);
        }
        buffer
    }

    #[test]
    fn test_after_source_message() {
        let buffer = buffer_with(&[
            ("src/auth.py", ChangeCategory::Source),
            ("tests/test_auth.py", ChangeCategory::Test),
            ("tests/test_session.py", ChangeCategory::Test),
        ]);
        let message = generate(Some(Rule::TestAfterSource), DetectedPattern::Unknown, &buffer, 72);
        assert_eq!(message, "test: add/update 2 test files (1 source file touched)");
    }

    #[test]
    fn critical_message_names_files() {
        let buffer = buffer_with(&[
            ("package.json", ChangeCategory::Critical),
            ("web/yarn.lock", ChangeCategory::Critical),
            ("Dockerfile", ChangeCategory::Critical),
        ]);
        let message = generate(Some(Rule::CriticalFile), DetectedPattern::Unknown, &buffer, 72);
        assert_eq!(message, "build: update package.json, yarn.lock and 1 more");
    }

    #[test]
    fn known_pattern_overrides_prefix() {
        let buffer = buffer_with(&[("src/a.rs", ChangeCategory::Source)]);
        let message = generate(Some(Rule::TimeCeiling), DetectedPattern::Fix, &buffer, 72);
        assert_eq!(message, "fix: checkpoint 1 file");
    }

    #[test]
    fn volume_message_reports_lines() {
        let mut buffer = buffer_with(&[("src/a.rs", ChangeCategory::Source)]);
        buffer.set_line_stats("src/a.rs", LineDelta { added: 280, removed: 40 });
        let message = generate(Some(Rule::LineVolume), DetectedPattern::Unknown, &buffer, 72);
        assert_eq!(message, "feat: checkpoint 1 file (+280/-40)");

        let config = buffer_with(&[("ci.yml", ChangeCategory::Config)]);
        let message = generate(Some(Rule::LineVolume), DetectedPattern::Unknown, &config, 72);
        assert_eq!(message, "chore: checkpoint 1 file (+0/-0)");
    }

    #[test]
    fn config_cluster_message_is_scoped() {
        let buffer = buffer_with(&[
            ("a.yml", ChangeCategory::Config),
            ("b.toml", ChangeCategory::Config),
            ("c.ini", ChangeCategory::Config),
        ]);
        let message = generate(Some(Rule::ConfigCluster), DetectedPattern::Unknown, &buffer, 72);
        assert_eq!(message, "chore(config): update 3 config files");
        let message = generate(Some(Rule::ConfigCluster), DetectedPattern::Refactor, &buffer, 72);
        assert_eq!(message, "refactor: update 3 config files");
    }

    #[test]
    fn messages_respect_length_cap_on_char_boundaries() {
        let buffer = buffer_with(&[("配置/設定ファイル名がとても長い.json", ChangeCategory::Critical)]);
        let message = generate(Some(Rule::CriticalFile), DetectedPattern::Unknown, &buffer, 20);
        assert_eq!(message.chars().count(), 20);
        assert!(message.starts_with("build: update "));
    }

    #[test]
    fn infers_pattern_from_rule_and_contents() {
        let docs = buffer_with(&[("a.md", ChangeCategory::Doc), ("b.md", ChangeCategory::Doc)]);
        assert_eq!(infer_pattern(Some(Rule::TimeCeiling), &docs), DetectedPattern::Docs);
        assert_eq!(infer_pattern(Some(Rule::TestAfterSource), &docs), DetectedPattern::Test);
        let mixed = buffer_with(&[("a.rs", ChangeCategory::Source), ("b.md", ChangeCategory::Doc)]);
        // Equal counts: doc precedes source.
        assert_eq!(infer_pattern(Some(Rule::FileCount), &mixed), DetectedPattern::Docs);
    }

    #[test]
    fn well_formed_messages() {
        assert!(is_well_formed("feat: add session refresh", 72));
        assert!(!is_well_formed("   ", 72));
        assert!(!is_well_formed("feat: two\nlines", 72));
        assert!(!is_well_formed(&"x".repeat(73), 72));
    }

    #[test]
    fn truncation_helpers() {
        assert_eq!(safe_truncate("héllo", 2), "h");
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }
}
