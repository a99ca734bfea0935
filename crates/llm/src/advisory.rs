//! Wire types for the semantic advisory exchange.
//!
//! The request never carries file contents: only categorized counts, the
//! paths of touched critical files and recent checkpoint messages.

use serde::{Deserialize, Serialize};

use crate::extract_json_output;

/// Commit pattern the advisory service recognised in the pending work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectedPattern {
    Feature,
    Fix,
    Test,
    Docs,
    Refactor,
    Chore,
    #[default]
    Unknown,
}

impl DetectedPattern {
    /// Lenient label parsing: accepts conventional-commit short forms and
    /// maps anything unrecognised to `Unknown`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "feature" | "feat" => Self::Feature,
            "fix" | "bugfix" => Self::Fix,
            "test" | "tests" => Self::Test,
            "docs" | "doc" | "documentation" => Self::Docs,
            "refactor" => Self::Refactor,
            "chore" => Self::Chore,
            _ => Self::Unknown,
        }
    }

    /// Conventional-commit type prefix, `None` for `Unknown`.
    pub fn commit_type(self) -> Option<&'static str> {
        match self {
            Self::Feature => Some("feat"),
            Self::Fix => Some("fix"),
            Self::Test => Some("test"),
            Self::Docs => Some("docs"),
            Self::Refactor => Some("refactor"),
            Self::Chore => Some("chore"),
            Self::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    #[default]
    Normal,
    High,
}

impl Urgency {
    fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "low" => Self::Low,
            "high" | "urgent" | "critical" => Self::High,
            _ => Self::Normal,
        }
    }
}

/// Changed-path counts per category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCounts {
    pub source: usize,
    pub test: usize,
    pub config: usize,
    pub doc: usize,
    pub critical: usize,
    pub other: usize,
}

impl CategoryCounts {
    pub fn total(&self) -> usize {
        self.source + self.test + self.config + self.doc + self.critical + self.other
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisoryRequest {
    pub counts: CategoryCounts,
    pub critical_paths: Vec<String>,
    /// Most recent checkpoint messages, newest last (at most five).
    pub recent_messages: Vec<String>,
    pub branch: String,
    pub elapsed_secs: u64,
    pub lines_changed: u64,
    /// Human-readable reason of the deterministic rule that fired.
    pub trigger_reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisoryResponse {
    pub should_commit: bool,
    pub confidence: f64,
    pub detected_pattern: DetectedPattern,
    pub suggested_message: Option<String>,
    pub urgency: Urgency,
}

/// Outcome of one advisory round-trip as seen by the decision policy.
///
/// Every variant except `Advice` means "no usable advice"; the policy falls
/// back to deterministic rules for all of them.
#[derive(Debug, Clone, PartialEq)]
pub enum AdvisoryResult {
    Advice(AdvisoryResponse),
    /// The call did not complete before its deadline.
    Timeout,
    /// The service answered but the payload was unusable.
    Malformed(String),
    /// Connection refused, HTTP error status, or similar transport failure.
    Unavailable(String),
    /// No advisory provider is configured.
    Disabled,
}

impl AdvisoryResult {
    pub fn advice(&self) -> Option<&AdvisoryResponse> {
        match self {
            Self::Advice(response) => Some(response),
            Self::Timeout | Self::Malformed(_) | Self::Unavailable(_) | Self::Disabled => None,
        }
    }

    /// Whether the service answered at all; `None` when disabled.
    pub fn reachable(&self) -> Option<bool> {
        match self {
            Self::Advice(_) | Self::Malformed(_) => Some(true),
            Self::Timeout | Self::Unavailable(_) => Some(false),
            Self::Disabled => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Advice(_) => "advice",
            Self::Timeout => "timeout",
            Self::Malformed(_) => "malformed",
            Self::Unavailable(_) => "unavailable",
            Self::Disabled => "disabled",
        }
    }
}

/// Loosely typed payload as it arrives; validated into [`AdvisoryResponse`].
#[derive(Debug, Deserialize)]
struct RawAdvisory {
    should_commit: Option<bool>,
    confidence: Option<f64>,
    #[serde(default)]
    detected_pattern: Option<String>,
    #[serde(default)]
    suggested_message: Option<String>,
    #[serde(default)]
    urgency: Option<String>,
}

/// Parse and validate an advisory payload.
///
/// `should_commit` and `confidence` are required and `confidence` must lie
/// in `[0, 1]`; any violation rejects the whole response.  Unknown pattern or
/// urgency labels degrade to `Unknown` / `Normal`.
pub fn parse_advisory_response(raw: &str) -> Result<AdvisoryResponse, String> {
    let parsed: RawAdvisory =
        extract_json_output(raw).ok_or_else(|| "no JSON object in advisory reply".to_string())?;

    let should_commit = parsed
        .should_commit
        .ok_or_else(|| "missing should_commit".to_string())?;
    let confidence = parsed
        .confidence
        .ok_or_else(|| "missing confidence".to_string())?;
    if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
        return Err(format!("confidence {confidence} outside [0, 1]"));
    }

    let suggested_message = parsed
        .suggested_message
        .map(|message| message.trim().to_string())
        .filter(|message| !message.is_empty());

    Ok(AdvisoryResponse {
        should_commit,
        confidence,
        detected_pattern: parsed
            .detected_pattern
            .as_deref()
            .map(DetectedPattern::from_label)
            .unwrap_or_default(),
        suggested_message,
        urgency: parsed
            .urgency
            .as_deref()
            .map(Urgency::from_label)
            .unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_complete_response() {
        let raw = r#"{"should_commit":true,"confidence":0.85,"detected_pattern":"feature",
            "suggested_message":"feat: add session refresh","urgency":"high"}"#;
        let resp = parse_advisory_response(raw).unwrap();
        assert!(resp.should_commit);
        assert!((resp.confidence - 0.85).abs() < f64::EPSILON);
        assert_eq!(resp.detected_pattern, DetectedPattern::Feature);
        assert_eq!(resp.suggested_message.as_deref(), Some("feat: add session refresh"));
        assert_eq!(resp.urgency, Urgency::High);
    }

    #[test]
    fn parses_fenced_model_output() {
        let raw = "Sure.\n```json\n{\"should_commit\":false,\"confidence\":0.4}\n```";
        let resp = parse_advisory_response(raw).unwrap();
        assert!(!resp.should_commit);
        assert_eq!(resp.detected_pattern, DetectedPattern::Unknown);
        assert_eq!(resp.urgency, Urgency::Normal);
        assert!(resp.suggested_message.is_none());
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let err = parse_advisory_response(r#"{"confidence":0.9}"#).unwrap_err();
        assert!(err.contains("should_commit"));
        let err = parse_advisory_response(r#"{"should_commit":true}"#).unwrap_err();
        assert!(err.contains("confidence"));
    }

    #[test]
    fn wrongly_typed_field_is_rejected() {
        assert!(parse_advisory_response(r#"{"should_commit":"yes","confidence":0.9}"#).is_err());
    }

    #[test]
    fn out_of_range_confidence_is_rejected() {
        let err = parse_advisory_response(r#"{"should_commit":true,"confidence":1.5}"#).unwrap_err();
        assert!(err.contains("outside"));
    }

    #[test]
    fn blank_message_becomes_none() {
        let raw = r#"{"should_commit":true,"confidence":0.9,"suggested_message":"   "}"#;
        assert!(parse_advisory_response(raw).unwrap().suggested_message.is_none());
    }

    #[test]
    fn pattern_labels_are_lenient() {
        assert_eq!(DetectedPattern::from_label("feat"), DetectedPattern::Feature);
        assert_eq!(DetectedPattern::from_label(" Docs "), DetectedPattern::Docs);
        assert_eq!(DetectedPattern::from_label("banana"), DetectedPattern::Unknown);
        assert_eq!(DetectedPattern::Refactor.commit_type(), Some("refactor"));
        assert_eq!(DetectedPattern::Unknown.commit_type(), None);
    }

    #[test]
    fn result_exposes_advice_only_for_advice_variant() {
        assert!(AdvisoryResult::Timeout.advice().is_none());
        assert_eq!(AdvisoryResult::Timeout.reachable(), Some(false));
        assert_eq!(AdvisoryResult::Malformed("x".into()).reachable(), Some(true));
        assert_eq!(AdvisoryResult::Disabled.reachable(), None);
    }
}
