//! Combines the deterministic trigger with advisory output into a final
//! commit decision.
//!
//! | Trigger priority | Advisory                     | Outcome                 |
//! |------------------|------------------------------|-------------------------|
//! | high             | anything                     | commit                  |
//! | medium           | confident (>= threshold)     | follow `should_commit`  |
//! | medium           | absent / not confident       | commit                  |
//! | low              | anything                     | commit (safety net)     |
//!
//! A matched time ceiling is never vetoed, whichever rule won the signal.

use serde::{Deserialize, Serialize};

use waypoint_config::{AdvisoryConfig, Priority};
use waypoint_llm::{AdvisoryResponse, AdvisoryResult, DetectedPattern};

use crate::buffer::ChangeBuffer;
use crate::message;
use crate::trigger::{Rule, TriggerSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecisionBasis {
    /// No trigger fired.
    Quiet,
    /// High-priority trigger; advice cannot veto it.
    HighPriority,
    /// A confident advisory answer was followed.
    Advisory,
    /// Advice absent or not confident; the deterministic rule stands.
    Fallback,
    /// Time-ceiling / low-priority trigger; commits whatever the advice.
    SafetyNet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub commit: bool,
    /// Empty when no trigger fired.
    pub message: String,
    pub pattern: DetectedPattern,
    pub basis: DecisionBasis,
}

#[derive(Debug, Clone)]
pub struct DecisionPolicy {
    confidence_threshold: f64,
    max_message_len: usize,
}

impl DecisionPolicy {
    pub fn new(config: &AdvisoryConfig) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            max_message_len: config.max_message_len,
        }
    }

    fn confident<'a>(&self, advisory: &'a AdvisoryResult) -> Option<&'a AdvisoryResponse> {
        advisory
            .advice()
            .filter(|advice| advice.confidence >= self.confidence_threshold)
    }

    pub fn decide(
        &self,
        trigger: &TriggerSignal,
        advisory: &AdvisoryResult,
        buffer: &ChangeBuffer,
    ) -> Decision {
        if !trigger.fired || buffer.is_empty() {
            return Decision {
                commit: false,
                message: String::new(),
                pattern: DetectedPattern::Unknown,
                basis: DecisionBasis::Quiet,
            };
        }

        let priority = trigger.priority.unwrap_or(Priority::Low);
        let confident = self.confident(advisory);
        let never_vetoed = priority == Priority::Low || trigger.includes(Rule::TimeCeiling);

        let (commit, basis) = match (priority, confident) {
            (Priority::High, _) => (true, DecisionBasis::HighPriority),
            (_, Some(advice)) if advice.should_commit => (true, DecisionBasis::Advisory),
            (_, Some(_)) if never_vetoed => (true, DecisionBasis::SafetyNet),
            (_, Some(_)) => (false, DecisionBasis::Advisory),
            (Priority::Medium, None) => (true, DecisionBasis::Fallback),
            (Priority::Low, None) => (true, DecisionBasis::SafetyNet),
        };

        let advised = confident
            .map(|advice| advice.detected_pattern)
            .filter(|pattern| *pattern != DetectedPattern::Unknown);
        let pattern =
            advised.unwrap_or_else(|| message::infer_pattern(trigger.matched_rule, buffer));

        let suggested = advisory
            .advice()
            .and_then(|advice| advice.suggested_message.as_deref())
            .filter(|msg| message::is_well_formed(msg, self.max_message_len))
            .map(|msg| msg.trim().to_string());

        // Only an advised pattern overrides the rule's own commit type.
        let message = suggested.unwrap_or_else(|| {
            message::generate(
                trigger.matched_rule,
                advised.unwrap_or_default(),
                buffer,
                self.max_message_len,
            )
        });

        Decision {
            commit,
            message,
            pattern,
            basis,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ChangeCategory;
    use crate::trigger::TriggerEvaluator;
    use chrono::Utc;
    use waypoint_config::TriggerConfig;
    use waypoint_llm::Urgency;

    fn buffer_with(paths: &[(&str, ChangeCategory)]) -> ChangeBuffer {
        let mut buffer = ChangeBuffer::new();
        let now = Utc::now();
        for (i, (path, category)) in paths.iter().enumerate() {
            buffer.observe(path, *category, Some(format!("h{i}")), None, now);
        }
        buffer
    }

    fn five_sources() -> ChangeBuffer {
        buffer_with(&[
            ("src/a.rs", ChangeCategory::Source),
            ("src/b.rs", ChangeCategory::Source),
            ("src/c.rs", ChangeCategory::Source),
            ("src/d.rs", ChangeCategory::Source),
            ("src/e.rs", ChangeCategory::Source),
        ])
    }

    fn signal(buffer: &ChangeBuffer, minutes_ago: i64) -> TriggerSignal {
        let now = Utc::now();
        TriggerEvaluator::new(TriggerConfig::default()).evaluate(
            buffer,
            now - chrono::Duration::minutes(minutes_ago),
            now,
        )
    }

    fn advice(should_commit: bool, confidence: f64, message: Option<&str>) -> AdvisoryResult {
        AdvisoryResult::Advice(AdvisoryResponse {
            should_commit,
            confidence,
            detected_pattern: DetectedPattern::Feature,
            suggested_message: message.map(str::to_string),
            urgency: Urgency::Normal,
        })
    }

    fn policy() -> DecisionPolicy {
        DecisionPolicy::new(&AdvisoryConfig::default())
    }

    #[test]
    fn quiet_trigger_never_commits() {
        let buffer = buffer_with(&[("src/a.rs", ChangeCategory::Source)]);
        let decision = policy().decide(&signal(&buffer, 0), &advice(true, 1.0, None), &buffer);
        assert!(!decision.commit);
        assert_eq!(decision.basis, DecisionBasis::Quiet);
    }

    #[test]
    fn high_priority_ignores_advisory_veto() {
        let buffer = buffer_with(&[("package.json", ChangeCategory::Critical)]);
        let decision = policy().decide(&signal(&buffer, 0), &advice(false, 0.99, None), &buffer);
        assert!(decision.commit);
        assert_eq!(decision.basis, DecisionBasis::HighPriority);
    }

    #[test]
    fn confident_veto_holds_medium_trigger() {
        let buffer = five_sources();
        let decision = policy().decide(&signal(&buffer, 0), &advice(false, 0.9, None), &buffer);
        assert!(!decision.commit);
        assert_eq!(decision.basis, DecisionBasis::Advisory);
    }

    #[test]
    fn unconfident_veto_falls_back_to_commit() {
        let buffer = five_sources();
        let decision = policy().decide(&signal(&buffer, 0), &advice(false, 0.5, None), &buffer);
        assert!(decision.commit);
        assert_eq!(decision.basis, DecisionBasis::Fallback);
    }

    #[test]
    fn advisory_failure_degrades_to_deterministic_rules() {
        let buffer = five_sources();
        let trigger = signal(&buffer, 0);
        for failure in [
            AdvisoryResult::Timeout,
            AdvisoryResult::Malformed("bad".into()),
            AdvisoryResult::Unavailable("refused".into()),
            AdvisoryResult::Disabled,
        ] {
            let decision = policy().decide(&trigger, &failure, &buffer);
            assert!(decision.commit, "{}", failure.label());
            assert_eq!(decision.basis, DecisionBasis::Fallback);
            assert_eq!(decision.message, "feat: checkpoint 5 files (+0/-0)");
        }
    }

    #[test]
    fn time_ceiling_is_never_vetoed() {
        let buffer = buffer_with(&[("README.md", ChangeCategory::Doc)]);
        let trigger = signal(&buffer, 45);
        assert_eq!(trigger.matched_rule, Some(Rule::TimeCeiling));
        let decision = policy().decide(&trigger, &advice(false, 0.95, None), &buffer);
        assert!(decision.commit);
        assert_eq!(decision.basis, DecisionBasis::SafetyNet);

        // Even when a medium rule won, a matched ceiling keeps the commit.
        let buffer = five_sources();
        let trigger = signal(&buffer, 45);
        assert_eq!(trigger.matched_rule, Some(Rule::FileCount));
        let decision = policy().decide(&trigger, &advice(false, 0.95, None), &buffer);
        assert!(decision.commit);
    }

    #[test]
    fn well_formed_suggestion_is_used_verbatim() {
        let buffer = five_sources();
        let decision = policy().decide(
            &signal(&buffer, 0),
            &advice(true, 0.9, Some("feat: add session refresh")),
            &buffer,
        );
        assert!(decision.commit);
        assert_eq!(decision.message, "feat: add session refresh");
        assert_eq!(decision.pattern, DetectedPattern::Feature);
    }

    #[test]
    fn malformed_suggestion_is_replaced() {
        let buffer = five_sources();
        let long = "x".repeat(100);
        let decision = policy().decide(&signal(&buffer, 0), &advice(true, 0.9, Some(&long)), &buffer);
        assert_eq!(decision.message, "feat: checkpoint 5 files (+0/-0)");
        assert!(decision.message.chars().count() <= 72);
    }
}
