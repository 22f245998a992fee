//! Validity checking for complaints
//! Declarative policy rules run first, in listed order, first match wins;
//! unmatched complaints fall back to model judgment grounded in retrieved
//! context. Rule evaluation is deterministic given identical inputs.

use std::sync::Arc;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::{LanguageModel, Verdict, ValidityJudgment};
use crate::retrieval::RankedContext;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Invalid rule pattern '{pattern}' in rule {rule_id}: {detail}")]
    BadPattern {
        rule_id: String,
        pattern: String,
        detail: String,
    },
}

/// One declarative policy rule. Patterns are case-insensitive regexes
/// matched against the normalized complaint text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    pub pattern: String,
    pub verdict: Verdict,
    pub reason: String,
}

struct CompiledRule {
    rule: PolicyRule,
    regex: Regex,
}

pub struct ValidityChecker {
    llm: Arc<dyn LanguageModel>,
    rules: Vec<CompiledRule>,
}

impl ValidityChecker {
    pub fn new(llm: Arc<dyn LanguageModel>, rules: Vec<PolicyRule>) -> Result<Self, PolicyError> {
        let compiled = rules
            .into_iter()
            .map(|rule| {
                let regex = Regex::new(&format!("(?i){}", rule.pattern)).map_err(|e| {
                    PolicyError::BadPattern {
                        rule_id: rule.id.clone(),
                        pattern: rule.pattern.clone(),
                        detail: e.to_string(),
                    }
                })?;
                Ok(CompiledRule { rule, regex })
            })
            .collect::<Result<Vec<_>, PolicyError>>()?;
        Ok(Self {
            llm,
            rules: compiled,
        })
    }

    /// Textual rule descriptions handed to the model for the fallback call
    fn rule_texts(&self) -> Vec<String> {
        self.rules
            .iter()
            .map(|c| format!("{}: {} => {:?}", c.rule.id, c.rule.reason, c.rule.verdict))
            .collect()
    }

    /// Check whether a complaint is actionable. Rules are evaluated in
    /// their configured order; the first matching rule decides.
    pub async fn check(&self, complaint_text: &str, context: &RankedContext) -> ValidityJudgment {
        for compiled in &self.rules {
            if compiled.regex.is_match(complaint_text) {
                tracing::debug!("policy rule {} matched", compiled.rule.id);
                return ValidityJudgment {
                    verdict: compiled.rule.verdict,
                    reason: compiled.rule.reason.clone(),
                };
            }
        }

        match self
            .llm
            .judge_validity(
                complaint_text,
                &context.format_context(),
                &self.rule_texts(),
            )
            .await
        {
            Ok(judgment) => judgment,
            Err(e) => {
                // An unreachable judge must not silence a real complaint:
                // treat the complaint as actionable and let resolution or
                // escalation handle it
                tracing::warn!("validity judgment unavailable ({}), treating as valid", e);
                ValidityJudgment {
                    verdict: Verdict::Valid,
                    reason: "validity judgment unavailable; complaint treated as actionable"
                        .to_string(),
                }
            }
        }
    }
}

/// Baseline rule set: known non-issues and out-of-policy requests
pub fn default_rules() -> Vec<PolicyRule> {
    vec![
        PolicyRule {
            id: "out-of-warranty".into(),
            pattern: r"out of warranty|warranty (has )?expired".into(),
            verdict: Verdict::Invalid,
            reason: "Hardware out of warranty is not serviceable under support policy".into(),
        },
        PolicyRule {
            id: "scheduled-maintenance".into(),
            pattern: r"during (the )?maintenance window|scheduled maintenance".into(),
            verdict: Verdict::Invalid,
            reason: "Downtime inside an announced maintenance window is expected behavior".into(),
        },
        PolicyRule {
            id: "billing-dispute".into(),
            pattern: r"double charge|charged twice|overcharged".into(),
            verdict: Verdict::Valid,
            reason: "Billing discrepancies are always actionable".into(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{IntentClassification, LlmError, SynthesizedAnswer};
    use async_trait::async_trait;

    /// Judge stub: returns the configured judgment, or fails
    struct FixedJudge {
        judgment: Option<ValidityJudgment>,
    }

    #[async_trait]
    impl LanguageModel for FixedJudge {
        async fn classify_intent(
            &self,
            _text: &str,
            _context: &str,
        ) -> Result<IntentClassification, LlmError> {
            unimplemented!()
        }

        async fn judge_validity(
            &self,
            _text: &str,
            _context: &str,
            _rules: &[String],
        ) -> Result<ValidityJudgment, LlmError> {
            self.judgment
                .clone()
                .ok_or_else(|| LlmError::Unavailable("down".into()))
        }

        async fn synthesize_answer(
            &self,
            _text: &str,
            _context: &str,
        ) -> Result<SynthesizedAnswer, LlmError> {
            unimplemented!()
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, LlmError> {
            unimplemented!()
        }
    }

    fn checker(rules: Vec<PolicyRule>, judgment: Option<ValidityJudgment>) -> ValidityChecker {
        ValidityChecker::new(Arc::new(FixedJudge { judgment }), rules).unwrap()
    }

    #[tokio::test]
    async fn test_first_matching_rule_wins() {
        let rules = vec![
            PolicyRule {
                id: "first".into(),
                pattern: "printer".into(),
                verdict: Verdict::Invalid,
                reason: "first rule".into(),
            },
            PolicyRule {
                id: "second".into(),
                pattern: "printer jam".into(),
                verdict: Verdict::Valid,
                reason: "second rule".into(),
            },
        ];
        let c = checker(rules, None);
        let judgment = c
            .check("the printer jam keeps happening", &RankedContext::default())
            .await;
        assert_eq!(judgment.verdict, Verdict::Invalid);
        assert_eq!(judgment.reason, "first rule");
    }

    #[tokio::test]
    async fn test_rules_are_case_insensitive() {
        let c = checker(default_rules(), None);
        let judgment = c
            .check("My laptop is OUT OF WARRANTY and broke", &RankedContext::default())
            .await;
        assert_eq!(judgment.verdict, Verdict::Invalid);
    }

    #[tokio::test]
    async fn test_unmatched_complaint_falls_back_to_model() {
        let c = checker(
            default_rules(),
            Some(ValidityJudgment {
                verdict: Verdict::Valid,
                reason: "model says actionable".into(),
            }),
        );
        let judgment = c
            .check("my dashboard renders blank pages", &RankedContext::default())
            .await;
        assert_eq!(judgment.verdict, Verdict::Valid);
        assert_eq!(judgment.reason, "model says actionable");
    }

    #[tokio::test]
    async fn test_judge_failure_treats_complaint_as_valid() {
        let c = checker(default_rules(), None);
        let judgment = c
            .check("my dashboard renders blank pages", &RankedContext::default())
            .await;
        assert_eq!(judgment.verdict, Verdict::Valid);
        assert!(judgment.reason.contains("unavailable"));
    }

    #[test]
    fn test_bad_pattern_is_rejected() {
        let rules = vec![PolicyRule {
            id: "broken".into(),
            pattern: "(unclosed".into(),
            verdict: Verdict::Invalid,
            reason: "never compiles".into(),
        }];
        let result = ValidityChecker::new(Arc::new(FixedJudge { judgment: None }), rules);
        assert!(matches!(result.err(), Some(PolicyError::BadPattern { .. })));
    }

    #[tokio::test]
    async fn test_identical_inputs_identical_verdicts() {
        let c = checker(default_rules(), None);
        let ctx = RankedContext::default();
        let a = c.check("I was charged twice this month", &ctx).await;
        let b = c.check("I was charged twice this month", &ctx).await;
        assert_eq!(a.verdict, b.verdict);
        assert_eq!(a.reason, b.reason);
    }
}
