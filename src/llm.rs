//! Language model capability interface for supportflow
//! Classification, validity judgment, answer synthesis, and embeddings are
//! remote capabilities with bounded latency and possible failure

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Model unavailable: {0}")]
    Unavailable(String),
    #[error("Request timeout")]
    Timeout,
    #[error("Ambiguous or malformed model output: {0}")]
    InvalidResponse(String),
    #[error("Generation cancelled")]
    Cancelled,
}

/// Intent label for an incoming turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Query,
    Complaint,
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Query => write!(f, "query"),
            Self::Complaint => write!(f, "complaint"),
        }
    }
}

impl std::str::FromStr for Intent {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "query" => Ok(Self::Query),
            "complaint" => Ok(Self::Complaint),
            _ => Err(()),
        }
    }
}

/// Intent label plus model confidence in [0, 1]
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IntentClassification {
    pub intent: Intent,
    pub confidence: f64,
}

/// Validity verdict for a complaint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Valid,
    Invalid,
}

/// Verdict with the reason it was reached
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidityJudgment {
    pub verdict: Verdict,
    pub reason: String,
}

/// Synthesized answer with the chunk ids it is grounded in.
/// An empty citation list means the answer is ungrounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesizedAnswer {
    pub text: String,
    pub cited_chunks: Vec<String>,
}

/// Remote language-model capability. Every call may fail or time out;
/// callers decide how each failure degrades (see the decision engine).
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Label a turn as query or complaint, with confidence
    async fn classify_intent(
        &self,
        text: &str,
        context: &str,
    ) -> Result<IntentClassification, LlmError>;

    /// Judge whether a complaint is actionable, grounded in retrieved context
    async fn judge_validity(
        &self,
        text: &str,
        context: &str,
        rules: &[String],
    ) -> Result<ValidityJudgment, LlmError>;

    /// Draft an answer grounded in the supplied context block
    async fn synthesize_answer(
        &self,
        text: &str,
        context: &str,
    ) -> Result<SynthesizedAnswer, LlmError>;

    /// Embed text for similarity search
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_intent_display_round_trip() {
        assert_eq!(Intent::Query.to_string(), "query");
        assert_eq!(Intent::Complaint.to_string(), "complaint");
        assert_eq!(Intent::from_str("query"), Ok(Intent::Query));
        assert_eq!(Intent::from_str("complaint"), Ok(Intent::Complaint));
        assert!(Intent::from_str("other").is_err());
    }

    #[test]
    fn test_answer_grounding_flag() {
        let grounded = SynthesizedAnswer {
            text: "Restart the VPN client.".into(),
            cited_chunks: vec!["chunk-1".into()],
        };
        assert!(!grounded.cited_chunks.is_empty());

        let ungrounded = SynthesizedAnswer {
            text: "Try turning it off and on.".into(),
            cited_chunks: vec![],
        };
        assert!(ungrounded.cited_chunks.is_empty());
    }
}
