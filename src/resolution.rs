//! Resolution attempts for valid complaints
//! A self-service fix is accepted only when grounded in at least one
//! retrieved chunk; everything else escalates instead of risking a
//! hallucinated fix.

use std::sync::Arc;

use crate::llm::{LanguageModel, SynthesizedAnswer};
use crate::retrieval::RankedContext;

/// Outcome of a resolution attempt
#[derive(Debug, Clone)]
pub enum Resolution {
    Resolved(SynthesizedAnswer),
    Unresolved { reason: String },
}

pub struct ResolutionAttempter {
    llm: Arc<dyn LanguageModel>,
}

impl ResolutionAttempter {
    pub fn new(llm: Arc<dyn LanguageModel>) -> Self {
        Self { llm }
    }

    /// Try to produce a grounded self-service answer. Never errors:
    /// ungrounded or failed synthesis is Unresolved, which forces
    /// escalation downstream.
    pub async fn attempt(&self, complaint_text: &str, context: &RankedContext) -> Resolution {
        if context.is_empty() {
            return Resolution::Unresolved {
                reason: "no retrieved context to ground a resolution".to_string(),
            };
        }

        let answer = match self
            .llm
            .synthesize_answer(complaint_text, &context.format_context())
            .await
        {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!("resolution synthesis failed: {}", e);
                return Resolution::Unresolved {
                    reason: format!("answer synthesis failed: {e}"),
                };
            }
        };

        // Only citations that actually point at retrieved chunks count
        let known = context.chunk_ids();
        let grounded: Vec<String> = answer
            .cited_chunks
            .iter()
            .filter(|id| known.contains(id))
            .cloned()
            .collect();

        if grounded.is_empty() {
            tracing::debug!("discarding ungrounded resolution draft");
            return Resolution::Unresolved {
                reason: "proposed fix cites no retrieved chunk".to_string(),
            };
        }

        Resolution::Resolved(SynthesizedAnswer {
            text: answer.text,
            cited_chunks: grounded,
        })
    }
}
