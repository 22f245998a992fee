//! Intent classification for supportflow
//! Deterministic complaint-marker scan first, then the language model.
//! Low confidence and model failure both route to the Query path.

use std::sync::Arc;

use crate::llm::{Intent, LanguageModel};

/// Markers that flag a turn as a complaint without asking the model
const COMPLAINT_MARKERS: &[&str] = &[
    "complaint",
    "double charge",
    "charged twice",
    "overcharged",
    "not working",
    "doesn't work",
    "does not work",
    "won't work",
    "broken",
    "refund",
    "this is wrong",
    "unacceptable",
    "issue with",
    "problem with",
    "keeps failing",
    "still failing",
];

/// Confidence assigned to marker-based classifications
const MARKER_CONFIDENCE: f64 = 0.9;

/// Classification result, with degradation noted when the model was
/// unavailable or unsure
#[derive(Debug, Clone, Copy)]
pub struct ClassifiedIntent {
    pub intent: Intent,
    pub confidence: f64,
    /// True when the label came from the low-confidence default path
    pub degraded: bool,
}

pub struct IntentClassifier {
    llm: Arc<dyn LanguageModel>,
    threshold: f64,
}

impl IntentClassifier {
    pub fn new(llm: Arc<dyn LanguageModel>, threshold: f64) -> Self {
        Self { llm, threshold }
    }

    /// Classify a turn. Never fails: classification failure defaults to the
    /// Query path, which has the lower blast radius.
    pub async fn classify(&self, text: &str, recent_context: &str) -> ClassifiedIntent {
        if let Some(marker) = detect_complaint_marker(text) {
            tracing::debug!("complaint marker matched: {:?}", marker);
            return ClassifiedIntent {
                intent: Intent::Complaint,
                confidence: MARKER_CONFIDENCE,
                degraded: false,
            };
        }

        match self.llm.classify_intent(text, recent_context).await {
            Ok(result) if result.confidence >= self.threshold => ClassifiedIntent {
                intent: result.intent,
                confidence: result.confidence,
                degraded: false,
            },
            Ok(result) => {
                tracing::debug!(
                    "classification confidence {:.2} below threshold {:.2}, defaulting to query",
                    result.confidence,
                    self.threshold
                );
                ClassifiedIntent {
                    intent: Intent::Query,
                    confidence: result.confidence,
                    degraded: true,
                }
            }
            Err(e) => {
                tracing::warn!("intent classification failed, defaulting to query: {}", e);
                ClassifiedIntent {
                    intent: Intent::Query,
                    confidence: 0.0,
                    degraded: true,
                }
            }
        }
    }
}

/// Return the first complaint marker found in the text, if any
pub fn detect_complaint_marker(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    COMPLAINT_MARKERS
        .iter()
        .find(|marker| lower.contains(*marker))
        .copied()
}
