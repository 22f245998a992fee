//! Hybrid retrieval module for supportflow
//! Merges knowledge-index and conversation-index hits into one ranked
//! context, degrading gracefully when one index fails or times out

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::time::timeout;

use crate::config::RetrievalConfig;
use crate::llm::{LanguageModel, LlmError};
use crate::vector::{QueryFilter, ScoredHit, VectorIndex};

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("Query embedding failed: {0}")]
    Embedding(#[from] LlmError),
}

/// Which index a merged item came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextOrigin {
    Knowledge,
    History,
}

/// One item of merged, ranked context
#[derive(Debug, Clone, Serialize)]
pub struct ContextItem {
    pub chunk_id: String,
    pub text: String,
    pub score: f64,
    pub origin: ContextOrigin,
    pub source_id: Option<String>,
    pub section: Option<String>,
    position: Option<u32>,
    timestamp: Option<chrono::DateTime<chrono::Utc>>,
}

/// Ranked context handed to classification, validity judgment, and answer
/// synthesis. `partial` is set when one index failed or timed out.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RankedContext {
    pub items: Vec<ContextItem>,
    pub partial: bool,
}

impl RankedContext {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn chunk_ids(&self) -> Vec<String> {
        self.items.iter().map(|i| i.chunk_id.clone()).collect()
    }

    /// Format items as a numbered context block for prompt injection
    pub fn format_context(&self) -> String {
        self.items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let source = match item.origin {
                    ContextOrigin::Knowledge => item
                        .source_id
                        .clone()
                        .unwrap_or_else(|| "knowledge base".to_string()),
                    ContextOrigin::History => "prior conversation".to_string(),
                };
                let section = item.section.as_deref().unwrap_or("Document");
                format!(
                    "[Source {} ({}): {} > {}]\n{}\n",
                    i + 1,
                    item.chunk_id,
                    source,
                    section,
                    item.text
                )
            })
            .collect::<Vec<_>>()
            .join("\n---\n")
    }
}

/// Hybrid retriever over the two vector collections
pub struct HybridRetriever {
    llm: Arc<dyn LanguageModel>,
    knowledge: Arc<dyn VectorIndex>,
    conversation: Arc<dyn VectorIndex>,
    config: RetrievalConfig,
}

impl HybridRetriever {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        knowledge: Arc<dyn VectorIndex>,
        conversation: Arc<dyn VectorIndex>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            llm,
            knowledge,
            conversation,
            config,
        }
    }

    pub fn llm(&self) -> &dyn LanguageModel {
        self.llm.as_ref()
    }

    pub fn conversation_index(&self) -> &dyn VectorIndex {
        self.conversation.as_ref()
    }

    /// Retrieve merged context for a query. `user_filter` scopes the
    /// conversation index to one user for personalization.
    pub async fn retrieve(
        &self,
        query_text: &str,
        user_filter: Option<&str>,
    ) -> Result<RankedContext, RetrievalError> {
        let vector = self.llm.embed(query_text).await?;

        let filter = user_filter.map(|u| QueryFilter {
            user_id: Some(u.to_string()),
        });
        let per_index = self.config.index_timeout();

        let (knowledge_res, history_res) = tokio::join!(
            timeout(
                per_index,
                self.knowledge
                    .query(&vector, self.config.top_k_knowledge, None)
            ),
            timeout(
                per_index,
                self.conversation
                    .query(&vector, self.config.top_k_history, filter.as_ref())
            ),
        );

        let knowledge_hits = match knowledge_res {
            Ok(Ok(hits)) => Some(hits),
            Ok(Err(e)) => {
                tracing::warn!("knowledge index query failed: {}", e);
                None
            }
            Err(_) => {
                tracing::warn!("knowledge index query timed out");
                None
            }
        };
        let history_hits = match history_res {
            Ok(Ok(hits)) => Some(hits),
            Ok(Err(e)) => {
                tracing::warn!("conversation index query failed: {}", e);
                None
            }
            Err(_) => {
                tracing::warn!("conversation index query timed out");
                None
            }
        };

        let partial = knowledge_hits.is_none() || history_hits.is_none();
        let mut context = merge(
            knowledge_hits.unwrap_or_default(),
            history_hits.unwrap_or_default(),
            &self.config,
        );
        context.partial = partial;
        Ok(context)
    }
}

/// Merge two result batches. Deterministic given identical inputs:
/// min-max normalize per batch, weight, drop near-duplicate text keeping the
/// higher-scored item, order by combined score with recency tie-break for
/// history items and document order for knowledge items.
pub fn merge(
    knowledge: Vec<ScoredHit>,
    history: Vec<ScoredHit>,
    config: &RetrievalConfig,
) -> RankedContext {
    let w = config.knowledge_weight;
    let mut items: Vec<ContextItem> = Vec::with_capacity(knowledge.len() + history.len());

    for (hit, norm) in normalize(&knowledge) {
        items.push(to_item(hit, norm * w, ContextOrigin::Knowledge));
    }
    for (hit, norm) in normalize(&history) {
        items.push(to_item(hit, norm * (1.0 - w), ContextOrigin::History));
    }

    items.sort_by(compare_items);

    // Near-duplicate suppression: earlier (higher-scored) items win
    let mut kept: Vec<ContextItem> = Vec::with_capacity(items.len());
    for item in items {
        let duplicate = kept
            .iter()
            .any(|k| text_similarity(&k.text, &item.text) >= config.dedup_threshold);
        if !duplicate {
            kept.push(item);
        }
    }

    kept.truncate(config.max_merged);
    RankedContext {
        items: kept,
        partial: false,
    }
}

fn to_item(hit: &ScoredHit, score: f64, origin: ContextOrigin) -> ContextItem {
    ContextItem {
        chunk_id: hit.id.clone(),
        text: hit.payload.text.clone(),
        score,
        origin,
        source_id: hit.payload.source_id.clone(),
        section: hit.payload.section.clone(),
        position: hit.payload.position,
        timestamp: hit.payload.timestamp,
    }
}

/// Min-max normalization within one batch; a single-item or flat batch maps
/// to 1.0 so it still participates in the weighted merge
fn normalize(hits: &[ScoredHit]) -> Vec<(&ScoredHit, f64)> {
    if hits.is_empty() {
        return Vec::new();
    }
    let min = hits.iter().map(|h| h.score).fold(f64::INFINITY, f64::min);
    let max = hits
        .iter()
        .map(|h| h.score)
        .fold(f64::NEG_INFINITY, f64::max);
    let span = max - min;
    hits.iter()
        .map(|h| {
            let norm = if span <= f64::EPSILON {
                1.0
            } else {
                (h.score - min) / span
            };
            (h, norm)
        })
        .collect()
}

fn compare_items(a: &ContextItem, b: &ContextItem) -> Ordering {
    match b.score.partial_cmp(&a.score) {
        Some(Ordering::Equal) | None => {}
        Some(other) => return other,
    }
    match (a.origin, b.origin) {
        // More recent history wins
        (ContextOrigin::History, ContextOrigin::History) => b.timestamp.cmp(&a.timestamp),
        // Document order preserved for knowledge
        (ContextOrigin::Knowledge, ContextOrigin::Knowledge) => a.position.cmp(&b.position),
        // Mixed tie: knowledge first
        (ContextOrigin::Knowledge, ContextOrigin::History) => Ordering::Less,
        (ContextOrigin::History, ContextOrigin::Knowledge) => Ordering::Greater,
    }
}

/// Token-set similarity over normalized words. Stands in for embedding
/// cosine on merged items, whose vectors stay behind the index interface.
fn text_similarity(a: &str, b: &str) -> f64 {
    let set_a: HashSet<String> = tokens(a);
    let set_b: HashSet<String> = tokens(b);
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }
    let intersection = set_a.intersection(&set_b).count() as f64;
    let union = set_a.union(&set_b).count() as f64;
    intersection / union
}

fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}
