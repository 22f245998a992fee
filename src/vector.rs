//! Vector store interface for supportflow
//! Two logical collections sit behind this trait: product knowledge and
//! prior-conversation records. Chunk ingestion happens upstream; the core
//! only queries, plus upserts conversation summaries at session close.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VectorError {
    #[error("Invalid id: {0}")]
    InvalidId(String),
    #[error("Vector dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("Index unavailable: {0}")]
    Unavailable(String),
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Payload stored alongside a vector. Knowledge chunks fill `source_id`,
/// `section` and `position`; conversation records fill `user_id`,
/// `session_id`, `label` and `timestamp`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub text: String,
    pub source_id: Option<String>,
    pub section: Option<String>,
    /// Chunk ordinal within its source document
    pub position: Option<u32>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub label: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// One similarity hit, score in [0, 1] (cosine)
#[derive(Debug, Clone, Serialize)]
pub struct ScoredHit {
    pub id: String,
    pub score: f64,
    pub payload: ChunkPayload,
}

/// Optional query filter; currently only per-user scoping for
/// conversation-history personalization
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub user_id: Option<String>,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(
        &self,
        id: &str,
        vector: Vec<f32>,
        payload: ChunkPayload,
    ) -> Result<(), VectorError>;

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&QueryFilter>,
    ) -> Result<Vec<ScoredHit>, VectorError>;
}

/// Validate an id for storage. Allowlist only: ASCII alphanumeric, hyphens,
/// underscores, max 256 chars. Rejects rather than sanitizes.
pub fn validate_id(id: &str) -> Result<&str, VectorError> {
    if id.is_empty() || id.len() > 256 {
        return Err(VectorError::InvalidId(id.to_string()));
    }
    if id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        Ok(id)
    } else {
        Err(VectorError::InvalidId(id.to_string()))
    }
}

/// Cosine similarity of two vectors; 0.0 when either norm is zero
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// In-memory cosine index for tests and local deployments
#[derive(Default)]
pub struct InMemoryIndex {
    entries: parking_lot::RwLock<HashMap<String, (Vec<f32>, ChunkPayload)>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn upsert(
        &self,
        id: &str,
        vector: Vec<f32>,
        payload: ChunkPayload,
    ) -> Result<(), VectorError> {
        let id = validate_id(id)?;
        if let Some((existing, _)) = self.entries.read().values().next() {
            if existing.len() != vector.len() {
                return Err(VectorError::DimensionMismatch {
                    expected: existing.len(),
                    got: vector.len(),
                });
            }
        }
        self.entries
            .write()
            .insert(id.to_string(), (vector, payload));
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&QueryFilter>,
    ) -> Result<Vec<ScoredHit>, VectorError> {
        let entries = self.entries.read();
        let mut hits: Vec<ScoredHit> = entries
            .iter()
            .filter(|(_, (_, payload))| match filter.and_then(|f| f.user_id.as_deref()) {
                Some(user) => payload.user_id.as_deref() == Some(user),
                None => true,
            })
            .map(|(id, (vec, payload))| ScoredHit {
                id: id.clone(),
                score: cosine_similarity(vector, vec),
                payload: payload.clone(),
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }
}
