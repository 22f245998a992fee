//! Session-close summarization for supportflow
//! Turns a closing session's turn summaries into one ConversationRecord in
//! the conversation index. Deferred and idempotent: the record id derives
//! from the session key, so a retried close upserts the same record.

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::llm::{Intent, LanguageModel, LlmError};
use crate::session::Session;
use crate::vector::{ChunkPayload, VectorError, VectorIndex};

#[derive(Debug, Error)]
pub enum SummaryError {
    #[error("Embedding failed: {0}")]
    Llm(#[from] LlmError),
    #[error("Conversation index error: {0}")]
    Vector(#[from] VectorError),
}

/// Record derived from a closed session; read-only once written
#[derive(Debug, Clone, Serialize)]
pub struct ConversationRecord {
    pub id: String,
    pub text: String,
    pub user_id: String,
    pub session_id: String,
    pub label: String,
}

/// Deterministic record id for a session
pub fn record_id(session: &Session) -> String {
    let mut hasher = Sha256::new();
    hasher.update(session.key.user_id.as_bytes());
    hasher.update(b"/");
    hasher.update(session.key.session_id.as_bytes());
    format!("conv-{}", &hex::encode(hasher.finalize())[..32])
}

/// Build the summarized text and label from the session's turn summaries
pub fn summarize_session(session: &Session) -> ConversationRecord {
    let mut lines = Vec::with_capacity(session.turns.len());
    let mut complaints = 0usize;
    let mut queries = 0usize;

    for turn in &session.turns {
        match turn.intent {
            Some(Intent::Complaint) => complaints += 1,
            Some(Intent::Query) => queries += 1,
            None => {}
        }
        let outcome = turn
            .outcome
            .map(|o| format!("{o:?}").to_lowercase())
            .unwrap_or_else(|| "open".to_string());
        lines.push(format!("[{}] {}", outcome, turn.brief));
    }

    let label = match (complaints, queries) {
        (0, _) => "query",
        (_, 0) => "complaint",
        _ => "mixed",
    };

    ConversationRecord {
        id: record_id(session),
        text: lines.join("\n"),
        user_id: session.key.user_id.clone(),
        session_id: session.key.session_id.clone(),
        label: label.to_string(),
    }
}

/// Summarize a session into the conversation index. Returns None when the
/// session has no turns or was already summarized.
pub async fn summarize_on_close(
    llm: &dyn LanguageModel,
    conversation_index: &dyn VectorIndex,
    session: &Session,
) -> Result<Option<ConversationRecord>, SummaryError> {
    if session.summarized || session.turns.is_empty() {
        return Ok(None);
    }

    let record = summarize_session(session);
    let vector = llm.embed(&record.text).await?;
    let payload = ChunkPayload {
        text: record.text.clone(),
        user_id: Some(record.user_id.clone()),
        session_id: Some(record.session_id.clone()),
        label: Some(record.label.clone()),
        timestamp: Some(Utc::now()),
        ..Default::default()
    };
    conversation_index
        .upsert(&record.id, vector, payload)
        .await?;

    tracing::info!("summarized session {} into {}", session.key, record.id);
    Ok(Some(record))
}
