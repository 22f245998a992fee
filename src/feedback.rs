//! Feedback collection for supportflow
//! Logs delivered responses per turn and collects append-only user ratings,
//! with aggregate stats per intent.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError};
use crate::llm::Intent;
use crate::session::SessionKey;

#[derive(Debug, Error)]
pub enum FeedbackError {
    #[error("Database error: {0}")]
    Db(#[from] DbError),
    #[error("No logged response for turn {0}")]
    UnknownTurn(String),
}

/// A delivered query/response pair, keyed by turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryLog {
    pub id: String,
    pub turn_id: String,
    pub user_id: String,
    pub session_id: String,
    pub query: String,
    pub response: String,
    pub intent: Intent,
    pub created_at: String,
}

/// User feedback on a delivered response. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub id: String,
    pub turn_id: String,
    pub rating: i32,
    pub comment: Option<String>,
    pub created_at: String,
}

/// Aggregate stats
#[derive(Debug, Clone, Serialize)]
pub struct FeedbackStats {
    pub total_responses: usize,
    pub total_feedback: usize,
    pub average_rating: f64,
    pub by_intent: Vec<IntentStat>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntentStat {
    pub intent: String,
    pub response_count: usize,
    pub feedback_count: usize,
    pub average_rating: f64,
}

/// Record a delivered response for a turn
pub fn log_response(
    db: &Database,
    key: &SessionKey,
    turn_id: &str,
    query: &str,
    response: &str,
    intent: Intent,
) -> Result<String, FeedbackError> {
    let id = Uuid::new_v4().to_string();
    db.with_conn(|c| {
        c.execute(
            "INSERT INTO query_logs (id, turn_id, user_id, session_id, query, response, intent, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                id,
                turn_id,
                key.user_id,
                key.session_id,
                query,
                response,
                intent.to_string(),
                Utc::now().to_rfc3339()
            ],
        )
    })?;
    Ok(id)
}

/// Record user feedback for a turn. Ratings clamp to 1..=5; the turn must
/// have a logged response.
pub fn submit_feedback(
    db: &Database,
    turn_id: &str,
    rating: i32,
    comment: Option<&str>,
) -> Result<FeedbackRecord, FeedbackError> {
    let exists: bool = db.with_conn(|c| {
        c.query_row(
            "SELECT COUNT(*) > 0 FROM query_logs WHERE turn_id = ?1",
            rusqlite::params![turn_id],
            |row| row.get(0),
        )
    })?;
    if !exists {
        return Err(FeedbackError::UnknownTurn(turn_id.to_string()));
    }

    let record = FeedbackRecord {
        id: Uuid::new_v4().to_string(),
        turn_id: turn_id.to_string(),
        rating: rating.clamp(1, 5),
        comment: comment.map(|c| c.to_string()),
        created_at: Utc::now().to_rfc3339(),
    };
    db.with_conn(|c| {
        c.execute(
            "INSERT INTO feedback (id, turn_id, rating, comment, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                record.id,
                record.turn_id,
                record.rating,
                record.comment,
                record.created_at
            ],
        )
    })?;
    Ok(record)
}

/// Feedback entries for one turn, newest first
pub fn feedback_for_turn(db: &Database, turn_id: &str) -> Result<Vec<FeedbackRecord>, FeedbackError> {
    let records = db.with_conn(|c| {
        let mut stmt = c.prepare(
            "SELECT id, turn_id, rating, comment, created_at
             FROM feedback WHERE turn_id = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![turn_id], |row| {
                Ok(FeedbackRecord {
                    id: row.get(0)?,
                    turn_id: row.get(1)?,
                    rating: row.get(2)?,
                    comment: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })?;
    Ok(records)
}

/// Aggregate stats across all responses and feedback
pub fn stats(db: &Database) -> Result<FeedbackStats, FeedbackError> {
    let total_responses: usize =
        db.with_conn(|c| c.query_row("SELECT COUNT(*) FROM query_logs", [], |row| row.get(0)))?;
    let total_feedback: usize =
        db.with_conn(|c| c.query_row("SELECT COUNT(*) FROM feedback", [], |row| row.get(0)))?;

    let average_rating: f64 = if total_feedback > 0 {
        db.with_conn(|c| {
            c.query_row("SELECT AVG(rating) FROM feedback", [], |row| row.get(0))
        })?
    } else {
        0.0
    };

    let by_intent = db.with_conn(|c| {
        let mut stmt = c.prepare(
            "SELECT
                q.intent,
                COUNT(DISTINCT q.id) AS response_count,
                COUNT(f.id) AS feedback_count,
                COALESCE(AVG(f.rating), 0) AS average_rating
             FROM query_logs q
             LEFT JOIN feedback f ON f.turn_id = q.turn_id
             GROUP BY q.intent
             ORDER BY response_count DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(IntentStat {
                    intent: row.get(0)?,
                    response_count: row.get(1)?,
                    feedback_count: row.get(2)?,
                    average_rating: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })?;

    Ok(FeedbackStats {
        total_responses,
        total_feedback,
        average_rating,
        by_intent,
    })
}
