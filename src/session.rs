//! Session memory store for supportflow
//! Versioned, TTL-bounded session state with optimistic concurrency and
//! per-session leases. Sessions change only through this store.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::db::{Database, DbError};
use crate::engine::TurnState;
use crate::llm::Intent;

/// Maximum characters of turn text kept in a summary
const SUMMARY_TEXT_LIMIT: usize = 200;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Database error: {0}")]
    Db(#[from] DbError),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Version conflict: session advanced past version {expected}")]
    Conflict { expected: i64 },
    #[error("Session lease held by another worker")]
    LeaseHeld,
    #[error("Corrupt timestamp in session row: {0}")]
    BadTimestamp(String),
}

/// Session identity: user id plus session id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub user_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.user_id, self.session_id)
    }
}

/// Input modality of a normalized turn (pre-processing happens upstream)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Voice,
    Document,
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Voice => write!(f, "voice"),
            Self::Document => write!(f, "document"),
        }
    }
}

/// How a turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcomeKind {
    Answered,
    Resolved,
    Escalated,
    ExplainedInvalid,
    Failed,
}

/// One user interaction. Immutable once persisted; append-only per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub text: String,
    pub modality: Modality,
    pub timestamp: DateTime<Utc>,
    pub intent: Option<Intent>,
    pub outcome: Option<TurnOutcomeKind>,
}

impl Turn {
    pub fn new(text: impl Into<String>, modality: Modality) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            modality,
            timestamp: Utc::now(),
            intent: None,
            outcome: None,
        }
    }
}

/// Bounded turn summary kept in the session record (full transcripts are
/// not retained, to bound growth)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnSummary {
    pub turn_id: String,
    pub brief: String,
    pub intent: Option<Intent>,
    pub outcome: Option<TurnOutcomeKind>,
    pub timestamp: DateTime<Utc>,
}

impl TurnSummary {
    pub fn from_turn(turn: &Turn) -> Self {
        let brief = if turn.text.chars().count() > SUMMARY_TEXT_LIMIT {
            turn.text.chars().take(SUMMARY_TEXT_LIMIT).collect()
        } else {
            turn.text.clone()
        };
        Self {
            turn_id: turn.id.clone(),
            brief,
            intent: turn.intent,
            outcome: turn.outcome,
            timestamp: turn.timestamp,
        }
    }
}

/// A turn whose state machine has not reached Closed yet; persisted so a
/// crash mid-flow resumes from the last transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InFlightTurn {
    pub turn: Turn,
    pub state: TurnState,
}

/// Body persisted as the session's data column
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SessionData {
    turns: Vec<TurnSummary>,
    active_ticket: Option<String>,
    in_flight: Option<InFlightTurn>,
    summarized: bool,
}

/// Versioned session record. Mutations go through `MemoryStore::put`, which
/// rejects writes against a stale version.
#[derive(Debug, Clone)]
pub struct Session {
    pub key: SessionKey,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub ttl_secs: i64,
    pub turns: Vec<TurnSummary>,
    /// Idempotency key of the ticket open for this session, if any
    pub active_ticket: Option<String>,
    pub in_flight: Option<InFlightTurn>,
    /// Set once the session has been summarized into the conversation index
    pub summarized: bool,
}

impl Session {
    fn data(&self) -> SessionData {
        SessionData {
            turns: self.turns.clone(),
            active_ticket: self.active_ticket.clone(),
            in_flight: self.in_flight.clone(),
            summarized: self.summarized,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.last_activity + Duration::seconds(self.ttl_secs) < now
    }
}

/// Durable, keyed session state with expiry
#[derive(Clone)]
pub struct MemoryStore {
    db: Database,
    config: SessionConfig,
}

impl MemoryStore {
    pub fn new(db: Database, config: SessionConfig) -> Self {
        Self { db, config }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Fetch a session, or `SessionError::NotFound`
    pub fn get(&self, key: &SessionKey) -> Result<Session, SessionError> {
        let row: Result<(i64, String, String, i64, String), DbError> = self.db.with_conn(|c| {
            c.query_row(
                "SELECT version, created_at, last_activity, ttl_secs, data
                 FROM sessions WHERE user_id = ?1 AND session_id = ?2",
                rusqlite::params![key.user_id, key.session_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
        });

        match row {
            Ok((version, created_at, last_activity, ttl_secs, data)) => {
                let data: SessionData = serde_json::from_str(&data)?;
                Ok(Session {
                    key: key.clone(),
                    version,
                    created_at: parse_ts(&created_at)?,
                    last_activity: parse_ts(&last_activity)?,
                    ttl_secs,
                    turns: data.turns,
                    active_ticket: data.active_ticket,
                    in_flight: data.in_flight,
                    summarized: data.summarized,
                })
            }
            Err(DbError::Sqlite(rusqlite::Error::QueryReturnedNoRows)) => {
                Err(SessionError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch a session, creating a fresh one if none exists
    pub fn get_or_create(&self, key: &SessionKey) -> Result<Session, SessionError> {
        match self.get(key) {
            Ok(session) => Ok(session),
            Err(SessionError::NotFound(_)) => self.create(key),
            Err(e) => Err(e),
        }
    }

    fn create(&self, key: &SessionKey) -> Result<Session, SessionError> {
        let now = Utc::now();
        let session = Session {
            key: key.clone(),
            version: 0,
            created_at: now,
            last_activity: now,
            ttl_secs: self.config.ttl_secs,
            turns: Vec::new(),
            active_ticket: None,
            in_flight: None,
            summarized: false,
        };
        let data = serde_json::to_string(&session.data())?;
        self.db.with_conn(|c| {
            c.execute(
                "INSERT INTO sessions
                     (user_id, session_id, version, created_at, last_activity, ttl_secs, data)
                 VALUES (?1, ?2, 0, ?3, ?4, ?5, ?6)
                 ON CONFLICT (user_id, session_id) DO NOTHING",
                rusqlite::params![
                    key.user_id,
                    key.session_id,
                    now.to_rfc3339(),
                    now.to_rfc3339(),
                    self.config.ttl_secs,
                    data
                ],
            )
        })?;
        // Another worker may have created it first; re-read for the truth
        self.get(key)
    }

    /// Full replace, guarded by the caller's version stamp. On success the
    /// returned session carries the advanced version.
    pub fn put(&self, session: &Session) -> Result<Session, SessionError> {
        let data = serde_json::to_string(&session.data())?;
        let now = Utc::now();
        let updated = self.db.with_conn(|c| {
            c.execute(
                "UPDATE sessions
                 SET version = version + 1, last_activity = ?1, data = ?2
                 WHERE user_id = ?3 AND session_id = ?4 AND version = ?5",
                rusqlite::params![
                    now.to_rfc3339(),
                    data,
                    session.key.user_id,
                    session.key.session_id,
                    session.version
                ],
            )
        })?;

        if updated == 0 {
            // Row missing entirely is NotFound; a present row means the
            // version advanced under us
            return match self.get(&session.key) {
                Ok(_) => Err(SessionError::Conflict {
                    expected: session.version,
                }),
                Err(e) => Err(e),
            };
        }

        let mut stored = session.clone();
        stored.version += 1;
        stored.last_activity = now;
        Ok(stored)
    }

    /// Append a turn summary, reloading and retrying on version conflicts
    pub fn append_turn(&self, key: &SessionKey, summary: TurnSummary) -> Result<Session, SessionError> {
        let mut attempts = 0;
        loop {
            let mut session = self.get(key)?;
            session.turns.push(summary.clone());
            match self.put(&session) {
                Ok(stored) => return Ok(stored),
                Err(SessionError::Conflict { .. })
                    if attempts < self.config.max_conflict_retries =>
                {
                    attempts += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Acquire the single-writer lease for a session. Succeeds when the
    /// lease is free, already held by `owner`, or expired (crashed worker).
    pub fn acquire_lease(&self, key: &SessionKey, owner: &str) -> Result<bool, SessionError> {
        let now = Utc::now();
        let expires = now + Duration::seconds(self.config.lease_ttl_secs);
        let updated = self.db.with_conn(|c| {
            c.execute(
                "UPDATE sessions
                 SET lease_owner = ?1, lease_expires_at = ?2
                 WHERE user_id = ?3 AND session_id = ?4
                   AND (lease_owner IS NULL
                        OR lease_owner = ?1
                        OR lease_expires_at < ?5)",
                rusqlite::params![
                    owner,
                    expires.to_rfc3339(),
                    key.user_id,
                    key.session_id,
                    now.to_rfc3339()
                ],
            )
        })?;
        Ok(updated > 0)
    }

    /// Release a lease held by `owner`; a no-op if someone else holds it
    pub fn release_lease(&self, key: &SessionKey, owner: &str) -> Result<(), SessionError> {
        self.db.with_conn(|c| {
            c.execute(
                "UPDATE sessions
                 SET lease_owner = NULL, lease_expires_at = NULL
                 WHERE user_id = ?1 AND session_id = ?2 AND lease_owner = ?3",
                rusqlite::params![key.user_id, key.session_id, owner],
            )
        })?;
        Ok(())
    }

    /// Keys of sessions inactive past their TTL, without removing them.
    /// Callers that need close side effects read the session before removal.
    pub fn stale_keys(&self) -> Result<Vec<SessionKey>, SessionError> {
        let now = Utc::now();
        let rows: Vec<(String, String, String, i64)> = self.db.with_conn(|c| {
            let mut stmt = c.prepare(
                "SELECT user_id, session_id, last_activity, ttl_secs FROM sessions",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        let mut expired = Vec::new();
        for (user_id, session_id, last_activity, ttl_secs) in rows {
            let last = parse_ts(&last_activity)?;
            if last + Duration::seconds(ttl_secs) < now {
                expired.push(SessionKey::new(user_id, session_id));
            }
        }
        Ok(expired)
    }

    /// Remove sessions inactive past their TTL. Returns the removed keys so
    /// callers can run session-close side effects.
    pub fn expire_stale(&self) -> Result<Vec<SessionKey>, SessionError> {
        let expired = self.stale_keys()?;
        for key in &expired {
            self.remove(key)?;
            tracing::info!("expired stale session {}", key);
        }
        Ok(expired)
    }

    /// Delete a session (explicit close or expiry)
    pub fn remove(&self, key: &SessionKey) -> Result<(), SessionError> {
        self.db.with_conn(|c| {
            c.execute(
                "DELETE FROM sessions WHERE user_id = ?1 AND session_id = ?2",
                rusqlite::params![key.user_id, key.session_id],
            )
        })?;
        Ok(())
    }
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, SessionError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| SessionError::BadTimestamp(raw.to_string()))
}
