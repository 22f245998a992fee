//! Ticket orchestration for supportflow
//! One ticket per distinct unresolved issue per session, enforced by an
//! idempotency key derived from the session key and issue fingerprint.
//! Creation retries use exponential backoff; exhausted tickets go Failed
//! and stay Failed until manually re-triggered.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::TicketRetryConfig;
use crate::db::{Database, DbError};
use crate::session::SessionKey;

static NON_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

#[derive(Debug, Error)]
pub enum TicketError {
    #[error("Database error: {0}")]
    Db(#[from] DbError),
    #[error("Ticket not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum TicketingError {
    #[error("Authentication failed - check your API token")]
    AuthFailed,
    #[error("Rate limited - try again later")]
    RateLimited,
    #[error("Request timeout")]
    Timeout,
    #[error("API error: {0}")]
    Api(String),
    #[error("Connection failed: {0}")]
    Connection(String),
}

impl TicketingError {
    /// Auth failures and client errors never succeed on retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::Timeout | Self::Api(_) | Self::Connection(_)
        )
    }
}

/// External ticketing backend. Treated as at-least-once from our side;
/// exactly-once observed externally via the idempotency key. Adapters do
/// not retry internally: retries live in the orchestrator, gated by the
/// idempotency key.
#[async_trait]
pub trait Ticketing: Send + Sync {
    async fn create_issue(
        &self,
        summary: &str,
        description: &str,
        metadata: serde_json::Value,
    ) -> Result<String, TicketingError>;

    async fn get_status(&self, external_id: &str) -> Result<String, TicketingError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    Pending,
    Created,
    Failed,
}

impl TicketStatus {
    /// Pending and Created count against the one-open-ticket invariant
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Created)
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Created => write!(f, "created"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for TicketStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "created" => Ok(Self::Created),
            "failed" => Ok(Self::Failed),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub idempotency_key: String,
    pub user_id: String,
    pub session_id: String,
    pub fingerprint: String,
    pub external_id: Option<String>,
    pub status: TicketStatus,
    pub summary: String,
    pub description: String,
    pub attempts: u32,
    pub created_at: String,
    pub updated_at: String,
}

/// Stable fingerprint of a complaint: lowercase, strip punctuation and
/// whitespace runs, hash. Repeated reports of the same issue map to one
/// fingerprint regardless of phrasing noise.
pub fn issue_fingerprint(complaint_text: &str) -> String {
    let lower = complaint_text.to_lowercase();
    let normalized = NON_WORD.replace_all(&lower, " ");
    let normalized = normalized.trim();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

/// Idempotency key binding a fingerprint to one session
pub fn idempotency_key(key: &SessionKey, fingerprint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.user_id.as_bytes());
    hasher.update(b"/");
    hasher.update(key.session_id.as_bytes());
    hasher.update(b"#");
    hasher.update(fingerprint.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct TicketOrchestrator {
    db: Database,
    backend: Arc<dyn Ticketing>,
    retry: TicketRetryConfig,
}

impl TicketOrchestrator {
    pub fn new(db: Database, backend: Arc<dyn Ticketing>, retry: TicketRetryConfig) -> Self {
        Self { db, backend, retry }
    }

    /// Ensure exactly one ticket exists for (session, fingerprint).
    /// Created tickets are returned unchanged; Pending tickets resume their
    /// creation attempts; Failed tickets stay Failed (manual re-trigger via
    /// `retry_failed`). Exhausted attempts yield a Failed ticket, not an Err.
    pub async fn ensure_ticket(
        &self,
        key: &SessionKey,
        fingerprint: &str,
        summary: &str,
        description: &str,
    ) -> Result<Ticket, TicketError> {
        let idem = idempotency_key(key, fingerprint);

        let ticket = match self.find(&idem)? {
            Some(existing) => match existing.status {
                TicketStatus::Created => return Ok(existing),
                TicketStatus::Failed => {
                    tracing::debug!(
                        "ticket {} already failed after {} attempts, not retrying",
                        idem,
                        existing.attempts
                    );
                    return Ok(existing);
                }
                TicketStatus::Pending => existing,
            },
            None => {
                let now = Utc::now().to_rfc3339();
                let ticket = Ticket {
                    idempotency_key: idem.clone(),
                    user_id: key.user_id.clone(),
                    session_id: key.session_id.clone(),
                    fingerprint: fingerprint.to_string(),
                    external_id: None,
                    status: TicketStatus::Pending,
                    summary: summary.to_string(),
                    description: description.to_string(),
                    attempts: 0,
                    created_at: now.clone(),
                    updated_at: now,
                };
                self.insert(&ticket)?;
                ticket
            }
        };

        self.drive_creation(ticket).await
    }

    /// Manual re-trigger for a Failed ticket: resets to Pending and runs a
    /// fresh attempt budget
    pub async fn retry_failed(
        &self,
        key: &SessionKey,
        fingerprint: &str,
    ) -> Result<Ticket, TicketError> {
        let idem = idempotency_key(key, fingerprint);
        let mut ticket = self
            .find(&idem)?
            .ok_or_else(|| TicketError::NotFound(idem.clone()))?;
        if ticket.status != TicketStatus::Failed {
            return Ok(ticket);
        }
        ticket.status = TicketStatus::Pending;
        ticket.attempts = 0;
        self.update(&ticket)?;
        self.drive_creation(ticket).await
    }

    /// Run creation attempts for a Pending ticket until success, a
    /// non-retryable error, or the attempt ceiling
    async fn drive_creation(&self, mut ticket: Ticket) -> Result<Ticket, TicketError> {
        while ticket.attempts < self.retry.max_attempts {
            let metadata = serde_json::json!({
                "user_id": ticket.user_id,
                "session_id": ticket.session_id,
                "fingerprint": ticket.fingerprint,
                "idempotency_key": ticket.idempotency_key,
            });

            let attempt = ticket.attempts;
            ticket.attempts += 1;

            match self
                .backend
                .create_issue(&ticket.summary, &ticket.description, metadata)
                .await
            {
                Ok(external_id) => {
                    tracing::info!(
                        "ticket {} created as {} on attempt {}",
                        ticket.idempotency_key,
                        external_id,
                        ticket.attempts
                    );
                    ticket.external_id = Some(external_id);
                    ticket.status = TicketStatus::Created;
                    self.update(&ticket)?;
                    return Ok(ticket);
                }
                Err(e) => {
                    tracing::warn!(
                        "ticket creation attempt {} failed: {}",
                        ticket.attempts,
                        e
                    );
                    self.update(&ticket)?;

                    if !e.is_retryable() {
                        break;
                    }
                    if ticket.attempts < self.retry.max_attempts {
                        tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                    }
                }
            }
        }

        ticket.status = TicketStatus::Failed;
        self.update(&ticket)?;
        tracing::warn!(
            "ticket {} marked failed after {} attempts",
            ticket.idempotency_key,
            ticket.attempts
        );
        Ok(ticket)
    }

    pub fn find(&self, idempotency_key: &str) -> Result<Option<Ticket>, TicketError> {
        let row = self.db.with_conn(|c| {
            c.query_row(
                "SELECT idempotency_key, user_id, session_id, fingerprint, external_id,
                        status, summary, description, attempts, created_at, updated_at
                 FROM tickets WHERE idempotency_key = ?1",
                rusqlite::params![idempotency_key],
                row_to_ticket,
            )
        });
        match row {
            Ok(ticket) => Ok(Some(ticket)),
            Err(DbError::Sqlite(rusqlite::Error::QueryReturnedNoRows)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// The open (Pending or Created) ticket for a session, if any
    pub fn open_ticket_for_session(
        &self,
        key: &SessionKey,
    ) -> Result<Option<Ticket>, TicketError> {
        let row = self.db.with_conn(|c| {
            c.query_row(
                "SELECT idempotency_key, user_id, session_id, fingerprint, external_id,
                        status, summary, description, attempts, created_at, updated_at
                 FROM tickets
                 WHERE user_id = ?1 AND session_id = ?2 AND status IN ('pending', 'created')
                 ORDER BY created_at DESC LIMIT 1",
                rusqlite::params![key.user_id, key.session_id],
                row_to_ticket,
            )
        });
        match row {
            Ok(ticket) => Ok(Some(ticket)),
            Err(DbError::Sqlite(rusqlite::Error::QueryReturnedNoRows)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn insert(&self, ticket: &Ticket) -> Result<(), TicketError> {
        self.db.with_conn(|c| {
            c.execute(
                "INSERT INTO tickets
                     (idempotency_key, user_id, session_id, fingerprint, external_id,
                      status, summary, description, attempts, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT (idempotency_key) DO NOTHING",
                rusqlite::params![
                    ticket.idempotency_key,
                    ticket.user_id,
                    ticket.session_id,
                    ticket.fingerprint,
                    ticket.external_id,
                    ticket.status.to_string(),
                    ticket.summary,
                    ticket.description,
                    ticket.attempts,
                    ticket.created_at,
                    ticket.updated_at
                ],
            )
        })?;
        Ok(())
    }

    fn update(&self, ticket: &Ticket) -> Result<(), TicketError> {
        self.db.with_conn(|c| {
            c.execute(
                "UPDATE tickets
                 SET external_id = ?1, status = ?2, attempts = ?3, updated_at = ?4
                 WHERE idempotency_key = ?5",
                rusqlite::params![
                    ticket.external_id,
                    ticket.status.to_string(),
                    ticket.attempts,
                    Utc::now().to_rfc3339(),
                    ticket.idempotency_key
                ],
            )
        })?;
        Ok(())
    }
}

fn row_to_ticket(row: &rusqlite::Row<'_>) -> rusqlite::Result<Ticket> {
    let status_raw: String = row.get(5)?;
    Ok(Ticket {
        idempotency_key: row.get(0)?,
        user_id: row.get(1)?,
        session_id: row.get(2)?,
        fingerprint: row.get(3)?,
        external_id: row.get(4)?,
        status: status_raw.parse().unwrap_or(TicketStatus::Failed),
        summary: row.get(6)?,
        description: row.get(7)?,
        attempts: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

/// REST ticketing adapter. Single-shot requests: auth errors and rate
/// limits map to their own variants, 5xx maps to a retryable Api error.
pub struct RestTicketing {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl RestTicketing {
    pub fn new(base_url: &str, token: &str, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn map_status(status: reqwest::StatusCode, body: String) -> TicketingError {
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            TicketingError::AuthFailed
        } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            TicketingError::RateLimited
        } else {
            TicketingError::Api(format!("HTTP {status}: {body}"))
        }
    }

    fn map_request_error(e: reqwest::Error) -> TicketingError {
        if e.is_timeout() {
            TicketingError::Timeout
        } else {
            TicketingError::Connection(e.to_string())
        }
    }
}

#[async_trait]
impl Ticketing for RestTicketing {
    async fn create_issue(
        &self,
        summary: &str,
        description: &str,
        metadata: serde_json::Value,
    ) -> Result<String, TicketingError> {
        let url = format!("{}/api/issues", self.base_url);
        let body = serde_json::json!({
            "summary": summary,
            "description": description,
            "metadata": metadata,
        });

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(Self::map_request_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_status(status, body));
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| TicketingError::Api(format!("invalid response body: {e}")))?;
        json["id"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| TicketingError::Api("response missing issue id".into()))
    }

    async fn get_status(&self, external_id: &str) -> Result<String, TicketingError> {
        let url = format!("{}/api/issues/{}/status", self.base_url, external_id);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(Self::map_request_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_status(status, body));
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| TicketingError::Api(format!("invalid response body: {e}")))?;
        json["status"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| TicketingError::Api("response missing status".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Backend stub: fails the first `fail_first` calls, counts all calls
    struct CountingBackend {
        calls: AtomicU32,
        fail_first: u32,
        error: fn() -> TicketingError,
    }

    impl CountingBackend {
        fn ok() -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first: 0,
                error: || TicketingError::Timeout,
            }
        }

        fn failing(fail_first: u32, error: fn() -> TicketingError) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first,
                error,
            }
        }
    }

    #[async_trait]
    impl Ticketing for CountingBackend {
        async fn create_issue(
            &self,
            _summary: &str,
            _description: &str,
            _metadata: serde_json::Value,
        ) -> Result<String, TicketingError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err((self.error)())
            } else {
                Ok(format!("EXT-{}", n + 1))
            }
        }

        async fn get_status(&self, _external_id: &str) -> Result<String, TicketingError> {
            Ok("open".into())
        }
    }

    fn orchestrator(backend: Arc<CountingBackend>) -> TicketOrchestrator {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        TicketOrchestrator::new(
            db,
            backend,
            TicketRetryConfig {
                max_attempts: 3,
                base_delay_ms: 1,
                jitter: 0.0,
            },
        )
    }

    #[test]
    fn test_fingerprint_ignores_case_and_punctuation() {
        let a = issue_fingerprint("My invoice shows DOUBLE charge!!");
        let b = issue_fingerprint("my invoice   shows double charge");
        assert_eq!(a, b);

        let c = issue_fingerprint("my password reset email never arrives");
        assert_ne!(a, c);
    }

    #[test]
    fn test_idempotency_key_binds_session() {
        let fp = issue_fingerprint("double charge");
        let k1 = idempotency_key(&SessionKey::new("alice", "s1"), &fp);
        let k2 = idempotency_key(&SessionKey::new("alice", "s2"), &fp);
        assert_ne!(k1, k2);
        assert_eq!(k1, idempotency_key(&SessionKey::new("alice", "s1"), &fp));
    }

    #[tokio::test]
    async fn test_ensure_ticket_creates_once() {
        let backend = Arc::new(CountingBackend::ok());
        let orch = orchestrator(backend.clone());
        let key = SessionKey::new("alice", "s1");
        let fp = issue_fingerprint("double charge");

        let first = orch
            .ensure_ticket(&key, &fp, "Double charge", "Invoice shows double charge")
            .await
            .unwrap();
        assert_eq!(first.status, TicketStatus::Created);
        let ext = first.external_id.clone().unwrap();

        let second = orch
            .ensure_ticket(&key, &fp, "Double charge", "Invoice shows double charge")
            .await
            .unwrap();
        assert_eq!(second.external_id.as_deref(), Some(ext.as_str()));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retryable_failures_then_success() {
        let backend = Arc::new(CountingBackend::failing(2, || TicketingError::Timeout));
        let orch = orchestrator(backend.clone());
        let key = SessionKey::new("alice", "s1");
        let fp = issue_fingerprint("vpn down");

        let ticket = orch
            .ensure_ticket(&key, &fp, "VPN down", "details")
            .await
            .unwrap();
        assert_eq!(ticket.status, TicketStatus::Created);
        assert_eq!(ticket.attempts, 3);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_fail_without_fourth_try() {
        let backend = Arc::new(CountingBackend::failing(u32::MAX, || {
            TicketingError::Timeout
        }));
        let orch = orchestrator(backend.clone());
        let key = SessionKey::new("alice", "s1");
        let fp = issue_fingerprint("vpn down");

        let ticket = orch
            .ensure_ticket(&key, &fp, "VPN down", "details")
            .await
            .unwrap();
        assert_eq!(ticket.status, TicketStatus::Failed);
        assert_eq!(ticket.attempts, 3);

        // Failed tickets are not retried automatically
        let again = orch
            .ensure_ticket(&key, &fp, "VPN down", "details")
            .await
            .unwrap();
        assert_eq!(again.status, TicketStatus::Failed);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_retried() {
        let backend = Arc::new(CountingBackend::failing(u32::MAX, || {
            TicketingError::AuthFailed
        }));
        let orch = orchestrator(backend.clone());
        let key = SessionKey::new("alice", "s1");
        let fp = issue_fingerprint("vpn down");

        let ticket = orch
            .ensure_ticket(&key, &fp, "VPN down", "details")
            .await
            .unwrap();
        assert_eq!(ticket.status, TicketStatus::Failed);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_failed_resets_budget() {
        let backend = Arc::new(CountingBackend::failing(3, || TicketingError::Timeout));
        let orch = orchestrator(backend.clone());
        let key = SessionKey::new("alice", "s1");
        let fp = issue_fingerprint("vpn down");

        let failed = orch
            .ensure_ticket(&key, &fp, "VPN down", "details")
            .await
            .unwrap();
        assert_eq!(failed.status, TicketStatus::Failed);

        let retried = orch.retry_failed(&key, &fp).await.unwrap();
        assert_eq!(retried.status, TicketStatus::Created);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_distinct_fingerprints_get_distinct_tickets() {
        let backend = Arc::new(CountingBackend::ok());
        let orch = orchestrator(backend.clone());
        let key = SessionKey::new("alice", "s1");

        let t1 = orch
            .ensure_ticket(&key, &issue_fingerprint("double charge"), "a", "a")
            .await
            .unwrap();
        let t2 = orch
            .ensure_ticket(&key, &issue_fingerprint("vpn down"), "b", "b")
            .await
            .unwrap();
        assert_ne!(t1.idempotency_key, t2.idempotency_key);
        assert_ne!(t1.external_id, t2.external_id);
    }

    #[tokio::test]
    async fn test_open_ticket_for_session() {
        let backend = Arc::new(CountingBackend::ok());
        let orch = orchestrator(backend);
        let key = SessionKey::new("alice", "s1");

        assert!(orch.open_ticket_for_session(&key).unwrap().is_none());
        orch.ensure_ticket(&key, &issue_fingerprint("double charge"), "a", "a")
            .await
            .unwrap();
        let open = orch.open_ticket_for_session(&key).unwrap().unwrap();
        assert!(open.status.is_open());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            TicketStatus::Pending,
            TicketStatus::Created,
            TicketStatus::Failed,
        ] {
            let parsed: TicketStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("unknown".parse::<TicketStatus>().is_err());
    }
}
