//! Decision engine for supportflow
//! Drives each turn through an explicit state machine, persisting every
//! transition into the session record so a crashed worker leaves a
//! resumable trail instead of a half-applied turn.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::db::Database;
use crate::feedback::{self, FeedbackError, FeedbackRecord};
use crate::intent::IntentClassifier;
use crate::llm::{Intent, Verdict};
use crate::notify::{send_best_effort, Notifier};
use crate::policy::ValidityChecker;
use crate::resolution::{Resolution, ResolutionAttempter};
use crate::retrieval::{HybridRetriever, RankedContext, RetrievalError};
use crate::session::{
    InFlightTurn, MemoryStore, Modality, Session, SessionError, SessionKey, Turn, TurnOutcomeKind,
    TurnSummary,
};
use crate::summary::{self, ConversationRecord, SummaryError};
use crate::ticket::{issue_fingerprint, Ticket, TicketError, TicketOrchestrator, TicketStatus};

/// Turns of recent history fed to the classifier as context
const CLASSIFIER_CONTEXT_TURNS: usize = 3;

/// Words that make up bare acknowledgments of the previous response.
/// A reply built only from these closes the pending turn.
const ACK_VOCABULARY: &[&str] = &[
    "thanks", "thank", "you", "ok", "okay", "got", "it", "that", "works", "worked", "solved",
    "great", "perfect", "all", "good", "fixed",
];

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),
    #[error("Ticket error: {0}")]
    Ticket(#[from] TicketError),
    #[error("Summary error: {0}")]
    Summary(#[from] SummaryError),
    #[error("Feedback error: {0}")]
    Feedback(#[from] FeedbackError),
    #[error("Session {0} is busy with another turn")]
    SessionBusy(String),
    #[error("Turn cancelled")]
    Cancelled,
}

/// Cooperative cancellation flag, checked between transitions. Once a
/// terminal side effect (ticket creation) has started, the turn runs to
/// completion regardless.
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Where a turn stands in its lifecycle. Persisted with the session after
/// every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TurnState {
    Received,
    Classified { intent: Intent, degraded: bool },
    Retrieved { partial: bool },
    Answered,
    ValidityChecked { verdict: Verdict },
    Explaining { reason: String },
    Resolving,
    Resolved,
    Escalating { fingerprint: String },
    TicketEnsured { idempotency_key: String, failed: bool },
    FeedbackPending,
    Closed,
}

impl TurnState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// What the caller gets back for one processed turn
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub turn_id: String,
    pub response: String,
    pub intent: Intent,
    pub outcome: TurnOutcomeKind,
    /// External ticket id, when the turn escalated successfully
    pub ticket_id: Option<String>,
    /// Retrieval ran against one index only
    pub partial_context: bool,
    /// Classification fell back to the Query path
    pub degraded_classification: bool,
}

/// Orchestrates one turn end to end: classify, retrieve, then either
/// answer (query path) or validity-check, resolve, and escalate
/// (complaint path). Holds the session lease for the whole turn.
pub struct DecisionEngine {
    store: MemoryStore,
    retriever: HybridRetriever,
    classifier: IntentClassifier,
    validity: ValidityChecker,
    resolver: ResolutionAttempter,
    tickets: TicketOrchestrator,
    notifier: Arc<dyn Notifier>,
    db: Database,
    config: OrchestratorConfig,
    permits: Arc<Semaphore>,
    worker_id: String,
}

impl DecisionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: MemoryStore,
        retriever: HybridRetriever,
        classifier: IntentClassifier,
        validity: ValidityChecker,
        resolver: ResolutionAttempter,
        tickets: TicketOrchestrator,
        notifier: Arc<dyn Notifier>,
        db: Database,
        config: OrchestratorConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.worker_pool_size.max(1)));
        Self {
            store,
            retriever,
            classifier,
            validity,
            resolver,
            tickets,
            notifier,
            db,
            config,
            permits,
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }

    /// Process one normalized turn for a session. Rejects with
    /// `SessionBusy` when another worker holds the session lease.
    pub async fn handle_turn(
        &self,
        key: &SessionKey,
        text: &str,
        modality: Modality,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, EngineError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| EngineError::Cancelled)?;

        // Ensure the row exists before taking the lease
        self.store.get_or_create(key)?;
        // One lease owner per turn, so concurrent turns in the same
        // process also serialize
        let owner = format!("{}-{}", self.worker_id, Uuid::new_v4());
        if !self.store.acquire_lease(key, &owner)? {
            return Err(EngineError::SessionBusy(key.to_string()));
        }
        // Read the session only after the lease is ours
        let result = match self.store.get(key) {
            Ok(mut session) => self.run_turn(&mut session, text, modality, cancel).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = self.store.release_lease(key, &owner) {
            tracing::warn!("lease release for {} failed: {}", key, e);
        }
        result
    }

    async fn run_turn(
        &self,
        session: &mut Session,
        text: &str,
        modality: Modality,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, EngineError> {
        // A previous turn still waiting on feedback closes silently
        if let Some(stale) = session.in_flight.take() {
            tracing::debug!(
                "closing previous turn {} left in state {:?}",
                stale.turn.id,
                stale.state
            );
        }

        let mut turn = Turn::new(text, modality);
        self.set_state(session, &turn, TurnState::Received)?;

        if cancel.is_cancelled() {
            return self.abort(session);
        }

        let recent = recent_context(session);
        let classified = self.classifier.classify(&turn.text, &recent).await;
        turn.intent = Some(classified.intent);
        self.set_state(
            session,
            &turn,
            TurnState::Classified {
                intent: classified.intent,
                degraded: classified.degraded,
            },
        )?;

        if cancel.is_cancelled() {
            return self.abort(session);
        }

        let context = self
            .retriever
            .retrieve(&turn.text, Some(&session.key.user_id))
            .await?;
        self.set_state(
            session,
            &turn,
            TurnState::Retrieved {
                partial: context.partial,
            },
        )?;

        if cancel.is_cancelled() {
            return self.abort(session);
        }

        match classified.intent {
            Intent::Query => {
                self.answer_query(session, turn, &context, classified.degraded)
                    .await
            }
            Intent::Complaint => {
                self.handle_complaint(session, turn, &context, cancel, classified.degraded)
                    .await
            }
        }
    }

    /// Query path: synthesize an answer over the merged context. A failed
    /// synthesis still answers, with an honest fallback message.
    async fn answer_query(
        &self,
        session: &mut Session,
        mut turn: Turn,
        context: &RankedContext,
        degraded: bool,
    ) -> Result<TurnOutcome, EngineError> {
        let resolution = self.resolver.attempt(&turn.text, context).await;
        let response = match resolution {
            Resolution::Resolved(answer) => answer.text,
            Resolution::Unresolved { reason } => {
                tracing::debug!("query answer not grounded: {}", reason);
                "I couldn't find a reliable answer to that right now. \
                 Could you rephrase, or add more detail?"
                    .to_string()
            }
        };

        self.set_state(session, &turn, TurnState::Answered)?;
        turn.outcome = Some(TurnOutcomeKind::Answered);
        self.finish_turn(
            session,
            turn,
            response,
            None,
            TurnState::FeedbackPending,
            context.partial,
            degraded,
        )
    }

    /// Complaint path: validity check, then resolution, then escalation
    async fn handle_complaint(
        &self,
        session: &mut Session,
        mut turn: Turn,
        context: &RankedContext,
        cancel: &CancellationToken,
        degraded: bool,
    ) -> Result<TurnOutcome, EngineError> {
        let judgment = self.validity.check(&turn.text, context).await;
        self.set_state(
            session,
            &turn,
            TurnState::ValidityChecked {
                verdict: judgment.verdict,
            },
        )?;

        if judgment.verdict == Verdict::Invalid {
            let response = format!(
                "This doesn't appear to be an actionable issue: {}",
                judgment.reason
            );
            turn.outcome = Some(TurnOutcomeKind::ExplainedInvalid);
            // Parked in Explaining, not FeedbackPending: a persisting
            // reply escalates this complaint instead of starting over
            return self.finish_turn(
                session,
                turn,
                response,
                None,
                TurnState::Explaining {
                    reason: judgment.reason,
                },
                context.partial,
                degraded,
            );
        }

        self.set_state(session, &turn, TurnState::Resolving)?;
        match self.resolver.attempt(&turn.text, context).await {
            Resolution::Resolved(answer) => {
                self.set_state(session, &turn, TurnState::Resolved)?;
                turn.outcome = Some(TurnOutcomeKind::Resolved);
                self.finish_turn(
                    session,
                    turn,
                    answer.text,
                    None,
                    TurnState::FeedbackPending,
                    context.partial,
                    degraded,
                )
            }
            Resolution::Unresolved { reason } => {
                tracing::info!("complaint unresolved ({}), escalating", reason);
                self.escalate(session, turn, context, cancel, degraded).await
            }
        }
    }

    /// Escalation: ensure exactly one ticket for this issue. Cancellation
    /// is honored up to this point; once creation starts, the ticket is
    /// driven to a terminal status.
    async fn escalate(
        &self,
        session: &mut Session,
        mut turn: Turn,
        context: &RankedContext,
        cancel: &CancellationToken,
        degraded: bool,
    ) -> Result<TurnOutcome, EngineError> {
        if cancel.is_cancelled() {
            return self.abort(session);
        }

        let fingerprint = issue_fingerprint(&turn.text);
        self.set_state(
            session,
            &turn,
            TurnState::Escalating {
                fingerprint: fingerprint.clone(),
            },
        )?;

        let summary = escalation_summary(&turn.text);
        let description = escalation_description(&turn.text, context);
        let ticket = self
            .tickets
            .ensure_ticket(&session.key, &fingerprint, &summary, &description)
            .await?;
        self.set_state(
            session,
            &turn,
            TurnState::TicketEnsured {
                idempotency_key: ticket.idempotency_key.clone(),
                failed: ticket.status == TicketStatus::Failed,
            },
        )?;

        match ticket.status {
            TicketStatus::Failed => {
                turn.outcome = Some(TurnOutcomeKind::Failed);
                send_best_effort(
                    self.notifier.as_ref(),
                    "ops",
                    &format!(
                        "ticket creation exhausted for {} (issue {})",
                        session.key, fingerprint
                    ),
                )
                .await;
                let response = "I wasn't able to file your issue with our support team. \
                                The problem has been flagged internally; please try again later."
                    .to_string();
                self.finish_turn(
                    session,
                    turn,
                    response,
                    None,
                    TurnState::FeedbackPending,
                    context.partial,
                    degraded,
                )
            }
            _ => {
                session.active_ticket = Some(ticket.idempotency_key.clone());
                turn.outcome = Some(TurnOutcomeKind::Escalated);
                self.notify_user_of_ticket(&session.key, &ticket).await;
                let response = match &ticket.external_id {
                    Some(ext) => format!(
                        "I've escalated this to our support team as ticket {ext}. \
                         You'll be notified as it progresses."
                    ),
                    None => "I've escalated this to our support team. \
                             You'll be notified as it progresses."
                        .to_string(),
                };
                let ticket_id = ticket.external_id.clone();
                self.finish_turn(
                    session,
                    turn,
                    response,
                    ticket_id,
                    TurnState::FeedbackPending,
                    context.partial,
                    degraded,
                )
            }
        }
    }

    async fn notify_user_of_ticket(&self, key: &SessionKey, ticket: &Ticket) {
        let message = match &ticket.external_id {
            Some(ext) => format!("Your support ticket {ext} has been created."),
            None => "Your support ticket has been created.".to_string(),
        };
        send_best_effort(self.notifier.as_ref(), &key.user_id, &message).await;
    }

    /// Append the turn summary, park the turn in `parked` awaiting the
    /// user's reply, and log the delivered response
    #[allow(clippy::too_many_arguments)]
    fn finish_turn(
        &self,
        session: &mut Session,
        turn: Turn,
        response: String,
        ticket_id: Option<String>,
        parked: TurnState,
        partial_context: bool,
        degraded_classification: bool,
    ) -> Result<TurnOutcome, EngineError> {
        session.turns.push(TurnSummary::from_turn(&turn));
        session.in_flight = Some(InFlightTurn {
            turn: turn.clone(),
            state: parked,
        });
        self.persist(session)?;

        let intent = turn.intent.unwrap_or(Intent::Query);
        feedback::log_response(&self.db, &session.key, &turn.id, &turn.text, &response, intent)?;

        let outcome = turn.outcome.unwrap_or(TurnOutcomeKind::Answered);
        Ok(TurnOutcome {
            turn_id: turn.id,
            response,
            intent,
            outcome,
            ticket_id,
            partial_context,
            degraded_classification,
        })
    }

    /// Handle a follow-up reply. A bare acknowledgment closes the pending
    /// turn and produces no new outcome. When the pending turn was an
    /// explained-invalid complaint, a persisting reply escalates that
    /// original complaint; otherwise anything substantive is a new turn.
    pub async fn handle_reply(
        &self,
        key: &SessionKey,
        text: &str,
        modality: Modality,
        cancel: &CancellationToken,
    ) -> Result<Option<TurnOutcome>, EngineError> {
        let parked = match self.store.get(key) {
            Ok(session) => session.in_flight,
            Err(SessionError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };

        if is_acknowledgment(text) {
            self.close_parked_turn(key)?;
            return Ok(None);
        }

        if let Some(in_flight) = parked {
            if matches!(in_flight.state, TurnState::Explaining { .. }) {
                tracing::info!(
                    "user persists after explanation of turn {}, escalating",
                    in_flight.turn.id
                );
                return self
                    .escalate_persisting(key, in_flight.turn, cancel)
                    .await
                    .map(Some);
            }
        }

        self.handle_turn(key, text, modality, cancel).await.map(Some)
    }

    fn close_parked_turn(&self, key: &SessionKey) -> Result<(), EngineError> {
        let mut session = match self.store.get(key) {
            Ok(s) => s,
            Err(SessionError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if let Some(closed) = session.in_flight.take() {
            tracing::debug!("turn {} acknowledged and closed", closed.turn.id);
            self.persist(&mut session)?;
        }
        Ok(())
    }

    /// The user pushed back on an invalid-complaint explanation. Escalate
    /// the original complaint: the ticket fingerprints the complaint the
    /// user first reported, not the wording of the reply.
    async fn escalate_persisting(
        &self,
        key: &SessionKey,
        original: Turn,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, EngineError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| EngineError::Cancelled)?;

        let owner = format!("{}-{}", self.worker_id, Uuid::new_v4());
        if !self.store.acquire_lease(key, &owner)? {
            return Err(EngineError::SessionBusy(key.to_string()));
        }
        let result = match self.store.get(key) {
            Ok(mut session) => {
                let mut turn = Turn::new(original.text.clone(), original.modality);
                turn.intent = Some(Intent::Complaint);
                match self
                    .retriever
                    .retrieve(&turn.text, Some(&session.key.user_id))
                    .await
                {
                    Ok(context) => {
                        self.escalate(&mut session, turn, &context, cancel, false)
                            .await
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = self.store.release_lease(key, &owner) {
            tracing::warn!("lease release for {} failed: {}", key, e);
        }
        result
    }

    /// Record user feedback for the turn parked in FeedbackPending, then
    /// close it
    pub fn record_feedback(
        &self,
        key: &SessionKey,
        turn_id: &str,
        rating: i32,
        comment: Option<&str>,
    ) -> Result<FeedbackRecord, EngineError> {
        let record = feedback::submit_feedback(&self.db, turn_id, rating, comment)?;

        let mut session = self.store.get(key)?;
        let pending = session
            .in_flight
            .as_ref()
            .is_some_and(|f| f.turn.id == turn_id);
        if pending {
            session.in_flight = None;
            self.persist(&mut session)?;
        }
        Ok(record)
    }

    /// Explicit session close: summarize into the conversation index, then
    /// remove the session
    pub async fn close_session(
        &self,
        key: &SessionKey,
    ) -> Result<Option<ConversationRecord>, EngineError> {
        let mut session = match self.store.get(key) {
            Ok(s) => s,
            Err(SessionError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record = summary::summarize_on_close(
            self.retriever.llm(),
            self.retriever.conversation_index(),
            &session,
        )
        .await?;
        if record.is_some() {
            session.summarized = true;
            self.persist(&mut session)?;
        }
        self.store.remove(key)?;
        Ok(record)
    }

    /// Close every session past its inactivity TTL. Returns the closed keys.
    pub async fn sweep_expired(&self) -> Result<Vec<SessionKey>, EngineError> {
        let stale = self.store.stale_keys()?;
        for key in &stale {
            if let Err(e) = self.close_session(key).await {
                tracing::warn!("close of expired session {} failed: {}", key, e);
            }
        }
        Ok(stale)
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn tickets(&self) -> &TicketOrchestrator {
        &self.tickets
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    fn set_state(
        &self,
        session: &mut Session,
        turn: &Turn,
        state: TurnState,
    ) -> Result<(), EngineError> {
        session.in_flight = Some(InFlightTurn {
            turn: turn.clone(),
            state,
        });
        self.persist(session)
    }

    /// Cancelled before any terminal side effect: drop the in-flight turn
    fn abort(&self, session: &mut Session) -> Result<TurnOutcome, EngineError> {
        session.in_flight = None;
        self.persist(session)?;
        Err(EngineError::Cancelled)
    }

    /// Persist with bounded conflict replay. We hold the session lease, so
    /// a conflict means the version advanced under us without a competing
    /// turn; adopt the fresh version and rewrite our state.
    fn persist(&self, session: &mut Session) -> Result<(), EngineError> {
        let mut attempts = 0;
        loop {
            match self.store.put(session) {
                Ok(stored) => {
                    *session = stored;
                    return Ok(());
                }
                Err(SessionError::Conflict { .. })
                    if attempts < self.config.session.max_conflict_retries =>
                {
                    attempts += 1;
                    let fresh = self.store.get(&session.key)?;
                    session.version = fresh.version;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// The last few turn briefs, oldest first, for classifier context
fn recent_context(session: &Session) -> String {
    let skip = session.turns.len().saturating_sub(CLASSIFIER_CONTEXT_TURNS);
    session
        .turns
        .iter()
        .skip(skip)
        .map(|t| t.brief.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

fn is_acknowledgment(text: &str) -> bool {
    let lower = text.to_lowercase();
    let mut tokens = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .peekable();
    if tokens.peek().is_none() {
        return false;
    }
    tokens.all(|t| ACK_VOCABULARY.contains(&t))
}

fn escalation_summary(complaint_text: &str) -> String {
    let mut summary: String = complaint_text.chars().take(80).collect();
    if complaint_text.chars().count() > 80 {
        summary.push('…');
    }
    summary
}

fn escalation_description(complaint_text: &str, context: &RankedContext) -> String {
    if context.is_empty() {
        format!("Reported issue:\n{complaint_text}")
    } else {
        format!(
            "Reported issue:\n{complaint_text}\n\nRelated context:\n{}",
            context.format_context()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::session::Modality;

    #[test]
    fn test_turn_state_serde_round_trip() {
        let states = vec![
            TurnState::Received,
            TurnState::Classified {
                intent: Intent::Complaint,
                degraded: false,
            },
            TurnState::Retrieved { partial: true },
            TurnState::Explaining {
                reason: "out of warranty".into(),
            },
            TurnState::Escalating {
                fingerprint: "abc".into(),
            },
            TurnState::TicketEnsured {
                idempotency_key: "key".into(),
                failed: false,
            },
            TurnState::FeedbackPending,
            TurnState::Closed,
        ];
        for state in states {
            let json = serde_json::to_string(&state).unwrap();
            let back: TurnState = serde_json::from_str(&json).unwrap();
            assert_eq!(back, state);
        }
    }

    #[test]
    fn test_only_closed_is_terminal() {
        assert!(TurnState::Closed.is_terminal());
        assert!(!TurnState::FeedbackPending.is_terminal());
        assert!(!TurnState::Received.is_terminal());
    }

    #[test]
    fn test_cancellation_token_latches() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_recent_context_keeps_last_three() {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        let store = MemoryStore::new(db, SessionConfig::default());
        let key = SessionKey::new("alice", "s1");
        let mut session = store.get_or_create(&key).unwrap();

        for i in 0..5 {
            let turn = Turn::new(format!("turn {i}"), Modality::Text);
            session.turns.push(TurnSummary::from_turn(&turn));
        }

        let recent = recent_context(&session);
        assert_eq!(recent, "turn 2\nturn 3\nturn 4");
    }

    #[test]
    fn test_acknowledgment_detection() {
        assert!(is_acknowledgment("thanks, that worked!"));
        assert!(is_acknowledgment("  OK  "));
        assert!(!is_acknowledgment("ok but now the vpn is down again"));
        assert!(!is_acknowledgment("my invoice still shows a double charge"));
    }

    #[test]
    fn test_escalation_summary_truncates() {
        let long = "x".repeat(200);
        let summary = escalation_summary(&long);
        assert_eq!(summary.chars().count(), 81);
        assert!(summary.ends_with('…'));
    }
}
