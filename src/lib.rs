//! supportflow - Support-interaction orchestrator: intent routing, hybrid
//! retrieval, versioned session memory, and idempotent ticket escalation

pub mod config;
pub mod db;
pub mod engine;
pub mod feedback;
pub mod intent;
pub mod llm;
pub mod notify;
pub mod policy;
pub mod resolution;
pub mod retrieval;
pub mod session;
pub mod summary;
pub mod ticket;
pub mod vector;

use std::sync::Arc;

use crate::config::OrchestratorConfig;
use crate::db::Database;
use crate::engine::DecisionEngine;
use crate::intent::IntentClassifier;
use crate::llm::LanguageModel;
use crate::notify::Notifier;
use crate::policy::{PolicyError, PolicyRule, ValidityChecker};
use crate::resolution::ResolutionAttempter;
use crate::retrieval::HybridRetriever;
use crate::session::MemoryStore;
use crate::ticket::{TicketOrchestrator, Ticketing};
use crate::vector::VectorIndex;

/// Wire a decision engine from its external capabilities. Fails only when
/// a policy rule pattern does not compile.
#[allow(clippy::too_many_arguments)]
pub fn build_engine(
    db: Database,
    llm: Arc<dyn LanguageModel>,
    knowledge: Arc<dyn VectorIndex>,
    conversation: Arc<dyn VectorIndex>,
    ticketing: Arc<dyn Ticketing>,
    notifier: Arc<dyn Notifier>,
    rules: Vec<PolicyRule>,
    config: OrchestratorConfig,
) -> Result<DecisionEngine, PolicyError> {
    let store = MemoryStore::new(db.clone(), config.session.clone());
    let retriever = HybridRetriever::new(
        llm.clone(),
        knowledge,
        conversation,
        config.retrieval.clone(),
    );
    let classifier = IntentClassifier::new(llm.clone(), config.classifier_threshold);
    let validity = ValidityChecker::new(llm.clone(), rules)?;
    let resolver = ResolutionAttempter::new(llm);
    let tickets = TicketOrchestrator::new(db.clone(), ticketing, config.ticket_retry.clone());

    Ok(DecisionEngine::new(
        store, retriever, classifier, validity, resolver, tickets, notifier, db, config,
    ))
}
