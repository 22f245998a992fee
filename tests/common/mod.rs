//! Common test utilities for supportflow integration tests
//!
//! Provides a test context wiring the decision engine to an in-memory
//! database, scripted language model, seeded vector indexes, and a
//! counting ticketing stub.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use supportflow::config::{OrchestratorConfig, RetrievalConfig, TicketRetryConfig};
use supportflow::db::Database;
use supportflow::engine::DecisionEngine;
use supportflow::llm::{
    IntentClassification, LanguageModel, LlmError, SynthesizedAnswer, ValidityJudgment,
};
use supportflow::notify::{Notifier, NotifyError};
use supportflow::policy::default_rules;
use supportflow::ticket::{Ticketing, TicketingError};
use supportflow::vector::{ChunkPayload, InMemoryIndex, VectorIndex};

/// Language model stub with scripted outputs. `None` for a capability
/// makes that call fail.
pub struct ScriptedModel {
    pub classification: Option<IntentClassification>,
    pub judgment: Option<ValidityJudgment>,
    pub answer: Option<SynthesizedAnswer>,
}

impl ScriptedModel {
    /// Confident query classification, valid judgment, grounded answer
    pub fn helpful() -> Self {
        Self {
            classification: Some(IntentClassification {
                intent: supportflow::llm::Intent::Query,
                confidence: 0.9,
            }),
            judgment: Some(ValidityJudgment {
                verdict: supportflow::llm::Verdict::Valid,
                reason: "actionable".into(),
            }),
            answer: Some(SynthesizedAnswer {
                text: "Reset your password from the self-service portal.".into(),
                cited_chunks: vec!["kb-password".into()],
            }),
        }
    }

    /// Like `helpful`, but synthesis produces no grounded citations
    pub fn ungrounded() -> Self {
        Self {
            answer: Some(SynthesizedAnswer {
                text: "Maybe just wait a while.".into(),
                cited_chunks: vec![],
            }),
            ..Self::helpful()
        }
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn classify_intent(
        &self,
        _text: &str,
        _context: &str,
    ) -> Result<IntentClassification, LlmError> {
        self.classification
            .ok_or_else(|| LlmError::Unavailable("classifier down".into()))
    }

    async fn judge_validity(
        &self,
        _text: &str,
        _context: &str,
        _rules: &[String],
    ) -> Result<ValidityJudgment, LlmError> {
        self.judgment
            .clone()
            .ok_or_else(|| LlmError::Unavailable("judge down".into()))
    }

    async fn synthesize_answer(
        &self,
        _text: &str,
        _context: &str,
    ) -> Result<SynthesizedAnswer, LlmError> {
        self.answer
            .clone()
            .ok_or_else(|| LlmError::Unavailable("synthesis down".into()))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        // Stable toy embedding, good enough to rank seeded chunks
        let len = text.len() as f32;
        let vowels = text.chars().filter(|c| "aeiou".contains(*c)).count() as f32;
        Ok(vec![len, vowels, 1.0])
    }
}

/// Ticketing stub: fails the first `fail_first` calls, counts all calls
pub struct CountingTicketing {
    pub calls: AtomicU32,
    fail_first: u32,
    error: fn() -> TicketingError,
}

impl CountingTicketing {
    pub fn ok() -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail_first: 0,
            error: || TicketingError::Timeout,
        }
    }

    pub fn failing(fail_first: u32, error: fn() -> TicketingError) -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail_first,
            error,
        }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Ticketing for CountingTicketing {
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

/// Notifier stub recording every sent message
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: parking_lot::Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, channel: &str, message: &str) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .push((channel.to_string(), message.to_string()));
        Ok(())
    }
}

/// Test context holding temporary resources and a wired engine
#[allow(dead_code)]
pub struct TestContext {
    pub temp_dir: TempDir,
    pub db: Database,
    pub db_path: PathBuf,
    pub knowledge: Arc<InMemoryIndex>,
    pub conversation: Arc<InMemoryIndex>,
    pub ticketing: Arc<CountingTicketing>,
    pub notifier: Arc<RecordingNotifier>,
    pub engine: DecisionEngine,
}

#[allow(dead_code)]
impl TestContext {
    pub async fn new(model: ScriptedModel) -> Result<Self, Box<dyn std::error::Error>> {
        Self::with_ticketing(model, CountingTicketing::ok()).await
    }

    pub async fn with_ticketing(
        model: ScriptedModel,
        ticketing: CountingTicketing,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let temp_dir = TempDir::new()?;
        let db_path = temp_dir.path().join("test.db");
        let db = Database::open(&db_path)?;
        db.initialize()?;

        let knowledge = Arc::new(InMemoryIndex::new());
        let conversation = Arc::new(InMemoryIndex::new());
        seed_knowledge(&knowledge).await?;

        let ticketing = Arc::new(ticketing);
        let notifier = Arc::new(RecordingNotifier::default());

        let config = OrchestratorConfig {
            retrieval: RetrievalConfig {
                index_timeout_ms: 500,
                ..RetrievalConfig::default()
            },
            ticket_retry: TicketRetryConfig {
                max_attempts: 3,
                base_delay_ms: 1,
                jitter: 0.0,
            },
            ..OrchestratorConfig::standard()
        };

        let engine = supportflow::build_engine(
            db.clone(),
            Arc::new(model),
            knowledge.clone(),
            conversation.clone(),
            ticketing.clone(),
            notifier.clone(),
            default_rules(),
            config,
        )?;

        Ok(Self {
            temp_dir,
            db,
            db_path,
            knowledge,
            conversation,
            ticketing,
            notifier,
            engine,
        })
    }
}

async fn seed_knowledge(
    index: &InMemoryIndex,
) -> Result<(), Box<dyn std::error::Error>> {
    index
        .upsert(
            "kb-password",
            vec![10.0, 4.0, 1.0],
            ChunkPayload {
                text: "Passwords are reset from the self-service portal.".into(),
                source_id: Some("account-guide".into()),
                section: Some("Passwords".into()),
                position: Some(1),
                ..Default::default()
            },
        )
        .await?;
    index
        .upsert(
            "kb-billing",
            vec![12.0, 5.0, 1.0],
            ChunkPayload {
                text: "Duplicate charges are corrected within five business days.".into(),
                source_id: Some("billing-guide".into()),
                section: Some("Refunds".into()),
                position: Some(2),
                ..Default::default()
            },
        )
        .await?;
    Ok(())
}
