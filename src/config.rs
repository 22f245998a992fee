//! Configuration module for supportflow
//! Typed settings for retrieval, sessions, classification, and ticketing

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Hybrid retrieval settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Weight given to knowledge-index scores in the merge (history gets 1 - w)
    pub knowledge_weight: f64,
    /// Cosine similarity above which two results are treated as duplicates
    pub dedup_threshold: f64,
    /// How many knowledge chunks to request per query
    pub top_k_knowledge: usize,
    /// How many conversation records to request per query
    pub top_k_history: usize,
    /// Maximum merged results returned to the caller
    pub max_merged: usize,
    /// Per-index query timeout in milliseconds
    pub index_timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            knowledge_weight: 0.7,
            dedup_threshold: 0.95,
            top_k_knowledge: 5,
            top_k_history: 3,
            max_merged: 6,
            index_timeout_ms: 2_000,
        }
    }
}

impl RetrievalConfig {
    pub fn index_timeout(&self) -> Duration {
        Duration::from_millis(self.index_timeout_ms)
    }
}

/// Session lifetime and leasing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Inactivity window after which a session expires (seconds)
    pub ttl_secs: i64,
    /// Lease TTL for the single-writer lock (seconds)
    pub lease_ttl_secs: i64,
    /// How many times a turn is replayed after an optimistic-concurrency conflict
    pub max_conflict_retries: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 60 * 60,
            lease_ttl_secs: 30,
            max_conflict_retries: 3,
        }
    }
}

/// Ticket creation retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketRetryConfig {
    /// Maximum creation attempts before the ticket is marked Failed
    pub max_attempts: u32,
    /// Base delay for exponential backoff (milliseconds)
    pub base_delay_ms: u64,
    /// Jitter applied to each delay, as a fraction of the delay
    pub jitter: f64,
}

impl Default for TicketRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            jitter: 0.2,
        }
    }
}

impl TicketRetryConfig {
    /// Backoff delay for a given zero-based attempt: base * 2^attempt, jittered
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms.saturating_mul(1u64 << attempt.min(16));
        let jitter_span = (base as f64 * self.jitter) as i64;
        let offset = if jitter_span > 0 {
            use rand::Rng;
            rand::thread_rng().gen_range(-jitter_span..=jitter_span)
        } else {
            0
        };
        Duration::from_millis((base as i64 + offset).max(0) as u64)
    }
}

/// Top-level orchestrator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub retrieval: RetrievalConfig,
    pub session: SessionConfig,
    pub ticket_retry: TicketRetryConfig,
    /// Classification confidence below this routes to the Query path
    pub classifier_threshold: f64,
    /// Maximum turns processed concurrently across sessions
    pub worker_pool_size: usize,
}

impl OrchestratorConfig {
    /// Defaults suitable for production; tests shrink the timeouts
    pub fn standard() -> Self {
        Self {
            retrieval: RetrievalConfig::default(),
            session: SessionConfig::default(),
            ticket_retry: TicketRetryConfig::default(),
            classifier_threshold: 0.6,
            worker_pool_size: 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_weights() {
        let cfg = RetrievalConfig::default();
        assert!((cfg.knowledge_weight - 0.7).abs() < f64::EPSILON);
        assert!((cfg.dedup_threshold - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn test_backoff_is_exponential() {
        let cfg = TicketRetryConfig {
            max_attempts: 3,
            base_delay_ms: 100,
            jitter: 0.0,
        };
        assert_eq!(cfg.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(cfg.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(cfg.delay_for_attempt(2), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_jitter_stays_in_band() {
        let cfg = TicketRetryConfig {
            max_attempts: 3,
            base_delay_ms: 1000,
            jitter: 0.2,
        };
        for attempt in 0..3 {
            let base = 1000u64 << attempt;
            let d = cfg.delay_for_attempt(attempt).as_millis() as u64;
            assert!(d >= base - base / 5 && d <= base + base / 5);
        }
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let cfg = OrchestratorConfig::standard();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: OrchestratorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.worker_pool_size, cfg.worker_pool_size);
        assert_eq!(back.session.ttl_secs, cfg.session.ttl_secs);
    }
}
