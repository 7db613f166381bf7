//! Response verification: rejects replies that repeat the previous one.
//!
//! The last accepted reply is remembered per channel. A candidate whose
//! similarity to it exceeds the threshold gets the configured action.
//! Verification fails open: any scorer error or timeout accepts.

pub mod similarity;

pub use similarity::{
    EmbeddingScorer, LlmJudgeScorer, SimilarityScorer, cosine_similarity, extract_similarity_score,
};

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{VerifierAction, VerifierConfig, VerifierMethod};
use crate::llm::{EmbeddingProvider, LlmProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Discard,
    Regenerate,
}

impl Verdict {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Discard => "discard",
            Self::Regenerate => "regenerate",
        }
    }
}

impl From<VerifierAction> for Verdict {
    fn from(action: VerifierAction) -> Self {
        match action {
            VerifierAction::Discard => Self::Discard,
            VerifierAction::Regenerate => Self::Regenerate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerificationOutcome {
    pub verdict: Verdict,
    /// Score that produced the verdict, when one was computed.
    pub similarity: Option<f64>,
}

impl VerificationOutcome {
    fn accept(similarity: Option<f64>) -> Self {
        Self {
            verdict: Verdict::Accept,
            similarity,
        }
    }
}

pub struct ResponseVerifier {
    config: VerifierConfig,
    scorer: Option<Arc<dyn SimilarityScorer>>,
    previous: Mutex<HashMap<String, String>>,
    /// One async lock per channel, held from reading the previous reply
    /// until the new one is recorded.
    channel_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ResponseVerifier {
    /// Select the scorer for the configured method. Verification is disabled
    /// when the method's provider is missing.
    pub fn new(
        config: VerifierConfig,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        judge: Option<Arc<dyn LlmProvider>>,
    ) -> Self {
        let scorer: Option<Arc<dyn SimilarityScorer>> = if !config.enabled {
            None
        } else {
            match config.method {
                VerifierMethod::Embedding => match embedder {
                    Some(embedder) => Some(Arc::new(EmbeddingScorer::new(embedder))),
                    None => {
                        error!("Embedding model not configured, similarity verification disabled");
                        None
                    }
                },
                VerifierMethod::Llm => match judge {
                    Some(judge) => Some(Arc::new(LlmJudgeScorer::new(judge))),
                    None => {
                        error!("Verifier model not configured, similarity verification disabled");
                        None
                    }
                },
            }
        };
        Self::with_scorer(config, scorer)
    }

    pub fn with_scorer(mut config: VerifierConfig, scorer: Option<Arc<dyn SimilarityScorer>>) -> Self {
        config.enabled = config.enabled && scorer.is_some();
        if let Some(scorer) = &scorer {
            info!(
                method = scorer.name(),
                threshold = config.similarity_threshold,
                action = ?config.action,
                "Response verifier enabled"
            );
        }
        Self {
            config,
            scorer,
            previous: Mutex::new(HashMap::new()),
            channel_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn set_previous_response(&self, channel_id: &str, response: &str) {
        self.previous
            .lock()
            .insert(channel_id.to_string(), response.to_string());
    }

    pub fn previous_response(&self, channel_id: &str) -> Option<String> {
        self.previous.lock().get(channel_id).cloned()
    }

    fn channel_lock(&self, channel_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.channel_locks.lock();
        Arc::clone(locks.entry(channel_id.to_string()).or_default())
    }

    /// Verifications for one channel run one at a time; different channels
    /// never wait on each other.
    pub async fn verify(&self, channel_id: &str, candidate: &str) -> VerificationOutcome {
        let lock = self.channel_lock(channel_id);
        let _turn = lock.lock().await;

        let previous = self.previous_response(channel_id);
        let (Some(scorer), Some(previous)) = (self.scorer.as_ref().filter(|_| self.config.enabled), previous)
        else {
            self.set_previous_response(channel_id, candidate);
            return VerificationOutcome::accept(None);
        };

        let scored = tokio::time::timeout(self.config.timeout, scorer.score(&previous, candidate)).await;
        let similarity = match scored {
            Ok(Ok(score)) => score,
            Ok(Err(e)) => {
                warn!(channel = %channel_id, error = %e, "Similarity check failed, accepting reply");
                self.set_previous_response(channel_id, candidate);
                return VerificationOutcome::accept(None);
            }
            Err(_) => {
                warn!(
                    channel = %channel_id,
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    "Similarity check timed out, accepting reply"
                );
                self.set_previous_response(channel_id, candidate);
                return VerificationOutcome::accept(None);
            }
        };

        if similarity > self.config.similarity_threshold {
            let verdict = Verdict::from(self.config.action);
            info!(
                channel = %channel_id,
                similarity,
                threshold = self.config.similarity_threshold,
                verdict = verdict.label(),
                "Reply too similar to the previous one"
            );
            return VerificationOutcome {
                verdict,
                similarity: Some(similarity),
            };
        }

        debug!(channel = %channel_id, similarity, "Reply accepted");
        self.set_previous_response(channel_id, candidate);
        VerificationOutcome::accept(Some(similarity))
    }
}
