//! LLM integration.
//!
//! - `provider`: the `LlmProvider` / `EmbeddingProvider` traits and request types
//! - `openai_compat`: reqwest adapter for any OpenAI-compatible endpoint
//! - `router`: standard/enhanced tier selection

pub mod openai_compat;
pub mod provider;
pub mod router;

pub use openai_compat::{OpenAiCompatProvider, ProviderConfig};
pub use provider::*;
pub use router::{ModelRouter, ModelTier, RoutingDecision, RoutingReason};

use std::sync::Arc;

use crate::error::{ConfigError, Error};

/// Providers for every role the engine may use. Only `standard` is required.
#[derive(Clone)]
pub struct ProviderSet {
    pub standard: Arc<dyn LlmProvider>,
    pub enhanced: Option<Arc<dyn LlmProvider>>,
    pub router: Option<Arc<dyn LlmProvider>>,
    pub verifier: Option<Arc<dyn LlmProvider>>,
    pub embedding: Option<Arc<dyn EmbeddingProvider>>,
}

impl ProviderSet {
    /// Build providers from `STANDARD_*`, `ENHANCED_*`, `ROUTER_*`,
    /// `VERIFIER_*` and `EMBEDDING_*` variables.
    pub fn from_env() -> Result<Self, Error> {
        let standard = ProviderConfig::from_env("STANDARD")?.ok_or_else(|| {
            ConfigError::MissingRequired {
                key: "STANDARD_MODEL".to_string(),
                hint: "Set STANDARD_MODEL (and STANDARD_BASE_URL / STANDARD_API_KEY)".to_string(),
            }
        })?;

        Ok(Self {
            standard: Arc::new(OpenAiCompatProvider::new(standard)?),
            enhanced: chat_provider("ENHANCED")?,
            router: chat_provider("ROUTER")?,
            verifier: chat_provider("VERIFIER")?,
            embedding: embedding_provider()?,
        })
    }
}

fn chat_provider(prefix: &str) -> Result<Option<Arc<dyn LlmProvider>>, Error> {
    match ProviderConfig::from_env(prefix)? {
        Some(config) => {
            let provider: Arc<dyn LlmProvider> = Arc::new(OpenAiCompatProvider::new(config)?);
            Ok(Some(provider))
        }
        None => Ok(None),
    }
}

fn embedding_provider() -> Result<Option<Arc<dyn EmbeddingProvider>>, Error> {
    match ProviderConfig::from_env("EMBEDDING")? {
        Some(config) => {
            let provider: Arc<dyn EmbeddingProvider> = Arc::new(OpenAiCompatProvider::new(config)?);
            Ok(Some(provider))
        }
        None => Ok(None),
    }
}

impl std::fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSet")
            .field("standard", &self.standard.model_name())
            .field("enhanced", &self.enhanced.as_ref().map(|p| p.model_name().to_string()))
            .field("router", &self.router.as_ref().map(|p| p.model_name().to_string()))
            .field("verifier", &self.verifier.as_ref().map(|p| p.model_name().to_string()))
            .field("embedding", &self.embedding.as_ref().map(|p| p.model_name().to_string()))
            .finish()
    }
}
