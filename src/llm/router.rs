//! Standard/enhanced tier selection.
//!
//! Cheap heuristics run first; anything they cannot decide goes to a small
//! classifier model under a hard deadline. Every failure path lands on the
//! standard tier so routing can never fail a turn.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::RouterConfig;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::prompt::render_template;

/// Generation tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelTier {
    Standard,
    Enhanced,
}

impl ModelTier {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Enhanced => "enhanced",
        }
    }
}

/// How the tier was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingReason {
    Disabled,
    HeuristicShort,
    HeuristicCode,
    Classifier,
    /// Classifier timed out, failed, answered nonsense or is not configured.
    TimeoutFallback,
}

impl RoutingReason {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::HeuristicShort => "heuristic_short",
            Self::HeuristicCode => "heuristic_code",
            Self::Classifier => "classifier",
            Self::TimeoutFallback => "timeout_fallback",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingDecision {
    pub tier: ModelTier,
    pub reason: RoutingReason,
}

impl RoutingDecision {
    fn new(tier: ModelTier, reason: RoutingReason) -> Self {
        Self { tier, reason }
    }

    fn fallback() -> Self {
        Self::new(ModelTier::Standard, RoutingReason::TimeoutFallback)
    }
}

const CODE_FENCE: &str = "```";

pub struct ModelRouter {
    config: RouterConfig,
    classifier: Option<Arc<dyn LlmProvider>>,
}

impl ModelRouter {
    pub fn new(config: RouterConfig, classifier: Option<Arc<dyn LlmProvider>>) -> Self {
        if config.enabled && classifier.is_none() {
            warn!("Router enabled without a classifier model; undecided messages use the standard tier");
        }
        Self { config, classifier }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub async fn select_model(&self, last_user_message: &str) -> RoutingDecision {
        if !self.config.enabled {
            return RoutingDecision::new(ModelTier::Standard, RoutingReason::Disabled);
        }

        if self.config.latency_optimization {
            if let Some(decision) = self.heuristic(last_user_message) {
                debug!(tier = decision.tier.label(), reason = decision.reason.label(), "Routed by heuristic");
                return decision;
            }
        }

        let Some(classifier) = &self.classifier else {
            return RoutingDecision::fallback();
        };

        let prompt = render_template(
            &self.config.router_prompt,
            &[("lastUserMessage", last_user_message)],
        );
        let request = CompletionRequest::new(vec![ChatMessage::user(prompt)])
            .with_temperature(0.0)
            .with_max_tokens(8);

        match tokio::time::timeout(self.config.router_timeout, classifier.complete(request)).await {
            Ok(Ok(response)) => match parse_label(&response.content) {
                Some(tier) => {
                    debug!(tier = tier.label(), "Routed by classifier");
                    RoutingDecision::new(tier, RoutingReason::Classifier)
                }
                None => {
                    warn!(label = %response.content.trim(), "Unrecognized router label, using standard tier");
                    RoutingDecision::fallback()
                }
            },
            Ok(Err(e)) => {
                warn!(error = %e, "Router classifier failed, using standard tier");
                RoutingDecision::fallback()
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.config.router_timeout.as_millis() as u64,
                    "Router classifier timed out, using standard tier"
                );
                RoutingDecision::fallback()
            }
        }
    }

    fn heuristic(&self, message: &str) -> Option<RoutingDecision> {
        let threshold = self.config.short_message_threshold;
        if threshold > 0 && word_count(message) <= threshold {
            return Some(RoutingDecision::new(ModelTier::Standard, RoutingReason::HeuristicShort));
        }
        if self.config.code_block_triggers_enhanced && message.contains(CODE_FENCE) {
            return Some(RoutingDecision::new(ModelTier::Enhanced, RoutingReason::HeuristicCode));
        }
        None
    }
}

/// Whitespace-separated words, with every CJK ideograph counted on its own.
pub fn word_count(text: &str) -> usize {
    text.split_whitespace()
        .map(|token| {
            let cjk = token.chars().filter(|c| is_cjk(*c)).count();
            let has_other = token.chars().any(|c| !is_cjk(c));
            cjk + usize::from(has_other)
        })
        .sum()
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3040..=0x30FF       // kana
        | 0x3400..=0x4DBF     // CJK extension A
        | 0x4E00..=0x9FFF     // CJK unified
        | 0xAC00..=0xD7AF     // hangul
        | 0xF900..=0xFAFF
        | 0x20000..=0x2FA1F)
}

/// Parse a classifier answer such as `ENHANCED`, ` standard.` or `'Enhanced'`.
pub fn parse_label(raw: &str) -> Option<ModelTier> {
    let label = raw.trim().trim_matches(|c: char| !c.is_alphanumeric());
    if label.eq_ignore_ascii_case("standard") {
        Some(ModelTier::Standard)
    } else if label.eq_ignore_ascii_case("enhanced") {
        Some(ModelTier::Enhanced)
    } else {
        None
    }
}
