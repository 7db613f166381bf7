//! Configuration types.
//!
//! Every struct has a `Default` matching the stock bot settings and a
//! `from_env()` loader. Loading never touches the network or the filesystem.

pub(crate) mod helpers;

use std::time::Duration;

use crate::error::ConfigError;
use helpers::{
    optional_env, parse_bool_env, parse_millis_env, parse_option_env, parse_optional_env,
    parse_secs_env, split_list,
};

/// Default system prompt for reply generation.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are {{botName}}, an ordinary member of a group chat. \
Read the recent conversation and write the next message you would send. \
Reply in the language of the conversation, keep it short and natural, and never mention that you are an AI.";

/// Default prompt for the tier classifier. Must contain `{{lastUserMessage}}`.
pub const DEFAULT_ROUTER_PROMPT: &str = "You are a request router. Your task is to classify the user's request into one of two categories: 'STANDARD' or 'ENHANCED'.
- 'STANDARD' is for simple, everyday conversation, greetings, or short questions.
- 'ENHANCED' is for requests that require deep thinking, creativity, code generation, complex analysis, or multi-step planning.
Analyze the following user request and respond with ONLY ONE WORD: 'STANDARD' or 'ENHANCED'.
User Request: {{lastUserMessage}}";

/// How a channel that matches several slots is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotPolicy {
    /// Only the first slot (in configured order) containing the channel applies.
    #[default]
    FirstMatch,
    /// Every matching slot evaluates the message independently.
    AllMatches,
}

impl std::str::FromStr for SlotPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "first_match" | "first-match" | "first" => Ok(Self::FirstMatch),
            "all_matches" | "all-matches" | "all" => Ok(Self::AllMatches),
            other => Err(format!("unknown slot policy '{other}'")),
        }
    }
}

/// Count and time thresholds that govern when a slot replies.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerThresholds {
    /// Messages needed before the slot's very first reply.
    pub first_trigger_count: u32,
    /// Pending messages that force a reply even during cooldown.
    pub max_trigger_count: u32,
    /// Messages needed between two replies.
    pub min_trigger_count: u32,
    /// Silence after which an idle prompt fires. Zero disables.
    pub max_trigger_time: Duration,
    /// Cooldown after a reply; triggers arriving inside it are dropped.
    pub min_trigger_time: Duration,
    /// Probability of replying immediately to an at-mention.
    pub at_react_possibility: f64,
}

impl Default for TriggerThresholds {
    fn default() -> Self {
        Self {
            first_trigger_count: 3,
            max_trigger_count: 10,
            min_trigger_count: 1,
            max_trigger_time: Duration::ZERO,
            min_trigger_time: Duration::from_millis(1000),
            at_react_possibility: 0.5,
        }
    }
}

impl TriggerThresholds {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            first_trigger_count: parse_optional_env(
                "REPLY_ENGINE_FIRST_TRIGGER_COUNT",
                defaults.first_trigger_count,
            )?,
            max_trigger_count: parse_optional_env(
                "REPLY_ENGINE_MAX_TRIGGER_COUNT",
                defaults.max_trigger_count,
            )?,
            min_trigger_count: parse_optional_env(
                "REPLY_ENGINE_MIN_TRIGGER_COUNT",
                defaults.min_trigger_count,
            )?,
            max_trigger_time: parse_secs_env(
                "REPLY_ENGINE_MAX_TRIGGER_TIME_SECS",
                defaults.max_trigger_time,
            )?,
            min_trigger_time: parse_millis_env(
                "REPLY_ENGINE_MIN_TRIGGER_TIME_MS",
                defaults.min_trigger_time,
            )?,
            at_react_possibility: parse_optional_env(
                "REPLY_ENGINE_AT_REACT_POSSIBILITY",
                defaults.at_react_possibility,
            )?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("first_trigger_count", self.first_trigger_count),
            ("max_trigger_count", self.max_trigger_count),
            ("min_trigger_count", self.min_trigger_count),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be at least 1".to_string(),
                });
            }
        }
        if !(0.0..=1.0).contains(&self.at_react_possibility) {
            return Err(ConfigError::InvalidValue {
                key: "at_react_possibility".to_string(),
                message: format!("must be within [0, 1], got {}", self.at_react_possibility),
            });
        }
        Ok(())
    }
}

/// A memory slot: a group of channels sharing one history and one trigger state.
#[derive(Debug, Clone)]
pub struct SlotConfig {
    /// Slot name, used as the processing lease id.
    pub name: String,
    /// Member channel patterns: literal ids, `all` or `private:all`.
    pub channels: Vec<String>,
    pub thresholds: TriggerThresholds,
    /// Regex patterns that veto a trigger when they match message content.
    pub filter: Vec<String>,
    /// Number of recent messages handed to the generator.
    pub slot_size: usize,
}

impl SlotConfig {
    pub fn new(name: impl Into<String>, channels: Vec<String>) -> Self {
        Self {
            name: name.into(),
            channels,
            thresholds: TriggerThresholds::default(),
            filter: default_filter(),
            slot_size: 20,
        }
    }

    pub fn with_thresholds(mut self, thresholds: TriggerThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_filter(mut self, filter: Vec<String>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_slot_size(mut self, slot_size: usize) -> Self {
        self.slot_size = slot_size;
        self
    }
}

fn default_filter() -> Vec<String> {
    ["你是", "You are", "吧", "呢"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Dual-model routing settings.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub enabled: bool,
    /// Classifier prompt; `{{lastUserMessage}}` is substituted.
    pub router_prompt: String,
    /// Extra system prompt used when the enhanced tier is selected.
    pub enhanced_prompt: Option<String>,
    /// Enables the heuristic shortcuts.
    pub latency_optimization: bool,
    pub router_timeout: Duration,
    /// Messages with this many words or fewer go to the standard tier. Zero disables.
    pub short_message_threshold: usize,
    pub code_block_triggers_enhanced: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            router_prompt: DEFAULT_ROUTER_PROMPT.to_string(),
            enhanced_prompt: None,
            latency_optimization: true,
            router_timeout: Duration::from_millis(800),
            short_message_threshold: 5,
            code_block_triggers_enhanced: true,
        }
    }
}

impl RouterConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let router_prompt =
            optional_env("REPLY_ENGINE_ROUTER_PROMPT")?.unwrap_or(defaults.router_prompt);
        if !router_prompt.contains("{{lastUserMessage}}") {
            tracing::warn!("Router prompt has no {{{{lastUserMessage}}}} placeholder");
        }
        Ok(Self {
            enabled: parse_bool_env("REPLY_ENGINE_ROUTER_ENABLED", defaults.enabled)?,
            router_prompt,
            enhanced_prompt: optional_env("REPLY_ENGINE_ENHANCED_PROMPT")?,
            latency_optimization: parse_bool_env(
                "REPLY_ENGINE_LATENCY_OPTIMIZATION",
                defaults.latency_optimization,
            )?,
            router_timeout: parse_millis_env(
                "REPLY_ENGINE_ROUTER_TIMEOUT_MS",
                defaults.router_timeout,
            )?,
            short_message_threshold: parse_optional_env(
                "REPLY_ENGINE_SHORT_MESSAGE_THRESHOLD",
                defaults.short_message_threshold,
            )?,
            code_block_triggers_enhanced: parse_bool_env(
                "REPLY_ENGINE_CODE_BLOCK_ENHANCED",
                defaults.code_block_triggers_enhanced,
            )?,
        })
    }
}

/// Which similarity strategy the verifier uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifierMethod {
    #[default]
    Embedding,
    Llm,
}

impl std::str::FromStr for VerifierMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "embedding" => Ok(Self::Embedding),
            "llm" => Ok(Self::Llm),
            other => Err(format!("unknown verifier method '{other}'")),
        }
    }
}

/// What happens to a reply that is too similar to the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifierAction {
    #[default]
    Discard,
    Regenerate,
}

impl std::str::FromStr for VerifierAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "discard" => Ok(Self::Discard),
            "regenerate" => Ok(Self::Regenerate),
            other => Err(format!("unknown verifier action '{other}'")),
        }
    }
}

/// Similarity verification settings.
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    pub enabled: bool,
    pub method: VerifierMethod,
    pub action: VerifierAction,
    /// Replies scoring above this are rejected.
    pub similarity_threshold: f64,
    /// Upper bound on one scorer call.
    pub timeout: Duration,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            method: VerifierMethod::Embedding,
            action: VerifierAction::Discard,
            similarity_threshold: 0.75,
            timeout: Duration::from_secs(10),
        }
    }
}

impl VerifierConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            enabled: parse_bool_env("REPLY_ENGINE_VERIFIER_ENABLED", defaults.enabled)?,
            method: parse_optional_env("REPLY_ENGINE_VERIFIER_METHOD", defaults.method)?,
            action: parse_optional_env("REPLY_ENGINE_VERIFIER_ACTION", defaults.action)?,
            similarity_threshold: parse_optional_env(
                "REPLY_ENGINE_SIMILARITY_THRESHOLD",
                defaults.similarity_threshold,
            )?,
            timeout: parse_millis_env("REPLY_ENGINE_VERIFIER_TIMEOUT_MS", defaults.timeout)?,
        })
    }
}

/// Sampling parameters forwarded to the generator.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub stop: Vec<String>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: Some(1.36),
            max_tokens: Some(4096),
            top_p: Some(0.64),
            frequency_penalty: None,
            presence_penalty: None,
            stop: vec!["<|endoftext|>".to_string()],
        }
    }
}

impl GenerationParams {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let stop = optional_env("REPLY_ENGINE_STOP")?
            .map(|raw| split_list(&raw, ','))
            .unwrap_or(defaults.stop);
        Ok(Self {
            temperature: parse_option_env("REPLY_ENGINE_TEMPERATURE")?.or(defaults.temperature),
            max_tokens: parse_option_env("REPLY_ENGINE_MAX_TOKENS")?.or(defaults.max_tokens),
            top_p: parse_option_env("REPLY_ENGINE_TOP_P")?.or(defaults.top_p),
            frequency_penalty: parse_option_env("REPLY_ENGINE_FREQUENCY_PENALTY")?,
            presence_penalty: parse_option_env("REPLY_ENGINE_PRESENCE_PENALTY")?,
            stop,
        })
    }
}

/// Bot persona and outbound formatting.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub name: String,
    pub system_prompt: String,
    /// Typing speed used to pace multi-part replies. Zero sends immediately.
    pub words_per_second: f64,
    /// Replies are split after every match of this pattern.
    pub reply_split_regex: String,
    /// Ordered `(pattern, replacement)` rules applied to every segment.
    pub sentence_replacements: Vec<(String, String)>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            name: "Athena".to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            words_per_second: 2.0,
            reply_split_regex: r"[。？！?!]\s*".to_string(),
            sentence_replacements: vec![("。$".to_string(), String::new())],
        }
    }
}

impl BotConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            name: optional_env("REPLY_ENGINE_BOT_NAME")?.unwrap_or(defaults.name),
            system_prompt: optional_env("REPLY_ENGINE_SYSTEM_PROMPT")?
                .unwrap_or(defaults.system_prompt),
            words_per_second: parse_optional_env(
                "REPLY_ENGINE_WORDS_PER_SECOND",
                defaults.words_per_second,
            )?,
            reply_split_regex: optional_env("REPLY_ENGINE_REPLY_SPLIT_REGEX")?
                .unwrap_or(defaults.reply_split_regex),
            sentence_replacements: defaults.sentence_replacements,
        })
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub slots: Vec<SlotConfig>,
    pub slot_policy: SlotPolicy,
    pub router: RouterConfig,
    pub verifier: VerifierConfig,
    pub bot: BotConfig,
    pub generation: GenerationParams,
    /// How long a trigger waits for the slot's running turn to finish.
    pub lease_timeout: Duration,
    /// Upper bound on one generation call.
    pub generation_timeout: Duration,
    /// Regeneration attempts before a too-similar reply is dropped.
    pub max_regenerations: u32,
    /// Period of the idle/cooldown tick.
    pub tick_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            slots: vec![
                SlotConfig::new("slot-0", vec!["all".to_string()]),
                SlotConfig::new("slot-1", vec!["private:all".to_string()]),
            ],
            slot_policy: SlotPolicy::FirstMatch,
            router: RouterConfig::default(),
            verifier: VerifierConfig::default(),
            bot: BotConfig::default(),
            generation: GenerationParams::default(),
            lease_timeout: Duration::from_secs(5),
            generation_timeout: Duration::from_secs(60),
            max_regenerations: 2,
            tick_interval: Duration::from_secs(1),
        }
    }
}

impl EngineConfig {
    /// Load the whole configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let thresholds = TriggerThresholds::from_env()?;
        let filter = optional_env("REPLY_ENGINE_FILTER")?
            .map(|raw| split_list(&raw, ','))
            .unwrap_or_else(default_filter);
        let slot_size = parse_optional_env("REPLY_ENGINE_SLOT_SIZE", 20usize)?;

        let slots = match optional_env("REPLY_ENGINE_SLOTS")? {
            Some(raw) => parse_slots(&raw),
            None => defaults.slots,
        }
        .into_iter()
        .map(|slot| {
            slot.with_thresholds(thresholds.clone())
                .with_filter(filter.clone())
                .with_slot_size(slot_size)
        })
        .collect();

        let config = Self {
            slots,
            slot_policy: parse_optional_env("REPLY_ENGINE_SLOT_POLICY", defaults.slot_policy)?,
            router: RouterConfig::from_env()?,
            verifier: VerifierConfig::from_env()?,
            bot: BotConfig::from_env()?,
            generation: GenerationParams::from_env()?,
            lease_timeout: parse_millis_env(
                "REPLY_ENGINE_LEASE_TIMEOUT_MS",
                defaults.lease_timeout,
            )?,
            generation_timeout: parse_secs_env(
                "REPLY_ENGINE_GENERATION_TIMEOUT_SECS",
                defaults.generation_timeout,
            )?,
            max_regenerations: parse_optional_env(
                "REPLY_ENGINE_MAX_REGENERATIONS",
                defaults.max_regenerations,
            )?,
            tick_interval: parse_millis_env(
                "REPLY_ENGINE_TICK_INTERVAL_MS",
                defaults.tick_interval,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slots.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "REPLY_ENGINE_SLOTS".to_string(),
                hint: "configure at least one slot, e.g. `all;private:all`".to_string(),
            });
        }
        let mut names = std::collections::HashSet::new();
        for slot in &self.slots {
            // The name is the slot's processing lease id.
            if !names.insert(slot.name.as_str()) {
                return Err(ConfigError::InvalidValue {
                    key: "slots".to_string(),
                    message: format!("duplicate slot name '{}'", slot.name),
                });
            }
            slot.thresholds.validate()?;
            if slot.slot_size == 0 {
                return Err(ConfigError::InvalidValue {
                    key: format!("{}.slot_size", slot.name),
                    message: "must be at least 1".to_string(),
                });
            }
        }
        if !(0.0..=1.0).contains(&self.verifier.similarity_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "similarity_threshold".to_string(),
                message: format!(
                    "must be within [0, 1], got {}",
                    self.verifier.similarity_threshold
                ),
            });
        }
        Ok(())
    }
}

/// Parse `a,b;c` into two slots: `[a, b]` and `[c]`.
fn parse_slots(raw: &str) -> Vec<SlotConfig> {
    raw.split(';')
        .map(|group| split_list(group, ','))
        .filter(|channels| !channels.is_empty())
        .enumerate()
        .map(|(i, channels)| SlotConfig::new(format!("slot-{i}"), channels))
        .collect()
}
