//! Reply engine: decides when to answer and runs one reply turn per slot.
//!
//! Flow for an inbound message:
//! 1. Store it and resolve the slots governing its channel
//! 2. Evaluate each slot's trigger policy (in arrival order, under the slot lock)
//! 3. For every fired slot, run a turn: wait for the slot lease, admission
//!    check, history, routing, generation, verification, send

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{EngineConfig, SlotConfig};
use crate::coordinator::{ProcessingCoordinator, ProcessingLease};
use crate::error::{ConfigError, Error, LlmError, PipelineError};
use crate::llm::{
    ChatMessage, CompletionRequest, LlmProvider, ModelRouter, ModelTier, ProviderSet,
    RoutingDecision,
};
use crate::pipeline::postprocess::ReplyFormatter;
use crate::pipeline::types::{FiredTrigger, ReplySink, SkipReason, TurnOutcome};
use crate::prompt::{format_history, render_template};
use crate::slots::{
    Admission, FilterList, SlotResolver, TriggerDecision, TriggerPolicy, TriggerReason,
};
use crate::store::{ChannelScope, MessageStore, StoredMessage};
use crate::verifier::{ResponseVerifier, Verdict};

/// Collaborators injected into the engine.
pub struct EngineDeps {
    pub store: Arc<dyn MessageStore>,
    pub providers: ProviderSet,
    pub sink: Arc<dyn ReplySink>,
}

struct SlotCell {
    policy: TriggerPolicy,
    /// Sequence number of the newest fired trigger.
    latest_trigger: u64,
    /// Channel of the most recent inbound message; replies go here.
    target_channel: Option<String>,
}

struct SlotRuntime {
    config: SlotConfig,
    scope: ChannelScope,
    cell: Mutex<SlotCell>,
}

impl SlotRuntime {
    fn new(config: SlotConfig) -> Self {
        let policy = TriggerPolicy::new(config.thresholds.clone(), FilterList::new(config.filter.as_slice()));
        Self {
            scope: ChannelScope::parse(config.channels.as_slice()),
            cell: Mutex::new(SlotCell {
                policy,
                latest_trigger: 0,
                target_channel: None,
            }),
            config,
        }
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn fire(cell: &mut SlotCell, slot: usize, reason: TriggerReason) -> FiredTrigger {
        cell.latest_trigger += 1;
        FiredTrigger {
            slot,
            reason,
            seq: cell.latest_trigger,
        }
    }

    fn is_superseded(&self, seq: u64) -> bool {
        self.cell.lock().latest_trigger != seq
    }

    /// Release the Ready state unless a newer trigger owns it.
    fn abandon(&self, seq: u64) {
        let mut cell = self.cell.lock();
        if cell.latest_trigger == seq {
            cell.policy.abandon();
        }
    }

    fn complete(&self) {
        self.cell.lock().policy.complete(Instant::now());
    }
}

pub struct ReplyEngine {
    config: EngineConfig,
    resolver: SlotResolver,
    slots: Vec<SlotRuntime>,
    coordinator: Arc<ProcessingCoordinator>,
    router: ModelRouter,
    verifier: ResponseVerifier,
    formatter: ReplyFormatter,
    store: Arc<dyn MessageStore>,
    sink: Arc<dyn ReplySink>,
    standard: Arc<dyn LlmProvider>,
    enhanced: Option<Arc<dyn LlmProvider>>,
}

impl ReplyEngine {
    pub fn new(config: EngineConfig, deps: EngineDeps) -> Result<Self, ConfigError> {
        config.validate()?;

        let resolver = SlotResolver::new(&config.slots, config.slot_policy);
        let slots = config.slots.iter().cloned().map(SlotRuntime::new).collect();
        let router = ModelRouter::new(config.router.clone(), deps.providers.router.clone());
        let judge = deps
            .providers
            .verifier
            .clone()
            .or_else(|| Some(Arc::clone(&deps.providers.standard)));
        let verifier =
            ResponseVerifier::new(config.verifier.clone(), deps.providers.embedding.clone(), judge);
        let formatter = ReplyFormatter::new(&config.bot);

        info!(
            slots = config.slots.len(),
            policy = ?config.slot_policy,
            router = config.router.enabled,
            verifier = verifier.is_enabled(),
            "Reply engine ready"
        );

        Ok(Self {
            resolver,
            slots,
            coordinator: ProcessingCoordinator::new(),
            router,
            verifier,
            formatter,
            store: deps.store,
            sink: deps.sink,
            standard: deps.providers.standard,
            enhanced: deps.providers.enhanced,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<ProcessingCoordinator> {
        &self.coordinator
    }

    pub fn verifier(&self) -> &ResponseVerifier {
        &self.verifier
    }

    pub fn resolver(&self) -> &SlotResolver {
        &self.resolver
    }

    /// Store a message and run a turn for every slot it fires.
    pub async fn handle_message(&self, message: StoredMessage) -> Result<Vec<TurnOutcome>, Error> {
        let fired = self.ingest(&message).await?;
        Ok(self.run_fired(fired).await)
    }

    /// Store a message and evaluate triggers without running turns.
    ///
    /// Call this sequentially per inbound message so counts follow arrival
    /// order; the returned triggers may then run concurrently.
    pub async fn ingest(&self, message: &StoredMessage) -> Result<Vec<FiredTrigger>, Error> {
        self.store.insert_or_replace(message).await?;
        if message.is_bot {
            return Ok(Vec::new());
        }

        let matched = self.resolver.resolve_for(&message.channel_id);
        if matched.is_empty() {
            debug!(channel = %message.channel_id, "Channel not assigned to any slot");
            return Ok(Vec::new());
        }

        let now = Instant::now();
        let mut fired = Vec::new();
        for index in matched {
            let slot = &self.slots[index];
            let mut cell = slot.cell.lock();
            cell.target_channel = Some(message.channel_id.clone());
            match cell.policy.on_message(&message.content, message.mentions_bot, now) {
                TriggerDecision::Fire(reason) => {
                    info!(slot = %slot.name(), channel = %message.channel_id, reason = reason.label(), "Trigger fired");
                    fired.push(SlotRuntime::fire(&mut cell, index, reason));
                }
                TriggerDecision::Vetoed { pattern } => {
                    debug!(slot = %slot.name(), pattern = %pattern, "Trigger vetoed by filter");
                }
                TriggerDecision::Hold => {}
            }
        }
        Ok(fired)
    }

    /// Evaluate periodic transitions (idle prompt, expired cooldown) and run
    /// the resulting turns.
    pub async fn tick(&self) -> Vec<TurnOutcome> {
        let now = Instant::now();
        let fired: Vec<FiredTrigger> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let mut cell = slot.cell.lock();
                let reason = cell.policy.on_tick(now)?;
                info!(slot = %slot.name(), reason = reason.label(), "Trigger fired on tick");
                Some(SlotRuntime::fire(&mut cell, index, reason))
            })
            .collect();
        self.run_fired(fired).await
    }

    pub async fn run_fired(&self, fired: Vec<FiredTrigger>) -> Vec<TurnOutcome> {
        if fired.is_empty() {
            return Vec::new();
        }
        join_all(fired.into_iter().map(|trigger| self.run_turn(trigger))).await
    }

    async fn run_turn(&self, trigger: FiredTrigger) -> TurnOutcome {
        let slot = &self.slots[trigger.slot];
        let skipped = |reason: SkipReason| TurnOutcome::Skipped {
            slot: slot.name().to_string(),
            reason,
        };

        let _lease = match self.acquire_lease(slot, trigger.seq).await {
            Ok(lease) => lease,
            Err(reason) => {
                if reason == SkipReason::LeaseTimeout {
                    slot.abandon(trigger.seq);
                }
                return skipped(reason);
            }
        };

        let target = {
            let mut cell = slot.cell.lock();
            if let Admission::Dropped { since_last } = cell.policy.admit(Instant::now()) {
                debug!(slot = %slot.name(), since_last_ms = since_last.as_millis() as u64, "Trigger dropped inside min trigger time");
                return skipped(SkipReason::Cooldown);
            }
            cell.target_channel.clone()
        };
        let Some(target) = target else {
            slot.abandon(trigger.seq);
            return skipped(SkipReason::NoTarget);
        };

        match self.reply(slot, &target, trigger.reason).await {
            Ok(outcome) => {
                slot.complete();
                outcome
            }
            Err(e) => {
                error!(slot = %slot.name(), channel = %target, error = %e, "Reply turn failed");
                slot.abandon(trigger.seq);
                skipped(SkipReason::GenerationFailed)
            }
        }
    }

    /// Wait for the slot to be free and take its lease, unless a newer
    /// trigger shows up in the meantime.
    async fn acquire_lease(&self, slot: &SlotRuntime, seq: u64) -> Result<ProcessingLease, SkipReason> {
        let deadline = Instant::now() + self.config.lease_timeout;
        loop {
            if slot.is_superseded(seq) {
                debug!(slot = %slot.name(), seq, "Trigger superseded by a newer one");
                return Err(SkipReason::Superseded);
            }
            if let Some(lease) = self.coordinator.try_lease(slot.name()) {
                return Ok(lease);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Err(e) = self.coordinator.wait_for_process(slot.name(), remaining).await {
                debug!(slot = %slot.name(), error = %e, "Skipping turn");
                return Err(SkipReason::LeaseTimeout);
            }
        }
    }

    async fn reply(
        &self,
        slot: &SlotRuntime,
        channel: &str,
        reason: TriggerReason,
    ) -> Result<TurnOutcome, PipelineError> {
        let history = self
            .store
            .query(&slot.scope, Some(slot.config.slot_size))
            .await?;
        let last_user_message = history
            .iter()
            .rev()
            .find(|m| !m.is_bot)
            .map(|m| m.content.as_str())
            .unwrap_or_default();

        let routing = self.router.select_model(last_user_message).await;
        let (provider, tier) = self.provider_for(routing);
        let request = self.build_request(&history, tier);

        let mut last_similarity = None;
        for attempt in 1..=self.config.max_regenerations + 1 {
            let content = self.generate(provider.as_ref(), request.clone()).await?;
            let outcome = self.verifier.verify(channel, &content).await;
            match outcome.verdict {
                Verdict::Accept => {
                    let segments = self.send(channel, &content).await?;
                    info!(
                        slot = %slot.name(),
                        channel = %channel,
                        tier = tier.label(),
                        routing = routing.reason.label(),
                        attempt,
                        segments = segments.len(),
                        "Reply sent"
                    );
                    return Ok(TurnOutcome::Replied {
                        slot: slot.name().to_string(),
                        channel: channel.to_string(),
                        tier,
                        routing: routing.reason,
                        reason,
                        segments,
                        attempts: attempt,
                    });
                }
                Verdict::Discard => {
                    return Ok(TurnOutcome::Discarded {
                        slot: slot.name().to_string(),
                        channel: channel.to_string(),
                        similarity: outcome.similarity,
                    });
                }
                Verdict::Regenerate => {
                    debug!(slot = %slot.name(), attempt, similarity = ?outcome.similarity, "Regenerating reply");
                    last_similarity = outcome.similarity;
                }
            }
        }

        info!(
            slot = %slot.name(),
            channel = %channel,
            attempts = self.config.max_regenerations + 1,
            "Regeneration budget exhausted, discarding reply"
        );
        Ok(TurnOutcome::Discarded {
            slot: slot.name().to_string(),
            channel: channel.to_string(),
            similarity: last_similarity,
        })
    }

    fn provider_for(&self, routing: RoutingDecision) -> (Arc<dyn LlmProvider>, ModelTier) {
        match (routing.tier, &self.enhanced) {
            (ModelTier::Enhanced, Some(enhanced)) => (Arc::clone(enhanced), ModelTier::Enhanced),
            (ModelTier::Enhanced, None) => {
                warn!("Enhanced tier selected but no enhanced model configured, using standard");
                (Arc::clone(&self.standard), ModelTier::Standard)
            }
            (ModelTier::Standard, _) => (Arc::clone(&self.standard), ModelTier::Standard),
        }
    }

    fn build_request(&self, history: &[StoredMessage], tier: ModelTier) -> CompletionRequest {
        let bot = &self.config.bot;
        let mut system = render_template(&bot.system_prompt, &[("botName", bot.name.as_str())]);
        if tier == ModelTier::Enhanced {
            if let Some(extra) = &self.config.router.enhanced_prompt {
                system.push_str("\n\n");
                system.push_str(&render_template(extra, &[("botName", bot.name.as_str())]));
            }
        }

        CompletionRequest::new(vec![
            ChatMessage::system(system),
            ChatMessage::user(format_history(history, &bot.name)),
        ])
        .with_params(&self.config.generation)
    }

    async fn generate(
        &self,
        provider: &dyn LlmProvider,
        request: CompletionRequest,
    ) -> Result<String, PipelineError> {
        let timeout = self.config.generation_timeout;
        let response = tokio::time::timeout(timeout, provider.complete(request))
            .await
            .map_err(|_| LlmError::Timeout {
                provider: provider.model_name().to_string(),
                timeout,
            })??;

        let content = response.content.trim();
        if content.is_empty() {
            return Err(PipelineError::Generation(format!(
                "{} returned an empty reply (finish_reason={:?})",
                provider.model_name(),
                response.finish_reason
            )));
        }
        Ok(content.to_string())
    }

    /// Send the reply segment by segment and store it as a bot message.
    async fn send(&self, channel: &str, content: &str) -> Result<Vec<String>, PipelineError> {
        let segments = self.formatter.segments(content);
        for (i, segment) in segments.iter().enumerate() {
            if i > 0 {
                let delay = self.formatter.typing_delay(segment);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            self.sink.send(channel, segment).await?;
        }

        let bot = &self.config.bot;
        let own = StoredMessage::new(Uuid::new_v4().to_string(), channel, bot.name.clone(), content, Utc::now())
            .with_sender_name(bot.name.clone())
            .from_bot();
        self.store.insert_or_replace(&own).await?;
        Ok(segments)
    }
}

/// Run [`ReplyEngine::tick`] on a fixed interval until the task is aborted.
pub fn spawn_tick_task(engine: Arc<ReplyEngine>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            for outcome in engine.tick().await {
                debug!(slot = %outcome.slot(), replied = outcome.is_replied(), "Tick turn finished");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::config::{TriggerThresholds, VerifierAction, VerifierConfig};
    use crate::error::ChannelError;
    use crate::llm::{CompletionResponse, EmbeddingProvider, FinishReason, RoutingReason};
    use crate::store::InMemoryMessageStore;

    /// Generator returning scripted replies in order; repeats the last one.
    struct ScriptedLlm {
        replies: Mutex<VecDeque<String>>,
        delay: Duration,
        calls: AtomicUsize,
        last_request: Mutex<Option<CompletionRequest>>,
    }

    impl ScriptedLlm {
        fn new(replies: &[&str]) -> Arc<Self> {
            Self::delayed(replies, Duration::ZERO)
        }

        fn delayed(replies: &[&str], delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
                delay,
                calls: AtomicUsize::new(0),
                last_request: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock() = Some(request);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let content = {
                let mut replies = self.replies.lock();
                if replies.len() > 1 {
                    replies.pop_front().unwrap_or_default()
                } else {
                    replies.front().cloned().unwrap_or_default()
                }
            };
            Ok(CompletionResponse {
                content,
                input_tokens: 0,
                output_tokens: 0,
                finish_reason: FinishReason::Stop,
                response_id: None,
            })
        }
    }

    /// Embeds identical strings identically and everything else orthogonally.
    struct EqualityEmbedder;

    #[async_trait]
    impl EmbeddingProvider for EqualityEmbedder {
        fn model_name(&self) -> &str {
            "equality"
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let mut v = vec![0.0f32; 64];
            v[text.len() % 64] = 1.0;
            Ok(v)
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(String, String)>>,
        /// Reject every send while set.
        offline: AtomicBool,
    }

    #[async_trait]
    impl ReplySink for RecordingSink {
        async fn send(&self, channel_id: &str, text: &str) -> Result<(), ChannelError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(ChannelError::SendFailed {
                    name: "test".into(),
                    reason: "offline".into(),
                });
            }
            self.sent.lock().push((channel_id.to_string(), text.to_string()));
            Ok(())
        }
    }

    struct Harness {
        engine: Arc<ReplyEngine>,
        llm: Arc<ScriptedLlm>,
        sink: Arc<RecordingSink>,
        store: Arc<InMemoryMessageStore>,
    }

    fn config(thresholds: TriggerThresholds) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.bot.words_per_second = 0.0;
        config.slots = vec![
            SlotConfig::new("group", vec!["100".into(), "200".into()])
                .with_thresholds(thresholds.clone())
                .with_filter(vec!["You are".into()]),
            SlotConfig::new("dm", vec!["private:all".into()]).with_thresholds(thresholds),
        ];
        config
    }

    fn quick() -> TriggerThresholds {
        TriggerThresholds {
            first_trigger_count: 3,
            min_trigger_count: 1,
            max_trigger_count: 10,
            max_trigger_time: Duration::ZERO,
            min_trigger_time: Duration::from_millis(1000),
            at_react_possibility: 0.0,
        }
    }

    fn harness_with(config: EngineConfig, llm: Arc<ScriptedLlm>, embedding: bool) -> Harness {
        let sink = Arc::new(RecordingSink::default());
        let store = Arc::new(InMemoryMessageStore::new());
        let standard: Arc<dyn LlmProvider> = llm.clone();
        let embedding: Option<Arc<dyn EmbeddingProvider>> = if embedding {
            Some(Arc::new(EqualityEmbedder))
        } else {
            None
        };
        let engine = ReplyEngine::new(
            config,
            EngineDeps {
                store: store.clone(),
                providers: ProviderSet {
                    standard,
                    enhanced: None,
                    router: None,
                    verifier: None,
                    embedding,
                },
                sink: sink.clone(),
            },
        )
        .unwrap();
        Harness {
            engine: Arc::new(engine),
            llm,
            sink,
            store,
        }
    }

    fn harness(replies: &[&str]) -> Harness {
        harness_with(config(quick()), ScriptedLlm::new(replies), false)
    }

    fn message(n: usize, channel: &str, content: &str) -> StoredMessage {
        StoredMessage::new(format!("m{n}"), channel, "alice", content, Utc::now()).with_sender_name("Alice")
    }

    #[tokio::test(start_paused = true)]
    async fn replies_after_first_trigger_count() {
        let h = harness(&["Sure thing。See you!"]);
        assert!(h.engine.handle_message(message(1, "100", "hi")).await.unwrap().is_empty());
        assert!(h.engine.handle_message(message(2, "200", "anyone?")).await.unwrap().is_empty());
        let outcomes = h.engine.handle_message(message(3, "100", "lunch?")).await.unwrap();

        assert_eq!(outcomes.len(), 1);
        match &outcomes[0] {
            TurnOutcome::Replied {
                slot,
                channel,
                tier,
                routing,
                reason,
                segments,
                attempts,
            } => {
                assert_eq!(slot, "group");
                assert_eq!(channel, "100");
                assert_eq!(*tier, ModelTier::Standard);
                assert_eq!(*routing, RoutingReason::Disabled);
                assert_eq!(*reason, TriggerReason::FirstCount);
                assert_eq!(segments, &vec!["Sure thing".to_string(), "See you!".to_string()]);
                assert_eq!(*attempts, 1);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(h.sink.sent.lock().len(), 2);

        // History holds every channel of the slot plus the bot's own reply.
        let prompt = h.llm.last_request.lock().clone().unwrap();
        assert!(prompt.messages[0].content.contains("Athena"));
        assert!(prompt.messages[1].content.contains("Alice: anyone?"));
        let stored = h.store.query(&ChannelScope::channel("100"), None).await.unwrap();
        assert!(stored.last().unwrap().is_bot);
        assert!(!h.engine.coordinator().is_processing("group"));
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_then_min_trigger_count() {
        let h = harness(&["one", "two"]);
        for n in 1..=3 {
            h.engine.handle_message(message(n, "100", "msg")).await.unwrap();
        }
        assert_eq!(h.llm.calls.load(Ordering::SeqCst), 1);

        // Inside the cooldown: held and deferred.
        assert!(h.engine.handle_message(message(4, "100", "more")).await.unwrap().is_empty());
        tokio::time::advance(Duration::from_millis(1100)).await;

        // The deferred trigger fires on the next tick.
        let outcomes = h.engine.tick().await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].is_replied());
        assert_eq!(h.llm.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn bot_and_unassigned_messages_are_stored_not_counted() {
        let h = harness(&["x"]);
        for n in 1..=5 {
            let bot = message(n, "100", "beep").from_bot();
            assert!(h.engine.handle_message(bot).await.unwrap().is_empty());
        }
        for n in 6..=10 {
            assert!(h.engine.handle_message(message(n, "999", "hello")).await.unwrap().is_empty());
        }
        assert_eq!(h.store.len().await, 10);
        assert_eq!(h.llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn filtered_message_cannot_fire() {
        let h = harness(&["x"]);
        h.engine.handle_message(message(1, "100", "a")).await.unwrap();
        h.engine.handle_message(message(2, "100", "b")).await.unwrap();
        let outcomes = h.engine.handle_message(message(3, "100", "you are a bot")).await.unwrap();
        assert!(outcomes.is_empty());
        let outcomes = h.engine.handle_message(message(4, "100", "c")).await.unwrap();
        assert_eq!(outcomes.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_reply_is_discarded() {
        let mut cfg = config(TriggerThresholds {
            first_trigger_count: 1,
            min_trigger_time: Duration::ZERO,
            ..quick()
        });
        cfg.verifier = VerifierConfig {
            enabled: true,
            action: VerifierAction::Discard,
            ..Default::default()
        };
        let h = harness_with(cfg, ScriptedLlm::new(&["same answer"]), true);

        let first = h.engine.handle_message(message(1, "private:bob", "q1")).await.unwrap();
        assert!(first[0].is_replied());
        let second = h.engine.handle_message(message(2, "private:bob", "q2")).await.unwrap();
        assert!(matches!(
            &second[0],
            TurnOutcome::Discarded { slot, similarity: Some(s), .. } if slot == "dm" && *s > 0.99
        ));
        assert_eq!(h.sink.sent.lock().len(), 1);
        assert_eq!(h.engine.verifier().previous_response("private:bob").as_deref(), Some("same answer"));
    }

    #[tokio::test(start_paused = true)]
    async fn regenerate_until_different_then_give_up() {
        let mut cfg = config(TriggerThresholds {
            first_trigger_count: 1,
            min_trigger_time: Duration::ZERO,
            ..quick()
        });
        cfg.verifier = VerifierConfig {
            enabled: true,
            action: VerifierAction::Regenerate,
            ..Default::default()
        };
        cfg.max_regenerations = 2;
        let h = harness_with(cfg, ScriptedLlm::new(&["abc", "abc", "a longer answer"]), true);

        assert!(h.engine.handle_message(message(1, "private:bob", "q1")).await.unwrap()[0].is_replied());
        let second = h.engine.handle_message(message(2, "private:bob", "q2")).await.unwrap();
        assert!(matches!(&second[0], TurnOutcome::Replied { attempts: 2, .. }));

        // The scripted generator now repeats itself forever.
        let third = h.engine.handle_message(message(3, "private:bob", "q3")).await.unwrap();
        assert!(matches!(&third[0], TurnOutcome::Discarded { .. }));
        assert_eq!(h.llm.calls.load(Ordering::SeqCst), 1 + 2 + 3);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_slot_times_out_and_newest_trigger_wins() {
        let thresholds = TriggerThresholds {
            first_trigger_count: 1,
            min_trigger_time: Duration::ZERO,
            ..quick()
        };
        let mut cfg = config(thresholds);
        cfg.lease_timeout = Duration::from_millis(500);
        let h = harness_with(cfg, ScriptedLlm::delayed(&["slow"], Duration::from_secs(2)), false);

        let fired = h.engine.ingest(&message(1, "100", "first")).await.unwrap();
        let engine = Arc::clone(&h.engine);
        let running = tokio::spawn(async move { engine.run_fired(fired).await });
        while !h.engine.coordinator().is_processing("group") {
            tokio::task::yield_now().await;
        }

        let older = h.engine.ingest(&message(2, "100", "second")).await.unwrap();
        let newer = h.engine.ingest(&message(3, "100", "third")).await.unwrap();
        let outcomes = h.engine.run_fired([older, newer].concat()).await;
        assert_eq!(
            outcomes,
            vec![
                TurnOutcome::Skipped { slot: "group".into(), reason: SkipReason::Superseded },
                TurnOutcome::Skipped { slot: "group".into(), reason: SkipReason::LeaseTimeout },
            ]
        );
        assert_eq!(h.engine.coordinator().waiter_count("group"), 0);

        let first = running.await.unwrap();
        assert!(first[0].is_replied());
        assert_eq!(h.engine.coordinator().active_leases(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn generation_failure_abandons_and_keeps_pending() {
        let h = harness(&[""]);
        for n in 1..=2 {
            h.engine.handle_message(message(n, "100", "x")).await.unwrap();
        }
        let outcomes = h.engine.handle_message(message(3, "100", "x")).await.unwrap();
        assert_eq!(
            outcomes,
            vec![TurnOutcome::Skipped { slot: "group".into(), reason: SkipReason::GenerationFailed }]
        );
        assert!(h.sink.sent.lock().is_empty());

        // Pending count was kept, so the next message fires again (after the
        // admission window).
        tokio::time::advance(Duration::from_millis(1100)).await;
        let again = h.engine.handle_message(message(4, "100", "x")).await.unwrap();
        assert_eq!(again.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn all_matches_policy_fans_out() {
        let mut cfg = config(TriggerThresholds {
            first_trigger_count: 1,
            ..quick()
        });
        cfg.slot_policy = crate::config::SlotPolicy::AllMatches;
        cfg.slots.push(SlotConfig::new("everything", vec!["all".into()]).with_thresholds(TriggerThresholds {
            first_trigger_count: 1,
            ..quick()
        }));
        let h = harness_with(cfg, ScriptedLlm::new(&["ok"]), false);
        let outcomes = h.engine.handle_message(message(1, "100", "hey")).await.unwrap();
        let slots: Vec<_> = outcomes.iter().map(|o| o.slot().to_string()).collect();
        assert_eq!(slots, vec!["group", "everything"]);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_slots_do_not_repeat_on_shared_channel() {
        let eager = TriggerThresholds {
            first_trigger_count: 1,
            min_trigger_time: Duration::ZERO,
            ..quick()
        };
        let mut cfg = config(eager.clone());
        cfg.slot_policy = crate::config::SlotPolicy::AllMatches;
        cfg.slots.push(SlotConfig::new("everything", vec!["all".into()]).with_thresholds(eager));
        cfg.verifier = VerifierConfig {
            enabled: true,
            action: VerifierAction::Discard,
            ..Default::default()
        };
        let h = harness_with(cfg, ScriptedLlm::new(&["ok"]), true);
        h.engine.verifier().set_previous_response("100", "earlier");

        let outcomes = h.engine.handle_message(message(1, "100", "hey")).await.unwrap();
        assert_eq!(outcomes.iter().filter(|o| o.is_replied()).count(), 1);
        assert!(outcomes.iter().any(|o| matches!(o, TurnOutcome::Discarded { .. })));
        assert_eq!(h.sink.sent.lock().clone(), vec![("100".to_string(), "ok".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn sink_failure_skips_turn_without_storing_reply() {
        let h = harness(&["hello"]);
        h.sink.offline.store(true, Ordering::SeqCst);
        for n in 1..=2 {
            h.engine.handle_message(message(n, "100", "x")).await.unwrap();
        }
        let outcomes = h.engine.handle_message(message(3, "100", "x")).await.unwrap();
        assert_eq!(
            outcomes,
            vec![TurnOutcome::Skipped { slot: "group".into(), reason: SkipReason::GenerationFailed }]
        );
        assert_eq!(h.store.len().await, 3);
        assert!(!h.engine.coordinator().is_processing("group"));

        h.sink.offline.store(false, Ordering::SeqCst);
        tokio::time::advance(Duration::from_millis(1100)).await;
        let retry = h.engine.handle_message(message(4, "100", "x")).await.unwrap();
        assert!(retry[0].is_replied());
        assert_eq!(h.store.len().await, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_task_fires_idle_prompt() {
        let cfg = config(TriggerThresholds {
            max_trigger_time: Duration::from_secs(30),
            first_trigger_count: 5,
            ..quick()
        });
        let h = harness_with(cfg, ScriptedLlm::new(&["anyone around?"]), false);
        h.engine.handle_message(message(1, "200", "quiet day")).await.unwrap();

        let task = spawn_tick_task(Arc::clone(&h.engine), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(35)).await;
        task.abort();

        let sent = h.sink.sent.lock().clone();
        assert_eq!(sent, vec![("200".to_string(), "anyone around?".to_string())]);
    }
}
