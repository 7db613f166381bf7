//! Per-slot trigger state machine.
//!
//! ```text
//!   Idle ──(threshold met / at-mention / idle timeout)──► Ready
//!   Ready ──(reply completed)──► Cooldown ──(min_trigger_time elapsed)──► Idle
//!   Ready ──(abandoned / dropped at admission)──► Idle
//! ```
//!
//! All methods take the current instant so the machine stays deterministic
//! under test. The caller serializes access (one policy per slot behind a lock).

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::debug;

use crate::config::TriggerThresholds;
use crate::slots::filter::FilterList;

/// Observable state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    /// Collecting messages.
    Idle,
    /// Just replied; count-based triggers are suppressed.
    Cooldown,
    /// Fired; a turn is waiting for or holding the slot lease.
    Ready,
}

/// Why a slot fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    /// Reached the first-trigger count before any reply.
    FirstCount,
    /// Reached the min-trigger count after a previous reply.
    MinCount,
    /// Reached the max-trigger count.
    MaxCount,
    /// The bot was mentioned and the reaction draw succeeded.
    AtMention,
    /// The conversation went quiet for longer than the max trigger time.
    IdleTimeout,
    /// A threshold was met during cooldown and the cooldown has now expired.
    CooldownElapsed,
}

impl TriggerReason {
    pub fn label(&self) -> &'static str {
        match self {
            Self::FirstCount => "first_count",
            Self::MinCount => "min_count",
            Self::MaxCount => "max_count",
            Self::AtMention => "at_mention",
            Self::IdleTimeout => "idle_timeout",
            Self::CooldownElapsed => "cooldown_elapsed",
        }
    }
}

/// Result of evaluating one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerDecision {
    Fire(TriggerReason),
    Hold,
    /// A filter pattern matched; this message cannot fire the slot.
    Vetoed { pattern: String },
}

/// Result of the admission check when a turn acquires the slot lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// The previous turn began less than `min_trigger_time` ago.
    Dropped { since_last: Duration },
}

/// Mutable per-slot bookkeeping.
#[derive(Debug, Clone)]
pub struct SlotRuntimeState {
    pub state: TriggerState,
    /// Messages observed since the last completed reply.
    pub pending_count: u32,
    pub last_reply_at: Option<Instant>,
    pub last_message_at: Option<Instant>,
    pub cooldown_until: Option<Instant>,
    /// When the most recently admitted turn began.
    pub last_admitted_at: Option<Instant>,
    pub has_replied: bool,
    /// A count threshold was met while cooling down.
    deferred: bool,
    /// The idle prompt may fire for the current quiet period.
    idle_armed: bool,
}

impl Default for SlotRuntimeState {
    fn default() -> Self {
        Self {
            state: TriggerState::Idle,
            pending_count: 0,
            last_reply_at: None,
            last_message_at: None,
            cooldown_until: None,
            last_admitted_at: None,
            has_replied: false,
            deferred: false,
            idle_armed: false,
        }
    }
}

/// Trigger policy for one slot.
#[derive(Debug, Clone)]
pub struct TriggerPolicy {
    thresholds: TriggerThresholds,
    filter: FilterList,
    runtime: SlotRuntimeState,
}

impl TriggerPolicy {
    pub fn new(thresholds: TriggerThresholds, filter: FilterList) -> Self {
        Self {
            thresholds,
            filter,
            runtime: SlotRuntimeState::default(),
        }
    }

    pub fn thresholds(&self) -> &TriggerThresholds {
        &self.thresholds
    }

    pub fn runtime(&self) -> &SlotRuntimeState {
        &self.runtime
    }

    pub fn state(&mut self, now: Instant) -> TriggerState {
        self.refresh(now);
        self.runtime.state
    }

    /// Evaluate an inbound message, drawing the at-mention roll from the thread RNG.
    pub fn on_message(&mut self, content: &str, mentions_bot: bool, now: Instant) -> TriggerDecision {
        self.on_message_with_rng(content, mentions_bot, now, &mut rand::thread_rng())
    }

    pub fn on_message_with_rng<R: Rng + ?Sized>(
        &mut self,
        content: &str,
        mentions_bot: bool,
        now: Instant,
        rng: &mut R,
    ) -> TriggerDecision {
        self.refresh(now);
        let rt = &mut self.runtime;
        rt.pending_count = rt.pending_count.saturating_add(1);
        rt.last_message_at = Some(now);

        if let Some(pattern) = self.filter.matches(content) {
            debug!(pattern = %pattern, "Message matched filter, trigger vetoed");
            return TriggerDecision::Vetoed {
                pattern: pattern.to_string(),
            };
        }
        self.runtime.idle_armed = true;

        if mentions_bot && roll(self.thresholds.at_react_possibility, rng) {
            return self.fire(TriggerReason::AtMention);
        }

        let pending = self.runtime.pending_count;
        if pending >= self.thresholds.max_trigger_count {
            return self.fire(TriggerReason::MaxCount);
        }

        let (threshold, reason) = if self.runtime.has_replied {
            (self.thresholds.min_trigger_count, TriggerReason::MinCount)
        } else {
            (self.thresholds.first_trigger_count, TriggerReason::FirstCount)
        };
        if pending >= threshold {
            if self.in_cooldown(now) {
                self.runtime.deferred = true;
                return TriggerDecision::Hold;
            }
            return self.fire(reason);
        }

        TriggerDecision::Hold
    }

    /// Periodic evaluation. Never fires while a turn is in flight.
    pub fn on_tick(&mut self, now: Instant) -> Option<TriggerReason> {
        self.refresh(now);
        if self.runtime.state == TriggerState::Ready {
            return None;
        }

        let max_idle = self.thresholds.max_trigger_time;
        if !max_idle.is_zero() && self.runtime.idle_armed {
            if let Some(last) = self.runtime.last_message_at {
                if now.saturating_duration_since(last) > max_idle {
                    self.runtime.idle_armed = false;
                    if let TriggerDecision::Fire(reason) = self.fire(TriggerReason::IdleTimeout) {
                        return Some(reason);
                    }
                }
            }
        }

        if self.runtime.deferred && !self.in_cooldown(now) {
            if let TriggerDecision::Fire(reason) = self.fire(TriggerReason::CooldownElapsed) {
                return Some(reason);
            }
        }

        None
    }

    /// Called once a turn holds the slot lease. Drops triggers that arrive
    /// within `min_trigger_time` of the previously admitted turn.
    pub fn admit(&mut self, now: Instant) -> Admission {
        let min = self.thresholds.min_trigger_time;
        if let Some(last) = self.runtime.last_admitted_at {
            let since_last = now.saturating_duration_since(last);
            if since_last < min {
                self.runtime.state = TriggerState::Idle;
                return Admission::Dropped { since_last };
            }
        }
        self.runtime.last_admitted_at = Some(now);
        self.runtime.state = TriggerState::Ready;
        Admission::Admitted
    }

    /// A reply turn finished (sent or deliberately discarded).
    pub fn complete(&mut self, now: Instant) {
        let rt = &mut self.runtime;
        rt.pending_count = 0;
        rt.last_reply_at = Some(now);
        rt.cooldown_until = Some(now + self.thresholds.min_trigger_time);
        rt.has_replied = true;
        rt.deferred = false;
        rt.state = if self.thresholds.min_trigger_time.is_zero() {
            TriggerState::Idle
        } else {
            TriggerState::Cooldown
        };
    }

    /// A turn gave up without replying. Pending messages are kept.
    pub fn abandon(&mut self) {
        self.runtime.state = TriggerState::Idle;
    }

    fn fire(&mut self, reason: TriggerReason) -> TriggerDecision {
        self.runtime.state = TriggerState::Ready;
        self.runtime.deferred = false;
        TriggerDecision::Fire(reason)
    }

    fn in_cooldown(&self, now: Instant) -> bool {
        self.runtime.cooldown_until.is_some_and(|until| now < until)
    }

    fn refresh(&mut self, now: Instant) {
        if self.runtime.state == TriggerState::Cooldown && !self.in_cooldown(now) {
            self.runtime.state = TriggerState::Idle;
        }
    }
}

fn roll<R: Rng + ?Sized>(probability: f64, rng: &mut R) -> bool {
    if !(probability > 0.0) {
        return false;
    }
    rng.gen_bool(probability.min(1.0))
}
