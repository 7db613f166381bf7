//! Shared types for the reply pipeline.

use async_trait::async_trait;

use crate::error::ChannelError;
use crate::llm::{ModelTier, RoutingReason};
use crate::slots::TriggerReason;

/// Outbound side of a chat platform.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn send(&self, channel_id: &str, text: &str) -> Result<(), ChannelError>;
}

/// A trigger that fired and still has to run its turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiredTrigger {
    pub slot: usize,
    pub reason: TriggerReason,
    /// Per-slot sequence number; only the newest one may run.
    pub seq: u64,
}

/// Why a fired trigger produced no reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another turn held the slot for longer than the lease timeout.
    LeaseTimeout,
    /// A newer trigger for the same slot took over.
    Superseded,
    /// The previous turn began less than `min_trigger_time` ago.
    Cooldown,
    /// No inbound channel to reply to yet.
    NoTarget,
    GenerationFailed,
}

impl SkipReason {
    pub fn label(&self) -> &'static str {
        match self {
            Self::LeaseTimeout => "lease_timeout",
            Self::Superseded => "superseded",
            Self::Cooldown => "cooldown",
            Self::NoTarget => "no_target",
            Self::GenerationFailed => "generation_failed",
        }
    }
}

/// Result of one reply turn.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Replied {
        slot: String,
        channel: String,
        tier: ModelTier,
        routing: RoutingReason,
        reason: TriggerReason,
        segments: Vec<String>,
        /// Generation attempts used, including the accepted one.
        attempts: u32,
    },
    /// Every candidate was rejected by the verifier.
    Discarded {
        slot: String,
        channel: String,
        similarity: Option<f64>,
    },
    Skipped {
        slot: String,
        reason: SkipReason,
    },
}

impl TurnOutcome {
    pub fn slot(&self) -> &str {
        match self {
            Self::Replied { slot, .. } | Self::Discarded { slot, .. } | Self::Skipped { slot, .. } => slot,
        }
    }

    pub fn is_replied(&self) -> bool {
        matches!(self, Self::Replied { .. })
    }
}
