//! Channel → memory slot resolution.

use crate::config::{SlotConfig, SlotPolicy};

/// Prefix that marks a private (direct-message) channel id.
pub const PRIVATE_PREFIX: &str = "private:";

/// Whether a channel id denotes a private conversation.
pub fn is_private_channel(channel_id: &str) -> bool {
    channel_id.starts_with(PRIVATE_PREFIX)
}

/// A single member pattern of a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelPattern {
    /// Matches exactly one channel id.
    Exact(String),
    /// `all`: every non-private channel.
    AllGuild,
    /// `private:all`: every private channel.
    AllPrivate,
}

impl ChannelPattern {
    /// Parse a configured pattern. Blank patterns yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "" => None,
            "all" => Some(Self::AllGuild),
            "private:all" => Some(Self::AllPrivate),
            other => Some(Self::Exact(other.to_string())),
        }
    }

    pub fn matches(&self, channel_id: &str) -> bool {
        match self {
            Self::Exact(id) => id == channel_id,
            Self::AllGuild => !is_private_channel(channel_id),
            Self::AllPrivate => is_private_channel(channel_id),
        }
    }
}

#[derive(Debug, Clone)]
struct ResolvedSlot {
    name: String,
    patterns: Vec<ChannelPattern>,
}

/// Maps channel ids to slot indices. Immutable once built.
///
/// Slot indices are positions in the configured slot list.
#[derive(Debug, Clone)]
pub struct SlotResolver {
    slots: Vec<ResolvedSlot>,
    policy: SlotPolicy,
}

impl SlotResolver {
    pub fn new(slots: &[SlotConfig], policy: SlotPolicy) -> Self {
        let slots = slots
            .iter()
            .map(|slot| ResolvedSlot {
                name: slot.name.clone(),
                patterns: slot
                    .channels
                    .iter()
                    .filter_map(|raw| ChannelPattern::parse(raw))
                    .collect(),
            })
            .collect();
        Self { slots, policy }
    }

    pub fn policy(&self) -> SlotPolicy {
        self.policy
    }

    /// First slot (in configured order) containing the channel.
    pub fn resolve(&self, channel_id: &str) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.patterns.iter().any(|p| p.matches(channel_id)))
    }

    /// Every slot containing the channel, in configured order.
    pub fn resolve_all(&self, channel_id: &str) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.patterns.iter().any(|p| p.matches(channel_id)))
            .map(|(i, _)| i)
            .collect()
    }

    /// Slots that evaluate a message from this channel under the configured policy.
    pub fn resolve_for(&self, channel_id: &str) -> Vec<usize> {
        match self.policy {
            SlotPolicy::FirstMatch => self.resolve(channel_id).into_iter().collect(),
            SlotPolicy::AllMatches => self.resolve_all(channel_id),
        }
    }

    /// Whether any slot listens to this channel.
    pub fn is_channel_allowed(&self, channel_id: &str) -> bool {
        self.resolve(channel_id).is_some()
    }

    pub fn slot_name(&self, index: usize) -> Option<&str> {
        self.slots.get(index).map(|s| s.name.as_str())
    }

    pub fn patterns(&self, index: usize) -> &[ChannelPattern] {
        self.slots
            .get(index)
            .map(|s| s.patterns.as_slice())
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
