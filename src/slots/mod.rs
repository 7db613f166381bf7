//! Memory slots: channel grouping, content filters and trigger policy.

pub mod filter;
pub mod resolver;
pub mod trigger;

pub use filter::FilterList;
pub use resolver::{ChannelPattern, SlotResolver, is_private_channel};
pub use trigger::{
    Admission, SlotRuntimeState, TriggerDecision, TriggerPolicy, TriggerReason, TriggerState,
};
