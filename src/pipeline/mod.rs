//! Reply pipeline.
//!
//! Every inbound message flows through:
//! 1. `ReplyEngine::ingest()`: store, slot resolution, trigger evaluation
//! 2. `ReplyEngine::run_fired()`: one turn per fired slot, serialized by the
//!    slot's processing lease
//! 3. `ReplyFormatter`: segmenting and pacing before the `ReplySink`

pub mod engine;
pub mod postprocess;
pub mod types;

pub use engine::{EngineDeps, ReplyEngine, spawn_tick_task};
pub use postprocess::ReplyFormatter;
pub use types::{FiredTrigger, ReplySink, SkipReason, TurnOutcome};
