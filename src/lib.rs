//! Reply Engine: when to answer in a chat, and with which model.

pub mod channels;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod prompt;
pub mod slots;
pub mod store;
pub mod verifier;
