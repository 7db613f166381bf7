//! Persistence layer: chat history behind the `MessageStore` trait.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlMessageStore;
pub use memory::InMemoryMessageStore;
pub use traits::{
    ChannelKind, ChannelScope, DEFAULT_QUERY_LIMIT, DeleteFilter, MessageStore, StoredMessage,
};
