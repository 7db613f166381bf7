//! In-memory `MessageStore`, used when no database path is configured.

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::DatabaseError;
use crate::store::traits::{ChannelScope, DeleteFilter, MessageStore, StoredMessage};

/// Messages kept in insertion order.
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    messages: RwLock<Vec<StoredMessage>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn insert_or_replace(&self, message: &StoredMessage) -> Result<bool, DatabaseError> {
        let mut messages = self.messages.write().await;
        if let Some(existing) = messages.iter_mut().find(|m| m.id == message.id) {
            warn!(message_id = %message.id, "Message already stored, replacing");
            *existing = message.clone();
            return Ok(true);
        }
        messages.push(message.clone());
        Ok(false)
    }

    async fn query(
        &self,
        scope: &ChannelScope,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>, DatabaseError> {
        let messages = self.messages.read().await;
        let mut selected: Vec<StoredMessage> = messages
            .iter()
            .filter(|m| scope.contains(&m.channel_id))
            .cloned()
            .collect();
        // Stable: equal timestamps keep insertion order.
        selected.sort_by_key(|m| m.sent_at);

        if let Some(limit) = scope.effective_limit(limit) {
            let skip = selected.len().saturating_sub(limit);
            selected.drain(..skip);
        }
        Ok(selected)
    }

    async fn delete_where(&self, filter: &DeleteFilter) -> Result<usize, DatabaseError> {
        let mut messages = self.messages.write().await;
        let before = messages.len();
        messages.retain(|m| !filter.matches(m));
        Ok(before - messages.len())
    }

    async fn find_channel_by_message_id(&self, message_id: &str) -> Result<Option<String>, DatabaseError> {
        let messages = self.messages.read().await;
        Ok(messages
            .iter()
            .find(|m| m.id == message_id)
            .map(|m| m.channel_id.clone()))
    }
}
