//! `MessageStore` trait: the async interface for chat history persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::slots::{ChannelPattern, is_private_channel};

/// Default number of messages returned for a single-channel query.
pub const DEFAULT_QUERY_LIMIT: usize = 100;

/// Guild channel or private conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Guild,
    Private,
}

impl ChannelKind {
    pub fn of(channel_id: &str) -> Self {
        if is_private_channel(channel_id) {
            Self::Private
        } else {
            Self::Guild
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Guild => "guild",
            Self::Private => "private",
        }
    }
}

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    /// Platform message id, unique across the store.
    pub id: String,
    pub channel_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub is_bot: bool,
    pub mentions_bot: bool,
}

impl StoredMessage {
    pub fn new(
        id: impl Into<String>,
        channel_id: impl Into<String>,
        sender_id: impl Into<String>,
        content: impl Into<String>,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            channel_id: channel_id.into(),
            sender_id: sender_id.into(),
            sender_name: String::new(),
            content: content.into(),
            sent_at,
            is_bot: false,
            mentions_bot: false,
        }
    }

    pub fn with_sender_name(mut self, name: impl Into<String>) -> Self {
        self.sender_name = name.into();
        self
    }

    pub fn mentioning_bot(mut self) -> Self {
        self.mentions_bot = true;
        self
    }

    pub fn from_bot(mut self) -> Self {
        self.is_bot = true;
        self
    }

    pub fn channel_kind(&self) -> ChannelKind {
        ChannelKind::of(&self.channel_id)
    }
}

/// A set of channels to query, built from slot patterns.
#[derive(Debug, Clone, Default)]
pub struct ChannelScope {
    patterns: Vec<ChannelPattern>,
}

impl ChannelScope {
    pub fn new(patterns: Vec<ChannelPattern>) -> Self {
        Self { patterns }
    }

    pub fn parse<S: AsRef<str>>(raw: &[S]) -> Self {
        Self::new(raw.iter().filter_map(|p| ChannelPattern::parse(p.as_ref())).collect())
    }

    pub fn channel(channel_id: impl Into<String>) -> Self {
        Self::new(vec![ChannelPattern::Exact(channel_id.into())])
    }

    pub fn contains(&self, channel_id: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(channel_id))
    }

    /// A single literal channel.
    pub fn is_single_channel(&self) -> bool {
        matches!(self.patterns.as_slice(), [ChannelPattern::Exact(_)])
    }

    pub fn patterns(&self) -> &[ChannelPattern] {
        &self.patterns
    }

    /// Effective limit: explicit, else the default for single channels, else unbounded.
    pub fn effective_limit(&self, limit: Option<usize>) -> Option<usize> {
        limit.or_else(|| self.is_single_channel().then_some(DEFAULT_QUERY_LIMIT))
    }
}

/// Predicate for bulk deletes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteFilter {
    Sender(String),
    Channel(String),
    AllGuild,
    AllPrivate,
}

impl DeleteFilter {
    pub fn matches(&self, message: &StoredMessage) -> bool {
        match self {
            Self::Sender(id) => message.sender_id == *id,
            Self::Channel(id) => message.channel_id == *id,
            Self::AllGuild => message.channel_kind() == ChannelKind::Guild,
            Self::AllPrivate => message.channel_kind() == ChannelKind::Private,
        }
    }
}

/// Backend-agnostic chat history store.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Upsert by message id. Returns `true` when an existing message was replaced.
    async fn insert_or_replace(&self, message: &StoredMessage) -> Result<bool, DatabaseError>;

    /// The newest `limit` messages of `scope`, returned oldest first.
    async fn query(
        &self,
        scope: &ChannelScope,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>, DatabaseError>;

    /// Delete every message matching the filter. Returns the number removed.
    async fn delete_where(&self, filter: &DeleteFilter) -> Result<usize, DatabaseError>;

    async fn find_channel_by_message_id(&self, message_id: &str) -> Result<Option<String>, DatabaseError>;
}
