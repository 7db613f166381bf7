//! libSQL `MessageStore` backend. Supports local file and in-memory databases.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::params::Params;
use libsql::{Connection, Value, params};
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::slots::ChannelPattern;
use crate::store::migrations;
use crate::store::traits::{
    ChannelKind, ChannelScope, DeleteFilter, MessageStore, StoredMessage,
};

/// libSQL database backend.
///
/// Holds one connection reused for every operation; `libsql::Connection` is
/// `Send + Sync` and safe for concurrent async use.
pub struct LibSqlMessageStore {
    _db: libsql::Database,
    conn: Connection,
}

impl LibSqlMessageStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;
        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Message store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: libsql::Database) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self { _db: db, conn })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width UTC timestamps so text order equals time order.
fn format_datetime(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

const MESSAGE_COLUMNS: &str =
    "message_id, channel_id, sender_id, sender_name, content, sent_at, is_bot, mentions_bot";

fn row_to_message(row: &libsql::Row) -> Result<StoredMessage, libsql::Error> {
    let sent_at: String = row.get(5)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_name: row.get(3)?,
        content: row.get(4)?,
        sent_at: parse_datetime(&sent_at),
        is_bot: row.get::<i64>(6)? != 0,
        mentions_bot: row.get::<i64>(7)? != 0,
    })
}

/// Build the `WHERE` clause for a scope. `None` means the scope is empty.
fn scope_clause(scope: &ChannelScope) -> Option<(String, Vec<Value>)> {
    let mut clauses = Vec::new();
    let mut values = Vec::new();
    for pattern in scope.patterns() {
        match pattern {
            ChannelPattern::Exact(id) => {
                values.push(Value::Text(id.clone()));
                clauses.push(format!("channel_id = ?{}", values.len()));
            }
            ChannelPattern::AllGuild => {
                clauses.push(format!("channel_kind = '{}'", ChannelKind::Guild.as_str()));
            }
            ChannelPattern::AllPrivate => {
                clauses.push(format!("channel_kind = '{}'", ChannelKind::Private.as_str()));
            }
        }
    }
    if clauses.is_empty() {
        return None;
    }
    Some((clauses.join(" OR "), values))
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl MessageStore for LibSqlMessageStore {
    async fn insert_or_replace(&self, message: &StoredMessage) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let existed = conn
            .query(
                "SELECT 1 FROM messages WHERE message_id = ?1",
                params![message.id.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_or_replace: {e}")))?
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_or_replace: {e}")))?
            .is_some();

        conn.execute(
            "INSERT INTO messages (message_id, channel_id, channel_kind, sender_id, sender_name,
                content, sent_at, is_bot, mentions_bot)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(message_id) DO UPDATE SET
                channel_id = excluded.channel_id,
                channel_kind = excluded.channel_kind,
                sender_id = excluded.sender_id,
                sender_name = excluded.sender_name,
                content = excluded.content,
                sent_at = excluded.sent_at,
                is_bot = excluded.is_bot,
                mentions_bot = excluded.mentions_bot",
            params![
                message.id.as_str(),
                message.channel_id.as_str(),
                message.channel_kind().as_str(),
                message.sender_id.as_str(),
                message.sender_name.as_str(),
                message.content.as_str(),
                format_datetime(message.sent_at),
                i64::from(message.is_bot),
                i64::from(message.mentions_bot),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert_or_replace: {e}")))?;

        if existed {
            warn!(message_id = %message.id, "Message already stored, replacing");
        } else {
            debug!(message_id = %message.id, channel = %message.channel_id, "Message stored");
        }
        Ok(existed)
    }

    async fn query(
        &self,
        scope: &ChannelScope,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>, DatabaseError> {
        let Some((clause, mut values)) = scope_clause(scope) else {
            return Ok(Vec::new());
        };
        let limit_sql = match scope.effective_limit(limit) {
            Some(limit) => {
                values.push(Value::Integer(limit as i64));
                format!(" LIMIT ?{}", values.len())
            }
            None => String::new(),
        };
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE {clause} ORDER BY sent_at DESC, rowid DESC{limit_sql}"
        );

        let mut rows = self
            .conn()
            .query(&sql, Params::Positional(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("query: {e}")))?;

        let mut messages = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("query: {e}")))?
        {
            match row_to_message(&row) {
                Ok(msg) => messages.push(msg),
                Err(e) => warn!("Skipping message row: {e}"),
            }
        }
        messages.reverse();
        Ok(messages)
    }

    async fn delete_where(&self, filter: &DeleteFilter) -> Result<usize, DatabaseError> {
        let conn = self.conn();
        let result = match filter {
            DeleteFilter::Sender(id) => {
                conn.execute("DELETE FROM messages WHERE sender_id = ?1", params![id.as_str()])
                    .await
            }
            DeleteFilter::Channel(id) => {
                conn.execute("DELETE FROM messages WHERE channel_id = ?1", params![id.as_str()])
                    .await
            }
            DeleteFilter::AllGuild => {
                conn.execute(
                    "DELETE FROM messages WHERE channel_kind = ?1",
                    params![ChannelKind::Guild.as_str()],
                )
                .await
            }
            DeleteFilter::AllPrivate => {
                conn.execute(
                    "DELETE FROM messages WHERE channel_kind = ?1",
                    params![ChannelKind::Private.as_str()],
                )
                .await
            }
        };
        let count = result.map_err(|e| DatabaseError::Query(format!("delete_where: {e}")))?;
        if count > 0 {
            info!(count, filter = ?filter, "Deleted messages");
        }
        Ok(count as usize)
    }

    async fn find_channel_by_message_id(&self, message_id: &str) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT channel_id FROM messages WHERE message_id = ?1",
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_channel_by_message_id: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<String>(0)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_channel_by_message_id: {e}"))),
        }
    }
}
