//! CLI channel: stdin/stdout REPL for local testing.
//!
//! Each input line is `<channel> <text>`. A line without a channel prefix
//! goes to the default channel. `@<bot name>` in the text marks a mention.

use std::io::{self, Write};
use std::pin::Pin;

use async_trait::async_trait;
use chrono::Utc;
use futures::{Stream, stream};
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

use crate::error::ChannelError;
use crate::pipeline::ReplySink;
use crate::store::StoredMessage;

/// Stream of inbound messages.
pub type MessageStream = Pin<Box<dyn Stream<Item = StoredMessage> + Send>>;

pub const CLI_SENDER: &str = "local-user";

/// Reads messages from stdin and writes replies to stdout.
pub struct CliChannel {
    bot_name: String,
    default_channel: String,
}

impl CliChannel {
    pub fn new(bot_name: impl Into<String>, default_channel: impl Into<String>) -> Self {
        Self {
            bot_name: bot_name.into(),
            default_channel: default_channel.into(),
        }
    }

    pub fn name(&self) -> &str {
        "cli"
    }

    /// Turn one input line into a message. Blank lines yield nothing.
    pub fn parse_line(&self, line: &str) -> Option<StoredMessage> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let (channel, text) = match line.split_once(char::is_whitespace) {
            Some((head, rest)) if looks_like_channel(head) => (head, rest.trim()),
            _ if looks_like_channel(line) => return None,
            _ => (self.default_channel.as_str(), line),
        };
        if text.is_empty() {
            return None;
        }

        let mention = format!("@{}", self.bot_name.to_lowercase());
        let message =
            StoredMessage::new(Uuid::new_v4().to_string(), channel, CLI_SENDER, text, Utc::now())
                .with_sender_name("you");
        Some(if text.to_lowercase().contains(&mention) {
            message.mentioning_bot()
        } else {
            message
        })
    }

    pub fn start(self: std::sync::Arc<Self>) -> MessageStream {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            let stdin = tokio::io::stdin();
            let reader = BufReader::new(stdin);
            let mut lines = reader.lines();

            eprint!("> ");

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let Some(msg) = self.parse_line(&line) else {
                            eprint!("> ");
                            continue;
                        };
                        if tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break, // EOF
                    Err(e) => {
                        tracing::error!("Error reading stdin: {}", e);
                        break;
                    }
                }
            }
        });

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });

        Box::pin(stream)
    }
}

/// Channel ids are numeric or `private:<id>`.
fn looks_like_channel(token: &str) -> bool {
    match token.strip_prefix("private:") {
        Some(id) => !id.is_empty(),
        None => token.chars().all(|c| c.is_ascii_digit()),
    }
}

/// Write one reply line. A closed pipe means the reader went away.
fn write_reply<W: Write>(
    out: &mut W,
    channel_id: &str,
    bot_name: &str,
    text: &str,
) -> Result<(), ChannelError> {
    writeln!(out, "[{channel_id}] {bot_name}: {text}")
        .and_then(|()| out.flush())
        .map_err(|e| match e.kind() {
            io::ErrorKind::BrokenPipe => ChannelError::Disconnected {
                name: "cli".to_string(),
                reason: e.to_string(),
            },
            _ => ChannelError::SendFailed {
                name: "cli".to_string(),
                reason: e.to_string(),
            },
        })
}

#[async_trait]
impl ReplySink for CliChannel {
    async fn send(&self, channel_id: &str, text: &str) -> Result<(), ChannelError> {
        write_reply(&mut io::stdout().lock(), channel_id, &self.bot_name, text)?;
        eprint!("> ");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli() -> CliChannel {
        CliChannel::new("Athena", "cli")
    }

    #[test]
    fn channel_prefix_is_parsed() {
        let msg = cli().parse_line("100 hello there").unwrap();
        assert_eq!(msg.channel_id, "100");
        assert_eq!(msg.content, "hello there");
        assert_eq!(msg.sender_id, CLI_SENDER);

        let dm = cli().parse_line("private:42 hi").unwrap();
        assert_eq!(dm.channel_id, "private:42");
    }

    #[test]
    fn plain_text_goes_to_default_channel() {
        let msg = cli().parse_line("  what's up  ").unwrap();
        assert_eq!(msg.channel_id, "cli");
        assert_eq!(msg.content, "what's up");
        assert!(!msg.mentions_bot);
    }

    #[test]
    fn mention_is_case_insensitive() {
        assert!(cli().parse_line("100 hey @athena you there").unwrap().mentions_bot);
    }

    /// Writer failing every call with the given error kind.
    struct FailingWriter(io::ErrorKind);

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(self.0, "stdout unavailable"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn reply_line_format() {
        let mut out = Vec::new();
        write_reply(&mut out, "100", "Athena", "hi").unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "[100] Athena: hi\n");
    }

    #[test]
    fn write_failures_map_to_channel_errors() {
        let closed = write_reply(&mut FailingWriter(io::ErrorKind::BrokenPipe), "100", "Athena", "hi");
        assert!(matches!(closed, Err(ChannelError::Disconnected { name, .. }) if name == "cli"));

        let failed = write_reply(&mut FailingWriter(io::ErrorKind::Other), "100", "Athena", "hi");
        assert!(matches!(failed, Err(ChannelError::SendFailed { reason, .. }) if reason.contains("unavailable")));
    }

    #[test]
    fn blank_and_channel_only_lines_are_skipped() {
        assert!(cli().parse_line("   ").is_none());
        assert!(cli().parse_line("100").is_none());
        assert!(cli().parse_line("100    ").is_none());
    }
}
