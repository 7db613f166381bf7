//! Prompt templating and chat history rendering.

use chrono::{DateTime, Local, Utc};

use crate::store::StoredMessage;

/// Replace `{{key}}` and `${key}` placeholders. Unknown placeholders are kept.
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find(['{', '$']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        let (open, close) = if tail.starts_with("{{") {
            ("{{", "}}")
        } else if tail.starts_with("${") {
            ("${", "}")
        } else {
            out.push_str(&tail[..1]);
            rest = &tail[1..];
            continue;
        };

        let body = &tail[open.len()..];
        match body.find(close) {
            Some(end) => {
                let key = body[..end].trim();
                match vars.iter().find(|(k, _)| *k == key) {
                    Some((_, value)) => out.push_str(value),
                    None => out.push_str(&tail[..open.len() + end + close.len()]),
                }
                rest = &body[end + close.len()..];
            }
            None => {
                out.push_str(tail);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn format_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

/// One history line: `[YYYY-MM-DD HH:MM:SS] name: content`.
pub fn format_history_line(message: &StoredMessage, bot_name: &str) -> String {
    let name = if message.is_bot {
        bot_name
    } else if message.sender_name.is_empty() {
        &message.sender_id
    } else {
        &message.sender_name
    };
    format!("[{}] {}: {}", format_time(message.sent_at), name, message.content)
}

/// Render messages (oldest first) as a transcript.
pub fn format_history(messages: &[StoredMessage], bot_name: &str) -> String {
    messages
        .iter()
        .map(|m| format_history_line(m, bot_name))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn renders_both_placeholder_styles() {
        let out = render_template(
            "I am {{botName}}, you said ${ lastUserMessage }.",
            &[("botName", "Athena"), ("lastUserMessage", "hi")],
        );
        assert_eq!(out, "I am Athena, you said hi.");
    }

    #[test]
    fn unknown_and_unterminated_placeholders_are_kept() {
        assert_eq!(render_template("{{nope}} and ${x}", &[]), "{{nope}} and ${x}");
        assert_eq!(render_template("cost: $5 {{open", &[("open", "x")]), "cost: $5 {{open");
        assert_eq!(render_template("{a} {{a}}", &[("a", "1")]), "{a} 1");
    }

    #[test]
    fn history_lines_use_display_name_and_bot_name() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut msg = StoredMessage::new("m1", "100", "u1", "hello", at);
        msg.sender_name = "Alice".into();
        let line = format_history_line(&msg, "Athena");
        assert!(line.ends_with("] Alice: hello"));
        assert!(line.starts_with('['));

        msg.is_bot = true;
        assert!(format_history_line(&msg, "Athena").ends_with("] Athena: hello"));

        msg.is_bot = false;
        msg.sender_name.clear();
        assert!(format_history_line(&msg, "Athena").ends_with("] u1: hello"));
    }
}
