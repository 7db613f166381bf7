//! Splits a generated reply into chat-sized segments and paces them.

use std::time::Duration;

use regex::Regex;
use tracing::warn;

use crate::config::BotConfig;

#[derive(Debug, Clone)]
pub struct ReplyFormatter {
    split: Option<Regex>,
    replacements: Vec<(Regex, String)>,
    words_per_second: f64,
}

impl ReplyFormatter {
    pub fn new(config: &BotConfig) -> Self {
        let split = match Regex::new(&config.reply_split_regex) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(pattern = %config.reply_split_regex, error = %e, "Invalid reply split pattern, replies are sent whole");
                None
            }
        };
        let replacements = config
            .sentence_replacements
            .iter()
            .filter_map(|(pattern, replacement)| match Regex::new(pattern) {
                Ok(re) => Some((re, replacement.clone())),
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "Skipping invalid sentence replacement");
                    None
                }
            })
            .collect();
        Self {
            split,
            replacements,
            words_per_second: config.words_per_second,
        }
    }

    /// Split after every separator match, apply replacements, drop blanks.
    pub fn segments(&self, reply: &str) -> Vec<String> {
        let mut pieces = Vec::new();
        match &self.split {
            Some(re) => {
                let mut start = 0;
                for m in re.find_iter(reply) {
                    if m.end() > start {
                        pieces.push(&reply[start..m.end()]);
                        start = m.end();
                    }
                }
                pieces.push(&reply[start..]);
            }
            None => pieces.push(reply),
        }

        pieces
            .into_iter()
            .map(|piece| self.apply_replacements(piece.trim()))
            .map(|piece| piece.trim().to_string())
            .filter(|piece| !piece.is_empty())
            .collect()
    }

    fn apply_replacements(&self, segment: &str) -> String {
        self.replacements
            .iter()
            .fold(segment.to_string(), |acc, (re, replacement)| {
                re.replace_all(&acc, replacement.as_str()).into_owned()
            })
    }

    /// Simulated typing time for one segment.
    pub fn typing_delay(&self, segment: &str) -> Duration {
        if !(self.words_per_second > 0.0) {
            return Duration::ZERO;
        }
        let chars = segment.chars().count() as f64;
        Duration::from_secs_f64(chars / self.words_per_second)
    }
}
