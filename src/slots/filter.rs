//! Content filter that vetoes triggers.
//!
//! Patterns are regular expressions matched case-insensitively anywhere in the
//! message. A pattern that fails to compile is logged and never matches.

use regex::{Regex, RegexBuilder};
use tracing::warn;

#[derive(Debug, Clone)]
struct FilterRule {
    pattern: String,
    regex: Regex,
}

/// Compiled filter list for one slot.
#[derive(Debug, Clone, Default)]
pub struct FilterList {
    rules: Vec<FilterRule>,
}

impl FilterList {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let rules = patterns
            .iter()
            .map(|p| p.as_ref())
            .filter(|p| !p.trim().is_empty())
            .filter_map(|pattern| {
                match RegexBuilder::new(pattern).case_insensitive(true).build() {
                    Ok(regex) => Some(FilterRule {
                        pattern: pattern.to_string(),
                        regex,
                    }),
                    Err(e) => {
                        warn!(pattern = %pattern, error = %e, "Ignoring malformed filter pattern");
                        None
                    }
                }
            })
            .collect();
        Self { rules }
    }

    /// Returns the first pattern that matches the content.
    pub fn matches(&self, content: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|rule| rule.regex.is_match(content))
            .map(|rule| rule.pattern.as_str())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
