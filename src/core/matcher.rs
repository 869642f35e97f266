//! Case-insensitive pattern matching for post text.

use crate::core::error::SkywatchError;
use regex::{Regex, RegexBuilder};

/// A scan's compiled pattern. Compiled once per scan run, before any network
/// call, so a bad pattern fails the whole batch up front.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    regex: Regex,
    pattern: String,
}

impl PatternMatcher {
    pub fn compile(pattern: &str) -> Result<Self, SkywatchError> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| SkywatchError::Config(format!("invalid pattern '{}': {}", pattern, e)))?;
        Ok(PatternMatcher {
            regex,
            pattern: pattern.to_string(),
        })
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    /// The original pattern string, as it appears in notification payloads.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}
