//! Manual bucket overrides.

use std::collections::BTreeMap;
use std::fmt;

/// Token that switches [`ForceGroupsOptions::parse`] into fallback mode.
pub const DEFAULT_TO_FALLBACK: &str = "default_to_fallback";

/// What happens to tests that have no forced bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ForceGroupsDefaultMode {
    /// Evaluate normally.
    #[default]
    Normal,
    /// Leave unassigned so the caller applies its own default.
    Fallback,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForceGroupsOptions {
    forced: BTreeMap<String, i32>,
    default_mode: ForceGroupsDefaultMode,
}

impl ForceGroupsOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_force(mut self, test_name: impl Into<String>, value: i32) -> Self {
        self.forced.insert(test_name.into(), value);
        self
    }

    pub fn with_default_mode(mut self, mode: ForceGroupsDefaultMode) -> Self {
        self.default_mode = mode;
        self
    }

    pub fn forced_bucket_value(&self, test_name: &str) -> Option<i32> {
        self.forced.get(test_name).copied()
    }

    pub fn default_mode(&self) -> ForceGroupsDefaultMode {
        self.default_mode
    }

    pub fn is_empty(&self) -> bool {
        self.forced.is_empty() && self.default_mode == ForceGroupsDefaultMode::Normal
    }

    /// Parse a comma-separated override string such as
    /// `colorTest1,otherTest-1,default_to_fallback`.
    ///
    /// Each token is a test name immediately followed by an integer bucket
    /// value. Malformed tokens are skipped. A later token for the same test
    /// wins.
    pub fn parse(input: &str) -> Self {
        let mut options = Self::new();
        for token in input.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if token == DEFAULT_TO_FALLBACK {
                options.default_mode = ForceGroupsDefaultMode::Fallback;
                continue;
            }
            match split_token(token) {
                Some((name, value)) => {
                    options.forced.insert(name.to_string(), value);
                }
                None => tracing::debug!(token, "ignoring malformed force group"),
            }
        }
        options
    }
}

// "name-12" -> ("name", -12); the name keeps everything before the trailing digits.
fn split_token(token: &str) -> Option<(&str, i32)> {
    let digits_start = token
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i)?;
    let value_start = match token[..digits_start].strip_suffix('-') {
        Some(_) => digits_start - 1,
        None => digits_start,
    };
    let name = &token[..value_start];
    if name.is_empty() {
        return None;
    }
    let value = token[value_start..].parse().ok()?;
    Some((name, value))
}

impl fmt::Display for ForceGroupsOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tokens: Vec<String> = self
            .forced
            .iter()
            .map(|(name, value)| format!("{name}{value}"))
            .collect();
        if self.default_mode == ForceGroupsDefaultMode::Fallback {
            tokens.push(DEFAULT_TO_FALLBACK.to_string());
        }
        f.write_str(&tokens.join(","))
    }
}
