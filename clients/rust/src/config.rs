//! Engine configuration read from the environment.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

pub const HASH_SALT_ENV: &str = "BUCKETING_HASH_SALT";
pub const WINDOW_BOUNDS_ENV: &str = "BUCKETING_WINDOW_BOUNDS";

/// Boundary semantics of allocation date windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WindowBounds {
    /// `active_from <= now < active_until`
    #[default]
    HalfOpen,
    /// `active_from <= now <= active_until`
    Inclusive,
}

impl WindowBounds {
    pub fn as_str(self) -> &'static str {
        match self {
            WindowBounds::HalfOpen => "half-open",
            WindowBounds::Inclusive => "inclusive",
        }
    }
}

impl fmt::Display for WindowBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid window bounds '{0}', expected 'half-open' or 'inclusive'")]
pub struct InvalidWindowBounds(pub String);

impl FromStr for WindowBounds {
    type Err = InvalidWindowBounds;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "half-open" | "half_open" => Ok(WindowBounds::HalfOpen),
            "inclusive" => Ok(WindowBounds::Inclusive),
            _ => Err(InvalidWindowBounds(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineConfig {
    /// Matrix-wide salt prefixed to every identifier hash.
    pub hash_salt: String,
    pub window_bounds: WindowBounds,
}

impl EngineConfig {
    /// Read `BUCKETING_HASH_SALT` and `BUCKETING_WINDOW_BOUNDS`. Unparseable
    /// window bounds fall back to the default.
    pub fn from_env() -> Self {
        let hash_salt = std::env::var(HASH_SALT_ENV).unwrap_or_default();
        let window_bounds = match std::env::var(WINDOW_BOUNDS_ENV) {
            Ok(raw) => raw.parse().unwrap_or_else(|e: InvalidWindowBounds| {
                tracing::warn!(error = %e, "ignoring {WINDOW_BOUNDS_ENV}");
                WindowBounds::default()
            }),
            Err(_) => WindowBounds::default(),
        };
        Self {
            hash_salt,
            window_bounds,
        }
    }

    pub fn with_hash_salt(mut self, salt: impl Into<String>) -> Self {
        self.hash_salt = salt.into();
        self
    }

    pub fn with_window_bounds(mut self, bounds: WindowBounds) -> Self {
        self.window_bounds = bounds;
        self
    }
}

static CONFIG: OnceLock<EngineConfig> = OnceLock::new();

/// Process-wide configuration, read from the environment on first use.
pub fn config() -> &'static EngineConfig {
    CONFIG.get_or_init(EngineConfig::from_env)
}
