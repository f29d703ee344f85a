//! Named rate-limit categories and their administration.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Windowing strategy for a limit category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitStrategy {
    /// Trailing window over individual event timestamps.
    Sliding,
    /// Counter that resets when the window rolls over.
    Fixed,
}

impl RateLimitStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitStrategy::Sliding => "sliding",
            RateLimitStrategy::Fixed => "fixed",
        }
    }
}

/// Quota definition for one named category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub name: String,
    /// Maximum events admitted per window.
    pub limit: u32,
    pub window: Duration,
    pub strategy: RateLimitStrategy,
}

impl RateLimitConfig {
    pub fn sliding(name: impl Into<String>, limit: u32, window: Duration) -> Self {
        Self {
            name: name.into(),
            limit,
            window,
            strategy: RateLimitStrategy::Sliding,
        }
    }

    pub fn fixed(name: impl Into<String>, limit: u32, window: Duration) -> Self {
        Self {
            name: name.into(),
            limit,
            window,
            strategy: RateLimitStrategy::Fixed,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), RateLimitError> {
        if self.name.is_empty() {
            return Err(RateLimitError::InvalidConfig(
                "limit name must not be empty".to_string(),
            ));
        }
        if self.limit < 1 {
            return Err(RateLimitError::InvalidConfig(format!(
                "limit for '{}' must be at least 1",
                self.name
            )));
        }
        if self.window < Duration::milliseconds(1) {
            return Err(RateLimitError::InvalidConfig(format!(
                "window for '{}' must be at least 1ms",
                self.name
            )));
        }
        Ok(())
    }
}

/// Categories every limiter carries out of the box. Integrators rely on
/// these existing without registration.
pub(crate) fn seed_defaults() -> Vec<RateLimitConfig> {
    vec![
        RateLimitConfig::sliding("global", 1_000, Duration::seconds(60)),
        RateLimitConfig::sliding("api", 100, Duration::seconds(60)),
        RateLimitConfig::fixed("auth", 10, Duration::seconds(60)),
        RateLimitConfig::fixed("upload", 20, Duration::seconds(300)),
    ]
}

/// Partial update applied to an existing category.
///
/// Changes take effect on the next check; existing windows are not
/// recomputed retroactively.
#[derive(Debug, Clone, Default)]
pub struct RateLimitConfigUpdate {
    pub limit: Option<u32>,
    pub window: Option<Duration>,
    pub strategy: Option<RateLimitStrategy>,
}

impl RateLimitConfigUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = Some(window);
        self
    }

    pub fn with_strategy(mut self, strategy: RateLimitStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub(crate) fn apply(&self, config: &mut RateLimitConfig) {
        if let Some(limit) = self.limit {
            config.limit = limit;
        }
        if let Some(window) = self.window {
            config.window = window;
        }
        if let Some(strategy) = self.strategy {
            config.strategy = strategy;
        }
    }
}

/// Rate limiter administration error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("unknown limit category: {0}")]
    UnknownLimit(String),
    #[error("invalid limit config: {0}")]
    InvalidConfig(String),
}
