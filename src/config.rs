//! Client configuration.
//!
//! Knobs for the transport and the throttle buffer. Defaults match what the
//! server side expects; `from_env` lets the headless CLI override them.

use std::time::Duration;

use crate::error::ConfigError;

/// Default throttle quantum between batched flushes.
pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(125);

/// Content types decoded as line-delimited JSON streams.
pub const DEFAULT_STREAM_CONTENT_TYPES: &[&str] = &["application/jsonlines", "application/x-ndjson"];

/// Configuration shared by a session and its transport.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Minimum spacing between flushes of batched bare actions.
    pub throttle: Duration,

    /// Per-request timeout. `None` leaves it to the server/network.
    pub request_timeout: Option<Duration>,

    /// `User-Agent` sent with every request.
    pub user_agent: String,

    /// Response content types treated as JSON-lines streams (substring match).
    pub stream_content_types: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            throttle: DEFAULT_THROTTLE,
            request_timeout: None,
            user_agent: concat!("routelit-client/", env!("CARGO_PKG_VERSION")).to_string(),
            stream_content_types: DEFAULT_STREAM_CONTENT_TYPES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl ClientConfig {
    /// Defaults overridden by `ROUTELIT_THROTTLE_MS`, `ROUTELIT_TIMEOUT_SECS`
    /// and `ROUTELIT_USER_AGENT` when set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ClientConfig::from_env`] with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(raw) = lookup("ROUTELIT_THROTTLE_MS") {
            config.throttle = Duration::from_millis(parse_u64("ROUTELIT_THROTTLE_MS", &raw)?);
        }
        if let Some(raw) = lookup("ROUTELIT_TIMEOUT_SECS") {
            let secs = parse_u64("ROUTELIT_TIMEOUT_SECS", &raw)?;
            config.request_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(agent) = lookup("ROUTELIT_USER_AGENT") {
            config.user_agent = agent;
        }
        Ok(config)
    }

    /// Set the throttle quantum.
    pub fn throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    /// Set the per-request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = agent.into();
        self
    }

    /// Whether a response `Content-Type` announces a JSON-lines stream.
    pub fn is_stream_content_type(&self, content_type: &str) -> bool {
        self.stream_content_types
            .iter()
            .any(|t| content_type.contains(t.as_str()))
    }
}

fn parse_u64(key: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim().parse().map_err(|e: std::num::ParseIntError| ConfigError::Invalid {
        key,
        message: e.to_string(),
    })
}
