//! Client configuration and endpoint construction.
//!
//! Layering, lowest to highest precedence:
//!
//! 1. [`SessionConfig::default`]
//! 2. JSON file named by `CODECOLLAB_CONFIG`
//! 3. `CODECOLLAB_API_URL` / `CODECOLLAB_WS_URL`
//!
//! When no WebSocket base is configured it is derived from the API base by
//! swapping the scheme (`http` → `ws`, `https` → `wss`).

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::reconnect::ReconnectConfig;

pub const ENV_CONFIG: &str = "CODECOLLAB_CONFIG";
pub const ENV_API_URL: &str = "CODECOLLAB_API_URL";
pub const ENV_WS_URL: &str = "CODECOLLAB_WS_URL";

/// Session client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// HTTP base for snapshot fetches, e.g. `https://collab.example.com`
    pub api_base: String,
    /// WebSocket base; empty = derived from `api_base`
    pub ws_base: String,
    pub reconnect: ReconnectConfig,
    /// Lifetime of the one-shot echo guard in milliseconds
    pub echo_guard_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_base: "http://127.0.0.1:8000".to_string(),
            ws_base: String::new(),
            reconnect: ReconnectConfig::default(),
            echo_guard_ms: 100,
        }
    }
}

impl SessionConfig {
    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Self::parse_json(json)?.normalized()
    }

    fn parse_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Build from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match non_empty(lookup(ENV_CONFIG)) {
            Some(path) => {
                let path = PathBuf::from(path);
                let json = std::fs::read_to_string(&path).map_err(|e| ConfigError::Read {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
                Self::parse_json(&json)?
            }
            None => Self::default(),
        };

        if let Some(api) = non_empty(lookup(ENV_API_URL)) {
            config.api_base = api;
        }
        if let Some(ws) = non_empty(lookup(ENV_WS_URL)) {
            config.ws_base = ws;
        }
        config.normalized()
    }

    /// Strip trailing slashes, derive the WebSocket base, validate schemes.
    fn normalized(mut self) -> Result<Self, ConfigError> {
        self.api_base = trim_base(&self.api_base);
        self.ws_base = trim_base(&self.ws_base);

        if !(self.api_base.starts_with("http://") || self.api_base.starts_with("https://")) {
            return Err(ConfigError::InvalidUrl(self.api_base));
        }
        if self.ws_base.is_empty() {
            self.ws_base = derive_ws_base(&self.api_base);
        }
        if !(self.ws_base.starts_with("ws://") || self.ws_base.starts_with("wss://")) {
            return Err(ConfigError::InvalidUrl(self.ws_base));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(ConfigError::Invalid("reconnect.max_attempts must be positive"));
        }
        Ok(self)
    }

    pub fn echo_guard(&self) -> Duration {
        Duration::from_millis(self.echo_guard_ms)
    }

    /// WebSocket endpoint of one session.
    pub fn endpoint(&self, space_id: &str) -> Result<String, ConfigError> {
        validate_space_id(space_id)?;
        Ok(format!("{}/ws/{space_id}", self.ws_base()))
    }

    /// The configured WebSocket base, or the one derived from `api_base`.
    pub fn ws_base(&self) -> String {
        if self.ws_base.is_empty() {
            derive_ws_base(&trim_base(&self.api_base))
        } else {
            trim_base(&self.ws_base)
        }
    }

    /// Collection URL; sessions are created by posting to it.
    pub fn spaces_url(&self) -> String {
        format!("{}/api/spaces", trim_base(&self.api_base))
    }

    /// Snapshot URL of one session.
    pub fn snapshot_url(&self, space_id: &str) -> Result<String, ConfigError> {
        validate_space_id(space_id)?;
        Ok(format!("{}/{space_id}", self.spaces_url()))
    }
}

/// Shareable link to a session page served from `origin`.
pub fn invite_link(origin: &str, space_id: &str) -> Result<String, ConfigError> {
    validate_space_id(space_id)?;
    Ok(format!("{}/space/{space_id}", trim_base(origin)))
}

pub fn validate_space_id(space_id: &str) -> Result<(), ConfigError> {
    let bad = space_id.is_empty()
        || space_id
            .chars()
            .any(|c| c == '/' || c == '?' || c == '#' || c.is_whitespace());
    if bad {
        return Err(ConfigError::InvalidSpaceId(space_id.to_string()));
    }
    Ok(())
}

fn trim_base(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

fn derive_ws_base(api_base: &str) -> String {
    if let Some(rest) = api_base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = api_base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        api_base.to_string()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path:?}: {reason}")]
    Read { path: PathBuf, reason: String },
    #[error("invalid config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
    #[error("unsupported url `{0}`")]
    InvalidUrl(String),
    #[error("invalid space id `{0}`")]
    InvalidSpaceId(String),
}
