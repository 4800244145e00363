use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest page the backend will serve.
pub const MAX_PAGE_SIZE: u32 = 200;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Tunables for one channel session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Messages per history page, capped at [`MAX_PAGE_SIZE`].
    pub page_size: u32,
    /// How long a local override beats refetched server values.
    pub override_ttl_ms: u64,
    /// Longest accepted message body, in chars.
    pub max_content_len: usize,
    /// How many push event ids are remembered for redelivery checks.
    pub seen_event_capacity: usize,
    /// Command queue depth between handles and the session task.
    pub mailbox_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            page_size: 50,
            override_ttl_ms: 5_000,
            max_content_len: 4_000,
            seen_event_capacity: 1_024,
            mailbox_capacity: 64,
        }
    }
}

impl SessionConfig {
    /// Read `ROOST_*` variables from the process environment. Unset
    /// variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse(&lookup, "ROOST_PAGE_SIZE")? {
            config.page_size = v;
        }
        if let Some(v) = parse(&lookup, "ROOST_OVERRIDE_TTL_MS")? {
            config.override_ttl_ms = v;
        }
        if let Some(v) = parse(&lookup, "ROOST_MAX_CONTENT_LEN")? {
            config.max_content_len = v;
        }
        if let Some(v) = parse(&lookup, "ROOST_SEEN_EVENT_CAPACITY")? {
            config.seen_event_capacity = v;
        }
        if let Some(v) = parse(&lookup, "ROOST_MAILBOX_CAPACITY")? {
            config.mailbox_capacity = v;
        }

        Ok(config.normalized())
    }

    /// Clamp values into the ranges the session can work with.
    pub fn normalized(mut self) -> Self {
        self.page_size = self.page_size.clamp(1, MAX_PAGE_SIZE);
        self.seen_event_capacity = self.seen_event_capacity.max(1);
        self.mailbox_capacity = self.mailbox_capacity.max(1);
        self
    }

    pub fn override_ttl(&self) -> Duration {
        Duration::from_millis(self.override_ttl_ms)
    }
}

fn parse<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}
