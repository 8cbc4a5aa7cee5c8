//! Repository Configuration
//!
//! Debounce window, reference cache expiry, live retry bound and the sizes
//! of the dedicated worker pools.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{RepoError, RepoResult};

/// Repository configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Idle window after which buffered live notifications are flushed (default: 100)
    #[serde(default = "default_buffer_debounce_timeout_ms")]
    pub buffer_debounce_timeout_ms: u64,

    /// A batch is flushed early once it holds this many notifications (default: 1024)
    #[serde(default = "default_buffer_max_size")]
    pub buffer_max_size: usize,

    /// Referenced objects expire this long after their last access (default: 60000)
    #[serde(default = "default_cache_expiration_ms")]
    pub cache_expiration_ms: u64,

    /// Resubscribe attempts for a shared live statement (default: 10)
    #[serde(default = "default_live_retry_limit")]
    pub live_retry_limit: u32,

    /// Worker threads for writes (default: 2)
    #[serde(default = "default_update_workers")]
    pub update_workers: usize,

    /// Worker threads for one-shot queries (default: 4)
    #[serde(default = "default_query_workers")]
    pub query_workers: usize,

    /// Worker threads for live notification delivery (default: 2)
    #[serde(default = "default_live_workers")]
    pub live_workers: usize,
}

fn default_buffer_debounce_timeout_ms() -> u64 {
    100
}

fn default_buffer_max_size() -> usize {
    1024
}

fn default_cache_expiration_ms() -> u64 {
    60_000
}

fn default_live_retry_limit() -> u32 {
    10
}

fn default_update_workers() -> usize {
    2
}

fn default_query_workers() -> usize {
    4
}

fn default_live_workers() -> usize {
    2
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            buffer_debounce_timeout_ms: default_buffer_debounce_timeout_ms(),
            buffer_max_size: default_buffer_max_size(),
            cache_expiration_ms: default_cache_expiration_ms(),
            live_retry_limit: default_live_retry_limit(),
            update_workers: default_update_workers(),
            query_workers: default_query_workers(),
            live_workers: default_live_workers(),
        }
    }
}

impl RepositoryConfig {
    /// Parse a JSON document; absent keys take their defaults
    pub fn from_json_str(json: &str) -> RepoResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| RepoError::Config(format!("malformed configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn from_file(path: &Path) -> RepoResult<Self> {
        let json = fs::read_to_string(path).map_err(|e| {
            RepoError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    /// Reject values the live pipeline cannot run with
    pub fn validate(&self) -> RepoResult<()> {
        if self.buffer_max_size == 0 {
            return Err(RepoError::Config("buffer_max_size must be positive".into()));
        }
        if self.update_workers == 0 || self.query_workers == 0 || self.live_workers == 0 {
            return Err(RepoError::Config("worker pools need at least one thread".into()));
        }
        if self.cache_expiration_ms == 0 {
            return Err(RepoError::Config("cache_expiration_ms must be positive".into()));
        }
        Ok(())
    }

    /// Debounce window as a duration
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.buffer_debounce_timeout_ms)
    }

    /// Reference expiry as a duration
    pub fn cache_expiration(&self) -> Duration {
        Duration::from_millis(self.cache_expiration_ms)
    }

    /// Config with a different debounce window
    pub fn with_debounce_ms(mut self, millis: u64) -> Self {
        self.buffer_debounce_timeout_ms = millis;
        self
    }
}
