//! Loader configuration.
//!
//! [`LoaderConfig`] can be built in code with the `with_*` setters or read
//! from JSON, where durations are expressed in milliseconds:
//!
//! ```
//! use std::time::Duration;
//! use dataloader::LoaderConfig;
//!
//! let config = LoaderConfig::from_json(r#"{ "max_batch_size": 50, "batch_timeout_ms": 5 }"#).unwrap();
//! assert_eq!(config.max_batch_size, 50);
//! assert_eq!(config.batch_timeout, Duration::from_millis(5));
//! assert!(config.cache);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default cap on keys per fetch invocation.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// Default time a partial batch waits before it is flushed (~one frame).
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_millis(16);

/// Errors produced while building a [`LoaderConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("max_batch_size must be at least 1")]
    InvalidBatchSize,

    #[error("fetch_timeout must be non-zero")]
    InvalidFetchTimeout,

    #[error("invalid loader configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Tuning knobs for a [`Loader`](crate::Loader).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Maximum number of keys handed to one fetch invocation.
    pub max_batch_size: usize,

    /// Longest time a key waits before a partial batch is flushed.
    #[serde(rename = "batch_timeout_ms", with = "millis")]
    pub batch_timeout: Duration,

    /// Memoize resolved keys. When disabled, concurrent loads of a key are
    /// still coalesced but every new request fetches again.
    pub cache: bool,

    /// How long the loader waits on a single fetch before failing the batch.
    #[serde(rename = "fetch_timeout_ms", with = "opt_millis")]
    pub fetch_timeout: Option<Duration>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
            cache: true,
            fetch_timeout: None,
        }
    }
}

impl LoaderConfig {
    /// Parses a configuration from JSON, filling unset fields with defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON and the
    /// [`validate`](Self::validate) errors for out-of-range values.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every field is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }
        if self.fetch_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::InvalidFetchTimeout);
        }
        Ok(())
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn with_batch_timeout(mut self, batch_timeout: Duration) -> Self {
        self.batch_timeout = batch_timeout;
        self
    }

    pub fn with_cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_fetch_timeout(mut self, fetch_timeout: Duration) -> Self {
        self.fetch_timeout = Some(fetch_timeout);
        self
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
