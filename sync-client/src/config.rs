//! Configuration loading for revision sync engines.
//!
//! Settings are read from TOML. Only `topic` is required:
//!
//! ```toml
//! topic = "settings"
//! label = "main-window"
//!
//! [throttle]
//! debounce_ms = 50
//! throttle_ms = 200
//!
//! [retry]
//! max_attempts = 5
//! initial_delay_ms = 250
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use sync_core::{RetryPolicy, ThrottleOptions};
use sync_types::Topic;

use crate::engine::RevisionSyncBuilder;
use crate::retry::{with_retry, RetryingProvider};
use crate::{InvalidationSubscriber, RevisionSync, SnapshotApplier, SnapshotProvider};

/// Settings for one engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Topic to follow. Must not be blank.
    pub topic: Topic,
    /// Tag added to every log record of the engine.
    #[serde(default)]
    pub label: Option<String>,
    /// Rate limiting for invalidation-triggered refreshes (default: none).
    #[serde(default)]
    pub throttle: ThrottleOptions,
    /// Retry policy for snapshot fetches (default: 3 attempts, 500ms doubling).
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl SyncSettings {
    /// Settings for `topic` with every option at its default.
    pub fn new(topic: Topic) -> Self {
        Self {
            topic,
            label: None,
            throttle: ThrottleOptions::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Parse settings from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError {
            origin: "<string>".to_string(),
            source: e,
        })
    }

    /// Load settings from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            origin: path.display().to_string(),
            source: e,
        })
    }

    /// Start an engine builder from these settings.
    ///
    /// `provider` is wrapped with the retry policy and the throttle options
    /// are applied; everything else is left to the caller.
    pub fn builder<T, S, P, A>(
        &self,
        subscriber: S,
        provider: P,
        applier: A,
    ) -> RevisionSyncBuilder<T>
    where
        T: Send + 'static,
        S: InvalidationSubscriber + 'static,
        P: SnapshotProvider<T> + 'static,
        A: SnapshotApplier<T> + 'static,
    {
        let provider: RetryingProvider<P, T> = with_retry(provider, self.retry);
        let mut builder =
            RevisionSync::builder(self.topic.as_str(), subscriber, provider, applier)
                .throttle(self.throttle);
        if let Some(label) = &self.label {
            builder = builder.label(label.clone());
        }
        builder
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration.
    #[error("failed to parse config {origin}: {source}")]
    ParseError {
        /// File path, or `<string>` for inline text.
        origin: String,
        /// Underlying TOML error.
        source: toml::de::Error,
    },
}
