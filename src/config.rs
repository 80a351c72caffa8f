//! Configuration file parser for the pipeline.
//!
//! The config file is required — it names the sources to poll. The
//! `[pipeline]` table is optional and every key in it has a default, so a
//! minimal file is just a list of `[[sources]]` entries. Configuration is
//! loaded once at startup; a missing or malformed file is fatal.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Config file defines no sources")]
    NoSources,
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Tunables for the scheduler, fetcher, validator and publisher.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Upper bound on concurrently running fetch passes.
    pub max_concurrent_fetches: usize,

    /// How often the scheduler checks for due sources, in seconds.
    pub tick_interval_secs: u64,

    /// Per-request HTTP timeout in seconds.
    pub request_timeout_secs: u64,

    /// Deadline for one whole fetch→validate→publish pass, in seconds.
    pub pass_deadline_secs: u64,

    /// Floor for the adaptive poll interval, in seconds.
    pub min_interval_secs: u64,

    /// Ceiling for the adaptive poll interval, in seconds.
    pub max_interval_secs: u64,

    /// Consecutive empty polls tolerated before the interval widens.
    pub empty_poll_threshold: u32,

    /// Consecutive errors before a source is marked degraded.
    pub max_consecutive_errors: u32,

    /// Consecutive all-rejected passes before conditional-fetch tokens are
    /// cleared to force a full refetch.
    pub validation_reset_threshold: u32,

    /// Per-source phase offset ceiling (seconds) so sources with the same
    /// interval do not fetch in lockstep. 0 disables the offset.
    pub jitter_secs: u64,

    /// Capacity of the per-source rolling dedup window (canonical links).
    pub dedup_window: usize,

    /// Minimum summary length accepted by the validator, in bytes.
    pub min_content_len: usize,

    /// Minimum title length accepted by the validator, in characters.
    pub min_title_len: usize,

    /// Maximum feed response body size in bytes.
    pub max_feed_bytes: usize,

    /// Maximum serialized envelope size accepted by the publisher, in bytes.
    pub max_message_bytes: usize,

    /// Publisher retry attempts per item.
    pub retry_max_attempts: u32,

    /// Base delay for publisher retry backoff, in milliseconds.
    pub retry_base_delay_ms: u64,

    /// ZeroMQ endpoint the producer connects to.
    pub broker_endpoint: String,

    /// Topic for validated articles.
    pub primary_topic: String,

    /// Topic for rejected and undeliverable articles.
    pub dead_letter_topic: String,

    /// Root directory for the best-effort parsed-article side channel.
    /// `None` disables file persistence.
    pub data_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 8,
            tick_interval_secs: 5,
            request_timeout_secs: 20,
            pass_deadline_secs: 60,
            min_interval_secs: 300,
            max_interval_secs: 3600,
            empty_poll_threshold: 2,
            max_consecutive_errors: 5,
            validation_reset_threshold: 3,
            jitter_secs: 30,
            dedup_window: 500,
            min_content_len: 40,
            min_title_len: 10,
            max_feed_bytes: 10 * 1024 * 1024,
            max_message_bytes: 1024 * 1024,
            retry_max_attempts: 3,
            retry_base_delay_ms: 250,
            broker_endpoint: "tcp://127.0.0.1:5556".to_string(),
            primary_topic: "articles".to_string(),
            dead_letter_topic: "articles.dead_letter".to_string(),
            data_dir: None,
        }
    }
}

/// One configured feed source.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Stable unique key, used for sharding state and in envelope metadata.
    pub id: String,

    /// Feed URL. Validated against the SSRF policy at registry build time.
    pub url: String,

    /// Admission priority when more sources are due than the pool can take.
    #[serde(default)]
    pub priority: crate::source::Priority,

    /// Per-source override of the interval floor.
    pub min_interval_secs: Option<u64>,

    /// Per-source override of the interval ceiling.
    pub max_interval_secs: Option<u64>,
}

/// Top-level application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,

    pub sources: Vec<SourceConfig>,
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// Unlike an optional preferences file, the source list is load-bearing:
    /// a missing file, invalid TOML, or an empty `sources` table is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let meta = std::fs::metadata(path)?;
        if meta.len() > Self::MAX_FILE_SIZE {
            return Err(ConfigError::TooLarge(format!(
                "Config file is {} bytes (max {} bytes)",
                meta.len(),
                Self::MAX_FILE_SIZE
            )));
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;

        if config.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }

        tracing::info!(
            path = %path.display(),
            sources = config.sources.len(),
            "Loaded configuration"
        );
        Ok(config)
    }
}

// ============================================================================
// Tests
// ============================================================================
