//! Source records and adaptive polling state.
//!
//! A [`Source`] carries everything the scheduler needs to decide when the
//! next poll is due and how the last outcome should reshape the interval.
//! All mutation goes through [`Source::apply_outcome`], called only by the
//! scheduler after a pass completes — one writer per source id, no locks.
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use url::Url;

use crate::config::{Config, SourceConfig};
use crate::util::{validate_url, UrlValidationError};

/// Interval shrink factor applied after a productive poll.
const ACTIVE_INTERVAL_FACTOR: f64 = 0.8;

/// Interval growth factor applied once empty polls pass the threshold.
const IDLE_INTERVAL_FACTOR: f64 = 1.3;

/// Interval growth factor applied per consecutive error.
const ERROR_BACKOFF_FACTOR: f64 = 2.0;

// ============================================================================
// Enums
// ============================================================================

/// Admission priority when more sources are due than the worker pool can take.
///
/// Variant order matters: sorting ascending puts `High` first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

/// Explicit health state for a source, derived from its poll history.
///
/// `Degraded` sources are still polled (at the interval ceiling) — nothing is
/// ever disabled automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceHealth {
    /// Recent polls delivered articles.
    Healthy,
    /// Consecutive empty polls widened the interval.
    Quiet,
    /// Consecutive errors hit the configured ceiling.
    Degraded,
}

/// Classification of a failed fetch, as consumed by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Timeout,
    Connection,
    Http4xx,
    Http5xx,
    Parse,
}

impl FetchErrorKind {
    pub fn as_code(&self) -> &'static str {
        match self {
            FetchErrorKind::Timeout => "timeout",
            FetchErrorKind::Connection => "connection",
            FetchErrorKind::Http4xx => "http_4xx",
            FetchErrorKind::Http5xx => "http_5xx",
            FetchErrorKind::Parse => "parse_failure",
        }
    }
}

/// Classification of a failed publish pass, as consumed by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishErrorKind {
    TransientBroker,
    NonTransientBroker,
    Timeout,
}

impl PublishErrorKind {
    pub fn as_code(&self) -> &'static str {
        match self {
            PublishErrorKind::TransientBroker => "transient_broker",
            PublishErrorKind::NonTransientBroker => "non_transient_broker",
            PublishErrorKind::Timeout => "timeout",
        }
    }
}

/// Result of one fetch→validate→publish pass for one source.
///
/// Consumed only by the scheduler to update the source record; never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The remote reported (or the digest proved) unchanged content.
    NotModified,
    /// The pass completed; counts are items delivered to the primary stream
    /// and items routed to dead-letter.
    Success { accepted: usize, rejected: usize },
    /// The fetch phase failed.
    FetchError(FetchErrorKind),
    /// The publish phase failed after retries; nothing was committed.
    PublishError(PublishErrorKind),
}

impl PollOutcome {
    /// Short label for status output and log fields.
    pub fn code(&self) -> String {
        match self {
            PollOutcome::NotModified => "not_modified".to_string(),
            PollOutcome::Success { .. } => "success".to_string(),
            PollOutcome::FetchError(kind) => format!("fetch_error({})", kind.as_code()),
            PollOutcome::PublishError(kind) => format!("publish_error({})", kind.as_code()),
        }
    }
}

// ============================================================================
// Data carried through one pass
// ============================================================================

/// Cache-validator tokens from the last successful fetch of a source.
///
/// Committed atomically by the scheduler only after the entire pass
/// succeeds, so a crash or publish failure mid-pass never marks content
/// as already seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditionalFetchState {
    /// Opaque `ETag` response header value.
    pub etag: Option<String>,
    /// Opaque `Last-Modified` response header value.
    pub last_modified: Option<String>,
    /// Hex sha256 of the last 200-response body; fallback for servers that
    /// ignore conditional headers.
    pub content_hash: Option<String>,
}

impl ConditionalFetchState {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none() && self.content_hash.is_none()
    }
}

/// One candidate content item extracted from a feed response.
///
/// Lives for exactly one pipeline pass; durability belongs to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub source_id: String,
    pub title: String,
    /// Canonical URL; dedup key within the source's rolling window.
    pub link: String,
    /// Timestamp string as carried by the feed (RFC 3339 or RFC 2822).
    pub published: String,
    pub summary: String,
    /// Hex sha256 over title, link and summary.
    pub raw_content_digest: String,
}

// ============================================================================
// Source
// ============================================================================

/// Policy knobs the scheduler feeds into [`Source::apply_outcome`].
#[derive(Debug, Clone, Copy)]
pub struct AdaptivePolicy {
    /// Empty polls tolerated before the interval starts widening.
    pub empty_poll_threshold: u32,
    /// Consecutive errors before the source is marked degraded.
    pub max_consecutive_errors: u32,
}

/// One configured feed endpoint plus its adaptive polling state.
#[derive(Debug, Clone)]
pub struct Source {
    pub id: String,
    pub url: Url,
    pub priority: Priority,

    /// Current adaptive interval, always within `[min_interval, max_interval]`.
    pub poll_interval: Duration,
    pub min_interval: Duration,
    pub max_interval: Duration,

    pub consecutive_empty_polls: u32,
    pub consecutive_errors: u32,
    /// Consecutive successful fetches in which every parsed entry was
    /// rejected; at the configured threshold the scheduler clears the
    /// source's conditional tokens to force a full refetch.
    pub consecutive_rejected_only: u32,

    pub health: SourceHealth,
    pub last_polled_at: Option<Instant>,
    pub last_success_at: Option<Instant>,
    pub last_outcome: Option<PollOutcome>,

    /// Stable phase offset derived from the id hash, spreading sources with
    /// identical intervals across the tick grid instead of random jitter.
    jitter: Duration,
}

impl Source {
    pub fn new(
        id: String,
        url: Url,
        priority: Priority,
        min_interval: Duration,
        max_interval: Duration,
        jitter_ceiling: Duration,
    ) -> Self {
        let jitter = phase_offset(&id, jitter_ceiling);
        Self {
            id,
            url,
            priority,
            poll_interval: min_interval,
            min_interval,
            max_interval,
            consecutive_empty_polls: 0,
            consecutive_errors: 0,
            consecutive_rejected_only: 0,
            health: SourceHealth::Healthy,
            last_polled_at: None,
            last_success_at: None,
            last_outcome: None,
            jitter,
        }
    }

    /// Whether this source should be admitted for a poll at `now`.
    ///
    /// A never-polled source is immediately due.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_polled_at {
            None => true,
            Some(polled) => polled + self.poll_interval + self.jitter <= now,
        }
    }

    /// How long past its due time this source is. Zero when not yet due.
    pub fn overdue_by(&self, now: Instant) -> Duration {
        match self.last_polled_at {
            None => Duration::MAX,
            Some(polled) => {
                let due_at = polled + self.poll_interval + self.jitter;
                now.saturating_duration_since(due_at)
            }
        }
    }

    /// Fold a completed pass into the adaptive state.
    ///
    /// Productive polls pull the interval toward the floor; empty polls past
    /// the threshold push it toward the ceiling; errors back off
    /// exponentially and eventually mark the source degraded (still polled).
    pub fn apply_outcome(&mut self, outcome: &PollOutcome, now: Instant, policy: &AdaptivePolicy) {
        self.last_polled_at = Some(now);
        self.last_outcome = Some(*outcome);

        match *outcome {
            PollOutcome::Success { accepted, .. } if accepted > 0 => {
                self.consecutive_errors = 0;
                self.consecutive_empty_polls /= 2;
                self.consecutive_rejected_only = 0;
                self.last_success_at = Some(now);
                self.set_interval(scale(self.poll_interval, ACTIVE_INTERVAL_FACTOR));
                self.health = SourceHealth::Healthy;
            }
            PollOutcome::Success { rejected, .. } => {
                // accepted == 0: the fetch worked but yielded nothing new
                self.consecutive_errors = 0;
                self.last_success_at = Some(now);
                self.consecutive_rejected_only = if rejected > 0 {
                    self.consecutive_rejected_only + 1
                } else {
                    0
                };
                self.record_empty_poll(policy);
            }
            PollOutcome::NotModified => {
                // Counts toward the empty streak; leaves the rejected-only
                // streak as is since nothing was parsed this pass.
                self.consecutive_errors = 0;
                self.last_success_at = Some(now);
                self.record_empty_poll(policy);
            }
            PollOutcome::FetchError(_) | PollOutcome::PublishError(_) => {
                self.consecutive_errors += 1;
                if self.consecutive_errors >= policy.max_consecutive_errors {
                    self.health = SourceHealth::Degraded;
                    self.set_interval(self.max_interval);
                } else {
                    self.set_interval(scale(self.poll_interval, ERROR_BACKOFF_FACTOR));
                }
            }
        }
    }

    fn record_empty_poll(&mut self, policy: &AdaptivePolicy) {
        self.consecutive_empty_polls += 1;
        if self.consecutive_empty_polls > policy.empty_poll_threshold {
            self.set_interval(scale(self.poll_interval, IDLE_INTERVAL_FACTOR));
            if self.poll_interval > self.min_interval {
                self.health = SourceHealth::Quiet;
            }
        }
    }

    fn set_interval(&mut self, interval: Duration) {
        self.poll_interval = interval.clamp(self.min_interval, self.max_interval);
    }
}

fn scale(interval: Duration, factor: f64) -> Duration {
    Duration::from_secs_f64(interval.as_secs_f64() * factor)
}

/// Deterministic per-source phase offset in `[0, ceiling)`.
fn phase_offset(id: &str, ceiling: Duration) -> Duration {
    let secs = ceiling.as_secs();
    if secs == 0 {
        return Duration::ZERO;
    }
    let digest = Sha256::digest(id.as_bytes());
    let word = u64::from_be_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ]);
    Duration::from_secs(word % secs)
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Duplicate source id: {0}")]
    DuplicateId(String),

    #[error("Invalid URL for source {id}: {source}")]
    InvalidUrl {
        id: String,
        #[source]
        source: UrlValidationError,
    },
}

/// The materialized source table, built once from configuration.
///
/// Sources are never removed at runtime; a config reload replaces the set.
#[derive(Debug)]
pub struct Registry {
    sources: HashMap<String, Source>,
}

impl Registry {
    pub fn from_config(config: &Config) -> Result<Self, RegistryError> {
        let pipeline = &config.pipeline;
        let mut sources = HashMap::with_capacity(config.sources.len());

        for entry in &config.sources {
            let url = validate_url(&entry.url).map_err(|source| RegistryError::InvalidUrl {
                id: entry.id.clone(),
                source,
            })?;

            let min = Duration::from_secs(
                entry.min_interval_secs.unwrap_or(pipeline.min_interval_secs),
            );
            let max = Duration::from_secs(
                entry.max_interval_secs.unwrap_or(pipeline.max_interval_secs),
            );
            let source = Source::new(
                entry.id.clone(),
                url,
                entry.priority,
                min,
                max.max(min),
                Duration::from_secs(pipeline.jitter_secs),
            );

            if sources.insert(entry.id.clone(), source).is_some() {
                return Err(RegistryError::DuplicateId(entry.id.clone()));
            }
        }

        Ok(Self { sources })
    }

    /// Build a registry directly from sources (test seams and tooling).
    pub fn from_sources(list: Vec<Source>) -> Self {
        let sources = list.into_iter().map(|s| (s.id.clone(), s)).collect();
        Self { sources }
    }

    pub fn get(&self, id: &str) -> Option<&Source> {
        self.sources.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Source> {
        self.sources.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Source> {
        self.sources.values()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
