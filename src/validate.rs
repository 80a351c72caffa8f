//! Pure article validation and the per-source rolling dedup window.
//!
//! [`validate`] is synchronous and side-effect free: for fixed inputs and a
//! fixed window, the result is always the same, so a failed pass can safely
//! re-validate the same articles on the next cycle. The [`DedupWindow`] is
//! owned by the caller; accepted links are inserted only after the pass
//! publishes successfully.
use chrono::DateTime;
use lru::LruCache;
use std::num::NonZeroUsize;

use crate::source::Article;

// ============================================================================
// Rejection Reasons
// ============================================================================

/// Why an article was routed to the dead-letter stream instead of published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Title, link or published timestamp is empty.
    MissingRequiredField,
    /// Timestamp present but neither RFC 3339 nor RFC 2822.
    MalformedTimestamp,
    /// Title or summary below the configured minimum length (stub entry).
    ContentTooShort,
    /// Link already seen within the source's rolling window.
    Duplicate,
}

impl RejectReason {
    /// Stable code carried in dead-letter envelopes and log fields.
    pub fn as_code(&self) -> &'static str {
        match self {
            RejectReason::MissingRequiredField => "missing_required_field",
            RejectReason::MalformedTimestamp => "malformed_timestamp",
            RejectReason::ContentTooShort => "content_too_short",
            RejectReason::Duplicate => "duplicate",
        }
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Length thresholds guarding against stub entries.
#[derive(Debug, Clone, Copy)]
pub struct ValidationSettings {
    /// Minimum summary length in bytes.
    pub min_content_len: usize,
    /// Minimum title length in characters.
    pub min_title_len: usize,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            min_content_len: 40,
            min_title_len: 10,
        }
    }
}

// ============================================================================
// Dedup Window
// ============================================================================

/// Rolling window of recently published canonical links for one source.
///
/// Capacity-bounded rather than time-bounded: the oldest link falls out once
/// the window is full. Lookups do not refresh recency, so a link that keeps
/// reappearing in a feed still ages out at the same rate as any other.
pub struct DedupWindow {
    links: LruCache<String, ()>,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            links: LruCache::new(capacity),
        }
    }

    pub fn contains(&self, link: &str) -> bool {
        self.links.contains(link)
    }

    /// Record a link as published, evicting the oldest entry when full.
    pub fn insert(&mut self, link: String) {
        self.links.put(link, ());
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Classify one article candidate against the window and thresholds.
///
/// Checks run cheapest-first; the first failure wins. No network or storage
/// access happens here.
pub fn validate(
    article: &Article,
    window: &DedupWindow,
    settings: &ValidationSettings,
) -> Result<(), RejectReason> {
    if article.title.trim().is_empty()
        || article.link.trim().is_empty()
        || article.published.trim().is_empty()
    {
        return Err(RejectReason::MissingRequiredField);
    }

    if !timestamp_is_valid(&article.published) {
        return Err(RejectReason::MalformedTimestamp);
    }

    if article.title.chars().count() < settings.min_title_len
        || article.summary.len() < settings.min_content_len
    {
        return Err(RejectReason::ContentTooShort);
    }

    if window.contains(&article.link) {
        return Err(RejectReason::Duplicate);
    }

    Ok(())
}

/// Feeds in the wild carry either RFC 3339 (Atom) or RFC 2822 (RSS) dates.
fn timestamp_is_valid(raw: &str) -> bool {
    DateTime::parse_from_rfc3339(raw).is_ok() || DateTime::parse_from_rfc2822(raw).is_ok()
}

// ============================================================================
// Tests
// ============================================================================
