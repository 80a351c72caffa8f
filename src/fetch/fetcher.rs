use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;

use crate::fetch::parser::parse_feed;
use crate::source::{Article, ConditionalFetchState, FetchErrorKind, Source};

/// Browser and crawler User-Agent strings, rotated round-robin per request.
/// Some feed hosts throttle or block a single repeated agent.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
    "Mozilla/5.0 (macOS; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.1.1 Safari/605.1.15",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:89.0) Gecko/20100101 Firefox/89.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) Gecko/20100101 Firefox/89.0",
    "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)",
];

const ACCEPT_FEEDS: &str = "application/rss+xml, application/xml;q=0.9, */*;q=0.8";

/// Errors from one conditional retrieval.
///
/// Everything here is recoverable at the source level: the scheduler backs
/// the source off and tries again on the next due cycle.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Request exceeded the configured timeout.
    #[error("Request timed out")]
    Timeout,
    /// Network-level failure (DNS, connect, TLS, truncated body).
    #[error("Connection failed: {0}")]
    Connection(String),
    /// HTTP 4xx response.
    #[error("HTTP client error: status {0}")]
    Http4xx(u16),
    /// HTTP 5xx response.
    #[error("HTTP server error: status {0}")]
    Http5xx(u16),
    /// Payload could not be parsed as RSS or Atom.
    #[error("Parse error: {0}")]
    Parse(String),
    /// Response body exceeded the configured size limit.
    #[error("Response too large")]
    ResponseTooLarge,
}

impl FetchError {
    /// Collapse into the kind the scheduler's adaptive policy consumes.
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::Timeout => FetchErrorKind::Timeout,
            FetchError::Connection(_) => FetchErrorKind::Connection,
            FetchError::Http4xx(_) => FetchErrorKind::Http4xx,
            FetchError::Http5xx(_) => FetchErrorKind::Http5xx,
            // An oversized body is unusable payload, same as unparseable
            FetchError::Parse(_) | FetchError::ResponseTooLarge => FetchErrorKind::Parse,
        }
    }
}

/// Result of one successful conditional retrieval.
#[derive(Debug)]
pub enum FetchOutput {
    /// The remote reported 304, or the body digest matched the cached hash.
    NotModified,
    /// Fresh content. `tokens` are the new cache validators; the caller
    /// commits them only after the whole pipeline pass succeeds.
    Fetched {
        articles: Vec<Article>,
        /// Entries skipped for having no usable link.
        dropped: usize,
        tokens: ConditionalFetchState,
    },
}

/// The conditional-retrieval capability the scheduler drives.
///
/// One call, tokens in, content/not-modified/error out. Keeping the seam
/// this narrow means the HTTP stack is swappable and tests can substitute a
/// canned implementation.
#[async_trait]
pub trait ConditionalFetch: Send + Sync {
    async fn fetch(
        &self,
        source: &Source,
        conditional: &ConditionalFetchState,
    ) -> Result<FetchOutput, FetchError>;
}

/// Fetcher tunables, supplied from the pipeline configuration.
#[derive(Debug, Clone, Copy)]
pub struct FetchSettings {
    pub request_timeout: Duration,
    pub max_feed_bytes: usize,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(20),
            max_feed_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Performs one conditional HTTP retrieval per call.
///
/// The client is shared across all sources; per-source state (validator
/// tokens) is passed in and returned, never held here, so the fetcher itself
/// needs no locking.
pub struct Fetcher {
    client: reqwest::Client,
    settings: FetchSettings,
    ua_cursor: AtomicUsize,
}

impl Fetcher {
    pub fn new(settings: FetchSettings) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(Self {
            client,
            settings,
            ua_cursor: AtomicUsize::new(0),
        })
    }

    /// Retrieve one source, sending cache-validator tokens when present.
    ///
    /// Repeated calls with unchanged tokens against unchanged remote content
    /// yield [`FetchOutput::NotModified`]: either the server honors the
    /// conditional headers with a 304, or the body digest matches
    /// `conditional.content_hash`. Neither path mutates `conditional`.
    pub async fn fetch(
        &self,
        source: &Source,
        conditional: &ConditionalFetchState,
    ) -> Result<FetchOutput, FetchError> {
        let mut request = self
            .client
            .get(source.url.clone())
            .header(header::USER_AGENT, self.next_user_agent())
            .header(header::ACCEPT, ACCEPT_FEEDS);

        if let Some(etag) = &conditional.etag {
            request = request.header(header::IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = &conditional.last_modified {
            request = request.header(header::IF_MODIFIED_SINCE, last_modified);
        }

        let response = tokio::time::timeout(self.settings.request_timeout, request.send())
            .await
            .map_err(|_| FetchError::Timeout)?
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_MODIFIED {
            tracing::debug!(source = %source.id, "Not modified (304)");
            return Ok(FetchOutput::NotModified);
        }
        match status.as_u16() {
            200..=299 => {}
            400..=499 => return Err(FetchError::Http4xx(status.as_u16())),
            500..=599 => return Err(FetchError::Http5xx(status.as_u16())),
            other => {
                return Err(FetchError::Connection(format!(
                    "unexpected status {other}"
                )))
            }
        }

        // Capture validator tokens before the body consumes the response
        let etag = header_value(&response, header::ETAG);
        let last_modified = header_value(&response, header::LAST_MODIFIED);

        let bytes = read_limited_bytes(response, self.settings.max_feed_bytes).await?;

        // Digest fallback for servers that ignore conditional headers
        let digest = format!("{:x}", Sha256::digest(&bytes));
        if conditional.content_hash.as_deref() == Some(digest.as_str()) {
            tracing::debug!(source = %source.id, "Unchanged content (digest match)");
            return Ok(FetchOutput::NotModified);
        }

        let batch =
            parse_feed(&bytes, &source.id).map_err(|e| FetchError::Parse(e.to_string()))?;
        if batch.dropped > 0 {
            tracing::warn!(
                source = %source.id,
                dropped = batch.dropped,
                "Entries without a usable link skipped"
            );
        }

        Ok(FetchOutput::Fetched {
            articles: batch.articles,
            dropped: batch.dropped,
            tokens: ConditionalFetchState {
                etag,
                last_modified,
                content_hash: Some(digest),
            },
        })
    }

    fn next_user_agent(&self) -> &'static str {
        let i = self.ua_cursor.fetch_add(1, Ordering::Relaxed);
        USER_AGENTS[i % USER_AGENTS.len()]
    }
}

#[async_trait]
impl ConditionalFetch for Fetcher {
    async fn fetch(
        &self,
        source: &Source,
        conditional: &ConditionalFetchState,
    ) -> Result<FetchOutput, FetchError> {
        Fetcher::fetch(self, source, conditional).await
    }
}

fn header_value(response: &reqwest::Response, name: header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn classify_reqwest_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Connection(e.to_string())
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected = response.content_length();

    // Fast path: trust Content-Length when declared
    if let Some(len) = expected {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(classify_reqwest_error)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    // A short body means the connection dropped mid-transfer
    if let Some(expected) = expected {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::Connection(format!(
                "truncated response: expected {expected} bytes, received {}",
                bytes.len()
            )));
        }
    }

    Ok(bytes)
}
