//! Integration tests for the fetch→validate→publish pipeline.
//!
//! Each test runs a real scheduler against a wiremock HTTP server and an
//! in-memory producer, then inspects what reached each topic and how the
//! source's adaptive state moved.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use url::Url;
use wiremock::matchers::{header, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

use feedstream::fetch::{FetchSettings, Fetcher};
use feedstream::publish::{
    Envelope, ProduceError, Publisher, PublisherSettings, RetryPolicy, StreamProducer,
};
use feedstream::scheduler::{AdaptiveScheduler, SchedulerSettings};
use feedstream::source::{
    AdaptivePolicy, PollOutcome, Priority, PublishErrorKind, Registry, Source, SourceHealth,
};
use feedstream::storage::ArticleStore;
use feedstream::validate::ValidationSettings;

// ============================================================================
// Harness
// ============================================================================

/// Records every send in memory; topics in `failing` reject each attempt
/// with a transient error until healed.
struct RecordingProducer {
    sent: Mutex<Vec<(String, Envelope)>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingProducer {
    fn new() -> Arc<Self> {
        Self::failing(&[])
    }

    fn failing(topics: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            failing: Mutex::new(topics.iter().map(|t| t.to_string()).collect()),
        })
    }

    async fn heal(&self) {
        self.failing.lock().await.clear();
    }

    async fn on_topic(&self, topic: &str) -> Vec<Envelope> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, e)| e.clone())
            .collect()
    }
}

#[async_trait]
impl StreamProducer for RecordingProducer {
    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<(), ProduceError> {
        if self.failing.lock().await.contains(topic) {
            return Err(ProduceError::Timeout);
        }
        let envelope = Envelope::from_bytes(&payload)?;
        self.sent.lock().await.push((topic.to_string(), envelope));
        Ok(())
    }
}

fn test_source(id: &str, url: &str, min_interval_secs: u64) -> Source {
    Source::new(
        id.to_string(),
        Url::parse(url).unwrap(),
        Priority::Normal,
        Duration::from_secs(min_interval_secs),
        Duration::from_secs(3600),
        Duration::ZERO,
    )
}

fn test_settings(max_concurrent: usize) -> SchedulerSettings {
    SchedulerSettings {
        max_concurrent_fetches: max_concurrent,
        tick_interval: Duration::from_millis(50),
        pass_deadline: Duration::from_secs(10),
        dedup_window: 100,
        validation_reset_threshold: 3,
        policy: AdaptivePolicy {
            empty_poll_threshold: 2,
            max_consecutive_errors: 5,
        },
        validation: ValidationSettings {
            min_content_len: 10,
            min_title_len: 5,
        },
    }
}

fn build_scheduler(
    sources: Vec<Source>,
    producer: Arc<RecordingProducer>,
    store: Option<Arc<ArticleStore>>,
    max_concurrent: usize,
) -> AdaptiveScheduler {
    let registry = Registry::from_sources(sources);
    let fetcher = Arc::new(
        Fetcher::new(FetchSettings {
            request_timeout: Duration::from_secs(5),
            max_feed_bytes: 1024 * 1024,
        })
        .unwrap(),
    );
    let publisher = Arc::new(Publisher::new(
        producer,
        PublisherSettings {
            primary_topic: "articles".to_string(),
            dead_letter_topic: "articles.dead_letter".to_string(),
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(10),
            },
            max_message_bytes: 1024 * 1024,
        },
    ));
    let (scheduler, _status) =
        AdaptiveScheduler::new(registry, fetcher, publisher, store, test_settings(max_concurrent));
    scheduler
}

/// Two publishable articles plus one with an empty title.
const FEED_BODY: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Example</title>
    <item>
        <title>First article headline</title>
        <link>https://example.com/articles/1</link>
        <pubDate>Mon, 01 Jan 2024 12:00:00 +0000</pubDate>
        <description>A longer summary body for the first article.</description>
    </item>
    <item>
        <title>Second article headline</title>
        <link>https://example.com/articles/2</link>
        <pubDate>Mon, 01 Jan 2024 13:00:00 +0000</pubDate>
        <description>A longer summary body for the second article.</description>
    </item>
    <item>
        <title></title>
        <link>https://example.com/articles/3</link>
        <pubDate>Mon, 01 Jan 2024 14:00:00 +0000</pubDate>
        <description>Summary for an article with no title.</description>
    </item>
</channel></rss>"#;

// ============================================================================
// Full Pass Routing
// ============================================================================

#[tokio::test]
async fn test_full_pass_routes_accepted_and_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(FEED_BODY)
                .insert_header("ETag", "\"v1\""),
        )
        .mount(&server)
        .await;

    let producer = RecordingProducer::new();
    let source = test_source("news", &format!("{}/feed", server.uri()), 300);
    let mut scheduler = build_scheduler(vec![source], producer.clone(), None, 4);

    scheduler.run_once().await;

    let primary = producer.on_topic("articles").await;
    assert_eq!(primary.len(), 2);
    assert_eq!(primary[0].article.link, "https://example.com/articles/1");
    assert_eq!(primary[1].article.link, "https://example.com/articles/2");
    assert!(primary.iter().all(|e| e.reason.is_none()));

    let dead = producer.on_topic("articles.dead_letter").await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason.as_deref(), Some("missing_required_field"));
    assert_eq!(dead[0].article.link, "https://example.com/articles/3");

    let source = scheduler.registry().get("news").unwrap();
    assert_eq!(
        source.last_outcome,
        Some(PollOutcome::Success {
            accepted: 2,
            rejected: 1
        })
    );
    assert_eq!(source.health, SourceHealth::Healthy);
    assert_eq!(source.consecutive_errors, 0);

    // Tokens committed after the successful pass
    let tokens = scheduler.conditional_state("news").unwrap();
    assert_eq!(tokens.etag.as_deref(), Some("\"v1\""));
    assert!(tokens.content_hash.is_some());
}

// ============================================================================
// Conditional Fetch Idempotence
// ============================================================================

#[tokio::test]
async fn test_second_cycle_short_circuits_on_304() {
    let server = MockServer::start().await;
    // First request carries no validators and gets the full feed
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(FEED_BODY)
                .insert_header("ETag", "\"v1\""),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    // The committed ETag comes back as If-None-Match
    Mock::given(method("GET"))
        .and(header("If-None-Match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .mount(&server)
        .await;

    let producer = RecordingProducer::new();
    // Zero interval keeps the source immediately due again
    let source = test_source("news", &format!("{}/feed", server.uri()), 0);
    let mut scheduler = build_scheduler(vec![source], producer.clone(), None, 4);

    scheduler.run_once().await;
    scheduler.run_once().await;

    let source = scheduler.registry().get("news").unwrap();
    assert_eq!(source.last_outcome, Some(PollOutcome::NotModified));
    assert_eq!(source.consecutive_empty_polls, 1);

    // Nothing new reached either topic on the second cycle
    assert_eq!(producer.on_topic("articles").await.len(), 2);
    assert_eq!(producer.on_topic("articles.dead_letter").await.len(), 1);
}

#[tokio::test]
async fn test_digest_fallback_when_server_ignores_validators() {
    let server = MockServer::start().await;
    // Always 200 with identical content, no ETag or Last-Modified
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(FEED_BODY))
        .mount(&server)
        .await;

    let producer = RecordingProducer::new();
    let source = test_source("news", &format!("{}/feed", server.uri()), 0);
    let mut scheduler = build_scheduler(vec![source], producer.clone(), None, 4);

    scheduler.run_once().await;
    scheduler.run_once().await;

    let source = scheduler.registry().get("news").unwrap();
    assert_eq!(source.last_outcome, Some(PollOutcome::NotModified));
    assert_eq!(producer.on_topic("articles").await.len(), 2);
}

// ============================================================================
// Commit-on-Success-Only
// ============================================================================

#[tokio::test]
async fn test_publish_failure_blocks_commit_and_forces_redelivery() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(FEED_BODY)
                .insert_header("ETag", "\"v1\""),
        )
        .mount(&server)
        .await;

    let producer = RecordingProducer::failing(&["articles", "articles.dead_letter"]);
    let source = test_source("news", &format!("{}/feed", server.uri()), 0);
    let mut scheduler = build_scheduler(vec![source], producer.clone(), None, 4);

    scheduler.run_once().await;

    let source = scheduler.registry().get("news").unwrap();
    assert_eq!(
        source.last_outcome,
        Some(PollOutcome::PublishError(PublishErrorKind::Timeout))
    );
    assert_eq!(source.consecutive_errors, 1);
    // The failed pass committed nothing
    assert!(scheduler.conditional_state("news").is_none());

    // Broker back: the same content is re-fetched and delivered in full
    producer.heal().await;
    scheduler.run_once().await;

    let source = scheduler.registry().get("news").unwrap();
    assert_eq!(
        source.last_outcome,
        Some(PollOutcome::Success {
            accepted: 2,
            rejected: 1
        })
    );
    assert_eq!(source.consecutive_errors, 0);
    assert_eq!(producer.on_topic("articles").await.len(), 2);
    assert!(scheduler.conditional_state("news").is_some());
}

#[tokio::test]
async fn test_primary_outage_still_routes_dead_letters() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(FEED_BODY))
        .mount(&server)
        .await;

    let producer = RecordingProducer::failing(&["articles"]);
    let source = test_source("news", &format!("{}/feed", server.uri()), 300);
    let mut scheduler = build_scheduler(vec![source], producer.clone(), None, 4);

    scheduler.run_once().await;

    // Rejected article arrives with its own reason; the accepted ones land
    // there too once their primary retries are exhausted
    let dead = producer.on_topic("articles.dead_letter").await;
    assert_eq!(dead.len(), 3);
    assert_eq!(dead[0].reason.as_deref(), Some("missing_required_field"));
    assert!(dead[1..]
        .iter()
        .all(|e| e.reason.as_deref() == Some("primary_delivery_failed")));

    let source = scheduler.registry().get("news").unwrap();
    assert_eq!(
        source.last_outcome,
        Some(PollOutcome::PublishError(PublishErrorKind::Timeout))
    );
    assert!(scheduler.conditional_state("news").is_none());
}

// ============================================================================
// Fetch Errors
// ============================================================================

#[tokio::test]
async fn test_fetch_error_backs_off_and_commits_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let producer = RecordingProducer::new();
    let source = test_source("news", &format!("{}/feed", server.uri()), 300);
    let mut scheduler = build_scheduler(vec![source], producer.clone(), None, 4);

    scheduler.run_once().await;

    let source = scheduler.registry().get("news").unwrap();
    assert!(matches!(
        source.last_outcome,
        Some(PollOutcome::FetchError(_))
    ));
    assert_eq!(source.consecutive_errors, 1);
    // 300s doubled by the error backoff
    assert_eq!(source.poll_interval, Duration::from_secs(600));
    assert!(scheduler.conditional_state("news").is_none());
    assert!(producer.on_topic("articles").await.is_empty());
}

// ============================================================================
// Dedup Across Cycles
// ============================================================================

#[tokio::test]
async fn test_previously_published_links_dead_letter_as_duplicates() {
    let first_body = FEED_BODY;
    // Same two good articles plus one genuinely new entry
    let second_body = first_body.replace(
        "</channel></rss>",
        r#"<item>
        <title>Third article headline</title>
        <link>https://example.com/articles/4</link>
        <pubDate>Mon, 02 Jan 2024 09:00:00 +0000</pubDate>
        <description>A longer summary body for the third article.</description>
    </item>
</channel></rss>"#,
    );

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(first_body))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(second_body))
        .mount(&server)
        .await;

    let producer = RecordingProducer::new();
    let source = test_source("news", &format!("{}/feed", server.uri()), 0);
    let mut scheduler = build_scheduler(vec![source], producer.clone(), None, 4);

    scheduler.run_once().await;
    scheduler.run_once().await;

    let source = scheduler.registry().get("news").unwrap();
    assert_eq!(
        source.last_outcome,
        Some(PollOutcome::Success {
            accepted: 1,
            rejected: 3
        })
    );

    let primary = producer.on_topic("articles").await;
    assert_eq!(primary.len(), 3);
    assert_eq!(primary[2].article.link, "https://example.com/articles/4");

    let dead = producer.on_topic("articles.dead_letter").await;
    let duplicates: Vec<_> = dead
        .iter()
        .filter(|e| e.reason.as_deref() == Some("duplicate"))
        .collect();
    assert_eq!(duplicates.len(), 2);
}

// ============================================================================
// Concurrency Bounds
// ============================================================================

#[tokio::test]
async fn test_single_in_flight_pass_per_source() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(FEED_BODY)
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;

    let producer = RecordingProducer::new();
    let source = test_source("news", &format!("{}/feed", server.uri()), 0);
    let mut scheduler = build_scheduler(vec![source], producer.clone(), None, 4);

    let now = Instant::now();
    assert_eq!(scheduler.tick(now), 1);
    // Still due, but its pass is in flight: never dispatched twice
    assert_eq!(scheduler.tick(now), 0);
    assert_eq!(scheduler.in_flight_count(), 1);

    scheduler.run_once().await;
    assert_eq!(scheduler.in_flight_count(), 0);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_worker_pool_caps_concurrent_fetches() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(FEED_BODY)
                .set_delay(Duration::from_millis(200)),
        )
        .mount(&server)
        .await;

    let producer = RecordingProducer::new();
    let sources = vec![
        test_source("a", &format!("{}/a", server.uri()), 300),
        test_source("b", &format!("{}/b", server.uri()), 300),
        test_source("c", &format!("{}/c", server.uri()), 300),
    ];
    let mut scheduler = build_scheduler(sources, producer.clone(), None, 1);

    // Pool of one: a single due source is admitted, the rest stay due
    assert_eq!(scheduler.tick(Instant::now()), 1);
    assert_eq!(scheduler.in_flight_count(), 1);

    scheduler.run_once().await;
    // Each run_once admits at most one more
    scheduler.run_once().await;
    scheduler.run_once().await;
    assert_eq!(producer.on_topic("articles").await.len(), 6);
}

// ============================================================================
// Validation Reset
// ============================================================================

#[tokio::test]
async fn test_repeated_all_rejected_passes_clear_conditional_tokens() {
    // Every entry has a stub title, so each pass parses fine but rejects all
    let stub_body = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Example</title>
    <item>
        <title>Hi</title>
        <link>https://example.com/stub/1</link>
        <pubDate>Mon, 01 Jan 2024 12:00:00 +0000</pubDate>
        <description>A longer summary body for a stub-titled article.</description>
    </item>
</channel></rss>"#;

    let server = MockServer::start().await;
    // Vary the body per response so the digest fallback never short-circuits
    for n in 0..4 {
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                stub_body.replace("/stub/1", &format!("/stub/{n}")),
            ))
            .up_to_n_times(1)
            .mount(&server)
            .await;
    }

    let producer = RecordingProducer::new();
    let source = test_source("stubs", &format!("{}/feed", server.uri()), 0);
    let mut scheduler = build_scheduler(vec![source], producer.clone(), None, 4);

    scheduler.run_once().await;
    scheduler.run_once().await;
    assert!(scheduler.conditional_state("stubs").is_some());

    // Third consecutive all-rejected pass trips the reset threshold
    scheduler.run_once().await;
    assert!(scheduler.conditional_state("stubs").is_none());

    let dead = producer.on_topic("articles.dead_letter").await;
    assert_eq!(dead.len(), 3);
    assert!(dead
        .iter()
        .all(|e| e.reason.as_deref() == Some("content_too_short")));
}

// ============================================================================
// Storage Side Channel
// ============================================================================

#[tokio::test]
async fn test_successful_pass_writes_parsed_batch_to_store() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(FEED_BODY))
        .mount(&server)
        .await;

    let data_dir = std::env::temp_dir().join("feedstream_pipeline_store");
    let _ = std::fs::remove_dir_all(&data_dir);
    let store = Arc::new(ArticleStore::new(&data_dir));

    let producer = RecordingProducer::new();
    let source = test_source("news", &format!("{}/feed", server.uri()), 300);
    let mut scheduler = build_scheduler(vec![source], producer.clone(), Some(store), 4);

    scheduler.run_once().await;

    let parsed_dir = data_dir.join("parsed").join("news");
    let files: Vec<_> = std::fs::read_dir(&parsed_dir).unwrap().collect();
    assert_eq!(files.len(), 1);
}
