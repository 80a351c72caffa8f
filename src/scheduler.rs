//! The coordinating loop: due-source selection, bounded fan-out, and
//! adaptive-interval bookkeeping.
//!
//! One scheduler owns all per-source state (registry record, conditional
//! tokens, dedup window). A pass borrows that state by value: the window
//! moves into the worker task and comes back with the result, so exactly one
//! task touches a source's state at any time and no locks are needed. The
//! worker pool is the only shared resource, guarded by a plain admission
//! semaphore.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::PipelineConfig;
use crate::fetch::{ConditionalFetch, FetchOutput};
use crate::publish::{ClassifiedBatch, Publisher};
use crate::source::{
    AdaptivePolicy, ConditionalFetchState, FetchErrorKind, PollOutcome, Priority,
    PublishErrorKind, Registry, Source, SourceHealth,
};
use crate::storage::ArticleStore;
use crate::validate::{validate, DedupWindow, RejectReason, ValidationSettings};

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    /// Worker pool size: no more fetches than this run at once.
    pub max_concurrent_fetches: usize,
    /// How often the due-check runs.
    pub tick_interval: Duration,
    /// Deadline for one whole fetch→validate→publish pass.
    pub pass_deadline: Duration,
    /// Per-source dedup window capacity.
    pub dedup_window: usize,
    /// All-rejected passes tolerated before conditional tokens are cleared.
    pub validation_reset_threshold: u32,
    pub policy: AdaptivePolicy,
    pub validation: ValidationSettings,
}

impl From<&PipelineConfig> for SchedulerSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_concurrent_fetches: config.max_concurrent_fetches,
            tick_interval: Duration::from_secs(config.tick_interval_secs),
            pass_deadline: Duration::from_secs(config.pass_deadline_secs),
            dedup_window: config.dedup_window,
            validation_reset_threshold: config.validation_reset_threshold,
            policy: AdaptivePolicy {
                empty_poll_threshold: config.empty_poll_threshold,
                max_consecutive_errors: config.max_consecutive_errors,
            },
            validation: ValidationSettings {
                min_content_len: config.min_content_len,
                min_title_len: config.min_title_len,
            },
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

// ============================================================================
// Status Snapshot
// ============================================================================

/// Point-in-time view rendered by an external metrics/health component.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub active_source_count: usize,
    pub in_flight_count: usize,
    pub successful_fetches: u64,
    pub failed_fetches: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub sources: Vec<SourceStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub id: String,
    pub poll_interval_secs: u64,
    pub consecutive_errors: u32,
    pub health: SourceHealth,
    pub last_outcome: Option<String>,
}

#[derive(Debug, Default)]
struct ActivityCounters {
    successful_fetches: u64,
    failed_fetches: u64,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
}

// ============================================================================
// Pass Worker
// ============================================================================

/// Everything one pass needs, moved into the worker task.
struct PassContext {
    source: Source,
    conditional: ConditionalFetchState,
    window: DedupWindow,
    fetcher: Arc<dyn ConditionalFetch>,
    publisher: Arc<Publisher>,
    store: Option<Arc<ArticleStore>>,
    validation: ValidationSettings,
    deadline: Duration,
}

/// What comes back from a worker. The window always returns, even on
/// failure; new tokens return only when the whole pass succeeded.
struct PassResult {
    source_id: String,
    outcome: PollOutcome,
    tokens: Option<ConditionalFetchState>,
    window: DedupWindow,
}

async fn run_pass(ctx: PassContext) -> PassResult {
    let PassContext {
        source,
        conditional,
        mut window,
        fetcher,
        publisher,
        store,
        validation,
        deadline,
    } = ctx;
    let source_id = source.id.clone();
    let started = Instant::now();

    let fetched = match tokio::time::timeout(deadline, fetcher.fetch(&source, &conditional)).await
    {
        Err(_) => {
            tracing::warn!(source = %source_id, "Pass deadline expired during fetch");
            return PassResult {
                source_id,
                outcome: PollOutcome::FetchError(FetchErrorKind::Timeout),
                tokens: None,
                window,
            };
        }
        Ok(Err(e)) => {
            tracing::warn!(source = %source_id, error = %e, "Fetch failed");
            return PassResult {
                source_id,
                outcome: PollOutcome::FetchError(e.kind()),
                tokens: None,
                window,
            };
        }
        Ok(Ok(output)) => output,
    };

    let (articles, tokens) = match fetched {
        FetchOutput::NotModified => {
            return PassResult {
                source_id,
                outcome: PollOutcome::NotModified,
                tokens: None,
                window,
            }
        }
        FetchOutput::Fetched {
            articles, tokens, ..
        } => (articles, tokens),
    };

    // Classify against the window plus links already accepted this batch,
    // so a feed repeating a link within one response dedups too.
    let mut batch = ClassifiedBatch::default();
    let mut batch_links: HashSet<String> = HashSet::new();
    for article in articles {
        if batch_links.contains(&article.link) {
            batch.rejected.push((article, RejectReason::Duplicate));
            continue;
        }
        match validate(&article, &window, &validation) {
            Ok(()) => {
                batch_links.insert(article.link.clone());
                batch.accepted.push(article);
            }
            Err(reason) => batch.rejected.push((article, reason)),
        }
    }
    let accepted = batch.accepted.clone();

    let remaining = deadline.saturating_sub(started.elapsed());
    let report = match tokio::time::timeout(remaining, publisher.publish(batch)).await {
        Err(_) => {
            tracing::warn!(source = %source_id, "Pass deadline expired during publish");
            return PassResult {
                source_id,
                outcome: PollOutcome::PublishError(PublishErrorKind::Timeout),
                tokens: None,
                window,
            };
        }
        Ok(report) => report,
    };

    if let Some(kind) = report.failure {
        // No commit: the next due cycle re-fetches and re-attempts
        return PassResult {
            source_id,
            outcome: PollOutcome::PublishError(kind),
            tokens: None,
            window,
        };
    }

    for article in &accepted {
        window.insert(article.link.clone());
    }

    if let Some(store) = &store {
        if !accepted.is_empty() {
            if let Err(e) = store.save_parsed(&source_id, &accepted).await {
                tracing::warn!(
                    source = %source_id,
                    error = %e,
                    "Parsed-article side channel write failed"
                );
            }
        }
    }

    PassResult {
        source_id,
        outcome: PollOutcome::Success {
            accepted: report.delivered,
            rejected: report.dead_lettered,
        },
        tokens: Some(tokens),
        window,
    }
}

// ============================================================================
// Admission
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
struct DueEntry {
    id: String,
    priority: Priority,
    overdue: Duration,
}

/// Priority first, then longest-overdue first.
fn admission_order(mut due: Vec<DueEntry>) -> Vec<DueEntry> {
    due.sort_by(|a, b| a.priority.cmp(&b.priority).then(b.overdue.cmp(&a.overdue)));
    due
}

// ============================================================================
// Scheduler
// ============================================================================

pub struct AdaptiveScheduler {
    registry: Registry,
    conditional: HashMap<String, ConditionalFetchState>,
    windows: HashMap<String, DedupWindow>,
    /// Source ids with a pass currently running. Guards against overlapping
    /// passes for one source regardless of tick rate.
    in_flight: HashSet<String>,
    fetcher: Arc<dyn ConditionalFetch>,
    publisher: Arc<Publisher>,
    store: Option<Arc<ArticleStore>>,
    settings: SchedulerSettings,
    semaphore: Arc<Semaphore>,
    results_tx: mpsc::Sender<PassResult>,
    results_rx: Option<mpsc::Receiver<PassResult>>,
    status_tx: watch::Sender<StatusSnapshot>,
    counters: ActivityCounters,
}

impl AdaptiveScheduler {
    pub fn new(
        registry: Registry,
        fetcher: Arc<dyn ConditionalFetch>,
        publisher: Arc<Publisher>,
        store: Option<Arc<ArticleStore>>,
        settings: SchedulerSettings,
    ) -> (Self, watch::Receiver<StatusSnapshot>) {
        let (results_tx, results_rx) = mpsc::channel(registry.len().max(16));
        let (status_tx, status_rx) = watch::channel(StatusSnapshot::default());
        let windows = registry
            .iter()
            .map(|s| (s.id.clone(), DedupWindow::new(settings.dedup_window)))
            .collect();

        let scheduler = Self {
            semaphore: Arc::new(Semaphore::new(settings.max_concurrent_fetches.max(1))),
            registry,
            conditional: HashMap::new(),
            windows,
            in_flight: HashSet::new(),
            fetcher,
            publisher,
            store,
            settings,
            results_tx,
            results_rx: Some(results_rx),
            status_tx,
            counters: ActivityCounters::default(),
        };
        scheduler.publish_status();
        (scheduler, status_rx)
    }

    /// One due-check: select sources, order them, dispatch up to the pool's
    /// free capacity. Never blocks on the pool — sources that don't fit stay
    /// due and compete again next tick. Returns the number dispatched.
    pub fn tick(&mut self, now: Instant) -> usize {
        let due: Vec<DueEntry> = self
            .registry
            .iter()
            .filter(|s| !self.in_flight.contains(&s.id) && s.is_due(now))
            .map(|s| DueEntry {
                id: s.id.clone(),
                priority: s.priority,
                overdue: s.overdue_by(now),
            })
            .collect();

        let mut dispatched = 0;
        for entry in admission_order(due) {
            let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let Some(source) = self.registry.get(&entry.id).cloned() else {
                continue;
            };
            let conditional = self.conditional.get(&entry.id).cloned().unwrap_or_default();
            let window = self
                .windows
                .remove(&entry.id)
                .unwrap_or_else(|| DedupWindow::new(self.settings.dedup_window));
            self.in_flight.insert(entry.id.clone());

            let ctx = PassContext {
                source,
                conditional,
                window,
                fetcher: Arc::clone(&self.fetcher),
                publisher: Arc::clone(&self.publisher),
                store: self.store.clone(),
                validation: self.settings.validation,
                deadline: self.settings.pass_deadline,
            };
            let tx = self.results_tx.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let result = run_pass(ctx).await;
                let _ = tx.send(result).await;
            });
            dispatched += 1;
        }

        if dispatched > 0 {
            tracing::debug!(dispatched, in_flight = self.in_flight.len(), "Dispatched due sources");
            self.publish_status();
        }
        dispatched
    }

    /// Fold a completed pass back into the source's adaptive state.
    fn apply_result(&mut self, result: PassResult) {
        let PassResult {
            source_id,
            outcome,
            tokens,
            window,
        } = result;

        self.in_flight.remove(&source_id);
        self.windows.insert(source_id.clone(), window);

        let now = Instant::now();
        if let Some(source) = self.registry.get_mut(&source_id) {
            source.apply_outcome(&outcome, now, &self.settings.policy);

            if let Some(tokens) = tokens {
                self.conditional.insert(source_id.clone(), tokens);
            }

            // A source whose every parsed entry keeps getting rejected may be
            // stuck behind stale validators; force a full refetch.
            let threshold = self.settings.validation_reset_threshold;
            if threshold > 0 && source.consecutive_rejected_only >= threshold {
                if self.conditional.remove(&source_id).is_some() {
                    tracing::info!(
                        source = %source_id,
                        "Cleared conditional tokens after repeated all-rejected passes"
                    );
                }
                source.consecutive_rejected_only = 0;
            }

            tracing::info!(
                source = %source_id,
                outcome = %outcome.code(),
                interval_secs = source.poll_interval.as_secs(),
                errors = source.consecutive_errors,
                "Pass complete"
            );
        }

        match outcome {
            PollOutcome::Success { .. } | PollOutcome::NotModified => {
                self.counters.successful_fetches += 1;
                self.counters.last_success = Some(Utc::now());
            }
            PollOutcome::FetchError(_) | PollOutcome::PublishError(_) => {
                self.counters.failed_fetches += 1;
                self.counters.last_failure = Some(Utc::now());
            }
        }

        self.publish_status();
    }

    /// Poll every currently-due source once and wait for those passes to
    /// finish. Used by the one-shot CLI mode and by tests.
    pub async fn run_once(&mut self) {
        self.tick(Instant::now());
        let Some(mut rx) = self.results_rx.take() else {
            return;
        };
        while !self.in_flight.is_empty() {
            match rx.recv().await {
                Some(result) => self.apply_result(result),
                None => break,
            }
        }
        self.results_rx = Some(rx);
    }

    /// Steady-state loop: periodic due-checks interleaved with completed
    /// passes. Runs until the surrounding task is dropped; there is no fatal
    /// error path in here.
    pub async fn run(mut self) {
        let Some(mut rx) = self.results_rx.take() else {
            return;
        };
        let mut ticker = tokio::time::interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(Instant::now());
                }
                result = rx.recv() => {
                    match result {
                        Some(result) => self.apply_result(result),
                        // All senders gone: nothing can ever complete again
                        None => break,
                    }
                }
            }
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let mut sources: Vec<SourceStatus> = self
            .registry
            .iter()
            .map(|s| SourceStatus {
                id: s.id.clone(),
                poll_interval_secs: s.poll_interval.as_secs(),
                consecutive_errors: s.consecutive_errors,
                health: s.health,
                last_outcome: s.last_outcome.map(|o| o.code()),
            })
            .collect();
        sources.sort_by(|a, b| a.id.cmp(&b.id));

        StatusSnapshot {
            active_source_count: self.registry.len(),
            in_flight_count: self.in_flight.len(),
            successful_fetches: self.counters.successful_fetches,
            failed_fetches: self.counters.failed_fetches,
            last_success: self.counters.last_success,
            last_failure: self.counters.last_failure,
            sources,
        }
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.snapshot());
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn conditional_state(&self, source_id: &str) -> Option<&ConditionalFetchState> {
        self.conditional.get(source_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}

// ============================================================================
// Tests
// ============================================================================
