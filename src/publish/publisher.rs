use std::sync::Arc;
use std::time::Duration;

use crate::config::PipelineConfig;
use crate::publish::producer::{Envelope, ProduceError, StreamProducer};
use crate::publish::retry::RetryPolicy;
use crate::source::{Article, PublishErrorKind};
use crate::validate::RejectReason;

/// The accepted and rejected articles of one pipeline pass.
#[derive(Debug, Default)]
pub struct ClassifiedBatch {
    pub accepted: Vec<Article>,
    pub rejected: Vec<(Article, RejectReason)>,
}

impl ClassifiedBatch {
    pub fn len(&self) -> usize {
        self.accepted.len() + self.rejected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accepted.is_empty() && self.rejected.is_empty()
    }
}

/// Outcome of routing one batch.
///
/// `failure` set means at least one article could not be placed on either
/// topic, or primary delivery exhausted its retries; the scheduler treats the
/// pass as failed and does not commit conditional state, so the same content
/// is re-fetched and re-attempted on the next due cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishReport {
    /// Articles delivered to the primary topic.
    pub delivered: usize,
    /// Articles delivered to the dead-letter topic.
    pub dead_lettered: usize,
    pub failure: Option<PublishErrorKind>,
}

impl PublishReport {
    /// First failure wins; later ones add nothing the scheduler acts on.
    fn record_failure(&mut self, kind: PublishErrorKind) {
        self.failure.get_or_insert(kind);
    }
}

/// Producer configuration surface, supplied from the pipeline configuration.
#[derive(Debug, Clone)]
pub struct PublisherSettings {
    pub primary_topic: String,
    pub dead_letter_topic: String,
    pub retry: RetryPolicy,
    /// Serialized envelopes above this size skip retry and dead-letter.
    pub max_message_bytes: usize,
}

impl From<&PipelineConfig> for PublisherSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            primary_topic: config.primary_topic.clone(),
            dead_letter_topic: config.dead_letter_topic.clone(),
            retry: RetryPolicy {
                max_attempts: config.retry_max_attempts,
                base_delay: Duration::from_millis(config.retry_base_delay_ms),
            },
            max_message_bytes: config.max_message_bytes,
        }
    }
}

/// Routes every article of a pass to exactly one of the two topics.
///
/// Accepted articles go to the primary topic, retried on transient broker
/// errors. Rejected articles, and accepted ones that exhaust their retries
/// or hit a non-transient error, go to the dead-letter topic tagged with the
/// reason. An article that reaches neither topic fails the whole pass.
pub struct Publisher {
    producer: Arc<dyn StreamProducer>,
    settings: PublisherSettings,
}

impl Publisher {
    pub fn new(producer: Arc<dyn StreamProducer>, settings: PublisherSettings) -> Self {
        Self { producer, settings }
    }

    pub async fn publish(&self, batch: ClassifiedBatch) -> PublishReport {
        let mut report = PublishReport::default();

        for (article, reason) in batch.rejected {
            tracing::debug!(
                source = %article.source_id,
                link = %article.link,
                reason = reason.as_code(),
                "Article rejected by validator"
            );
            self.dead_letter(article, reason.as_code(), &mut report)
                .await;
        }

        for article in batch.accepted {
            match self.encode_primary(&article) {
                Ok(payload) => {
                    match self
                        .send_with_retry(&self.settings.primary_topic, payload)
                        .await
                    {
                        Ok(()) => report.delivered += 1,
                        Err(e) => {
                            tracing::warn!(
                                source = %article.source_id,
                                link = %article.link,
                                error = %e,
                                "Primary delivery failed after retries"
                            );
                            if e.is_transient() {
                                report.record_failure(error_kind(&e));
                            }
                            self.dead_letter(article, "primary_delivery_failed", &mut report)
                                .await;
                        }
                    }
                }
                Err(e) => {
                    // Non-transient by construction: retrying cannot help
                    tracing::warn!(
                        source = %article.source_id,
                        link = %article.link,
                        error = %e,
                        "Article undeliverable to primary"
                    );
                    let (stub, reason) = match e {
                        ProduceError::TooLarge { .. } => {
                            // The oversize payload is the summary; drop it so
                            // the dead-letter envelope itself fits
                            let mut stub = article;
                            stub.summary.clear();
                            (stub, "message_too_large")
                        }
                        _ => (article, "serialization_failed"),
                    };
                    self.dead_letter(stub, reason, &mut report).await;
                }
            }
        }

        report
    }

    fn encode_primary(&self, article: &Article) -> Result<Vec<u8>, ProduceError> {
        let payload = Envelope::accepted(article.clone()).to_bytes()?;
        if payload.len() > self.settings.max_message_bytes {
            return Err(ProduceError::TooLarge {
                size: payload.len(),
                max: self.settings.max_message_bytes,
            });
        }
        Ok(payload)
    }

    async fn dead_letter(&self, article: Article, reason: &str, report: &mut PublishReport) {
        let envelope = Envelope::dead_letter(article, reason);
        let payload = match envelope.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "Dead-letter envelope serialization failed");
                report.record_failure(PublishErrorKind::NonTransientBroker);
                return;
            }
        };

        match self
            .send_with_retry(&self.settings.dead_letter_topic, payload)
            .await
        {
            Ok(()) => report.dead_lettered += 1,
            Err(e) => {
                tracing::error!(error = %e, reason = reason, "Dead-letter delivery failed");
                report.record_failure(error_kind(&e));
            }
        }
    }

    async fn send_with_retry(&self, topic: &str, payload: Vec<u8>) -> Result<(), ProduceError> {
        self.settings
            .retry
            .run(ProduceError::is_transient, || {
                let payload = payload.clone();
                async move { self.producer.send(topic, payload).await }
            })
            .await
    }
}

fn error_kind(e: &ProduceError) -> PublishErrorKind {
    match e {
        ProduceError::Timeout => PublishErrorKind::Timeout,
        ProduceError::Zmq(_) => PublishErrorKind::TransientBroker,
        ProduceError::Serialization(_) | ProduceError::TooLarge { .. } => {
            PublishErrorKind::NonTransientBroker
        }
    }
}
