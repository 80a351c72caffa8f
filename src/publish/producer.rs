use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use zeromq::prelude::*;
use zeromq::{PubSocket, ZmqMessage};

use crate::source::Article;

/// Errors from the producer seam.
#[derive(Debug, Error)]
pub enum ProduceError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("ZeroMQ error: {0}")]
    Zmq(#[from] zeromq::ZmqError),

    #[error("Send timed out")]
    Timeout,

    #[error("Message too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
}

impl ProduceError {
    /// Transient errors are worth retrying; the rest fail the same way every
    /// attempt and go straight to the dead-letter stream.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProduceError::Zmq(_) | ProduceError::Timeout)
    }
}

/// Wire-format envelope published on both topics.
///
/// JSON-encoded; `reason` is present only on dead-letter envelopes and
/// carries the rejection or delivery-failure code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub source_id: String,
    pub article: Article,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// When this envelope was created.
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn accepted(article: Article) -> Self {
        Self {
            source_id: article.source_id.clone(),
            article,
            reason: None,
            timestamp: Utc::now(),
        }
    }

    pub fn dead_letter(article: Article, reason: &str) -> Self {
        Self {
            source_id: article.source_id.clone(),
            article,
            reason: Some(reason.to_string()),
            timestamp: Utc::now(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Minimal producer capability the publisher routes through.
///
/// Kept to a single send so the transport is swappable; tests substitute an
/// in-memory recorder.
#[async_trait]
pub trait StreamProducer: Send + Sync {
    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<(), ProduceError>;
}

/// ZeroMQ PUB socket producer.
///
/// Messages go out as two-frame ZMQ messages: topic string first (for
/// subscriber-side prefix filtering), then the JSON envelope.
pub struct ZmqProducer {
    socket: Mutex<PubSocket>,
}

impl ZmqProducer {
    /// Connect to a broker's frontend endpoint.
    pub async fn connect(endpoint: &str) -> Result<Self, ProduceError> {
        let mut socket = PubSocket::new();
        tracing::info!(endpoint = %endpoint, "Connecting PUB socket");
        socket.connect(endpoint).await?;
        Ok(Self {
            socket: Mutex::new(socket),
        })
    }

    /// Bind directly, for brokerless PUB/SUB where subscribers connect here.
    pub async fn bind(endpoint: &str) -> Result<Self, ProduceError> {
        let mut socket = PubSocket::new();
        tracing::info!(endpoint = %endpoint, "Binding PUB socket");
        socket.bind(endpoint).await?;
        Ok(Self {
            socket: Mutex::new(socket),
        })
    }
}

#[async_trait]
impl StreamProducer for ZmqProducer {
    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<(), ProduceError> {
        let mut message = ZmqMessage::from(topic);
        message.push_back(payload.into());

        let mut socket = self.socket.lock().await;
        socket.send(message).await?;

        tracing::debug!(topic = %topic, "Published message");
        Ok(())
    }
}
