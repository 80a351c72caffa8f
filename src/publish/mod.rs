//! Delivery to the downstream message stream.
//!
//! - [`producer`] - The [`StreamProducer`] seam and its ZeroMQ implementation
//! - [`retry`] - Bounded retry with exponential backoff
//! - [`publisher`] - Batch routing between the primary and dead-letter topics

mod producer;
mod publisher;
mod retry;

pub use producer::{Envelope, ProduceError, StreamProducer, ZmqProducer};
pub use publisher::{ClassifiedBatch, PublishReport, Publisher, PublisherSettings};
pub use retry::RetryPolicy;
