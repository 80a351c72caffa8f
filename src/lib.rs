//! feedstream — adaptive RSS/Atom polling pipeline.
//!
//! The crate is organized around one fetch→validate→publish pass per source:
//!
//! - [`source`] - Source records, adaptive polling state, pass outcomes
//! - [`fetch`] - Conditional HTTP retrieval and feed parsing
//! - [`validate`] - Pure article validation and the per-source dedup window
//! - [`publish`] - Stream producer, bounded retry, dead-letter routing
//! - [`scheduler`] - The coordinating loop driving the bounded worker pool
//! - [`storage`] - Best-effort file side channel for parsed batches
//! - [`config`] - TOML configuration for the pipeline and its sources

pub mod config;
pub mod fetch;
pub mod publish;
pub mod scheduler;
pub mod source;
pub mod storage;
pub mod util;
pub mod validate;
