//! Best-effort file side channel for parsed articles.
//!
//! Invoked after a pass publishes successfully; a write failure is logged by
//! the caller and never affects the pass outcome. Publishing to the broker is
//! the durable path, this is for inspection and offline reprocessing.
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use crate::source::Article;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Writes parsed-article batches as timestamped JSON files under
/// `<root>/parsed/<source_id>/`.
pub struct ArticleStore {
    root: PathBuf,
    /// Distinguishes files written within one timestamp granule.
    sequence: AtomicU64,
}

impl ArticleStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Persist one batch, returning the written path.
    ///
    /// Writes to a temp file and renames into place so a crash mid-write
    /// never leaves a partial JSON file behind.
    pub async fn save_parsed(
        &self,
        source_id: &str,
        articles: &[Article],
    ) -> Result<PathBuf, StorageError> {
        let dir = self.root.join("parsed").join(sanitize_component(source_id));
        tokio::fs::create_dir_all(&dir).await?;

        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3fZ");
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!("{stamp}-{seq:04}.json"));
        let temp_path = path.with_extension("json.tmp");

        let json = serde_json::to_vec_pretty(articles)?;
        tokio::fs::write(&temp_path, &json).await?;
        if let Err(e) = tokio::fs::rename(&temp_path, &path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        tracing::debug!(
            source = %source_id,
            path = %path.display(),
            articles = articles.len(),
            "Saved parsed batch"
        );
        Ok(path)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Source ids come from configuration, but they become path components here,
/// so anything outside a conservative character set is replaced.
fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
