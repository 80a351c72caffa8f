use anyhow::Result;
use feed_rs::parser;
use sha2::{Digest, Sha256};

use crate::source::Article;

/// Outcome of parsing one feed payload.
///
/// `dropped` counts entries that failed structurally (no usable link) and
/// were skipped without failing the batch.
#[derive(Debug, Clone)]
pub struct ParsedBatch {
    pub articles: Vec<Article>,
    pub dropped: usize,
}

/// Parse an RSS/Atom payload into article candidates for one source.
///
/// Field-level problems (empty title, missing timestamp) are left to the
/// validator; only an entry with no link at all is unusable here, since the
/// link doubles as the dedup key.
pub fn parse_feed(bytes: &[u8], source_id: &str) -> Result<ParsedBatch> {
    let feed = parser::parse(bytes)?;

    let mut articles = Vec::with_capacity(feed.entries.len());
    let mut dropped = 0usize;

    for entry in feed.entries {
        let link = match entry.links.first() {
            Some(l) if !l.href.trim().is_empty() => l.href.clone(),
            _ => {
                dropped += 1;
                continue;
            }
        };

        let title = entry.title.map(|t| t.content).unwrap_or_default();
        let published = entry
            .published
            .or(entry.updated)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default();
        let summary = entry
            .summary
            .map(|s| s.content)
            .or_else(|| entry.content.and_then(|c| c.body))
            .unwrap_or_default();

        let digest = Sha256::digest(format!("{title}|{link}|{summary}").as_bytes());

        articles.push(Article {
            source_id: source_id.to_string(),
            title,
            link,
            published,
            summary,
            raw_content_digest: format!("{digest:x}"),
        });
    }

    Ok(ParsedBatch { articles, dropped })
}
