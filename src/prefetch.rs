//! Look-ahead pagination over a source that can only return its newest N items.
//!
//! Each network fetch asks for everything already shown plus a batch larger
//! than one page. Whatever is not shown right away is kept in a buffer, and
//! later "load more" requests are served from it without touching the network.

use crate::scraper::{Post, PostSource, ScraperError};
use serde::Serialize;
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PageOutcome {
    /// New items appended to the shown list.
    Page {
        items: Vec<Post>,
        from_buffer: bool,
        buffered: usize,
    },
    /// The source returned nothing that is not already shown.
    NoNewItems,
}

#[derive(Debug, Clone)]
pub struct PrefetchBuffer {
    subject: String,
    batch_size: usize,
    shown: Vec<Post>,
    buffer: Vec<Post>,
}

impl PrefetchBuffer {
    pub fn new(subject: &str, batch_size: usize) -> Self {
        Self {
            subject: subject.trim().to_string(),
            batch_size: batch_size.max(1),
            shown: Vec::new(),
            buffer: Vec::new(),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn shown(&self) -> &[Post] {
        &self.shown
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Starts a fresh search: everything shown or buffered is dropped.
    pub fn restart(&mut self, subject: &str) {
        self.subject = subject.trim().to_string();
        self.shown.clear();
        self.buffer.clear();
    }

    pub async fn request_more(
        &mut self,
        source: &dyn PostSource,
        page_size: usize,
    ) -> Result<PageOutcome, ScraperError> {
        let page_size = page_size.max(1);
        if !self.buffer.is_empty() {
            let take = page_size.min(self.buffer.len());
            let items: Vec<Post> = self.buffer.drain(..take).collect();
            self.shown.extend(items.iter().cloned());
            return Ok(PageOutcome::Page {
                items,
                from_buffer: true,
                buffered: self.buffer.len(),
            });
        }

        let limit = self.shown.len() + self.batch_size;
        let incoming = source.fetch_posts(&self.subject, limit).await?;

        let mut seen: HashSet<String> = self.shown.iter().map(|p| p.key().to_string()).collect();
        let fresh: Vec<Post> = incoming
            .into_iter()
            .filter(|post| seen.insert(post.key().to_string()))
            .collect();
        debug!(
            target = "wayover.prefetch",
            subject = %self.subject,
            limit,
            fresh = fresh.len(),
            "source_fetched"
        );
        if fresh.is_empty() {
            return Ok(PageOutcome::NoNewItems);
        }

        let mut fresh = fresh.into_iter();
        let items: Vec<Post> = fresh.by_ref().take(page_size).collect();
        self.buffer = fresh.collect();
        self.shown.extend(items.iter().cloned());
        Ok(PageOutcome::Page {
            items,
            from_buffer: false,
            buffered: self.buffer.len(),
        })
    }
}
