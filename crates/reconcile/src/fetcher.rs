use std::collections::HashSet;

use flowlens_core::RetryPolicy;
use flowlens_storage::models::Entity;

use crate::error::SourceError;
use crate::source::IndexedSource;

/// Default page cap of the indexed source.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Every entity of one kind, as seen at one pin.
#[derive(Debug, Clone)]
pub struct Fetched<E> {
    pub items: Vec<E>,
    /// Page requests that succeeded.
    pub pages: usize,
}

/// Walks an id cursor through an [`IndexedSource`] until a short page.
///
/// Page size is capped at [`DEFAULT_PAGE_SIZE`]: the source never returns
/// more, and a larger request would read its first page as the last.
#[derive(Debug, Clone)]
pub struct PaginatedFetcher {
    page_size: usize,
    retry: RetryPolicy,
}

impl PaginatedFetcher {
    pub fn new(page_size: usize, retry: RetryPolicy) -> Self {
        Self {
            page_size: page_size.clamp(1, DEFAULT_PAGE_SIZE),
            retry,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Fetch all entities of kind `E` visible at `pin`.
    ///
    /// Every page is read at the same pin. Entities repeated across a page
    /// boundary are kept once, in first-seen order.
    pub async fn fetch_all<E, S>(&self, source: &S, pin: u64) -> Result<Fetched<E>, SourceError>
    where
        E: Entity,
        S: IndexedSource + ?Sized,
    {
        let mut seen = HashSet::new();
        let mut items = Vec::new();
        let mut pages = 0;
        let mut cursor: Option<String> = None;
        let limit = self.page_size;

        loop {
            let after = cursor.as_deref();
            let page: Vec<E> = self
                .retry
                .run(E::KIND, move |_| source.fetch_page::<E>(pin, after, limit))
                .await?;
            pages += 1;

            let full = page.len() >= limit;
            let last = page.last().map(|e| e.id().to_string());
            for entity in page {
                if seen.insert(entity.id().to_string()) {
                    items.push(entity);
                }
            }
            tracing::debug!(kind = E::KIND, page = pages, total = items.len(), "Fetched page");

            match last {
                Some(id) if full => {
                    if cursor.as_deref() == Some(id.as_str()) {
                        tracing::warn!(kind = E::KIND, after = %id, "Cursor did not advance");
                        return Err(SourceError::Stalled(id));
                    }
                    cursor = Some(id);
                }
                _ => break,
            }
        }

        Ok(Fetched { items, pages })
    }
}
