//! The indexed side of a reconciliation pass.

use async_trait::async_trait;
use flowlens_storage::PgPool;
use flowlens_storage::models::{Entity, IndexedEvent};
use flowlens_storage::repos;

use crate::error::SourceError;

/// Read-only access to indexed entities, pinned to a block.
#[async_trait]
pub trait IndexedSource: Send + Sync {
    /// The newest block the indexer has fully written.
    async fn latest_block(&self) -> Result<u64, SourceError>;

    /// Up to `limit` entities visible at `pin` with id greater than `after`, ordered by id.
    async fn fetch_page<E: Entity>(
        &self,
        pin: u64,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<E>, SourceError>;

    async fn event_by_transaction(
        &self,
        transaction_hash: &str,
        name: &str,
        pin: u64,
    ) -> Result<Option<IndexedEvent>, SourceError>;
}

/// Indexed source backed by the indexer's PostgreSQL store.
#[derive(Clone)]
pub struct PgIndexedSource {
    pool: PgPool,
}

impl PgIndexedSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn query_failed(err: impl std::fmt::Display) -> SourceError {
    SourceError::Query(err.to_string())
}

fn block_param(block: u64) -> Result<i64, SourceError> {
    i64::try_from(block).map_err(query_failed)
}

#[async_trait]
impl IndexedSource for PgIndexedSource {
    async fn latest_block(&self) -> Result<u64, SourceError> {
        let block = repos::get_last_indexed_block(&self.pool).await.map_err(query_failed)?;
        u64::try_from(block).map_err(query_failed)
    }

    async fn fetch_page<E: Entity>(
        &self,
        pin: u64,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<E>, SourceError> {
        let limit = i64::try_from(limit).map_err(query_failed)?;
        repos::fetch_entity_page::<_, E>(&self.pool, block_param(pin)?, after, limit)
            .await
            .map_err(query_failed)
    }

    async fn event_by_transaction(
        &self,
        transaction_hash: &str,
        name: &str,
        pin: u64,
    ) -> Result<Option<IndexedEvent>, SourceError> {
        repos::get_event_by_transaction(&self.pool, transaction_hash, name, block_param(pin)?)
            .await
            .map_err(query_failed)
    }
}
