use sqlx::types::Json;
use sqlx::{Executor, PgConnection, PgPool, Postgres, QueryBuilder};

use crate::models::*;

// ─── Entity Versions ────────────────────────────────────────────────────────

/// Write `entity` as its version from `block` on.
///
/// The open version (if older) is closed at `block`. Writing twice in the same
/// block replaces that block's version.
pub async fn upsert_entity_version<E: Entity>(
    conn: &mut PgConnection,
    entity: &E,
    block: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE entities SET block_to = $3
        WHERE kind = $1 AND id = $2 AND block_to IS NULL AND block_from < $3
        "#,
    )
    .bind(E::KIND)
    .bind(entity.id())
    .bind(block)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO entities (kind, id, block_from, block_to, data)
        VALUES ($1, $2, $3, NULL, $4)
        ON CONFLICT (kind, id, block_from) DO UPDATE
        SET data = $4, block_to = NULL
        "#,
    )
    .bind(E::KIND)
    .bind(entity.id())
    .bind(block)
    .bind(Json(entity))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// One page of entities as they were at block `pin`, ordered by id.
///
/// `after` is the last id of the previous page; `None` starts from the top.
pub async fn fetch_entity_page<'e, X, E>(
    executor: X,
    pin: i64,
    after: Option<&str>,
    limit: i64,
) -> Result<Vec<E>, sqlx::Error>
where
    X: Executor<'e, Database = Postgres>,
    E: Entity,
{
    let rows: Vec<(Json<E>,)> = sqlx::query_as(
        r#"
        SELECT data FROM entities
        WHERE kind = $1
          AND block_from <= $2
          AND (block_to IS NULL OR block_to > $2)
          AND id > $3
        ORDER BY id
        LIMIT $4
        "#,
    )
    .bind(E::KIND)
    .bind(pin)
    .bind(after.unwrap_or(""))
    .bind(limit)
    .fetch_all(executor)
    .await?;
    Ok(rows.into_iter().map(|(Json(e),)| e).collect())
}

/// Every entity of a kind in its latest version.
pub async fn load_current<'e, X, E>(executor: X) -> Result<Vec<E>, sqlx::Error>
where
    X: Executor<'e, Database = Postgres>,
    E: Entity,
{
    let rows: Vec<(Json<E>,)> =
        sqlx::query_as("SELECT data FROM entities WHERE kind = $1 AND block_to IS NULL ORDER BY id")
            .bind(E::KIND)
            .fetch_all(executor)
            .await?;
    Ok(rows.into_iter().map(|(Json(e),)| e).collect())
}

/// Count of live entities of a kind.
pub async fn count_current<E: Entity>(pool: &PgPool) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM entities WHERE kind = $1 AND block_to IS NULL")
        .bind(E::KIND)
        .fetch_one(pool)
        .await?;
    Ok(row.0)
}

// ─── Event Queries ──────────────────────────────────────────────────────────

/// Insert a batch of events using a single multi-value INSERT.
/// Skips duplicates on id.
pub async fn insert_events_batch<'e, E>(executor: E, events: &[IndexedEvent]) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    if events.is_empty() {
        return Ok(());
    }

    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO events (id, name, transaction_hash, block_number, log_index, timestamp, token, properties) ",
    );

    qb.push_values(events, |mut b, e| {
        b.push_bind(&e.id)
            .push_bind(&e.name)
            .push_bind(&e.transaction_hash)
            .push_bind(e.block_number)
            .push_bind(e.log_index)
            .push_bind(e.timestamp)
            .push_bind(&e.token)
            .push_bind(&e.properties);
    });

    qb.push(" ON CONFLICT (id) DO NOTHING");
    qb.build().execute(executor).await?;
    Ok(())
}

/// The first event of type `name` in a transaction, if indexed by block `pin`.
pub async fn get_event_by_transaction(
    pool: &PgPool,
    transaction_hash: &str,
    name: &str,
    pin: i64,
) -> Result<Option<IndexedEvent>, sqlx::Error> {
    sqlx::query_as::<_, IndexedEvent>(
        r#"
        SELECT * FROM events
        WHERE transaction_hash = $1 AND name = $2 AND block_number <= $3
        ORDER BY log_index
        LIMIT 1
        "#,
    )
    .bind(transaction_hash)
    .bind(name)
    .bind(pin)
    .fetch_optional(pool)
    .await
}

// ─── Block Queries ──────────────────────────────────────────────────────────

/// Insert a processed block.
pub async fn insert_block<'e, E>(executor: E, block: &IndexedBlock) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO indexed_blocks (block_number, block_hash, parent_hash, timestamp)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (block_number) DO UPDATE
        SET block_hash = $2, parent_hash = $3, timestamp = $4
        "#,
    )
    .bind(block.block_number)
    .bind(&block.block_hash)
    .bind(&block.parent_hash)
    .bind(block.timestamp)
    .execute(executor)
    .await?;
    Ok(())
}

/// Get the stored block hash for a specific block number.
pub async fn get_block_hash(pool: &PgPool, block_number: i64) -> Result<Option<String>, sqlx::Error> {
    let row: Option<(String,)> = sqlx::query_as("SELECT block_hash FROM indexed_blocks WHERE block_number = $1")
        .bind(block_number)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| r.0))
}

/// Delete all indexed data after a given block number (for reorg handling).
///
/// Entity versions opened after the fork are dropped and versions closed after
/// it are reopened, so the store reads exactly as it did at `fork_block`.
pub async fn reorg_rollback(pool: &PgPool, fork_block: i64) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM entities WHERE block_from > $1")
        .bind(fork_block)
        .execute(&mut *tx)
        .await?;

    sqlx::query("UPDATE entities SET block_to = NULL WHERE block_to > $1")
        .bind(fork_block)
        .execute(&mut *tx)
        .await?;

    sqlx::query("DELETE FROM events WHERE block_number > $1")
        .bind(fork_block)
        .execute(&mut *tx)
        .await?;

    sqlx::query("DELETE FROM indexed_blocks WHERE block_number > $1")
        .bind(fork_block)
        .execute(&mut *tx)
        .await?;

    set_last_indexed_block(&mut *tx, fork_block).await?;

    tx.commit().await?;

    tracing::warn!(fork_block, "Reorg rollback complete, deleted data after block");
    Ok(())
}

// ─── Indexer State ──────────────────────────────────────────────────────────

/// Get the last indexed block from persistent state.
pub async fn get_last_indexed_block<'e, E>(executor: E) -> Result<i64, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let row: (String,) = sqlx::query_as("SELECT value FROM indexer_state WHERE key = 'last_indexed_block'")
        .fetch_one(executor)
        .await?;
    row.0
        .parse::<i64>()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

/// Set the last indexed block in persistent state.
pub async fn set_last_indexed_block<'e, E>(executor: E, block_number: i64) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query("UPDATE indexer_state SET value = $1 WHERE key = 'last_indexed_block'")
        .bind(block_number.to_string())
        .execute(executor)
        .await?;
    Ok(())
}
