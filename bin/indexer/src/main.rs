//! Flowlens Indexer: follows the streaming ledger and keeps a block-versioned
//! copy of every stream, period, snapshot, index and subscription.
//!
//! Flow:
//! 1. Connect to the ledger RPC & PostgreSQL
//! 2. Discover super tokens from the factory
//! 3. Poll blocks in batches, decode agreement and token events
//! 4. Apply them in log order and persist each change as a new entity version
//!
//! Reorgs are detected by parent hash against `indexed_blocks`; the store is
//! rolled back to the fork point and in-memory state reloaded from it.

mod state;

use std::collections::HashMap;
use std::str::FromStr;

use alloy::{
    consensus::BlockHeader,
    network::primitives::HeaderResponse,
    primitives::{Address, I256},
    providers::Provider,
    rpc::types::{Filter, Log},
    sol_types::SolEvent,
};
use eyre::Result;
use flowlens_chain::{
    ChainProvider, DecodedEvent, GroundTruth, LedgerEvent, Retrying, RpcGroundTruth, SuperToken, SuperTokenFactory,
    create_provider, decode_log,
};
use flowlens_core::{RetryPolicy, Settings, telemetry};
use flowlens_storage::{self as storage, models::*};
use flowlens_streams::EventPosition;
use sqlx::{PgConnection, PgPool};

use crate::state::{Change, IndexerState};

type Ledger = Retrying<RpcGroundTruth>;

/// Static addresses the indexer watches.
struct Contracts {
    cfa: Address,
    ida: Address,
    factory: Address,
}

impl Contracts {
    fn from_settings(settings: &Settings) -> Result<Self> {
        let parse = |name: &str, value: &str| {
            Address::from_str(value).map_err(|e| eyre::eyre!("{name} is not an address ({value}): {e}"))
        };
        Ok(Self {
            cfa: parse("CFA_ADDRESS", &settings.cfa_address)?,
            ida: parse("IDA_ADDRESS", &settings.ida_address)?,
            factory: parse("SUPER_TOKEN_FACTORY_ADDRESS", &settings.super_token_factory_address)?,
        })
    }
}

struct Indexer {
    provider: ChainProvider,
    ledger: Ledger,
    pool: PgPool,
    contracts: Contracts,
    settings: Settings,
    state: IndexerState,
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();
    let settings = Settings::from_env()?;

    tracing::info!(rpc = %settings.rpc_url, chain_id = settings.chain_id, "Starting Flowlens Indexer");

    let pool = storage::connect(&settings.database_url).await?;
    tracing::info!("Connected to database");

    storage::migrate(&pool).await?;
    tracing::info!("Database migrations applied");

    let provider = create_provider(&settings.rpc_url)?;
    let contracts = Contracts::from_settings(&settings)?;
    let ledger = Retrying::new(
        RpcGroundTruth::new(provider.clone(), contracts.cfa, contracts.ida),
        RetryPolicy::from_settings(&settings),
    );

    let chain_id = ledger.chain_id().await?;
    if chain_id != settings.chain_id {
        eyre::bail!("RPC serves chain {chain_id}, expected {}", settings.chain_id);
    }
    tracing::info!(chain_id, "Connected to ledger RPC");

    let state = load_state(&pool).await?;
    let mut indexer = Indexer {
        provider,
        ledger,
        pool,
        contracts,
        settings,
        state,
    };

    let mut last_block = storage::repos::get_last_indexed_block(&indexer.pool).await?;
    if last_block == 0 && indexer.settings.start_block > 0 {
        last_block = indexer.settings.start_block as i64 - 1;
    }

    // Tokens created before the cursor are picked up here; later ones arrive with their batch.
    tracing::info!("Discovering super tokens from factory…");
    indexer.discover_tokens(last_block).await?;
    let token_count = storage::repos::count_current::<Token>(&indexer.pool).await?;
    tracing::info!(count = token_count, "Tracking tokens");

    tracing::info!(from_block = last_block + 1, "Starting indexing loop");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutting down gracefully…");
                break;
            }
            result = indexer.index_next_batch(&mut last_block) => {
                match result {
                    Ok(true) => {}
                    Ok(false) => tokio::time::sleep(std::time::Duration::from_secs(2)).await,
                    Err(e) => {
                        tracing::error!(error = %e, "Indexing error, retrying in 5s…");
                        // The failed batch may have been half-applied in memory.
                        match load_state(&indexer.pool).await {
                            Ok(state) => indexer.state = state,
                            Err(e) => tracing::error!(error = %e, "Failed to reload state"),
                        }
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    }
                }
            }
        }
    }

    tracing::info!("Indexer stopped.");
    Ok(())
}

/// Rebuild in-memory state from the current entity versions.
async fn load_state(pool: &PgPool) -> Result<IndexerState> {
    use storage::repos::load_current;

    let state = IndexerState::restore(
        load_current::<_, Token>(pool).await?,
        load_current::<_, Stream>(pool).await?,
        load_current::<_, StreamPeriod>(pool).await?,
        load_current::<_, AccountTokenSnapshot>(pool).await?,
        load_current::<_, Index>(pool).await?,
        load_current::<_, IndexSubscription>(pool).await?,
        load_current::<_, TokenStatistic>(pool).await?,
    )?;
    Ok(state)
}

/// Ordered changes of a batch, each tagged with the block it happened in.
type Versions = Vec<(u64, Change)>;

impl Indexer {
    fn factory_filter(&self, from: u64, to: u64) -> Filter {
        Filter::new()
            .address(self.contracts.factory)
            .event_signature(vec![
                SuperTokenFactory::SuperTokenCreated::SIGNATURE_HASH,
                SuperTokenFactory::CustomSuperTokenCreated::SIGNATURE_HASH,
            ])
            .from_block(from)
            .to_block(to)
    }

    /// Scan the factory up to `until` and register every token not yet known.
    ///
    /// Only the factory is queried, so this stays cheap however many tokens exist.
    async fn discover_tokens(&mut self, until: i64) -> Result<()> {
        if until < 0 {
            return Ok(());
        }
        let until = until as u64;
        let mut from = self.settings.start_block;
        let batch = 10_000u64;
        let mut versions = Versions::new();

        while from <= until {
            let to = std::cmp::min(from + batch - 1, until);
            let logs = self.provider.get_logs(&self.factory_filter(from, to)).await?;
            for event in logs.iter().filter_map(decode_log) {
                versions.extend(self.register_token(&event).await?);
            }
            from = to + 1;
        }

        if !versions.is_empty() {
            let mut tx = self.pool.begin().await?;
            persist(&mut *tx, &versions).await?;
            tx.commit().await?;
        }
        Ok(())
    }

    async fn register_token(&mut self, event: &DecodedEvent) -> Result<Versions> {
        let LedgerEvent::SuperTokenCreated { token } = event.event else {
            return Ok(Versions::new());
        };
        if self.state.is_known_token(&token) {
            return Ok(Versions::new());
        }

        let contract = SuperToken::new(token, &self.provider);
        let name = contract.name().call().await.unwrap_or_else(|e| {
            tracing::warn!(token = %token, error = %e, "Token name unavailable");
            String::new()
        });
        let symbol = contract.symbol().call().await.unwrap_or_else(|e| {
            tracing::warn!(token = %token, error = %e, "Token symbol unavailable");
            String::new()
        });
        let underlying = self.ledger.underlying_token(token).await?;
        let (underlying_address, underlying_decimals) = if underlying == Address::ZERO {
            (None, None)
        } else {
            let decimals = self.ledger.decimals(underlying).await?;
            (Some(format!("{underlying:#x}")), Some(i16::from(decimals)))
        };

        tracing::info!(
            token = %token,
            name = %name,
            symbol = %symbol,
            underlying = ?underlying_address,
            "Discovered token"
        );

        let record = Token {
            id: format!("{token:#x}"),
            name,
            symbol,
            underlying_address,
            underlying_decimals,
            created_at_block: event.meta.block_number as i64,
            created_at_tx: event.meta.transaction_hash.clone(),
        };
        let timestamp = self.timestamp_of(event, &mut HashMap::new()).await?;
        let at = EventPosition {
            id: event.id(),
            block_number: event.meta.block_number,
            timestamp,
        };
        let block = event.meta.block_number;
        Ok(self
            .state
            .register_token(record, &at)?
            .into_iter()
            .map(|change| (block, change))
            .collect())
    }

    async fn timestamp_of(&self, event: &DecodedEvent, cache: &mut HashMap<u64, u64>) -> Result<u64> {
        if let Some(ts) = event.meta.block_timestamp {
            return Ok(ts);
        }
        let block = event.meta.block_number;
        if let Some(ts) = cache.get(&block) {
            return Ok(*ts);
        }
        let ts = self.ledger.block_timestamp(block).await?;
        cache.insert(block, ts);
        Ok(ts)
    }

    /// Walk back from `from` to the last block whose stored hash matches the chain.
    async fn find_fork_point(&self, from: i64) -> Result<i64> {
        let mut fork_block = from - 2;
        while fork_block > 0 {
            let Some(stored) = storage::repos::get_block_hash(&self.pool, fork_block).await? else {
                break;
            };
            let chain_block = self
                .provider
                .get_block_by_number(alloy::eips::BlockNumberOrTag::Number(fork_block as u64))
                .await?
                .ok_or_else(|| eyre::eyre!("Block {} not found on chain during reorg detection", fork_block))?;
            if format!("{:#x}", chain_block.header.hash()) == stored {
                break;
            }
            fork_block -= 1;
        }
        Ok(fork_block)
    }

    /// Index the next batch of blocks. Returns `Ok(true)` if work was done, `Ok(false)` if caught up.
    async fn index_next_batch(&mut self, last_block: &mut i64) -> Result<bool> {
        let chain_head = self.provider.get_block_number().await? as i64;
        if *last_block >= chain_head {
            return Ok(false);
        }

        let from = *last_block + 1;
        let to = std::cmp::min(from + self.settings.batch_size as i64 - 1, chain_head);

        tracing::info!(from, to, head = chain_head, "Indexing batch");

        // ── Reorg Detection ────────────────────────────────────────────────
        if from > 1 {
            if let Some(stored_hash) = storage::repos::get_block_hash(&self.pool, from - 1).await? {
                let block = self
                    .provider
                    .get_block_by_number(alloy::eips::BlockNumberOrTag::Number(from as u64))
                    .await?
                    .ok_or_else(|| eyre::eyre!("Block {} not found on chain", from))?;
                let parent_hash = format!("{:#x}", block.header.parent_hash());
                if parent_hash != stored_hash {
                    tracing::warn!(block = from, expected = %stored_hash, got = %parent_hash, "Reorg detected! Rolling back…");
                    let fork_block = self.find_fork_point(from).await?;
                    tracing::warn!(fork_block, "Fork point found, rolling back to block");
                    storage::repos::reorg_rollback(&self.pool, fork_block).await?;
                    self.state = load_state(&self.pool).await?;
                    *last_block = fork_block;
                    return Ok(true);
                }
            }
        }

        let (from_u, to_u) = (from as u64, to as u64);

        // ── New tokens first, so their transfers in this batch are fetched ──
        let mut versions = Versions::new();
        for event in self
            .provider
            .get_logs(&self.factory_filter(from_u, to_u))
            .await?
            .iter()
            .filter_map(decode_log)
        {
            tracing::info!(token = %event.event.token(), "New token discovered mid-indexing");
            versions.extend(self.register_token(&event).await?);
        }

        // ── Agreement and token logs ───────────────────────────────────────
        let mut logs: Vec<Log> = Vec::new();
        let agreements = Filter::new()
            .address(vec![self.contracts.cfa, self.contracts.ida])
            .from_block(from_u)
            .to_block(to_u);
        logs.extend(self.provider.get_logs(&agreements).await?);

        let tokens = self.state.token_addresses();
        if !tokens.is_empty() {
            let transfers = Filter::new()
                .address(tokens)
                .event_signature(SuperToken::Transfer::SIGNATURE_HASH)
                .from_block(from_u)
                .to_block(to_u);
            logs.extend(self.provider.get_logs(&transfers).await?);
        }

        let mut events: Vec<DecodedEvent> = logs.iter().filter_map(decode_log).collect();
        events.sort_by_key(|e| (e.meta.block_number, e.meta.log_index));
        tracing::info!(count = events.len(), "Decoded ledger events");

        // ── Apply in log order ─────────────────────────────────────────────
        let mut timestamps = HashMap::new();
        let mut records = Vec::with_capacity(events.len());
        for event in &events {
            let timestamp = self.timestamp_of(event, &mut timestamps).await?;
            let changes = self.state.apply(event, timestamp)?;
            for change in changes {
                let change = self.with_ledger_balance(change, event.meta.block_number).await?;
                versions.push((event.meta.block_number, change));
            }
            records.push(IndexedEvent {
                id: event.id(),
                name: event.event.name().to_string(),
                transaction_hash: event.meta.transaction_hash.clone(),
                block_number: event.meta.block_number as i64,
                log_index: event.meta.log_index as i64,
                timestamp: timestamp as i64,
                token: format!("{:#x}", event.event.token()),
                properties: event.event.properties(),
            });
        }

        // ── Atomic write: events + entity versions + block + cursor ─────────
        let mut tx = self.pool.begin().await?;

        if !records.is_empty() {
            tracing::info!(count = records.len(), "Persisting events");
            storage::repos::insert_events_batch(&mut *tx, &records).await?;
        }

        persist(&mut *tx, &versions).await?;

        if let Some(block) = self
            .provider
            .get_block_by_number(alloy::eips::BlockNumberOrTag::Number(to_u))
            .await?
        {
            let indexed_block = IndexedBlock {
                block_number: to,
                block_hash: format!("{:#x}", block.header.hash()),
                parent_hash: format!("{:#x}", block.header.parent_hash()),
                timestamp: block.header.timestamp() as i64,
            };
            storage::repos::insert_block(&mut *tx, &indexed_block).await?;
        }

        storage::repos::set_last_indexed_block(&mut *tx, to).await?;
        tx.commit().await?;

        *last_block = to;

        tracing::info!(block = to, events = records.len(), versions = versions.len(), "Batch complete");

        Ok(true)
    }

    /// Snapshots are checkpointed at the ledger's own balance as of the event's block.
    async fn with_ledger_balance(&mut self, change: Change, block: u64) -> Result<Change> {
        let Change::Snapshot(snapshot) = change else {
            return Ok(change);
        };
        let balance: I256 = self
            .ledger
            .realtime_balance(snapshot.token_address()?, snapshot.account_address()?, block)
            .await?;
        Ok(Change::Snapshot(
            self.state.settle_balance(&snapshot.id, balance).unwrap_or(snapshot),
        ))
    }
}

/// Write every change as a new version at its block.
async fn persist(conn: &mut PgConnection, versions: &[(u64, Change)]) -> Result<()> {
    use storage::repos::upsert_entity_version as upsert;

    for (block, change) in versions {
        let block = *block as i64;
        match change {
            Change::Token(e) => upsert(conn, e, block).await?,
            Change::Stream(e) => upsert(conn, e, block).await?,
            Change::Period(e) => upsert(conn, e, block).await?,
            Change::Snapshot(e) => upsert(conn, e, block).await?,
            Change::Index(e) => upsert(conn, e, block).await?,
            Change::Subscription(e) => upsert(conn, e, block).await?,
            Change::Statistic(e) => upsert(conn, e, block).await?,
        }
    }
    Ok(())
}
