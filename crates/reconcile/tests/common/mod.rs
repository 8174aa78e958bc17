#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use alloy_primitives::{Address, I256, U256, address};
use async_trait::async_trait;
use flowlens_chain::{ChainError, FlowState, GroundTruth, IndexState, SubscriptionState};
use flowlens_reconcile::{IndexedSource, SourceError};
use flowlens_storage::models::{
    AccountTokenSnapshot, Entity, Index, IndexSubscription, IndexedEvent, Stream, StreamPeriod, Token,
    TokenStatistic,
};
use flowlens_streams::{
    EventPosition, FlowEdge, FlowEdgeKey, StreamPeriod as TrackedPeriod, StreamPeriodId,
};

pub const TOKEN: Address = address!("00000000000000000000000000000000000000aa");
pub const UNDERLYING: Address = address!("00000000000000000000000000000000000000dd");
pub const ALICE: Address = address!("00000000000000000000000000000000000000a1");
pub const BOB: Address = address!("00000000000000000000000000000000000000b0");
pub const CAROL: Address = address!("00000000000000000000000000000000000000c0");

pub const PIN: u64 = 50;
pub const PIN_TIMESTAMP: u64 = 2_000;

// ─── Indexed side ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemorySource {
    pub entities: HashMap<&'static str, Vec<serde_json::Value>>,
    pub events: Vec<IndexedEvent>,
    pub latest: u64,
    pub failing_kind: Option<&'static str>,
    /// Repeat the previous page's last entity at the start of each page.
    pub overlap: bool,
    /// Most rows one page returns, whatever the requested limit.
    pub page_cap: Option<usize>,
    pub calls: Mutex<Vec<(String, u64)>>,
}

impl MemorySource {
    pub fn insert<E: Entity>(&mut self, entity: &E) {
        self.entities
            .entry(E::KIND)
            .or_default()
            .push(serde_json::to_value(entity).unwrap());
    }

    pub fn remove<E: Entity>(&mut self, id: &str) {
        if let Some(rows) = self.entities.get_mut(E::KIND) {
            rows.retain(|v| v["id"] != id);
        }
    }

    pub fn replace<E: Entity>(&mut self, entity: &E) {
        self.remove::<E>(entity.id());
        self.insert(entity);
    }

    pub fn pages_fetched(&self, kind: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|(k, _)| k == kind).count()
    }

    pub fn pins(&self) -> HashSet<u64> {
        self.calls.lock().unwrap().iter().map(|(_, pin)| *pin).collect()
    }
}

#[async_trait]
impl IndexedSource for MemorySource {
    async fn latest_block(&self) -> Result<u64, SourceError> {
        Ok(self.latest)
    }

    async fn fetch_page<E: Entity>(
        &self,
        pin: u64,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<E>, SourceError> {
        if self.failing_kind == Some(E::KIND) {
            return Err(SourceError::Query("connection refused".into()));
        }
        self.calls.lock().unwrap().push((E::KIND.to_string(), pin));

        let mut all: Vec<E> = self
            .entities
            .get(E::KIND)
            .into_iter()
            .flatten()
            .map(|v| serde_json::from_value(v.clone()).unwrap())
            .collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));

        Ok(all
            .into_iter()
            .filter(|e| match after {
                None => true,
                Some(a) if self.overlap => e.id() >= a,
                Some(a) => e.id() > a,
            })
            .take(self.page_cap.map_or(limit, |cap| cap.min(limit)))
            .collect())
    }

    async fn event_by_transaction(
        &self,
        transaction_hash: &str,
        name: &str,
        pin: u64,
    ) -> Result<Option<IndexedEvent>, SourceError> {
        Ok(self
            .events
            .iter()
            .filter(|e| e.transaction_hash == transaction_hash && e.name == name)
            .filter(|e| e.block_number as u64 <= pin)
            .min_by_key(|e| e.log_index)
            .cloned())
    }
}

// ─── Ledger side ────────────────────────────────────────────────────────────

pub struct MemoryLedger {
    pub chain_id: u64,
    pub timestamps: HashMap<u64, u64>,
    pub flows: HashMap<(Address, Address, Address), FlowState>,
    pub net_flows: HashMap<(Address, Address), i128>,
    pub indexes: HashMap<(Address, Address, u32), IndexState>,
    pub subscriptions: HashMap<(Address, Address, u32, Address), SubscriptionState>,
    pub supplies: HashMap<Address, U256>,
    pub balances: HashMap<(Address, Address), U256>,
    pub realtime: HashMap<(Address, Address), I256>,
    /// `(sender, receiver)` pairs whose `getFlow` always fails.
    pub unreachable_flows: HashSet<(Address, Address)>,
    /// Accounts whose `getNetFlow` always fails.
    pub unreachable_net_flows: HashSet<Address>,
    /// Subscribers whose `getSubscription` always fails.
    pub unreachable_subscriptions: HashSet<Address>,
    pub pins: Mutex<HashSet<u64>>,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self {
            chain_id: 137,
            timestamps: HashMap::new(),
            flows: HashMap::new(),
            net_flows: HashMap::new(),
            indexes: HashMap::new(),
            subscriptions: HashMap::new(),
            supplies: HashMap::new(),
            balances: HashMap::new(),
            realtime: HashMap::new(),
            unreachable_flows: HashSet::new(),
            unreachable_net_flows: HashSet::new(),
            unreachable_subscriptions: HashSet::new(),
            pins: Mutex::new(HashSet::new()),
        }
    }
}

impl MemoryLedger {
    fn seen(&self, block: u64) {
        self.pins.lock().unwrap().insert(block);
    }
}

#[async_trait]
impl GroundTruth for MemoryLedger {
    async fn chain_id(&self) -> Result<u64, ChainError> {
        Ok(self.chain_id)
    }

    async fn block_timestamp(&self, block: u64) -> Result<u64, ChainError> {
        self.timestamps
            .get(&block)
            .copied()
            .ok_or_else(|| ChainError::Rpc(format!("block {block} not found")))
    }

    async fn flow(
        &self,
        token: Address,
        sender: Address,
        receiver: Address,
        block: u64,
    ) -> Result<FlowState, ChainError> {
        self.seen(block);
        if self.unreachable_flows.contains(&(sender, receiver)) {
            return Err(ChainError::Rpc("request timed out".into()));
        }
        Ok(self.flows.get(&(token, sender, receiver)).copied().unwrap_or_default())
    }

    async fn net_flow(&self, token: Address, account: Address, block: u64) -> Result<i128, ChainError> {
        self.seen(block);
        if self.unreachable_net_flows.contains(&account) {
            return Err(ChainError::Rpc("request timed out".into()));
        }
        Ok(self.net_flows.get(&(token, account)).copied().unwrap_or_default())
    }

    async fn index(
        &self,
        token: Address,
        publisher: Address,
        index_id: u32,
        block: u64,
    ) -> Result<IndexState, ChainError> {
        self.seen(block);
        Ok(self.indexes.get(&(token, publisher, index_id)).copied().unwrap_or_default())
    }

    async fn subscription(
        &self,
        token: Address,
        publisher: Address,
        index_id: u32,
        subscriber: Address,
        block: u64,
    ) -> Result<SubscriptionState, ChainError> {
        self.seen(block);
        if self.unreachable_subscriptions.contains(&subscriber) {
            return Err(ChainError::Rpc("request timed out".into()));
        }
        Ok(self
            .subscriptions
            .get(&(token, publisher, index_id, subscriber))
            .copied()
            .unwrap_or_default())
    }

    async fn realtime_balance(&self, token: Address, account: Address, block: u64) -> Result<I256, ChainError> {
        self.seen(block);
        Ok(self.realtime.get(&(token, account)).copied().unwrap_or_default())
    }

    async fn total_supply(&self, token: Address, block: u64) -> Result<U256, ChainError> {
        self.seen(block);
        Ok(self.supplies.get(&token).copied().unwrap_or_default())
    }

    async fn balance_of(&self, asset: Address, account: Address, block: u64) -> Result<U256, ChainError> {
        self.seen(block);
        Ok(self.balances.get(&(asset, account)).copied().unwrap_or_default())
    }

    async fn underlying_token(&self, _token: Address) -> Result<Address, ChainError> {
        Ok(UNDERLYING)
    }

    async fn decimals(&self, _asset: Address) -> Result<u8, ChainError> {
        Ok(6)
    }
}

// ─── A consistent world ─────────────────────────────────────────────────────

fn addr(a: Address) -> String {
    format!("{a:#x}")
}

fn at(id: &str, block: u64, timestamp: u64) -> EventPosition {
    EventPosition {
        id: id.into(),
        block_number: block,
        timestamp,
    }
}

pub fn alice_to_bob() -> FlowEdgeKey {
    FlowEdgeKey::new(TOKEN, ALICE, BOB)
}

pub fn carol_to_bob() -> FlowEdgeKey {
    FlowEdgeKey::new(TOKEN, CAROL, BOB)
}

pub fn alice_to_bob_stream() -> Stream {
    Stream::from_edge(&FlowEdge {
        key: alice_to_bob(),
        flow_rate: 100,
        revision_index: 0,
        period_revision_index: 0,
        streamed_until_updated_at: I256::ZERO,
        created_at_timestamp: 1_000,
        updated_at_timestamp: 1_000,
        updated_at_block: 10,
    })
}

pub fn snapshot(account: Address, balance: i64, net_flow: i128) -> AccountTokenSnapshot {
    let mut s = AccountTokenSnapshot::empty(&account, &TOKEN);
    s.balance_until_updated_at = balance.to_string();
    s.total_net_flow_rate = net_flow.to_string();
    s.updated_at_timestamp = 1_000;
    s.updated_at_block = 10;
    s
}

pub fn index_id() -> String {
    Index::id_for(&ALICE, &TOKEN, 0)
}

pub fn subscription(subscriber: Address, approved: bool, units: u128, checkpoint: u128) -> IndexSubscription {
    IndexSubscription {
        id: IndexSubscription::id_for(&subscriber, &ALICE, &TOKEN, 0),
        index: index_id(),
        token: addr(TOKEN),
        publisher: addr(ALICE),
        index_id: 0,
        subscriber: addr(subscriber),
        approved,
        units: units.to_string(),
        index_value_until_updated_at: checkpoint.to_string(),
        total_amount_received_until_updated_at: "0".into(),
        updated_at_timestamp: 1_000,
        updated_at_block: 10,
    }
}

/// Alice streams 100/s to Bob; Carol streamed to Bob for an hour and stopped.
/// Alice publishes an index with Bob approved (10 units) and Carol pending (4 units).
/// The token wraps a 6-decimal underlying, fully backed.
pub fn consistent_world() -> (MemoryLedger, MemorySource) {
    let mut ledger = MemoryLedger::default();
    let mut source = MemorySource {
        latest: PIN,
        ..Default::default()
    };
    ledger.timestamps.insert(PIN, PIN_TIMESTAMP);

    source.insert(&Token {
        id: addr(TOKEN),
        name: "Super Dollar".into(),
        symbol: "USDx".into(),
        underlying_address: Some(addr(UNDERLYING)),
        underlying_decimals: Some(6),
        created_at_block: 1,
        created_at_tx: "0x01".into(),
    });

    // Streams
    source.insert(&alice_to_bob_stream());
    ledger.flows.insert(
        (TOKEN, ALICE, BOB),
        FlowState {
            updated_at_timestamp: 1_000,
            flow_rate: 100,
        },
    );
    source.insert(&Stream::from_edge(&FlowEdge {
        key: carol_to_bob(),
        flow_rate: 0,
        revision_index: 1,
        period_revision_index: 1,
        streamed_until_updated_at: I256::try_from(360_000i64).unwrap(),
        created_at_timestamp: 0,
        updated_at_timestamp: 3_600,
        updated_at_block: 8,
    }));

    source.insert(&StreamPeriod::from_period(&TrackedPeriod {
        id: StreamPeriodId {
            stream_id: alice_to_bob().stream_id(0),
            period_revision_index: 0,
        },
        edge: alice_to_bob(),
        flow_rate: 100,
        started_at: at("0x0a-0", 10, 1_000),
        stopped_at: None,
        total_amount_streamed: None,
    }));
    source.insert(&StreamPeriod::from_period(&TrackedPeriod {
        id: StreamPeriodId {
            stream_id: carol_to_bob().stream_id(0),
            period_revision_index: 0,
        },
        edge: carol_to_bob(),
        flow_rate: 100,
        started_at: at("0x01-0", 2, 0),
        stopped_at: Some(at("0x08-0", 8, 3_600)),
        total_amount_streamed: Some(I256::try_from(360_000i64).unwrap()),
    }));

    // Snapshots
    for (account, balance, net) in [(ALICE, 1_000_000i64, -100i128), (BOB, 0, 100), (CAROL, 0, 0)] {
        source.insert(&snapshot(account, balance, net));
        ledger.net_flows.insert((TOKEN, account), net);
    }

    // Index and subscriptions
    source.insert(&Index {
        id: index_id(),
        token: addr(TOKEN),
        publisher: addr(ALICE),
        index_id: 0,
        index_value: "8".into(),
        total_units_approved: "10".into(),
        total_units_pending: "4".into(),
        total_amount_distributed_until_updated_at: "112".into(),
        total_subscriptions_with_units: 2,
        created_at_timestamp: 500,
        updated_at_timestamp: 1_000,
        updated_at_block: 10,
    });
    ledger.indexes.insert(
        (TOKEN, ALICE, 0),
        IndexState {
            exists: true,
            index_value: 8,
            total_units_approved: 10,
            total_units_pending: 4,
        },
    );
    source.insert(&subscription(BOB, true, 10, 8));
    ledger.subscriptions.insert(
        (TOKEN, ALICE, 0, BOB),
        SubscriptionState {
            exists: true,
            approved: true,
            units: 10,
            pending_distribution: U256::ZERO,
        },
    );
    source.insert(&subscription(CAROL, false, 4, 5));
    ledger.subscriptions.insert(
        (TOKEN, ALICE, 0, CAROL),
        SubscriptionState {
            exists: true,
            approved: false,
            units: 4,
            pending_distribution: U256::from(12u8),
        },
    );

    // Supply: 5 tokens, backed by 5_000_000 units of a 6-decimal asset.
    let supply = U256::from(5_000_000_000_000_000_000u128);
    let mut stat = TokenStatistic::empty(&TOKEN);
    stat.total_supply = supply.to_string();
    source.insert(&stat);
    ledger.supplies.insert(TOKEN, supply);
    ledger.balances.insert((UNDERLYING, TOKEN), U256::from(5_000_000u64));

    // Realtime balances at PIN_TIMESTAMP, only read when the balance checks are on.
    ledger.realtime.insert((TOKEN, ALICE), I256::try_from(900_000i64).unwrap());
    ledger.realtime.insert((TOKEN, BOB), I256::try_from(100_000i64).unwrap());
    ledger.realtime.insert((TOKEN, CAROL), I256::ZERO);

    (ledger, source)
}
