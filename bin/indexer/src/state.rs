//! In-memory view of every entity the indexer maintains.
//!
//! Events are applied strictly in `(block, log index)` order. Each applied
//! event yields the entities it changed; the caller persists those as new
//! versions at the event's block.

use std::collections::HashMap;

use alloy::primitives::{Address, I256, U256};
use flowlens_chain::{DecodedEvent, LedgerEvent};
use flowlens_storage::models::{
    AccountTokenSnapshot, Index, IndexSubscription, ModelError, Stream, StreamPeriod, Token, TokenStatistic,
};
use flowlens_streams::{
    AccountingError, EventPosition, FlowActionType, FlowEdge, FlowEdgeKey, FlowUpdate, StreamPeriodTracker,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Accounting(#[from] AccountingError),
    #[error("{0} overflowed")]
    Overflow(&'static str),
}

/// An entity touched by one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Token(Token),
    Stream(Stream),
    Period(StreamPeriod),
    Snapshot(AccountTokenSnapshot),
    Index(Index),
    Subscription(IndexSubscription),
    Statistic(TokenStatistic),
}

/// Everything the indexer keeps current, rebuilt from storage on start and after a rollback.
#[derive(Debug, Default)]
pub struct IndexerState {
    tracker: StreamPeriodTracker,
    tokens: HashMap<String, Token>,
    snapshots: HashMap<String, AccountTokenSnapshot>,
    indexes: HashMap<String, Index>,
    subscriptions: HashMap<String, IndexSubscription>,
    stats: HashMap<String, TokenStatistic>,
}

impl IndexerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from the current version of each stored entity.
    pub fn restore(
        tokens: Vec<Token>,
        streams: Vec<Stream>,
        periods: Vec<StreamPeriod>,
        snapshots: Vec<AccountTokenSnapshot>,
        indexes: Vec<Index>,
        subscriptions: Vec<IndexSubscription>,
        stats: Vec<TokenStatistic>,
    ) -> Result<Self, StateError> {
        let edges = streams.iter().map(Stream::to_edge).collect::<Result<Vec<_>, _>>()?;
        let halted = streams
            .iter()
            .filter(|s| s.halted)
            .map(Stream::key)
            .collect::<Result<Vec<_>, _>>()?;
        let open = periods
            .iter()
            .filter(|p| p.is_open())
            .map(StreamPeriod::to_period)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            tracker: StreamPeriodTracker::restore(edges, open, halted),
            tokens: by_id(tokens, |t| t.id.clone()),
            snapshots: by_id(snapshots, |s| s.id.clone()),
            indexes: by_id(indexes, |i| i.id.clone()),
            subscriptions: by_id(subscriptions, |s| s.id.clone()),
            stats: by_id(stats, |s| s.id.clone()),
        })
    }

    pub fn is_known_token(&self, token: &Address) -> bool {
        self.tokens.contains_key(&format!("{token:#x}"))
    }

    pub fn token_addresses(&self) -> Vec<Address> {
        self.tokens.values().filter_map(|t| t.address().ok()).collect()
    }

    pub fn is_halted(&self, edge: &FlowEdgeKey) -> bool {
        self.tracker.is_halted(edge)
    }

    pub fn snapshot(&self, account: &Address, token: &Address) -> Option<&AccountTokenSnapshot> {
        self.snapshots.get(&AccountTokenSnapshot::id_for(account, token))
    }

    pub fn index(&self, publisher: &Address, token: &Address, index_id: u32) -> Option<&Index> {
        self.indexes.get(&Index::id_for(publisher, token, index_id))
    }

    pub fn subscription(
        &self,
        subscriber: &Address,
        publisher: &Address,
        token: &Address,
        index_id: u32,
    ) -> Option<&IndexSubscription> {
        self.subscriptions
            .get(&IndexSubscription::id_for(subscriber, publisher, token, index_id))
    }

    pub fn statistic(&self, token: &Address) -> Option<&TokenStatistic> {
        self.stats.get(&format!("{token:#x}"))
    }

    /// Register a newly discovered token. Returns the changes to persist,
    /// or nothing if the token was already known.
    pub fn register_token(&mut self, token: Token, at: &EventPosition) -> Result<Vec<Change>, StateError> {
        if self.tokens.contains_key(&token.id) {
            return Ok(Vec::new());
        }
        let address = token.address()?;
        self.tokens.insert(token.id.clone(), token.clone());

        let mut changes = vec![Change::Token(token)];
        if !self.stats.contains_key(&format!("{address:#x}")) {
            let stat = self.stat_mut(&address, at);
            changes.push(Change::Statistic(stat.clone()));
        }
        Ok(changes)
    }

    /// Overwrite a snapshot's settled balance with one read from the ledger.
    pub fn settle_balance(&mut self, snapshot_id: &str, balance: I256) -> Option<AccountTokenSnapshot> {
        let snapshot = self.snapshots.get_mut(snapshot_id)?;
        snapshot.balance_until_updated_at = balance.to_string();
        Some(snapshot.clone())
    }

    /// Apply one event.
    ///
    /// A structural flow violation halts only its edge; the one change it
    /// yields is that edge's stream, marked halted.
    pub fn apply(&mut self, event: &DecodedEvent, timestamp: u64) -> Result<Vec<Change>, StateError> {
        let at = EventPosition {
            id: event.id(),
            block_number: event.meta.block_number,
            timestamp,
        };

        let mut changes = Vec::new();
        let touched = match &event.event {
            LedgerEvent::SuperTokenCreated { .. }
            | LedgerEvent::SubscriptionApproved { .. }
            | LedgerEvent::SubscriptionRevoked { .. }
            | LedgerEvent::SubscriptionUnitsUpdated { .. }
            | LedgerEvent::SubscriptionDistributionClaimed { .. } => Vec::new(),
            LedgerEvent::Transfer { from, to, .. } => vec![*from, *to],
            LedgerEvent::Mint { token, to, amount } => {
                let stat = self.stat_mut(token, &at);
                stat.total_supply = add_u256(&stat.total_supply, *amount, "totalSupply")?;
                changes.push(Change::Statistic(stat.clone()));
                vec![*to]
            }
            LedgerEvent::Burn { token, from, amount } => {
                let stat = self.stat_mut(token, &at);
                let supply: U256 = parse(&stat.total_supply, "totalSupply")?;
                if supply < *amount {
                    tracing::warn!(token = %token, supply = %supply, burned = %amount, "Burn exceeds indexed supply");
                }
                stat.total_supply = supply.saturating_sub(*amount).to_string();
                changes.push(Change::Statistic(stat.clone()));
                vec![*from]
            }
            LedgerEvent::FlowUpdated {
                token,
                sender,
                receiver,
                flow_rate,
                total_sender_flow_rate,
                total_receiver_flow_rate,
                ..
            } => {
                let edge = FlowEdgeKey::new(*token, *sender, *receiver);
                let update = FlowUpdate {
                    edge,
                    flow_rate: *flow_rate,
                    at: at.clone(),
                };
                if !self.apply_flow(&update, *total_sender_flow_rate, *total_receiver_flow_rate, &mut changes)? {
                    return Ok(changes);
                }
                vec![*sender, *receiver]
            }
            LedgerEvent::IndexCreated {
                token,
                publisher,
                index_id,
                ..
            } => {
                let id = Index::id_for(publisher, token, *index_id);
                if !self.indexes.contains_key(&id) {
                    let index = self.index_mut(token, publisher, *index_id, &at);
                    changes.push(Change::Index(index.clone()));
                    let stat = self.stat_mut(token, &at);
                    stat.total_number_of_indexes += 1;
                    changes.push(Change::Statistic(stat.clone()));
                }
                vec![*publisher]
            }
            LedgerEvent::IndexUpdated {
                token,
                publisher,
                index_id,
                old_index_value,
                new_index_value,
                total_units_pending,
                total_units_approved,
                ..
            } => {
                let index = self.index_mut(token, publisher, *index_id, &at);
                let (prev_approved, prev_pending) = (index.units_approved()?, index.units_pending()?);
                let delta = new_index_value.checked_sub(*old_index_value).unwrap_or_default();
                let distributed = U256::from(delta)
                    .checked_mul(U256::from(*total_units_approved) + U256::from(*total_units_pending))
                    .ok_or(StateError::Overflow("distributed amount"))?;

                index.index_value = new_index_value.to_string();
                index.total_units_approved = total_units_approved.to_string();
                index.total_units_pending = total_units_pending.to_string();
                index.total_amount_distributed_until_updated_at = add_u256(
                    &index.total_amount_distributed_until_updated_at,
                    distributed,
                    "totalAmountDistributedUntilUpdatedAt",
                )?;
                changes.push(Change::Index(index.clone()));

                let stat = self.stat_mut(token, &at);
                stat.total_amount_distributed_until_updated_at = add_u256(
                    &stat.total_amount_distributed_until_updated_at,
                    distributed,
                    "totalAmountDistributedUntilUpdatedAt",
                )?;
                shift_units(stat, (prev_approved, *total_units_approved), (prev_pending, *total_units_pending))?;
                changes.push(Change::Statistic(stat.clone()));
                vec![*publisher]
            }
            LedgerEvent::IndexSubscribed {
                token,
                publisher,
                index_id,
                subscriber,
                ..
            } => {
                let mut sub = self.settled_subscription(token, publisher, *index_id, subscriber, &at)?;
                if !sub.approved {
                    sub.approved = true;
                    let units: u128 = parse(&sub.units, "units")?;
                    self.move_units(token, publisher, *index_id, (0, units), (units, 0), &at, &mut changes)?;
                    let snapshot = self.snapshot_mut(subscriber, token, &at);
                    snapshot.total_approved_subscriptions += 1;
                }
                changes.push(self.store_subscription(sub));
                vec![*subscriber]
            }
            LedgerEvent::IndexUnitsUpdated {
                token,
                publisher,
                index_id,
                subscriber,
                units,
                ..
            } => {
                let mut sub = self.settled_subscription(token, publisher, *index_id, subscriber, &at)?;
                let old: u128 = parse(&sub.units, "units")?;
                sub.units = units.to_string();
                let (approved, pending) = if sub.approved {
                    ((old, *units), (0, 0))
                } else {
                    ((0, 0), (old, *units))
                };
                self.move_units(token, publisher, *index_id, approved, pending, &at, &mut changes)?;

                let index = self.index_mut(token, publisher, *index_id, &at);
                match (old, *units) {
                    (0, n) if n > 0 => index.total_subscriptions_with_units += 1,
                    (o, 0) if o > 0 => index.total_subscriptions_with_units -= 1,
                    _ => {}
                }
                replace_change(&mut changes, Change::Index(index.clone()));
                changes.push(self.store_subscription(sub));
                vec![*subscriber]
            }
            LedgerEvent::IndexUnsubscribed {
                token,
                publisher,
                index_id,
                subscriber,
                ..
            } => {
                let mut sub = self.settled_subscription(token, publisher, *index_id, subscriber, &at)?;
                if sub.approved {
                    sub.approved = false;
                    let units: u128 = parse(&sub.units, "units")?;
                    self.move_units(token, publisher, *index_id, (units, 0), (0, units), &at, &mut changes)?;
                    let snapshot = self.snapshot_mut(subscriber, token, &at);
                    snapshot.total_approved_subscriptions -= 1;
                }
                changes.push(self.store_subscription(sub));
                vec![*subscriber]
            }
            LedgerEvent::IndexDistributionClaimed {
                token,
                publisher,
                index_id,
                subscriber,
                ..
            } => {
                let sub = self.settled_subscription(token, publisher, *index_id, subscriber, &at)?;
                changes.push(self.store_subscription(sub));
                vec![*subscriber]
            }
        };

        let token = event.event.token();
        for account in touched {
            if account == Address::ZERO {
                continue;
            }
            let snapshot = self.snapshot_mut(&account, &token, &at);
            replace_change(&mut changes, Change::Snapshot(snapshot.clone()));
        }
        Ok(changes)
    }

    /// Returns `false` when the tracker rejected the update.
    fn apply_flow(
        &mut self,
        update: &FlowUpdate,
        total_sender_flow_rate: i128,
        total_receiver_flow_rate: i128,
        changes: &mut Vec<Change>,
    ) -> Result<bool, StateError> {
        let key = update.edge;
        let (prev_rate, prev_streamed) = self
            .tracker
            .edge(&key)
            .map(|e| (e.flow_rate, e.streamed_until_updated_at))
            .unwrap_or((0, I256::ZERO));

        let was_halted = self.tracker.is_halted(&key);
        let transition = match self.tracker.apply(update) {
            Ok(transition) => transition,
            Err(err) => {
                tracing::warn!(edge = %key, event = %update.at.id, error = %err, "Flow update rejected");
                if !was_halted {
                    let mut stream = self
                        .tracker
                        .edge(&key)
                        .map(Stream::from_edge)
                        .unwrap_or_else(|| Stream::from_edge(&FlowEdge::new(key, &update.at)));
                    stream.halted = true;
                    changes.push(Change::Stream(stream));
                }
                return Ok(false);
            }
        };

        changes.push(Change::Stream(Stream::from_edge(&transition.edge)));
        if let Some(closed) = &transition.closed {
            changes.push(Change::Period(StreamPeriod::from_period(closed)));
        }
        if let Some(opened) = &transition.opened {
            changes.push(Change::Period(StreamPeriod::from_period(opened)));
        }

        let delta = update
            .flow_rate
            .checked_sub(prev_rate)
            .ok_or(StateError::Overflow("flow rate delta"))?;
        let streams_delta = match transition.action {
            FlowActionType::Create => 1,
            FlowActionType::Update => 0,
            FlowActionType::Terminate => -1,
        };

        let sender = self.snapshot_mut(&key.sender, &key.token, &update.at);
        sender.total_net_flow_rate = total_sender_flow_rate.to_string();
        sender.total_outflow_rate = add_i128(&sender.total_outflow_rate, delta, "totalOutflowRate")?;
        sender.total_number_of_active_streams += streams_delta;

        let receiver = self.snapshot_mut(&key.receiver, &key.token, &update.at);
        receiver.total_net_flow_rate = total_receiver_flow_rate.to_string();
        receiver.total_inflow_rate = add_i128(&receiver.total_inflow_rate, delta, "totalInflowRate")?;
        receiver.total_number_of_active_streams += streams_delta;

        let streamed = transition.edge.streamed_until_updated_at - prev_streamed;
        let stat = self.stat_mut(&key.token, &update.at);
        stat.total_outflow_rate = add_i128(&stat.total_outflow_rate, delta, "totalOutflowRate")?;
        stat.total_number_of_active_streams += streams_delta;
        let total: I256 = I256::from_dec_str(&stat.total_amount_streamed_until_updated_at).map_err(|_| {
            ModelError {
                field: "tokenStatistic.totalAmountStreamedUntilUpdatedAt",
                value: stat.total_amount_streamed_until_updated_at.clone(),
            }
        })?;
        stat.total_amount_streamed_until_updated_at = total
            .checked_add(streamed)
            .ok_or(StateError::Overflow("totalAmountStreamedUntilUpdatedAt"))?
            .to_string();
        changes.push(Change::Statistic(stat.clone()));
        Ok(true)
    }

    /// Settle a subscription against its index's current value, creating it if unseen.
    ///
    /// The settled amount counts as received whether or not the subscription is approved.
    fn settled_subscription(
        &mut self,
        token: &Address,
        publisher: &Address,
        index_id: u32,
        subscriber: &Address,
        at: &EventPosition,
    ) -> Result<IndexSubscription, StateError> {
        let index_value = self
            .indexes
            .get(&Index::id_for(publisher, token, index_id))
            .map(Index::value)
            .transpose()?
            .unwrap_or_default();
        let id = IndexSubscription::id_for(subscriber, publisher, token, index_id);
        let mut sub = self.subscriptions.get(&id).cloned().unwrap_or_else(|| IndexSubscription {
            id,
            index: Index::id_for(publisher, token, index_id),
            token: format!("{token:#x}"),
            publisher: format!("{publisher:#x}"),
            index_id: index_id.into(),
            subscriber: format!("{subscriber:#x}"),
            approved: false,
            units: "0".into(),
            index_value_until_updated_at: index_value.to_string(),
            total_amount_received_until_updated_at: "0".into(),
            updated_at_timestamp: 0,
            updated_at_block: 0,
        });

        let accrued = sub.position()?.distributed_since(index_value)?;
        sub.total_amount_received_until_updated_at = add_u256(
            &sub.total_amount_received_until_updated_at,
            accrued,
            "totalAmountReceivedUntilUpdatedAt",
        )?;
        sub.index_value_until_updated_at = index_value.to_string();
        sub.updated_at_timestamp = at.timestamp as i64;
        sub.updated_at_block = at.block_number as i64;
        Ok(sub)
    }

    fn store_subscription(&mut self, sub: IndexSubscription) -> Change {
        self.subscriptions.insert(sub.id.clone(), sub.clone());
        Change::Subscription(sub)
    }

    /// Move units between an index's approved and pending totals, mirrored on the token statistic.
    #[allow(clippy::too_many_arguments)]
    fn move_units(
        &mut self,
        token: &Address,
        publisher: &Address,
        index_id: u32,
        approved: (u128, u128),
        pending: (u128, u128),
        at: &EventPosition,
        changes: &mut Vec<Change>,
    ) -> Result<(), StateError> {
        let index = self.index_mut(token, publisher, index_id, at);
        index.total_units_approved = swap_u128(&index.total_units_approved, approved, "totalUnitsApproved")?;
        index.total_units_pending = swap_u128(&index.total_units_pending, pending, "totalUnitsPending")?;
        replace_change(changes, Change::Index(index.clone()));

        let stat = self.stat_mut(token, at);
        shift_units(stat, approved, pending)?;
        replace_change(changes, Change::Statistic(stat.clone()));
        Ok(())
    }

    fn snapshot_mut(&mut self, account: &Address, token: &Address, at: &EventPosition) -> &mut AccountTokenSnapshot {
        let snapshot = self
            .snapshots
            .entry(AccountTokenSnapshot::id_for(account, token))
            .or_insert_with(|| AccountTokenSnapshot::empty(account, token));
        snapshot.updated_at_timestamp = at.timestamp as i64;
        snapshot.updated_at_block = at.block_number as i64;
        snapshot
    }

    fn index_mut(&mut self, token: &Address, publisher: &Address, index_id: u32, at: &EventPosition) -> &mut Index {
        let index = self
            .indexes
            .entry(Index::id_for(publisher, token, index_id))
            .or_insert_with(|| Index {
                id: Index::id_for(publisher, token, index_id),
                token: format!("{token:#x}"),
                publisher: format!("{publisher:#x}"),
                index_id: index_id.into(),
                index_value: "0".into(),
                total_units_approved: "0".into(),
                total_units_pending: "0".into(),
                total_amount_distributed_until_updated_at: "0".into(),
                total_subscriptions_with_units: 0,
                created_at_timestamp: at.timestamp as i64,
                updated_at_timestamp: at.timestamp as i64,
                updated_at_block: at.block_number as i64,
            });
        index.updated_at_timestamp = at.timestamp as i64;
        index.updated_at_block = at.block_number as i64;
        index
    }

    fn stat_mut(&mut self, token: &Address, at: &EventPosition) -> &mut TokenStatistic {
        let stat = self
            .stats
            .entry(format!("{token:#x}"))
            .or_insert_with(|| TokenStatistic::empty(token));
        stat.updated_at_timestamp = at.timestamp as i64;
        stat.updated_at_block = at.block_number as i64;
        stat
    }
}

fn by_id<T>(items: Vec<T>, id: impl Fn(&T) -> String) -> HashMap<String, T> {
    items.into_iter().map(|item| (id(&item), item)).collect()
}

/// Keep only the latest version of an entity within one event's changes.
fn replace_change(changes: &mut Vec<Change>, change: Change) {
    let same = |c: &Change| match (c, &change) {
        (Change::Index(a), Change::Index(b)) => a.id == b.id,
        (Change::Statistic(a), Change::Statistic(b)) => a.id == b.id,
        (Change::Snapshot(a), Change::Snapshot(b)) => a.id == b.id,
        _ => false,
    };
    match changes.iter().position(|c| same(c)) {
        Some(pos) => changes[pos] = change,
        None => changes.push(change),
    }
}

fn parse<T: std::str::FromStr>(value: &str, field: &'static str) -> Result<T, StateError> {
    value.parse().map_err(|_| {
        StateError::Model(ModelError {
            field,
            value: value.to_string(),
        })
    })
}

fn add_u256(value: &str, amount: U256, field: &'static str) -> Result<String, StateError> {
    let current: U256 = parse(value, field)?;
    Ok(current
        .checked_add(amount)
        .ok_or(StateError::Overflow(field))?
        .to_string())
}

fn add_i128(value: &str, delta: i128, field: &'static str) -> Result<String, StateError> {
    let current: i128 = parse(value, field)?;
    Ok(current
        .checked_add(delta)
        .ok_or(StateError::Overflow(field))?
        .to_string())
}

/// `value - old + new` on a unit total.
fn swap_u128(value: &str, (old, new): (u128, u128), field: &'static str) -> Result<String, StateError> {
    let current: u128 = parse(value, field)?;
    Ok(current
        .checked_sub(old)
        .and_then(|v| v.checked_add(new))
        .ok_or(StateError::Overflow(field))?
        .to_string())
}

fn shift_units(stat: &mut TokenStatistic, approved: (u128, u128), pending: (u128, u128)) -> Result<(), StateError> {
    let swap = |value: &str, (old, new): (u128, u128), field| -> Result<String, StateError> {
        let current: U256 = parse(value, field)?;
        Ok(current
            .checked_sub(U256::from(old))
            .and_then(|v| v.checked_add(U256::from(new)))
            .ok_or(StateError::Overflow(field))?
            .to_string())
    };
    stat.total_units_approved = swap(&stat.total_units_approved, approved, "totalUnitsApproved")?;
    stat.total_units_pending = swap(&stat.total_units_pending, pending, "totalUnitsPending")?;
    Ok(())
}
