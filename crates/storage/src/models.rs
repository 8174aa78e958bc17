use std::str::FromStr;

use alloy_primitives::{Address, I256, U256};
use flowlens_streams::{
    AccountCheckpoint, EventPosition, FlowEdge, FlowEdgeKey, StreamPeriod as TrackedPeriod, StreamPeriodId,
    SubscriptionPosition,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;

/// A stored field that does not parse back into its domain type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed {field}: {value:?}")]
pub struct ModelError {
    pub field: &'static str,
    pub value: String,
}

fn parse<T: FromStr>(field: &'static str, value: &str) -> Result<T, ModelError> {
    value.parse().map_err(|_| ModelError {
        field,
        value: value.to_string(),
    })
}

fn parse_signed(field: &'static str, value: &str) -> Result<I256, ModelError> {
    I256::from_dec_str(value).map_err(|_| ModelError {
        field,
        value: value.to_string(),
    })
}

fn narrow<T: TryFrom<i64>>(field: &'static str, value: i64) -> Result<T, ModelError> {
    T::try_from(value).map_err(|_| ModelError {
        field,
        value: value.to_string(),
    })
}

fn addr(a: &Address) -> String {
    format!("{a:#x}")
}

/// An entity kept in the versioned `entities` table.
///
/// Each write at block `b` closes the previous version at `b` and opens a new
/// one, so any past block can be read back.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {
    const KIND: &'static str;

    fn id(&self) -> &str;
}

// ─── Token ──────────────────────────────────────────────────────────────────

/// A super token discovered through the factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub id: String,
    pub name: String,
    pub symbol: String,
    /// `None` for pure super tokens.
    pub underlying_address: Option<String>,
    pub underlying_decimals: Option<i16>,
    pub created_at_block: i64,
    pub created_at_tx: String,
}

impl Entity for Token {
    const KIND: &'static str = "token";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Token {
    pub fn address(&self) -> Result<Address, ModelError> {
        parse("token.id", &self.id)
    }

    pub fn underlying(&self) -> Result<Option<Address>, ModelError> {
        self.underlying_address
            .as_deref()
            .map(|u| parse("token.underlyingAddress", u))
            .transpose()
    }
}

// ─── Stream ─────────────────────────────────────────────────────────────────

/// Current state of a flow edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stream {
    /// `sender-receiver-token`.
    pub id: String,
    pub token: String,
    pub sender: String,
    pub receiver: String,
    pub revision_index: i64,
    pub period_revision_index: i64,
    pub current_flow_rate: String,
    pub streamed_until_updated_at: String,
    pub created_at_timestamp: i64,
    pub updated_at_timestamp: i64,
    pub updated_at_block: i64,
    /// Stopped by a structural violation; later flow updates are not applied.
    #[serde(default)]
    pub halted: bool,
}

impl Entity for Stream {
    const KIND: &'static str = "stream";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Stream {
    pub fn from_edge(edge: &FlowEdge) -> Self {
        Self {
            id: edge.key.id(),
            token: addr(&edge.key.token),
            sender: addr(&edge.key.sender),
            receiver: addr(&edge.key.receiver),
            revision_index: edge.revision_index.into(),
            period_revision_index: edge.period_revision_index.into(),
            current_flow_rate: edge.flow_rate.to_string(),
            streamed_until_updated_at: edge.streamed_until_updated_at.to_string(),
            created_at_timestamp: edge.created_at_timestamp as i64,
            updated_at_timestamp: edge.updated_at_timestamp as i64,
            updated_at_block: edge.updated_at_block as i64,
            halted: false,
        }
    }

    pub fn key(&self) -> Result<FlowEdgeKey, ModelError> {
        Ok(FlowEdgeKey::new(
            parse("stream.token", &self.token)?,
            parse("stream.sender", &self.sender)?,
            parse("stream.receiver", &self.receiver)?,
        ))
    }

    pub fn flow_rate(&self) -> Result<i128, ModelError> {
        parse("stream.currentFlowRate", &self.current_flow_rate)
    }

    pub fn to_edge(&self) -> Result<FlowEdge, ModelError> {
        Ok(FlowEdge {
            key: self.key()?,
            flow_rate: self.flow_rate()?,
            revision_index: narrow("stream.revisionIndex", self.revision_index)?,
            period_revision_index: narrow("stream.periodRevisionIndex", self.period_revision_index)?,
            streamed_until_updated_at: parse_signed(
                "stream.streamedUntilUpdatedAt",
                &self.streamed_until_updated_at,
            )?,
            created_at_timestamp: narrow("stream.createdAtTimestamp", self.created_at_timestamp)?,
            updated_at_timestamp: narrow("stream.updatedAtTimestamp", self.updated_at_timestamp)?,
            updated_at_block: narrow("stream.updatedAtBlockNumber", self.updated_at_block)?,
        })
    }
}

// ─── Stream Period ──────────────────────────────────────────────────────────

/// A constant-rate interval of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamPeriod {
    /// `streamId-periodRevisionIndex`.
    pub id: String,
    pub stream_id: String,
    pub period_revision_index: i64,
    pub token: String,
    pub sender: String,
    pub receiver: String,
    pub flow_rate: String,
    pub started_at_timestamp: i64,
    pub started_at_block: i64,
    pub started_at_event: String,
    pub stopped_at_timestamp: Option<i64>,
    pub stopped_at_block: Option<i64>,
    pub stopped_at_event: Option<String>,
    pub total_amount_streamed: Option<String>,
}

impl Entity for StreamPeriod {
    const KIND: &'static str = "stream_period";

    fn id(&self) -> &str {
        &self.id
    }
}

impl StreamPeriod {
    pub fn from_period(period: &TrackedPeriod) -> Self {
        Self {
            id: period.id.to_string(),
            stream_id: period.id.stream_id.clone(),
            period_revision_index: period.id.period_revision_index.into(),
            token: addr(&period.edge.token),
            sender: addr(&period.edge.sender),
            receiver: addr(&period.edge.receiver),
            flow_rate: period.flow_rate.to_string(),
            started_at_timestamp: period.started_at.timestamp as i64,
            started_at_block: period.started_at.block_number as i64,
            started_at_event: period.started_at.id.clone(),
            stopped_at_timestamp: period.stopped_at.as_ref().map(|p| p.timestamp as i64),
            stopped_at_block: period.stopped_at.as_ref().map(|p| p.block_number as i64),
            stopped_at_event: period.stopped_at.as_ref().map(|p| p.id.clone()),
            total_amount_streamed: period.total_amount_streamed.map(|a| a.to_string()),
        }
    }

    pub fn is_open(&self) -> bool {
        self.stopped_at_timestamp.is_none()
    }

    pub fn to_period(&self) -> Result<TrackedPeriod, ModelError> {
        let stopped_at = match (self.stopped_at_timestamp, self.stopped_at_block, &self.stopped_at_event) {
            (Some(ts), Some(block), Some(event)) => Some(EventPosition {
                id: event.clone(),
                block_number: narrow("streamPeriod.stoppedAtBlockNumber", block)?,
                timestamp: narrow("streamPeriod.stoppedAtTimestamp", ts)?,
            }),
            (None, None, None) => None,
            _ => {
                return Err(ModelError {
                    field: "streamPeriod.stoppedAt",
                    value: format!("{:?}", self.stopped_at_timestamp),
                });
            }
        };
        Ok(TrackedPeriod {
            id: StreamPeriodId {
                stream_id: self.stream_id.clone(),
                period_revision_index: narrow("streamPeriod.periodRevisionIndex", self.period_revision_index)?,
            },
            edge: FlowEdgeKey::new(
                parse("streamPeriod.token", &self.token)?,
                parse("streamPeriod.sender", &self.sender)?,
                parse("streamPeriod.receiver", &self.receiver)?,
            ),
            flow_rate: parse("streamPeriod.flowRate", &self.flow_rate)?,
            started_at: EventPosition {
                id: self.started_at_event.clone(),
                block_number: narrow("streamPeriod.startedAtBlockNumber", self.started_at_block)?,
                timestamp: narrow("streamPeriod.startedAtTimestamp", self.started_at_timestamp)?,
            },
            stopped_at,
            total_amount_streamed: self
                .total_amount_streamed
                .as_deref()
                .map(|a| parse_signed("streamPeriod.totalAmountStreamed", a))
                .transpose()?,
        })
    }
}

// ─── Account Token Snapshot ─────────────────────────────────────────────────

/// Settled balance and flow totals of an `(account, token)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountTokenSnapshot {
    /// `account-token`.
    pub id: String,
    pub account: String,
    pub token: String,
    pub balance_until_updated_at: String,
    pub total_net_flow_rate: String,
    pub total_inflow_rate: String,
    pub total_outflow_rate: String,
    pub total_number_of_active_streams: i64,
    pub total_approved_subscriptions: i64,
    pub updated_at_timestamp: i64,
    pub updated_at_block: i64,
}

impl Entity for AccountTokenSnapshot {
    const KIND: &'static str = "account_token_snapshot";

    fn id(&self) -> &str {
        &self.id
    }
}

impl AccountTokenSnapshot {
    pub fn id_for(account: &Address, token: &Address) -> String {
        format!("{}-{}", addr(account), addr(token))
    }

    pub fn empty(account: &Address, token: &Address) -> Self {
        Self {
            id: Self::id_for(account, token),
            account: addr(account),
            token: addr(token),
            balance_until_updated_at: "0".into(),
            total_net_flow_rate: "0".into(),
            total_inflow_rate: "0".into(),
            total_outflow_rate: "0".into(),
            total_number_of_active_streams: 0,
            total_approved_subscriptions: 0,
            updated_at_timestamp: 0,
            updated_at_block: 0,
        }
    }

    pub fn account_address(&self) -> Result<Address, ModelError> {
        parse("accountTokenSnapshot.account", &self.account)
    }

    pub fn token_address(&self) -> Result<Address, ModelError> {
        parse("accountTokenSnapshot.token", &self.token)
    }

    pub fn net_flow_rate(&self) -> Result<i128, ModelError> {
        parse("accountTokenSnapshot.totalNetFlowRate", &self.total_net_flow_rate)
    }

    pub fn checkpoint(&self) -> Result<AccountCheckpoint, ModelError> {
        Ok(AccountCheckpoint {
            balance_until_updated_at: parse_signed(
                "accountTokenSnapshot.balanceUntilUpdatedAt",
                &self.balance_until_updated_at,
            )?,
            net_flow_rate: self.net_flow_rate()?,
            updated_at_timestamp: narrow("accountTokenSnapshot.updatedAtTimestamp", self.updated_at_timestamp)?,
        })
    }
}

// ─── Index ──────────────────────────────────────────────────────────────────

/// A publisher's distribution index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    /// `publisher-token-indexId`.
    pub id: String,
    pub token: String,
    pub publisher: String,
    pub index_id: i64,
    pub index_value: String,
    pub total_units_approved: String,
    pub total_units_pending: String,
    pub total_amount_distributed_until_updated_at: String,
    pub total_subscriptions_with_units: i64,
    pub created_at_timestamp: i64,
    pub updated_at_timestamp: i64,
    pub updated_at_block: i64,
}

impl Entity for Index {
    const KIND: &'static str = "index";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Index {
    pub fn id_for(publisher: &Address, token: &Address, index_id: u32) -> String {
        format!("{}-{}-{index_id}", addr(publisher), addr(token))
    }

    pub fn token_address(&self) -> Result<Address, ModelError> {
        parse("index.token", &self.token)
    }

    pub fn publisher_address(&self) -> Result<Address, ModelError> {
        parse("index.publisher", &self.publisher)
    }

    pub fn index_id_u32(&self) -> Result<u32, ModelError> {
        narrow("index.indexId", self.index_id)
    }

    pub fn value(&self) -> Result<u128, ModelError> {
        parse("index.indexValue", &self.index_value)
    }

    pub fn units_approved(&self) -> Result<u128, ModelError> {
        parse("index.totalUnitsApproved", &self.total_units_approved)
    }

    pub fn units_pending(&self) -> Result<u128, ModelError> {
        parse("index.totalUnitsPending", &self.total_units_pending)
    }

    pub fn total_distributed(&self) -> Result<U256, ModelError> {
        parse(
            "index.totalAmountDistributedUntilUpdatedAt",
            &self.total_amount_distributed_until_updated_at,
        )
    }
}

// ─── Index Subscription ─────────────────────────────────────────────────────

/// A subscriber's units in an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSubscription {
    /// `subscriber-publisher-token-indexId`.
    pub id: String,
    pub index: String,
    pub token: String,
    pub publisher: String,
    pub index_id: i64,
    pub subscriber: String,
    pub approved: bool,
    pub units: String,
    pub index_value_until_updated_at: String,
    pub total_amount_received_until_updated_at: String,
    pub updated_at_timestamp: i64,
    pub updated_at_block: i64,
}

impl Entity for IndexSubscription {
    const KIND: &'static str = "index_subscription";

    fn id(&self) -> &str {
        &self.id
    }
}

impl IndexSubscription {
    pub fn id_for(subscriber: &Address, publisher: &Address, token: &Address, index_id: u32) -> String {
        format!("{}-{}-{}-{index_id}", addr(subscriber), addr(publisher), addr(token))
    }

    pub fn subscriber_address(&self) -> Result<Address, ModelError> {
        parse("indexSubscription.subscriber", &self.subscriber)
    }

    pub fn publisher_address(&self) -> Result<Address, ModelError> {
        parse("indexSubscription.publisher", &self.publisher)
    }

    pub fn token_address(&self) -> Result<Address, ModelError> {
        parse("indexSubscription.token", &self.token)
    }

    pub fn index_id_u32(&self) -> Result<u32, ModelError> {
        narrow("indexSubscription.indexId", self.index_id)
    }

    pub fn position(&self) -> Result<SubscriptionPosition, ModelError> {
        Ok(SubscriptionPosition {
            approved: self.approved,
            units: parse("indexSubscription.units", &self.units)?,
            index_value_until_updated_at: parse(
                "indexSubscription.indexValueUntilUpdatedAt",
                &self.index_value_until_updated_at,
            )?,
        })
    }
}

// ─── Token Statistic ────────────────────────────────────────────────────────

/// Per-token aggregates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenStatistic {
    /// Token address.
    pub id: String,
    pub total_supply: String,
    pub total_outflow_rate: String,
    pub total_number_of_active_streams: i64,
    pub total_number_of_indexes: i64,
    pub total_amount_streamed_until_updated_at: String,
    pub total_amount_distributed_until_updated_at: String,
    pub total_units_approved: String,
    pub total_units_pending: String,
    pub updated_at_timestamp: i64,
    pub updated_at_block: i64,
}

impl Entity for TokenStatistic {
    const KIND: &'static str = "token_statistic";

    fn id(&self) -> &str {
        &self.id
    }
}

impl TokenStatistic {
    pub fn empty(token: &Address) -> Self {
        Self {
            id: addr(token),
            total_supply: "0".into(),
            total_outflow_rate: "0".into(),
            total_number_of_active_streams: 0,
            total_number_of_indexes: 0,
            total_amount_streamed_until_updated_at: "0".into(),
            total_amount_distributed_until_updated_at: "0".into(),
            total_units_approved: "0".into(),
            total_units_pending: "0".into(),
            updated_at_timestamp: 0,
            updated_at_block: 0,
        }
    }

    pub fn token_address(&self) -> Result<Address, ModelError> {
        parse("tokenStatistic.id", &self.id)
    }

    pub fn supply(&self) -> Result<U256, ModelError> {
        parse("tokenStatistic.totalSupply", &self.total_supply)
    }
}

// ─── Event ──────────────────────────────────────────────────────────────────

/// An immutable record of a decoded ledger event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct IndexedEvent {
    /// `txhash-logindex`.
    pub id: String,
    pub name: String,
    pub transaction_hash: String,
    pub block_number: i64,
    pub log_index: i64,
    pub timestamp: i64,
    pub token: String,
    pub properties: serde_json::Value,
}

// ─── IndexedBlock ───────────────────────────────────────────────────────────

/// A block that has been processed by the indexer.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct IndexedBlock {
    pub block_number: i64,
    pub block_hash: String,
    pub parent_hash: String,
    pub timestamp: i64,
}
