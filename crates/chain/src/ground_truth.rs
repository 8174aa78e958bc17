//! Point-in-time reads of ledger state.
//!
//! Every read takes the block it is pinned to, so a reconciliation pass can
//! compare indexed data against the ledger as of exactly one block.

use alloy::eips::{BlockId, BlockNumberOrTag};
use alloy::primitives::{Address, I256, U256};
use alloy::providers::Provider;
use async_trait::async_trait;
use flowlens_core::RetryPolicy;

use crate::abi::{ConstantFlowAgreement, ERC20, InstantDistributionAgreement, SuperToken};
use crate::error::ChainError;
use crate::provider::ChainProvider;

/// Result of `getFlow`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlowState {
    pub updated_at_timestamp: u64,
    pub flow_rate: i128,
}

/// Result of `getIndex`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexState {
    pub exists: bool,
    pub index_value: u128,
    pub total_units_approved: u128,
    pub total_units_pending: u128,
}

/// Result of `getSubscription`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionState {
    pub exists: bool,
    pub approved: bool,
    pub units: u128,
    pub pending_distribution: U256,
}

/// Authoritative ledger reads, pinned to a block.
#[async_trait]
pub trait GroundTruth: Send + Sync {
    async fn chain_id(&self) -> Result<u64, ChainError>;

    async fn block_timestamp(&self, block: u64) -> Result<u64, ChainError>;

    async fn flow(
        &self,
        token: Address,
        sender: Address,
        receiver: Address,
        block: u64,
    ) -> Result<FlowState, ChainError>;

    async fn net_flow(&self, token: Address, account: Address, block: u64) -> Result<i128, ChainError>;

    async fn index(
        &self,
        token: Address,
        publisher: Address,
        index_id: u32,
        block: u64,
    ) -> Result<IndexState, ChainError>;

    async fn subscription(
        &self,
        token: Address,
        publisher: Address,
        index_id: u32,
        subscriber: Address,
        block: u64,
    ) -> Result<SubscriptionState, ChainError>;

    /// Available balance of `account` at the block's timestamp.
    async fn realtime_balance(&self, token: Address, account: Address, block: u64) -> Result<I256, ChainError>;

    async fn total_supply(&self, token: Address, block: u64) -> Result<U256, ChainError>;

    /// Plain ERC-20 balance, used for the underlying asset held by a wrapper.
    async fn balance_of(&self, asset: Address, account: Address, block: u64) -> Result<U256, ChainError>;

    /// Zero for native or pure super tokens.
    async fn underlying_token(&self, token: Address) -> Result<Address, ChainError>;

    async fn decimals(&self, asset: Address) -> Result<u8, ChainError>;
}

/// Ground truth read over JSON-RPC from the agreement contracts.
#[derive(Clone)]
pub struct RpcGroundTruth {
    provider: ChainProvider,
    cfa: Address,
    ida: Address,
}

impl RpcGroundTruth {
    pub fn new(provider: ChainProvider, cfa: Address, ida: Address) -> Self {
        Self { provider, cfa, ida }
    }
}

fn at(block: u64) -> BlockId {
    BlockId::number(block)
}

fn narrow<T, S>(value: S, what: &str) -> Result<T, ChainError>
where
    T: TryFrom<S>,
{
    T::try_from(value).map_err(|_| ChainError::Conversion(what.to_string()))
}

#[async_trait]
impl GroundTruth for RpcGroundTruth {
    async fn chain_id(&self) -> Result<u64, ChainError> {
        self.provider
            .get_chain_id()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))
    }

    async fn block_timestamp(&self, block: u64) -> Result<u64, ChainError> {
        let header = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(block))
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?
            .ok_or_else(|| ChainError::Rpc(format!("block {block} not found")))?;
        Ok(header.header.timestamp)
    }

    async fn flow(
        &self,
        token: Address,
        sender: Address,
        receiver: Address,
        block: u64,
    ) -> Result<FlowState, ChainError> {
        let cfa = ConstantFlowAgreement::new(self.cfa, &self.provider);
        let ret = cfa
            .getFlow(token, sender, receiver)
            .block(at(block))
            .call()
            .await
            .map_err(|e| ChainError::contract("getFlow", e))?;
        Ok(FlowState {
            updated_at_timestamp: narrow(ret.timestamp, "getFlow.timestamp")?,
            flow_rate: narrow(ret.flowRate, "getFlow.flowRate")?,
        })
    }

    async fn net_flow(&self, token: Address, account: Address, block: u64) -> Result<i128, ChainError> {
        let cfa = ConstantFlowAgreement::new(self.cfa, &self.provider);
        let rate = cfa
            .getNetFlow(token, account)
            .block(at(block))
            .call()
            .await
            .map_err(|e| ChainError::contract("getNetFlow", e))?;
        narrow(rate, "getNetFlow.flowRate")
    }

    async fn index(
        &self,
        token: Address,
        publisher: Address,
        index_id: u32,
        block: u64,
    ) -> Result<IndexState, ChainError> {
        let ida = InstantDistributionAgreement::new(self.ida, &self.provider);
        let ret = ida
            .getIndex(token, publisher, index_id)
            .block(at(block))
            .call()
            .await
            .map_err(|e| ChainError::contract("getIndex", e))?;
        Ok(IndexState {
            exists: ret.exist,
            index_value: ret.indexValue,
            total_units_approved: ret.totalUnitsApproved,
            total_units_pending: ret.totalUnitsPending,
        })
    }

    async fn subscription(
        &self,
        token: Address,
        publisher: Address,
        index_id: u32,
        subscriber: Address,
        block: u64,
    ) -> Result<SubscriptionState, ChainError> {
        let ida = InstantDistributionAgreement::new(self.ida, &self.provider);
        let ret = ida
            .getSubscription(token, publisher, index_id, subscriber)
            .block(at(block))
            .call()
            .await
            .map_err(|e| ChainError::contract("getSubscription", e))?;
        Ok(SubscriptionState {
            exists: ret.exist,
            approved: ret.approved,
            units: ret.units,
            pending_distribution: ret.pendingDistribution,
        })
    }

    async fn realtime_balance(&self, token: Address, account: Address, block: u64) -> Result<I256, ChainError> {
        let contract = SuperToken::new(token, &self.provider);
        let ret = contract
            .realtimeBalanceOfNow(account)
            .block(at(block))
            .call()
            .await
            .map_err(|e| ChainError::contract("realtimeBalanceOfNow", e))?;
        Ok(ret.availableBalance)
    }

    async fn total_supply(&self, token: Address, block: u64) -> Result<U256, ChainError> {
        SuperToken::new(token, &self.provider)
            .totalSupply()
            .block(at(block))
            .call()
            .await
            .map_err(|e| ChainError::contract("totalSupply", e))
    }

    async fn balance_of(&self, asset: Address, account: Address, block: u64) -> Result<U256, ChainError> {
        ERC20::new(asset, &self.provider)
            .balanceOf(account)
            .block(at(block))
            .call()
            .await
            .map_err(|e| ChainError::contract("balanceOf", e))
    }

    async fn underlying_token(&self, token: Address) -> Result<Address, ChainError> {
        SuperToken::new(token, &self.provider)
            .getUnderlyingToken()
            .call()
            .await
            .map_err(|e| ChainError::contract("getUnderlyingToken", e))
    }

    async fn decimals(&self, asset: Address) -> Result<u8, ChainError> {
        ERC20::new(asset, &self.provider)
            .decimals()
            .call()
            .await
            .map_err(|e| ChainError::contract("decimals", e))
    }
}

/// Wraps a [`GroundTruth`] so every read is retried under a [`RetryPolicy`].
pub struct Retrying<G> {
    inner: G,
    policy: RetryPolicy,
}

impl<G> Retrying<G> {
    pub fn new(inner: G, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }
}

#[async_trait]
impl<G: GroundTruth> GroundTruth for Retrying<G> {
    async fn chain_id(&self) -> Result<u64, ChainError> {
        self.policy.run("chain_id", |_| self.inner.chain_id()).await
    }

    async fn block_timestamp(&self, block: u64) -> Result<u64, ChainError> {
        self.policy
            .run("block_timestamp", |_| self.inner.block_timestamp(block))
            .await
    }

    async fn flow(
        &self,
        token: Address,
        sender: Address,
        receiver: Address,
        block: u64,
    ) -> Result<FlowState, ChainError> {
        self.policy
            .run("getFlow", |_| self.inner.flow(token, sender, receiver, block))
            .await
    }

    async fn net_flow(&self, token: Address, account: Address, block: u64) -> Result<i128, ChainError> {
        self.policy
            .run("getNetFlow", |_| self.inner.net_flow(token, account, block))
            .await
    }

    async fn index(
        &self,
        token: Address,
        publisher: Address,
        index_id: u32,
        block: u64,
    ) -> Result<IndexState, ChainError> {
        self.policy
            .run("getIndex", |_| self.inner.index(token, publisher, index_id, block))
            .await
    }

    async fn subscription(
        &self,
        token: Address,
        publisher: Address,
        index_id: u32,
        subscriber: Address,
        block: u64,
    ) -> Result<SubscriptionState, ChainError> {
        self.policy
            .run("getSubscription", |_| {
                self.inner.subscription(token, publisher, index_id, subscriber, block)
            })
            .await
    }

    async fn realtime_balance(&self, token: Address, account: Address, block: u64) -> Result<I256, ChainError> {
        self.policy
            .run("realtimeBalanceOf", |_| self.inner.realtime_balance(token, account, block))
            .await
    }

    async fn total_supply(&self, token: Address, block: u64) -> Result<U256, ChainError> {
        self.policy
            .run("totalSupply", |_| self.inner.total_supply(token, block))
            .await
    }

    async fn balance_of(&self, asset: Address, account: Address, block: u64) -> Result<U256, ChainError> {
        self.policy
            .run("balanceOf", |_| self.inner.balance_of(asset, account, block))
            .await
    }

    async fn underlying_token(&self, token: Address) -> Result<Address, ChainError> {
        self.policy
            .run("getUnderlyingToken", |_| self.inner.underlying_token(token))
            .await
    }

    async fn decimals(&self, asset: Address) -> Result<u8, ChainError> {
        self.policy.run("decimals", |_| self.inner.decimals(asset)).await
    }
}
