//! Per-entity comparisons against the ledger.

use std::collections::HashMap;

use alloy_primitives::{Address, I256, U256};
use flowlens_chain::GroundTruth;
use flowlens_storage::models::{
    AccountTokenSnapshot, Entity, Index, IndexSubscription, Stream, StreamPeriod, Token, TokenStatistic,
};
use flowlens_streams::{DistributionTotals, balance_at, streamed_amount};

use crate::error::CheckError;
use crate::report::Mismatch;
use crate::validator::{Contribution, EntityCheck};

/// Switches for checks that are off unless asked for.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckOptions {
    /// Indexed balance reconstruction must equal the ledger's realtime balance.
    pub check_realtime_balance: bool,
    /// Underlying assets must cover the sum of realtime balances.
    pub check_aum_covers_balances: bool,
}

// ─── Contributions ──────────────────────────────────────────────────────────

/// Open period ids per edge id.
#[derive(Debug, Default)]
pub struct OpenPeriods(pub HashMap<String, Vec<String>>);

impl Contribution for OpenPeriods {
    fn merge(&mut self, other: Self) {
        for (edge, ids) in other.0 {
            self.0.entry(edge).or_default().extend(ids);
        }
    }
}

/// Per-token sums over account snapshots.
#[derive(Debug, Default)]
pub struct SnapshotSums {
    pub net_flow: HashMap<String, I256>,
    /// Only filled when the AUM check is on.
    pub realtime_balances: HashMap<String, I256>,
}

impl Contribution for SnapshotSums {
    fn merge(&mut self, other: Self) {
        for (token, rate) in other.net_flow {
            let sum = self.net_flow.entry(token).or_default();
            *sum = sum.saturating_add(rate);
        }
        for (token, balance) in other.realtime_balances {
            let sum = self.realtime_balances.entry(token).or_default();
            *sum = sum.saturating_add(balance);
        }
    }
}

/// Subscription units per index id.
#[derive(Debug, Default)]
pub struct UnitSums(pub HashMap<String, U256>);

impl Contribution for UnitSums {
    fn merge(&mut self, other: Self) {
        for (index, units) in other.0 {
            let sum = self.0.entry(index).or_default();
            *sum = sum.saturating_add(units);
        }
    }
}

/// Supply figures for one token, from both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupplyObservation {
    pub token: String,
    pub indexed_supply: U256,
    pub ledger_supply: U256,
    /// Underlying held by the token contract, scaled to 18 decimals.
    pub assets_under_management: Option<U256>,
}

#[derive(Debug, Default)]
pub struct SupplyObservations(pub Vec<SupplyObservation>);

impl Contribution for SupplyObservations {
    fn merge(&mut self, other: Self) {
        self.0.extend(other.0);
    }
}

/// Scale an underlying amount with `decimals` to the 18 decimals of a super token.
pub fn scale_to_wad(amount: U256, decimals: u8) -> Option<U256> {
    let ten = U256::from(10u8);
    if decimals <= 18 {
        amount.checked_mul(ten.checked_pow(U256::from(18 - decimals))?)
    } else {
        Some(amount / ten.checked_pow(U256::from(decimals - 18))?)
    }
}

// ─── Checker ────────────────────────────────────────────────────────────────

/// Compares indexed entities with the ledger at one pinned block.
pub struct Checker<'g, G: ?Sized> {
    ground_truth: &'g G,
    pin: u64,
    pin_timestamp: u64,
    options: CheckOptions,
    index_values: HashMap<String, u128>,
    received: HashMap<String, U256>,
    /// Snapshots whose received distributions could not be accrued, with why.
    unaccrued: HashMap<String, String>,
    underlying: HashMap<String, (Address, u8)>,
}

impl<'g, G: GroundTruth + ?Sized> Checker<'g, G> {
    pub fn new(ground_truth: &'g G, pin: u64, pin_timestamp: u64, options: CheckOptions) -> Self {
        Self {
            ground_truth,
            pin,
            pin_timestamp,
            options,
            index_values: HashMap::new(),
            received: HashMap::new(),
            unaccrued: HashMap::new(),
            underlying: HashMap::new(),
        }
    }

    /// Remember indexed index values; subscriptions are checked against them.
    pub fn with_indexes(mut self, indexes: &[Index]) -> Self {
        for index in indexes {
            if let Ok(value) = index.value() {
                self.index_values.insert(index.id.clone(), value);
            }
        }
        self
    }

    /// Precompute distributions received per `(account, token)` since each
    /// subscription's checkpoint. Call after [`Self::with_indexes`].
    pub fn with_subscriptions(mut self, subscriptions: &[IndexSubscription]) -> Self {
        let mut positions: HashMap<String, Vec<_>> = HashMap::new();
        for sub in subscriptions {
            let (Ok(subscriber), Ok(token), Ok(position)) =
                (sub.subscriber_address(), sub.token_address(), sub.position())
            else {
                continue;
            };
            let Some(&value) = self.index_values.get(&sub.index) else {
                continue;
            };
            positions
                .entry(AccountTokenSnapshot::id_for(&subscriber, &token))
                .or_default()
                .push((position, value));
        }
        for (snapshot, subs) in positions {
            match DistributionTotals::accrue(subs.iter().map(|(p, v)| (p, *v))) {
                Ok(totals) => {
                    self.received.insert(snapshot, totals.received);
                }
                Err(err) => {
                    tracing::warn!(snapshot = %snapshot, error = %err, "Distributions received cannot be accrued");
                    self.unaccrued.insert(snapshot, err.to_string());
                }
            }
        }
        self
    }

    /// Remember each token's underlying asset and its decimals.
    pub fn with_tokens(mut self, tokens: &[Token]) -> Self {
        for token in tokens {
            if let (Ok(Some(underlying)), Some(decimals)) = (token.underlying(), token.underlying_decimals) {
                if let Ok(decimals) = u8::try_from(decimals) {
                    self.underlying.insert(token.id.clone(), (underlying, decimals));
                }
            }
        }
        self
    }

    /// `getFlow`: rate always, timestamp when the ledger has the flow running.
    pub async fn check_stream(&self, stream: &Stream) -> Result<EntityCheck<()>, CheckError> {
        let key = stream.key()?;
        let rate = stream.flow_rate()?;
        let truth = self
            .ground_truth
            .flow(key.token, key.sender, key.receiver, self.pin)
            .await?;

        let mut check = EntityCheck::new();
        check.compare(Stream::KIND, &stream.id, "currentFlowRate", truth.flow_rate, rate);
        if truth.flow_rate != 0 {
            check.compare(
                Stream::KIND,
                &stream.id,
                "updatedAtTimestamp",
                truth.updated_at_timestamp as i64,
                stream.updated_at_timestamp,
            );
        }
        Ok(check)
    }

    /// Closed periods must hold exactly `rate × duration`; open ones hold nothing yet.
    pub async fn check_period(&self, period: &StreamPeriod) -> Result<EntityCheck<OpenPeriods>, CheckError> {
        let tracked = period.to_period()?;
        let mut check = EntityCheck::<OpenPeriods>::new();

        match &tracked.stopped_at {
            None => {
                if let Some(total) = &period.total_amount_streamed {
                    check
                        .mismatches
                        .push(Mismatch::new(StreamPeriod::KIND, &period.id, "totalAmountStreamed", "null", total));
                }
                check
                    .contribution
                    .0
                    .entry(tracked.edge.id())
                    .or_default()
                    .push(period.id.clone());
            }
            Some(stopped) => {
                let expected = stopped
                    .timestamp
                    .checked_sub(tracked.started_at.timestamp)
                    .and_then(|elapsed| streamed_amount(tracked.flow_rate, elapsed));
                match (expected, tracked.total_amount_streamed) {
                    (Some(expected), Some(total)) => {
                        check.compare(StreamPeriod::KIND, &period.id, "totalAmountStreamed", expected, total)
                    }
                    (Some(expected), None) => check.mismatches.push(Mismatch::new(
                        StreamPeriod::KIND,
                        &period.id,
                        "totalAmountStreamed",
                        expected,
                        "null",
                    )),
                    (None, _) => check.mismatches.push(Mismatch::new(
                        StreamPeriod::KIND,
                        &period.id,
                        "stoppedAtTimestamp",
                        format!(">= {}", tracked.started_at.timestamp),
                        stopped.timestamp,
                    )),
                }
            }
        }
        Ok(check)
    }

    /// `getNetFlow`, plus the optional realtime-balance comparison.
    pub async fn check_snapshot(
        &self,
        snapshot: &AccountTokenSnapshot,
    ) -> Result<EntityCheck<SnapshotSums>, CheckError> {
        let account = snapshot.account_address()?;
        let token = snapshot.token_address()?;
        let rate = snapshot.net_flow_rate()?;

        let mut check = EntityCheck::<SnapshotSums>::new();
        check
            .contribution
            .net_flow
            .insert(snapshot.token.clone(), I256::try_from(rate).unwrap_or_default());

        let truth = match self.ground_truth.net_flow(token, account, self.pin).await {
            Ok(truth) => truth,
            Err(err) => return Ok(check.interrupt(err)),
        };
        check.compare(AccountTokenSnapshot::KIND, &snapshot.id, "totalNetFlowRate", truth, rate);

        if self.options.check_realtime_balance || self.options.check_aum_covers_balances {
            let realtime = match self.ground_truth.realtime_balance(token, account, self.pin).await {
                Ok(realtime) => realtime,
                Err(err) => return Ok(check.interrupt(err)),
            };

            if self.options.check_realtime_balance {
                self.compare_realtime_balance(snapshot, realtime, &mut check)?;
            }
            if self.options.check_aum_covers_balances {
                check
                    .contribution
                    .realtime_balances
                    .insert(snapshot.token.clone(), realtime);
            }
        }
        Ok(check)
    }

    fn compare_realtime_balance(
        &self,
        snapshot: &AccountTokenSnapshot,
        realtime: I256,
        check: &mut EntityCheck<SnapshotSums>,
    ) -> Result<(), CheckError> {
        let kind = AccountTokenSnapshot::KIND;
        if let Some(reason) = self.unaccrued.get(&snapshot.id) {
            check
                .mismatches
                .push(Mismatch::new(kind, &snapshot.id, "receivedSinceCheckpoint", "accruable", reason));
            return Ok(());
        }

        let received = self.received.get(&snapshot.id).copied().unwrap_or_default();
        match balance_at(&snapshot.checkpoint()?, self.pin_timestamp, received) {
            Ok(balance) => check.compare(kind, &snapshot.id, "realtimeBalance", realtime, balance),
            Err(err) => check.mismatches.push(Mismatch::new(
                kind,
                &snapshot.id,
                "updatedAtTimestamp",
                format!("<= {}", self.pin_timestamp),
                err,
            )),
        }
        Ok(())
    }

    /// `getIndex`.
    pub async fn check_index(&self, index: &Index) -> Result<EntityCheck<()>, CheckError> {
        let truth = self
            .ground_truth
            .index(
                index.token_address()?,
                index.publisher_address()?,
                index.index_id_u32()?,
                self.pin,
            )
            .await?;

        let mut check = EntityCheck::new();
        check.compare(Index::KIND, &index.id, "exists", true, truth.exists);
        if truth.exists {
            check.compare(Index::KIND, &index.id, "indexValue", truth.index_value, index.value()?);
            check.compare(
                Index::KIND,
                &index.id,
                "totalUnitsApproved",
                truth.total_units_approved,
                index.units_approved()?,
            );
            check.compare(
                Index::KIND,
                &index.id,
                "totalUnitsPending",
                truth.total_units_pending,
                index.units_pending()?,
            );
        }
        Ok(check)
    }

    /// `getSubscription`, with the pending distribution derived from the indexed index value.
    pub async fn check_subscription(
        &self,
        sub: &IndexSubscription,
    ) -> Result<EntityCheck<UnitSums>, CheckError> {
        let position = sub.position()?;
        let (token, publisher, index_id, subscriber) = (
            sub.token_address()?,
            sub.publisher_address()?,
            sub.index_id_u32()?,
            sub.subscriber_address()?,
        );

        let kind = IndexSubscription::KIND;
        let mut check = EntityCheck::<UnitSums>::new();
        check
            .contribution
            .0
            .insert(sub.index.clone(), U256::from(position.units));

        let truth = match self
            .ground_truth
            .subscription(token, publisher, index_id, subscriber, self.pin)
            .await
        {
            Ok(truth) => truth,
            Err(err) => return Ok(check.interrupt(err)),
        };

        check.compare(kind, &sub.id, "exists", true, truth.exists);
        if !truth.exists {
            return Ok(check);
        }
        check.compare(kind, &sub.id, "approved", truth.approved, position.approved);
        check.compare(kind, &sub.id, "units", truth.units, position.units);

        match self.index_values.get(&sub.index) {
            None => check.mismatches.push(Mismatch::new(kind, &sub.id, "index", &sub.index, "missing")),
            Some(&value) => match position.pending_distribution(value) {
                Ok(pending) => check.compare(kind, &sub.id, "pendingDistribution", truth.pending_distribution, pending),
                Err(err) => check.mismatches.push(Mismatch::new(
                    kind,
                    &sub.id,
                    "indexValueUntilUpdatedAt",
                    format!("<= {value}"),
                    err,
                )),
            },
        }
        Ok(check)
    }

    /// `totalSupply`, and the underlying held by the token for the supply invariant.
    pub async fn check_token_statistic(
        &self,
        stat: &TokenStatistic,
    ) -> Result<EntityCheck<SupplyObservations>, CheckError> {
        let token = stat.token_address()?;
        let indexed_supply = stat.supply()?;
        let ledger_supply = self.ground_truth.total_supply(token, self.pin).await?;

        let mut mismatches = Vec::new();
        let assets_under_management = match self.underlying.get(&stat.id) {
            Some(&(underlying, decimals)) => {
                let held = self.ground_truth.balance_of(underlying, token, self.pin).await?;
                let scaled = scale_to_wad(held, decimals);
                if scaled.is_none() {
                    mismatches.push(Mismatch::new(
                        TokenStatistic::KIND,
                        &stat.id,
                        "assetsUnderManagement",
                        "representable at 18 decimals",
                        format!("{held} at {decimals} decimals"),
                    ));
                }
                scaled
            }
            None => None,
        };

        let mut check = EntityCheck::with(SupplyObservations(vec![SupplyObservation {
            token: stat.id.clone(),
            indexed_supply,
            ledger_supply,
            assets_under_management,
        }]));
        check.mismatches = mismatches;
        check.compare(TokenStatistic::KIND, &stat.id, "totalSupply", ledger_supply, indexed_supply);
        Ok(check)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn six_decimal_underlying_scales_up() {
        assert_eq!(
            scale_to_wad(U256::from(1_500_000u64), 6),
            Some(U256::from(1_500_000_000_000_000_000u128))
        );
    }

    #[test]
    fn eighteen_decimals_are_unchanged() {
        assert_eq!(scale_to_wad(U256::from(42u8), 18), Some(U256::from(42u8)));
    }

    #[test]
    fn wider_underlying_scales_down() {
        assert_eq!(scale_to_wad(U256::from(1_000u64), 20), Some(U256::from(10u8)));
    }

    #[test]
    fn huge_underlying_does_not_fit() {
        assert_eq!(scale_to_wad(U256::MAX, 0), None);
    }

    #[test]
    fn unit_sums_add_per_index() {
        let mut sums = UnitSums::default();
        sums.merge(UnitSums(HashMap::from([("i".to_string(), U256::from(4u8))])));
        sums.merge(UnitSums(HashMap::from([("i".to_string(), U256::from(6u8))])));
        assert_eq!(sums.0["i"], U256::from(10u8));
    }
}
