//! Pro-rata accrual from distribution indexes.

use alloy_primitives::U256;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccountingError {
    #[error("subscription checkpoint {checkpoint} is ahead of index value {current}")]
    CheckpointAhead { checkpoint: u128, current: u128 },
    #[error("balance requested at {at}, before the checkpoint at {checkpoint}")]
    BeforeCheckpoint { at: u64, checkpoint: u64 },
    #[error("balance arithmetic overflowed")]
    Overflow,
}

/// A subscriber's standing against one index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionPosition {
    pub approved: bool,
    pub units: u128,
    /// Index value at the subscription's last settlement.
    pub index_value_until_updated_at: u128,
}

impl SubscriptionPosition {
    /// `(current_index_value - checkpoint) * units`.
    pub fn distributed_since(&self, current_index_value: u128) -> Result<U256, AccountingError> {
        let delta = current_index_value
            .checked_sub(self.index_value_until_updated_at)
            .ok_or(AccountingError::CheckpointAhead {
                checkpoint: self.index_value_until_updated_at,
                current: current_index_value,
            })?;
        Ok(U256::from(delta) * U256::from(self.units))
    }

    /// What the ledger holds back for this subscriber: nothing once approved.
    pub fn pending_distribution(&self, current_index_value: u128) -> Result<U256, AccountingError> {
        if self.approved {
            Ok(U256::ZERO)
        } else {
            self.distributed_since(current_index_value)
        }
    }
}

/// Accrual across a set of subscriptions since their checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DistributionTotals {
    pub distributed: U256,
    /// Paid out through approved subscriptions.
    pub received: U256,
}

impl DistributionTotals {
    /// Sum accruals over `(position, current index value)` pairs.
    pub fn accrue<'a, I>(subscriptions: I) -> Result<Self, AccountingError>
    where
        I: IntoIterator<Item = (&'a SubscriptionPosition, u128)>,
    {
        let mut totals = Self::default();
        for (position, index_value) in subscriptions {
            let amount = position.distributed_since(index_value)?;
            totals.distributed = totals
                .distributed
                .checked_add(amount)
                .ok_or(AccountingError::Overflow)?;
            if position.approved {
                totals.received = totals
                    .received
                    .checked_add(amount)
                    .ok_or(AccountingError::Overflow)?;
            }
        }
        Ok(totals)
    }

    /// Accrued but not yet in the wallet.
    pub fn claimable(&self) -> U256 {
        self.distributed - self.received
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(approved: bool, units: u128, checkpoint: u128) -> SubscriptionPosition {
        SubscriptionPosition {
            approved,
            units,
            index_value_until_updated_at: checkpoint,
        }
    }

    #[test]
    fn approved_subscription_receives_everything() {
        let sub = position(true, 10, 5);
        let totals = DistributionTotals::accrue([(&sub, 8)]).unwrap();
        assert_eq!(totals.received, U256::from(30u8));
        assert_eq!(totals.claimable(), U256::ZERO);
        assert_eq!(sub.pending_distribution(8).unwrap(), U256::ZERO);
    }

    #[test]
    fn unapproved_subscription_accrues_claimable() {
        let sub = position(false, 10, 5);
        let totals = DistributionTotals::accrue([(&sub, 8)]).unwrap();
        assert_eq!(totals.distributed, U256::from(30u8));
        assert_eq!(totals.received, U256::ZERO);
        assert_eq!(totals.claimable(), U256::from(30u8));
        assert_eq!(sub.pending_distribution(8).unwrap(), U256::from(30u8));
    }

    #[test]
    fn unchanged_index_contributes_nothing() {
        let sub = position(true, u128::MAX, 42);
        assert_eq!(sub.distributed_since(42).unwrap(), U256::ZERO);
    }

    #[test]
    fn mixed_subscriptions_split_by_approval() {
        let paid = position(true, 3, 0);
        let held = position(false, 2, 4);
        let totals = DistributionTotals::accrue([(&paid, 10), (&held, 10)]).unwrap();
        assert_eq!(totals.distributed, U256::from(42u8));
        assert_eq!(totals.received, U256::from(30u8));
        assert_eq!(totals.claimable(), U256::from(12u8));
    }

    #[test]
    fn checkpoint_ahead_of_index_is_an_error() {
        let sub = position(true, 1, 9);
        assert_eq!(
            sub.distributed_since(8),
            Err(AccountingError::CheckpointAhead {
                checkpoint: 9,
                current: 8
            })
        );
    }

    #[test]
    fn full_width_values_do_not_overflow() {
        let sub = position(false, u128::MAX, 0);
        let amount = sub.distributed_since(u128::MAX).unwrap();
        assert_eq!(amount, U256::from(u128::MAX) * U256::from(u128::MAX));
    }
}
