use alloy_primitives::{I256, U256};

use crate::FlowRate;
use crate::distribution::AccountingError;

/// Last settled state of an `(account, token)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountCheckpoint {
    pub balance_until_updated_at: I256,
    pub net_flow_rate: FlowRate,
    pub updated_at_timestamp: u64,
}

/// Balance at `at`: checkpoint balance, plus net flow since the checkpoint,
/// plus distributions received through approved subscriptions.
///
/// Pending (unapproved) distributions are not part of the ledger's realtime
/// balance and must not be passed in `received_since`.
pub fn balance_at(
    checkpoint: &AccountCheckpoint,
    at: u64,
    received_since: U256,
) -> Result<I256, AccountingError> {
    let elapsed = at
        .checked_sub(checkpoint.updated_at_timestamp)
        .ok_or(AccountingError::BeforeCheckpoint {
            at,
            checkpoint: checkpoint.updated_at_timestamp,
        })?;
    let flowed = crate::period::streamed_amount(checkpoint.net_flow_rate, elapsed)
        .ok_or(AccountingError::Overflow)?;
    let received = I256::try_from(received_since).map_err(|_| AccountingError::Overflow)?;

    checkpoint
        .balance_until_updated_at
        .checked_add(flowed)
        .and_then(|b| b.checked_add(received))
        .ok_or(AccountingError::Overflow)
}
