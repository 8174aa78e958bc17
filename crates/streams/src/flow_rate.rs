//! Conversions between per-second flow rates and periodic amounts.
//!
//! Rates are fixed-point: a rate of `WAD` moves one whole unit per second.
//! Every conversion rounds to the nearest integer, halves away from zero.

use alloy_primitives::{I256, U256};
use thiserror::Error;

/// Fixed-point base of 10^18.
pub const WAD: U256 = U256::from_limbs([1_000_000_000_000_000_000, 0, 0, 0]);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowRateError {
    #[error("period must be at least one second")]
    ZeroPeriod,
    #[error("fixed-point base must be non-zero")]
    ZeroBase,
    #[error("flow rate conversion overflowed 256 bits")]
    Overflow,
}

/// Calendar periods a rate is commonly quoted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowPeriod {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    /// 365/12 days.
    Month,
    /// 365.2425 days.
    Year,
}

impl FlowPeriod {
    pub const ALL: [FlowPeriod; 7] = [
        FlowPeriod::Second,
        FlowPeriod::Minute,
        FlowPeriod::Hour,
        FlowPeriod::Day,
        FlowPeriod::Week,
        FlowPeriod::Month,
        FlowPeriod::Year,
    ];

    pub const fn seconds(self) -> u64 {
        match self {
            FlowPeriod::Second => 1,
            FlowPeriod::Minute => 60,
            FlowPeriod::Hour => 3_600,
            FlowPeriod::Day => 86_400,
            FlowPeriod::Week => 604_800,
            FlowPeriod::Month => 2_629_746,
            FlowPeriod::Year => 31_556_952,
        }
    }
}

/// `round(amount / period_seconds * base)`.
pub fn rate_from_periodic_amount(
    amount: I256,
    period_seconds: u64,
    base: U256,
) -> Result<I256, FlowRateError> {
    if period_seconds == 0 {
        return Err(FlowRateError::ZeroPeriod);
    }
    if base.is_zero() {
        return Err(FlowRateError::ZeroBase);
    }
    mul_div_round(amount, base, U256::from(period_seconds))
}

/// `round(rate / base * period_seconds)`.
pub fn amount_from_rate(rate: I256, period_seconds: u64, base: U256) -> Result<I256, FlowRateError> {
    if period_seconds == 0 {
        return Err(FlowRateError::ZeroPeriod);
    }
    if base.is_zero() {
        return Err(FlowRateError::ZeroBase);
    }
    mul_div_round(rate, U256::from(period_seconds), base)
}

/// `value * mul / div`, rounded half away from zero. `div` must be non-zero.
fn mul_div_round(value: I256, mul: U256, div: U256) -> Result<I256, FlowRateError> {
    let numerator = value
        .unsigned_abs()
        .checked_mul(mul)
        .ok_or(FlowRateError::Overflow)?;
    let (quotient, remainder) = numerator.div_rem(div);
    let magnitude = if remainder >= div - remainder {
        quotient + U256::from(1u8)
    } else {
        quotient
    };
    let magnitude = I256::try_from(magnitude).map_err(|_| FlowRateError::Overflow)?;
    Ok(if value.is_negative() { -magnitude } else { magnitude })
}
