//! Streaming-balance accounting: flow-rate arithmetic, stream periods,
//! distribution accrual and point-in-time balances.
//!
//! Everything here is synchronous and free of I/O.

pub mod action;
pub mod balance;
pub mod distribution;
pub mod flow_rate;
pub mod period;

pub use action::FlowActionType;
pub use balance::{AccountCheckpoint, balance_at};
pub use distribution::{AccountingError, DistributionTotals, SubscriptionPosition};
pub use flow_rate::{
    FlowPeriod, FlowRateError, WAD, amount_from_rate, rate_from_periodic_amount,
};
pub use period::{
    EventPosition, FlowEdge, FlowEdgeKey, FlowUpdate, StreamPeriod, StreamPeriodId,
    StreamPeriodTracker, TrackerError, Transition, streamed_amount,
};

/// Per-second flow rate. The ledger stores these as `int96`.
pub type FlowRate = i128;
