use thiserror::Error;

/// Failures talking to the ledger.
///
/// All variants are transport-level: the value could not be read, which says
/// nothing about whether the indexed data is right.
#[derive(Debug, Clone, Error)]
pub enum ChainError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("contract call {call} failed: {reason}")]
    Contract { call: &'static str, reason: String },

    #[error("value out of range: {0}")]
    Conversion(String),
}

impl ChainError {
    pub fn contract(call: &'static str, err: impl std::fmt::Display) -> Self {
        ChainError::Contract {
            call,
            reason: err.to_string(),
        }
    }
}
