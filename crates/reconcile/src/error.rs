use flowlens_chain::ChainError;
use flowlens_storage::models::ModelError;
use thiserror::Error;

/// Failures reading the indexed store.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("indexed query failed: {0}")]
    Query(String),

    #[error(transparent)]
    Malformed(#[from] ModelError),

    #[error("indexed source made no progress past id {0}")]
    Stalled(String),
}

/// Why a single entity could not be checked.
#[derive(Debug, Clone, Error)]
pub enum CheckError {
    /// The ground-truth read failed after retries.
    #[error(transparent)]
    Transport(#[from] ChainError),

    /// The indexed entity does not parse.
    #[error(transparent)]
    Malformed(#[from] ModelError),
}

/// Failures that abort a pass before any entity is checked.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("unsupported network: expected chain {expected}, RPC serves chain {actual}")]
    UnsupportedNetwork { expected: u64, actual: u64 },

    #[error("could not read chain id: {0}")]
    ChainId(#[source] ChainError),

    #[error("could not fetch pin block {block}: {source}")]
    PinBlock {
        block: u64,
        #[source]
        source: ChainError,
    },

    #[error("could not determine pin block: {0}")]
    Cursor(#[source] SourceError),
}
