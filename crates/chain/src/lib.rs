pub mod abi;
pub mod decoder;
pub mod error;
pub mod ground_truth;
pub mod provider;

pub use abi::{ConstantFlowAgreement, ERC20, InstantDistributionAgreement, SuperToken, SuperTokenFactory};
pub use decoder::{DecodedEvent, EventMeta, LedgerEvent, ZERO_ADDRESS, decode_log};
pub use error::ChainError;
pub use ground_truth::{FlowState, GroundTruth, IndexState, Retrying, RpcGroundTruth, SubscriptionState};
pub use provider::{ChainProvider, create_provider};
