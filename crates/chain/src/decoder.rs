use alloy::primitives::{Address, Bytes, U256};
use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;
use serde_json::{Value, json};

use crate::abi::{ConstantFlowAgreement, InstantDistributionAgreement as Ida, SuperToken, SuperTokenFactory};

/// Zero address constant for mint/burn detection.
pub const ZERO_ADDRESS: Address = Address::ZERO;

/// Where a decoded log came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMeta {
    pub emitter: Address,
    pub transaction_hash: String,
    pub block_number: u64,
    pub log_index: u64,
    pub block_timestamp: Option<u64>,
}

impl EventMeta {
    /// Stable event identity: `txhash-logindex`.
    pub fn id(&self) -> String {
        format!("{}-{}", self.transaction_hash, self.log_index)
    }
}

/// A ledger event the indexer understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    SuperTokenCreated {
        token: Address,
    },
    Transfer {
        token: Address,
        from: Address,
        to: Address,
        amount: U256,
    },
    Mint {
        token: Address,
        to: Address,
        amount: U256,
    },
    Burn {
        token: Address,
        from: Address,
        amount: U256,
    },
    FlowUpdated {
        token: Address,
        sender: Address,
        receiver: Address,
        flow_rate: i128,
        total_sender_flow_rate: i128,
        total_receiver_flow_rate: i128,
        user_data: Bytes,
    },
    IndexCreated {
        token: Address,
        publisher: Address,
        index_id: u32,
        user_data: Bytes,
    },
    IndexUpdated {
        token: Address,
        publisher: Address,
        index_id: u32,
        old_index_value: u128,
        new_index_value: u128,
        total_units_pending: u128,
        total_units_approved: u128,
        user_data: Bytes,
    },
    IndexSubscribed {
        token: Address,
        publisher: Address,
        index_id: u32,
        subscriber: Address,
        user_data: Bytes,
    },
    IndexUnitsUpdated {
        token: Address,
        publisher: Address,
        index_id: u32,
        subscriber: Address,
        units: u128,
        user_data: Bytes,
    },
    IndexUnsubscribed {
        token: Address,
        publisher: Address,
        index_id: u32,
        subscriber: Address,
        user_data: Bytes,
    },
    IndexDistributionClaimed {
        token: Address,
        publisher: Address,
        index_id: u32,
        subscriber: Address,
        amount: U256,
    },
    SubscriptionApproved {
        token: Address,
        subscriber: Address,
        publisher: Address,
        index_id: u32,
        user_data: Bytes,
    },
    SubscriptionRevoked {
        token: Address,
        subscriber: Address,
        publisher: Address,
        index_id: u32,
        user_data: Bytes,
    },
    SubscriptionUnitsUpdated {
        token: Address,
        subscriber: Address,
        publisher: Address,
        index_id: u32,
        units: u128,
        user_data: Bytes,
    },
    SubscriptionDistributionClaimed {
        token: Address,
        subscriber: Address,
        publisher: Address,
        index_id: u32,
        amount: U256,
    },
}

impl LedgerEvent {
    /// Type tag stored with the indexed event.
    pub fn name(&self) -> &'static str {
        match self {
            LedgerEvent::SuperTokenCreated { .. } => "SuperTokenCreated",
            LedgerEvent::Transfer { .. } => "Transfer",
            LedgerEvent::Mint { .. } => "Mint",
            LedgerEvent::Burn { .. } => "Burn",
            LedgerEvent::FlowUpdated { .. } => "FlowUpdated",
            LedgerEvent::IndexCreated { .. } => "IndexCreated",
            LedgerEvent::IndexUpdated { .. } => "IndexUpdated",
            LedgerEvent::IndexSubscribed { .. } => "IndexSubscribed",
            LedgerEvent::IndexUnitsUpdated { .. } => "IndexUnitsUpdated",
            LedgerEvent::IndexUnsubscribed { .. } => "IndexUnsubscribed",
            LedgerEvent::IndexDistributionClaimed { .. } => "IndexDistributionClaimed",
            LedgerEvent::SubscriptionApproved { .. } => "SubscriptionApproved",
            LedgerEvent::SubscriptionRevoked { .. } => "SubscriptionRevoked",
            LedgerEvent::SubscriptionUnitsUpdated { .. } => "SubscriptionUnitsUpdated",
            LedgerEvent::SubscriptionDistributionClaimed { .. } => "SubscriptionDistributionClaimed",
        }
    }

    pub fn token(&self) -> Address {
        match self {
            LedgerEvent::SuperTokenCreated { token }
            | LedgerEvent::Transfer { token, .. }
            | LedgerEvent::Mint { token, .. }
            | LedgerEvent::Burn { token, .. }
            | LedgerEvent::FlowUpdated { token, .. }
            | LedgerEvent::IndexCreated { token, .. }
            | LedgerEvent::IndexUpdated { token, .. }
            | LedgerEvent::IndexSubscribed { token, .. }
            | LedgerEvent::IndexUnitsUpdated { token, .. }
            | LedgerEvent::IndexUnsubscribed { token, .. }
            | LedgerEvent::IndexDistributionClaimed { token, .. }
            | LedgerEvent::SubscriptionApproved { token, .. }
            | LedgerEvent::SubscriptionRevoked { token, .. }
            | LedgerEvent::SubscriptionUnitsUpdated { token, .. }
            | LedgerEvent::SubscriptionDistributionClaimed { token, .. } => *token,
        }
    }

    /// Field-by-field representation stored alongside the indexed event.
    ///
    /// Addresses are lowercase hex, integers decimal strings, bytes `0x` hex.
    pub fn properties(&self) -> Value {
        match self {
            LedgerEvent::SuperTokenCreated { token } => json!({ "token": addr(token) }),
            LedgerEvent::Transfer {
                token,
                from,
                to,
                amount,
            } => json!({
                "token": addr(token),
                "from": addr(from),
                "to": addr(to),
                "value": amount.to_string(),
            }),
            LedgerEvent::Mint { token, to, amount } => json!({
                "token": addr(token),
                "to": addr(to),
                "value": amount.to_string(),
            }),
            LedgerEvent::Burn {
                token,
                from,
                amount,
            } => json!({
                "token": addr(token),
                "from": addr(from),
                "value": amount.to_string(),
            }),
            LedgerEvent::FlowUpdated {
                token,
                sender,
                receiver,
                flow_rate,
                total_sender_flow_rate,
                total_receiver_flow_rate,
                user_data,
            } => json!({
                "token": addr(token),
                "sender": addr(sender),
                "receiver": addr(receiver),
                "flowRate": flow_rate.to_string(),
                "totalSenderFlowRate": total_sender_flow_rate.to_string(),
                "totalReceiverFlowRate": total_receiver_flow_rate.to_string(),
                "userData": bytes(user_data),
            }),
            LedgerEvent::IndexCreated {
                token,
                publisher,
                index_id,
                user_data,
            } => json!({
                "token": addr(token),
                "publisher": addr(publisher),
                "indexId": index_id.to_string(),
                "userData": bytes(user_data),
            }),
            LedgerEvent::IndexUpdated {
                token,
                publisher,
                index_id,
                old_index_value,
                new_index_value,
                total_units_pending,
                total_units_approved,
                user_data,
            } => json!({
                "token": addr(token),
                "publisher": addr(publisher),
                "indexId": index_id.to_string(),
                "oldIndexValue": old_index_value.to_string(),
                "newIndexValue": new_index_value.to_string(),
                "totalUnitsPending": total_units_pending.to_string(),
                "totalUnitsApproved": total_units_approved.to_string(),
                "userData": bytes(user_data),
            }),
            LedgerEvent::IndexSubscribed {
                token,
                publisher,
                index_id,
                subscriber,
                user_data,
            }
            | LedgerEvent::IndexUnsubscribed {
                token,
                publisher,
                index_id,
                subscriber,
                user_data,
            }
            | LedgerEvent::SubscriptionApproved {
                token,
                subscriber,
                publisher,
                index_id,
                user_data,
            }
            | LedgerEvent::SubscriptionRevoked {
                token,
                subscriber,
                publisher,
                index_id,
                user_data,
            } => json!({
                "token": addr(token),
                "publisher": addr(publisher),
                "indexId": index_id.to_string(),
                "subscriber": addr(subscriber),
                "userData": bytes(user_data),
            }),
            LedgerEvent::IndexUnitsUpdated {
                token,
                publisher,
                index_id,
                subscriber,
                units,
                user_data,
            }
            | LedgerEvent::SubscriptionUnitsUpdated {
                token,
                subscriber,
                publisher,
                index_id,
                units,
                user_data,
            } => json!({
                "token": addr(token),
                "publisher": addr(publisher),
                "indexId": index_id.to_string(),
                "subscriber": addr(subscriber),
                "units": units.to_string(),
                "userData": bytes(user_data),
            }),
            LedgerEvent::IndexDistributionClaimed {
                token,
                publisher,
                index_id,
                subscriber,
                amount,
            }
            | LedgerEvent::SubscriptionDistributionClaimed {
                token,
                subscriber,
                publisher,
                index_id,
                amount,
            } => json!({
                "token": addr(token),
                "publisher": addr(publisher),
                "indexId": index_id.to_string(),
                "subscriber": addr(subscriber),
                "amount": amount.to_string(),
            }),
        }
    }
}

/// A decoded log with its position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvent {
    pub meta: EventMeta,
    pub event: LedgerEvent,
}

impl DecodedEvent {
    pub fn id(&self) -> String {
        self.meta.id()
    }
}

fn addr(a: &Address) -> String {
    format!("{a:#x}")
}

fn bytes(b: &Bytes) -> String {
    format!("0x{}", hex::encode(b))
}

/// Attempt to decode a log as one of the protocol events.
///
/// Transfer events with `from == 0x0` are classified as Mint;
/// Transfer events with `to == 0x0` are classified as Burn.
pub fn decode_log(log: &Log) -> Option<DecodedEvent> {
    let meta = EventMeta {
        emitter: log.address(),
        transaction_hash: log
            .transaction_hash
            .map(|h| format!("{h:#x}"))
            .unwrap_or_default(),
        block_number: log.block_number?,
        log_index: log.log_index?,
        block_timestamp: log.block_timestamp,
    };
    let topic0 = *log.topic0()?;

    let event = if topic0 == SuperToken::Transfer::SIGNATURE_HASH {
        let d = log.log_decode::<SuperToken::Transfer>().ok()?.inner.data;
        let token = meta.emitter;
        if d.from == ZERO_ADDRESS {
            LedgerEvent::Mint {
                token,
                to: d.to,
                amount: d.value,
            }
        } else if d.to == ZERO_ADDRESS {
            LedgerEvent::Burn {
                token,
                from: d.from,
                amount: d.value,
            }
        } else {
            LedgerEvent::Transfer {
                token,
                from: d.from,
                to: d.to,
                amount: d.value,
            }
        }
    } else if topic0 == ConstantFlowAgreement::FlowUpdated::SIGNATURE_HASH {
        let d = log.log_decode::<ConstantFlowAgreement::FlowUpdated>().ok()?.inner.data;
        LedgerEvent::FlowUpdated {
            token: d.token,
            sender: d.sender,
            receiver: d.receiver,
            flow_rate: i128::try_from(d.flowRate).ok()?,
            total_sender_flow_rate: i128::try_from(d.totalSenderFlowRate).ok()?,
            total_receiver_flow_rate: i128::try_from(d.totalReceiverFlowRate).ok()?,
            user_data: d.userData,
        }
    } else if topic0 == Ida::IndexCreated::SIGNATURE_HASH {
        let d = log.log_decode::<Ida::IndexCreated>().ok()?.inner.data;
        LedgerEvent::IndexCreated {
            token: d.token,
            publisher: d.publisher,
            index_id: d.indexId,
            user_data: d.userData,
        }
    } else if topic0 == Ida::IndexUpdated::SIGNATURE_HASH {
        let d = log.log_decode::<Ida::IndexUpdated>().ok()?.inner.data;
        LedgerEvent::IndexUpdated {
            token: d.token,
            publisher: d.publisher,
            index_id: d.indexId,
            old_index_value: d.oldIndexValue,
            new_index_value: d.newIndexValue,
            total_units_pending: d.totalUnitsPending,
            total_units_approved: d.totalUnitsApproved,
            user_data: d.userData,
        }
    } else if topic0 == Ida::IndexSubscribed::SIGNATURE_HASH {
        let d = log.log_decode::<Ida::IndexSubscribed>().ok()?.inner.data;
        LedgerEvent::IndexSubscribed {
            token: d.token,
            publisher: d.publisher,
            index_id: d.indexId,
            subscriber: d.subscriber,
            user_data: d.userData,
        }
    } else if topic0 == Ida::IndexUnitsUpdated::SIGNATURE_HASH {
        let d = log.log_decode::<Ida::IndexUnitsUpdated>().ok()?.inner.data;
        LedgerEvent::IndexUnitsUpdated {
            token: d.token,
            publisher: d.publisher,
            index_id: d.indexId,
            subscriber: d.subscriber,
            units: d.units,
            user_data: d.userData,
        }
    } else if topic0 == Ida::IndexUnsubscribed::SIGNATURE_HASH {
        let d = log.log_decode::<Ida::IndexUnsubscribed>().ok()?.inner.data;
        LedgerEvent::IndexUnsubscribed {
            token: d.token,
            publisher: d.publisher,
            index_id: d.indexId,
            subscriber: d.subscriber,
            user_data: d.userData,
        }
    } else if topic0 == Ida::IndexDistributionClaimed::SIGNATURE_HASH {
        let d = log.log_decode::<Ida::IndexDistributionClaimed>().ok()?.inner.data;
        LedgerEvent::IndexDistributionClaimed {
            token: d.token,
            publisher: d.publisher,
            index_id: d.indexId,
            subscriber: d.subscriber,
            amount: d.amount,
        }
    } else if topic0 == Ida::SubscriptionApproved::SIGNATURE_HASH {
        let d = log.log_decode::<Ida::SubscriptionApproved>().ok()?.inner.data;
        LedgerEvent::SubscriptionApproved {
            token: d.token,
            subscriber: d.subscriber,
            publisher: d.publisher,
            index_id: d.indexId,
            user_data: d.userData,
        }
    } else if topic0 == Ida::SubscriptionRevoked::SIGNATURE_HASH {
        let d = log.log_decode::<Ida::SubscriptionRevoked>().ok()?.inner.data;
        LedgerEvent::SubscriptionRevoked {
            token: d.token,
            subscriber: d.subscriber,
            publisher: d.publisher,
            index_id: d.indexId,
            user_data: d.userData,
        }
    } else if topic0 == Ida::SubscriptionUnitsUpdated::SIGNATURE_HASH {
        let d = log.log_decode::<Ida::SubscriptionUnitsUpdated>().ok()?.inner.data;
        LedgerEvent::SubscriptionUnitsUpdated {
            token: d.token,
            subscriber: d.subscriber,
            publisher: d.publisher,
            index_id: d.indexId,
            units: d.units,
            user_data: d.userData,
        }
    } else if topic0 == Ida::SubscriptionDistributionClaimed::SIGNATURE_HASH {
        let d = log.log_decode::<Ida::SubscriptionDistributionClaimed>().ok()?.inner.data;
        LedgerEvent::SubscriptionDistributionClaimed {
            token: d.token,
            subscriber: d.subscriber,
            publisher: d.publisher,
            index_id: d.indexId,
            amount: d.amount,
        }
    } else if topic0 == SuperTokenFactory::SuperTokenCreated::SIGNATURE_HASH {
        let d = log.log_decode::<SuperTokenFactory::SuperTokenCreated>().ok()?.inner.data;
        LedgerEvent::SuperTokenCreated { token: d.token }
    } else if topic0 == SuperTokenFactory::CustomSuperTokenCreated::SIGNATURE_HASH {
        let d = log
            .log_decode::<SuperTokenFactory::CustomSuperTokenCreated>()
            .ok()?
            .inner
            .data;
        LedgerEvent::SuperTokenCreated { token: d.token }
    } else {
        return None;
    };

    Some(DecodedEvent { meta, event })
}
