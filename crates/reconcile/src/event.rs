//! Checks a single indexed event against what the ledger emitted.

use flowlens_chain::DecodedEvent;
use flowlens_core::RetryPolicy;
use serde_json::Value;

use crate::error::SourceError;
use crate::report::Mismatch;
use crate::source::IndexedSource;

const KIND: &str = "event";

/// The event as the ledger emitted it, taken from the transaction receipt.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpectedEvent {
    pub transaction_hash: String,
    pub block_number: u64,
    pub name: String,
    pub properties: Value,
}

impl ExpectedEvent {
    pub fn from_decoded(decoded: &DecodedEvent) -> Self {
        Self {
            transaction_hash: decoded.meta.transaction_hash.clone(),
            block_number: decoded.meta.block_number,
            name: decoded.event.name().to_string(),
            properties: decoded.event.properties(),
        }
    }
}

/// Looks up "the `name` event in this transaction" and compares it field by field.
pub struct EventValidator {
    retry: RetryPolicy,
}

impl EventValidator {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }

    /// Returns the disagreements; empty means the event is indexed faithfully.
    pub async fn validate<S>(&self, source: &S, expected: &ExpectedEvent, pin: u64) -> Result<Vec<Mismatch>, SourceError>
    where
        S: IndexedSource + ?Sized,
    {
        let tx = expected.transaction_hash.as_str();
        let name = expected.name.as_str();
        let indexed = self
            .retry
            .run("event", move |_| source.event_by_transaction(tx, name, pin))
            .await?;

        let Some(indexed) = indexed else {
            return Ok(vec![Mismatch::new(KIND, tx, "presence", name, "missing")]);
        };

        let mut mismatches = Vec::new();
        let mut push = |field: &str, expected: &dyn ToString, actual: &dyn ToString| {
            mismatches.push(Mismatch::new(KIND, &indexed.id, field, expected.to_string(), actual.to_string()));
        };

        if !indexed.transaction_hash.eq_ignore_ascii_case(tx) {
            push("transactionHash", &tx, &indexed.transaction_hash);
        }
        if indexed.block_number != expected.block_number as i64 {
            push("blockNumber", &expected.block_number, &indexed.block_number);
        }
        if indexed.name != name {
            push("name", &name, &indexed.name);
        }

        compare_properties(&expected.properties, &indexed.properties, &mut push);
        Ok(mismatches)
    }
}

fn render(value: Option<&Value>) -> String {
    match value {
        None => "absent".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn compare_properties(
    expected: &Value,
    actual: &Value,
    push: &mut impl FnMut(&str, &dyn ToString, &dyn ToString),
) {
    match (expected.as_object(), actual.as_object()) {
        (Some(want), Some(got)) => {
            for (field, value) in want {
                let indexed = got.get(field);
                if indexed != Some(value) {
                    push(field, &render(Some(value)), &render(indexed));
                }
            }
            for (field, value) in got {
                if !want.contains_key(field) {
                    push(field, &render(None), &render(Some(value)));
                }
            }
        }
        _ if expected != actual => push("properties", &expected, &actual),
        _ => {}
    }
}
