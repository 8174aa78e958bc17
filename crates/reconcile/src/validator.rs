//! Chunked, bounded-concurrency validation of one entity kind.

use std::future::Future;

use flowlens_chain::ChainError;
use flowlens_storage::models::Entity;
use futures::stream::{self, StreamExt};

use crate::error::CheckError;
use crate::report::{Mismatch, TransportFailure};

/// Per-entity share of an aggregate, folded after each chunk.
///
/// Tasks never write shared sums; each returns its own contribution and the
/// validator merges them on one thread.
pub trait Contribution: Default {
    fn merge(&mut self, other: Self);
}

impl Contribution for () {
    fn merge(&mut self, _: ()) {}
}

/// What checking a single entity produced.
#[derive(Debug, Default)]
pub struct EntityCheck<C> {
    pub mismatches: Vec<Mismatch>,
    pub contribution: C,
    /// A ledger read that failed after the indexed side had already contributed.
    pub interrupted: Option<ChainError>,
}

impl<C: Default> EntityCheck<C> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<C> EntityCheck<C> {
    pub fn with(contribution: C) -> Self {
        Self {
            mismatches: Vec::new(),
            contribution,
            interrupted: None,
        }
    }

    /// Stop here: keep what was contributed and compared so far, record `err`.
    pub fn interrupt(mut self, err: ChainError) -> Self {
        self.interrupted = Some(err);
        self
    }

    /// Record a mismatch unless `expected == actual`.
    pub fn compare<T>(&mut self, kind: &str, entity: &str, field: &str, expected: T, actual: T)
    where
        T: PartialEq + ToString,
    {
        if expected != actual {
            self.mismatches.push(Mismatch::new(kind, entity, field, expected, actual));
        }
    }
}

/// Everything learned about one entity kind.
#[derive(Debug, Default)]
pub struct ValidationOutcome<C> {
    pub checked: usize,
    pub mismatches: Vec<Mismatch>,
    pub transport_failures: Vec<TransportFailure>,
    pub contribution: C,
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkedValidator {
    chunk_size: usize,
}

impl ChunkedValidator {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    /// Run `check` over `items`.
    ///
    /// Chunks run one after another; entities inside a chunk run concurrently,
    /// at most `chunk_size` at a time. A failing entity is recorded and never
    /// stops its siblings or later chunks.
    pub async fn validate<'a, T, C, F, Fut>(&self, items: &'a [T], check: F) -> ValidationOutcome<C>
    where
        T: Entity,
        C: Contribution,
        F: Fn(&'a T) -> Fut,
        Fut: Future<Output = Result<EntityCheck<C>, CheckError>>,
    {
        let mut outcome = ValidationOutcome::<C>::default();

        for (chunk_no, chunk) in items.chunks(self.chunk_size).enumerate() {
            let mut results = stream::iter(chunk)
                .map(|item| {
                    let fut = check(item);
                    async move { (item, fut.await) }
                })
                .buffer_unordered(self.chunk_size);

            while let Some((item, result)) = results.next().await {
                let entity_check = match result {
                    Ok(entity_check) => entity_check,
                    Err(CheckError::Malformed(err)) => {
                        outcome.checked += 1;
                        tracing::warn!(kind = T::KIND, entity = item.id(), error = %err, "Malformed entity");
                        outcome
                            .mismatches
                            .push(Mismatch::new(T::KIND, item.id(), err.field, "well-formed value", err.value));
                        continue;
                    }
                    Err(CheckError::Transport(err)) => EntityCheck::new().interrupt(err),
                };

                for mismatch in &entity_check.mismatches {
                    tracing::warn!(
                        kind = T::KIND,
                        entity = %mismatch.entity,
                        field = %mismatch.field,
                        expected = %mismatch.expected,
                        actual = %mismatch.actual,
                        "Mismatch"
                    );
                }
                outcome.mismatches.extend(entity_check.mismatches);
                outcome.contribution.merge(entity_check.contribution);

                match entity_check.interrupted {
                    None => outcome.checked += 1,
                    Some(err) => {
                        tracing::warn!(
                            kind = T::KIND,
                            entity = item.id(),
                            chunk = chunk_no,
                            error = %err,
                            "Ground truth read failed"
                        );
                        outcome.transport_failures.push(TransportFailure {
                            kind: T::KIND.to_string(),
                            entity: Some(item.id().to_string()),
                            chunk: Some(chunk_no),
                            error: err.to_string(),
                        });
                    }
                }
            }

            tracing::debug!(kind = T::KIND, chunk = chunk_no, checked = outcome.checked, "Chunk done");
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::cell::Cell;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Item {
        id: String,
        value: u64,
    }

    impl Entity for Item {
        const KIND: &'static str = "item";

        fn id(&self) -> &str {
            &self.id
        }
    }

    #[derive(Default)]
    struct Sum(u64);

    impl Contribution for Sum {
        fn merge(&mut self, other: Self) {
            self.0 += other.0;
        }
    }

    fn items(n: u64) -> Vec<Item> {
        (0..n)
            .map(|i| Item {
                id: format!("{i:04}"),
                value: i,
            })
            .collect()
    }

    #[tokio::test]
    async fn contributions_are_folded_across_chunks() {
        let items = items(10);
        let outcome = ChunkedValidator::new(3)
            .validate(&items, |item| async move { Ok(EntityCheck::with(Sum(item.value))) })
            .await;
        assert_eq!(outcome.checked, 10);
        assert_eq!(outcome.contribution.0, 45);
        assert!(outcome.mismatches.is_empty());
    }

    #[tokio::test]
    async fn failures_are_isolated_and_numbered_by_chunk() {
        let items = items(7);
        let outcome = ChunkedValidator::new(3)
            .validate(&items, |item| async move {
                match item.value {
                    4 => Err(CheckError::Transport(ChainError::Rpc("timeout".into()))),
                    5 => {
                        let mut check = EntityCheck::<()>::new();
                        check.compare(Item::KIND, &item.id, "value", 50u64, item.value);
                        Ok(check)
                    }
                    _ => Ok(EntityCheck::new()),
                }
            })
            .await;

        assert_eq!(outcome.checked, 6);
        assert_eq!(outcome.transport_failures.len(), 1);
        assert_eq!(outcome.transport_failures[0].entity.as_deref(), Some("0004"));
        assert_eq!(outcome.transport_failures[0].chunk, Some(1));
        assert_eq!(outcome.mismatches.len(), 1);
        assert_eq!(outcome.mismatches[0].expected, "50");
        assert_eq!(outcome.mismatches[0].actual, "5");
    }

    #[tokio::test]
    async fn interrupted_check_still_contributes() {
        let items = items(4);
        let outcome = ChunkedValidator::new(2)
            .validate(&items, |item| async move {
                let check = EntityCheck::with(Sum(item.value));
                if item.value == 3 {
                    Ok(check.interrupt(ChainError::Rpc("timeout".into())))
                } else {
                    Ok(check)
                }
            })
            .await;

        assert_eq!(outcome.checked, 3);
        assert_eq!(outcome.contribution.0, 6);
        assert_eq!(outcome.transport_failures.len(), 1);
        assert_eq!(outcome.transport_failures[0].entity.as_deref(), Some("0003"));
        assert_eq!(outcome.transport_failures[0].chunk, Some(1));
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_chunk_size() {
        let items = items(20);
        let in_flight = Cell::new(0usize);
        let peak = Cell::new(0usize);
        ChunkedValidator::new(4)
            .validate(&items, |_| {
                let in_flight = &in_flight;
                let peak = &peak;
                async move {
                    in_flight.set(in_flight.get() + 1);
                    peak.set(peak.get().max(in_flight.get()));
                    tokio::task::yield_now().await;
                    in_flight.set(in_flight.get() - 1);
                    Ok(EntityCheck::<()>::new())
                }
            })
            .await;
        assert_eq!(peak.get(), 4);
    }
}
