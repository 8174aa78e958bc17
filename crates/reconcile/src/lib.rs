//! Reconciliation of the indexed store against the ledger.
//!
//! A pass pins both sides to one block, pages every entity kind out of the
//! indexed store, checks each entity against point-in-time ledger reads in
//! bounded-concurrency chunks, then evaluates aggregate invariants.

pub mod checks;
pub mod error;
pub mod event;
pub mod fetcher;
pub mod invariants;
pub mod report;
pub mod runner;
pub mod source;
pub mod validator;

pub use checks::{CheckOptions, Checker};
pub use error::{CheckError, ReconcileError, SourceError};
pub use event::{EventValidator, ExpectedEvent};
pub use fetcher::{DEFAULT_PAGE_SIZE, Fetched, PaginatedFetcher};
pub use report::{InvariantViolation, KindSummary, Mismatch, ReconciliationReport, TransportFailure};
pub use runner::{Reconciler, ReconcilerConfig};
pub use source::{IndexedSource, PgIndexedSource};
pub use validator::{ChunkedValidator, Contribution, EntityCheck, ValidationOutcome};
