use serde::Serialize;

/// An indexed value that disagrees with the ledger, or with itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Mismatch {
    pub kind: String,
    pub entity: String,
    pub field: String,
    /// Ground truth, or the value the entity's own fields imply.
    pub expected: String,
    /// What the index holds.
    pub actual: String,
}

impl Mismatch {
    pub fn new(
        kind: &str,
        entity: &str,
        field: &str,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        Self {
            kind: kind.to_string(),
            entity: entity.to_string(),
            field: field.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

/// A network read that kept failing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportFailure {
    pub kind: String,
    /// `None` when a whole page fetch failed.
    pub entity: Option<String>,
    pub chunk: Option<usize>,
    pub error: String,
}

/// A failed aggregate check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvariantViolation {
    pub invariant: String,
    pub subject: String,
    pub expected: String,
    pub actual: String,
}

impl InvariantViolation {
    pub fn new(invariant: &str, subject: &str, expected: impl ToString, actual: impl ToString) -> Self {
        Self {
            invariant: invariant.to_string(),
            subject: subject.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KindSummary {
    pub kind: String,
    pub fetched: usize,
    pub pages: usize,
    pub checked: usize,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub chain_id: u64,
    pub pin_block: u64,
    pub pin_timestamp: u64,
    pub kinds: Vec<KindSummary>,
    pub mismatches: Vec<Mismatch>,
    pub transport_failures: Vec<TransportFailure>,
    pub invariant_violations: Vec<InvariantViolation>,
    /// Checks deliberately not run, with the reason.
    pub skipped_checks: Vec<String>,
}

impl ReconciliationReport {
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty() && self.transport_failures.is_empty() && self.invariant_violations.is_empty()
    }

    pub fn kind(&self, kind: &str) -> Option<&KindSummary> {
        self.kinds.iter().find(|k| k.kind == kind)
    }
}
