//! Aggregate checks, evaluated once every entity of the kinds involved has been checked.

use std::collections::HashMap;

use alloy_primitives::{I256, U256};
use flowlens_storage::models::{Index, Stream};

use crate::checks::{OpenPeriods, SupplyObservation};
use crate::report::InvariantViolation;

pub const NET_FLOW: &str = "net-flow-sums-to-zero";
pub const UNITS: &str = "subscription-units-match-index";
pub const OPEN_PERIODS: &str = "one-open-period-iff-flowing";
pub const SUPPLY: &str = "supply-matches-ledger-and-underlying";
pub const AUM_COVERS_BALANCES: &str = "aum-covers-realtime-balances";

/// Every flow has an equal and opposite counterpart, so a token's net flow
/// rates over all accounts sum to zero.
pub fn net_flow_sums_to_zero(sums: &HashMap<String, I256>) -> Vec<InvariantViolation> {
    let mut violations: Vec<_> = sums
        .iter()
        .filter(|(_, sum)| !sum.is_zero())
        .map(|(token, sum)| InvariantViolation::new(NET_FLOW, token, 0, sum))
        .collect();
    violations.sort_by(|a, b| a.subject.cmp(&b.subject));
    violations
}

/// Σ subscription units of an index == approved + pending units.
pub fn units_match(indexes: &[Index], sums: &HashMap<String, U256>) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    for index in indexes {
        let (Ok(approved), Ok(pending)) = (index.units_approved(), index.units_pending()) else {
            continue;
        };
        let expected = U256::from(approved) + U256::from(pending);
        let actual = sums.get(&index.id).copied().unwrap_or_default();
        if expected != actual {
            violations.push(InvariantViolation::new(UNITS, &index.id, expected, actual));
        }
    }
    for index_id in sums.keys() {
        if !indexes.iter().any(|i| &i.id == index_id) {
            violations.push(InvariantViolation::new(UNITS, index_id, "indexed index", "missing"));
        }
    }
    violations
}

/// An edge has exactly one open period while its rate is nonzero, and none otherwise.
pub fn one_open_period_iff_flowing(streams: &[Stream], open: &OpenPeriods) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    for stream in streams {
        let flowing = stream.flow_rate().map(|r| r != 0).unwrap_or(false);
        let count = open.0.get(&stream.id).map_or(0, Vec::len);
        let expected = usize::from(flowing);
        if count != expected {
            violations.push(InvariantViolation::new(
                OPEN_PERIODS,
                &stream.id,
                format!("{expected} open period(s)"),
                format!("{count} open period(s)"),
            ));
        }
    }
    for edge in open.0.keys() {
        if !streams.iter().any(|s| &s.id == edge) {
            violations.push(InvariantViolation::new(OPEN_PERIODS, edge, "indexed stream", "missing"));
        }
    }
    violations
}

/// Indexed supply == ledger supply == underlying held (for wrapped tokens).
pub fn supply_is_backed(observations: &[SupplyObservation]) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    for obs in observations {
        if obs.indexed_supply != obs.ledger_supply {
            violations.push(InvariantViolation::new(
                SUPPLY,
                &obs.token,
                obs.ledger_supply,
                obs.indexed_supply,
            ));
        }
        if let Some(aum) = obs.assets_under_management {
            if aum != obs.ledger_supply {
                violations.push(InvariantViolation::new(
                    SUPPLY,
                    &format!("{} underlying", obs.token),
                    obs.ledger_supply,
                    aum,
                ));
            }
        }
    }
    violations
}

/// Underlying held >= Σ realtime balances. Off unless asked for.
pub fn aum_covers_balances(
    observations: &[SupplyObservation],
    realtime_balances: &HashMap<String, I256>,
) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    for obs in observations {
        let Some(aum) = obs.assets_under_management else {
            continue;
        };
        let total = realtime_balances.get(&obs.token).copied().unwrap_or_default();
        let covered = match I256::try_from(aum) {
            Ok(aum) => aum >= total,
            Err(_) => true,
        };
        if !covered {
            violations.push(InvariantViolation::new(
                AUM_COVERS_BALANCES,
                &obs.token,
                format!(">= {total}"),
                aum,
            ));
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(id: &str, approved: u128, pending: u128) -> Index {
        Index {
            id: id.into(),
            token: "0xaa".into(),
            publisher: "0xa1".into(),
            index_id: 0,
            index_value: "0".into(),
            total_units_approved: approved.to_string(),
            total_units_pending: pending.to_string(),
            total_amount_distributed_until_updated_at: "0".into(),
            total_subscriptions_with_units: 0,
            created_at_timestamp: 0,
            updated_at_timestamp: 0,
            updated_at_block: 0,
        }
    }

    fn stream(id: &str, rate: i128) -> Stream {
        Stream {
            id: id.into(),
            token: "0xaa".into(),
            sender: "0xa1".into(),
            receiver: "0xb0".into(),
            revision_index: 0,
            period_revision_index: 0,
            current_flow_rate: rate.to_string(),
            streamed_until_updated_at: "0".into(),
            created_at_timestamp: 0,
            updated_at_timestamp: 0,
            updated_at_block: 0,
            halted: false,
        }
    }

    #[test]
    fn balanced_token_passes_net_flow() {
        let sums = HashMap::from([("0xaa".to_string(), I256::ZERO)]);
        assert!(net_flow_sums_to_zero(&sums).is_empty());
    }

    #[test]
    fn unbalanced_token_reports_the_sum() {
        let sums = HashMap::from([("0xaa".to_string(), I256::try_from(-3i64).unwrap())]);
        let violations = net_flow_sums_to_zero(&sums);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].expected, "0");
        assert_eq!(violations[0].actual, "-3");
    }

    #[test]
    fn unit_totals_include_pending() {
        let indexes = vec![index("i", 6, 4)];
        let sums = HashMap::from([("i".to_string(), U256::from(10u8))]);
        assert!(units_match(&indexes, &sums).is_empty());

        let short = HashMap::from([("i".to_string(), U256::from(6u8))]);
        let violations = units_match(&indexes, &short);
        assert_eq!(violations[0].expected, "10");
        assert_eq!(violations[0].actual, "6");
    }

    #[test]
    fn index_without_subscriptions_needs_zero_units() {
        assert!(units_match(&[index("i", 0, 0)], &HashMap::new()).is_empty());
        assert_eq!(units_match(&[index("i", 1, 0)], &HashMap::new()).len(), 1);
    }

    #[test]
    fn flowing_edge_needs_exactly_one_open_period() {
        let streams = vec![stream("e1", 100), stream("e2", 0)];
        let open = OpenPeriods(HashMap::from([("e1".to_string(), vec!["e1-0-0".to_string()])]));
        assert!(one_open_period_iff_flowing(&streams, &open).is_empty());

        let doubled = OpenPeriods(HashMap::from([(
            "e1".to_string(),
            vec!["e1-0-0".to_string(), "e1-0-1".to_string()],
        )]));
        assert_eq!(one_open_period_iff_flowing(&streams, &doubled)[0].subject, "e1");

        let stale = OpenPeriods(HashMap::from([
            ("e1".to_string(), vec!["e1-0-0".to_string()]),
            ("e2".to_string(), vec!["e2-0-3".to_string()]),
        ]));
        assert_eq!(one_open_period_iff_flowing(&streams, &stale)[0].subject, "e2");
    }

    #[test]
    fn underlying_shortfall_breaks_supply() {
        let obs = SupplyObservation {
            token: "0xaa".into(),
            indexed_supply: U256::from(100u8),
            ledger_supply: U256::from(100u8),
            assets_under_management: Some(U256::from(90u8)),
        };
        let violations = supply_is_backed(&[obs]);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].subject, "0xaa underlying");
    }

    #[test]
    fn aum_below_balances_is_flagged() {
        let obs = SupplyObservation {
            token: "0xaa".into(),
            indexed_supply: U256::from(100u8),
            ledger_supply: U256::from(100u8),
            assets_under_management: Some(U256::from(100u8)),
        };
        let balances = HashMap::from([("0xaa".to_string(), I256::try_from(120i64).unwrap())]);
        assert_eq!(aum_covers_balances(&[obs.clone()], &balances).len(), 1);

        let balances = HashMap::from([("0xaa".to_string(), I256::try_from(80i64).unwrap())]);
        assert!(aum_covers_balances(&[obs], &balances).is_empty());
    }
}
