mod common;

use std::collections::HashSet;

use alloy_primitives::U256;
use common::*;
use flowlens_chain::FlowState;
use flowlens_core::RetryPolicy;
use flowlens_reconcile::invariants;
use flowlens_reconcile::runner::{SKIPPED_AUM_COVERS_BALANCES, SKIPPED_REALTIME_BALANCE};
use flowlens_reconcile::{CheckOptions, ReconcileError, Reconciler, ReconcilerConfig};
use flowlens_storage::models::{
    AccountTokenSnapshot, Entity, IndexSubscription, Stream, StreamPeriod, Token, TokenStatistic,
};

fn config() -> ReconcilerConfig {
    ReconcilerConfig {
        retry: RetryPolicy::none(),
        ..Default::default()
    }
}

#[tokio::test]
async fn consistent_world_passes() {
    let (ledger, source) = consistent_world();
    let reconciler = Reconciler::new(ledger, source, config());

    let report = reconciler.run(None).await.unwrap();

    assert!(report.passed(), "{report:#?}");
    assert_eq!(report.pin_block, PIN);
    assert_eq!(report.pin_timestamp, PIN_TIMESTAMP);
    assert_eq!(report.kind(Stream::KIND).unwrap().checked, 2);
    assert_eq!(report.kind(StreamPeriod::KIND).unwrap().checked, 2);
    assert_eq!(report.kind(AccountTokenSnapshot::KIND).unwrap().checked, 3);
    assert_eq!(report.kind(IndexSubscription::KIND).unwrap().checked, 2);
    assert_eq!(
        report.skipped_checks,
        vec![SKIPPED_AUM_COVERS_BALANCES.to_string(), SKIPPED_REALTIME_BALANCE.to_string()]
    );
}

#[tokio::test]
async fn both_sides_are_read_at_the_requested_pin() {
    let (mut ledger, source) = consistent_world();
    ledger.timestamps.insert(42, 1_500);
    let reconciler = Reconciler::new(ledger, source, config());

    let report = reconciler.run(Some(42)).await.unwrap();

    assert_eq!(report.pin_block, 42);
    assert_eq!(reconciler.source().pins(), HashSet::from([42]));
    assert_eq!(*reconciler.ground_truth().pins.lock().unwrap(), HashSet::from([42]));
}

#[tokio::test]
async fn one_bad_stream_does_not_hide_the_rest() {
    let (mut ledger, source) = consistent_world();
    ledger.flows.insert(
        (TOKEN, ALICE, BOB),
        FlowState {
            updated_at_timestamp: 1_000,
            flow_rate: 90,
        },
    );
    let reconciler = Reconciler::new(ledger, source, config());

    let report = reconciler.run(None).await.unwrap();

    assert!(!report.passed());
    assert_eq!(report.mismatches.len(), 1);
    let mismatch = &report.mismatches[0];
    assert_eq!(mismatch.entity, alice_to_bob().id());
    assert_eq!(mismatch.field, "currentFlowRate");
    assert_eq!(mismatch.expected, "90");
    assert_eq!(mismatch.actual, "100");
    assert_eq!(report.kind(Stream::KIND).unwrap().checked, 2);
    assert_eq!(report.kind(AccountTokenSnapshot::KIND).unwrap().checked, 3);
}

#[tokio::test]
async fn unreachable_entity_is_recorded_with_its_chunk() {
    let (mut ledger, source) = consistent_world();
    ledger.unreachable_flows.insert((CAROL, BOB));
    let reconciler = Reconciler::new(
        ledger,
        source,
        ReconcilerConfig {
            chunk_size: 1,
            ..config()
        },
    );

    let report = reconciler.run(None).await.unwrap();

    let mut ids = vec![alice_to_bob().id(), carol_to_bob().id()];
    ids.sort();
    let position = ids.iter().position(|id| *id == carol_to_bob().id()).unwrap();

    assert!(!report.passed());
    assert!(report.mismatches.is_empty());
    assert_eq!(report.transport_failures.len(), 1);
    let failure = &report.transport_failures[0];
    assert_eq!(failure.kind, Stream::KIND);
    assert_eq!(failure.entity.as_deref(), Some(carol_to_bob().id().as_str()));
    assert_eq!(failure.chunk, Some(position));
    assert_eq!(report.kind(Stream::KIND).unwrap().checked, 1);
    assert_eq!(report.kind(IndexSubscription::KIND).unwrap().checked, 2);
}

#[tokio::test]
async fn unreachable_ledger_reads_do_not_fake_invariant_violations() {
    let (mut ledger, source) = consistent_world();
    ledger.unreachable_net_flows.insert(ALICE);
    ledger.unreachable_subscriptions.insert(CAROL);
    let reconciler = Reconciler::new(ledger, source, config());

    let report = reconciler.run(None).await.unwrap();

    assert!(!report.passed());
    assert!(report.mismatches.is_empty(), "{:#?}", report.mismatches);
    assert!(report.invariant_violations.is_empty(), "{:#?}", report.invariant_violations);
    let mut failed: Vec<_> = report.transport_failures.iter().map(|f| f.kind.as_str()).collect();
    failed.sort();
    let mut expected = vec![AccountTokenSnapshot::KIND, IndexSubscription::KIND];
    expected.sort();
    assert_eq!(failed, expected);
    assert_eq!(report.kind(AccountTokenSnapshot::KIND).unwrap().checked, 2);
    assert_eq!(report.kind(IndexSubscription::KIND).unwrap().checked, 1);
}

#[tokio::test]
async fn aum_check_waits_for_every_realtime_balance() {
    use alloy_primitives::I256;

    let (mut ledger, source) = consistent_world();
    // Balances sum to exactly the 5 tokens held; Carol's critical balance offsets Bob's.
    ledger
        .realtime
        .insert((TOKEN, ALICE), I256::try_from(5_000_000_000_000_000_000i128).unwrap());
    ledger.realtime.insert((TOKEN, CAROL), I256::try_from(-100_000i64).unwrap());
    ledger.unreachable_net_flows.insert(CAROL);
    let options = CheckOptions {
        check_realtime_balance: false,
        check_aum_covers_balances: true,
    };
    let reconciler = Reconciler::new(ledger, source, ReconcilerConfig { options, ..config() });

    let report = reconciler.run(None).await.unwrap();

    assert_eq!(report.transport_failures.len(), 1);
    assert!(report.invariant_violations.is_empty(), "{:#?}", report.invariant_violations);
}

#[tokio::test]
async fn missing_subscription_breaks_the_units_invariant() {
    let (ledger, mut source) = consistent_world();
    source.remove::<IndexSubscription>(&subscription(CAROL, false, 4, 5).id);
    let reconciler = Reconciler::new(ledger, source, config());

    let report = reconciler.run(None).await.unwrap();

    assert!(report.mismatches.is_empty(), "{:#?}", report.mismatches);
    assert_eq!(report.invariant_violations.len(), 1);
    let violation = &report.invariant_violations[0];
    assert_eq!(violation.invariant, invariants::UNITS);
    assert_eq!(violation.subject, index_id());
    assert_eq!(violation.expected, "14");
    assert_eq!(violation.actual, "10");
}

#[tokio::test]
async fn one_sided_flow_breaks_net_flow_invariant() {
    let (mut ledger, mut source) = consistent_world();
    source.replace(&snapshot(ALICE, 1_000_000, -90));
    ledger.net_flows.insert((TOKEN, ALICE), -90);
    let reconciler = Reconciler::new(ledger, source, config());

    let report = reconciler.run(None).await.unwrap();

    assert!(report.mismatches.is_empty());
    assert_eq!(report.invariant_violations.len(), 1);
    assert_eq!(report.invariant_violations[0].invariant, invariants::NET_FLOW);
    assert_eq!(report.invariant_violations[0].actual, "10");
}

#[tokio::test]
async fn underlying_shortfall_breaks_supply_invariant() {
    let (mut ledger, source) = consistent_world();
    ledger.balances.insert((UNDERLYING, TOKEN), U256::from(4_000_000u64));
    let reconciler = Reconciler::new(ledger, source, config());

    let report = reconciler.run(None).await.unwrap();

    assert!(report.mismatches.is_empty());
    assert_eq!(report.invariant_violations.len(), 1);
    assert_eq!(report.invariant_violations[0].invariant, invariants::SUPPLY);
    assert_eq!(report.invariant_violations[0].actual, "4000000000000000000");
}

#[tokio::test]
async fn realtime_balance_check_runs_when_enabled() {
    let (ledger, source) = consistent_world();
    let options = CheckOptions {
        check_realtime_balance: true,
        check_aum_covers_balances: true,
    };
    let reconciler = Reconciler::new(ledger, source, ReconcilerConfig { options, ..config() });

    let report = reconciler.run(None).await.unwrap();

    assert!(report.passed(), "{report:#?}");
    assert!(report.skipped_checks.is_empty());
}

#[tokio::test]
async fn realtime_balance_disagreement_is_a_mismatch() {
    let (mut ledger, source) = consistent_world();
    ledger
        .realtime
        .insert((TOKEN, BOB), alloy_primitives::I256::try_from(100_001i64).unwrap());
    let options = CheckOptions {
        check_realtime_balance: true,
        check_aum_covers_balances: false,
    };
    let reconciler = Reconciler::new(ledger, source, ReconcilerConfig { options, ..config() });

    let report = reconciler.run(None).await.unwrap();

    assert_eq!(report.mismatches.len(), 1);
    assert_eq!(report.mismatches[0].field, "realtimeBalance");
    assert_eq!(report.mismatches[0].expected, "100001");
    assert_eq!(report.mismatches[0].actual, "100000");
}

#[tokio::test]
async fn wrong_network_aborts_before_any_check() {
    let (mut ledger, source) = consistent_world();
    ledger.chain_id = 1;
    let reconciler = Reconciler::new(ledger, source, config());

    let err = reconciler.run(None).await.unwrap_err();

    assert!(matches!(
        err,
        ReconcileError::UnsupportedNetwork {
            expected: 137,
            actual: 1
        }
    ));
    assert!(reconciler.source().pins().is_empty());
}

#[tokio::test]
async fn unreadable_pin_block_aborts_the_pass() {
    let (ledger, source) = consistent_world();
    let reconciler = Reconciler::new(ledger, source, config());

    let err = reconciler.run(Some(999)).await.unwrap_err();

    assert!(matches!(err, ReconcileError::PinBlock { block: 999, .. }));
    assert!(reconciler.source().pins().is_empty());
}

#[tokio::test]
async fn failed_kind_fetch_is_recorded_without_aborting() {
    let (ledger, mut source) = consistent_world();
    source.failing_kind = Some(flowlens_storage::models::Index::KIND);
    let reconciler = Reconciler::new(ledger, source, config());

    let report = reconciler.run(None).await.unwrap();

    assert!(!report.passed());
    let failure = report
        .transport_failures
        .iter()
        .find(|f| f.kind == flowlens_storage::models::Index::KIND)
        .unwrap();
    assert_eq!(failure.entity, None);
    assert!(
        report
            .invariant_violations
            .iter()
            .all(|v| v.invariant != invariants::UNITS)
    );
    assert_eq!(report.kind(Stream::KIND).unwrap().checked, 2);
}

#[tokio::test]
async fn unscalable_underlying_is_a_statistic_mismatch() {
    let (mut ledger, mut source) = consistent_world();
    source.replace(&Token {
        id: format!("{TOKEN:#x}"),
        name: "Super Dollar".into(),
        symbol: "USDx".into(),
        underlying_address: Some(format!("{UNDERLYING:#x}")),
        underlying_decimals: Some(0),
        created_at_block: 1,
        created_at_tx: "0x01".into(),
    });
    ledger.balances.insert((UNDERLYING, TOKEN), U256::MAX);
    let reconciler = Reconciler::new(ledger, source, config());

    let report = reconciler.run(None).await.unwrap();

    assert!(report.transport_failures.is_empty(), "{:#?}", report.transport_failures);
    assert_eq!(report.mismatches.len(), 1);
    let mismatch = &report.mismatches[0];
    assert_eq!(mismatch.kind, TokenStatistic::KIND);
    assert_eq!(mismatch.field, "assetsUnderManagement");
    assert_eq!(report.kind(TokenStatistic::KIND).unwrap().checked, 1);
}

#[tokio::test]
async fn unaccruable_distributions_are_flagged_instead_of_assumed_zero() {
    let (ledger, mut source) = consistent_world();
    // Carol's checkpoint sits above the index value of 8.
    source.replace(&subscription(CAROL, false, 4, 9));
    let options = CheckOptions {
        check_realtime_balance: true,
        check_aum_covers_balances: false,
    };
    let reconciler = Reconciler::new(ledger, source, ReconcilerConfig { options, ..config() });

    let report = reconciler.run(None).await.unwrap();

    let carol = AccountTokenSnapshot::id_for(&CAROL, &TOKEN);
    let on_carol: Vec<_> = report.mismatches.iter().filter(|m| m.entity == carol).collect();
    assert_eq!(on_carol.len(), 1, "{:#?}", report.mismatches);
    assert_eq!(on_carol[0].field, "receivedSinceCheckpoint");
    assert!(report.mismatches.iter().all(|m| m.field != "realtimeBalance"));
    assert!(
        report
            .mismatches
            .iter()
            .any(|m| m.kind == IndexSubscription::KIND && m.field == "indexValueUntilUpdatedAt")
    );
}
