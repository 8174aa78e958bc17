//! Flowlens reconciler: checks the indexed store against the ledger, both read
//! as of one block, and prints the report as JSON.
//!
//! Exits non-zero when anything disagrees or could not be checked.

use std::process::ExitCode;
use std::str::FromStr;

use alloy::primitives::{Address, B256};
use alloy::providers::Provider;
use clap::{Parser, Subcommand};
use eyre::Result;
use flowlens_chain::{Retrying, RpcGroundTruth, create_provider, decode_log};
use flowlens_core::{RetryPolicy, Settings, telemetry};
use flowlens_reconcile::{EventValidator, ExpectedEvent, PgIndexedSource, Reconciler, ReconcilerConfig};

#[derive(Parser, Debug)]
#[command(name = "reconcile")]
#[command(about = "Reconcile indexed streaming-ledger data against on-chain state")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check every indexed entity kind and the aggregate invariants
    Run {
        /// Block to pin both sides to (defaults to PIN_BLOCK, then the indexer cursor)
        #[arg(long)]
        block: Option<u64>,
    },
    /// Check one indexed event against the transaction receipt
    Event {
        /// Transaction hash
        #[arg(long)]
        tx: String,

        /// Event name, e.g. FlowUpdated
        #[arg(long)]
        kind: String,

        /// Block to read the indexed side at (defaults to the transaction's block)
        #[arg(long)]
        block: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    telemetry::init();
    let cli = Cli::parse();
    let settings = Settings::from_env()?;

    let pool = flowlens_storage::connect(&settings.database_url).await?;
    let source = PgIndexedSource::new(pool);
    let provider = create_provider(&settings.rpc_url)?;

    match cli.command {
        Command::Run { block } => {
            let ledger = Retrying::new(
                RpcGroundTruth::new(
                    provider,
                    address("CFA_ADDRESS", &settings.cfa_address)?,
                    address("IDA_ADDRESS", &settings.ida_address)?,
                ),
                RetryPolicy::from_settings(&settings),
            );
            let reconciler = Reconciler::new(ledger, source, ReconcilerConfig::from_settings(&settings));
            let report = reconciler.run(block.or(settings.pin_block)).await?;

            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(if report.passed() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Event { tx, kind, block } => {
            let hash = B256::from_str(&tx).map_err(|e| eyre::eyre!("invalid transaction hash {tx}: {e}"))?;
            let receipt = provider
                .get_transaction_receipt(hash)
                .await?
                .ok_or_else(|| eyre::eyre!("no receipt for transaction {tx}"))?;

            let decoded = receipt
                .inner
                .logs()
                .iter()
                .filter_map(decode_log)
                .find(|e| e.event.name() == kind)
                .ok_or_else(|| eyre::eyre!("transaction {tx} emitted no {kind} event"))?;
            let expected = ExpectedEvent::from_decoded(&decoded);
            let pin = block.unwrap_or(expected.block_number);

            let validator = EventValidator::new(RetryPolicy::from_settings(&settings));
            let mismatches = validator.validate(&source, &expected, pin).await?;
            if mismatches.is_empty() {
                tracing::info!(tx = %tx, kind = %kind, pin, "Event indexed faithfully");
            }

            println!("{}", serde_json::to_string_pretty(&mismatches)?);
            Ok(if mismatches.is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

fn address(name: &str, value: &str) -> Result<Address> {
    Address::from_str(value).map_err(|e| eyre::eyre!("{name} is not an address ({value}): {e}"))
}
