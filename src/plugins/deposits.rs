//! Deposit and webhook bridge.
//!
//! Inbound money. Payment adapters deliver already-signature-verified
//! webhook results as `PaymentProof`; the on-chain watcher delivers
//! `DepositDetection` records. Both mint a deposit lot exactly once: the
//! external reference is fingerprinted and the lots table carries a unique
//! index on it, so a duplicate delivery reports `duplicate = true` and
//! writes nothing.
//!
//! On-chain deposits are never minted unverified. Verification runs with
//! bounded retry and doubling backoff, and it runs *before* the minting
//! transaction opens — no lock is held across network I/O.

use crate::core::broker::DbBroker;
use crate::core::config::LedgerConfig;
use crate::core::db;
use crate::core::error;
use crate::core::money::{self, Micro};
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::ledger;
use crate::plugins::outbox::{self, NewEvent};
use clap::{Parser, Subcommand, ValueEnum};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Verified payment event, normalized across providers.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PaymentProof {
    pub provider: String,
    pub payment_ref: String,
    pub account_id: String,
    pub amount_micro: Micro,
    pub correlation_id: Option<String>,
}

/// On-chain deposit sighting from the watcher.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DepositDetection {
    pub chain: String,
    pub tx_hash: String,
    pub account_id: String,
    pub amount_micro: Micro,
    pub confirmations: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DepositOutcome {
    pub duplicate: bool,
    pub lot_id: String,
    pub account_id: String,
    pub amount_micro: Micro,
}

/// Provider adapters, selected by configuration. Each knows its own
/// payload shape; nothing downstream inspects provider types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentProvider {
    Paddle,
    NowPayments,
    X402,
}

impl PaymentProvider {
    pub fn from_config(config: &LedgerConfig) -> Result<Self, error::TidepoolError> {
        match config.payment_provider.as_str() {
            "paddle" => Ok(PaymentProvider::Paddle),
            "nowpayments" => Ok(PaymentProvider::NowPayments),
            "x402" => Ok(PaymentProvider::X402),
            other => Err(error::TidepoolError::ConfigError(format!(
                "unknown payment provider '{}'",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PaymentProvider::Paddle => "paddle",
            PaymentProvider::NowPayments => "nowpayments",
            PaymentProvider::X402 => "x402",
        }
    }

    /// Normalize a provider payload (already signature-verified upstream)
    /// into a `PaymentProof`.
    pub fn normalize(&self, payload: &JsonValue) -> Result<PaymentProof, error::TidepoolError> {
        let (ref_field, account_field, amount_field) = match self {
            PaymentProvider::Paddle => ("order_id", "passthrough_account", "amount_micro"),
            PaymentProvider::NowPayments => ("payment_id", "order_description", "amount_micro"),
            PaymentProvider::X402 => ("receipt_id", "payer_account", "amount_micro"),
        };
        let payment_ref = payload
            .get(ref_field)
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                error::TidepoolError::ValidationError(format!(
                    "{} payload missing {}",
                    self.name(),
                    ref_field
                ))
            })?;
        let account_id = payload
            .get(account_field)
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                error::TidepoolError::ValidationError(format!(
                    "{} payload missing {}",
                    self.name(),
                    account_field
                ))
            })?;
        let amount_micro = payload
            .get(amount_field)
            .and_then(|v| v.as_i64())
            .ok_or_else(|| {
                error::TidepoolError::ValidationError(format!(
                    "{} payload missing {}",
                    self.name(),
                    amount_field
                ))
            })?;
        Ok(PaymentProof {
            provider: self.name().to_string(),
            payment_ref: payment_ref.to_string(),
            account_id: account_id.to_string(),
            amount_micro,
            correlation_id: payload
                .get("correlation_id")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
        })
    }
}

/// Confirmation oracle for on-chain deposits. Implementations may hit the
/// network; transient failures surface as Err and are retried by the
/// bridge.
pub trait ChainVerifier {
    fn verify(&self, detection: &DepositDetection) -> Result<bool, error::TidepoolError>;
}

/// Verifier fed by the watcher's own confirmation count. The watcher
/// re-delivers detections as confirmations accrue; the bridge only mints
/// once the threshold is met.
pub struct ConfirmationThreshold {
    pub min_confirmations: u32,
}

impl ChainVerifier for ConfirmationThreshold {
    fn verify(&self, detection: &DepositDetection) -> Result<bool, error::TidepoolError> {
        Ok(detection.confirmations >= self.min_confirmations)
    }
}

pub fn payment_fingerprint(provider: &str, payment_ref: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(provider);
    hasher.update(":");
    hasher.update(payment_ref);
    format!("{:x}", hasher.finalize())
}

/// Process a verified payment webhook. Duplicate delivery of the same
/// payment reference returns the original lot with `duplicate = true`.
pub fn process_webhook(
    store: &Store,
    proof: &PaymentProof,
    actor: &str,
) -> Result<DepositOutcome, error::TidepoolError> {
    money::require_positive(proof.amount_micro, "deposit amount")?;
    let fingerprint = payment_fingerprint(&proof.provider, &proof.payment_ref);
    mint_deposit(store, &proof.account_id, proof.amount_micro, &fingerprint, actor, serde_json::json!({
        "provider": proof.provider,
        "payment_ref": proof.payment_ref,
        "correlation_id": proof.correlation_id,
    }))
}

/// Bridge an on-chain deposit detection into credit.
///
/// Verification is mandatory and retried with doubling backoff on
/// transient errors; an unconfirmed deposit is rejected, never minted.
pub fn bridge_deposit(
    store: &Store,
    config: &LedgerConfig,
    detection: &DepositDetection,
    verifier: &dyn ChainVerifier,
    actor: &str,
) -> Result<DepositOutcome, error::TidepoolError> {
    money::require_positive(detection.amount_micro, "deposit amount")?;

    let mut backoff_ms = config.deposit_backoff_ms;
    let mut last_err: Option<error::TidepoolError> = None;
    let mut confirmed = false;
    for attempt in 0..config.deposit_verify_attempts {
        match verifier.verify(detection) {
            Ok(result) => {
                confirmed = result;
                last_err = None;
                break;
            }
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < config.deposit_verify_attempts {
                    std::thread::sleep(std::time::Duration::from_millis(backoff_ms));
                    backoff_ms = backoff_ms.saturating_mul(2);
                }
            }
        }
    }
    if let Some(e) = last_err {
        return Err(e);
    }
    if !confirmed {
        return Err(error::TidepoolError::ValidationError(format!(
            "deposit {}:{} not confirmed ({} confirmations)",
            detection.chain, detection.tx_hash, detection.confirmations
        )));
    }

    let fingerprint = payment_fingerprint(&detection.chain, &detection.tx_hash);
    mint_deposit(
        store,
        &detection.account_id,
        detection.amount_micro,
        &fingerprint,
        actor,
        serde_json::json!({
            "chain": detection.chain,
            "tx_hash": detection.tx_hash,
            "confirmations": detection.confirmations,
        }),
    )
}

fn mint_deposit(
    store: &Store,
    account_id: &str,
    amount_micro: Micro,
    fingerprint: &str,
    actor: &str,
    payload: JsonValue,
) -> Result<DepositOutcome, error::TidepoolError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::ledger_db_path(&store.root);
    broker.with_txn(&db_path, actor, None, "deposits.mint", |txn| {
        if let Some((lot_id, existing_account, existing_amount)) = txn
            .query_row(
                "SELECT id, account_id, amount_original_micro FROM lots WHERE source_ref = ?1",
                params![fingerprint],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?
        {
            return Ok(DepositOutcome {
                duplicate: true,
                lot_id,
                account_id: existing_account,
                amount_micro: existing_amount,
            });
        }

        let lot = ledger::mint_lot_txn(txn, account_id, "deposit", Some(fingerprint), amount_micro, None)?;
        outbox::emit_in_txn(
            txn,
            &NewEvent {
                event_type: "deposit.credited".to_string(),
                entity_type: "lot".to_string(),
                entity_id: lot.id.clone(),
                correlation_id: None,
                idempotency_key: format!("deposit:{}", fingerprint),
                payload,
            },
        )?;
        Ok(DepositOutcome {
            duplicate: false,
            lot_id: lot.id,
            account_id: account_id.to_string(),
            amount_micro,
        })
    })
}

// ---------------------------------------------------------------------------
// CLI surface
// ---------------------------------------------------------------------------

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[clap(name = "deposit", about = "Verified payment and on-chain credit.")]
pub struct DepositCli {
    #[clap(long, global = true, value_enum, default_value = "text")]
    format: OutputFormat,
    #[clap(subcommand)]
    command: DepositCommand,
}

#[derive(Subcommand, Debug)]
pub enum DepositCommand {
    /// Process a verified payment webhook.
    Webhook {
        #[clap(long)]
        account: String,
        #[clap(long)]
        amount: i64,
        /// Provider payment reference (order id, payment id, receipt id).
        #[clap(long)]
        r#ref: String,
    },
    /// Bridge an on-chain deposit detection.
    Detect {
        #[clap(long)]
        account: String,
        #[clap(long)]
        amount: i64,
        #[clap(long)]
        chain: String,
        #[clap(long)]
        txhash: String,
        #[clap(long, default_value = "0")]
        confirmations: u32,
        #[clap(long, default_value = "3")]
        min_confirmations: u32,
    },
}

pub fn run_deposit_cli(
    store: &Store,
    config: &LedgerConfig,
    cli: DepositCli,
) -> Result<(), error::TidepoolError> {
    let json = cli.format == OutputFormat::Json;
    match cli.command {
        DepositCommand::Webhook {
            account,
            amount,
            r#ref,
        } => {
            let provider = PaymentProvider::from_config(config)?;
            let proof = PaymentProof {
                provider: provider.name().to_string(),
                payment_ref: r#ref,
                account_id: account,
                amount_micro: amount,
                correlation_id: None,
            };
            let outcome = process_webhook(store, &proof, "webhook")?;
            print_outcome(json, "deposit.webhook", &outcome);
        }
        DepositCommand::Detect {
            account,
            amount,
            chain,
            txhash,
            confirmations,
            min_confirmations,
        } => {
            let detection = DepositDetection {
                chain,
                tx_hash: txhash,
                account_id: account,
                amount_micro: amount,
                confirmations,
            };
            let verifier = ConfirmationThreshold { min_confirmations };
            let outcome = bridge_deposit(store, config, &detection, &verifier, "watcher")?;
            print_outcome(json, "deposit.detect", &outcome);
        }
    }
    Ok(())
}

fn print_outcome(json: bool, cmd: &str, outcome: &DepositOutcome) {
    if json {
        println!(
            "{}",
            time::command_envelope(cmd, "ok", serde_json::json!({ "outcome": outcome }))
        );
    } else if outcome.duplicate {
        println!(
            "Duplicate delivery; lot {} already credited {} micro",
            outcome.lot_id, outcome.amount_micro
        );
    } else {
        println!(
            "Credited {} micro to {} (lot {})",
            outcome.amount_micro, outcome.account_id, outcome.lot_id
        );
    }
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "deposits",
        "version": "0.1.0",
        "description": "Verified deposit minting with duplicate suppression",
        "commands": [
            { "name": "webhook", "description": "Process a verified payment webhook" },
            { "name": "detect", "description": "Bridge an on-chain detection" }
        ],
        "storage": ["ledger.db"]
    })
}
