//! Payout and treasury controller.
//!
//! Payout lifecycle: `pending → approved → processing → {completed |
//! failed}`, with `cancelled` from pending/approved, `quarantined` from any
//! pre-terminal state for manual review, and quarantine resolving back to
//! pending or cancelled. A payout request holds its gross amount through a
//! ledger reservation, so the funds cannot be double-spent while the
//! request is in flight: completion finalizes the hold, failure and
//! cancellation release it.
//!
//! The treasury singleton is mutated only through optimistic
//! compare-and-swap on its version column, retried a bounded number of
//! times. Debits keep `reserve_balance ≥ Σ open receivable balances`.

use crate::core::broker::DbBroker;
use crate::core::config::LedgerConfig;
use crate::core::db;
use crate::core::error;
use crate::core::money::{self, Micro};
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::clawback;
use crate::plugins::ledger;
use crate::plugins::outbox::{self, NewEvent};
use clap::{Parser, Subcommand, ValueEnum};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub const PAYOUT_PENDING: &str = "pending";
pub const PAYOUT_APPROVED: &str = "approved";
pub const PAYOUT_PROCESSING: &str = "processing";
pub const PAYOUT_COMPLETED: &str = "completed";
pub const PAYOUT_FAILED: &str = "failed";
pub const PAYOUT_CANCELLED: &str = "cancelled";
pub const PAYOUT_QUARANTINED: &str = "quarantined";

fn transition_allowed(prev: &str, next: &str) -> bool {
    matches!(
        (prev, next),
        ("pending", "approved")
            | ("pending", "cancelled")
            | ("pending", "quarantined")
            | ("approved", "processing")
            | ("approved", "cancelled")
            | ("approved", "quarantined")
            | ("processing", "completed")
            | ("processing", "failed")
            | ("processing", "quarantined")
            | ("quarantined", "pending")
            | ("quarantined", "cancelled")
    )
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PayoutRequest {
    pub id: String,
    pub account_id: String,
    pub amount_micro: Micro,
    pub fee_micro: Micro,
    pub net_micro: Micro,
    pub status: String,
    pub idempotency_key: String,
    pub reservation_id: String,
    pub failure_reason: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PayoutOutcome {
    pub payout: PayoutRequest,
    pub created: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TreasuryState {
    pub version: i64,
    pub reserve_balance_micro: Micro,
    pub updated_at: String,
}

const PAYOUT_COLUMNS: &str = "id, account_id, amount_micro, fee_micro, net_micro, status, idempotency_key, reservation_id, failure_reason, created_at, updated_at";

fn map_payout_row(row: &rusqlite::Row) -> rusqlite::Result<PayoutRequest> {
    Ok(PayoutRequest {
        id: row.get(0)?,
        account_id: row.get(1)?,
        amount_micro: row.get(2)?,
        fee_micro: row.get(3)?,
        net_micro: row.get(4)?,
        status: row.get(5)?,
        idempotency_key: row.get(6)?,
        reservation_id: row.get(7)?,
        failure_reason: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn get_payout_txn(conn: &Connection, payout_id: &str) -> Result<PayoutRequest, error::TidepoolError> {
    conn.query_row(
        &format!("SELECT {} FROM payout_requests WHERE id = ?1", PAYOUT_COLUMNS),
        params![payout_id],
        map_payout_row,
    )
    .optional()?
    .ok_or_else(|| error::TidepoolError::NotFound(format!("payout {}", payout_id)))
}

fn read_treasury_txn(conn: &Connection) -> Result<TreasuryState, error::TidepoolError> {
    conn.query_row(
        "SELECT version, reserve_balance_micro, updated_at FROM treasury_state WHERE id = 1",
        [],
        |row| {
            Ok(TreasuryState {
                version: row.get(0)?,
                reserve_balance_micro: row.get(1)?,
                updated_at: row.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| error::TidepoolError::NotFound("treasury singleton".to_string()))
}

/// Version-checked treasury write. `changes() == 0` means another writer
/// bumped the version after our read; surfaced as ConcurrencyError so the
/// caller's bounded retry re-runs the whole read-modify-write.
fn treasury_apply_txn(
    conn: &Connection,
    expected: &TreasuryState,
    new_balance_micro: Micro,
) -> Result<TreasuryState, error::TidepoolError> {
    if new_balance_micro < 0 {
        return Err(error::TidepoolError::InsufficientBalance(format!(
            "treasury reserve cannot go negative (attempted {})",
            new_balance_micro
        )));
    }
    let open_receivables = clawback::open_receivables_sum_txn(conn)?;
    if new_balance_micro < open_receivables {
        return Err(error::TidepoolError::InsufficientBalance(format!(
            "treasury reserve {} would drop below open receivables {}",
            new_balance_micro, open_receivables
        )));
    }
    let now = time::now_epoch_z();
    let changed = conn.execute(
        "UPDATE treasury_state SET version = version + 1, reserve_balance_micro = ?1, updated_at = ?2
         WHERE id = 1 AND version = ?3",
        params![new_balance_micro, now, expected.version],
    )?;
    if changed == 0 {
        return Err(error::TidepoolError::ConcurrencyError(format!(
            "treasury version {} is stale",
            expected.version
        )));
    }
    Ok(TreasuryState {
        version: expected.version + 1,
        reserve_balance_micro: new_balance_micro,
        updated_at: now,
    })
}

/// Run a treasury-affecting transaction with bounded CAS retry.
fn with_treasury_retry<F>(
    store: &Store,
    config: &LedgerConfig,
    actor: &str,
    op_name: &str,
    f: F,
) -> Result<TreasuryState, error::TidepoolError>
where
    F: Fn(&Connection) -> Result<TreasuryState, error::TidepoolError>,
{
    let broker = DbBroker::new(&store.root);
    let db_path = db::ledger_db_path(&store.root);
    let mut attempt = 0;
    loop {
        match broker.with_txn(&db_path, actor, None, op_name, |txn| f(txn)) {
            Err(e) if e.is_retryable() && attempt + 1 < config.treasury_cas_attempts => {
                attempt += 1;
            }
            other => return other,
        }
    }
}

pub fn treasury_state(store: &Store) -> Result<TreasuryState, error::TidepoolError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::ledger_db_path(&store.root);
    broker.with_conn(&db_path, "tidepool", None, "treasury.state", |conn| {
        read_treasury_txn(conn)
    })
}

/// Add to the external reserve (settlement proceeds, float top-ups).
pub fn credit_reserve(
    store: &Store,
    config: &LedgerConfig,
    amount_micro: Micro,
    actor: &str,
) -> Result<TreasuryState, error::TidepoolError> {
    money::require_positive(amount_micro, "treasury credit")?;
    with_treasury_retry(store, config, actor, "treasury.credit", |conn| {
        let current = read_treasury_txn(conn)?;
        let new_balance = money::checked_add(current.reserve_balance_micro, amount_micro)?;
        treasury_apply_txn(conn, &current, new_balance)
    })
}

/// Remove from the external reserve. Fails rather than breach the
/// receivable floor.
pub fn debit_reserve(
    store: &Store,
    config: &LedgerConfig,
    amount_micro: Micro,
    actor: &str,
) -> Result<TreasuryState, error::TidepoolError> {
    money::require_positive(amount_micro, "treasury debit")?;
    with_treasury_retry(store, config, actor, "treasury.debit", |conn| {
        let current = read_treasury_txn(conn)?;
        let new_balance = money::checked_sub(current.reserve_balance_micro, amount_micro)?;
        treasury_apply_txn(conn, &current, new_balance)
    })
}

/// Create a payout request, holding the gross amount via a reservation.
///
/// Idempotent on the caller's key: a repeated request returns the existing
/// payout with `created = false`.
pub fn request_payout(
    store: &Store,
    config: &LedgerConfig,
    account_id: &str,
    amount_micro: Micro,
    idempotency_key: &str,
    actor: &str,
) -> Result<PayoutOutcome, error::TidepoolError> {
    money::require_positive(amount_micro, "payout amount")?;
    if idempotency_key.trim().is_empty() {
        return Err(error::TidepoolError::ValidationError(
            "idempotency key must not be empty".to_string(),
        ));
    }
    let fee_micro = money::bps_share(amount_micro, config.payout_fee_bps)?;
    let net_micro = money::checked_sub(amount_micro, fee_micro)?;
    if net_micro <= 0 {
        return Err(error::TidepoolError::ValidationError(format!(
            "payout of {} micro nets {} after the {} bps fee",
            amount_micro, net_micro, config.payout_fee_bps
        )));
    }

    let broker = DbBroker::new(&store.root);
    let db_path = db::ledger_db_path(&store.root);
    broker.with_txn(&db_path, actor, None, "payout.request", |txn| {
        if let Some(existing) = txn
            .query_row(
                &format!(
                    "SELECT {} FROM payout_requests WHERE idempotency_key = ?1",
                    PAYOUT_COLUMNS
                ),
                params![idempotency_key],
                map_payout_row,
            )
            .optional()?
        {
            return Ok(PayoutOutcome {
                payout: existing,
                created: false,
            });
        }

        let hold = ledger::reserve_txn(
            txn,
            account_id,
            amount_micro,
            &format!("payout:{}", idempotency_key),
        )?;

        let now = time::now_epoch_z();
        let payout = PayoutRequest {
            id: Ulid::new().to_string(),
            account_id: account_id.to_string(),
            amount_micro,
            fee_micro,
            net_micro,
            status: PAYOUT_PENDING.to_string(),
            idempotency_key: idempotency_key.to_string(),
            reservation_id: hold.reservation.id.clone(),
            failure_reason: None,
            created_at: now.clone(),
            updated_at: now,
        };
        txn.execute(
            "INSERT INTO payout_requests(id, account_id, amount_micro, fee_micro, net_micro, status, idempotency_key, reservation_id, failure_reason, created_at, updated_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, ?9, ?10)",
            params![
                payout.id,
                payout.account_id,
                payout.amount_micro,
                payout.fee_micro,
                payout.net_micro,
                payout.status,
                payout.idempotency_key,
                payout.reservation_id,
                payout.created_at,
                payout.updated_at
            ],
        )?;
        outbox::emit_in_txn(
            txn,
            &NewEvent {
                event_type: "payout.requested".to_string(),
                entity_type: "payout".to_string(),
                entity_id: payout.id.clone(),
                correlation_id: None,
                idempotency_key: format!("payout-requested:{}", idempotency_key),
                payload: serde_json::json!({
                    "account_id": account_id,
                    "amount_micro": amount_micro,
                    "fee_micro": fee_micro,
                    "net_micro": net_micro,
                }),
            },
        )?;
        Ok(PayoutOutcome {
            payout,
            created: true,
        })
    })
}

/// Conditional status transition; the `WHERE status = prev` predicate keeps
/// a concurrently transitioned payout from being clobbered.
fn transition_payout_txn(
    conn: &Connection,
    payout_id: &str,
    prev: &str,
    next: &str,
    failure_reason: Option<&str>,
) -> Result<PayoutRequest, error::TidepoolError> {
    let changed = conn.execute(
        "UPDATE payout_requests SET status = ?1, failure_reason = COALESCE(?2, failure_reason), updated_at = ?3
         WHERE id = ?4 AND status = ?5",
        params![next, failure_reason, time::now_epoch_z(), payout_id, prev],
    )?;
    if changed == 0 {
        return Err(error::TidepoolError::ConcurrencyError(format!(
            "payout {} left {} concurrently",
            payout_id, prev
        )));
    }
    get_payout_txn(conn, payout_id)
}

fn simple_transition(
    store: &Store,
    payout_id: &str,
    next: &str,
    failure_reason: Option<&str>,
    actor: &str,
    op_name: &str,
    release_hold: bool,
) -> Result<PayoutRequest, error::TidepoolError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::ledger_db_path(&store.root);
    broker.with_txn(&db_path, actor, None, op_name, |txn| {
        let payout = get_payout_txn(txn, payout_id)?;
        if !transition_allowed(&payout.status, next) {
            return Err(error::TidepoolError::StateError(format!(
                "payout {} cannot go {} -> {}",
                payout_id, payout.status, next
            )));
        }
        let updated = transition_payout_txn(txn, payout_id, &payout.status, next, failure_reason)?;
        if release_hold {
            ledger::release_txn(txn, &payout.reservation_id)?;
        }
        outbox::emit_in_txn(
            txn,
            &NewEvent {
                event_type: format!("payout.{}", next),
                entity_type: "payout".to_string(),
                entity_id: payout_id.to_string(),
                correlation_id: None,
                idempotency_key: format!("payout-{}:{}", next, payout_id),
                payload: serde_json::json!({ "account_id": updated.account_id }),
            },
        )?;
        Ok(updated)
    })
}

pub fn approve_payout(
    store: &Store,
    payout_id: &str,
    actor: &str,
) -> Result<PayoutRequest, error::TidepoolError> {
    simple_transition(store, payout_id, PAYOUT_APPROVED, None, actor, "payout.approve", false)
}

pub fn begin_processing(
    store: &Store,
    payout_id: &str,
    actor: &str,
) -> Result<PayoutRequest, error::TidepoolError> {
    simple_transition(store, payout_id, PAYOUT_PROCESSING, None, actor, "payout.process", false)
}

/// Complete a processing payout: finalize the hold at the gross amount,
/// record the net external drain, and debit the treasury reserve — one
/// transaction, version-checked, retried on CAS loss.
pub fn complete_payout(
    store: &Store,
    config: &LedgerConfig,
    payout_id: &str,
    actor: &str,
) -> Result<PayoutRequest, error::TidepoolError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::ledger_db_path(&store.root);
    let mut attempt = 0;
    loop {
        let result = broker.with_txn(&db_path, actor, None, "payout.complete", |txn| {
            let payout = get_payout_txn(txn, payout_id)?;
            if !transition_allowed(&payout.status, PAYOUT_COMPLETED) {
                return Err(error::TidepoolError::StateError(format!(
                    "payout {} cannot go {} -> completed",
                    payout_id, payout.status
                )));
            }
            let updated =
                transition_payout_txn(txn, payout_id, &payout.status, PAYOUT_COMPLETED, None)?;

            ledger::finalize_txn(txn, &payout.reservation_id, payout.amount_micro)?;
            ledger::insert_entry_txn(
                txn,
                &payout.account_id,
                "payout",
                payout.net_micro,
                Some(&payout.reservation_id),
                None,
                Some(&payout.id),
                "",
            )?;

            let current = read_treasury_txn(txn)?;
            let new_balance =
                money::checked_sub(current.reserve_balance_micro, payout.net_micro)?;
            treasury_apply_txn(txn, &current, new_balance)?;

            outbox::emit_in_txn(
                txn,
                &NewEvent {
                    event_type: "payout.completed".to_string(),
                    entity_type: "payout".to_string(),
                    entity_id: payout_id.to_string(),
                    correlation_id: None,
                    idempotency_key: format!("payout-completed:{}", payout_id),
                    payload: serde_json::json!({
                        "account_id": payout.account_id,
                        "net_micro": payout.net_micro,
                    }),
                },
            )?;
            Ok(updated)
        });
        match result {
            Err(e) if e.is_retryable() && attempt + 1 < config.treasury_cas_attempts => {
                attempt += 1;
            }
            other => return other,
        }
    }
}

pub fn fail_payout(
    store: &Store,
    payout_id: &str,
    reason: &str,
    actor: &str,
) -> Result<PayoutRequest, error::TidepoolError> {
    simple_transition(
        store,
        payout_id,
        PAYOUT_FAILED,
        Some(reason),
        actor,
        "payout.fail",
        true,
    )
}

pub fn cancel_payout(
    store: &Store,
    payout_id: &str,
    actor: &str,
) -> Result<PayoutRequest, error::TidepoolError> {
    simple_transition(store, payout_id, PAYOUT_CANCELLED, None, actor, "payout.cancel", true)
}

/// Park a payout for manual review. The hold stays in place.
pub fn quarantine_payout(
    store: &Store,
    payout_id: &str,
    reason: &str,
    actor: &str,
) -> Result<PayoutRequest, error::TidepoolError> {
    simple_transition(
        store,
        payout_id,
        PAYOUT_QUARANTINED,
        Some(reason),
        actor,
        "payout.quarantine",
        false,
    )
}

/// Resolve a quarantine back to pending (review passed).
pub fn release_quarantine(
    store: &Store,
    payout_id: &str,
    actor: &str,
) -> Result<PayoutRequest, error::TidepoolError> {
    simple_transition(store, payout_id, PAYOUT_PENDING, None, actor, "payout.unquarantine", false)
}

pub fn get_payout(store: &Store, payout_id: &str) -> Result<PayoutRequest, error::TidepoolError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::ledger_db_path(&store.root);
    broker.with_conn(&db_path, "tidepool", None, "payout.get", |conn| {
        get_payout_txn(conn, payout_id)
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
#[clap(name = "treasury", about = "Payout lifecycle and treasury reserve.")]
pub struct TreasuryCli {
    #[clap(long, global = true, value_enum, default_value = "text")]
    format: OutputFormat,
    #[clap(subcommand)]
    command: TreasuryCommand,
}

#[derive(Subcommand, Debug)]
pub enum TreasuryCommand {
    /// Request a payout (idempotent on --key).
    Request {
        #[clap(long)]
        account: String,
        #[clap(long)]
        amount: i64,
        #[clap(long)]
        key: String,
    },
    /// Approve a pending payout.
    Approve {
        #[clap(long)]
        id: String,
    },
    /// Mark an approved payout as processing.
    Process {
        #[clap(long)]
        id: String,
    },
    /// Complete a processing payout (drains the reserve).
    Complete {
        #[clap(long)]
        id: String,
    },
    /// Fail a processing payout (restores the hold).
    Fail {
        #[clap(long)]
        id: String,
        #[clap(long, default_value = "")]
        reason: String,
    },
    /// Cancel a pending/approved payout.
    Cancel {
        #[clap(long)]
        id: String,
    },
    /// Quarantine a payout for manual review.
    Quarantine {
        #[clap(long)]
        id: String,
        #[clap(long, default_value = "")]
        reason: String,
    },
    /// Show a payout.
    Show {
        #[clap(long)]
        id: String,
    },
    /// Show treasury reserve state.
    State,
    /// Credit the treasury reserve.
    Credit {
        #[clap(long)]
        amount: i64,
    },
    /// Debit the treasury reserve.
    Debit {
        #[clap(long)]
        amount: i64,
    },
}

pub fn run_treasury_cli(
    store: &Store,
    config: &LedgerConfig,
    cli: TreasuryCli,
) -> Result<(), error::TidepoolError> {
    let json = cli.format == OutputFormat::Json;
    match cli.command {
        TreasuryCommand::Request {
            account,
            amount,
            key,
        } => {
            let outcome = request_payout(store, config, &account, amount, &key, "operator")?;
            if json {
                println!(
                    "{}",
                    time::command_envelope(
                        "treasury.request",
                        "ok",
                        serde_json::json!({ "payout": outcome.payout, "created": outcome.created })
                    )
                );
            } else if outcome.created {
                println!(
                    "Payout {} requested: {} micro gross, {} net",
                    outcome.payout.id, outcome.payout.amount_micro, outcome.payout.net_micro
                );
            } else {
                println!("Payout already requested: {}", outcome.payout.id);
            }
        }
        TreasuryCommand::Approve { id } => {
            print_payout(json, "treasury.approve", &approve_payout(store, &id, "operator")?);
        }
        TreasuryCommand::Process { id } => {
            print_payout(json, "treasury.process", &begin_processing(store, &id, "operator")?);
        }
        TreasuryCommand::Complete { id } => {
            print_payout(
                json,
                "treasury.complete",
                &complete_payout(store, config, &id, "operator")?,
            );
        }
        TreasuryCommand::Fail { id, reason } => {
            print_payout(json, "treasury.fail", &fail_payout(store, &id, &reason, "operator")?);
        }
        TreasuryCommand::Cancel { id } => {
            print_payout(json, "treasury.cancel", &cancel_payout(store, &id, "operator")?);
        }
        TreasuryCommand::Quarantine { id, reason } => {
            print_payout(
                json,
                "treasury.quarantine",
                &quarantine_payout(store, &id, &reason, "operator")?,
            );
        }
        TreasuryCommand::Show { id } => {
            print_payout(json, "treasury.show", &get_payout(store, &id)?);
        }
        TreasuryCommand::State => {
            let state = treasury_state(store)?;
            if json {
                println!(
                    "{}",
                    time::command_envelope(
                        "treasury.state",
                        "ok",
                        serde_json::json!({ "treasury": state })
                    )
                );
            } else {
                println!(
                    "Treasury reserve {} micro (version {})",
                    state.reserve_balance_micro, state.version
                );
            }
        }
        TreasuryCommand::Credit { amount } => {
            let state = credit_reserve(store, config, amount, "operator")?;
            println!(
                "Reserve now {} micro (version {})",
                state.reserve_balance_micro, state.version
            );
        }
        TreasuryCommand::Debit { amount } => {
            let state = debit_reserve(store, config, amount, "operator")?;
            println!(
                "Reserve now {} micro (version {})",
                state.reserve_balance_micro, state.version
            );
        }
    }
    Ok(())
}

fn print_payout(json: bool, cmd: &str, payout: &PayoutRequest) {
    if json {
        println!(
            "{}",
            time::command_envelope(cmd, "ok", serde_json::json!({ "payout": payout }))
        );
    } else {
        println!(
            "Payout {} [{}] gross {} / fee {} / net {} micro",
            payout.id, payout.status, payout.amount_micro, payout.fee_micro, payout.net_micro
        );
    }
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "payout",
        "version": "0.1.0",
        "description": "Payout lifecycle and versioned treasury reserve",
        "commands": [
            { "name": "request", "description": "Request a payout (idempotent)" },
            { "name": "approve", "description": "Approve a pending payout" },
            { "name": "process", "description": "Begin external processing" },
            { "name": "complete", "description": "Complete and drain reserve" },
            { "name": "fail", "description": "Fail and restore the hold" },
            { "name": "cancel", "description": "Cancel and restore the hold" },
            { "name": "quarantine", "description": "Park for manual review" },
            { "name": "state", "description": "Show treasury reserve" }
        ],
        "storage": ["ledger.db"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        assert!(transition_allowed("pending", "approved"));
        assert!(transition_allowed("processing", "completed"));
        assert!(transition_allowed("processing", "quarantined"));
        assert!(transition_allowed("quarantined", "pending"));
        assert!(!transition_allowed("completed", "pending"));
        assert!(!transition_allowed("pending", "completed"));
        assert!(!transition_allowed("failed", "processing"));
        assert!(!transition_allowed("cancelled", "approved"));
    }
}
