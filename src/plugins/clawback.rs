//! Clawback and receivable tracking.
//!
//! A reversal (refund, admin clawback) takes back what the account still
//! has — newest lots first — and books the unrecoverable remainder as a
//! receivable: an IOU against the account's future earnings. Conservation
//! holds for every clawback: `applied + receivable_created == original`.
//! A receivable's balance only decreases, and `resolved_at` is stamped at
//! the moment it reaches zero, never before and never unset.

use crate::core::broker::DbBroker;
use crate::core::db;
use crate::core::error;
use crate::core::money::{self, Micro};
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::ledger;
use crate::plugins::outbox::{self, NewEvent};
use clap::{Parser, Subcommand, ValueEnum};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Receivable {
    pub id: String,
    pub account_id: String,
    pub clawback_id: String,
    pub amount_original_micro: Micro,
    pub balance_micro: Micro,
    pub created_at: String,
    pub resolved_at: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClawbackOutcome {
    pub clawback_id: String,
    pub account_id: String,
    pub amount_original_micro: Micro,
    pub applied_micro: Micro,
    pub receivable: Option<Receivable>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DripOutcome {
    pub account_id: String,
    pub recovered_micro: Micro,
    pub resolved_receivables: Vec<String>,
}

/// Total open receivable debt across all accounts. The treasury reserve
/// floor is checked against this inside treasury transactions.
pub fn open_receivables_sum_txn(conn: &Connection) -> Result<Micro, error::TidepoolError> {
    let sum: i64 = conn.query_row(
        "SELECT COALESCE(SUM(balance_micro), 0) FROM clawback_receivables WHERE resolved_at IS NULL",
        [],
        |row| row.get(0),
    )?;
    Ok(sum)
}

/// Reverse previously granted funds.
///
/// Applies as much as the account's lots still hold (newest first); any
/// shortfall becomes a receivable in the same transaction.
pub fn apply_clawback(
    store: &Store,
    account_id: &str,
    amount_micro: Micro,
    reason: &str,
    actor: &str,
) -> Result<ClawbackOutcome, error::TidepoolError> {
    money::require_positive(amount_micro, "clawback amount")?;

    let broker = DbBroker::new(&store.root);
    let db_path = db::ledger_db_path(&store.root);
    broker.with_txn(&db_path, actor, None, "clawback.apply", |txn| {
        ledger::require_account_txn(txn, account_id)?;
        let clawback_id = Ulid::new().to_string();

        // One entry per lot take, so lot-level conservation stays derivable.
        let (applied, takes) = ledger::draw_down_lifo_txn(txn, account_id, amount_micro)?;
        for (lot_id, take) in &takes {
            ledger::insert_entry_txn(
                txn,
                account_id,
                "clawback",
                *take,
                None,
                Some(lot_id),
                Some(&clawback_id),
                reason,
            )?;
        }

        let shortfall = money::checked_sub(amount_micro, applied)?;
        let receivable = if shortfall > 0 {
            let now = time::now_epoch_z();
            let receivable = Receivable {
                id: Ulid::new().to_string(),
                account_id: account_id.to_string(),
                clawback_id: clawback_id.clone(),
                amount_original_micro: shortfall,
                balance_micro: shortfall,
                created_at: now,
                resolved_at: None,
            };
            txn.execute(
                "INSERT INTO clawback_receivables(id, account_id, clawback_id, amount_original_micro, balance_micro, created_at, resolved_at)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, NULL)",
                params![
                    receivable.id,
                    receivable.account_id,
                    receivable.clawback_id,
                    receivable.amount_original_micro,
                    receivable.balance_micro,
                    receivable.created_at
                ],
            )?;
            Some(receivable)
        } else {
            None
        };

        outbox::emit_in_txn(
            txn,
            &NewEvent {
                event_type: "clawback.applied".to_string(),
                entity_type: "clawback".to_string(),
                entity_id: clawback_id.clone(),
                correlation_id: None,
                idempotency_key: format!("clawback:{}", clawback_id),
                payload: serde_json::json!({
                    "account_id": account_id,
                    "amount_micro": amount_micro,
                    "applied_micro": applied,
                    "shortfall_micro": shortfall,
                    "reason": reason,
                }),
            },
        )?;

        Ok(ClawbackOutcome {
            clawback_id,
            account_id: account_id.to_string(),
            amount_original_micro: amount_micro,
            applied_micro: applied,
            receivable,
        })
    })
}

/// Recover open receivable debt from the account's current balance —
/// earnings that arrived after the clawback. Oldest receivable first;
/// each receivable resolves the moment its balance reaches zero.
pub fn drip_recover(
    store: &Store,
    account_id: &str,
    max_amount_micro: Micro,
    actor: &str,
) -> Result<DripOutcome, error::TidepoolError> {
    money::require_positive(max_amount_micro, "drip amount")?;

    let broker = DbBroker::new(&store.root);
    let db_path = db::ledger_db_path(&store.root);
    broker.with_txn(&db_path, actor, None, "clawback.drip", |txn| {
        ledger::require_account_txn(txn, account_id)?;

        let mut stmt = txn.prepare(
            "SELECT id, balance_micro FROM clawback_receivables
             WHERE account_id = ?1 AND resolved_at IS NULL
             ORDER BY created_at ASC, id ASC",
        )?;
        let open = stmt
            .query_map(params![account_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        let total_debt: Micro = open.iter().map(|(_, balance)| *balance).sum();
        if total_debt == 0 {
            return Ok(DripOutcome {
                account_id: account_id.to_string(),
                recovered_micro: 0,
                resolved_receivables: Vec::new(),
            });
        }

        let target = max_amount_micro.min(total_debt);
        let (recovered, takes) = ledger::draw_down_lifo_txn(txn, account_id, target)?;
        for (lot_id, take) in &takes {
            ledger::insert_entry_txn(
                txn,
                account_id,
                "clawback",
                *take,
                None,
                Some(lot_id),
                None,
                "drip",
            )?;
        }
        if recovered == 0 {
            return Ok(DripOutcome {
                account_id: account_id.to_string(),
                recovered_micro: 0,
                resolved_receivables: Vec::new(),
            });
        }

        let mut remaining = recovered;
        let mut resolved = Vec::new();
        let now = time::now_epoch_z();
        for (receivable_id, balance) in open {
            if remaining == 0 {
                break;
            }
            let pay = balance.min(remaining);
            let new_balance = money::checked_sub(balance, pay)?;
            if new_balance == 0 {
                txn.execute(
                    "UPDATE clawback_receivables SET balance_micro = 0, resolved_at = ?1 WHERE id = ?2",
                    params![now, receivable_id],
                )?;
                resolved.push(receivable_id);
            } else {
                txn.execute(
                    "UPDATE clawback_receivables SET balance_micro = ?1 WHERE id = ?2",
                    params![new_balance, receivable_id],
                )?;
            }
            remaining = money::checked_sub(remaining, pay)?;
        }

        ledger::insert_entry_txn(
            txn,
            account_id,
            "clawback",
            recovered,
            None,
            None,
            None,
            "drip recovery",
        )?;
        outbox::emit_in_txn(
            txn,
            &NewEvent {
                event_type: "clawback.recovered".to_string(),
                entity_type: "account".to_string(),
                entity_id: account_id.to_string(),
                correlation_id: None,
                idempotency_key: format!("drip:{}:{}", account_id, time::new_event_id()),
                payload: serde_json::json!({
                    "account_id": account_id,
                    "recovered_micro": recovered,
                }),
            },
        )?;

        Ok(DripOutcome {
            account_id: account_id.to_string(),
            recovered_micro: recovered,
            resolved_receivables: resolved,
        })
    })
}

pub fn list_receivables(
    store: &Store,
    account_id: Option<&str>,
    open_only: bool,
) -> Result<Vec<Receivable>, error::TidepoolError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::ledger_db_path(&store.root);
    broker.with_conn(&db_path, "tidepool", None, "clawback.receivables", |conn| {
        let mut sql = String::from(
            "SELECT id, account_id, clawback_id, amount_original_micro, balance_micro, created_at, resolved_at
             FROM clawback_receivables WHERE 1=1",
        );
        if account_id.is_some() {
            sql.push_str(" AND account_id = ?1");
        }
        if open_only {
            sql.push_str(" AND resolved_at IS NULL");
        }
        sql.push_str(" ORDER BY created_at ASC, id ASC");

        let mut stmt = conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row| -> rusqlite::Result<Receivable> {
            Ok(Receivable {
                id: row.get(0)?,
                account_id: row.get(1)?,
                clawback_id: row.get(2)?,
                amount_original_micro: row.get(3)?,
                balance_micro: row.get(4)?,
                created_at: row.get(5)?,
                resolved_at: row.get(6)?,
            })
        };
        let rows = match account_id {
            Some(id) => stmt.query_map(params![id], map_row)?.collect::<Result<Vec<_>, _>>()?,
            None => stmt.query_map([], map_row)?.collect::<Result<Vec<_>, _>>()?,
        };
        Ok(rows)
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
#[clap(name = "clawback", about = "Reversals and receivable recovery.")]
pub struct ClawbackCli {
    #[clap(long, global = true, value_enum, default_value = "text")]
    format: OutputFormat,
    #[clap(subcommand)]
    command: ClawbackCommand,
}

#[derive(Subcommand, Debug)]
pub enum ClawbackCommand {
    /// Claw back funds from an account.
    Apply {
        #[clap(long)]
        account: String,
        #[clap(long)]
        amount: i64,
        #[clap(long, default_value = "")]
        reason: String,
    },
    /// Recover open receivables from current balance.
    Drip {
        #[clap(long)]
        account: String,
        #[clap(long)]
        max: i64,
    },
    /// List receivables.
    Receivables {
        #[clap(long)]
        account: Option<String>,
        #[clap(long)]
        open: bool,
    },
}

pub fn run_clawback_cli(store: &Store, cli: ClawbackCli) -> Result<(), error::TidepoolError> {
    let json = cli.format == OutputFormat::Json;
    match cli.command {
        ClawbackCommand::Apply {
            account,
            amount,
            reason,
        } => {
            let outcome = apply_clawback(store, &account, amount, &reason, "operator")?;
            if json {
                println!(
                    "{}",
                    time::command_envelope(
                        "clawback.apply",
                        "ok",
                        serde_json::json!({ "outcome": outcome })
                    )
                );
            } else {
                println!(
                    "Clawback {}: applied {} of {} micro{}",
                    outcome.clawback_id,
                    outcome.applied_micro,
                    outcome.amount_original_micro,
                    match &outcome.receivable {
                        Some(r) => format!(", receivable {} for {} micro", r.id, r.balance_micro),
                        None => String::new(),
                    }
                );
            }
        }
        ClawbackCommand::Drip { account, max } => {
            let outcome = drip_recover(store, &account, max, "operator")?;
            if json {
                println!(
                    "{}",
                    time::command_envelope(
                        "clawback.drip",
                        "ok",
                        serde_json::json!({ "outcome": outcome })
                    )
                );
            } else {
                println!(
                    "Recovered {} micro, resolved {} receivable(s)",
                    outcome.recovered_micro,
                    outcome.resolved_receivables.len()
                );
            }
        }
        ClawbackCommand::Receivables { account, open } => {
            let rows = list_receivables(store, account.as_deref(), open)?;
            if json {
                println!(
                    "{}",
                    time::command_envelope(
                        "clawback.receivables",
                        "ok",
                        serde_json::json!({ "receivables": rows })
                    )
                );
            } else {
                for r in rows {
                    println!(
                        "{} account {} balance {}/{} micro{}",
                        r.id,
                        r.account_id,
                        r.balance_micro,
                        r.amount_original_micro,
                        match &r.resolved_at {
                            Some(ts) => format!(" resolved {}", ts),
                            None => String::new(),
                        }
                    );
                }
            }
        }
    }
    Ok(())
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "clawback",
        "version": "0.1.0",
        "description": "Partial-reversal IOU accounting",
        "commands": [
            { "name": "apply", "description": "Claw back funds" },
            { "name": "drip", "description": "Recover receivables from balance" },
            { "name": "receivables", "description": "List receivables" }
        ],
        "storage": ["ledger.db"]
    })
}
