//! Reconciliation checker.
//!
//! Periodic conservation audits over the whole bin. Three independent
//! checks; none of them corrects anything. Divergences are appended to
//! `reconciliation_findings` with full detail and surfaced as alerts —
//! a checker that silently "fixes" money is how money disappears.
//!
//! 1. Lot conservation: remaining + pending holds + finalized consumption
//!    + clawback draw-down == original amount, for every lot.
//! 2. Receivable consistency: open receivable balances reconcile with
//!    ledger-recorded recoveries, and `resolved_at` agrees with balance.
//! 3. Budget consistency: recorded finalizations inside the current window
//!    sum to the stored window spend.

use crate::core::broker::DbBroker;
use crate::core::db;
use crate::core::error;
use crate::core::money::Micro;
use crate::core::store::Store;
use crate::core::time;
use clap::{Parser, ValueEnum};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use ulid::Ulid;

pub const CHECK_LOT_CONSERVATION: &str = "lot_conservation";
pub const CHECK_RECEIVABLE_CONSISTENCY: &str = "receivable_consistency";
pub const CHECK_BUDGET_CONSISTENCY: &str = "budget_consistency";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Finding {
    pub id: String,
    pub check_name: String,
    pub subject_id: String,
    pub detail: serde_json::Value,
    pub created_at: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReconciliationReport {
    pub lots_checked: usize,
    pub receivable_accounts_checked: usize,
    pub budgets_checked: usize,
    pub findings: Vec<Finding>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Run all three checks and append any findings. Read-only with respect to
/// ledger state; only the findings table grows.
pub fn run_reconciliation(store: &Store) -> Result<ReconciliationReport, error::TidepoolError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::ledger_db_path(&store.root);
    broker.with_txn(&db_path, "tidepool", None, "reconcile.run", |txn| {
        let mut findings = Vec::new();

        let lots_checked = check_lot_conservation(txn, &mut findings)?;
        let receivable_accounts_checked = check_receivable_consistency(txn, &mut findings)?;
        let budgets_checked = check_budget_consistency(txn, &mut findings)?;

        for finding in &findings {
            txn.execute(
                "INSERT INTO reconciliation_findings(id, check_name, subject_id, detail, created_at)
                 VALUES(?1, ?2, ?3, ?4, ?5)",
                params![
                    finding.id,
                    finding.check_name,
                    finding.subject_id,
                    serde_json::to_string(&finding.detail).unwrap(),
                    finding.created_at
                ],
            )?;
        }

        Ok(ReconciliationReport {
            lots_checked,
            receivable_accounts_checked,
            budgets_checked,
            findings,
        })
    })
}

fn new_finding(check_name: &str, subject_id: &str, detail: serde_json::Value) -> Finding {
    Finding {
        id: Ulid::new().to_string(),
        check_name: check_name.to_string(),
        subject_id: subject_id.to_string(),
        detail,
        created_at: time::now_epoch_z(),
    }
}

struct ReservationHold {
    lot_id: String,
    hold_micro: Micro,
    lot_created_at: String,
}

fn check_lot_conservation(
    conn: &Connection,
    findings: &mut Vec<Finding>,
) -> Result<usize, error::TidepoolError> {
    // Per-lot pending holds and finalized consumption, reconstructed from
    // reservation records the same way finalize distributes surplus
    // (newest-held lot refunded first).
    let mut stmt = conn.prepare(
        "SELECT r.id, r.status, r.amount_micro, r.finalized_cost_micro, rl.lot_id, rl.amount_micro, l.created_at
         FROM reservations r
         JOIN reservation_lots rl ON rl.reservation_id = r.id
         JOIN lots l ON l.id = rl.lot_id",
    )?;
    struct Row {
        reservation_id: String,
        status: String,
        amount_micro: Micro,
        finalized_cost_micro: Option<Micro>,
        hold: ReservationHold,
    }
    let rows = stmt
        .query_map([], |row| {
            Ok(Row {
                reservation_id: row.get(0)?,
                status: row.get(1)?,
                amount_micro: row.get(2)?,
                finalized_cost_micro: row.get(3)?,
                hold: ReservationHold {
                    lot_id: row.get(4)?,
                    hold_micro: row.get(5)?,
                    lot_created_at: row.get(6)?,
                },
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);

    let mut pending_holds: BTreeMap<String, Micro> = BTreeMap::new();
    let mut consumed: BTreeMap<String, Micro> = BTreeMap::new();

    let mut by_reservation: BTreeMap<String, (String, Micro, Option<Micro>, Vec<ReservationHold>)> =
        BTreeMap::new();
    for row in rows {
        let entry = by_reservation
            .entry(row.reservation_id.clone())
            .or_insert_with(|| {
                (
                    row.status.clone(),
                    row.amount_micro,
                    row.finalized_cost_micro,
                    Vec::new(),
                )
            });
        entry.3.push(row.hold);
    }

    for (_reservation_id, (status, amount, cost, mut holds)) in by_reservation {
        match status.as_str() {
            "pending" => {
                for hold in holds {
                    *pending_holds.entry(hold.lot_id).or_insert(0) += hold.hold_micro;
                }
            }
            "finalized" => {
                let cost = cost.unwrap_or(amount);
                let mut surplus = amount - cost;
                // Surplus flowed back newest lot first; what did not flow
                // back was consumed.
                holds.sort_by(|a, b| {
                    b.lot_created_at
                        .cmp(&a.lot_created_at)
                        .then_with(|| b.lot_id.cmp(&a.lot_id))
                });
                for hold in holds {
                    let returned = hold.hold_micro.min(surplus.max(0));
                    surplus -= returned;
                    let eaten = hold.hold_micro - returned;
                    if eaten > 0 {
                        *consumed.entry(hold.lot_id).or_insert(0) += eaten;
                    }
                }
            }
            _ => {} // released / expired: fully restored
        }
    }

    // Clawback draw-down is recorded per lot in the entries.
    let mut stmt = conn.prepare(
        "SELECT lot_id, COALESCE(SUM(amount_micro), 0) FROM ledger_entries
         WHERE entry_kind = 'clawback' AND lot_id IS NOT NULL GROUP BY lot_id",
    )?;
    let clawed = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);
    let clawed: BTreeMap<String, Micro> = clawed.into_iter().collect();

    let mut stmt = conn.prepare(
        "SELECT id, amount_original_micro, amount_remaining_micro FROM lots",
    )?;
    let lots = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);

    let lots_checked = lots.len();
    for (lot_id, original, remaining) in lots {
        let holds = pending_holds.get(&lot_id).copied().unwrap_or(0);
        let eaten = consumed.get(&lot_id).copied().unwrap_or(0);
        let clawed_micro = clawed.get(&lot_id).copied().unwrap_or(0);
        let accounted = remaining + holds + eaten + clawed_micro;
        if accounted != original {
            findings.push(new_finding(
                CHECK_LOT_CONSERVATION,
                &lot_id,
                serde_json::json!({
                    "amount_original_micro": original,
                    "amount_remaining_micro": remaining,
                    "pending_holds_micro": holds,
                    "finalized_consumption_micro": eaten,
                    "clawback_micro": clawed_micro,
                    "accounted_micro": accounted,
                }),
            ));
        }
    }
    Ok(lots_checked)
}

fn check_receivable_consistency(
    conn: &Connection,
    findings: &mut Vec<Finding>,
) -> Result<usize, error::TidepoolError> {
    let mut stmt = conn.prepare(
        "SELECT id, account_id, amount_original_micro, balance_micro, resolved_at
         FROM clawback_receivables",
    )?;
    struct ReceivableRow {
        id: String,
        account_id: String,
        original: Micro,
        balance: Micro,
        resolved_at: Option<String>,
    }
    let rows = stmt
        .query_map([], |row| {
            Ok(ReceivableRow {
                id: row.get(0)?,
                account_id: row.get(1)?,
                original: row.get(2)?,
                balance: row.get(3)?,
                resolved_at: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);

    let mut per_account: BTreeMap<String, (Micro, Micro)> = BTreeMap::new();
    for row in &rows {
        if row.balance < 0 || row.balance > row.original {
            findings.push(new_finding(
                CHECK_RECEIVABLE_CONSISTENCY,
                &row.id,
                serde_json::json!({
                    "reason": "balance out of range",
                    "balance_micro": row.balance,
                    "amount_original_micro": row.original,
                }),
            ));
        }
        let resolved = row.resolved_at.is_some();
        if resolved != (row.balance == 0) {
            findings.push(new_finding(
                CHECK_RECEIVABLE_CONSISTENCY,
                &row.id,
                serde_json::json!({
                    "reason": "resolved_at disagrees with balance",
                    "balance_micro": row.balance,
                    "resolved_at": row.resolved_at,
                }),
            ));
        }
        let entry = per_account.entry(row.account_id.clone()).or_insert((0, 0));
        entry.0 += row.original;
        entry.1 += row.balance;
    }

    // Ledger-derived recoveries per account: drip entries record what was
    // taken back after the clawback.
    let mut stmt = conn.prepare(
        "SELECT account_id, COALESCE(SUM(amount_micro), 0) FROM ledger_entries
         WHERE entry_kind = 'clawback' AND note = 'drip recovery' AND lot_id IS NULL
         GROUP BY account_id",
    )?;
    let recovered = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);
    let recovered: BTreeMap<String, Micro> = recovered.into_iter().collect();

    let accounts_checked = per_account.len();
    for (account_id, (original_sum, balance_sum)) in per_account {
        let recovered_micro = recovered.get(&account_id).copied().unwrap_or(0);
        let expected_balance = original_sum - recovered_micro;
        if expected_balance != balance_sum {
            findings.push(new_finding(
                CHECK_RECEIVABLE_CONSISTENCY,
                &account_id,
                serde_json::json!({
                    "reason": "open balances diverge from ledger-derived debt",
                    "receivable_original_sum_micro": original_sum,
                    "recovered_micro": recovered_micro,
                    "expected_balance_micro": expected_balance,
                    "actual_balance_micro": balance_sum,
                }),
            ));
        }
    }
    Ok(accounts_checked)
}

fn check_budget_consistency(
    conn: &Connection,
    findings: &mut Vec<Finding>,
) -> Result<usize, error::TidepoolError> {
    let mut stmt = conn.prepare(
        "SELECT account_id, window_spend_micro, window_start FROM spending_limits",
    )?;
    let limits = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);

    let budgets_checked = limits.len();
    for (account_id, stored_spend, window_start) in limits {
        let Some(start_secs) = time::parse_epoch_z(&window_start) else {
            findings.push(new_finding(
                CHECK_BUDGET_CONSISTENCY,
                &account_id,
                serde_json::json!({
                    "reason": "unparseable window start",
                    "window_start": window_start,
                }),
            ));
            continue;
        };

        let mut stmt = conn.prepare(
            "SELECT amount_micro, recorded_at FROM budget_finalizations WHERE account_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![account_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut derived: Micro = 0;
        for (amount, recorded_at) in rows {
            if let Some(recorded_secs) = time::parse_epoch_z(&recorded_at) {
                if recorded_secs >= start_secs {
                    derived += amount;
                }
            }
        }

        if derived != stored_spend {
            findings.push(new_finding(
                CHECK_BUDGET_CONSISTENCY,
                &account_id,
                serde_json::json!({
                    "reason": "window spend diverges from finalization history",
                    "stored_spend_micro": stored_spend,
                    "derived_spend_micro": derived,
                    "window_start": window_start,
                }),
            ));
        }
    }
    Ok(budgets_checked)
}

pub fn list_findings(store: &Store, limit: usize) -> Result<Vec<Finding>, error::TidepoolError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::ledger_db_path(&store.root);
    broker.with_conn(&db_path, "tidepool", None, "reconcile.findings", |conn| {
        let mut stmt = conn.prepare(
            "SELECT id, check_name, subject_id, detail, created_at FROM reconciliation_findings
             ORDER BY created_at DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(Finding {
                    id: row.get(0)?,
                    check_name: row.get(1)?,
                    subject_id: row.get(2)?,
                    detail: serde_json::from_str(&row.get::<_, String>(3)?)
                        .unwrap_or(serde_json::Value::Null),
                    created_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
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
#[clap(name = "reconcile", about = "Conservation audits (alert-only).")]
pub struct ReconcileCli {
    #[clap(long, global = true, value_enum, default_value = "text")]
    format: OutputFormat,
    /// List past findings instead of running the checks.
    #[clap(long)]
    findings: bool,
    #[clap(long, default_value = "50")]
    limit: usize,
}

pub fn run_reconcile_cli(store: &Store, cli: ReconcileCli) -> Result<(), error::TidepoolError> {
    let json = cli.format == OutputFormat::Json;
    if cli.findings {
        let rows = list_findings(store, cli.limit)?;
        if json {
            println!(
                "{}",
                time::command_envelope(
                    "reconcile.findings",
                    "ok",
                    serde_json::json!({ "findings": rows })
                )
            );
        } else {
            for f in rows {
                println!("{} [{}] {} {}", f.created_at, f.check_name, f.subject_id, f.detail);
            }
        }
        return Ok(());
    }

    let report = run_reconciliation(store)?;
    if json {
        println!(
            "{}",
            time::command_envelope(
                "reconcile.run",
                if report.is_clean() { "ok" } else { "divergent" },
                serde_json::json!({ "report": report })
            )
        );
    } else {
        println!(
            "Checked {} lots, {} receivable accounts, {} budgets",
            report.lots_checked, report.receivable_accounts_checked, report.budgets_checked
        );
        if report.is_clean() {
            println!("All conservation checks passed.");
        } else {
            println!("ALERT: {} divergence(s) recorded:", report.findings.len());
            for f in &report.findings {
                println!("  [{}] {} {}", f.check_name, f.subject_id, f.detail);
            }
        }
    }
    Ok(())
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "reconcile",
        "version": "0.1.0",
        "description": "Conservation audits, alert-only",
        "commands": [
            { "name": "run", "description": "Run all checks" },
            { "name": "findings", "description": "List recorded findings" }
        ],
        "storage": ["ledger.db"]
    })
}
