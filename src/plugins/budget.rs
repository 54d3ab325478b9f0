//! Budget circuit breaker.
//!
//! Per-agent daily spend caps with three states: `closed` (normal),
//! `warning` (at least 80% of the cap consumed, spend still allowed), and
//! `open` (cap consumed, all spend rejected). The authoritative record is
//! the `spending_limits` row plus the `budget_finalizations` history; a
//! process-local advisory cache answers the hot "is the circuit open"
//! check without a store round-trip.
//!
//! Window rollover recomputes spend from the finalization history of the
//! new window instead of zeroing a counter, so a crash straddling the
//! boundary cannot understate spend.

use crate::core::broker::DbBroker;
use crate::core::config::LedgerConfig;
use crate::core::db;
use crate::core::error;
use crate::core::money::{self, Micro};
use crate::core::store::Store;
use crate::core::time;
use clap::{Parser, Subcommand, ValueEnum};
use rusqlite::{Connection, OptionalExtension, params};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

pub const CIRCUIT_CLOSED: &str = "closed";
pub const CIRCUIT_WARNING: &str = "warning";
pub const CIRCUIT_OPEN: &str = "open";

const WARNING_THRESHOLD_BPS: i64 = 8_000;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SpendingLimit {
    pub account_id: String,
    pub daily_cap_micro: Micro,
    pub window_spend_micro: Micro,
    pub window_start: String,
    pub window_secs: u64,
    pub circuit_state: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BudgetDecision {
    pub account_id: String,
    pub allowed: bool,
    pub circuit_state: String,
    pub window_spend_micro: Micro,
    pub daily_cap_micro: Micro,
    pub remaining_micro: Micro,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    circuit_state: String,
    window_start_secs: u64,
    window_secs: u64,
}

/// Process-local budget service. Construct one per process and share it;
/// the cache is advisory only — every allowed spend is re-validated against
/// the authoritative store.
pub struct BudgetGuard {
    cache: Mutex<FxHashMap<String, CacheEntry>>,
}

impl Default for BudgetGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl BudgetGuard {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(FxHashMap::default()),
        }
    }

    /// Fast pre-flight: may an agent spend right now?
    ///
    /// A cached `open` circuit whose window has not elapsed rejects without
    /// touching the store. Everything else falls back to the authoritative
    /// row, recomputing state and refreshing the cache.
    pub fn check_budget(
        &self,
        store: &Store,
        config: &LedgerConfig,
        account_id: &str,
    ) -> Result<BudgetDecision, error::TidepoolError> {
        let cached_open = {
            let cache = self.cache.lock().unwrap();
            cache.get(account_id).is_some_and(|entry| {
                entry.circuit_state == CIRCUIT_OPEN
                    && time::now_unix_secs() < entry.window_start_secs + entry.window_secs
            })
        };
        if cached_open {
            return Ok(BudgetDecision {
                account_id: account_id.to_string(),
                allowed: false,
                circuit_state: CIRCUIT_OPEN.to_string(),
                window_spend_micro: 0,
                daily_cap_micro: 0,
                remaining_micro: 0,
            });
        }

        let broker = DbBroker::new(&store.root);
        let db_path = db::ledger_db_path(&store.root);
        let limit = broker.with_txn(&db_path, "tidepool", None, "budget.check", |txn| {
            let limit = ensure_limit_txn(txn, config, account_id)?;
            roll_window_txn(txn, account_id, &limit)
        })?;

        self.refresh_cache(account_id, &limit);
        Ok(decision_from(&limit))
    }

    /// Record a finalized reservation against the account's window.
    /// Idempotent per `(account, reservation)`: re-delivery adds nothing.
    pub fn record_finalization(
        &self,
        store: &Store,
        config: &LedgerConfig,
        account_id: &str,
        reservation_id: &str,
        amount_micro: Micro,
        actor: &str,
    ) -> Result<BudgetDecision, error::TidepoolError> {
        money::require_non_negative(amount_micro, "finalization amount")?;

        let broker = DbBroker::new(&store.root);
        let db_path = db::ledger_db_path(&store.root);
        let limit = broker.with_txn(&db_path, actor, None, "budget.record", |txn| {
            let limit = ensure_limit_txn(txn, config, account_id)?;
            let limit = roll_window_txn(txn, account_id, &limit)?;

            let inserted = txn.execute(
                "INSERT OR IGNORE INTO budget_finalizations(account_id, reservation_id, amount_micro, recorded_at)
                 VALUES(?1, ?2, ?3, ?4)",
                params![account_id, reservation_id, amount_micro, time::now_epoch_z()],
            )?;
            if inserted == 0 {
                return Ok(limit); // already recorded
            }

            let new_spend = money::checked_add(limit.window_spend_micro, amount_micro)?;
            let state = circuit_state_for(new_spend, limit.daily_cap_micro)?;
            txn.execute(
                "UPDATE spending_limits SET window_spend_micro = ?1, circuit_state = ?2 WHERE account_id = ?3",
                params![new_spend, state, account_id],
            )?;
            Ok(SpendingLimit {
                window_spend_micro: new_spend,
                circuit_state: state.to_string(),
                ..limit
            })
        })?;

        self.refresh_cache(account_id, &limit);
        Ok(decision_from(&limit))
    }

    /// Periodic sweep: roll every elapsed window, recomputing spend from
    /// recorded finalizations.
    pub fn reset_windows(&self, store: &Store) -> Result<usize, error::TidepoolError> {
        let broker = DbBroker::new(&store.root);
        let db_path = db::ledger_db_path(&store.root);
        let rolled = broker.with_txn(&db_path, "tidepool", None, "budget.reset_sweep", |txn| {
            let mut stmt = txn.prepare("SELECT account_id FROM spending_limits")?;
            let accounts = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            drop(stmt);

            let mut rolled = 0;
            for account_id in accounts {
                let limit = read_limit_txn(txn, &account_id)?.ok_or_else(|| {
                    error::TidepoolError::NotFound(format!("spending limit {}", account_id))
                })?;
                let after = roll_window_txn(txn, &account_id, &limit)?;
                if after.window_start != limit.window_start {
                    rolled += 1;
                }
            }
            Ok(rolled)
        })?;
        self.cache.lock().unwrap().clear();
        Ok(rolled)
    }

    pub fn set_limit(
        &self,
        store: &Store,
        config: &LedgerConfig,
        account_id: &str,
        daily_cap_micro: Micro,
    ) -> Result<SpendingLimit, error::TidepoolError> {
        money::require_positive(daily_cap_micro, "daily cap")?;
        let broker = DbBroker::new(&store.root);
        let db_path = db::ledger_db_path(&store.root);
        let limit = broker.with_txn(&db_path, "tidepool", None, "budget.set_limit", |txn| {
            let limit = ensure_limit_txn(txn, config, account_id)?;
            let state = circuit_state_for(limit.window_spend_micro, daily_cap_micro)?;
            txn.execute(
                "UPDATE spending_limits SET daily_cap_micro = ?1, circuit_state = ?2 WHERE account_id = ?3",
                params![daily_cap_micro, state, account_id],
            )?;
            Ok(SpendingLimit {
                daily_cap_micro,
                circuit_state: state.to_string(),
                ..limit
            })
        })?;
        self.refresh_cache(account_id, &limit);
        Ok(limit)
    }

    pub fn status(
        &self,
        store: &Store,
        config: &LedgerConfig,
        account_id: &str,
    ) -> Result<BudgetDecision, error::TidepoolError> {
        self.check_budget(store, config, account_id)
    }

    fn refresh_cache(&self, account_id: &str, limit: &SpendingLimit) {
        if let Some(start) = time::parse_epoch_z(&limit.window_start) {
            self.cache.lock().unwrap().insert(
                account_id.to_string(),
                CacheEntry {
                    circuit_state: limit.circuit_state.clone(),
                    window_start_secs: start,
                    window_secs: limit.window_secs,
                },
            );
        }
    }
}

fn decision_from(limit: &SpendingLimit) -> BudgetDecision {
    BudgetDecision {
        account_id: limit.account_id.clone(),
        allowed: limit.circuit_state != CIRCUIT_OPEN,
        circuit_state: limit.circuit_state.clone(),
        window_spend_micro: limit.window_spend_micro,
        daily_cap_micro: limit.daily_cap_micro,
        remaining_micro: (limit.daily_cap_micro - limit.window_spend_micro).max(0),
    }
}

fn circuit_state_for(spend: Micro, cap: Micro) -> Result<&'static str, error::TidepoolError> {
    if cap <= 0 {
        return Err(error::TidepoolError::ArithmeticError(
            "daily cap must be positive".to_string(),
        ));
    }
    if spend >= cap {
        Ok(CIRCUIT_OPEN)
    } else if (spend as i128) * (money::BPS_DENOMINATOR as i128)
        >= (cap as i128) * (WARNING_THRESHOLD_BPS as i128)
    {
        Ok(CIRCUIT_WARNING)
    } else {
        Ok(CIRCUIT_CLOSED)
    }
}

fn read_limit_txn(
    conn: &Connection,
    account_id: &str,
) -> Result<Option<SpendingLimit>, error::TidepoolError> {
    let limit = conn
        .query_row(
            "SELECT account_id, daily_cap_micro, window_spend_micro, window_start, window_secs, circuit_state
             FROM spending_limits WHERE account_id = ?1",
            params![account_id],
            |row| {
                Ok(SpendingLimit {
                    account_id: row.get(0)?,
                    daily_cap_micro: row.get(1)?,
                    window_spend_micro: row.get(2)?,
                    window_start: row.get(3)?,
                    window_secs: row.get::<_, i64>(4)? as u64,
                    circuit_state: row.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(limit)
}

fn ensure_limit_txn(
    conn: &Connection,
    config: &LedgerConfig,
    account_id: &str,
) -> Result<SpendingLimit, error::TidepoolError> {
    if let Some(limit) = read_limit_txn(conn, account_id)? {
        return Ok(limit);
    }
    let limit = SpendingLimit {
        account_id: account_id.to_string(),
        daily_cap_micro: config.default_daily_cap_micro,
        window_spend_micro: 0,
        window_start: time::now_epoch_z(),
        window_secs: config.budget_window_secs,
        circuit_state: CIRCUIT_CLOSED.to_string(),
    };
    conn.execute(
        "INSERT INTO spending_limits(account_id, daily_cap_micro, window_spend_micro, window_start, window_secs, circuit_state)
         VALUES(?1, ?2, 0, ?3, ?4, ?5)",
        params![
            limit.account_id,
            limit.daily_cap_micro,
            limit.window_start,
            limit.window_secs as i64,
            limit.circuit_state
        ],
    )?;
    Ok(limit)
}

/// Roll the window if it has elapsed. The new spend is recomputed from the
/// finalization history inside the new window, never assumed zero.
fn roll_window_txn(
    conn: &Connection,
    account_id: &str,
    limit: &SpendingLimit,
) -> Result<SpendingLimit, error::TidepoolError> {
    let start_secs = time::parse_epoch_z(&limit.window_start).ok_or_else(|| {
        error::TidepoolError::ValidationError(format!(
            "unparseable window start '{}'",
            limit.window_start
        ))
    })?;
    if limit.window_secs == 0 {
        return Err(error::TidepoolError::ValidationError(format!(
            "zero-length budget window for account {}",
            account_id
        )));
    }
    let now_secs = time::now_unix_secs();
    if now_secs < start_secs + limit.window_secs {
        return Ok(limit.clone());
    }

    // Align the new start to the window grid so repeated sweeps are stable.
    let elapsed_windows = (now_secs - start_secs) / limit.window_secs;
    let new_start_secs = start_secs + elapsed_windows * limit.window_secs;

    let mut stmt = conn.prepare(
        "SELECT amount_micro, recorded_at FROM budget_finalizations WHERE account_id = ?1",
    )?;
    let rows = stmt
        .query_map(params![account_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);

    let mut new_spend: Micro = 0;
    for (amount, recorded_at) in rows {
        if let Some(recorded_secs) = time::parse_epoch_z(&recorded_at) {
            if recorded_secs >= new_start_secs {
                new_spend = money::checked_add(new_spend, amount)?;
            }
        }
    }

    let state = circuit_state_for(new_spend, limit.daily_cap_micro)?;
    let new_start = format!("{}Z", new_start_secs);
    conn.execute(
        "UPDATE spending_limits SET window_spend_micro = ?1, window_start = ?2, circuit_state = ?3
         WHERE account_id = ?4",
        params![new_spend, new_start, state, account_id],
    )?;
    Ok(SpendingLimit {
        window_spend_micro: new_spend,
        window_start: new_start,
        circuit_state: state.to_string(),
        ..limit.clone()
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
#[clap(name = "budget", about = "Per-agent spend caps and circuit state.")]
pub struct BudgetCli {
    #[clap(long, global = true, value_enum, default_value = "text")]
    format: OutputFormat,
    #[clap(subcommand)]
    command: BudgetCommand,
}

#[derive(Subcommand, Debug)]
pub enum BudgetCommand {
    /// Check whether an account may spend.
    Check {
        #[clap(long)]
        account: String,
    },
    /// Record a finalized reservation against the window.
    Record {
        #[clap(long)]
        account: String,
        #[clap(long)]
        reservation: String,
        #[clap(long)]
        amount: i64,
    },
    /// Set an account's daily cap.
    SetLimit {
        #[clap(long)]
        account: String,
        #[clap(long)]
        cap: i64,
    },
    /// Roll all elapsed windows.
    ResetSweep,
}

pub fn run_budget_cli(
    store: &Store,
    config: &LedgerConfig,
    cli: BudgetCli,
) -> Result<(), error::TidepoolError> {
    let guard = BudgetGuard::new();
    let json = cli.format == OutputFormat::Json;
    match cli.command {
        BudgetCommand::Check { account } => {
            let decision = guard.check_budget(store, config, &account)?;
            if json {
                println!(
                    "{}",
                    time::command_envelope(
                        "budget.check",
                        "ok",
                        serde_json::json!({ "decision": decision })
                    )
                );
            } else {
                println!(
                    "{}: {} ({} of {} micro spent)",
                    account,
                    decision.circuit_state,
                    decision.window_spend_micro,
                    decision.daily_cap_micro
                );
            }
        }
        BudgetCommand::Record {
            account,
            reservation,
            amount,
        } => {
            let decision =
                guard.record_finalization(store, config, &account, &reservation, amount, "operator")?;
            if json {
                println!(
                    "{}",
                    time::command_envelope(
                        "budget.record",
                        "ok",
                        serde_json::json!({ "decision": decision })
                    )
                );
            } else {
                println!(
                    "Recorded. {} now {} ({} of {} micro)",
                    account,
                    decision.circuit_state,
                    decision.window_spend_micro,
                    decision.daily_cap_micro
                );
            }
        }
        BudgetCommand::SetLimit { account, cap } => {
            let limit = guard.set_limit(store, config, &account, cap)?;
            println!(
                "Cap for {} set to {} micro ({})",
                account, limit.daily_cap_micro, limit.circuit_state
            );
        }
        BudgetCommand::ResetSweep => {
            let rolled = guard.reset_windows(store)?;
            println!("Rolled {} window(s)", rolled);
        }
    }
    Ok(())
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "budget",
        "version": "0.1.0",
        "description": "Daily spend caps with circuit breaker",
        "commands": [
            { "name": "check", "description": "Pre-flight spend check" },
            { "name": "record", "description": "Record a finalization (idempotent)" },
            { "name": "set-limit", "description": "Set a daily cap" },
            { "name": "reset-sweep", "description": "Roll elapsed windows" }
        ],
        "storage": ["ledger.db"]
    })
}
