//! Ledger store and reservation engine.
//!
//! Exclusive owner of the account/lot/reservation/entry rows. Credit lives
//! in lots (funded, depletable chunks); usage draws lots down oldest-first
//! through reservations; every money movement appends a ledger entry.
//! Other subsystems never touch these tables directly — they go through the
//! `*_txn` helpers here, inside their own brokered transaction.
//!
//! Reservation state machine: `pending → {finalized | released | expired}`,
//! terminal states immutable.

use crate::core::broker::DbBroker;
use crate::core::config::LedgerConfig;
use crate::core::db;
use crate::core::error;
use crate::core::money::{self, Micro};
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::outbox::{self, NewEvent};
use clap::{Parser, Subcommand, ValueEnum};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub const ENTITY_KINDS: &[&str] = &[
    "agent",
    "person",
    "community",
    "mod",
    "protocol",
    "foundation",
    "commons",
];

pub const LOT_SOURCE_KINDS: &[&str] = &["deposit", "grant", "purchase", "transfer", "dividend"];

pub const RESERVATION_PENDING: &str = "pending";
pub const RESERVATION_FINALIZED: &str = "finalized";
pub const RESERVATION_RELEASED: &str = "released";
pub const RESERVATION_EXPIRED: &str = "expired";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Account {
    pub id: String,
    pub entity_kind: String,
    pub display_name: String,
    pub created_at: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Lot {
    pub id: String,
    pub account_id: String,
    pub source_kind: String,
    pub source_ref: Option<String>,
    pub amount_original_micro: Micro,
    pub amount_remaining_micro: Micro,
    pub created_at: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Reservation {
    pub id: String,
    pub account_id: String,
    pub amount_micro: Micro,
    pub status: String,
    pub idempotency_key: String,
    pub finalized_cost_micro: Option<Micro>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LedgerEntry {
    pub id: String,
    pub account_id: String,
    pub entry_kind: String,
    pub amount_micro: Micro,
    pub reservation_id: Option<String>,
    pub lot_id: Option<String>,
    pub correlation_id: Option<String>,
    pub note: String,
    pub created_at: String,
}

/// Result of `reserve`: the reservation plus whether this call created it
/// or an earlier delivery of the same idempotency key already had.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReserveOutcome {
    pub reservation: Reservation,
    pub created: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SweepReport {
    pub scanned: usize,
    pub expired: Vec<String>,
}

pub fn validate_entity_kind(kind: &str) -> Result<(), error::TidepoolError> {
    if ENTITY_KINDS.contains(&kind) {
        Ok(())
    } else {
        Err(error::TidepoolError::ValidationError(format!(
            "unknown entity kind '{}'; expected one of {}",
            kind,
            ENTITY_KINDS.join(", ")
        )))
    }
}

pub fn validate_source_kind(kind: &str) -> Result<(), error::TidepoolError> {
    if LOT_SOURCE_KINDS.contains(&kind) {
        Ok(())
    } else {
        Err(error::TidepoolError::ValidationError(format!(
            "unknown lot source kind '{}'; expected one of {}",
            kind,
            LOT_SOURCE_KINDS.join(", ")
        )))
    }
}

// ---------------------------------------------------------------------------
// Transaction-scoped primitives. Callers hold an open brokered transaction;
// these are the only code paths that write lot/entry rows.
// ---------------------------------------------------------------------------

pub fn require_account_txn(conn: &Connection, account_id: &str) -> Result<Account, error::TidepoolError> {
    conn.query_row(
        "SELECT id, entity_kind, display_name, created_at FROM accounts WHERE id = ?1",
        params![account_id],
        |row| {
            Ok(Account {
                id: row.get(0)?,
                entity_kind: row.get(1)?,
                display_name: row.get(2)?,
                created_at: row.get(3)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| error::TidepoolError::NotFound(format!("account {}", account_id)))
}

pub fn available_balance_txn(conn: &Connection, account_id: &str) -> Result<Micro, error::TidepoolError> {
    let balance: i64 = conn.query_row(
        "SELECT COALESCE(SUM(amount_remaining_micro), 0) FROM lots WHERE account_id = ?1",
        params![account_id],
        |row| row.get(0),
    )?;
    Ok(balance)
}

/// Mint a new lot. Fails on a duplicate `source_ref` (the deposit-dedup
/// uniqueness lives on the lots table itself).
pub fn mint_lot_txn(
    conn: &Connection,
    account_id: &str,
    source_kind: &str,
    source_ref: Option<&str>,
    amount_micro: Micro,
    correlation_id: Option<&str>,
) -> Result<Lot, error::TidepoolError> {
    validate_source_kind(source_kind)?;
    money::require_positive(amount_micro, "lot amount")?;
    require_account_txn(conn, account_id)?;

    let now = time::now_epoch_z();
    let lot = Lot {
        id: Ulid::new().to_string(),
        account_id: account_id.to_string(),
        source_kind: source_kind.to_string(),
        source_ref: source_ref.map(|s| s.to_string()),
        amount_original_micro: amount_micro,
        amount_remaining_micro: amount_micro,
        created_at: now.clone(),
    };
    conn.execute(
        "INSERT INTO lots(id, account_id, source_kind, source_ref, amount_original_micro, amount_remaining_micro, created_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            lot.id,
            lot.account_id,
            lot.source_kind,
            lot.source_ref,
            lot.amount_original_micro,
            lot.amount_remaining_micro,
            lot.created_at
        ],
    )?;
    insert_entry_txn(
        conn,
        account_id,
        entry_kind_for_source(source_kind),
        amount_micro,
        None,
        Some(&lot.id),
        correlation_id,
        "",
    )?;
    Ok(lot)
}

fn entry_kind_for_source(source_kind: &str) -> &'static str {
    match source_kind {
        "deposit" => "deposit",
        "grant" => "grant",
        "purchase" => "purchase",
        "transfer" => "transfer",
        "dividend" => "revenue_share",
        _ => "grant",
    }
}

#[allow(clippy::too_many_arguments)]
pub fn insert_entry_txn(
    conn: &Connection,
    account_id: &str,
    entry_kind: &str,
    amount_micro: Micro,
    reservation_id: Option<&str>,
    lot_id: Option<&str>,
    correlation_id: Option<&str>,
    note: &str,
) -> Result<String, error::TidepoolError> {
    let id = Ulid::new().to_string();
    conn.execute(
        "INSERT INTO ledger_entries(id, account_id, entry_kind, amount_micro, reservation_id, lot_id, correlation_id, note, created_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            id,
            account_id,
            entry_kind,
            amount_micro,
            reservation_id,
            lot_id,
            correlation_id,
            note,
            time::now_epoch_z()
        ],
    )?;
    Ok(id)
}

/// Draw `amount_micro` from the account's lots newest-first, reducing each
/// lot's remaining balance. Used by clawback recovery; returns what was
/// actually applied (may be less than requested) and the per-lot takes.
pub fn draw_down_lifo_txn(
    conn: &Connection,
    account_id: &str,
    amount_micro: Micro,
) -> Result<(Micro, Vec<(String, Micro)>), error::TidepoolError> {
    let mut stmt = conn.prepare(
        "SELECT id, amount_remaining_micro FROM lots
         WHERE account_id = ?1 AND amount_remaining_micro > 0
         ORDER BY created_at DESC, id DESC",
    )?;
    let lots = stmt
        .query_map(params![account_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut needed = amount_micro;
    let mut takes = Vec::new();
    for (lot_id, remaining) in lots {
        if needed == 0 {
            break;
        }
        let take = remaining.min(needed);
        conn.execute(
            "UPDATE lots SET amount_remaining_micro = amount_remaining_micro - ?1 WHERE id = ?2",
            params![take, lot_id],
        )?;
        needed = money::checked_sub(needed, take)?;
        takes.push((lot_id, take));
    }
    Ok((money::checked_sub(amount_micro, needed)?, takes))
}

fn get_reservation_txn(
    conn: &Connection,
    reservation_id: &str,
) -> Result<Reservation, error::TidepoolError> {
    conn.query_row(
        "SELECT id, account_id, amount_micro, status, idempotency_key, finalized_cost_micro, created_at, updated_at
         FROM reservations WHERE id = ?1",
        params![reservation_id],
        map_reservation_row,
    )
    .optional()?
    .ok_or_else(|| error::TidepoolError::NotFound(format!("reservation {}", reservation_id)))
}

fn map_reservation_row(row: &rusqlite::Row) -> rusqlite::Result<Reservation> {
    Ok(Reservation {
        id: row.get(0)?,
        account_id: row.get(1)?,
        amount_micro: row.get(2)?,
        status: row.get(3)?,
        idempotency_key: row.get(4)?,
        finalized_cost_micro: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

/// Held lots for a reservation, newest lot first. Surplus and restoration
/// flow back through this list.
fn held_lots_txn(
    conn: &Connection,
    reservation_id: &str,
) -> Result<Vec<(String, Micro)>, error::TidepoolError> {
    let mut stmt = conn.prepare(
        "SELECT rl.lot_id, rl.amount_micro FROM reservation_lots rl
         JOIN lots l ON l.id = rl.lot_id
         WHERE rl.reservation_id = ?1
         ORDER BY l.created_at DESC, l.id DESC",
    )?;
    let holds = stmt
        .query_map(params![reservation_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(holds)
}

fn restore_to_lots_txn(
    conn: &Connection,
    holds: &[(String, Micro)],
    mut amount_micro: Micro,
) -> Result<(), error::TidepoolError> {
    for (lot_id, held) in holds {
        if amount_micro == 0 {
            break;
        }
        let back = (*held).min(amount_micro);
        conn.execute(
            "UPDATE lots SET amount_remaining_micro = amount_remaining_micro + ?1 WHERE id = ?2",
            params![back, lot_id],
        )?;
        amount_micro = money::checked_sub(amount_micro, back)?;
    }
    if amount_micro != 0 {
        return Err(error::TidepoolError::ArithmeticError(format!(
            "restoration exceeds recorded holds by {}",
            amount_micro
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Store-level operations, one brokered transaction each.
// ---------------------------------------------------------------------------

pub fn create_account(
    store: &Store,
    entity_kind: &str,
    display_name: &str,
) -> Result<Account, error::TidepoolError> {
    validate_entity_kind(entity_kind)?;
    let broker = DbBroker::new(&store.root);
    let db_path = db::ledger_db_path(&store.root);
    let account = Account {
        id: Ulid::new().to_string(),
        entity_kind: entity_kind.to_string(),
        display_name: display_name.to_string(),
        created_at: time::now_epoch_z(),
    };
    broker.with_conn(&db_path, "tidepool", None, "ledger.account.create", |conn| {
        conn.execute(
            "INSERT INTO accounts(id, entity_kind, display_name, created_at) VALUES(?1, ?2, ?3, ?4)",
            params![
                account.id,
                account.entity_kind,
                account.display_name,
                account.created_at
            ],
        )?;
        Ok(())
    })?;
    Ok(account)
}

pub fn balance(store: &Store, account_id: &str) -> Result<Micro, error::TidepoolError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::ledger_db_path(&store.root);
    broker.with_conn(&db_path, "tidepool", None, "ledger.balance", |conn| {
        require_account_txn(conn, account_id)?;
        available_balance_txn(conn, account_id)
    })
}

/// Mint a grant lot: internal credit issuance (onboarding grants, referral
/// campaigns, manual adjustments).
pub fn grant(
    store: &Store,
    account_id: &str,
    amount_micro: Micro,
    actor: &str,
    note: &str,
) -> Result<Lot, error::TidepoolError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::ledger_db_path(&store.root);
    broker.with_txn(&db_path, actor, None, "ledger.grant", |txn| {
        let lot = mint_lot_txn(txn, account_id, "grant", None, amount_micro, None)?;
        outbox::emit_in_txn(
            txn,
            &NewEvent {
                event_type: "credit.granted".to_string(),
                entity_type: "lot".to_string(),
                entity_id: lot.id.clone(),
                correlation_id: None,
                idempotency_key: format!("grant:{}", lot.id),
                payload: serde_json::json!({
                    "account_id": account_id,
                    "amount_micro": amount_micro,
                    "note": note,
                }),
            },
        )?;
        Ok(lot)
    })
}

/// Reserve credit against an account's lots, oldest lot first.
///
/// Idempotent: a second call with the same key returns the existing
/// reservation with `created = false` and deducts nothing. Insufficient
/// balance fails before any lot is touched.
pub fn reserve(
    store: &Store,
    account_id: &str,
    amount_micro: Micro,
    idempotency_key: &str,
    actor: &str,
) -> Result<ReserveOutcome, error::TidepoolError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::ledger_db_path(&store.root);
    broker.with_txn(&db_path, actor, None, "ledger.reserve", |txn| {
        reserve_txn(txn, account_id, amount_micro, idempotency_key)
    })
}

/// Transaction-scoped body of `reserve`, for callers (payouts) that bundle
/// the hold with further writes in one atomic unit.
pub fn reserve_txn(
    txn: &Connection,
    account_id: &str,
    amount_micro: Micro,
    idempotency_key: &str,
) -> Result<ReserveOutcome, error::TidepoolError> {
    money::require_positive(amount_micro, "reservation amount")?;
    if idempotency_key.trim().is_empty() {
        return Err(error::TidepoolError::ValidationError(
            "idempotency key must not be empty".to_string(),
        ));
    }
    if let Some(existing) = txn
        .query_row(
            "SELECT id, account_id, amount_micro, status, idempotency_key, finalized_cost_micro, created_at, updated_at
             FROM reservations WHERE idempotency_key = ?1",
            params![idempotency_key],
            map_reservation_row,
        )
        .optional()?
    {
        return Ok(ReserveOutcome {
            reservation: existing,
            created: false,
        });
    }

    require_account_txn(txn, account_id)?;
    let available = available_balance_txn(txn, account_id)?;
    if available < amount_micro {
        return Err(error::TidepoolError::InsufficientBalance(format!(
            "account {} has {} micro available, {} requested",
            account_id, available, amount_micro
        )));
    }

    let mut stmt = txn.prepare(
        "SELECT id, amount_remaining_micro FROM lots
         WHERE account_id = ?1 AND amount_remaining_micro > 0
         ORDER BY created_at ASC, id ASC",
    )?;
    let lots = stmt
        .query_map(params![account_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);

    let now = time::now_epoch_z();
    let reservation = Reservation {
        id: Ulid::new().to_string(),
        account_id: account_id.to_string(),
        amount_micro,
        status: RESERVATION_PENDING.to_string(),
        idempotency_key: idempotency_key.to_string(),
        finalized_cost_micro: None,
        created_at: now.clone(),
        updated_at: now,
    };
    txn.execute(
        "INSERT INTO reservations(id, account_id, amount_micro, status, idempotency_key, finalized_cost_micro, created_at, updated_at)
         VALUES(?1, ?2, ?3, ?4, ?5, NULL, ?6, ?7)",
        params![
            reservation.id,
            reservation.account_id,
            reservation.amount_micro,
            reservation.status,
            reservation.idempotency_key,
            reservation.created_at,
            reservation.updated_at
        ],
    )?;

    let mut needed = amount_micro;
    for (lot_id, remaining) in lots {
        if needed == 0 {
            break;
        }
        let take = remaining.min(needed);
        txn.execute(
            "UPDATE lots SET amount_remaining_micro = amount_remaining_micro - ?1 WHERE id = ?2",
            params![take, lot_id],
        )?;
        txn.execute(
            "INSERT INTO reservation_lots(reservation_id, lot_id, amount_micro) VALUES(?1, ?2, ?3)",
            params![reservation.id, lot_id, take],
        )?;
        needed = money::checked_sub(needed, take)?;
    }

    insert_entry_txn(
        txn,
        account_id,
        "reserve",
        amount_micro,
        Some(&reservation.id),
        None,
        None,
        "",
    )?;
    outbox::emit_in_txn(
        txn,
        &NewEvent {
            event_type: "reservation.created".to_string(),
            entity_type: "reservation".to_string(),
            entity_id: reservation.id.clone(),
            correlation_id: None,
            idempotency_key: format!("reserve:{}", idempotency_key),
            payload: serde_json::json!({
                "account_id": account_id,
                "amount_micro": amount_micro,
            }),
        },
    )?;

    Ok(ReserveOutcome {
        reservation,
        created: true,
    })
}

/// Finalize a pending reservation at its actual metered cost. Surplus goes
/// back to the originating lots; the reservation becomes terminal.
pub fn finalize(
    store: &Store,
    reservation_id: &str,
    actual_cost_micro: Micro,
    actor: &str,
) -> Result<Reservation, error::TidepoolError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::ledger_db_path(&store.root);
    broker.with_txn(&db_path, actor, None, "ledger.finalize", |txn| {
        finalize_txn(txn, reservation_id, actual_cost_micro)
    })
}

/// Transaction-scoped body of `finalize`.
pub fn finalize_txn(
    txn: &Connection,
    reservation_id: &str,
    actual_cost_micro: Micro,
) -> Result<Reservation, error::TidepoolError> {
    money::require_non_negative(actual_cost_micro, "actual cost")?;
    let mut reservation = get_reservation_txn(txn, reservation_id)?;
    if reservation.status != RESERVATION_PENDING {
        return Err(error::TidepoolError::StateError(format!(
            "reservation {} is {}, only pending reservations finalize",
            reservation_id, reservation.status
        )));
    }
    if actual_cost_micro > reservation.amount_micro {
        return Err(error::TidepoolError::InsufficientBalance(format!(
            "actual cost {} exceeds reserved {} for reservation {}",
            actual_cost_micro, reservation.amount_micro, reservation_id
        )));
    }

    let now = time::now_epoch_z();
    let changed = txn.execute(
        "UPDATE reservations SET status = ?1, finalized_cost_micro = ?2, updated_at = ?3
         WHERE id = ?4 AND status = 'pending'",
        params![RESERVATION_FINALIZED, actual_cost_micro, now, reservation_id],
    )?;
    if changed == 0 {
        return Err(error::TidepoolError::StateError(format!(
            "reservation {} transitioned concurrently",
            reservation_id
        )));
    }

    let surplus = money::checked_sub(reservation.amount_micro, actual_cost_micro)?;
    if surplus > 0 {
        let holds = held_lots_txn(txn, reservation_id)?;
        restore_to_lots_txn(txn, &holds, surplus)?;
    }

    insert_entry_txn(
        txn,
        &reservation.account_id,
        "finalize",
        actual_cost_micro,
        Some(reservation_id),
        None,
        None,
        "",
    )?;
    outbox::emit_in_txn(
        txn,
        &NewEvent {
            event_type: "reservation.finalized".to_string(),
            entity_type: "reservation".to_string(),
            entity_id: reservation_id.to_string(),
            correlation_id: None,
            idempotency_key: format!("finalize:{}", reservation_id),
            payload: serde_json::json!({
                "account_id": reservation.account_id,
                "actual_cost_micro": actual_cost_micro,
                "surplus_micro": surplus,
            }),
        },
    )?;

    reservation.status = RESERVATION_FINALIZED.to_string();
    reservation.finalized_cost_micro = Some(actual_cost_micro);
    reservation.updated_at = now;
    Ok(reservation)
}

/// Release a pending reservation in full: every held amount returns to its
/// originating lot.
pub fn release(
    store: &Store,
    reservation_id: &str,
    actor: &str,
) -> Result<Reservation, error::TidepoolError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::ledger_db_path(&store.root);
    broker.with_txn(&db_path, actor, None, "ledger.release", |txn| {
        release_txn(txn, reservation_id)
    })
}

/// Transaction-scoped body of `release`.
pub fn release_txn(
    txn: &Connection,
    reservation_id: &str,
) -> Result<Reservation, error::TidepoolError> {
    let mut reservation = get_reservation_txn(txn, reservation_id)?;
    if reservation.status != RESERVATION_PENDING {
        return Err(error::TidepoolError::StateError(format!(
            "reservation {} is {}, only pending reservations release",
            reservation_id, reservation.status
        )));
    }

    let now = time::now_epoch_z();
    let changed = txn.execute(
        "UPDATE reservations SET status = ?1, updated_at = ?2
         WHERE id = ?3 AND status = 'pending'",
        params![RESERVATION_RELEASED, now, reservation_id],
    )?;
    if changed == 0 {
        return Err(error::TidepoolError::StateError(format!(
            "reservation {} transitioned concurrently",
            reservation_id
        )));
    }

    let holds = held_lots_txn(txn, reservation_id)?;
    restore_to_lots_txn(txn, &holds, reservation.amount_micro)?;

    insert_entry_txn(
        txn,
        &reservation.account_id,
        "release",
        reservation.amount_micro,
        Some(reservation_id),
        None,
        None,
        "",
    )?;
    outbox::emit_in_txn(
        txn,
        &NewEvent {
            event_type: "reservation.released".to_string(),
            entity_type: "reservation".to_string(),
            entity_id: reservation_id.to_string(),
            correlation_id: None,
            idempotency_key: format!("release:{}", reservation_id),
            payload: serde_json::json!({
                "account_id": reservation.account_id,
                "amount_micro": reservation.amount_micro,
            }),
        },
    )?;

    reservation.status = RESERVATION_RELEASED.to_string();
    reservation.updated_at = now;
    Ok(reservation)
}

/// Periodic batch: force-expire pending reservations older than the TTL,
/// restoring their holds. The per-row `AND status = 'pending'` predicate
/// means a reservation finalized between scan and update is skipped, not
/// clobbered.
pub fn expire_sweep(
    store: &Store,
    config: &LedgerConfig,
    actor: &str,
) -> Result<SweepReport, error::TidepoolError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::ledger_db_path(&store.root);
    broker.with_txn(&db_path, actor, None, "ledger.expire_sweep", |txn| {
        let now_secs = time::now_unix_secs();
        let mut stmt = txn.prepare(
            "SELECT id, account_id, amount_micro, created_at FROM reservations WHERE status = 'pending'",
        )?;
        let pending = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut report = SweepReport {
            scanned: pending.len(),
            expired: Vec::new(),
        };
        let now = time::now_epoch_z();
        for (id, account_id, amount_micro, created_at) in pending {
            let created_secs = match time::parse_epoch_z(&created_at) {
                Some(secs) => secs,
                None => continue,
            };
            if created_secs + config.reservation_ttl_secs > now_secs {
                continue;
            }
            let changed = txn.execute(
                "UPDATE reservations SET status = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = 'pending'",
                params![RESERVATION_EXPIRED, now, id],
            )?;
            if changed == 0 {
                continue; // finalized or released since the scan
            }
            let holds = held_lots_txn(txn, &id)?;
            restore_to_lots_txn(txn, &holds, amount_micro)?;
            insert_entry_txn(
                txn,
                &account_id,
                "expire",
                amount_micro,
                Some(&id),
                None,
                None,
                "",
            )?;
            outbox::emit_in_txn(
                txn,
                &NewEvent {
                    event_type: "reservation.expired".to_string(),
                    entity_type: "reservation".to_string(),
                    entity_id: id.clone(),
                    correlation_id: None,
                    idempotency_key: format!("expire:{}", id),
                    payload: serde_json::json!({
                        "account_id": account_id,
                        "amount_micro": amount_micro,
                    }),
                },
            )?;
            report.expired.push(id);
        }
        Ok(report)
    })
}

pub fn get_reservation(
    store: &Store,
    reservation_id: &str,
) -> Result<Reservation, error::TidepoolError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::ledger_db_path(&store.root);
    broker.with_conn(&db_path, "tidepool", None, "ledger.reservation.get", |conn| {
        get_reservation_txn(conn, reservation_id)
    })
}

pub fn entries(
    store: &Store,
    account_id: &str,
    limit: usize,
) -> Result<Vec<LedgerEntry>, error::TidepoolError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::ledger_db_path(&store.root);
    broker.with_conn(&db_path, "tidepool", None, "ledger.entries", |conn| {
        let mut stmt = conn.prepare(
            "SELECT id, account_id, entry_kind, amount_micro, reservation_id, lot_id, correlation_id, note, created_at
             FROM ledger_entries WHERE account_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![account_id, limit as i64], |row| {
            Ok(LedgerEntry {
                id: row.get(0)?,
                account_id: row.get(1)?,
                entry_kind: row.get(2)?,
                amount_micro: row.get(3)?,
                reservation_id: row.get(4)?,
                lot_id: row.get(5)?,
                correlation_id: row.get(6)?,
                note: row.get(7)?,
                created_at: row.get(8)?,
            })
        })?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
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
#[clap(name = "ledger", about = "Accounts, lots, reservations, and entries.")]
pub struct LedgerCli {
    /// Output format for this command group.
    #[clap(long, global = true, value_enum, default_value = "text")]
    format: OutputFormat,
    #[clap(subcommand)]
    command: LedgerCommand,
}

#[derive(Subcommand, Debug)]
pub enum LedgerCommand {
    /// Create an account.
    CreateAccount {
        #[clap(long, value_parser = parse_entity_kind)]
        kind: String,
        #[clap(long, default_value = "")]
        name: String,
    },
    /// Show an account's derived balance.
    Balance {
        #[clap(long)]
        account: String,
    },
    /// Mint a grant lot.
    Grant {
        #[clap(long)]
        account: String,
        #[clap(long)]
        amount: i64,
        #[clap(long, default_value = "")]
        note: String,
    },
    /// Reserve credit for metered usage.
    Reserve {
        #[clap(long)]
        account: String,
        #[clap(long)]
        amount: i64,
        #[clap(long)]
        key: String,
    },
    /// Finalize a reservation at its actual cost.
    Finalize {
        #[clap(long)]
        reservation: String,
        #[clap(long)]
        cost: i64,
    },
    /// Release a reservation in full.
    Release {
        #[clap(long)]
        reservation: String,
    },
    /// Expire pending reservations past their TTL.
    ExpireSweep,
    /// List ledger entries for an account.
    Entries {
        #[clap(long)]
        account: String,
        #[clap(long, default_value = "50")]
        limit: usize,
    },
}

fn parse_entity_kind(s: &str) -> Result<String, String> {
    if ENTITY_KINDS.contains(&s) {
        Ok(s.to_string())
    } else {
        Err(format!(
            "invalid entity kind: {}. Must be one of: {}",
            s,
            ENTITY_KINDS.join(", ")
        ))
    }
}

pub fn run_ledger_cli(
    store: &Store,
    config: &LedgerConfig,
    cli: LedgerCli,
) -> Result<(), error::TidepoolError> {
    let json = cli.format == OutputFormat::Json;
    match cli.command {
        LedgerCommand::CreateAccount { kind, name } => {
            let account = create_account(store, &kind, &name)?;
            if json {
                println!(
                    "{}",
                    time::command_envelope(
                        "ledger.account.create",
                        "ok",
                        serde_json::json!({ "account": account })
                    )
                );
            } else {
                println!("Account created: {} ({})", account.id, account.entity_kind);
            }
        }
        LedgerCommand::Balance { account } => {
            let micro = balance(store, &account)?;
            if json {
                println!(
                    "{}",
                    time::command_envelope(
                        "ledger.balance",
                        "ok",
                        serde_json::json!({ "account_id": account, "balance_micro": micro })
                    )
                );
            } else {
                println!("{} micro-USD", micro);
            }
        }
        LedgerCommand::Grant {
            account,
            amount,
            note,
        } => {
            let lot = grant(store, &account, amount, "operator", &note)?;
            if json {
                println!(
                    "{}",
                    time::command_envelope("ledger.grant", "ok", serde_json::json!({ "lot": lot }))
                );
            } else {
                println!("Granted {} micro-USD (lot {})", amount, lot.id);
            }
        }
        LedgerCommand::Reserve {
            account,
            amount,
            key,
        } => {
            let outcome = reserve(store, &account, amount, &key, "operator")?;
            if json {
                println!(
                    "{}",
                    time::command_envelope(
                        "ledger.reserve",
                        "ok",
                        serde_json::json!({
                            "reservation": outcome.reservation,
                            "created": outcome.created
                        })
                    )
                );
            } else if outcome.created {
                println!("Reserved: {}", outcome.reservation.id);
            } else {
                println!("Already reserved: {}", outcome.reservation.id);
            }
        }
        LedgerCommand::Finalize { reservation, cost } => {
            let r = finalize(store, &reservation, cost, "operator")?;
            if json {
                println!(
                    "{}",
                    time::command_envelope(
                        "ledger.finalize",
                        "ok",
                        serde_json::json!({ "reservation": r })
                    )
                );
            } else {
                println!("Finalized {} at {} micro-USD", r.id, cost);
            }
        }
        LedgerCommand::Release { reservation } => {
            let r = release(store, &reservation, "operator")?;
            if json {
                println!(
                    "{}",
                    time::command_envelope(
                        "ledger.release",
                        "ok",
                        serde_json::json!({ "reservation": r })
                    )
                );
            } else {
                println!("Released {}", r.id);
            }
        }
        LedgerCommand::ExpireSweep => {
            let report = expire_sweep(store, config, "operator")?;
            if json {
                println!(
                    "{}",
                    time::command_envelope(
                        "ledger.expire_sweep",
                        "ok",
                        serde_json::json!({ "report": report })
                    )
                );
            } else {
                println!(
                    "Scanned {} pending, expired {}",
                    report.scanned,
                    report.expired.len()
                );
            }
        }
        LedgerCommand::Entries { account, limit } => {
            let items = entries(store, &account, limit)?;
            if json {
                println!(
                    "{}",
                    time::command_envelope(
                        "ledger.entries",
                        "ok",
                        serde_json::json!({ "entries": items })
                    )
                );
            } else {
                for e in items {
                    println!(
                        "{} {} {:>14} micro {}",
                        e.created_at, e.entry_kind, e.amount_micro, e.id
                    );
                }
            }
        }
    }
    Ok(())
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "ledger",
        "version": "0.1.0",
        "description": "Credit lots and reservation draw-down",
        "commands": [
            { "name": "create-account", "description": "Create an account" },
            { "name": "balance", "description": "Derived balance for an account" },
            { "name": "grant", "description": "Mint a grant lot" },
            { "name": "reserve", "description": "Reserve credit (idempotent)" },
            { "name": "finalize", "description": "Finalize a reservation at actual cost" },
            { "name": "release", "description": "Release a reservation in full" },
            { "name": "expire-sweep", "description": "Expire stale pending reservations" },
            { "name": "entries", "description": "List ledger entries" }
        ],
        "storage": ["ledger.db"]
    })
}
