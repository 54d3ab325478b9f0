//! Economic event outbox.
//!
//! Durable, idempotent records of settlement state changes for downstream
//! consumers (notification fan-out, analytics, webhooks back to the
//! platform). Two emission modes: inside the caller's open transaction
//! (dual-write with the primary ledger mutation) or standalone. Duplicate
//! idempotency keys are a silent no-op in both modes, never an error.

use crate::core::broker::DbBroker;
use crate::core::db;
use crate::core::error;
use crate::core::store::Store;
use crate::core::time;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EconomicEvent {
    pub event_id: String,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub correlation_id: Option<String>,
    pub idempotency_key: String,
    pub config_version: String,
    pub payload: JsonValue,
    pub created_at: String,
}

/// Event under construction; the outbox stamps id, version, and timestamp.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub correlation_id: Option<String>,
    pub idempotency_key: String,
    pub payload: JsonValue,
}

/// Insert an event using the caller's active transaction.
///
/// The row commits or rolls back with the caller's primary mutation; a
/// ledger write and its event can never be observed apart. Returns `false`
/// when the idempotency key already exists (duplicate delivery).
pub fn emit_in_txn(conn: &Connection, ev: &NewEvent) -> Result<bool, error::TidepoolError> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO economic_events
         (event_id, event_type, entity_type, entity_id, correlation_id, idempotency_key, config_version, payload, created_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            time::new_event_id(),
            ev.event_type,
            ev.entity_type,
            ev.entity_id,
            ev.correlation_id,
            ev.idempotency_key,
            env!("CARGO_PKG_VERSION"),
            serde_json::to_string(&ev.payload).unwrap(),
            time::now_epoch_z(),
        ],
    )?;
    Ok(inserted == 1)
}

/// Insert an event in its own transaction, for events with no co-dependent
/// ledger mutation.
pub fn emit(store: &Store, actor: &str, ev: &NewEvent) -> Result<bool, error::TidepoolError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::ledger_db_path(&store.root);
    broker.with_txn(&db_path, actor, None, "outbox.emit", |txn| {
        emit_in_txn(txn, ev)
    })
}

pub fn list_events(store: &Store, limit: usize) -> Result<Vec<EconomicEvent>, error::TidepoolError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::ledger_db_path(&store.root);
    broker.with_conn(&db_path, "tidepool", None, "outbox.list", |conn| {
        let mut stmt = conn.prepare(
            "SELECT event_id, event_type, entity_type, entity_id, correlation_id, idempotency_key, config_version, payload, created_at
             FROM economic_events ORDER BY created_at DESC, event_id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(EconomicEvent {
                event_id: row.get(0)?,
                event_type: row.get(1)?,
                entity_type: row.get(2)?,
                entity_id: row.get(3)?,
                correlation_id: row.get(4)?,
                idempotency_key: row.get(5)?,
                config_version: row.get(6)?,
                payload: serde_json::from_str(&row.get::<_, String>(7)?)
                    .unwrap_or(JsonValue::Null),
                created_at: row.get(8)?,
            })
        })?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    })
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "outbox",
        "version": "0.1.0",
        "description": "Idempotent economic event outbox",
        "commands": [
            { "name": "list", "description": "Show recent economic events" }
        ],
        "storage": ["ledger.db"]
    })
}
