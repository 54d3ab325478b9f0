use crate::core::broker::DbBroker;
use crate::core::error;
use crate::core::schemas;
use crate::core::time;
use rusqlite::{Connection, params};
use std::fs;
use std::path::{Path, PathBuf};

pub fn db_connect(db_path: &str) -> Result<Connection, error::TidepoolError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(error::TidepoolError::RusqliteError)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(error::TidepoolError::RusqliteError)?;
    conn.execute("PRAGMA foreign_keys=ON;", [])
        .map_err(error::TidepoolError::RusqliteError)?;
    Ok(conn)
}

pub fn ledger_db_path(root: &Path) -> PathBuf {
    root.join(schemas::LEDGER_DB_NAME)
}

/// Create the ledger bin: full DDL, schema version stamp, and the treasury
/// singleton row (version 1, zero reserve) if absent.
pub fn initialize_ledger_db(root: &Path) -> Result<(), error::TidepoolError> {
    let db_path = ledger_db_path(root);
    let parent_dir = db_path.parent().ok_or_else(|| {
        error::TidepoolError::DatabaseInitializationError(format!(
            "ledger db path has no parent: {}",
            db_path.display()
        ))
    })?;
    fs::create_dir_all(parent_dir).map_err(error::TidepoolError::IoError)?;

    let broker = DbBroker::new(root);
    broker.with_conn(&db_path, "tidepool", None, "ledger.init", |conn| {
        for ddl in schemas::LEDGER_DB_ALL_SCHEMAS {
            conn.execute(ddl, [])?;
        }
        conn.execute(
            "INSERT INTO meta(key, value) VALUES('schema_version', ?1)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![schemas::LEDGER_SCHEMA_VERSION.to_string()],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO treasury_state(id, version, reserve_balance_micro, updated_at)
             VALUES(1, 1, 0, ?1)",
            params![time::now_epoch_z()],
        )?;
        Ok(())
    })?;

    Ok(())
}
