//! Store abstraction for Tidepool's ledger state.
//!
//! A deployment owns exactly one authoritative store: the correctness model
//! (idempotency keys, check-and-set activation, conditional sweeps) assumes
//! every financial mutation lands in the same transactional SQLite database.

use std::path::PathBuf;

/// Store handle representing a Tidepool deployment's data directory.
///
/// All subsystem state (ledger, rules, payouts, outbox, budgets) is scoped
/// to a store. Callers construct one from the resolved `.tidepool/data`
/// root and pass it explicitly; there is no hidden global store.
#[derive(Debug, Clone)]
pub struct Store {
    /// Absolute path to the store root directory.
    pub root: PathBuf,
}

impl Store {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}
