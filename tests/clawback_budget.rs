use tempfile::tempdir;
use tidepool::core::config::LedgerConfig;
use tidepool::core::db;
use tidepool::core::store::Store;
use tidepool::plugins::budget::{self, BudgetGuard};
use tidepool::plugins::clawback;
use tidepool::plugins::ledger;

fn test_store() -> (tempfile::TempDir, Store) {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path().to_path_buf();
    db::initialize_ledger_db(&root).expect("ledger init");
    (tmp, Store::new(root))
}

#[test]
fn clawback_with_sufficient_balance_leaves_no_receivable() {
    let (_tmp, store) = test_store();
    let account = ledger::create_account(&store, "person", "").expect("account");
    ledger::grant(&store, &account.id, 1_000, "test", "").expect("grant");

    let outcome =
        clawback::apply_clawback(&store, &account.id, 600, "refund", "test").expect("clawback");
    assert_eq!(outcome.applied_micro, 600);
    assert!(outcome.receivable.is_none());
    assert_eq!(ledger::balance(&store, &account.id).expect("balance"), 400);
}

#[test]
fn clawback_shortfall_becomes_a_receivable_and_conserves() {
    let (_tmp, store) = test_store();
    let account = ledger::create_account(&store, "person", "").expect("account");
    ledger::grant(&store, &account.id, 400, "test", "").expect("grant");

    let outcome =
        clawback::apply_clawback(&store, &account.id, 1_000, "chargeback", "test").expect("clawback");
    assert_eq!(outcome.applied_micro, 400);
    let receivable = outcome.receivable.expect("receivable");
    assert_eq!(receivable.balance_micro, 600);
    // applied + receivable_created == original, always.
    assert_eq!(
        outcome.applied_micro + receivable.amount_original_micro,
        outcome.amount_original_micro
    );
    assert_eq!(ledger::balance(&store, &account.id).expect("balance"), 0);
}

#[test]
fn clawback_drains_newest_lots_first() {
    let (_tmp, store) = test_store();
    let account = ledger::create_account(&store, "person", "").expect("account");
    let older = ledger::grant(&store, &account.id, 100, "test", "").expect("grant older");
    let newer = ledger::grant(&store, &account.id, 50, "test", "").expect("grant newer");

    clawback::apply_clawback(&store, &account.id, 60, "refund", "test").expect("clawback");

    let conn = db::db_connect(&db::ledger_db_path(&store.root).to_string_lossy()).expect("connect");
    let remaining = |lot_id: &str| -> i64 {
        conn.query_row(
            "SELECT amount_remaining_micro FROM lots WHERE id = ?1",
            rusqlite::params![lot_id],
            |row| row.get(0),
        )
        .expect("lot")
    };
    // LIFO: the newer lot empties first.
    assert_eq!(remaining(&newer.id), 0);
    assert_eq!(remaining(&older.id), 90);
}

#[test]
fn drip_recovery_reduces_and_resolves_receivables() {
    let (_tmp, store) = test_store();
    let account = ledger::create_account(&store, "person", "").expect("account");
    clawback::apply_clawback(&store, &account.id, 600, "chargeback", "test").expect("clawback");

    // New earnings arrive; recovery drips from them.
    ledger::grant(&store, &account.id, 500, "test", "earnings").expect("grant");
    let first = clawback::drip_recover(&store, &account.id, 10_000, "test").expect("drip");
    assert_eq!(first.recovered_micro, 500);
    assert!(first.resolved_receivables.is_empty());

    let open = clawback::list_receivables(&store, Some(&account.id), true).expect("open");
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].balance_micro, 100);
    assert!(open[0].resolved_at.is_none());

    ledger::grant(&store, &account.id, 250, "test", "earnings").expect("grant");
    let second = clawback::drip_recover(&store, &account.id, 10_000, "test").expect("drip");
    assert_eq!(second.recovered_micro, 100);
    assert_eq!(second.resolved_receivables.len(), 1);

    let all = clawback::list_receivables(&store, Some(&account.id), false).expect("all");
    assert_eq!(all[0].balance_micro, 0);
    assert!(all[0].resolved_at.is_some());
    // Only the debt was recovered; the rest of the earnings remain.
    assert_eq!(ledger::balance(&store, &account.id).expect("balance"), 150);
}

#[test]
fn drip_with_no_open_debt_is_a_no_op() {
    let (_tmp, store) = test_store();
    let account = ledger::create_account(&store, "person", "").expect("account");
    ledger::grant(&store, &account.id, 500, "test", "").expect("grant");

    let outcome = clawback::drip_recover(&store, &account.id, 10_000, "test").expect("drip");
    assert_eq!(outcome.recovered_micro, 0);
    assert_eq!(ledger::balance(&store, &account.id).expect("balance"), 500);
}

#[test]
fn budget_circuit_walks_closed_warning_open() {
    let (_tmp, store) = test_store();
    let config = LedgerConfig::default();
    let guard = BudgetGuard::new();
    let account = ledger::create_account(&store, "agent", "").expect("account");

    guard
        .set_limit(&store, &config, &account.id, 1_000)
        .expect("set limit");

    let d = guard
        .record_finalization(&store, &config, &account.id, "r1", 500, "test")
        .expect("record");
    assert_eq!(d.circuit_state, budget::CIRCUIT_CLOSED);
    assert!(d.allowed);

    let d = guard
        .record_finalization(&store, &config, &account.id, "r2", 300, "test")
        .expect("record");
    assert_eq!(d.circuit_state, budget::CIRCUIT_WARNING);
    assert!(d.allowed, "warning still allows spend");

    let d = guard
        .record_finalization(&store, &config, &account.id, "r3", 200, "test")
        .expect("record");
    assert_eq!(d.circuit_state, budget::CIRCUIT_OPEN);

    let check = guard.check_budget(&store, &config, &account.id).expect("check");
    assert!(!check.allowed, "open circuit rejects all spend");
}

#[test]
fn record_finalization_is_idempotent_per_reservation() {
    let (_tmp, store) = test_store();
    let config = LedgerConfig::default();
    let guard = BudgetGuard::new();
    let account = ledger::create_account(&store, "agent", "").expect("account");
    guard
        .set_limit(&store, &config, &account.id, 10_000)
        .expect("set limit");

    guard
        .record_finalization(&store, &config, &account.id, "r1", 500, "test")
        .expect("first");
    let d = guard
        .record_finalization(&store, &config, &account.id, "r1", 500, "test")
        .expect("duplicate");
    assert_eq!(d.window_spend_micro, 500, "duplicate adds nothing");
}

#[test]
fn window_rollover_recomputes_from_history_not_zero() {
    let (_tmp, store) = test_store();
    let config = LedgerConfig::default();
    let guard = BudgetGuard::new();
    let account = ledger::create_account(&store, "agent", "").expect("account");
    guard
        .set_limit(&store, &config, &account.id, 1_000)
        .expect("set limit");
    guard
        .record_finalization(&store, &config, &account.id, "r1", 600, "test")
        .expect("record");
    guard
        .record_finalization(&store, &config, &account.id, "r2", 400, "test")
        .expect("record");

    // Simulate a crash that corrupted the counter and left the window far
    // in the past. The roll must rebuild spend from recorded
    // finalizations, not trust the stored zero.
    let conn = db::db_connect(&db::ledger_db_path(&store.root).to_string_lossy()).expect("connect");
    conn.execute(
        "UPDATE spending_limits SET window_spend_micro = 0, window_start = '1Z', circuit_state = 'closed'
         WHERE account_id = ?1",
        rusqlite::params![account.id],
    )
    .expect("corrupt");

    let fresh_guard = BudgetGuard::new();
    let d = fresh_guard
        .check_budget(&store, &config, &account.id)
        .expect("check");
    assert_eq!(d.window_spend_micro, 1_000);
    assert_eq!(d.circuit_state, budget::CIRCUIT_OPEN);
    assert!(!d.allowed);
}

#[test]
fn reset_sweep_rolls_elapsed_windows() {
    let (_tmp, store) = test_store();
    let config = LedgerConfig::default();
    let guard = BudgetGuard::new();
    let account = ledger::create_account(&store, "agent", "").expect("account");
    guard
        .set_limit(&store, &config, &account.id, 1_000)
        .expect("set limit");

    let conn = db::db_connect(&db::ledger_db_path(&store.root).to_string_lossy()).expect("connect");
    conn.execute(
        "UPDATE spending_limits SET window_start = '1Z' WHERE account_id = ?1",
        rusqlite::params![account.id],
    )
    .expect("age window");

    let rolled = guard.reset_windows(&store).expect("sweep");
    assert_eq!(rolled, 1);
    let rolled_again = guard.reset_windows(&store).expect("sweep");
    assert_eq!(rolled_again, 0, "fresh window does not roll twice");
}
