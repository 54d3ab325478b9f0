use tempfile::tempdir;
use tidepool::core::config::LedgerConfig;
use tidepool::core::db;
use tidepool::core::store::Store;
use tidepool::plugins::budget::BudgetGuard;
use tidepool::plugins::clawback;
use tidepool::plugins::ledger;
use tidepool::plugins::reconcile;

fn test_store() -> (tempfile::TempDir, Store) {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path().to_path_buf();
    db::initialize_ledger_db(&root).expect("ledger init");
    (tmp, Store::new(root))
}

/// A store with the full range of activity: grants, reservations in every
/// state, a clawback with shortfall, a drip, and budget records.
fn busy_store() -> (tempfile::TempDir, Store, String) {
    let (tmp, store) = test_store();
    let config = LedgerConfig::default();
    let account = ledger::create_account(&store, "agent", "").expect("account");

    ledger::grant(&store, &account.id, 10_000, "test", "").expect("grant");

    let finalized = ledger::reserve(&store, &account.id, 2_000, "f", "test").expect("reserve");
    ledger::finalize(&store, &finalized.reservation.id, 1_200, "test").expect("finalize");

    let released = ledger::reserve(&store, &account.id, 1_500, "r", "test").expect("reserve");
    ledger::release(&store, &released.reservation.id, "test").expect("release");

    ledger::reserve(&store, &account.id, 3_000, "p", "test").expect("still pending");

    clawback::apply_clawback(&store, &account.id, 9_000, "chargeback", "test").expect("clawback");
    ledger::grant(&store, &account.id, 1_000, "test", "earnings").expect("grant");
    clawback::drip_recover(&store, &account.id, 700, "test").expect("drip");

    let guard = BudgetGuard::new();
    guard
        .record_finalization(&store, &config, &account.id, &finalized.reservation.id, 1_200, "test")
        .expect("budget record");

    (tmp, store, account.id)
}

#[test]
fn clean_store_reconciles_without_findings() {
    let (_tmp, store, _account) = busy_store();
    let report = reconcile::run_reconciliation(&store).expect("reconcile");
    assert!(
        report.is_clean(),
        "unexpected findings: {:?}",
        report.findings
    );
    assert!(report.lots_checked >= 2);
    assert_eq!(report.receivable_accounts_checked, 1);
    assert_eq!(report.budgets_checked, 1);
}

#[test]
fn lot_divergence_is_reported_not_corrected() {
    let (_tmp, store, _account) = busy_store();

    let conn = db::db_connect(&db::ledger_db_path(&store.root).to_string_lossy()).expect("connect");
    let lot_id: String = conn
        .query_row("SELECT id FROM lots ORDER BY created_at ASC LIMIT 1", [], |row| row.get(0))
        .expect("lot");
    conn.execute(
        "UPDATE lots SET amount_remaining_micro = amount_remaining_micro + 5 WHERE id = ?1",
        rusqlite::params![lot_id],
    )
    .expect("inject divergence");

    let report = reconcile::run_reconciliation(&store).expect("reconcile");
    let finding = report
        .findings
        .iter()
        .find(|f| f.check_name == reconcile::CHECK_LOT_CONSERVATION)
        .expect("lot finding");
    assert_eq!(finding.subject_id, lot_id);

    // Alert-only: the corrupted value is still there.
    let remaining: i64 = conn
        .query_row(
            "SELECT amount_remaining_micro FROM lots WHERE id = ?1",
            rusqlite::params![lot_id],
            |row| row.get(0),
        )
        .expect("lot");
    let report2 = reconcile::run_reconciliation(&store).expect("second run");
    let remaining_after: i64 = conn
        .query_row(
            "SELECT amount_remaining_micro FROM lots WHERE id = ?1",
            rusqlite::params![lot_id],
            |row| row.get(0),
        )
        .expect("lot");
    assert_eq!(remaining, remaining_after);
    assert!(!report2.is_clean());
}

#[test]
fn receivable_divergence_is_reported() {
    let (_tmp, store, account) = busy_store();

    let conn = db::db_connect(&db::ledger_db_path(&store.root).to_string_lossy()).expect("connect");
    conn.execute(
        "UPDATE clawback_receivables SET balance_micro = balance_micro + 7 WHERE account_id = ?1",
        rusqlite::params![account],
    )
    .expect("inject divergence");

    let report = reconcile::run_reconciliation(&store).expect("reconcile");
    assert!(report
        .findings
        .iter()
        .any(|f| f.check_name == reconcile::CHECK_RECEIVABLE_CONSISTENCY));
}

#[test]
fn budget_divergence_is_reported() {
    let (_tmp, store, account) = busy_store();

    let conn = db::db_connect(&db::ledger_db_path(&store.root).to_string_lossy()).expect("connect");
    conn.execute(
        "UPDATE spending_limits SET window_spend_micro = 999999 WHERE account_id = ?1",
        rusqlite::params![account],
    )
    .expect("inject divergence");

    let report = reconcile::run_reconciliation(&store).expect("reconcile");
    let finding = report
        .findings
        .iter()
        .find(|f| f.check_name == reconcile::CHECK_BUDGET_CONSISTENCY)
        .expect("budget finding");
    assert_eq!(finding.subject_id, account);
    assert_eq!(finding.detail["stored_spend_micro"], 999999);
    assert_eq!(finding.detail["derived_spend_micro"], 1_200);
}

#[test]
fn findings_are_persisted_and_listable() {
    let (_tmp, store, account) = busy_store();

    let conn = db::db_connect(&db::ledger_db_path(&store.root).to_string_lossy()).expect("connect");
    conn.execute(
        "UPDATE spending_limits SET window_spend_micro = 1 WHERE account_id = ?1",
        rusqlite::params![account],
    )
    .expect("inject divergence");

    let report = reconcile::run_reconciliation(&store).expect("reconcile");
    assert!(!report.is_clean());

    let listed = reconcile::list_findings(&store, 10).expect("list");
    assert_eq!(listed.len(), report.findings.len());
}
