use tempfile::tempdir;
use tidepool::core::config::LedgerConfig;
use tidepool::core::db;
use tidepool::core::error::TidepoolError;
use tidepool::core::store::Store;
use tidepool::plugins::clawback;
use tidepool::plugins::ledger;
use tidepool::plugins::payout;

fn test_store() -> (tempfile::TempDir, Store) {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path().to_path_buf();
    db::initialize_ledger_db(&root).expect("ledger init");
    (tmp, Store::new(root))
}

fn funded_account(store: &Store, amount: i64) -> String {
    let account = ledger::create_account(store, "person", "").expect("account");
    ledger::grant(store, &account.id, amount, "test", "").expect("grant");
    account.id
}

#[test]
fn request_holds_gross_and_computes_fee() {
    let (_tmp, store) = test_store();
    let config = LedgerConfig::default(); // payout_fee_bps = 250
    let account = funded_account(&store, 10_000_000);

    let outcome =
        payout::request_payout(&store, &config, &account, 1_000_000, "po-1", "test").expect("request");
    assert!(outcome.created);
    assert_eq!(outcome.payout.status, "pending");
    assert_eq!(outcome.payout.fee_micro, 25_000);
    assert_eq!(outcome.payout.net_micro, 975_000);
    // Gross held via reservation.
    assert_eq!(ledger::balance(&store, &account).expect("balance"), 9_000_000);
}

#[test]
fn duplicate_request_returns_existing_payout() {
    let (_tmp, store) = test_store();
    let config = LedgerConfig::default();
    let account = funded_account(&store, 5_000_000);

    let first =
        payout::request_payout(&store, &config, &account, 1_000_000, "po-dup", "test").expect("first");
    let second =
        payout::request_payout(&store, &config, &account, 1_000_000, "po-dup", "test").expect("second");
    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.payout.id, second.payout.id);
    // Only one hold.
    assert_eq!(ledger::balance(&store, &account).expect("balance"), 4_000_000);
}

#[test]
fn completion_drains_treasury_by_net_and_bumps_version() {
    let (_tmp, store) = test_store();
    let config = LedgerConfig::default();
    let account = funded_account(&store, 5_000_000);

    payout::credit_reserve(&store, &config, 2_000_000, "test").expect("fund treasury");
    let before = payout::treasury_state(&store).expect("state");

    let outcome =
        payout::request_payout(&store, &config, &account, 1_000_000, "po-2", "test").expect("request");
    payout::approve_payout(&store, &outcome.payout.id, "test").expect("approve");
    payout::begin_processing(&store, &outcome.payout.id, "test").expect("process");
    let done = payout::complete_payout(&store, &config, &outcome.payout.id, "test").expect("complete");
    assert_eq!(done.status, "completed");

    let after = payout::treasury_state(&store).expect("state");
    assert_eq!(
        after.reserve_balance_micro,
        before.reserve_balance_micro - 975_000
    );
    assert_eq!(after.version, before.version + 1);
    // Gross stays consumed from the account.
    assert_eq!(ledger::balance(&store, &account).expect("balance"), 4_000_000);
}

#[test]
fn cancellation_and_failure_restore_the_hold() {
    let (_tmp, store) = test_store();
    let config = LedgerConfig::default();
    let account = funded_account(&store, 3_000_000);

    let cancelled =
        payout::request_payout(&store, &config, &account, 1_000_000, "po-c", "test").expect("request");
    payout::cancel_payout(&store, &cancelled.payout.id, "test").expect("cancel");
    assert_eq!(ledger::balance(&store, &account).expect("balance"), 3_000_000);

    let failed =
        payout::request_payout(&store, &config, &account, 500_000, "po-f", "test").expect("request");
    payout::approve_payout(&store, &failed.payout.id, "test").expect("approve");
    payout::begin_processing(&store, &failed.payout.id, "test").expect("process");
    let p = payout::fail_payout(&store, &failed.payout.id, "bank rejected", "test").expect("fail");
    assert_eq!(p.status, "failed");
    assert_eq!(p.failure_reason.as_deref(), Some("bank rejected"));
    assert_eq!(ledger::balance(&store, &account).expect("balance"), 3_000_000);
}

#[test]
fn quarantine_holds_funds_until_review_resolves() {
    let (_tmp, store) = test_store();
    let config = LedgerConfig::default();
    let account = funded_account(&store, 2_000_000);

    let outcome =
        payout::request_payout(&store, &config, &account, 1_000_000, "po-q", "test").expect("request");
    let q = payout::quarantine_payout(&store, &outcome.payout.id, "velocity flag", "test")
        .expect("quarantine");
    assert_eq!(q.status, "quarantined");
    // Hold stays while under review.
    assert_eq!(ledger::balance(&store, &account).expect("balance"), 1_000_000);

    let back = payout::release_quarantine(&store, &outcome.payout.id, "test").expect("resume");
    assert_eq!(back.status, "pending");
    payout::cancel_payout(&store, &outcome.payout.id, "test").expect("cancel");
    assert_eq!(ledger::balance(&store, &account).expect("balance"), 2_000_000);
}

#[test]
fn illegal_transitions_are_rejected() {
    let (_tmp, store) = test_store();
    let config = LedgerConfig::default();
    let account = funded_account(&store, 2_000_000);

    let outcome =
        payout::request_payout(&store, &config, &account, 1_000_000, "po-x", "test").expect("request");
    // pending -> completed skips approval and processing.
    let err = payout::complete_payout(&store, &config, &outcome.payout.id, "test")
        .expect_err("skip states");
    assert!(matches!(err, TidepoolError::StateError(_)));

    payout::cancel_payout(&store, &outcome.payout.id, "test").expect("cancel");
    let err = payout::approve_payout(&store, &outcome.payout.id, "test").expect_err("terminal");
    assert!(matches!(err, TidepoolError::StateError(_)));
}

#[test]
fn treasury_operations_bump_version_one_at_a_time() {
    let (_tmp, store) = test_store();
    let config = LedgerConfig::default();

    let v0 = payout::treasury_state(&store).expect("state");
    payout::credit_reserve(&store, &config, 700, "a").expect("credit a");
    payout::credit_reserve(&store, &config, 300, "b").expect("credit b");
    let v2 = payout::treasury_state(&store).expect("state");

    // Both read-modify-write cycles landed; each consumed exactly one
    // version.
    assert_eq!(v2.version, v0.version + 2);
    assert_eq!(v2.reserve_balance_micro, v0.reserve_balance_micro + 1_000);
}

#[test]
fn stale_version_write_is_rejected_by_the_store() {
    let (_tmp, store) = test_store();
    let config = LedgerConfig::default();
    payout::credit_reserve(&store, &config, 1_000, "test").expect("credit");

    // A writer that read version N cannot land after another writer moved
    // the row to N+1.
    let conn = db::db_connect(&db::ledger_db_path(&store.root).to_string_lossy()).expect("connect");
    let state = payout::treasury_state(&store).expect("state");
    let stale_version = state.version - 1;
    let changed = conn
        .execute(
            "UPDATE treasury_state SET version = version + 1, reserve_balance_micro = 0
             WHERE id = 1 AND version = ?1",
            rusqlite::params![stale_version],
        )
        .expect("update");
    assert_eq!(changed, 0);
    assert_eq!(
        payout::treasury_state(&store).expect("state").reserve_balance_micro,
        1_000
    );
}

#[test]
fn reserve_floor_protects_open_receivables() {
    let (_tmp, store) = test_store();
    let config = LedgerConfig::default();

    // An underfunded clawback leaves an open receivable.
    let account = funded_account(&store, 400);
    let outcome = clawback::apply_clawback(&store, &account, 1_000, "refund", "test").expect("clawback");
    let receivable = outcome.receivable.expect("shortfall receivable");
    assert_eq!(receivable.balance_micro, 600);

    payout::credit_reserve(&store, &config, 1_000, "test").expect("credit");
    // Debiting below the 600 floor must fail.
    let err = payout::debit_reserve(&store, &config, 500, "test").expect_err("floor");
    assert!(matches!(err, TidepoolError::InsufficientBalance(_)));
    // Debiting down to exactly the floor is fine.
    payout::debit_reserve(&store, &config, 400, "test").expect("to floor");
}

#[test]
fn payout_exceeding_balance_fails_at_request() {
    let (_tmp, store) = test_store();
    let config = LedgerConfig::default();
    let account = funded_account(&store, 100_000);
    let err = payout::request_payout(&store, &config, &account, 1_000_000, "po-big", "test")
        .expect_err("too big");
    assert!(matches!(err, TidepoolError::InsufficientBalance(_)));
    assert_eq!(ledger::balance(&store, &account).expect("balance"), 100_000);
}
