use tempfile::tempdir;
use tidepool::core::config::LedgerConfig;
use tidepool::core::db;
use tidepool::core::error::TidepoolError;
use tidepool::core::store::Store;
use tidepool::plugins::rules;

fn test_store() -> (tempfile::TempDir, Store) {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path().to_path_buf();
    db::initialize_ledger_db(&root).expect("ledger init");
    (tmp, Store::new(root))
}

fn fast_config() -> LedgerConfig {
    LedgerConfig {
        rule_cooldown_secs: 0,
        ..LedgerConfig::default()
    }
}

#[test]
fn proposal_with_wrong_bps_sum_is_rejected() {
    let (_tmp, store) = test_store();
    let err = rules::propose(&store, 5_000, 3_000, 2_000, 500, "gov", "").expect_err("sum 10500");
    assert!(matches!(err, TidepoolError::ValidationError(_)));

    let err = rules::propose(&store, -100, 5_100, 4_000, 1_000, "gov", "").expect_err("negative");
    assert!(matches!(err, TidepoolError::ValidationError(_)));
}

#[test]
fn full_lifecycle_reaches_active_with_audit_trail() {
    let (_tmp, store) = test_store();
    let config = fast_config();

    let rule = rules::propose(&store, 4_000, 3_000, 2_000, 1_000, "gov", "launch").expect("propose");
    assert_eq!(rule.status, "draft");

    let rule = rules::submit(&store, &rule.id, "gov").expect("submit");
    assert_eq!(rule.status, "pending_approval");

    let rule = rules::approve(&store, &config, &rule.id, "gov").expect("approve");
    assert_eq!(rule.status, "cooling_down");
    assert!(rule.activates_at.is_some());

    let rule = rules::activate(&store, &rule.id, "gov", false, "").expect("activate");
    assert_eq!(rule.status, "active");
    assert!(rule.activated_at.is_some());

    let trail = rules::audit_trail(&store, &rule.id).expect("audit");
    let transitions: Vec<(String, String)> = trail
        .iter()
        .map(|row| (row.prev_status.clone(), row.new_status.clone()))
        .collect();
    assert_eq!(
        transitions,
        vec![
            ("none".to_string(), "draft".to_string()),
            ("draft".to_string(), "pending_approval".to_string()),
            ("pending_approval".to_string(), "cooling_down".to_string()),
            ("cooling_down".to_string(), "active".to_string()),
        ]
    );
}

#[test]
fn activation_before_cooldown_requires_emergency() {
    let (_tmp, store) = test_store();
    // Default cooldown is a day; the window cannot have elapsed.
    let config = LedgerConfig::default();

    let rule = rules::propose(&store, 2_500, 2_500, 2_500, 2_500, "gov", "").expect("propose");
    rules::submit(&store, &rule.id, "gov").expect("submit");
    rules::approve(&store, &config, &rule.id, "gov").expect("approve");

    let err = rules::activate(&store, &rule.id, "gov", false, "").expect_err("cooling");
    assert!(matches!(err, TidepoolError::StateError(_)));

    // Emergency override needs a reason, and the override is audited.
    let err = rules::activate(&store, &rule.id, "gov", true, "").expect_err("no reason");
    assert!(matches!(err, TidepoolError::ValidationError(_)));

    let rule = rules::activate(&store, &rule.id, "gov", true, "hotfix split").expect("emergency");
    assert_eq!(rule.status, "active");

    let trail = rules::audit_trail(&store, &rule.id).expect("audit");
    let activation = trail
        .iter()
        .find(|row| row.new_status == "active")
        .expect("activation row");
    assert!(activation.emergency);
    assert_eq!(activation.reason, "hotfix split");
}

#[test]
fn activation_supersedes_the_previous_active_rule() {
    let (_tmp, store) = test_store();
    let config = fast_config();

    let first = rules::propose(&store, 4_000, 3_000, 2_000, 1_000, "gov", "").expect("propose");
    rules::submit(&store, &first.id, "gov").expect("submit");
    rules::approve(&store, &config, &first.id, "gov").expect("approve");
    rules::activate(&store, &first.id, "gov", false, "").expect("activate");

    let second = rules::propose(&store, 5_000, 2_500, 1_500, 1_000, "gov", "").expect("propose");
    rules::submit(&store, &second.id, "gov").expect("submit");
    rules::approve(&store, &config, &second.id, "gov").expect("approve");
    rules::activate(&store, &second.id, "gov", false, "").expect("activate");

    let superseded = rules::get_rule(&store, &first.id).expect("first rule");
    assert_eq!(superseded.status, "superseded");
    assert_eq!(superseded.superseded_by, Some(second.id.clone()));

    let active = rules::active_rule(&store).expect("query").expect("one active");
    assert_eq!(active.id, second.id);
}

#[test]
fn only_one_proposal_may_be_open() {
    let (_tmp, store) = test_store();

    let a = rules::propose(&store, 4_000, 3_000, 2_000, 1_000, "gov", "").expect("propose a");
    rules::submit(&store, &a.id, "gov").expect("submit a");

    let b = rules::propose(&store, 2_500, 2_500, 2_500, 2_500, "gov", "").expect("propose b");
    let err = rules::submit(&store, &b.id, "gov").expect_err("open proposal exists");
    assert!(matches!(err, TidepoolError::ConflictError(_)));
}

#[test]
fn rejected_rules_are_terminal() {
    let (_tmp, store) = test_store();
    let config = fast_config();

    let rule = rules::propose(&store, 4_000, 3_000, 2_000, 1_000, "gov", "").expect("propose");
    rules::submit(&store, &rule.id, "gov").expect("submit");
    let rule = rules::reject(&store, &rule.id, "gov", "bad split").expect("reject");
    assert_eq!(rule.status, "rejected");

    let err = rules::approve(&store, &config, &rule.id, "gov").expect_err("terminal");
    assert!(matches!(err, TidepoolError::StateError(_)));
    let err = rules::activate(&store, &rule.id, "gov", true, "x").expect_err("terminal");
    assert!(matches!(err, TidepoolError::StateError(_)));
}

#[test]
fn reject_also_reachable_from_cooling_down() {
    let (_tmp, store) = test_store();
    let config = LedgerConfig::default();

    let rule = rules::propose(&store, 4_000, 3_000, 2_000, 1_000, "gov", "").expect("propose");
    rules::submit(&store, &rule.id, "gov").expect("submit");
    rules::approve(&store, &config, &rule.id, "gov").expect("approve");
    let rule = rules::reject(&store, &rule.id, "council", "second thoughts").expect("reject");
    assert_eq!(rule.status, "rejected");
}

#[test]
fn draft_cannot_be_activated_directly() {
    let (_tmp, store) = test_store();
    let rule = rules::propose(&store, 4_000, 3_000, 2_000, 1_000, "gov", "").expect("propose");
    let err = rules::activate(&store, &rule.id, "gov", true, "x").expect_err("draft");
    assert!(matches!(err, TidepoolError::StateError(_)));
}
