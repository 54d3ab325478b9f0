use tempfile::tempdir;
use tidepool::core::config::LedgerConfig;
use tidepool::core::db;
use tidepool::core::error::TidepoolError;
use tidepool::core::store::Store;
use tidepool::plugins::distribution::{self, Participant};
use tidepool::plugins::ledger;
use tidepool::plugins::rules;

fn test_store() -> (tempfile::TempDir, Store) {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path().to_path_buf();
    db::initialize_ledger_db(&root).expect("ledger init");
    (tmp, Store::new(root))
}

fn accounts(store: &Store, kinds: &[&str]) -> Vec<String> {
    kinds
        .iter()
        .map(|kind| {
            ledger::create_account(store, kind, "")
                .expect("account")
                .id
        })
        .collect()
}

#[test]
fn distribution_credits_shares_that_conserve_the_pool() {
    let (_tmp, store) = test_store();
    let config = LedgerConfig::default();
    let ids = accounts(&store, &["agent", "agent", "agent"]);
    let participants: Vec<Participant> = ids
        .iter()
        .zip([50, 30, 20])
        .map(|(id, weight)| Participant {
            account_id: id.clone(),
            weight,
        })
        .collect();

    let outcome = distribution::run_distribution(
        &store,
        &config,
        "2026-08",
        10_000_000,
        &participants,
        None,
        "test",
    )
    .expect("distribution");

    let total: i64 = outcome.shares.iter().map(|s| s.share_micro).sum();
    assert_eq!(total, 10_000_000);

    // Shares became dividend lots.
    let balances: Vec<i64> = ids
        .iter()
        .map(|id| ledger::balance(&store, id).expect("balance"))
        .collect();
    let mut sorted = balances.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, vec![2_000_000, 3_000_000, 5_000_000]);
}

#[test]
fn rerun_of_same_period_is_rejected_without_side_effects() {
    let (_tmp, store) = test_store();
    let config = LedgerConfig::default();
    let ids = accounts(&store, &["agent", "agent"]);
    let participants: Vec<Participant> = ids
        .iter()
        .map(|id| Participant {
            account_id: id.clone(),
            weight: 1,
        })
        .collect();

    distribution::run_distribution(&store, &config, "2026-07", 10_000, &participants, None, "test")
        .expect("first run");
    let err = distribution::run_distribution(
        &store,
        &config,
        "2026-07",
        10_000,
        &participants,
        None,
        "test",
    )
    .expect_err("second run must fail");
    assert!(matches!(err, TidepoolError::ConflictError(_)));
    assert!(err.to_string().contains("ALREADY_DISTRIBUTED"));

    // Balances unchanged by the rejected rerun.
    let total: i64 = ids
        .iter()
        .map(|id| ledger::balance(&store, id).expect("balance"))
        .sum();
    assert_eq!(total, 10_000);
}

#[test]
fn pools_below_threshold_are_rejected_before_computation() {
    let (_tmp, store) = test_store();
    let config = LedgerConfig::default(); // min_pool_micro = 1000
    let ids = accounts(&store, &["agent"]);
    let participants = vec![Participant {
        account_id: ids[0].clone(),
        weight: 1,
    }];

    let err =
        distribution::run_distribution(&store, &config, "2026-06", 500, &participants, None, "test")
            .expect_err("below threshold");
    assert!(err.to_string().contains("BELOW_THRESHOLD"));
    assert!(distribution::get_distribution(&store, "2026-06")
        .expect("lookup")
        .is_none());
}

#[test]
fn empty_participant_set_changes_nothing() {
    let (_tmp, store) = test_store();
    let config = LedgerConfig::default();
    let err = distribution::run_distribution(&store, &config, "2026-05", 10_000, &[], None, "test")
        .expect_err("no participants");
    assert!(err.to_string().contains("NO_PARTICIPANTS"));
    assert!(distribution::get_distribution(&store, "2026-05")
        .expect("lookup")
        .is_none());
}

#[test]
fn malformed_period_keys_are_rejected() {
    let (_tmp, store) = test_store();
    let config = LedgerConfig::default();
    let ids = accounts(&store, &["agent"]);
    let participants = vec![Participant {
        account_id: ids[0].clone(),
        weight: 1,
    }];
    let err = distribution::run_distribution(
        &store,
        &config,
        "august-2026",
        10_000,
        &participants,
        None,
        "test",
    )
    .expect_err("bad period key");
    assert!(matches!(err, TidepoolError::ValidationError(_)));
}

#[test]
fn revenue_split_follows_the_active_rule() {
    let (_tmp, store) = test_store();
    let config = LedgerConfig {
        rule_cooldown_secs: 0,
        ..LedgerConfig::default()
    };
    let ids = accounts(&store, &["commons", "community", "foundation", "person"]);

    let rule = rules::propose(&store, 4_000, 3_000, 2_000, 1_000, "governor", "initial split")
        .expect("propose");
    rules::submit(&store, &rule.id, "governor").expect("submit");
    rules::approve(&store, &config, &rule.id, "governor").expect("approve");
    rules::activate(&store, &rule.id, "governor", false, "").expect("activate");

    let outcome = distribution::run_revenue_split(
        &store,
        &config,
        "2026-08-01",
        1_000_000,
        &ids[0],
        &ids[1],
        &ids[2],
        &ids[3],
        "test",
    )
    .expect("revenue split");

    assert_eq!(outcome.distribution.rule_id, Some(rule.id.clone()));
    assert_eq!(ledger::balance(&store, &ids[0]).expect("balance"), 400_000);
    assert_eq!(ledger::balance(&store, &ids[1]).expect("balance"), 300_000);
    assert_eq!(ledger::balance(&store, &ids[2]).expect("balance"), 200_000);
    assert_eq!(ledger::balance(&store, &ids[3]).expect("balance"), 100_000);
}

#[test]
fn revenue_split_without_active_rule_fails() {
    let (_tmp, store) = test_store();
    let config = LedgerConfig::default();
    let ids = accounts(&store, &["commons", "community", "foundation", "person"]);
    let err = distribution::run_revenue_split(
        &store,
        &config,
        "2026-08-02",
        1_000_000,
        &ids[0],
        &ids[1],
        &ids[2],
        &ids[3],
        "test",
    )
    .expect_err("no rule");
    assert!(matches!(err, TidepoolError::NotFound(_)));
}
