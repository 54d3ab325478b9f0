use std::cell::Cell;
use tempfile::tempdir;
use tidepool::core::config::LedgerConfig;
use tidepool::core::db;
use tidepool::core::error::TidepoolError;
use tidepool::core::store::Store;
use tidepool::plugins::deposits::{
    self, ChainVerifier, ConfirmationThreshold, DepositDetection, PaymentProof,
};
use tidepool::plugins::ledger;
use tidepool::plugins::outbox::{self, NewEvent};

fn test_store() -> (tempfile::TempDir, Store) {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path().to_path_buf();
    db::initialize_ledger_db(&root).expect("ledger init");
    (tmp, Store::new(root))
}

fn proof(account_id: &str, payment_ref: &str, amount: i64) -> PaymentProof {
    PaymentProof {
        provider: "paddle".to_string(),
        payment_ref: payment_ref.to_string(),
        account_id: account_id.to_string(),
        amount_micro: amount,
        correlation_id: None,
    }
}

#[test]
fn webhook_credits_once_and_flags_duplicates() {
    let (_tmp, store) = test_store();
    let account = ledger::create_account(&store, "person", "").expect("account");

    let first =
        deposits::process_webhook(&store, &proof(&account.id, "order-1", 5_000_000), "webhook")
            .expect("first");
    assert!(!first.duplicate);
    assert_eq!(ledger::balance(&store, &account.id).expect("balance"), 5_000_000);

    let second =
        deposits::process_webhook(&store, &proof(&account.id, "order-1", 5_000_000), "webhook")
            .expect("second");
    assert!(second.duplicate);
    assert_eq!(second.lot_id, first.lot_id);
    // No second lot, no double credit.
    assert_eq!(ledger::balance(&store, &account.id).expect("balance"), 5_000_000);
}

#[test]
fn distinct_references_mint_distinct_lots() {
    let (_tmp, store) = test_store();
    let account = ledger::create_account(&store, "person", "").expect("account");

    let a = deposits::process_webhook(&store, &proof(&account.id, "order-1", 1_000), "webhook")
        .expect("a");
    let b = deposits::process_webhook(&store, &proof(&account.id, "order-2", 2_000), "webhook")
        .expect("b");
    assert_ne!(a.lot_id, b.lot_id);
    assert_eq!(ledger::balance(&store, &account.id).expect("balance"), 3_000);
}

#[test]
fn unconfirmed_chain_deposit_is_never_minted() {
    let (_tmp, store) = test_store();
    let config = LedgerConfig::default();
    let account = ledger::create_account(&store, "person", "").expect("account");

    let detection = DepositDetection {
        chain: "base".to_string(),
        tx_hash: "0xdead".to_string(),
        account_id: account.id.clone(),
        amount_micro: 9_000,
        confirmations: 1,
    };
    let verifier = ConfirmationThreshold { min_confirmations: 6 };
    let err = deposits::bridge_deposit(&store, &config, &detection, &verifier, "watcher")
        .expect_err("unconfirmed");
    assert!(matches!(err, TidepoolError::ValidationError(_)));
    assert_eq!(ledger::balance(&store, &account.id).expect("balance"), 0);
}

#[test]
fn confirmed_chain_deposit_mints_once() {
    let (_tmp, store) = test_store();
    let config = LedgerConfig::default();
    let account = ledger::create_account(&store, "person", "").expect("account");

    let detection = DepositDetection {
        chain: "base".to_string(),
        tx_hash: "0xbeef".to_string(),
        account_id: account.id.clone(),
        amount_micro: 9_000,
        confirmations: 8,
    };
    let verifier = ConfirmationThreshold { min_confirmations: 6 };

    let first = deposits::bridge_deposit(&store, &config, &detection, &verifier, "watcher")
        .expect("confirmed");
    assert!(!first.duplicate);

    // The watcher re-delivers the same tx later with more confirmations.
    let redelivered = DepositDetection {
        confirmations: 20,
        ..detection
    };
    let second = deposits::bridge_deposit(&store, &config, &redelivered, &verifier, "watcher")
        .expect("redelivery");
    assert!(second.duplicate);
    assert_eq!(ledger::balance(&store, &account.id).expect("balance"), 9_000);
}

struct FlakyVerifier {
    failures_left: Cell<u32>,
}

impl ChainVerifier for FlakyVerifier {
    fn verify(&self, _detection: &DepositDetection) -> Result<bool, TidepoolError> {
        if self.failures_left.get() > 0 {
            self.failures_left.set(self.failures_left.get() - 1);
            return Err(TidepoolError::ConcurrencyError("rpc timeout".to_string()));
        }
        Ok(true)
    }
}

#[test]
fn transient_verifier_failures_are_retried_with_backoff() {
    let (_tmp, store) = test_store();
    let config = LedgerConfig {
        deposit_verify_attempts: 4,
        deposit_backoff_ms: 1,
        ..LedgerConfig::default()
    };
    let account = ledger::create_account(&store, "person", "").expect("account");

    let detection = DepositDetection {
        chain: "base".to_string(),
        tx_hash: "0xretry".to_string(),
        account_id: account.id.clone(),
        amount_micro: 4_000,
        confirmations: 10,
    };
    let verifier = FlakyVerifier {
        failures_left: Cell::new(2),
    };
    let outcome = deposits::bridge_deposit(&store, &config, &detection, &verifier, "watcher")
        .expect("eventually verifies");
    assert!(!outcome.duplicate);
    assert_eq!(ledger::balance(&store, &account.id).expect("balance"), 4_000);
}

#[test]
fn exhausted_retries_surface_the_last_error() {
    let (_tmp, store) = test_store();
    let config = LedgerConfig {
        deposit_verify_attempts: 2,
        deposit_backoff_ms: 1,
        ..LedgerConfig::default()
    };
    let account = ledger::create_account(&store, "person", "").expect("account");

    let detection = DepositDetection {
        chain: "base".to_string(),
        tx_hash: "0xdown".to_string(),
        account_id: account.id.clone(),
        amount_micro: 4_000,
        confirmations: 10,
    };
    let verifier = FlakyVerifier {
        failures_left: Cell::new(10),
    };
    let err = deposits::bridge_deposit(&store, &config, &detection, &verifier, "watcher")
        .expect_err("rpc never recovers");
    assert!(err.is_retryable());
    assert_eq!(ledger::balance(&store, &account.id).expect("balance"), 0);
}

#[test]
fn outbox_emission_is_idempotent_on_key() {
    let (_tmp, store) = test_store();
    let event = NewEvent {
        event_type: "subscription.renewed".to_string(),
        entity_type: "subscription".to_string(),
        entity_id: "sub-1".to_string(),
        correlation_id: None,
        idempotency_key: "renewal:sub-1:2026-08".to_string(),
        payload: serde_json::json!({ "plan": "pro" }),
    };
    assert!(outbox::emit(&store, "test", &event).expect("first emit"));
    assert!(!outbox::emit(&store, "test", &event).expect("duplicate emit is a no-op"));

    let events = outbox::list_events(&store, 50).expect("list");
    let renewals: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == "subscription.renewed")
        .collect();
    assert_eq!(renewals.len(), 1);
}

#[test]
fn deposit_emits_exactly_one_outbox_event() {
    let (_tmp, store) = test_store();
    let account = ledger::create_account(&store, "person", "").expect("account");

    deposits::process_webhook(&store, &proof(&account.id, "order-9", 1_000), "webhook")
        .expect("first");
    deposits::process_webhook(&store, &proof(&account.id, "order-9", 1_000), "webhook")
        .expect("duplicate");

    let events = outbox::list_events(&store, 50).expect("list");
    let credited: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == "deposit.credited")
        .collect();
    assert_eq!(credited.len(), 1);
}
