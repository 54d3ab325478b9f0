//! Centralized database schema definitions for the Tidepool ledger bin.
//!
//! Tidepool keeps every settlement subsystem in a single consolidated
//! SQLite database (`ledger.db`). One bin, one transaction scope: the
//! outbox dual-write, budget recording, and revenue splits all commit
//! atomically with the ledger mutation they accompany, which is impossible
//! across separate database files.
//!
//! Conventions: TEXT ULID primary keys, TEXT epoch-seconds timestamps with
//! a `Z` suffix, INTEGER micro-USD amounts. Rows in `ledger_entries`,
//! `revenue_rule_audit`, and `reconciliation_findings` are append-only.

pub const LEDGER_DB_NAME: &str = "ledger.db";
pub const LEDGER_SCHEMA_VERSION: u32 = 3;

pub const LEDGER_DB_SCHEMA_META: &str = "
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
";

// --- Accounts & lots ---

pub const LEDGER_DB_SCHEMA_ACCOUNTS: &str = "
    CREATE TABLE IF NOT EXISTS accounts (
        id TEXT PRIMARY KEY,
        entity_kind TEXT NOT NULL, -- agent, person, community, mod, protocol, foundation, commons
        display_name TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL
    )
";

pub const LEDGER_DB_SCHEMA_LOTS: &str = "
    CREATE TABLE IF NOT EXISTS lots (
        id TEXT PRIMARY KEY,
        account_id TEXT NOT NULL,
        source_kind TEXT NOT NULL, -- deposit, grant, purchase, transfer, dividend
        source_ref TEXT,           -- external reference (payment fingerprint, tx hash)
        amount_original_micro INTEGER NOT NULL,
        amount_remaining_micro INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        FOREIGN KEY(account_id) REFERENCES accounts(id)
    )
";
pub const LEDGER_DB_SCHEMA_LOTS_ACCOUNT_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_lots_account ON lots(account_id, created_at)";
pub const LEDGER_DB_SCHEMA_LOTS_SOURCE_REF_INDEX: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_lots_source_ref ON lots(source_ref)
     WHERE source_ref IS NOT NULL";

// --- Reservations ---

pub const LEDGER_DB_SCHEMA_RESERVATIONS: &str = "
    CREATE TABLE IF NOT EXISTS reservations (
        id TEXT PRIMARY KEY,
        account_id TEXT NOT NULL,
        amount_micro INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending', -- pending, finalized, released, expired
        idempotency_key TEXT NOT NULL UNIQUE,
        finalized_cost_micro INTEGER,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        FOREIGN KEY(account_id) REFERENCES accounts(id)
    )
";
pub const LEDGER_DB_SCHEMA_RESERVATIONS_STATUS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_reservations_status ON reservations(status, created_at)";

/// Per-lot holds backing a reservation; restoration on release/expire and
/// surplus return on finalize go back to exactly these lots.
pub const LEDGER_DB_SCHEMA_RESERVATION_LOTS: &str = "
    CREATE TABLE IF NOT EXISTS reservation_lots (
        reservation_id TEXT NOT NULL,
        lot_id TEXT NOT NULL,
        amount_micro INTEGER NOT NULL,
        PRIMARY KEY(reservation_id, lot_id),
        FOREIGN KEY(reservation_id) REFERENCES reservations(id),
        FOREIGN KEY(lot_id) REFERENCES lots(id)
    )
";

// --- Append-only ledger entries ---

pub const LEDGER_DB_SCHEMA_ENTRIES: &str = "
    CREATE TABLE IF NOT EXISTS ledger_entries (
        id TEXT PRIMARY KEY,
        account_id TEXT NOT NULL,
        entry_kind TEXT NOT NULL, -- deposit, grant, purchase, transfer, reserve, finalize, release, expire, refund, clawback, revenue_share, payout, escrow
        amount_micro INTEGER NOT NULL,
        reservation_id TEXT,
        lot_id TEXT,
        correlation_id TEXT,
        note TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        FOREIGN KEY(account_id) REFERENCES accounts(id)
    )
";
pub const LEDGER_DB_SCHEMA_ENTRIES_ACCOUNT_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_entries_account ON ledger_entries(account_id, created_at)";

// --- Revenue rules & audit ---

pub const LEDGER_DB_SCHEMA_REVENUE_RULES: &str = "
    CREATE TABLE IF NOT EXISTS revenue_rules (
        id TEXT PRIMARY KEY,
        status TEXT NOT NULL DEFAULT 'draft', -- draft, pending_approval, cooling_down, active, superseded, rejected
        commons_bps INTEGER NOT NULL,
        community_bps INTEGER NOT NULL,
        foundation_bps INTEGER NOT NULL,
        referrer_bps INTEGER NOT NULL,
        proposed_by TEXT NOT NULL,
        activates_at TEXT,
        activated_at TEXT,
        superseded_by TEXT, -- id reference, resolved by lookup, never a row pointer
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
";
pub const LEDGER_DB_SCHEMA_REVENUE_RULES_STATUS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_revenue_rules_status ON revenue_rules(status)";

pub const LEDGER_DB_SCHEMA_REVENUE_RULE_AUDIT: &str = "
    CREATE TABLE IF NOT EXISTS revenue_rule_audit (
        id TEXT PRIMARY KEY,
        rule_id TEXT NOT NULL,
        actor TEXT NOT NULL,
        reason TEXT NOT NULL DEFAULT '',
        prev_status TEXT NOT NULL,
        new_status TEXT NOT NULL,
        emergency INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        FOREIGN KEY(rule_id) REFERENCES revenue_rules(id)
    )
";

// --- Distributions ---

pub const LEDGER_DB_SCHEMA_DISTRIBUTIONS: &str = "
    CREATE TABLE IF NOT EXISTS distributions (
        id TEXT PRIMARY KEY,
        period_key TEXT NOT NULL UNIQUE,
        pool_micro INTEGER NOT NULL,
        participant_count INTEGER NOT NULL,
        total_weight INTEGER NOT NULL,
        rule_id TEXT,
        created_at TEXT NOT NULL
    )
";

pub const LEDGER_DB_SCHEMA_DISTRIBUTION_SHARES: &str = "
    CREATE TABLE IF NOT EXISTS distribution_shares (
        id TEXT PRIMARY KEY,
        distribution_id TEXT NOT NULL,
        account_id TEXT NOT NULL,
        weight INTEGER NOT NULL,
        share_micro INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE(distribution_id, account_id),
        FOREIGN KEY(distribution_id) REFERENCES distributions(id),
        FOREIGN KEY(account_id) REFERENCES accounts(id)
    )
";

// --- Payouts & treasury ---

pub const LEDGER_DB_SCHEMA_PAYOUT_REQUESTS: &str = "
    CREATE TABLE IF NOT EXISTS payout_requests (
        id TEXT PRIMARY KEY,
        account_id TEXT NOT NULL,
        amount_micro INTEGER NOT NULL,
        fee_micro INTEGER NOT NULL,
        net_micro INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending', -- pending, approved, processing, completed, failed, cancelled, quarantined
        idempotency_key TEXT NOT NULL UNIQUE,
        reservation_id TEXT NOT NULL, -- the hold backing this payout

        failure_reason TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        FOREIGN KEY(account_id) REFERENCES accounts(id)
    )
";

/// Singleton row (id = 1); mutated only through version-checked updates.
pub const LEDGER_DB_SCHEMA_TREASURY_STATE: &str = "
    CREATE TABLE IF NOT EXISTS treasury_state (
        id INTEGER PRIMARY KEY CHECK(id = 1),
        version INTEGER NOT NULL,
        reserve_balance_micro INTEGER NOT NULL,
        updated_at TEXT NOT NULL
    )
";

// --- Economic event outbox ---

pub const LEDGER_DB_SCHEMA_ECONOMIC_EVENTS: &str = "
    CREATE TABLE IF NOT EXISTS economic_events (
        event_id TEXT PRIMARY KEY,
        event_type TEXT NOT NULL,
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        correlation_id TEXT,
        idempotency_key TEXT NOT NULL UNIQUE,
        config_version TEXT NOT NULL DEFAULT '',
        payload TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL
    )
";

// --- Clawback receivables ---

pub const LEDGER_DB_SCHEMA_CLAWBACK_RECEIVABLES: &str = "
    CREATE TABLE IF NOT EXISTS clawback_receivables (
        id TEXT PRIMARY KEY,
        account_id TEXT NOT NULL,
        clawback_id TEXT NOT NULL,
        amount_original_micro INTEGER NOT NULL,
        balance_micro INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        resolved_at TEXT,
        FOREIGN KEY(account_id) REFERENCES accounts(id)
    )
";
pub const LEDGER_DB_SCHEMA_RECEIVABLES_OPEN_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_receivables_open ON clawback_receivables(account_id)
     WHERE resolved_at IS NULL";

// --- Budget circuit breaker ---

pub const LEDGER_DB_SCHEMA_SPENDING_LIMITS: &str = "
    CREATE TABLE IF NOT EXISTS spending_limits (
        account_id TEXT PRIMARY KEY,
        daily_cap_micro INTEGER NOT NULL,
        window_spend_micro INTEGER NOT NULL DEFAULT 0,
        window_start TEXT NOT NULL,
        window_secs INTEGER NOT NULL,
        circuit_state TEXT NOT NULL DEFAULT 'closed', -- closed, warning, open
        FOREIGN KEY(account_id) REFERENCES accounts(id)
    )
";

/// Idempotency record: one row per (account, reservation) finalization.
pub const LEDGER_DB_SCHEMA_BUDGET_FINALIZATIONS: &str = "
    CREATE TABLE IF NOT EXISTS budget_finalizations (
        account_id TEXT NOT NULL,
        reservation_id TEXT NOT NULL,
        amount_micro INTEGER NOT NULL,
        recorded_at TEXT NOT NULL,
        PRIMARY KEY(account_id, reservation_id)
    )
";

// --- Reconciliation findings (alert-only, append-only) ---

pub const LEDGER_DB_SCHEMA_RECONCILIATION_FINDINGS: &str = "
    CREATE TABLE IF NOT EXISTS reconciliation_findings (
        id TEXT PRIMARY KEY,
        check_name TEXT NOT NULL, -- lot_conservation, receivable_consistency, budget_consistency
        subject_id TEXT NOT NULL,
        detail TEXT NOT NULL, -- JSON blob with expected/actual amounts
        created_at TEXT NOT NULL
    )
";

/// Every DDL statement for the ledger bin, in creation order.
pub const LEDGER_DB_ALL_SCHEMAS: &[&str] = &[
    LEDGER_DB_SCHEMA_META,
    LEDGER_DB_SCHEMA_ACCOUNTS,
    LEDGER_DB_SCHEMA_LOTS,
    LEDGER_DB_SCHEMA_LOTS_ACCOUNT_INDEX,
    LEDGER_DB_SCHEMA_LOTS_SOURCE_REF_INDEX,
    LEDGER_DB_SCHEMA_RESERVATIONS,
    LEDGER_DB_SCHEMA_RESERVATIONS_STATUS_INDEX,
    LEDGER_DB_SCHEMA_RESERVATION_LOTS,
    LEDGER_DB_SCHEMA_ENTRIES,
    LEDGER_DB_SCHEMA_ENTRIES_ACCOUNT_INDEX,
    LEDGER_DB_SCHEMA_REVENUE_RULES,
    LEDGER_DB_SCHEMA_REVENUE_RULES_STATUS_INDEX,
    LEDGER_DB_SCHEMA_REVENUE_RULE_AUDIT,
    LEDGER_DB_SCHEMA_DISTRIBUTIONS,
    LEDGER_DB_SCHEMA_DISTRIBUTION_SHARES,
    LEDGER_DB_SCHEMA_PAYOUT_REQUESTS,
    LEDGER_DB_SCHEMA_TREASURY_STATE,
    LEDGER_DB_SCHEMA_ECONOMIC_EVENTS,
    LEDGER_DB_SCHEMA_CLAWBACK_RECEIVABLES,
    LEDGER_DB_SCHEMA_RECEIVABLES_OPEN_INDEX,
    LEDGER_DB_SCHEMA_SPENDING_LIMITS,
    LEDGER_DB_SCHEMA_BUDGET_FINALIZATIONS,
    LEDGER_DB_SCHEMA_RECONCILIATION_FINDINGS,
];
