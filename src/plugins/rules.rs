//! Revenue rule governor.
//!
//! Governance-controlled revenue split parameters, changed without
//! downtime through a staged state machine:
//!
//! `draft → pending_approval → cooling_down → active → superseded`, with
//! `rejected` reachable from pending_approval or cooling_down. Terminal:
//! superseded, rejected. At most one rule is `active` at any instant, and
//! at most one proposal is open (pending_approval or cooling_down).
//! Every transition appends an immutable audit row.

use crate::core::broker::DbBroker;
use crate::core::config::LedgerConfig;
use crate::core::db;
use crate::core::error;
use crate::core::money::BPS_DENOMINATOR;
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::outbox::{self, NewEvent};
use clap::{Parser, Subcommand, ValueEnum};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub const RULE_DRAFT: &str = "draft";
pub const RULE_PENDING_APPROVAL: &str = "pending_approval";
pub const RULE_COOLING_DOWN: &str = "cooling_down";
pub const RULE_ACTIVE: &str = "active";
pub const RULE_SUPERSEDED: &str = "superseded";
pub const RULE_REJECTED: &str = "rejected";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RevenueRule {
    pub id: String,
    pub status: String,
    pub commons_bps: i64,
    pub community_bps: i64,
    pub foundation_bps: i64,
    pub referrer_bps: i64,
    pub proposed_by: String,
    pub activates_at: Option<String>,
    pub activated_at: Option<String>,
    pub superseded_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RuleAuditRow {
    pub id: String,
    pub rule_id: String,
    pub actor: String,
    pub reason: String,
    pub prev_status: String,
    pub new_status: String,
    pub emergency: bool,
    pub created_at: String,
}

fn map_rule_row(row: &rusqlite::Row) -> rusqlite::Result<RevenueRule> {
    Ok(RevenueRule {
        id: row.get(0)?,
        status: row.get(1)?,
        commons_bps: row.get(2)?,
        community_bps: row.get(3)?,
        foundation_bps: row.get(4)?,
        referrer_bps: row.get(5)?,
        proposed_by: row.get(6)?,
        activates_at: row.get(7)?,
        activated_at: row.get(8)?,
        superseded_by: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

const RULE_COLUMNS: &str = "id, status, commons_bps, community_bps, foundation_bps, referrer_bps, proposed_by, activates_at, activated_at, superseded_by, created_at, updated_at";

fn get_rule_txn(conn: &Connection, rule_id: &str) -> Result<RevenueRule, error::TidepoolError> {
    conn.query_row(
        &format!("SELECT {} FROM revenue_rules WHERE id = ?1", RULE_COLUMNS),
        params![rule_id],
        map_rule_row,
    )
    .optional()?
    .ok_or_else(|| error::TidepoolError::NotFound(format!("revenue rule {}", rule_id)))
}

fn append_audit_txn(
    conn: &Connection,
    rule_id: &str,
    actor: &str,
    reason: &str,
    prev_status: &str,
    new_status: &str,
    emergency: bool,
) -> Result<(), error::TidepoolError> {
    conn.execute(
        "INSERT INTO revenue_rule_audit(id, rule_id, actor, reason, prev_status, new_status, emergency, created_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            Ulid::new().to_string(),
            rule_id,
            actor,
            reason,
            prev_status,
            new_status,
            emergency as i64,
            time::now_epoch_z()
        ],
    )?;
    Ok(())
}

fn validate_bps_fields(
    commons_bps: i64,
    community_bps: i64,
    foundation_bps: i64,
    referrer_bps: i64,
) -> Result<(), error::TidepoolError> {
    for (name, bps) in [
        ("commons_bps", commons_bps),
        ("community_bps", community_bps),
        ("foundation_bps", foundation_bps),
        ("referrer_bps", referrer_bps),
    ] {
        if !(0..=BPS_DENOMINATOR).contains(&bps) {
            return Err(error::TidepoolError::ValidationError(format!(
                "{} must be within 0..=10000, got {}",
                name, bps
            )));
        }
    }
    let sum = commons_bps + community_bps + foundation_bps + referrer_bps;
    if sum != BPS_DENOMINATOR {
        return Err(error::TidepoolError::ValidationError(format!(
            "basis points must sum to 10000, got {}",
            sum
        )));
    }
    Ok(())
}

/// Create a draft rule. The bps-sum invariant is enforced here, at the
/// door: a malformed split never enters the state machine.
pub fn propose(
    store: &Store,
    commons_bps: i64,
    community_bps: i64,
    foundation_bps: i64,
    referrer_bps: i64,
    actor: &str,
    reason: &str,
) -> Result<RevenueRule, error::TidepoolError> {
    validate_bps_fields(commons_bps, community_bps, foundation_bps, referrer_bps)?;

    let broker = DbBroker::new(&store.root);
    let db_path = db::ledger_db_path(&store.root);
    broker.with_txn(&db_path, actor, None, "rules.propose", |txn| {
        let now = time::now_epoch_z();
        let rule = RevenueRule {
            id: Ulid::new().to_string(),
            status: RULE_DRAFT.to_string(),
            commons_bps,
            community_bps,
            foundation_bps,
            referrer_bps,
            proposed_by: actor.to_string(),
            activates_at: None,
            activated_at: None,
            superseded_by: None,
            created_at: now.clone(),
            updated_at: now,
        };
        txn.execute(
            "INSERT INTO revenue_rules(id, status, commons_bps, community_bps, foundation_bps, referrer_bps, proposed_by, activates_at, activated_at, superseded_by, created_at, updated_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, NULL, NULL, ?8, ?9)",
            params![
                rule.id,
                rule.status,
                rule.commons_bps,
                rule.community_bps,
                rule.foundation_bps,
                rule.referrer_bps,
                rule.proposed_by,
                rule.created_at,
                rule.updated_at
            ],
        )?;
        append_audit_txn(txn, &rule.id, actor, reason, "none", RULE_DRAFT, false)?;
        Ok(rule)
    })
}

/// Submit a draft for approval. Only one proposal may be open at a time;
/// the check runs inside the same transaction as the transition.
pub fn submit(store: &Store, rule_id: &str, actor: &str) -> Result<RevenueRule, error::TidepoolError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::ledger_db_path(&store.root);
    broker.with_txn(&db_path, actor, None, "rules.submit", |txn| {
        let rule = get_rule_txn(txn, rule_id)?;
        if rule.status != RULE_DRAFT {
            return Err(error::TidepoolError::StateError(format!(
                "rule {} is {}, only drafts are submitted",
                rule_id, rule.status
            )));
        }
        let open: i64 = txn.query_row(
            "SELECT COUNT(*) FROM revenue_rules WHERE status IN ('pending_approval', 'cooling_down')",
            [],
            |row| row.get(0),
        )?;
        if open > 0 {
            return Err(error::TidepoolError::ConflictError(
                "another rule proposal is already open".to_string(),
            ));
        }
        transition_txn(txn, rule_id, RULE_DRAFT, RULE_PENDING_APPROVAL, actor, "", false)
    })
}

/// Approve a pending rule and start its cooldown clock.
pub fn approve(
    store: &Store,
    config: &LedgerConfig,
    rule_id: &str,
    actor: &str,
) -> Result<RevenueRule, error::TidepoolError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::ledger_db_path(&store.root);
    broker.with_txn(&db_path, actor, None, "rules.approve", |txn| {
        let rule = get_rule_txn(txn, rule_id)?;
        if rule.status != RULE_PENDING_APPROVAL {
            return Err(error::TidepoolError::StateError(format!(
                "rule {} is {}, only pending_approval rules are approved",
                rule_id, rule.status
            )));
        }
        let activates_at = format!("{}Z", time::now_unix_secs() + config.rule_cooldown_secs);
        let now = time::now_epoch_z();
        let changed = txn.execute(
            "UPDATE revenue_rules SET status = ?1, activates_at = ?2, updated_at = ?3
             WHERE id = ?4 AND status = 'pending_approval'",
            params![RULE_COOLING_DOWN, activates_at, now, rule_id],
        )?;
        if changed == 0 {
            return Err(error::TidepoolError::ConcurrencyError(format!(
                "rule {} transitioned concurrently",
                rule_id
            )));
        }
        append_audit_txn(
            txn,
            rule_id,
            actor,
            "",
            RULE_PENDING_APPROVAL,
            RULE_COOLING_DOWN,
            false,
        )?;
        get_rule_txn(txn, rule_id)
    })
}

/// Reject an open proposal. Terminal.
pub fn reject(
    store: &Store,
    rule_id: &str,
    actor: &str,
    reason: &str,
) -> Result<RevenueRule, error::TidepoolError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::ledger_db_path(&store.root);
    broker.with_txn(&db_path, actor, None, "rules.reject", |txn| {
        let rule = get_rule_txn(txn, rule_id)?;
        if rule.status != RULE_PENDING_APPROVAL && rule.status != RULE_COOLING_DOWN {
            return Err(error::TidepoolError::StateError(format!(
                "rule {} is {}, only open proposals are rejected",
                rule_id, rule.status
            )));
        }
        transition_txn(txn, rule_id, &rule.status, RULE_REJECTED, actor, reason, false)
    })
}

/// Activate a cooled-down rule.
///
/// The single-active invariant is a check-and-set inside this transaction:
/// the current active rule (if any) is demoted to superseded and stamped
/// with its successor, then the candidate is promoted conditionally on
/// still being cooling_down. The uniqueness constraint alone cannot
/// arbitrate the read-check race; the serialized transaction does.
///
/// Activation before `activates_at` requires `emergency`, which is audited
/// separately with its reason.
pub fn activate(
    store: &Store,
    rule_id: &str,
    actor: &str,
    emergency: bool,
    reason: &str,
) -> Result<RevenueRule, error::TidepoolError> {
    if emergency && reason.trim().is_empty() {
        return Err(error::TidepoolError::ValidationError(
            "emergency activation requires a reason".to_string(),
        ));
    }

    let broker = DbBroker::new(&store.root);
    let db_path = db::ledger_db_path(&store.root);
    broker.with_txn(&db_path, actor, None, "rules.activate", |txn| {
        let rule = get_rule_txn(txn, rule_id)?;
        if rule.status != RULE_COOLING_DOWN {
            return Err(error::TidepoolError::StateError(format!(
                "rule {} is {}, only cooling_down rules activate",
                rule_id, rule.status
            )));
        }
        if !emergency {
            let activates_at = rule
                .activates_at
                .as_deref()
                .and_then(time::parse_epoch_z)
                .ok_or_else(|| {
                    error::TidepoolError::StateError(format!(
                        "rule {} has no activation time on record",
                        rule_id
                    ))
                })?;
            if time::now_unix_secs() < activates_at {
                return Err(error::TidepoolError::StateError(format!(
                    "rule {} is still cooling down until {}Z",
                    rule_id, activates_at
                )));
            }
        }

        let now = time::now_epoch_z();
        let current: Option<String> = txn
            .query_row(
                "SELECT id FROM revenue_rules WHERE status = 'active'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(current_id) = current {
            let demoted = txn.execute(
                "UPDATE revenue_rules SET status = ?1, superseded_by = ?2, updated_at = ?3
                 WHERE id = ?4 AND status = 'active'",
                params![RULE_SUPERSEDED, rule_id, now, current_id],
            )?;
            if demoted == 0 {
                return Err(error::TidepoolError::ConcurrencyError(
                    "active rule changed during activation".to_string(),
                ));
            }
            append_audit_txn(
                txn,
                &current_id,
                actor,
                &format!("superseded by {}", rule_id),
                RULE_ACTIVE,
                RULE_SUPERSEDED,
                emergency,
            )?;
        }

        let promoted = txn.execute(
            "UPDATE revenue_rules SET status = ?1, activated_at = ?2, updated_at = ?2
             WHERE id = ?3 AND status = 'cooling_down'",
            params![RULE_ACTIVE, now, rule_id],
        )?;
        if promoted == 0 {
            return Err(error::TidepoolError::ConcurrencyError(format!(
                "rule {} transitioned during activation",
                rule_id
            )));
        }
        append_audit_txn(
            txn,
            rule_id,
            actor,
            reason,
            RULE_COOLING_DOWN,
            RULE_ACTIVE,
            emergency,
        )?;

        let active_count: i64 = txn.query_row(
            "SELECT COUNT(*) FROM revenue_rules WHERE status = 'active'",
            [],
            |row| row.get(0),
        )?;
        if active_count != 1 {
            return Err(error::TidepoolError::ConcurrencyError(format!(
                "activation left {} active rules",
                active_count
            )));
        }

        outbox::emit_in_txn(
            txn,
            &NewEvent {
                event_type: "revenue_rule.activated".to_string(),
                entity_type: "revenue_rule".to_string(),
                entity_id: rule_id.to_string(),
                correlation_id: None,
                idempotency_key: format!("rule-activated:{}", rule_id),
                payload: serde_json::json!({ "emergency": emergency }),
            },
        )?;

        get_rule_txn(txn, rule_id)
    })
}

fn transition_txn(
    conn: &Connection,
    rule_id: &str,
    prev_status: &str,
    new_status: &str,
    actor: &str,
    reason: &str,
    emergency: bool,
) -> Result<RevenueRule, error::TidepoolError> {
    let changed = conn.execute(
        "UPDATE revenue_rules SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
        params![new_status, time::now_epoch_z(), rule_id, prev_status],
    )?;
    if changed == 0 {
        return Err(error::TidepoolError::ConcurrencyError(format!(
            "rule {} transitioned concurrently",
            rule_id
        )));
    }
    append_audit_txn(conn, rule_id, actor, reason, prev_status, new_status, emergency)?;
    get_rule_txn(conn, rule_id)
}

pub fn active_rule(store: &Store) -> Result<Option<RevenueRule>, error::TidepoolError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::ledger_db_path(&store.root);
    broker.with_conn(&db_path, "tidepool", None, "rules.active", |conn| {
        let rule = conn
            .query_row(
                &format!(
                    "SELECT {} FROM revenue_rules WHERE status = 'active'",
                    RULE_COLUMNS
                ),
                [],
                map_rule_row,
            )
            .optional()?;
        Ok(rule)
    })
}

pub fn get_rule(store: &Store, rule_id: &str) -> Result<RevenueRule, error::TidepoolError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::ledger_db_path(&store.root);
    broker.with_conn(&db_path, "tidepool", None, "rules.get", |conn| {
        get_rule_txn(conn, rule_id)
    })
}

pub fn audit_trail(store: &Store, rule_id: &str) -> Result<Vec<RuleAuditRow>, error::TidepoolError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::ledger_db_path(&store.root);
    broker.with_conn(&db_path, "tidepool", None, "rules.audit", |conn| {
        let mut stmt = conn.prepare(
            "SELECT id, rule_id, actor, reason, prev_status, new_status, emergency, created_at
             FROM revenue_rule_audit WHERE rule_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![rule_id], |row| {
                Ok(RuleAuditRow {
                    id: row.get(0)?,
                    rule_id: row.get(1)?,
                    actor: row.get(2)?,
                    reason: row.get(3)?,
                    prev_status: row.get(4)?,
                    new_status: row.get(5)?,
                    emergency: row.get::<_, i64>(6)? != 0,
                    created_at: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

// ---------------------------------------------------------------------------
// CLI surface
// ---------------------------------------------------------------------------

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[clap(name = "rule", about = "Revenue rule governance.")]
pub struct RuleCli {
    #[clap(long, global = true, value_enum, default_value = "text")]
    format: OutputFormat,
    #[clap(subcommand)]
    command: RuleCommand,
}

#[derive(Subcommand, Debug)]
pub enum RuleCommand {
    /// Propose a new revenue split (basis points must sum to 10000).
    Propose {
        #[clap(long)]
        commons: i64,
        #[clap(long)]
        community: i64,
        #[clap(long)]
        foundation: i64,
        #[clap(long)]
        referrer: i64,
        #[clap(long, default_value = "operator")]
        actor: String,
        #[clap(long, default_value = "")]
        reason: String,
    },
    /// Submit a draft for approval.
    Submit {
        #[clap(long)]
        id: String,
        #[clap(long, default_value = "operator")]
        actor: String,
    },
    /// Approve a pending rule (starts cooldown).
    Approve {
        #[clap(long)]
        id: String,
        #[clap(long, default_value = "operator")]
        actor: String,
    },
    /// Reject an open proposal.
    Reject {
        #[clap(long)]
        id: String,
        #[clap(long, default_value = "operator")]
        actor: String,
        #[clap(long, default_value = "")]
        reason: String,
    },
    /// Activate a cooled-down rule.
    Activate {
        #[clap(long)]
        id: String,
        #[clap(long, default_value = "operator")]
        actor: String,
        /// Skip the cooldown window. Audited with the reason.
        #[clap(long)]
        emergency: bool,
        #[clap(long, default_value = "")]
        reason: String,
    },
    /// Show the active rule.
    Active,
    /// Show a rule by id.
    Show {
        #[clap(long)]
        id: String,
    },
    /// Show a rule's transition audit trail.
    Audit {
        #[clap(long)]
        id: String,
    },
}

pub fn run_rule_cli(
    store: &Store,
    config: &LedgerConfig,
    cli: RuleCli,
) -> Result<(), error::TidepoolError> {
    let json = cli.format == OutputFormat::Json;
    match cli.command {
        RuleCommand::Propose {
            commons,
            community,
            foundation,
            referrer,
            actor,
            reason,
        } => {
            let rule = propose(store, commons, community, foundation, referrer, &actor, &reason)?;
            print_rule(json, "rule.propose", &rule);
        }
        RuleCommand::Submit { id, actor } => {
            let rule = submit(store, &id, &actor)?;
            print_rule(json, "rule.submit", &rule);
        }
        RuleCommand::Approve { id, actor } => {
            let rule = approve(store, config, &id, &actor)?;
            print_rule(json, "rule.approve", &rule);
        }
        RuleCommand::Reject { id, actor, reason } => {
            let rule = reject(store, &id, &actor, &reason)?;
            print_rule(json, "rule.reject", &rule);
        }
        RuleCommand::Activate {
            id,
            actor,
            emergency,
            reason,
        } => {
            let rule = activate(store, &id, &actor, emergency, &reason)?;
            print_rule(json, "rule.activate", &rule);
        }
        RuleCommand::Active => match active_rule(store)? {
            Some(rule) => print_rule(json, "rule.active", &rule),
            None => {
                if json {
                    println!(
                        "{}",
                        time::command_envelope("rule.active", "not_found", serde_json::json!({}))
                    );
                } else {
                    println!("No active revenue rule.");
                }
            }
        },
        RuleCommand::Show { id } => {
            let rule = get_rule(store, &id)?;
            print_rule(json, "rule.show", &rule);
        }
        RuleCommand::Audit { id } => {
            let trail = audit_trail(store, &id)?;
            if json {
                println!(
                    "{}",
                    time::command_envelope("rule.audit", "ok", serde_json::json!({ "audit": trail }))
                );
            } else {
                for row in trail {
                    println!(
                        "{} {} -> {} by {}{}{}",
                        row.created_at,
                        row.prev_status,
                        row.new_status,
                        row.actor,
                        if row.emergency { " [emergency]" } else { "" },
                        if row.reason.is_empty() {
                            String::new()
                        } else {
                            format!(": {}", row.reason)
                        }
                    );
                }
            }
        }
    }
    Ok(())
}

fn print_rule(json: bool, cmd: &str, rule: &RevenueRule) {
    if json {
        println!(
            "{}",
            time::command_envelope(cmd, "ok", serde_json::json!({ "rule": rule }))
        );
    } else {
        println!(
            "Rule {} [{}] commons {} / community {} / foundation {} / referrer {} bps",
            rule.id,
            rule.status,
            rule.commons_bps,
            rule.community_bps,
            rule.foundation_bps,
            rule.referrer_bps
        );
    }
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "rules",
        "version": "0.1.0",
        "description": "Revenue rule governance state machine",
        "commands": [
            { "name": "propose", "description": "Propose a revenue split" },
            { "name": "submit", "description": "Submit a draft for approval" },
            { "name": "approve", "description": "Approve (starts cooldown)" },
            { "name": "reject", "description": "Reject an open proposal" },
            { "name": "activate", "description": "Activate a cooled-down rule" },
            { "name": "active", "description": "Show the active rule" },
            { "name": "audit", "description": "Show transition history" }
        ],
        "storage": ["ledger.db"]
    })
}
