//! Distribution engine.
//!
//! One allocation algorithm serves both basis-point revenue splits and
//! score-weighted reward drops: order participants deterministically, floor
//! each proportional share in exact integer math, and hand the remainder to
//! the last participant so the pool is conserved to the micro.

use crate::core::broker::DbBroker;
use crate::core::config::LedgerConfig;
use crate::core::db;
use crate::core::error;
use crate::core::money::{self, Micro};
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::ledger;
use crate::plugins::outbox::{self, NewEvent};
use crate::plugins::rules;
use clap::{Parser, Subcommand, ValueEnum};
use regex::Regex;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use ulid::Ulid;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Participant {
    pub account_id: String,
    pub weight: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ShareAllocation {
    pub account_id: String,
    pub weight: i64,
    pub share_micro: Micro,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Distribution {
    pub id: String,
    pub period_key: String,
    pub pool_micro: Micro,
    pub participant_count: i64,
    pub total_weight: i64,
    pub rule_id: Option<String>,
    pub created_at: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DistributionOutcome {
    pub distribution: Distribution,
    pub shares: Vec<ShareAllocation>,
}

fn period_key_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9]{4}-[0-9]{2}(-[0-9]{2})?$").unwrap())
}

pub fn validate_period_key(period_key: &str) -> Result<(), error::TidepoolError> {
    if period_key_regex().is_match(period_key) {
        Ok(())
    } else {
        Err(error::TidepoolError::ValidationError(format!(
            "invalid period key '{}'; expected YYYY-MM or YYYY-MM-DD",
            period_key
        )))
    }
}

/// Allocate `pool_micro` across participants proportionally to weight.
///
/// Ordering is deterministic (weight descending, account id ascending), the
/// floor of each proportional share is exact integer math, and the division
/// remainder goes entirely to the last participant in that order. The
/// returned shares always sum to exactly `pool_micro`.
pub fn allocate_shares(
    pool_micro: Micro,
    participants: &[Participant],
) -> Result<Vec<ShareAllocation>, error::TidepoolError> {
    money::require_non_negative(pool_micro, "pool")?;
    if participants.is_empty() {
        return Err(error::TidepoolError::ValidationError(
            "NO_PARTICIPANTS: allocation needs at least one participant".to_string(),
        ));
    }

    let mut total_weight: i64 = 0;
    for p in participants {
        if p.weight < 0 {
            return Err(error::TidepoolError::ValidationError(format!(
                "negative weight {} for account {}",
                p.weight, p.account_id
            )));
        }
        total_weight = money::checked_add(total_weight, p.weight)?;
    }
    if total_weight == 0 {
        return Err(error::TidepoolError::ArithmeticError(
            "total participant weight is zero".to_string(),
        ));
    }

    let mut ordered: Vec<&Participant> = participants.iter().collect();
    ordered.sort_by(|a, b| {
        b.weight
            .cmp(&a.weight)
            .then_with(|| a.account_id.cmp(&b.account_id))
    });

    let mut shares = Vec::with_capacity(ordered.len());
    let mut allocated: Micro = 0;
    for p in &ordered {
        let share = money::floor_proportion(pool_micro, p.weight, total_weight)?;
        allocated = money::checked_add(allocated, share)?;
        shares.push(ShareAllocation {
            account_id: p.account_id.clone(),
            weight: p.weight,
            share_micro: share,
        });
    }

    let remainder = money::checked_sub(pool_micro, allocated)?;
    if remainder > 0 {
        let last = shares.last_mut().expect("non-empty participant list");
        last.share_micro = money::checked_add(last.share_micro, remainder)?;
    }

    Ok(shares)
}

/// Execute a distribution run: allocate, mint dividend lots, record the run.
///
/// Idempotent per period key — re-running an already-recorded period fails
/// with `ALREADY_DISTRIBUTED` and changes nothing. Pools below the
/// configured minimum are rejected before any computation.
pub fn run_distribution(
    store: &Store,
    config: &LedgerConfig,
    period_key: &str,
    pool_micro: Micro,
    participants: &[Participant],
    rule_id: Option<&str>,
    actor: &str,
) -> Result<DistributionOutcome, error::TidepoolError> {
    validate_period_key(period_key)?;
    if pool_micro < config.min_pool_micro {
        return Err(error::TidepoolError::ValidationError(format!(
            "BELOW_THRESHOLD: pool {} is below minimum {}",
            pool_micro, config.min_pool_micro
        )));
    }
    if participants.is_empty() {
        return Err(error::TidepoolError::ValidationError(
            "NO_PARTICIPANTS: distribution needs at least one participant".to_string(),
        ));
    }
    let mut seen = std::collections::BTreeSet::new();
    for p in participants {
        if !seen.insert(p.account_id.as_str()) {
            return Err(error::TidepoolError::ValidationError(format!(
                "account {} appears more than once",
                p.account_id
            )));
        }
    }

    let shares = allocate_shares(pool_micro, participants)?;

    let broker = DbBroker::new(&store.root);
    let db_path = db::ledger_db_path(&store.root);
    broker.with_txn(&db_path, actor, None, "distribution.run", |txn| {
        let existing: Option<String> = txn
            .query_row(
                "SELECT id FROM distributions WHERE period_key = ?1",
                params![period_key],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Err(error::TidepoolError::ConflictError(format!(
                "ALREADY_DISTRIBUTED: period {} recorded as distribution {}",
                period_key, id
            )));
        }

        let now = time::now_epoch_z();
        let distribution = Distribution {
            id: Ulid::new().to_string(),
            period_key: period_key.to_string(),
            pool_micro,
            participant_count: participants.len() as i64,
            total_weight: shares.iter().map(|s| s.weight).sum(),
            rule_id: rule_id.map(|s| s.to_string()),
            created_at: now.clone(),
        };
        txn.execute(
            "INSERT INTO distributions(id, period_key, pool_micro, participant_count, total_weight, rule_id, created_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                distribution.id,
                distribution.period_key,
                distribution.pool_micro,
                distribution.participant_count,
                distribution.total_weight,
                distribution.rule_id,
                distribution.created_at
            ],
        )?;

        for share in &shares {
            txn.execute(
                "INSERT INTO distribution_shares(id, distribution_id, account_id, weight, share_micro, created_at)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    Ulid::new().to_string(),
                    distribution.id,
                    share.account_id,
                    share.weight,
                    share.share_micro,
                    now
                ],
            )?;
            if share.share_micro > 0 {
                ledger::mint_lot_txn(
                    txn,
                    &share.account_id,
                    "dividend",
                    None,
                    share.share_micro,
                    Some(&distribution.id),
                )?;
            }
        }

        outbox::emit_in_txn(
            txn,
            &NewEvent {
                event_type: "distribution.completed".to_string(),
                entity_type: "distribution".to_string(),
                entity_id: distribution.id.clone(),
                correlation_id: None,
                idempotency_key: format!("distribution:{}", period_key),
                payload: serde_json::json!({
                    "period_key": period_key,
                    "pool_micro": pool_micro,
                    "participant_count": participants.len(),
                }),
            },
        )?;

        Ok(DistributionOutcome {
            distribution,
            shares: shares.clone(),
        })
    })
}

/// Revenue split under the currently active rule: the four basis-point
/// fields become the weights, so the same allocator conserves the pool.
#[allow(clippy::too_many_arguments)]
pub fn run_revenue_split(
    store: &Store,
    config: &LedgerConfig,
    period_key: &str,
    pool_micro: Micro,
    commons_account: &str,
    community_account: &str,
    foundation_account: &str,
    referrer_account: &str,
    actor: &str,
) -> Result<DistributionOutcome, error::TidepoolError> {
    let rule = rules::active_rule(store)?.ok_or_else(|| {
        error::TidepoolError::NotFound("no active revenue rule".to_string())
    })?;
    let participants = vec![
        Participant {
            account_id: commons_account.to_string(),
            weight: rule.commons_bps,
        },
        Participant {
            account_id: community_account.to_string(),
            weight: rule.community_bps,
        },
        Participant {
            account_id: foundation_account.to_string(),
            weight: rule.foundation_bps,
        },
        Participant {
            account_id: referrer_account.to_string(),
            weight: rule.referrer_bps,
        },
    ];
    // Zero-bps buckets stay in the run with weight 0 so the recorded split
    // is the full rule, not a filtered view.
    run_distribution(
        store,
        config,
        period_key,
        pool_micro,
        &participants,
        Some(&rule.id),
        actor,
    )
}

pub fn get_distribution(
    store: &Store,
    period_key: &str,
) -> Result<Option<DistributionOutcome>, error::TidepoolError> {
    let broker = DbBroker::new(&store.root);
    let db_path = db::ledger_db_path(&store.root);
    broker.with_conn(&db_path, "tidepool", None, "distribution.get", |conn| {
        let distribution = conn
            .query_row(
                "SELECT id, period_key, pool_micro, participant_count, total_weight, rule_id, created_at
                 FROM distributions WHERE period_key = ?1",
                params![period_key],
                |row| {
                    Ok(Distribution {
                        id: row.get(0)?,
                        period_key: row.get(1)?,
                        pool_micro: row.get(2)?,
                        participant_count: row.get(3)?,
                        total_weight: row.get(4)?,
                        rule_id: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                },
            )
            .optional()?;
        let Some(distribution) = distribution else {
            return Ok(None);
        };
        let mut stmt = conn.prepare(
            "SELECT account_id, weight, share_micro FROM distribution_shares
             WHERE distribution_id = ?1 ORDER BY share_micro DESC, account_id ASC",
        )?;
        let shares = stmt
            .query_map(params![distribution.id], |row| {
                Ok(ShareAllocation {
                    account_id: row.get(0)?,
                    weight: row.get(1)?,
                    share_micro: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(DistributionOutcome {
            distribution,
            shares,
        }))
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
#[clap(name = "distribute", about = "Proportional pool distribution.")]
pub struct DistributeCli {
    #[clap(long, global = true, value_enum, default_value = "text")]
    format: OutputFormat,
    #[clap(subcommand)]
    command: DistributeCommand,
}

#[derive(Subcommand, Debug)]
pub enum DistributeCommand {
    /// Run a weighted distribution for a period.
    Run {
        #[clap(long)]
        period: String,
        #[clap(long)]
        pool: i64,
        /// Participants as account:weight pairs.
        #[clap(long = "participant", required = true)]
        participants: Vec<String>,
    },
    /// Split revenue under the active rule.
    Revenue {
        #[clap(long)]
        period: String,
        #[clap(long)]
        pool: i64,
        #[clap(long)]
        commons: String,
        #[clap(long)]
        community: String,
        #[clap(long)]
        foundation: String,
        #[clap(long)]
        referrer: String,
    },
    /// Show a recorded distribution.
    Show {
        #[clap(long)]
        period: String,
    },
}

fn parse_participant(raw: &str) -> Result<Participant, error::TidepoolError> {
    let (account, weight) = raw.rsplit_once(':').ok_or_else(|| {
        error::TidepoolError::ValidationError(format!(
            "participant '{}' must be account:weight",
            raw
        ))
    })?;
    let weight: i64 = weight.parse().map_err(|_| {
        error::TidepoolError::ValidationError(format!("invalid weight in '{}'", raw))
    })?;
    Ok(Participant {
        account_id: account.to_string(),
        weight,
    })
}

pub fn run_distribute_cli(
    store: &Store,
    config: &LedgerConfig,
    cli: DistributeCli,
) -> Result<(), error::TidepoolError> {
    let json = cli.format == OutputFormat::Json;
    match cli.command {
        DistributeCommand::Run {
            period,
            pool,
            participants,
        } => {
            let participants = participants
                .iter()
                .map(|raw| parse_participant(raw))
                .collect::<Result<Vec<_>, _>>()?;
            let outcome =
                run_distribution(store, config, &period, pool, &participants, None, "operator")?;
            print_outcome(json, "distribute.run", &outcome);
        }
        DistributeCommand::Revenue {
            period,
            pool,
            commons,
            community,
            foundation,
            referrer,
        } => {
            let outcome = run_revenue_split(
                store,
                config,
                &period,
                pool,
                &commons,
                &community,
                &foundation,
                &referrer,
                "operator",
            )?;
            print_outcome(json, "distribute.revenue", &outcome);
        }
        DistributeCommand::Show { period } => match get_distribution(store, &period)? {
            Some(outcome) => print_outcome(json, "distribute.show", &outcome),
            None => {
                if json {
                    println!(
                        "{}",
                        time::command_envelope(
                            "distribute.show",
                            "not_found",
                            serde_json::json!({ "period_key": period })
                        )
                    );
                } else {
                    println!("No distribution recorded for {}", period);
                }
            }
        },
    }
    Ok(())
}

fn print_outcome(json: bool, cmd: &str, outcome: &DistributionOutcome) {
    if json {
        println!(
            "{}",
            time::command_envelope(cmd, "ok", serde_json::json!({ "outcome": outcome }))
        );
    } else {
        println!(
            "Distribution {} ({}): pool {} micro across {} participants",
            outcome.distribution.id,
            outcome.distribution.period_key,
            outcome.distribution.pool_micro,
            outcome.distribution.participant_count
        );
        for share in &outcome.shares {
            println!(
                "  {} weight {:>6} -> {} micro",
                share.account_id, share.weight, share.share_micro
            );
        }
    }
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "distribution",
        "version": "0.1.0",
        "description": "Floor+remainder proportional allocation",
        "commands": [
            { "name": "run", "description": "Run a weighted distribution" },
            { "name": "revenue", "description": "Split revenue under the active rule" },
            { "name": "show", "description": "Show a recorded distribution" }
        ],
        "storage": ["ledger.db"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participants(weights: &[(&str, i64)]) -> Vec<Participant> {
        weights
            .iter()
            .map(|(id, w)| Participant {
                account_id: id.to_string(),
                weight: *w,
            })
            .collect()
    }

    #[test]
    fn test_even_split_no_remainder() {
        let shares =
            allocate_shares(10_000_000, &participants(&[("a", 50), ("b", 30), ("c", 20)]))
                .expect("allocates");
        assert_eq!(shares[0].share_micro, 5_000_000);
        assert_eq!(shares[1].share_micro, 3_000_000);
        assert_eq!(shares[2].share_micro, 2_000_000);
        let total: i64 = shares.iter().map(|s| s.share_micro).sum();
        assert_eq!(total, 10_000_000);
    }

    #[test]
    fn test_remainder_goes_to_last_in_stable_order() {
        let shares = allocate_shares(10, &participants(&[("a", 1), ("b", 1), ("c", 1)]))
            .expect("allocates");
        // Equal weights tie-break by id ascending, so c is last and takes
        // the remainder.
        assert_eq!(shares[0].account_id, "a");
        assert_eq!(shares[0].share_micro, 3);
        assert_eq!(shares[1].share_micro, 3);
        assert_eq!(shares[2].account_id, "c");
        assert_eq!(shares[2].share_micro, 4);
    }

    #[test]
    fn test_conservation_over_awkward_weights() {
        for pool in [0, 1, 7, 999, 1_000_003, 10_000_000_000] {
            let shares = allocate_shares(
                pool,
                &participants(&[("w", 17), ("x", 3), ("y", 1), ("z", 7919)]),
            )
            .expect("allocates");
            let total: i64 = shares.iter().map(|s| s.share_micro).sum();
            assert_eq!(total, pool, "pool {} not conserved", pool);
        }
    }

    #[test]
    fn test_zero_weight_participant_gets_nothing_but_is_recorded() {
        let shares =
            allocate_shares(100, &participants(&[("a", 1), ("b", 0)])).expect("allocates");
        let b = shares.iter().find(|s| s.account_id == "b").expect("b present");
        assert_eq!(b.share_micro, 0);
        let total: i64 = shares.iter().map(|s| s.share_micro).sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn test_rejects_empty_and_zero_weight_sets() {
        assert!(allocate_shares(100, &[]).is_err());
        assert!(allocate_shares(100, &participants(&[("a", 0)])).is_err());
        assert!(allocate_shares(100, &participants(&[("a", -1)])).is_err());
    }

    #[test]
    fn test_period_key_validation() {
        assert!(validate_period_key("2026-08").is_ok());
        assert!(validate_period_key("2026-08-07").is_ok());
        assert!(validate_period_key("aug-2026").is_err());
        assert!(validate_period_key("2026-8").is_err());
    }
}
