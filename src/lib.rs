//! Tidepool: a credit ledger and settlement engine for community platforms.
//!
//! **Tidepool is the local-first accounting core behind metered AI-agent
//! usage, subscriptions, payouts, and revenue sharing.**
//!
//! Money is integer micro-USD, always. Credit arrives as lots (deposits,
//! grants, dividends), is drawn down through reservations during usage,
//! and leaves through payouts and clawbacks. Every movement appends a
//! ledger entry; every mutation runs inside one SQLite transaction routed
//! through the broker thin waist; every externally triggered operation is
//! idempotent on a caller-supplied key.
//!
//! # Core Principles
//!
//! - **Conservation**: distributions, clawbacks, and lot draw-downs sum
//!   exactly; the reconciliation checker audits and alerts, never corrects
//! - **At-most-once**: idempotency keys make webhook retries and duplicate
//!   requests harmless
//! - **Serialized governance**: revenue-rule activation is a check-and-set
//!   inside one transaction; at most one rule is active at any instant
//! - **Versioned treasury**: the reserve singleton moves only by
//!   compare-and-swap with bounded retry
//!
//! # Subsystems
//!
//! - `ledger`: accounts, lots, reservations, append-only entries
//! - `distribution`: floor+remainder proportional pool splits
//! - `rules`: revenue-rule governance state machine
//! - `payout`: payout lifecycle and treasury reserve
//! - `outbox`: idempotent economic event emission
//! - `clawback`: partial reversals and receivable recovery
//! - `budget`: per-agent spend caps (closed/warning/open)
//! - `reconcile`: conservation audits (alert-only)
//! - `deposits`: verified webhook and on-chain credit
//!
//! # Crate Structure
//!
//! - [`core`]: shared primitives (money, errors, schemas, broker, config)
//! - [`plugins`]: subsystem implementations

pub mod core;
pub mod plugins;

use core::{
    config::{self, LedgerConfig},
    db, error,
    store::Store,
};
use plugins::{budget, clawback, deposits, distribution, ledger, outbox, payout, reconcile, rules};

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[clap(
    name = "tidepool",
    version = env!("CARGO_PKG_VERSION"),
    about = "The community credit ledger and settlement engine"
)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct InitCli {
    /// Directory to initialize (defaults to current working directory).
    #[clap(short, long)]
    dir: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct GovernCli {
    #[clap(subcommand)]
    command: GovernCommand,
}

#[derive(Subcommand, Debug)]
enum GovernCommand {
    /// Revenue split rules: propose, approve, activate
    Rule(rules::RuleCli),
}

#[derive(clap::Args, Debug)]
struct AuditCli {
    #[clap(subcommand)]
    command: AuditCommand,
}

#[derive(Subcommand, Debug)]
enum AuditCommand {
    /// Conservation checks (alert-only)
    Reconcile(reconcile::ReconcileCli),

    /// Recent economic events from the outbox
    Outbox {
        #[clap(long, default_value = "50")]
        limit: usize,
    },

    /// Audit log of brokered mutations (The Thin Waist)
    Broker,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bootstrap a ledger store in this directory
    #[clap(name = "init", visible_alias = "i")]
    Init(InitCli),

    /// Show version information
    #[clap(name = "version")]
    Version,

    /// Accounts, lots, reservations, entries
    #[clap(name = "ledger", visible_alias = "l")]
    Ledger(ledger::LedgerCli),

    /// Proportional pool distribution
    #[clap(name = "distribute", visible_alias = "d")]
    Distribute(distribution::DistributeCli),

    /// Governance: revenue rules
    #[clap(name = "govern", visible_alias = "g")]
    Govern(GovernCli),

    /// Payout lifecycle and treasury reserve
    #[clap(name = "treasury", visible_alias = "t")]
    Treasury(payout::TreasuryCli),

    /// Reversals and receivable recovery
    #[clap(name = "clawback")]
    Clawback(clawback::ClawbackCli),

    /// Per-agent spend caps
    #[clap(name = "budget", visible_alias = "b")]
    Budget(budget::BudgetCli),

    /// Verified payment and on-chain credit
    #[clap(name = "deposit")]
    Deposit(deposits::DepositCli),

    /// Audits: reconciliation, outbox, broker log
    #[clap(name = "audit", visible_alias = "a")]
    Audit(AuditCli),
}

fn find_tidepool_project_root(start_dir: &Path) -> Result<PathBuf, error::TidepoolError> {
    let mut current_dir = PathBuf::from(start_dir);
    loop {
        if current_dir.join(".tidepool").exists() {
            return Ok(current_dir);
        }
        if !current_dir.pop() {
            return Err(error::TidepoolError::NotFound(
                "'.tidepool' directory not found in current or parent directories. Run `tidepool init` first.".to_string(),
            ));
        }
    }
}

fn run_init(init: InitCli) -> Result<(), error::TidepoolError> {
    let target_dir = match init.dir {
        Some(d) => d,
        None => std::env::current_dir()?,
    };
    let target_dir = std::fs::canonicalize(&target_dir).map_err(error::TidepoolError::IoError)?;
    let store_root = target_dir.join(".tidepool").join("data");
    std::fs::create_dir_all(&store_root).map_err(error::TidepoolError::IoError)?;

    println!();
    println!("  {}", "TIDEPOOL LEDGER".bright_cyan().bold());
    println!();

    let db_path = db::ledger_db_path(&store_root);
    if db_path.exists() {
        println!(
            "    {} {} {}",
            "✓".bright_green(),
            "ledger.db".bright_white(),
            "(preserved - existing data kept)".bright_black()
        );
    } else {
        db::initialize_ledger_db(&store_root)?;
        println!("    {} {}", "●".bright_green(), "ledger.db".bright_white());
    }

    let config_path = store_root.join(config::CONFIG_FILE_NAME);
    if config_path.exists() {
        println!(
            "    {} {} {}",
            "✓".bright_green(),
            config::CONFIG_FILE_NAME.bright_white(),
            "(preserved)".bright_black()
        );
    } else {
        let defaults = LedgerConfig::default();
        std::fs::write(
            &config_path,
            toml::to_string_pretty(&defaults)
                .map_err(|e| error::TidepoolError::ConfigError(e.to_string()))?,
        )
        .map_err(error::TidepoolError::IoError)?;
        println!(
            "    {} {}",
            "●".bright_green(),
            config::CONFIG_FILE_NAME.bright_white()
        );
    }

    println!();
    println!("  Store ready at {}", store_root.display());
    Ok(())
}

pub fn run() -> Result<(), error::TidepoolError> {
    let cli = Cli::parse();
    let current_dir = std::env::current_dir()?;

    match cli.command {
        Command::Version => {
            println!("v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Init(init) => run_init(init),
        other => {
            let project_root = find_tidepool_project_root(&current_dir)?;
            let store_root = project_root.join(".tidepool").join("data");
            std::fs::create_dir_all(&store_root).map_err(error::TidepoolError::IoError)?;

            let store = Store::new(store_root.clone());
            let config = LedgerConfig::load(&store_root)?;

            match other {
                Command::Ledger(ledger_cli) => ledger::run_ledger_cli(&store, &config, ledger_cli),
                Command::Distribute(distribute_cli) => {
                    distribution::run_distribute_cli(&store, &config, distribute_cli)
                }
                Command::Govern(govern_cli) => match govern_cli.command {
                    GovernCommand::Rule(rule_cli) => rules::run_rule_cli(&store, &config, rule_cli),
                },
                Command::Treasury(treasury_cli) => {
                    payout::run_treasury_cli(&store, &config, treasury_cli)
                }
                Command::Clawback(clawback_cli) => clawback::run_clawback_cli(&store, clawback_cli),
                Command::Budget(budget_cli) => budget::run_budget_cli(&store, &config, budget_cli),
                Command::Deposit(deposit_cli) => {
                    deposits::run_deposit_cli(&store, &config, deposit_cli)
                }
                Command::Audit(audit_cli) => match audit_cli.command {
                    AuditCommand::Reconcile(reconcile_cli) => {
                        reconcile::run_reconcile_cli(&store, reconcile_cli)
                    }
                    AuditCommand::Outbox { limit } => {
                        let events = outbox::list_events(&store, limit)?;
                        println!("{}", serde_json::to_string_pretty(&events).unwrap());
                        Ok(())
                    }
                    AuditCommand::Broker => {
                        let audit_log = store_root.join("broker.events.jsonl");
                        if audit_log.exists() {
                            let content = std::fs::read_to_string(audit_log)?;
                            println!("{}", content);
                        } else {
                            println!("No audit log found.");
                        }
                        Ok(())
                    }
                },
                Command::Init(_) | Command::Version => unreachable!(),
            }
        }
    }
}
