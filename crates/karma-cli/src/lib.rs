//! Operator command surface for the karma engine.
//!
//! [`run_cli`] executes a parsed [`Cli`]; [`run_command`] runs a single
//! [`Command`] against an already opened store, dispatcher and config.
//! Every command prints JSON on stdout unless a table view is available and
//! `--json` is not set. Logs go to stderr.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use karma_core::{
    parse_rfc3339_utc, KarmaConfig, KarmaError, NotificationDispatcher, RankTable, ReasonCode,
    Wizard, WizardId, WizardRegistration,
};
use karma_dispatch::{
    HttpRelayConfig, HttpRelayDispatcher, NoopDispatcher, DEFAULT_RELAY_TIMEOUT_MS,
};
use karma_reputation::ReputationService;
use karma_store_sqlite::{AuditReport, SqliteKarmaStore};
use serde_json::{json, Value};
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "karma")]
#[command(about = "Campus marketplace karma reputation CLI")]
pub struct Cli {
    #[arg(long, env = "KARMA_DB", default_value = "./karma.sqlite3")]
    db: PathBuf,

    /// JSON karma config; built-in defaults when omitted.
    #[arg(long, env = "KARMA_CONFIG")]
    config: Option<PathBuf>,

    /// Realtime relay endpoint. Notifications are dropped when unset.
    #[arg(long, env = "KARMA_RELAY_URL")]
    relay_url: Option<String>,

    /// Name of the env var holding the relay bearer token.
    #[arg(long)]
    relay_token_env: Option<String>,

    #[arg(long, default_value_t = DEFAULT_RELAY_TIMEOUT_MS)]
    relay_timeout_ms: u64,

    #[arg(long, env = "KARMA_LOG", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Wizard {
        #[command(subcommand)]
        command: WizardCommand,
    },
    Award(AwardArgs),
    DailyBonus(DailyBonusArgs),
    Ledger {
        #[command(subcommand)]
        command: LedgerCommand,
    },
    Notifications {
        #[command(subcommand)]
        command: NotificationsCommand,
    },
    Ranks(JsonArgs),
    Leaderboard(LeaderboardArgs),
    Audit(JsonArgs),
}

#[derive(Debug, Subcommand)]
pub enum WizardCommand {
    Register(RegisterArgs),
    Show(WizardArgs),
}

#[derive(Debug, Args)]
pub struct RegisterArgs {
    #[arg(long)]
    wizard_id: String,
    #[arg(long)]
    display_name: String,
}

#[derive(Debug, Args)]
pub struct WizardArgs {
    #[arg(long)]
    wizard_id: String,
}

#[derive(Debug, Args)]
pub struct AwardArgs {
    #[arg(long)]
    wizard_id: String,
    /// Wire reason code, e.g. `return_lost_item`.
    #[arg(long)]
    reason: String,
    /// Overrides the configured amount for the reason.
    #[arg(long, allow_negative_numbers = true)]
    delta: Option<i64>,
    #[arg(long)]
    reference_id: Option<String>,
}

#[derive(Debug, Args)]
pub struct DailyBonusArgs {
    #[arg(long)]
    wizard_id: String,
    /// RFC3339 UTC instant of the login; defaults to now.
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum LedgerCommand {
    List(LedgerListArgs),
}

#[derive(Debug, Args)]
pub struct LedgerListArgs {
    #[arg(long)]
    wizard_id: String,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum NotificationsCommand {
    Pending(LimitArgs),
}

#[derive(Debug, Args)]
pub struct LimitArgs {
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct LeaderboardArgs {
    #[arg(long, default_value_t = 10)]
    limit: usize,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct JsonArgs {
    #[arg(long)]
    json: bool,
}

/// Installs the stderr fmt subscriber. `RUST_LOG` wins over `level`.
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

/// Executes the parsed top-level CLI command.
///
/// # Errors
/// Returns an error when config loading, store access, dispatcher setup or
/// command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;

    if let Command::Ranks(args) = &cli.command {
        return print_ranks(&config.rank_table, args.json);
    }

    let mut store = SqliteKarmaStore::open(&cli.db)?;
    store.migrate()?;
    let dispatcher = build_dispatcher(
        cli.relay_url.as_deref(),
        cli.relay_token_env.as_deref(),
        cli.relay_timeout_ms,
    )?;
    debug!(
        db = %cli.db.display(),
        dispatcher = dispatcher.dispatcher_name(),
        "karma cli ready"
    );

    run_command(cli.command, &mut store, dispatcher.as_ref(), &config)
}

/// Runs one command against an open store.
///
/// # Errors
/// Returns an error when argument parsing or the underlying operation fails,
/// and when `audit` finds error-level issues.
pub fn run_command(
    command: Command,
    store: &mut SqliteKarmaStore,
    dispatcher: &dyn NotificationDispatcher,
    config: &KarmaConfig,
) -> Result<()> {
    match command {
        Command::Wizard { command } => match command {
            WizardCommand::Register(args) => {
                let wizard = store.register_wizard(&WizardRegistration {
                    wizard_id: parse_wizard_id(&args.wizard_id)?,
                    display_name: args.display_name,
                })?;
                print_json(&wizard)
            }
            WizardCommand::Show(args) => {
                let wizard_id = parse_wizard_id(&args.wizard_id)?;
                let wizard = require_wizard(store, &wizard_id)?;
                let progress = config.rank_table.progress(wizard.karma_score);
                print_json(&json!({
                    "wizard": wizard,
                    "progress": progress,
                }))
            }
        },
        Command::Award(args) => {
            let wizard_id = parse_wizard_id(&args.wizard_id)?;
            let reason = ReasonCode::from_wire(&args.reason)?;
            let delta = match args.delta {
                Some(value) => value,
                None => config.amount_for(reason)?,
            };
            let mut service = ReputationService::new(store, dispatcher, config);
            let outcome = service.award(&wizard_id, delta, reason, args.reference_id.as_deref())?;
            print_json(&outcome)
        }
        Command::DailyBonus(args) => {
            let wizard_id = parse_wizard_id(&args.wizard_id)?;
            let mut service = ReputationService::new(store, dispatcher, config);
            let outcome = match args.at {
                Some(raw) => {
                    let at = parse_rfc3339_utc(&raw)
                        .with_context(|| format!("invalid --at timestamp: {raw}"))?;
                    service.grant_daily_login_bonus_at(&wizard_id, at)?
                }
                None => service.grant_daily_login_bonus(&wizard_id)?,
            };
            print_json(&outcome)
        }
        Command::Ledger { command } => match command {
            LedgerCommand::List(args) => {
                let wizard_id = parse_wizard_id(&args.wizard_id)?;
                let _ = require_wizard(store, &wizard_id)?;
                print_json(&store.list_ledger(&wizard_id, args.limit)?)
            }
        },
        Command::Notifications { command } => match command {
            NotificationsCommand::Pending(args) => {
                print_json(&store.list_undelivered_notifications(args.limit)?)
            }
        },
        Command::Ranks(args) => print_ranks(&config.rank_table, args.json),
        Command::Leaderboard(args) => {
            let wizards = store.leaderboard(Some(args.limit))?;
            if args.json {
                print_json(&wizards)
            } else {
                print_leaderboard(&wizards);
                Ok(())
            }
        }
        Command::Audit(args) => {
            let report = store.audit(&config.rank_table)?;
            if args.json {
                print_json(&report)?;
            } else {
                print_audit(&report);
            }

            if !report.healthy {
                return Err(anyhow!(
                    "karma audit failed: {}",
                    report
                        .issues
                        .iter()
                        .map(|issue| format!("{}:{}", issue.code, issue.message))
                        .collect::<Vec<_>>()
                        .join("; ")
                ));
            }
            Ok(())
        }
    }
}

/// Loads and validates a JSON config, or returns the built-in defaults.
///
/// # Errors
/// Returns an error when the file cannot be read or fails validation.
pub fn load_config(path: Option<&Path>) -> Result<KarmaConfig> {
    let Some(path) = path else {
        return Ok(KarmaConfig::v1());
    };

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read karma config at {}", path.display()))?;
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("karma config must be valid JSON: {}", path.display()))?;
    Ok(KarmaConfig::from_json(&value)?)
}

/// # Errors
/// Returns an error when the relay config is invalid or the token env var is unset.
pub fn build_dispatcher(
    relay_url: Option<&str>,
    relay_token_env: Option<&str>,
    relay_timeout_ms: u64,
) -> Result<Box<dyn NotificationDispatcher>> {
    let Some(url) = relay_url else {
        return Ok(Box::new(NoopDispatcher::new()));
    };

    let mut relay = HttpRelayConfig::new(url).with_timeout_ms(relay_timeout_ms);
    if let Some(env_name) = relay_token_env {
        relay = relay.with_token_env(env_name)?;
    }
    Ok(Box::new(HttpRelayDispatcher::new(relay)?))
}

fn parse_wizard_id(raw: &str) -> Result<WizardId> {
    Ok(WizardId::parse(raw)?)
}

fn require_wizard(store: &SqliteKarmaStore, wizard_id: &WizardId) -> Result<Wizard> {
    store
        .get_wizard(wizard_id)?
        .ok_or_else(|| KarmaError::UserNotFound(wizard_id.to_string()).into())
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_ranks(table: &RankTable, as_json: bool) -> Result<()> {
    if as_json {
        return print_json(&table.thresholds);
    }

    println!("{:<16} {:>12}", "rank", "min_score");
    println!("{}", "-".repeat(29));
    for threshold in &table.thresholds {
        println!("{:<16} {:>12}", threshold.rank, threshold.min_score);
    }
    Ok(())
}

fn print_leaderboard(wizards: &[Wizard]) {
    println!(
        "{:<4} {:<32} {:<24} {:>10} rank",
        "#", "wizard_id", "display_name", "score"
    );
    println!("{}", "-".repeat(90));
    for (position, wizard) in wizards.iter().enumerate() {
        println!(
            "{:<4} {:<32} {:<24} {:>10} {}",
            position + 1,
            wizard.wizard_id,
            wizard.display_name,
            wizard.karma_score,
            wizard.karma_rank
        );
    }
}

fn print_audit(report: &AuditReport) {
    println!(
        "contract={} wizards_checked={} ledger_entries={} pending_notifications={} failed_notifications={}",
        report.contract_version,
        report.wizards_checked,
        report.ledger_entries,
        report.pending_notifications,
        report.failed_notifications
    );
    println!("healthy={}", if report.healthy { "yes" } else { "no" });
    for issue in &report.issues {
        println!(
            "  [{:?}] {} {} {}",
            issue.severity,
            issue.code,
            issue
                .wizard_id
                .as_ref()
                .map_or("-", WizardId::as_str),
            issue.message
        );
    }
}
