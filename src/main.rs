//! codex - mirrors PSA and RMM records into a local SQLite store.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;

use codex_lib::accounts;
use codex_lib::config::{load_config, Config};
use codex_lib::db::{CodexDb, SyncMode, SyncSource};
use codex_lib::error::{ErrorReport, SyncError};
use codex_lib::migrations::{self, REBUILD_CONFIRMATION};
use codex_lib::psa::FreshserviceClient;
use codex_lib::rmm::DattoClient;
use codex_lib::scheduler;
use codex_lib::schema::MODEL;
use codex_lib::services::sync as sync_service;

#[derive(Parser)]
#[command(name = "codex")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to $CODEX_CONFIG, then ~/.codex/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync: companies, assets or tickets
    Sync {
        source: SyncSource,
        /// Re-read the full lookback window instead of resuming from the watermark
        #[arg(long)]
        full: bool,
    },
    /// Bring the database schema up to date
    Migrate {
        /// List pending steps without applying them
        #[arg(long)]
        plan_only: bool,
    },
    /// Drop every table and recreate the schema
    Rebuild,
    /// Show a sync job
    Status { job_id: String },
    /// Show the last successful sync time of a source
    Watermark { source: SyncSource },
    /// Show recent sync jobs
    Jobs {
        source: Option<SyncSource>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Run syncs on their configured schedules until interrupted
    Schedule,
    /// Give PSA departments without an account number a new one
    AssignAccountNumbers,
    /// Set the AccountNumber variable on RMM sites matched to a company
    PushSiteAccounts {
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        match e.downcast_ref::<SyncError>() {
            Some(sync) => {
                let report = ErrorReport::from(sync);
                eprintln!("{}", serde_json::to_string_pretty(&report).unwrap_or_else(|_| e.to_string()));
            }
            None => eprintln!("Error: {:#}", e),
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref()).map_err(|e| anyhow!(e))?;

    match cli.command {
        Commands::Sync { source, full } => {
            let mode = if full { SyncMode::Full } else { SyncMode::Incremental };
            let job = sync_service::trigger_sync(&config, source, mode).await?;
            print_json(&job)
        }
        Commands::Migrate { plan_only } => migrate(&config, plan_only),
        Commands::Rebuild => rebuild(&config),
        Commands::Status { job_id } => print_json(&sync_service::job_status(&config, &job_id)?),
        Commands::Watermark { source } => {
            let watermark = sync_service::last_watermark(&config, source)?;
            print_json(&serde_json::json!({
                "source": source.as_str(),
                "lastSuccess": watermark.map(|at| at.to_rfc3339()),
            }))
        }
        Commands::Jobs { source, limit } => print_json(&sync_service::recent_jobs(&config, source, limit)?),
        Commands::Schedule => Ok(scheduler::serve(config).await?),
        Commands::AssignAccountNumbers => {
            let psa = config
                .psa
                .as_ref()
                .ok_or_else(|| SyncError::Configuration("no ticketing (psa) connection configured".into()))?;
            let client = FreshserviceClient::new(psa).map_err(SyncError::from)?;
            print_json(&accounts::assign_account_numbers(&client).await?)
        }
        Commands::PushSiteAccounts { dry_run } => {
            let rmm = config
                .rmm
                .as_ref()
                .ok_or_else(|| SyncError::Configuration("no monitoring (rmm) connection configured".into()))?;
            let client = DattoClient::new(rmm).map_err(SyncError::from)?;
            let mut db = sync_service::open_db(&config)?;
            print_json(&accounts::push_site_account_numbers(&client, &mut db, dry_run).await?)
        }
    }
}

fn open_unmigrated(config: &Config) -> anyhow::Result<CodexDb> {
    let path = config.database_path().map_err(|e| anyhow!(e))?;
    CodexDb::open_unmigrated(&path).with_context(|| format!("Failed to open {}", path.display()))
}

fn migrate(config: &Config, plan_only: bool) -> anyhow::Result<()> {
    let db = open_unmigrated(config)?;
    if plan_only {
        let plan = migrations::pending_plan(db.conn_ref(), &MODEL)?;
        let steps: Vec<String> = plan.steps.iter().map(|step| step.describe()).collect();
        return print_json(&serde_json::json!({ "pending": steps }));
    }
    let report = migrations::run_migrations(db.conn_ref())?;
    print_json(&report)?;
    if !report.is_clean() {
        return Err(anyhow!("{} migration step(s) failed", report.failed.len()));
    }
    Ok(())
}

fn rebuild(config: &Config) -> anyhow::Result<()> {
    let db = open_unmigrated(config)?;
    print!("This drops every table. Type '{}' to continue: ", REBUILD_CONFIRMATION);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    let report = migrations::rebuild(db.conn_ref(), &answer)?;
    print_json(&report)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
