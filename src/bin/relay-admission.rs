use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use relay_admission::gateway::observability::init_tracing;
use relay_admission::gateway::{
    Env, RelayConfig, SqliteUserStore, SubscriptionLedger, SystemClock,
};

/// Maintenance commands for the relay admission store.
#[derive(Debug, Parser)]
#[command(name = "relay-admission", version)]
struct Cli {
    /// SQLite database holding users and tokens.
    #[arg(long)]
    sqlite: PathBuf,
    /// TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Dotenv file layered over the process environment.
    #[arg(long)]
    dotenv: Option<PathBuf>,
    #[arg(long)]
    json_logs: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Roll over every subscription user's windows once and exit.
    ResetSubscriptions {
        /// Override the current time (epoch seconds).
        #[arg(long)]
        now: Option<i64>,
    },
    /// Run the periodic reset sweep until Ctrl-C.
    Run,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let env = match cli.dotenv.as_deref() {
        Some(path) => Env::load_dotenv(path)
            .map_err(|err| format!("failed to read dotenv {}: {err}", path.display()))?,
        None => Env::default(),
    };
    let mut config = match cli.config.as_deref() {
        Some(path) => RelayConfig::load(path)?,
        None => RelayConfig::default(),
    };
    config.apply_env(&env);
    config.validate()?;

    init_tracing(cli.json_logs || config.observability.json_logs)?;

    let store = Arc::new(SqliteUserStore::new(cli.sqlite.clone()));
    store.init().await?;
    let ledger = Arc::new(SubscriptionLedger::new(
        store,
        Arc::new(SystemClock),
        config.quota.subscription_group.clone(),
    ));

    match cli.command {
        Command::ResetSubscriptions { now } => {
            let now_sec = now.unwrap_or_else(|| ledger.now_sec());
            let summary = ledger.reset_all_users(now_sec).await?;
            println!("{}", serde_json::to_string(&summary)?);
        }
        Command::Run => {
            let period = Duration::from_secs(config.quota.subscription_reset_interval_secs.max(1));
            tracing::info!(
                sqlite = %cli.sqlite.display(),
                group = %ledger.subscription_group(),
                period_secs = period.as_secs(),
                "starting subscription reset sweep"
            );
            let sweep = ledger.spawn_reset_sweep(period);
            tokio::signal::ctrl_c().await?;
            tracing::info!("shutting down");
            sweep.stop().await;
        }
    }
    Ok(())
}
