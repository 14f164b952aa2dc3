use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::RwLock;

use gamwich_lib::backup::{BackupManager, StorageConfig};
use gamwich_lib::config::Config;
use gamwich_lib::hub::Hub;
use gamwich_lib::store::backup_records::BackupStatus;
use gamwich_lib::{backup, logging, migrate, open_pool, run_server, store};

#[derive(Parser)]
#[command(name = "gamwich", version, about = "Self-hosted family organizer")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server (the default when no subcommand is given).
    Serve,
    /// Database utilities.
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Subcommand)]
enum DbCommand {
    /// Check database integrity and migration state.
    Status,
    /// Run one encrypted backup immediately.
    Backup {
        /// Encryption passphrase; backups cannot run without one.
        #[arg(long)]
        passphrase: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    let cli = Cli::parse();
    let config = Config::from_env();

    let result = match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_server(config).await,
        Command::Db { command } => match command {
            DbCommand::Status => db_status(config).await,
            DbCommand::Backup { passphrase } => db_backup(config, passphrase).await,
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn db_status(config: Config) -> anyhow::Result<()> {
    if !config.db_path.exists() {
        anyhow::bail!("no database at {}", config.db_path.display());
    }
    backup::manager::verify_sqlite_integrity(&config.db_path)?;
    println!("integrity: ok");

    let pool = open_pool(&config).await?;
    let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_migrations")
        .fetch_one(&pool)
        .await
        .unwrap_or(0);
    println!("migrations applied: {applied}");
    let households = store::household::all_household_ids(&pool).await?;
    println!("households: {}", households.len());
    pool.close().await;
    Ok(())
}

async fn db_backup(config: Config, passphrase: String) -> anyhow::Result<()> {
    if passphrase.is_empty() {
        anyhow::bail!("the backup passphrase must not be empty");
    }
    let config = Arc::new(config);
    let pool = open_pool(&config).await?;
    migrate::apply_migrations(&pool).await?;

    let household_id = store::household::all_household_ids(&pool)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("no household exists yet"))?;
    let storage = StorageConfig::resolve(&pool, household_id, &config.s3).await?;

    let pool = Arc::new(RwLock::new(pool));
    let manager = BackupManager::new(pool.clone(), config.db_path.clone(), Hub::new());
    manager.configure(Some(storage)).await?;
    manager.set_passphrase(household_id, &passphrase).await?;

    let record = manager.run_now(household_id, &passphrase).await?;
    println!(
        "backup {}: {} ({} bytes)",
        record.id,
        record.status.as_str(),
        record.size_bytes.unwrap_or(0)
    );
    pool.read().await.close().await;
    if record.status == BackupStatus::Completed {
        Ok(())
    } else {
        anyhow::bail!(
            "backup failed: {}",
            record.error.unwrap_or_else(|| "unknown error".to_string())
        )
    }
}
