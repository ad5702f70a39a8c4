mod commands;
mod logging;
mod output;

use anyhow::Context;
use clap::{Parser, Subcommand};
use elif_migrate::{DriverRegistry, MigrateConfig, Migrator};
use std::path::PathBuf;

use commands::Outcome;
use logging::{LogFormat, LoggingConfig};

#[derive(Parser)]
#[command(name = "elif-migrate")]
#[command(version, about = "Apply and roll back versioned SQL migrations")]
struct Cli {
    /// Database URL, e.g. postgres://user@localhost/app, mysql://root@localhost/app or sqlite://app.db
    #[arg(long, env = "MIGRATE_URL", global = true)]
    url: Option<String>,

    /// Directory holding the migration files
    #[arg(long, env = "MIGRATE_PATH", global = true)]
    path: Option<PathBuf>,

    /// Table storing applied versions
    #[arg(long, global = true)]
    version_table: Option<String>,

    /// Log level filter, replacing the format's default filter (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply all pending up migrations
    Up,

    /// Roll back all applied migrations
    Down,

    /// Apply n migrations, rolling back when n is negative
    Migrate {
        #[arg(allow_negative_numbers = true)]
        n: i64,
    },

    /// Migrate towards version v
    Goto {
        v: u64,
    },

    /// Roll back everything, then apply everything
    Reset,

    /// Roll back the latest migration and apply it again
    Redo,

    /// Show the current version
    Version,

    /// Remove the migration lock regardless of its holder
    ForceUnlock,

    /// Show who holds the migration lock
    LockStatus,
}

impl Cli {
    fn logging(&self) -> LoggingConfig {
        let logging = LoggingConfig::for_format(self.log_format);
        match &self.log_level {
            Some(level) => logging.with_level(level.clone()),
            None => logging,
        }
    }

    fn config(&self) -> anyhow::Result<MigrateConfig> {
        let mut config = MigrateConfig::from_env().context("Invalid migration environment")?;

        if let Some(url) = &self.url {
            config.set_database_url(Some(url.clone()));
        }
        if let Some(path) = &self.path {
            config.set_migrations_dir(path.clone());
        }
        if let Some(table) = &self.version_table {
            config.set_version_table(table.clone());
        }

        config.validate()?;
        Ok(config)
    }
}

async fn run(cli: Cli) -> anyhow::Result<Outcome> {
    let config = cli.config()?;
    let migrator = Migrator::from_config(&DriverRegistry::with_defaults(), config)
        .context("Unable to set up migrator")?;

    let outcome = match cli.command {
        Commands::Up => commands::stream(migrator.up_async()).await,
        Commands::Down => commands::stream(migrator.down_async()).await,
        Commands::Migrate { n } => commands::stream(migrator.migrate_async(n)).await,
        Commands::Goto { v } => commands::stream(migrator.goto_async(v)).await,
        Commands::Reset => commands::collected(migrator.reset()).await,
        Commands::Redo => commands::collected(migrator.redo()).await,
        Commands::Version => commands::version(&migrator).await?,
        Commands::ForceUnlock => commands::force_unlock(&migrator).await?,
        Commands::LockStatus => commands::lock_status(&migrator).await?,
    };

    if let Err(e) = migrator.close().await {
        tracing::warn!("Failed to close driver: {}", e);
    }
    Ok(outcome)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = logging::init_logging(&cli.logging()) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    match run(cli).await {
        Ok(Outcome::Success) => {}
        Ok(Outcome::Failed) => std::process::exit(1),
        Err(e) => {
            output::print_error(&e);
            std::process::exit(1);
        }
    }
}
