//! georef - command line entry point

use anyhow::Context;
use clap::{Parser, Subcommand};
use georef::db::{create_pool, health_check};
use georef::refresh::status::{PgStatusStore, RefreshStatusTracker};
use georef::refresh::ProgressCallback;
use georef::{InstallReport, Installer, PgTableStore, RefreshConfig};
use georef_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Refresh reference tables from published extracts
#[derive(Parser, Debug)]
#[command(name = "georef")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Partition directory (overrides GEOREF_STORAGE_DIR)
    #[arg(long, global = true, env = "GEOREF_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Merge partitions and bulk load the places table
    Places,

    /// Load lookup tables from the given files
    Lookups {
        /// Lookup files named <prefix>_<language>.txt
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Places, then lookups, as one tracked install
    Install {
        /// Lookup files named <prefix>_<language>.txt
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Show the lifecycle state of every dataset
    Status,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    dotenvy::dotenv().ok();

    let log_config = LogConfig::builder()
        .level(if cli.verbose {
            LogLevel::Debug
        } else {
            LogLevel::Info
        })
        .output(LogOutput::Console)
        .log_file_prefix("georef")
        .build();

    // Environment settings take precedence over flags
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);
    let _guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {e:#}");
            None
        }
    };

    if let Err(e) = run(cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = RefreshConfig::load().context("Failed to load configuration")?;
    if let Some(dir) = cli.storage_dir {
        config = config.with_storage_dir(dir);
    }

    let pool = create_pool(&config.database)
        .await
        .context("Failed to connect to database")?;
    health_check(&pool).await.context("Database health check failed")?;

    let status_store = PgStatusStore::connect(pool.clone(), &config.tables.status)
        .await
        .context("Failed to prepare status table")?;
    let tracker = RefreshStatusTracker::new(Arc::new(status_store));

    if let Command::Status = cli.command {
        for record in tracker.all().await? {
            info!(
                dataset = %record.dataset,
                state = %record.state,
                first_installed_at = ?record.first_installed_at,
                last_installed_at = ?record.last_installed_at,
                last_error = ?record.last_error,
                "Dataset status"
            );
        }
        return Ok(());
    }

    let store = Arc::new(PgTableStore::new(pool.clone()));
    let installer = Installer::new(store, tracker, config).with_lock(pool);

    let progress: ProgressCallback = Arc::new(|fraction, message: &str| {
        tracing::debug!(percent = fraction * 100.0, "{}", message);
    });

    let report = match cli.command {
        Command::Places => installer.refresh_places(Some(&progress)).await?,
        Command::Lookups { files } => installer.refresh_lookups(&files, Some(&progress)).await?,
        Command::Install { files } => installer.install(&files, Some(&progress)).await?,
        Command::Status => InstallReport::default(),
    };

    for summary in [&report.places, &report.feature_codes].into_iter().flatten() {
        if summary.is_success() {
            info!("{}", summary.summary());
        } else {
            warn!("{}", summary.summary());
        }
    }

    if !report.is_success() {
        anyhow::bail!("Refresh did not complete; live tables were left unchanged");
    }
    Ok(())
}
