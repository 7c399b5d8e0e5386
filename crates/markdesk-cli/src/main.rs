//! `markdesk`: command-line front end for the grading assistant's local
//! backup engine and background scheduler.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use markdesk_core::backup::{
    create_auto_backup, export_backup, import_backup_with, list_backups, prune_backups,
    validate_bundle_with,
};
use markdesk_core::config::AppConfig;
use markdesk_core::models::{CoreError, SizeMismatchPolicy};
use markdesk_core::orchestration::TaskQueue;
use markdesk_core::scheduler::{Schedule, Scheduler, auto_backup_job, queue_maintenance_job};
use markdesk_core::sqlite::initialize_schema;
use serde::Serialize;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "markdesk.json";
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

/// Markdesk grading assistant maintenance tool.
#[derive(Parser, Debug)]
#[command(name = "markdesk", version, about = "Markdesk backups and background jobs")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write the configuration file if missing and create the database.
    Init,
    /// Export, validate, restore and prune backup bundles.
    Backup {
        #[command(subcommand)]
        command: BackupCommand,
    },
    /// Run the scheduler until interrupted.
    Serve,
}

#[derive(Subcommand, Debug)]
enum BackupCommand {
    /// Export the database and uploads into a bundle.
    Create {
        /// Bundle path. Defaults to a timestamped automatic backup.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Check a bundle without restoring it.
    Validate {
        file: PathBuf,
        /// Treat recorded size mismatches as errors.
        #[arg(long)]
        strict: bool,
    },
    /// Replace the live data with the contents of a bundle.
    Restore {
        file: PathBuf,
        /// Skip copying the current data aside first.
        #[arg(long)]
        no_backup_existing: bool,
        #[arg(long)]
        strict: bool,
    },
    /// List bundles in the backups directory, newest first.
    List,
    /// Delete old automatic backups.
    Prune {
        /// Number of automatic backups to keep. Defaults to the configured
        /// retention.
        #[arg(long)]
        keep: Option<usize>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(kind = ?error.kind, "{}", error.message);
            eprintln!("error: {}", error.message);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CoreError> {
    let config = AppConfig::load(&cli.config)?;

    match cli.command {
        Command::Init => init(&cli.config, &config),
        Command::Backup { command } => run_backup(&config, command),
        Command::Serve => serve(config),
    }
}

fn init(config_path: &Path, config: &AppConfig) -> Result<(), CoreError> {
    if !config_path.exists() {
        config.save(config_path)?;
        info!(path = %config_path.display(), "configuration written");
    }
    for dir in [config.uploads_path(), config.backups_path()] {
        fs::create_dir_all(&dir).map_err(|error| {
            CoreError::io(format!("failed to create '{}': {error}", dir.display()))
        })?;
    }
    let version = initialize_schema(config.database_path())?;
    info!(
        database = %config.database_path().display(),
        schema_version = version,
        "database ready"
    );
    Ok(())
}

fn run_backup(config: &AppConfig, command: BackupCommand) -> Result<(), CoreError> {
    match command {
        BackupCommand::Create { output: None } => {
            let report = create_auto_backup(config)?;
            println!("{}", report.path.display());
            print_json(&report.metadata)
        }
        BackupCommand::Create {
            output: Some(output),
        } => {
            let metadata = export_backup(
                &config.database_path(),
                &config.uploads_path(),
                &output,
                &config.app_version,
            )?;
            println!("{}", output.display());
            print_json(&metadata)
        }
        BackupCommand::Validate { file, strict } => {
            let outcome = validate_bundle_with(&file, policy(config, strict));
            if outcome.is_valid {
                println!("{}", outcome.message);
                Ok(())
            } else {
                Err(CoreError::invalid_bundle(outcome.message))
            }
        }
        BackupCommand::Restore {
            file,
            no_backup_existing,
            strict,
        } => {
            let report = import_backup_with(
                &file,
                &config.database_path(),
                &config.uploads_path(),
                !no_backup_existing,
                policy(config, strict),
            )?;
            for copy in [&report.pre_import_database, &report.pre_import_uploads]
                .into_iter()
                .flatten()
            {
                println!("previous data kept at {}", copy.display());
            }
            println!(
                "restored backup from {} ({} uploads)",
                report.metadata.created_at, report.restored_uploads
            );
            Ok(())
        }
        BackupCommand::List => {
            for summary in list_backups(&config.backups_path())? {
                let created_at = summary
                    .metadata
                    .as_ref()
                    .map(|metadata| metadata.created_at.as_str())
                    .unwrap_or("unreadable");
                println!(
                    "{}\t{}\t{}",
                    summary.path.display(),
                    summary.file_size_bytes,
                    created_at
                );
            }
            Ok(())
        }
        BackupCommand::Prune { keep } => {
            let keep = keep.unwrap_or(config.backup.retention);
            for removed in prune_backups(&config.backups_path(), keep)? {
                println!("removed {}", removed.display());
            }
            Ok(())
        }
    }
}

fn policy(config: &AppConfig, strict: bool) -> SizeMismatchPolicy {
    if strict {
        SizeMismatchPolicy::Reject
    } else {
        config.backup.size_mismatch
    }
}

fn print_json(value: &impl Serialize) -> Result<(), CoreError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|error| CoreError::internal(format!("failed to render JSON: {error}")))?;
    println!("{rendered}");
    Ok(())
}

fn serve(config: AppConfig) -> Result<(), CoreError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|error| CoreError::internal(format!("failed to start runtime: {error}")))?;

    runtime.block_on(async move {
        let queue = TaskQueue::new(config.queue_config());
        let mut scheduler = Scheduler::new(queue.clone());
        if config.backup.enabled {
            scheduler.add_job(auto_backup_job(&config)?)?;
        }
        scheduler.add_job(queue_maintenance_job(Schedule::interval(MAINTENANCE_INTERVAL)?))?;
        scheduler.start()?;
        info!(jobs = ?scheduler.job_names(), "markdesk scheduler running");

        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(error = %error, "failed to listen for interrupt; stopping");
        }

        info!("interrupt received; shutting down");
        scheduler.shutdown().await;
        if !queue.shutdown(true, config.shutdown_timeout()).await {
            warn!("some tasks were still running at shutdown");
        }
        Ok::<(), CoreError>(())
    })
}
