//! rsync-backup - Main entry point
//!
//! Backs up a single host, or every configured host with bounded parallelism.

use anyhow::{Context, Result};
use clap::Parser;
use rsync_backup::{scheduler, utils, BackupExecutor, Config, HostConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host to back up, or ALL for every configured host
    #[arg(value_name = "TARGET")]
    target: String,

    /// Hosts backed up in parallel when running ALL
    #[arg(value_name = "MAX_PARALLEL", default_value_t = 1)]
    max_parallel: usize,

    /// Directory holding backup.toml and the ssh key files
    #[arg(short, long, value_name = "DIR", default_value = "conf")]
    conf_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load(&args.conf_dir)
        .with_context(|| format!("Failed to load configuration from {}", args.conf_dir.display()))?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!("Starting rsync-backup v{}", env!("CARGO_PKG_VERSION"));
    tracing::debug!("Using config dir: {}", config.conf_dir.display());

    let executor = Arc::new(BackupExecutor::new(config.ssh.clone()));

    if args.target.eq_ignore_ascii_case("ALL") {
        let hosts = config.hosts().to_vec();
        tracing::info!(
            hosts = hosts.len(),
            max_parallel = args.max_parallel,
            "Backing up all hosts"
        );

        let summary = scheduler::run_all(args.max_parallel, hosts, move |host| {
            let executor = executor.clone();
            async move { backup_host(&executor, &host).await }
        })
        .await;

        if summary.failed > 0 {
            tracing::warn!("{} of {} backups failed", summary.failed, summary.total());
        }
    } else {
        let host = config.host(&args.target)?;
        backup_host(&executor, host).await?;
    }

    Ok(())
}

/// Run one host inside its own log span
async fn backup_host(executor: &BackupExecutor, host: &HostConfig) -> rsync_backup::Result<()> {
    let span = tracing::info_span!("backup", host = %host.host, run = %Uuid::new_v4());

    async {
        let stats = executor.run(host).await?;
        stats.ensure_ok(&host.host)
    }
    .instrument(span)
    .await
}
