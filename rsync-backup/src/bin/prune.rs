//! rsync-backup-prune - standalone retention sweep.
//!
//! Applies a fixed interval policy to one host directory, or to every host
//! directory below the storage root, without running a transfer.

use anyhow::{bail, Context, Result};
use clap::Parser;
use rsync_backup::retention::{self, IntervalKeepStrategy, STANDALONE_KEEP_INTERVALS};
use rsync_backup::snapshot::{snapshot_now, SnapshotStore};
use rsync_backup::utils;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host directory to prune, or ALL for every host directory
    #[arg(value_name = "TARGET")]
    target: String,

    /// Storage root holding one directory per host
    #[arg(short, long, value_name = "DIR", default_value = "hosts")]
    storage_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    utils::logger::init(&args.log_level)?;

    let strategy = IntervalKeepStrategy::parse(STANDALONE_KEEP_INTERVALS)?;

    let host_dirs = if args.target.eq_ignore_ascii_case("ALL") {
        list_host_dirs(&args.storage_dir)?
    } else {
        vec![args.storage_dir.join(&args.target)]
    };

    let mut failed = 0;
    for dir in &host_dirs {
        let host = dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let span = tracing::info_span!("prune", host = %host);
        let _enter = span.enter();

        tracing::info!("Deleting old backups");
        let outcome = SnapshotStore::open(dir)
            .and_then(|store| retention::prune(&store, &strategy, snapshot_now()));

        match outcome {
            Ok(report) => tracing::info!(
                kept = report.kept.len(),
                deleted = report.deleted.len(),
                failed = report.failed.len(),
                "Retention sweep finished"
            ),
            Err(e) => {
                tracing::error!("Retention sweep failed: {}", e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} hosts could not be pruned", failed, host_dirs.len());
    }
    Ok(())
}

/// Every directory below the storage root, sorted by name
fn list_host_dirs(storage_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    let entries = std::fs::read_dir(storage_dir)
        .with_context(|| format!("Cannot read storage directory {}", storage_dir.display()))?;

    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }

    dirs.sort();
    Ok(dirs)
}
