//! Snapshot retention: which snapshots survive, and the sweep that removes the rest.

pub mod interval;

pub use interval::IntervalKeepStrategy;

use crate::snapshot::SnapshotStore;
use crate::utils::errors::{BackupError, Result};
use chrono::NaiveDateTime;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Policy used by the standalone prune tool
pub const STANDALONE_KEEP_INTERVALS: &str = "1h 2h 3h 4h 5h 6h 12h 1d 2d 3d 4d 5d 6d 7d 8d 9d 10d 11d 12d 13d 14d 21d 28d 35d 42d 49d 56d 84d 112d 140d 210d 350d 490d";

/// Decides which snapshots to retain. Must be a pure function of its inputs.
pub trait KeepStrategy: fmt::Debug + Send + Sync {
    fn backups_to_keep(
        &self,
        now: NaiveDateTime,
        available: &[NaiveDateTime],
    ) -> BTreeSet<NaiveDateTime>;
}

/// Parse a `name|args` keep strategy setting, e.g. `interval|1h 2h 1d`
pub fn parse_keep_strategy(setting: &str) -> Result<Arc<dyn KeepStrategy>> {
    let (name, args) = setting.split_once('|').unwrap_or((setting, ""));
    let name = name.trim();

    if name.eq_ignore_ascii_case("interval") {
        Ok(Arc::new(IntervalKeepStrategy::parse(args)?))
    } else {
        Err(BackupError::Config(format!("Invalid keep strategy: {}", name)))
    }
}

/// Outcome of one retention sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PruneReport {
    pub kept: Vec<NaiveDateTime>,
    pub deleted: Vec<NaiveDateTime>,
    pub failed: Vec<NaiveDateTime>,
}

/// Delete every snapshot the strategy does not keep, then refresh `current`.
///
/// Per-snapshot failures are logged and skipped; the sweep always runs to the
/// end. An empty kept set deletes nothing.
pub fn prune(
    store: &SnapshotStore,
    strategy: &dyn KeepStrategy,
    now: NaiveDateTime,
) -> Result<PruneReport> {
    let backups = store.list_snapshots()?;
    let keep = strategy.backups_to_keep(now, &backups);

    let mut report = PruneReport {
        kept: keep.iter().copied().collect(),
        ..PruneReport::default()
    };

    if keep.is_empty() {
        return Ok(report);
    }

    for backup in backups.into_iter().filter(|b| !keep.contains(b)) {
        info!("Deleting old backup {}", backup);
        match store.delete(backup) {
            Ok(()) => report.deleted.push(backup),
            Err(BackupError::NotFound(msg)) => {
                error!("BUG: {}", msg);
            }
            Err(e) => {
                warn!("Failed to delete backup {}: {}", backup, e);
                report.failed.push(backup);
            }
        }
    }

    store.refresh_current_pointer()?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn store_with(ages: &[Duration]) -> (TempDir, SnapshotStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(temp_dir.path()).unwrap();
        for age in ages {
            fs::create_dir_all(store.snapshot_path(now() - *age).join("ROOT")).unwrap();
        }
        (temp_dir, store)
    }

    /// Keeps only the newest snapshot and removes one directory behind the sweep's back
    #[derive(Debug)]
    struct VanishingStrategy {
        store: SnapshotStore,
        vanish: NaiveDateTime,
    }

    impl KeepStrategy for VanishingStrategy {
        fn backups_to_keep(
            &self,
            _now: NaiveDateTime,
            available: &[NaiveDateTime],
        ) -> BTreeSet<NaiveDateTime> {
            fs::remove_dir_all(self.store.snapshot_path(self.vanish)).unwrap();
            available.iter().max().copied().into_iter().collect()
        }
    }

    #[derive(Debug)]
    struct KeepNothing;

    impl KeepStrategy for KeepNothing {
        fn backups_to_keep(
            &self,
            _: NaiveDateTime,
            _: &[NaiveDateTime],
        ) -> BTreeSet<NaiveDateTime> {
            BTreeSet::new()
        }
    }

    #[test]
    fn test_parse_keep_strategy() {
        assert!(parse_keep_strategy("interval|1h 2h 1d").is_ok());
        assert!(parse_keep_strategy(" Interval | 1d 7d").is_ok());
        assert!(matches!(
            parse_keep_strategy("fifo|10"),
            Err(BackupError::Config(_))
        ));
        assert!(matches!(
            parse_keep_strategy("interval"),
            Err(BackupError::InvalidPolicy(_))
        ));
        assert!(matches!(
            parse_keep_strategy("interval|2d 1d"),
            Err(BackupError::InvalidPolicy(_))
        ));
    }

    #[test]
    fn test_standalone_policy_parses() {
        let strategy = IntervalKeepStrategy::parse(STANDALONE_KEEP_INTERVALS).unwrap();
        assert_eq!(strategy.intervals().len(), 33);
    }

    #[test]
    fn test_prune_deletes_unkept_and_refreshes_current() -> Result<()> {
        let ages = [Duration::zero(), Duration::hours(1), Duration::hours(3), Duration::hours(28)];
        let (_temp_dir, store) = store_with(&ages);
        let strategy = IntervalKeepStrategy::parse("1h 2h 1d")?;

        let report = prune(&store, &strategy, now())?;

        assert_eq!(report.deleted, vec![now() - Duration::hours(28)]);
        assert!(report.failed.is_empty());
        assert_eq!(report.kept.len(), 3);
        assert_eq!(store.list_snapshots()?, report.kept);
        assert_eq!(
            fs::read_link(store.current_pointer_path())?,
            PathBuf::from(crate::snapshot::format_snapshot_name(now()))
        );
        Ok(())
    }

    #[test]
    fn test_prune_skips_vanished_snapshot() -> Result<()> {
        let ages = [Duration::zero(), Duration::days(1), Duration::days(2)];
        let (_temp_dir, store) = store_with(&ages);
        let strategy = VanishingStrategy {
            store: store.clone(),
            vanish: now() - Duration::days(1),
        };

        let report = prune(&store, &strategy, now())?;

        assert_eq!(report.deleted, vec![now() - Duration::days(2)]);
        assert!(report.failed.is_empty());
        assert_eq!(store.list_snapshots()?, vec![now()]);
        Ok(())
    }

    #[test]
    fn test_prune_with_empty_keep_set_deletes_nothing() -> Result<()> {
        let ages = [Duration::zero(), Duration::days(1)];
        let (_temp_dir, store) = store_with(&ages);

        let report = prune(&store, &KeepNothing, now())?;

        assert!(report.deleted.is_empty());
        assert_eq!(store.list_snapshots()?.len(), 2);
        Ok(())
    }
}
