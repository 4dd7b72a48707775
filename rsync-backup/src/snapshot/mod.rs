//! On-disk snapshot history for a single host.
//!
//! Layout of a host storage directory:
//!
//! ```text
//! <host_storage_dir>/
//!     backup-2024-05-01-03:00:12/   finalized snapshot
//!     backup-2024-05-02-03:00:09/   finalized snapshot
//!     current -> backup-2024-05-02-03:00:09   (relative symlink)
//!     .sync/                        in-progress transfer, resumable
//! ```
//!
//! Snapshot directory names sort lexicographically in chronological order.
//! Entries whose names do not parse are not snapshots and are ignored.

use crate::utils::errors::{BackupError, Result};
use chrono::{Local, NaiveDateTime, SubsecRound};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Snapshot directory name pattern
const SNAPSHOT_NAME_FORMAT: &str = "backup-%Y-%m-%d-%H:%M:%S";

/// Name of the symlink pointing at the newest snapshot
pub const CURRENT_LINK_NAME: &str = "current";

/// Name of the in-progress sync workspace
pub const SYNC_DIR_NAME: &str = ".sync";

/// Render a snapshot timestamp as its directory name
pub fn format_snapshot_name(timestamp: NaiveDateTime) -> String {
    timestamp.format(SNAPSHOT_NAME_FORMAT).to_string()
}

/// Parse a directory name back into a snapshot timestamp
pub fn parse_snapshot_name(name: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(name, SNAPSHOT_NAME_FORMAT).ok()
}

/// Current local time at snapshot resolution (whole seconds)
pub fn snapshot_now() -> NaiveDateTime {
    Local::now().naive_local().trunc_subsecs(0)
}

/// Snapshot history of one host
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    /// Open an existing host storage directory
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(BackupError::NotFound(format!(
                "No such directory: {}",
                root.display()
            )));
        }

        let root = if root.is_absolute() {
            root.to_path_buf()
        } else {
            std::env::current_dir()?.join(root)
        };

        Ok(Self { root })
    }

    /// Path of the directory holding the given snapshot
    pub fn snapshot_path(&self, timestamp: NaiveDateTime) -> PathBuf {
        self.root.join(format_snapshot_name(timestamp))
    }

    /// Path of the sync workspace (may not exist)
    pub fn workspace_path(&self) -> PathBuf {
        self.root.join(SYNC_DIR_NAME)
    }

    /// Path of the current pointer (may not exist)
    pub fn current_pointer_path(&self) -> PathBuf {
        self.root.join(CURRENT_LINK_NAME)
    }

    /// All snapshots of this host, oldest first
    pub fn list_snapshots(&self) -> Result<Vec<NaiveDateTime>> {
        let mut snapshots = Vec::new();

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            if let Some(timestamp) = name.to_str().and_then(parse_snapshot_name) {
                snapshots.push(timestamp);
            }
        }

        snapshots.sort();
        Ok(snapshots)
    }

    /// The newest snapshot, if any
    pub fn latest(&self) -> Result<Option<NaiveDateTime>> {
        Ok(self.list_snapshots()?.last().copied())
    }

    /// Return the sync workspace, creating it when absent.
    ///
    /// An existing workspace is left untouched so an interrupted transfer
    /// resumes where it stopped.
    pub fn open_workspace(&self) -> Result<PathBuf> {
        let workspace = self.workspace_path();
        if workspace.is_dir() {
            debug!("Resuming previous backup to {}", workspace.display());
        } else {
            fs::create_dir_all(&workspace)?;
        }
        Ok(workspace)
    }

    /// Promote the sync workspace to a snapshot stamped with the current time
    pub fn finalize(&self) -> Result<NaiveDateTime> {
        self.finalize_at(snapshot_now())
    }

    /// Promote the sync workspace to a snapshot with the given timestamp
    pub fn finalize_at(&self, timestamp: NaiveDateTime) -> Result<NaiveDateTime> {
        let workspace = self.workspace_path();
        if !workspace.is_dir() {
            return Err(BackupError::Conflict(format!(
                "Unable to move {} to new location. No such directory",
                workspace.display()
            )));
        }

        let target = self.snapshot_path(timestamp);
        if fs::symlink_metadata(&target).is_ok() {
            return Err(BackupError::Conflict(format!(
                "Unable to move {} to new location. Directory already exists: {}",
                workspace.display(),
                target.display()
            )));
        }

        fs::rename(&workspace, &target)?;
        info!("Finalized snapshot {}", target.display());

        self.refresh_current_pointer()?;
        Ok(timestamp)
    }

    /// Point `current` at the newest snapshot.
    ///
    /// Returns the pointer path, or `None` when there is no snapshot (a stale
    /// pointer is removed in that case). Nothing is written when the pointer
    /// is already correct.
    pub fn refresh_current_pointer(&self) -> Result<Option<PathBuf>> {
        let link = self.current_pointer_path();
        let is_symlink = fs::symlink_metadata(&link)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);

        let Some(latest) = self.latest()? else {
            if is_symlink {
                info!("Removing old link: {}", link.display());
                fs::remove_file(&link)?;
            }
            return Ok(None);
        };

        let target = PathBuf::from(format_snapshot_name(latest));

        if is_symlink {
            if fs::read_link(&link)? == target {
                return Ok(Some(link));
            }
            fs::remove_file(&link)?;
        }

        info!("Linking {} -> {}", link.display(), target.display());
        std::os::unix::fs::symlink(&target, &link).map_err(|e| match e.kind() {
            ErrorKind::AlreadyExists => BackupError::Conflict(format!(
                "{} exists and is not a symbolic link",
                link.display()
            )),
            _ => BackupError::Io(e),
        })?;

        Ok(Some(link))
    }

    /// Recursively remove one snapshot.
    ///
    /// A partially removed directory is harmless: it either still parses and
    /// is retried on the next sweep, or it no longer looks like a snapshot.
    pub fn delete(&self, timestamp: NaiveDateTime) -> Result<()> {
        let path = self.snapshot_path(timestamp);
        if !path.is_dir() {
            return Err(BackupError::NotFound(format!(
                "Backup in list not found in filesystem: {}",
                path.display()
            )));
        }

        fs::remove_dir_all(&path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn ts(day: u32, hour: u32, min: u32, sec: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, day)
            .unwrap()
            .and_hms_opt(hour, min, sec)
            .unwrap()
    }

    fn make_snapshot(store: &SnapshotStore, timestamp: NaiveDateTime) {
        fs::create_dir_all(store.snapshot_path(timestamp).join("ROOT")).unwrap();
    }

    #[test]
    fn test_snapshot_name_format() {
        assert_eq!(format_snapshot_name(ts(1, 3, 4, 5)), "backup-2024-05-01-03:04:05");
        assert_eq!(
            parse_snapshot_name("backup-2024-05-01-03:04:05"),
            Some(ts(1, 3, 4, 5))
        );
    }

    #[test]
    fn test_snapshot_name_round_trip() {
        let samples = [
            ts(1, 0, 0, 0),
            ts(31, 23, 59, 59),
            NaiveDate::from_ymd_opt(1999, 12, 31).unwrap().and_hms_opt(12, 0, 1).unwrap(),
            NaiveDate::from_ymd_opt(2038, 1, 19).unwrap().and_hms_opt(3, 14, 8).unwrap(),
        ];
        for sample in samples {
            assert_eq!(parse_snapshot_name(&format_snapshot_name(sample)), Some(sample));
        }
    }

    #[test]
    fn test_snapshot_names_sort_chronologically() {
        let mut names = vec![
            format_snapshot_name(ts(10, 1, 0, 0)),
            format_snapshot_name(ts(2, 23, 0, 0)),
            format_snapshot_name(ts(10, 0, 59, 59)),
        ];
        names.sort();
        let parsed: Vec<_> = names.iter().filter_map(|n| parse_snapshot_name(n)).collect();
        assert_eq!(parsed, vec![ts(2, 23, 0, 0), ts(10, 0, 59, 59), ts(10, 1, 0, 0)]);
    }

    #[test]
    fn test_rejects_foreign_names() {
        assert_eq!(parse_snapshot_name("current"), None);
        assert_eq!(parse_snapshot_name(".sync"), None);
        assert_eq!(parse_snapshot_name("backup-2024-05-01"), None);
        assert_eq!(parse_snapshot_name("backup-2024-05-01-03:04:05.old"), None);
        assert_eq!(parse_snapshot_name("backup-2024-13-01-03:04:05"), None);
    }

    #[test]
    fn test_open_requires_directory() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("nope");
        assert!(matches!(
            SnapshotStore::open(&missing),
            Err(BackupError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_snapshots_ignores_non_snapshots() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = SnapshotStore::open(temp_dir.path())?;

        make_snapshot(&store, ts(3, 0, 0, 0));
        make_snapshot(&store, ts(1, 0, 0, 0));
        make_snapshot(&store, ts(2, 0, 0, 0));
        fs::create_dir(temp_dir.path().join("lost+found"))?;
        fs::create_dir(temp_dir.path().join(SYNC_DIR_NAME))?;
        fs::write(temp_dir.path().join("backup-2024-05-09-00:00:00"), b"a file")?;

        assert_eq!(
            store.list_snapshots()?,
            vec![ts(1, 0, 0, 0), ts(2, 0, 0, 0), ts(3, 0, 0, 0)]
        );
        assert_eq!(store.latest()?, Some(ts(3, 0, 0, 0)));
        Ok(())
    }

    #[test]
    fn test_empty_store() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = SnapshotStore::open(temp_dir.path())?;

        assert!(store.list_snapshots()?.is_empty());
        assert_eq!(store.latest()?, None);
        assert_eq!(store.refresh_current_pointer()?, None);
        Ok(())
    }

    #[test]
    fn test_open_workspace_resumes() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = SnapshotStore::open(temp_dir.path())?;

        let workspace = store.open_workspace()?;
        fs::write(workspace.join("partial"), b"half transferred")?;

        let again = store.open_workspace()?;
        assert_eq!(workspace, again);
        assert_eq!(fs::read(again.join("partial"))?, b"half transferred");
        Ok(())
    }

    #[test]
    fn test_finalize_promotes_workspace_and_links_current() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = SnapshotStore::open(temp_dir.path())?;

        let workspace = store.open_workspace()?;
        fs::write(workspace.join("file.txt"), b"data")?;

        let stamp = store.finalize_at(ts(4, 12, 0, 0))?;
        assert_eq!(stamp, ts(4, 12, 0, 0));
        assert!(!store.workspace_path().exists());
        assert_eq!(fs::read(store.snapshot_path(stamp).join("file.txt"))?, b"data");

        let link = store.current_pointer_path();
        assert_eq!(
            fs::read_link(&link)?,
            PathBuf::from("backup-2024-05-04-12:00:00")
        );
        assert_eq!(fs::read(link.join("file.txt"))?, b"data");
        Ok(())
    }

    #[test]
    fn test_finalize_conflicts() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = SnapshotStore::open(temp_dir.path())?;

        // no workspace
        assert!(matches!(
            store.finalize_at(ts(4, 0, 0, 0)),
            Err(BackupError::Conflict(_))
        ));

        // timestamp already taken
        make_snapshot(&store, ts(4, 0, 0, 0));
        store.open_workspace()?;
        assert!(matches!(
            store.finalize_at(ts(4, 0, 0, 0)),
            Err(BackupError::Conflict(_))
        ));
        assert!(store.workspace_path().is_dir());
        Ok(())
    }

    #[test]
    fn test_refresh_after_deleting_latest() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = SnapshotStore::open(temp_dir.path())?;

        make_snapshot(&store, ts(1, 0, 0, 0));
        make_snapshot(&store, ts(2, 0, 0, 0));
        store.refresh_current_pointer()?;
        assert_eq!(
            fs::read_link(store.current_pointer_path())?,
            PathBuf::from(format_snapshot_name(ts(2, 0, 0, 0)))
        );

        store.delete(ts(2, 0, 0, 0))?;
        store.refresh_current_pointer()?;
        assert_eq!(
            fs::read_link(store.current_pointer_path())?,
            PathBuf::from(format_snapshot_name(ts(1, 0, 0, 0)))
        );

        store.delete(ts(1, 0, 0, 0))?;
        assert_eq!(store.refresh_current_pointer()?, None);
        assert!(fs::symlink_metadata(store.current_pointer_path()).is_err());
        Ok(())
    }

    #[test]
    fn test_refresh_is_idempotent() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = SnapshotStore::open(temp_dir.path())?;
        make_snapshot(&store, ts(1, 0, 0, 0));

        let first = store.refresh_current_pointer()?;
        let modified = fs::symlink_metadata(store.current_pointer_path())?.modified()?;
        let second = store.refresh_current_pointer()?;

        assert_eq!(first, second);
        assert_eq!(
            fs::symlink_metadata(store.current_pointer_path())?.modified()?,
            modified
        );
        Ok(())
    }

    #[test]
    fn test_delete_missing_snapshot() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = SnapshotStore::open(temp_dir.path())?;

        assert!(matches!(
            store.delete(ts(1, 0, 0, 0)),
            Err(BackupError::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_delete_removes_tree() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = SnapshotStore::open(temp_dir.path())?;
        make_snapshot(&store, ts(1, 0, 0, 0));
        fs::write(store.snapshot_path(ts(1, 0, 0, 0)).join("ROOT/etc"), b"x")?;

        store.delete(ts(1, 0, 0, 0))?;
        assert!(!store.snapshot_path(ts(1, 0, 0, 0)).exists());
        assert!(store.list_snapshots()?.is_empty());
        Ok(())
    }
}
