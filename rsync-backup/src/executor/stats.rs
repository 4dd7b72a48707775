//! Changed-file statistics of a finalized snapshot.
//!
//! Files with a single hard link were written by the last transfer; unchanged
//! files are hard links into the previous snapshot.

use super::command::{CommandSpec, LineSink};
use crate::utils::format::format_size;
use std::path::Path;
use tracing::info;

/// Files above this size are logged individually
const LARGE_FILE_BYTES: u64 = 100 * 1024 * 1024;

/// `find` invocation listing single-link files as `<size> <path>`
pub fn find_changed_files_command(snapshot: &Path) -> CommandSpec {
    CommandSpec::new(vec![
        "/usr/bin/find".to_string(),
        snapshot.to_string_lossy().into_owned(),
        "-type".to_string(),
        "f".to_string(),
        "-links".to_string(),
        "1".to_string(),
        "-printf".to_string(),
        "%s %p\n".to_string(),
    ])
}

/// Sums up `find -printf "%s %p\n"` output
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FindOutputConsumer {
    pub total_count: u64,
    pub total_size: u64,
}

impl LineSink for FindOutputConsumer {
    fn line(&mut self, line: &str) {
        let Some((size, path)) = line.split_once(' ') else {
            return;
        };
        let Ok(size) = size.parse::<u64>() else {
            return;
        };

        self.total_count += 1;
        self.total_size += size;

        if size > LARGE_FILE_BYTES {
            info!("Changed file with {}: {}", format_size(size), path);
        }
    }
}
