//! Interval keep strategy: exponentially widening retention buckets.
//!
//! Works like storeBackup's `keepRelative`: a policy `b0 b1 .. bn` defines
//! buckets `[b0,b1) [b1,b2) ..` measured as age relative to now, and the
//! strategy keeps enough snapshots that every bucket stays covered as time
//! moves on.
//!
//! Tie-breaks and the drift offset below decide which directories get
//! removed for good, so the walk is deliberately literal.

use super::KeepStrategy;
use crate::utils::errors::{BackupError, Result};
use chrono::{Duration, NaiveDateTime};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, enabled, info, warn, Level};

/// Days counted per month in interval tokens
const DAYS_PER_MONTH: i64 = 30;

/// Parse one interval token such as `12h`, `1w3d` or `2m`.
///
/// Units must appear in the order months (`m`), weeks (`w`), days (`d`),
/// hours (`h`), each at most once.
pub fn parse_interval(token: &str) -> Result<Duration> {
    const UNITS: [char; 4] = ['m', 'w', 'd', 'h'];

    let invalid = || BackupError::InvalidPolicy(format!("invalid interval '{}'", token));

    let mut total = Duration::zero();
    let mut next_unit = 0;
    let mut digits = String::new();

    for c in token.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }

        let rank = UNITS[next_unit..]
            .iter()
            .position(|u| *u == c)
            .map(|p| p + next_unit)
            .ok_or_else(invalid)?;
        if digits.is_empty() {
            return Err(invalid());
        }

        let value: i64 = digits.parse().map_err(|_| invalid())?;
        let part = match UNITS[rank] {
            'm' => Duration::try_days(value.checked_mul(DAYS_PER_MONTH).ok_or_else(invalid)?),
            'w' => Duration::try_weeks(value),
            'd' => Duration::try_days(value),
            _ => Duration::try_hours(value),
        }
        .ok_or_else(invalid)?;

        total = total.checked_add(&part).ok_or_else(invalid)?;
        digits.clear();
        next_unit = rank + 1;
    }

    if !digits.is_empty() || next_unit == 0 {
        return Err(invalid());
    }

    Ok(total)
}

/// Render a duration as `2w3d4h` (with `min`/`s` when not whole hours)
pub fn format_interval(duration: Duration) -> String {
    let sign = if duration < Duration::zero() { "-" } else { "" };
    let secs = duration.num_seconds().unsigned_abs();

    let parts = [
        (secs / 604_800, "w"),
        ((secs % 604_800) / 86_400, "d"),
        ((secs % 86_400) / 3600, "h"),
        ((secs % 3600) / 60, "min"),
        (secs % 60, "s"),
    ];

    let body: String = parts
        .iter()
        .filter(|(value, _)| *value > 0)
        .map(|(value, unit)| format!("{}{}", value, unit))
        .collect();

    if body.is_empty() {
        "0h".to_string()
    } else {
        format!("{}{}", sign, body)
    }
}

/// Keep strategy driven by an ordered list of bucket boundaries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalKeepStrategy {
    intervals: Vec<Duration>,
}

impl IntervalKeepStrategy {
    /// Parse a whitespace separated interval list, e.g. `"1h 2h 1d 7d"`
    pub fn parse(list: &str) -> Result<Self> {
        let intervals = list
            .split_whitespace()
            .map(parse_interval)
            .collect::<Result<Vec<_>>>()?;
        Self::new(intervals).map_err(|e| match e {
            BackupError::InvalidPolicy(msg) => {
                BackupError::InvalidPolicy(format!("{} ({})", msg, list.trim()))
            }
            other => other,
        })
    }

    /// Build from explicit boundaries; they must not decrease
    pub fn new(intervals: Vec<Duration>) -> Result<Self> {
        if intervals.is_empty() {
            return Err(BackupError::InvalidPolicy("no intervals given".to_string()));
        }
        if let Some(pair) = intervals.windows(2).find(|pair| pair[1] < pair[0]) {
            return Err(BackupError::InvalidPolicy(format!(
                "intervals must be in order: {} after {}",
                format_interval(pair[1]),
                format_interval(pair[0])
            )));
        }
        Ok(Self { intervals })
    }

    pub fn intervals(&self) -> &[Duration] {
        &self.intervals
    }

    /// Compute the kept snapshots together with the reasons for keeping each
    pub fn evaluate(
        &self,
        now: NaiveDateTime,
        available: &[NaiveDateTime],
    ) -> BTreeMap<NaiveDateTime, String> {
        let mut keep = BTreeMap::new();

        // newest first
        let mut backups = available.to_vec();
        backups.sort_unstable_by(|a, b| b.cmp(a));
        backups.dedup();

        match backups.len() {
            0 => {
                debug!("No backups available");
                return keep;
            }
            1 => {
                debug!("Keeping the only available backup");
                mark(&mut keep, backups[0], "most recent");
                return keep;
            }
            _ => {}
        }

        // The next run time is unknown, so the newest snapshot always stays.
        mark(&mut keep, backups[0], "most recent");

        let age = |backup: NaiveDateTime| now - backup;
        let last = backups.len() - 1;
        let mut offset = Duration::zero();

        for pair in self.intervals.windows(2) {
            let (from, to) = (pair[0], pair[1]);
            let bucket = format!("{}-{}", format_interval(from), format_interval(to));
            debug!("Examining period {}", bucket);

            // Oldest-ward scan for the first snapshot old enough for this bucket.
            let mut index = backups.len();
            for (i, &backup) in backups.iter().enumerate() {
                let backup_age = age(backup);
                if backup_age >= from + offset {
                    if backup_age >= to + offset {
                        offset = backup_age - to;
                        info!(
                            "  no backup for period {}, choosing next older backup {} with age {} instead",
                            bucket,
                            backup,
                            format_interval(backup_age)
                        );
                        info!(
                            "    using an offset of {} for all older backups",
                            format_interval(offset)
                        );
                        mark(&mut keep, backup, &format!("{} (nearest older)", bucket));
                    } else {
                        debug!("  backup for period {} found: {}", bucket, backup);
                        mark(&mut keep, backup, &format!("{} (exact match)", bucket));
                    }
                    index = i;
                    break;
                } else if i == last {
                    info!(
                        "  no backup for period {}, choosing oldest backup {} with age {} instead",
                        bucket,
                        backup,
                        format_interval(backup_age)
                    );
                    mark(&mut keep, backup, &format!("{} (oldest possible)", bucket));
                }
            }

            let mut backup = backups[index.min(last)];
            debug!("  period {} is satisfied by backup {}", bucket, backup);

            // Newest-ward sweep: the kept snapshot leaves the bucket after
            // `expires`; the next newer one enters it after `remaining`. Keep
            // intermediates wherever the kept one would run out first.
            let mut i = index;
            let mut kept = backup;
            let mut expires = to - age(kept);
            debug!("  backup {} will leave period in {}", kept, format_interval(expires));

            while i > 0 {
                let prev = backup;
                i -= 1;
                backup = backups[i];

                let remaining = from - age(backup);

                if expires < Duration::zero() {
                    mark(&mut keep, backup, &format!("{} (candidate)", bucket));
                    kept = backup;
                    expires = to - age(kept);
                    info!(
                        "  Has already left period. Keeping {}. Will leave period in {}",
                        backup,
                        format_interval(expires)
                    );
                } else if expires <= remaining {
                    info!(
                        "  backup {} will enter period in {} - this is too late, trying to keep intermediate backup",
                        backup,
                        format_interval(remaining)
                    );

                    if kept == prev {
                        warn!(
                            "  There will be no backup for period {} in {}. This is usually caused by backups not being done regularly enough",
                            bucket,
                            format_interval(expires)
                        );
                        mark(&mut keep, backup, &format!("{} (candidate)", bucket));
                        kept = backup;
                    } else {
                        mark(&mut keep, prev, &format!("{} (candidate)", bucket));
                        kept = prev;
                    }
                    expires = to - age(kept);
                    debug!("  Marking {}. Will leave period in {}", kept, format_interval(expires));
                } else {
                    debug!(
                        "  backup {} will enter period in {} - no need to keep intermediate backup",
                        backup,
                        format_interval(remaining)
                    );
                }
            }
        }

        if enabled!(Level::DEBUG) {
            for backup in &backups {
                match keep.get(backup) {
                    Some(reason) => debug!(
                        "backup {}: [age {}] {}",
                        backup,
                        format_interval(age(*backup)),
                        reason
                    ),
                    None => debug!("backup {}: DELETE", backup),
                }
            }
        }

        keep
    }
}

impl KeepStrategy for IntervalKeepStrategy {
    fn backups_to_keep(
        &self,
        now: NaiveDateTime,
        available: &[NaiveDateTime],
    ) -> BTreeSet<NaiveDateTime> {
        self.evaluate(now, available).into_keys().collect()
    }
}

fn mark(keep: &mut BTreeMap<NaiveDateTime, String>, backup: NaiveDateTime, reason: &str) {
    keep.entry(backup)
        .and_modify(|existing| {
            existing.push_str(" | ");
            existing.push_str(reason);
        })
        .or_insert_with(|| reason.to_string());
}
