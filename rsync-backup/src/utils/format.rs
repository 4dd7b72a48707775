//! Human-readable sizes and durations for statistics log lines.

const SIZE_UNITS: &[&str] = &["bytes", "KB", "MB", "GB", "TB"];

/// Format a byte count in the largest unit that keeps the number at or below 10240.
pub fn format_size(bytes: u64) -> String {
    let mut size = bytes;
    let mut unit = 0;

    while size > 10240 && unit < SIZE_UNITS.len() - 1 {
        size /= 1024;
        unit += 1;
    }

    format!("{} {}", size, SIZE_UNITS[unit])
}

/// Format a duration as `1d 2h 3m 4s`, leaving out zero components.
pub fn format_duration(seconds: u64) -> String {
    let parts = [
        (seconds / 86_400, "d"),
        ((seconds % 86_400) / 3600, "h"),
        ((seconds % 3600) / 60, "m"),
        (seconds % 60, "s"),
    ];

    let rendered: Vec<String> = parts
        .iter()
        .filter(|(value, _)| *value > 0)
        .map(|(value, suffix)| format!("{}{}", value, suffix))
        .collect();

    if rendered.is_empty() {
        "0s".to_string()
    } else {
        rendered.join(" ")
    }
}
