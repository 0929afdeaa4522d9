//! Human-readable rendering of progress events.

use super::message::{BackupMessage, MessageKind};

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit = 0;

    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    format!("{:.2} {}", size, UNITS[unit])
}

/// Format a duration in whole seconds
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

/// One-line description of an event, `None` for events with nothing to show
pub fn describe(msg: &BackupMessage) -> Option<String> {
    match msg.message_type {
        MessageKind::Status => {
            let percent = msg.percent_done.unwrap_or(0.0) * 100.0;
            let mut line = format!("{percent:5.1}%");
            if let (Some(done), Some(total)) = (msg.bytes_done, msg.total_bytes) {
                line.push_str(&format!(" {} / {}", format_bytes(done), format_bytes(total)));
            }
            if let (Some(done), Some(total)) = (msg.files_done, msg.total_files) {
                line.push_str(&format!(", {done}/{total} files"));
            }
            if let Some(elapsed) = msg.seconds_elapsed {
                line.push_str(&format!(", {}", format_duration(elapsed)));
            }
            Some(line)
        }
        MessageKind::Summary => {
            let seconds = msg.total_duration.unwrap_or(0.0).round() as u64;
            if let Some(restored) = msg.files_restored {
                return Some(format!(
                    "Restored {} files ({}) in {}",
                    restored,
                    format_bytes(msg.bytes_restored.unwrap_or(0)),
                    format_duration(msg.seconds_elapsed.unwrap_or(seconds)),
                ));
            }
            Some(format!(
                "Snapshot {} saved: {} new, {} changed, {} unmodified files, {} added in {}",
                msg.snapshot_id.as_deref().unwrap_or("?"),
                msg.files_new.unwrap_or(0),
                msg.files_changed.unwrap_or(0),
                msg.files_unmodified.unwrap_or(0),
                format_bytes(msg.data_added.unwrap_or(0)),
                format_duration(seconds),
            ))
        }
        MessageKind::Done => Some("Done".to_string()),
        MessageKind::VerboseStatus => None,
        _ => msg.text().map(str::to_string),
    }
}
