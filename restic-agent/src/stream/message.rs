//! Decoded restic progress events.
//!
//! Every line restic prints is turned into exactly one [`BackupMessage`]: JSON lines
//! carrying a `message_type` decode verbatim, everything else becomes free text.

use serde::{Deserialize, Serialize};

/// Substrings that mark a free-text line as an error
const ERROR_KEYWORDS: &[&str] = &["error", "fatal", "panic"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Status,
    Summary,
    Error,
    ExitError,
    VerboseStatus,
    Done,
    /// Free text that is not part of the JSON protocol
    #[default]
    Info,
    /// Any tag this build does not know about
    #[serde(other)]
    Other,
}

/// Nested `error` object of restic's non-fatal error messages
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub message: String,
}

/// One event from a restic run.
///
/// Field names follow restic's JSON output so lines deserialize directly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupMessage {
    pub message_type: MessageKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds_elapsed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent_done: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub during: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_files: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_done: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_done: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_new: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_changed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_unmodified: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dirs_new: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dirs_changed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dirs_unmodified: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_blobs: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree_blobs: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_added: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_added_packed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_files_processed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes_processed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_end: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,

    // Restore summaries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_restored: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_restored: Option<u64>,
}

impl BackupMessage {
    pub fn info(text: impl Into<String>) -> Self {
        Self {
            message_type: MessageKind::Info,
            message: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn error(code: i32, text: impl Into<String>) -> Self {
        Self {
            message_type: MessageKind::Error,
            code: Some(code),
            message: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn done() -> Self {
        Self {
            message_type: MessageKind::Done,
            ..Default::default()
        }
    }

    /// Whether this event ends a run
    pub fn is_terminal(&self) -> bool {
        match self.message_type {
            MessageKind::Summary | MessageKind::Done => true,
            MessageKind::Error | MessageKind::ExitError => self.code.is_some_and(|c| c != 0),
            _ => false,
        }
    }

    /// Whether this event reports a failure (terminal or not)
    pub fn is_error(&self) -> bool {
        matches!(
            self.message_type,
            MessageKind::Error | MessageKind::ExitError
        )
    }

    /// Human-readable text carried by the event, if any
    pub fn text(&self) -> Option<&str> {
        self.message
            .as_deref()
            .or_else(|| self.error.as_ref().map(|e| e.message.as_str()))
            .filter(|t| !t.is_empty())
    }

    /// Turn a surplus terminal event into plain information
    pub(crate) fn demote(&mut self) {
        self.message_type = MessageKind::Info;
    }
}

/// Decode one trimmed output line.
pub fn decode_line(line: &str) -> BackupMessage {
    if line.starts_with('{') {
        // `message_type` has no default, so objects without a string tag fall through
        if let Ok(message) = serde_json::from_str::<BackupMessage>(line) {
            return message;
        }
    }

    let lowered = line.to_lowercase();
    if ERROR_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        BackupMessage::error(0, line)
    } else {
        BackupMessage::info(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_status() {
        let msg = decode_line(
            r#"{"message_type":"status","seconds_elapsed":3,"percent_done":0.25,"total_files":8,"files_done":2,"total_bytes":4096,"bytes_done":1024,"current_files":["/a"]}"#,
        );
        assert_eq!(msg.message_type, MessageKind::Status);
        assert_eq!(msg.percent_done, Some(0.25));
        assert_eq!(msg.files_done, Some(2));
        assert!(!msg.is_terminal());
    }

    #[test]
    fn test_decode_summary_is_terminal() {
        let msg = decode_line(
            r#"{"message_type":"summary","files_new":3,"files_changed":0,"files_unmodified":1,"data_added":512,"total_duration":1.5,"snapshot_id":"4f2a9c1e"}"#,
        );
        assert_eq!(msg.message_type, MessageKind::Summary);
        assert_eq!(msg.snapshot_id.as_deref(), Some("4f2a9c1e"));
        assert!(msg.is_terminal());
    }

    #[test]
    fn test_exit_error_terminal_only_with_nonzero_code() {
        let fatal = decode_line(r#"{"message_type":"exit_error","code":1,"message":"Fatal: boom"}"#);
        assert!(fatal.is_terminal());
        assert_eq!(fatal.text(), Some("Fatal: boom"));

        let zero = decode_line(r#"{"message_type":"exit_error","code":0,"message":"meh"}"#);
        assert!(!zero.is_terminal());
    }

    #[test]
    fn test_nested_error_text() {
        let msg = decode_line(
            r#"{"message_type":"error","error":{"message":"open /x: permission denied"},"during":"archival","item":"/x"}"#,
        );
        assert_eq!(msg.message_type, MessageKind::Error);
        assert!(!msg.is_terminal());
        assert_eq!(msg.text(), Some("open /x: permission denied"));
        assert_eq!(msg.item.as_deref(), Some("/x"));
    }

    #[test]
    fn test_unknown_tag_is_other() {
        let msg = decode_line(r#"{"message_type":"something_new","message":"hi"}"#);
        assert_eq!(msg.message_type, MessageKind::Other);
    }

    #[test]
    fn test_free_text_lines() {
        let msg = decode_line("repository 1a2b opened (version 2)");
        assert_eq!(msg.message_type, MessageKind::Info);
        assert_eq!(msg.text(), Some("repository 1a2b opened (version 2)"));

        let locked = decode_line("FATAL: repository locked");
        assert_eq!(locked.message_type, MessageKind::Error);
        assert_eq!(locked.code, Some(0));
        assert!(!locked.is_terminal());
    }

    #[test]
    fn test_json_without_string_tag_is_text() {
        assert_eq!(decode_line(r#"{"foo":1}"#).message_type, MessageKind::Info);
        assert_eq!(
            decode_line(r#"{"message_type":7}"#).message_type,
            MessageKind::Info
        );
        assert_eq!(decode_line("{not json").message_type, MessageKind::Info);
    }

    #[test]
    fn test_demote_clears_terminal() {
        let mut msg = BackupMessage::done();
        assert!(msg.is_terminal());
        msg.demote();
        assert!(!msg.is_terminal());
    }
}
