//! Consumer-side view of how a run ended.

use super::message::{BackupMessage, MessageKind};
use crate::classify::{classify, ResticError};

/// Non-terminal error and free-text lines kept for classification
const MAX_DIAGNOSTICS: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Succeeded {
        last: BackupMessage,
        snapshot_id: Option<String>,
    },
    Failed {
        message: String,
        diagnostics: Vec<String>,
        last: Option<BackupMessage>,
    },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded { .. })
    }

    pub fn snapshot_id(&self) -> Option<&str> {
        match self {
            RunOutcome::Succeeded { snapshot_id, .. } => snapshot_id.as_deref(),
            RunOutcome::Failed { .. } => None,
        }
    }

    /// Classified failure cause, `None` on success.
    ///
    /// Classification sees every diagnostic line followed by the terminal message.
    pub fn error(&self) -> Option<ResticError> {
        match self {
            RunOutcome::Succeeded { .. } => None,
            RunOutcome::Failed {
                message,
                diagnostics,
                ..
            } => {
                let mut raw = diagnostics.join("\n");
                if !raw.is_empty() {
                    raw.push('\n');
                }
                raw.push_str(message);
                Some(classify(&raw))
            }
        }
    }
}

/// Folds a run's events into a [`RunOutcome`]
#[derive(Debug, Default)]
pub struct OutcomeTracker {
    diagnostics: Vec<String>,
    snapshot_id: Option<String>,
    outcome: Option<RunOutcome>,
}

impl OutcomeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, msg: &BackupMessage) {
        if self.outcome.is_some() {
            return;
        }

        if let Some(id) = &msg.snapshot_id {
            self.snapshot_id = Some(id.clone());
        }

        if msg.is_terminal() {
            self.outcome = Some(if msg.is_error() {
                RunOutcome::Failed {
                    message: msg.text().unwrap_or("restic failed").to_string(),
                    diagnostics: std::mem::take(&mut self.diagnostics),
                    last: Some(msg.clone()),
                }
            } else {
                RunOutcome::Succeeded {
                    last: msg.clone(),
                    snapshot_id: self.snapshot_id.clone(),
                }
            });
            return;
        }

        let keep = msg.is_error() || msg.message_type == MessageKind::Info;
        if keep && self.diagnostics.len() < MAX_DIAGNOSTICS {
            if let Some(text) = msg.text() {
                self.diagnostics.push(text.to_string());
            }
        }
    }

    /// Outcome once the event channel has closed
    pub fn finish(self) -> RunOutcome {
        self.outcome.unwrap_or(RunOutcome::Failed {
            message: "run ended without a result".to_string(),
            diagnostics: self.diagnostics,
            last: None,
        })
    }
}
