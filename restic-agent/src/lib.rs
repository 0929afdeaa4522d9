//! Restic Agent Library
//!
//! Drives the restic backup tool as a subprocess: builds its command lines,
//! streams its JSON progress protocol as typed events, classifies its failures
//! and runs its short query commands.

pub mod classify;
pub mod client;
pub mod command;
pub mod config;
pub mod pool;
pub mod stream;
pub mod utils;

// Re-export commonly used types
pub use classify::ResticError;
pub use client::Restic;
pub use config::{ResticSettings, SharedSettings};
pub use stream::{BackupMessage, MessageKind, RunHandle, RunOutcome};
pub use utils::errors::AgentError;
pub use utils::Result;
