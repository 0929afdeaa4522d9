//! Utility modules for the restic agent.

pub mod errors;
pub mod logger;

pub use errors::{AgentError, Result};
