//! Custom error types for the restic agent.

use crate::classify::ResticError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("restic executable not found at {0}")]
    BinaryNotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error(transparent)]
    Restic(#[from] ResticError),
}

impl From<config::ConfigError> for AgentError {
    fn from(e: config::ConfigError) -> Self {
        AgentError::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for AgentError {
    fn from(e: toml::ser::Error) -> Self {
        AgentError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
