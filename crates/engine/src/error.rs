//! Engine-level error type returned across the host-facing API.

use thiserror::Error;

use taleweaver_domain::TabId;

use crate::config::ConfigError;
use crate::persistence::PersistenceError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("Input is disabled while a turn is in progress")]
    InputDisabled,

    #[error("Empty input")]
    EmptyInput,

    #[error("Unknown tab: {0}")]
    UnknownTab(TabId),

    #[error("Pipeline cancelled")]
    Cancelled,

    #[error("Pipeline failure: {0}")]
    Pipeline(String),
}

impl EngineError {
    /// CLI exit code mapping: 0 normal, 2 configuration, 3 persistence,
    /// 4 unrecoverable pipeline failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Config(_) => 2,
            EngineError::Persistence(_) => 3,
            _ => 4,
        }
    }
}
