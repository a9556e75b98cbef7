//! Engine error types

use std::path::PathBuf;
use thiserror::Error;

use crate::oracle::{OracleError, OracleFailure};

/// Errors surfaced by the PRD session engine
#[derive(Debug, Error)]
pub enum PrdError {
    #[error("timed out waiting for store lock at {path}")]
    LockTimeout { path: PathBuf },

    #[error("failed to create lock directory {path}: {source}")]
    LockDirCreateFailed { path: PathBuf, source: std::io::Error },

    #[error("no active PRD session for chat {0}")]
    SessionNotFound(i64),

    #[error("story draft incomplete: missing {0}")]
    IncompleteDraft(&'static str),

    #[error("invalid role '{0}' (expected manager, planner, developer or qa)")]
    InvalidRole(String),

    #[error("invalid priority '{0}' (expected a positive integer)")]
    InvalidPriority(String),

    #[error("invalid quick form (expected 'title | description | role [priority]'): {0}")]
    InvalidQuickFormat(String),

    #[error("external service failure ({category}): {detail}")]
    ExternalService { category: OracleFailure, detail: String },

    #[error("apply blocked at score {score}: missing {missing:?}")]
    ApplyBlocked { score: u8, missing: Vec<String> },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<OracleError> for PrdError {
    fn from(e: OracleError) -> Self {
        PrdError::ExternalService {
            category: e.category,
            detail: e.detail,
        }
    }
}

impl PrdError {
    /// True for errors that leave the session at the same prompt
    ///
    /// These are user-input errors: the stage machine must not advance, and
    /// the reply re-asks the same question.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            PrdError::IncompleteDraft(_)
                | PrdError::InvalidRole(_)
                | PrdError::InvalidPriority(_)
                | PrdError::InvalidQuickFormat(_)
        )
    }
}
