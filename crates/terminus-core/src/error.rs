//! Error types for the Terminus core

use terminus_types::error_code;
use thiserror::Error;

/// Main error type for the terminal subsystem.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid path: {0}")]
    Path(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("PTY error: {0}")]
    Pty(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Execution deadline exceeded after {0} ms")]
    ExecutionTimeout(u64),

    #[error("Session not found: {0}")]
    SessionNotFound(i64),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Wire error code carried by `error` frames for this kind.
    pub fn wire_code(&self) -> &'static str {
        match self {
            Error::Path(_) => error_code::PATH_ERROR,
            Error::Workspace(_) | Error::Io(_) => error_code::WORKSPACE_ERROR,
            Error::Pty(_) => error_code::PTY_ERROR,
            Error::Execution(_) => error_code::EXECUTION_ERROR,
            Error::ExecutionTimeout(_) => error_code::EXECUTION_TIMEOUT,
            Error::SessionNotFound(_) => error_code::SESSION_NOT_FOUND,
            Error::Auth(_) => error_code::AUTH_FAILED,
            Error::Store(_) | Error::Json(_) | Error::Internal(_) => error_code::INTERNAL_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_match_taxonomy() {
        assert_eq!(Error::Path("..".into()).wire_code(), "PATH_ERROR");
        assert_eq!(Error::Workspace("disk".into()).wire_code(), "WORKSPACE_ERROR");
        assert_eq!(Error::Pty("spawn".into()).wire_code(), "PTY_ERROR");
        assert_eq!(Error::ExecutionTimeout(10_000).wire_code(), "EXECUTION_TIMEOUT");
        assert_eq!(Error::SessionNotFound(7).wire_code(), "SESSION_NOT_FOUND");
    }
}
