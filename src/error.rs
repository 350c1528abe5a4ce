use thiserror::Error;

/// Error code constants for type-safe error handling
pub mod code {
    pub const CLI_ERROR: &str = "CLI_ERROR";
    pub const NOTFOUND: &str = "NOTFOUND";
    pub const INVALID: &str = "INVALID";
    pub const CONFLICT: &str = "CONFLICT";
    pub const DEPENDENCY: &str = "DEPENDENCY";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const INTERNAL: &str = "INTERNAL";
}

#[derive(Error, Debug)]
pub enum SwarmError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("SQLx error: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Worker error: {0}")]
    WorkerError(String),

    #[error("Task error: {0}")]
    TaskError(String),

    #[error("Stage error: {0}")]
    StageError(String),

    #[error("Git error: {0}")]
    GitError(String),

    #[error("Collaborator error: {0}")]
    CollaboratorError(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SwarmError {
    /// Returns the protocol error code for this error
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::ConfigError(_) | Self::SerializationError(_) => code::INVALID,
            Self::DatabaseError(_) | Self::SqlxError(_) | Self::Internal(_) => code::INTERNAL,
            Self::WorkerError(_) | Self::StageError(_) | Self::GitError(_) => code::CONFLICT,
            Self::TaskError(_) => code::NOTFOUND,
            Self::CollaboratorError(_) | Self::IoError(_) => code::DEPENDENCY,
            Self::Timeout(_) => code::TIMEOUT,
        }
    }

    /// Returns the exit code for this error
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::ConfigError(_) => 2,
            Self::DatabaseError(_) | Self::SqlxError(_) => 3,
            Self::WorkerError(_) => 4,
            Self::TaskError(_) => 5,
            Self::StageError(_) | Self::Timeout(_) => 6,
            Self::IoError(_) | Self::CollaboratorError(_) | Self::GitError(_) => 7,
            Self::SerializationError(_) => 8,
            Self::Internal(_) => 9,
        }
    }
}

/// Protocol error codes as documented in the CLI
pub const ERROR_CODES: &[(&str, &str, &str)] = &[
    (
        code::CLI_ERROR,
        "Invalid CLI usage",
        "Run 'swarm --help' for valid options",
    ),
    (
        code::NOTFOUND,
        "Resource was not found",
        "Run 'swarm status' and verify the task key",
    ),
    (
        code::INVALID,
        "Invalid configuration or payload",
        "Check .swarm/config.toml and the imported task file",
    ),
    (
        code::CONFLICT,
        "Conflicting state transition",
        "Run 'swarm status' to inspect current task and worker state",
    ),
    (
        code::DEPENDENCY,
        "External collaborator failed",
        "Inspect the configured stage and check commands",
    ),
    (
        code::TIMEOUT,
        "Operation timed out",
        "Increase the relevant timeout and retry",
    ),
    (
        code::INTERNAL,
        "Unexpected internal failure",
        "Inspect logs and retry command",
    ),
];

/// Get error code details (description and fix) for a given error code
#[must_use]
pub fn get_error_info(error_code: &str) -> Option<(&'static str, &'static str)> {
    ERROR_CODES
        .iter()
        .find(|(code, _, _)| *code == error_code)
        .map(|(_, desc, fix)| (*desc, *fix))
}

pub type Result<T> = std::result::Result<T, SwarmError>;

#[cfg(test)]
mod tests {
    use super::{get_error_info, code, SwarmError};

    #[test]
    fn config_errors_map_to_invalid_and_exit_two() {
        let err = SwarmError::ConfigError("bad".to_string());
        assert_eq!(err.code(), code::INVALID);
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn every_code_has_documented_fix() {
        for error_code in [
            code::CLI_ERROR,
            code::NOTFOUND,
            code::INVALID,
            code::CONFLICT,
            code::DEPENDENCY,
            code::TIMEOUT,
            code::INTERNAL,
        ] {
            assert!(get_error_info(error_code).is_some(), "{error_code} undocumented");
        }
    }
}
