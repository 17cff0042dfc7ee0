use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("CONFIG_MISSING: {0}")]
    ConfigMissing(String),
    #[error("FETCH_FAILED: {0}")]
    FetchFailed(String),
    #[error("TIMEOUT: {0}")]
    Timeout(String),
    #[error("RESOURCE_UNAVAILABLE: {0}")]
    ResourceUnavailable(String),
    #[error("TASK_FAULTED: {0}")]
    TaskFaulted(String),
    #[error("CLI_INVALID: {0}")]
    Cli(String),
    #[error("POLICY_DENIED: {0}")]
    Policy(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigMissing(_) => "CONFIG_MISSING",
            Self::FetchFailed(_) => "FETCH_FAILED",
            Self::Timeout(_) => "TIMEOUT",
            Self::ResourceUnavailable(_) => "RESOURCE_UNAVAILABLE",
            Self::TaskFaulted(_) => "TASK_FAULTED",
            Self::Cli(_) => "CLI_INVALID",
            Self::Policy(_) => "POLICY_DENIED",
            Self::Io(_) => "IO_FAILURE",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Internal(_) => "INTERNAL",
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
