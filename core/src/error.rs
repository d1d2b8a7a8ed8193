//! Core error types and utilities

use thiserror::Error;

/// Core-specific error types
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Initialization error: {0}")]
    InitializationError(String),

    #[error("Service error: {0}")]
    ServiceError(String),

    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Unknown job '{job}' for service '{service}'")]
    UnknownJob { service: String, job: String },

    #[error("Process spawn failed: {0}")]
    ProcessSpawn(String),

    #[error("Process wait failed: {0}")]
    ProcessWait(String),

    #[error("Process signal failed: {0}")]
    ProcessSignal(String),

    #[error("Invalid pattern: {0}")]
    PatternError(#[from] regex::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl CoreError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::ConfigurationError(_) => "CORE001",
            CoreError::ValidationError(_) => "CORE002",
            CoreError::InitializationError(_) => "CORE003",
            CoreError::ServiceError(_) => "CORE004",
            CoreError::IoError(_) => "CORE005",
            CoreError::UnknownService(_) => "CORE007",
            CoreError::UnknownJob { .. } => "CORE008",
            CoreError::ProcessSpawn(_) => "CORE009",
            CoreError::ProcessWait(_) => "CORE010",
            CoreError::ProcessSignal(_) => "CORE011",
            CoreError::PatternError(_) => "CORE012",
        }
    }
}

/// Core-specific result type
pub type Result<T> = std::result::Result<T, CoreError>;
