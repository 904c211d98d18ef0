use std::io;
use std::process::ExitStatus;
use std::time::Duration;

/// Custom error type for webhook_runner operations
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Failed parsing template {template}: {message}")]
    Compile { template: String, message: String },

    #[error("Template render failed: {0}")]
    Render(String),

    #[error("Executable {program} {message}")]
    ExecutableNotFound { program: String, message: String },

    #[error("Command {command:?} timed out after {timeout:?}")]
    Timeout {
        command: Vec<String>,
        timeout: Duration,
    },

    #[error("Command {command:?} failed: {status}")]
    ProcessFailed {
        command: Vec<String>,
        status: ExitStatus,
    },

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid webhook payload: {0}")]
    InvalidPayload(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

impl From<handlebars::RenderError> for RunnerError {
    fn from(err: handlebars::RenderError) -> Self {
        RunnerError::Render(err.to_string())
    }
}

/// Helper type for Results that use RunnerError
pub type Result<T> = std::result::Result<T, RunnerError>;
