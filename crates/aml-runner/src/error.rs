use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by the client. None of these are retried locally.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("workspace resolution failed: {0}")]
    Workspace(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("compute provisioning failed for '{name}': {message}")]
    Provisioning { name: String, message: String },

    #[error("timed out after {}s waiting for {operation}", waited.as_secs())]
    Timeout {
        operation: String,
        waited: Duration,
    },

    #[error("schema mismatch ({context}): missing columns [{}]", missing.join(", "))]
    SchemaMismatch {
        context: String,
        missing: Vec<String>,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("job submission rejected: {0}")]
    SubmissionRejected(String),

    #[error("run {run_id} ended in state {status}: {message}")]
    RunFailed {
        run_id: String,
        status: String,
        message: String,
    },

    #[error("run {run_id} has not completed (state {status})")]
    RunNotComplete { run_id: String, status: String },

    #[error("platform returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn schema_mismatch(context: impl Into<String>, missing: Vec<String>) -> Self {
        Self::SchemaMismatch {
            context: context.into(),
            missing,
        }
    }

    /// Stable machine-readable code, used by the CLI's JSON error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Auth(_) => "auth_failed",
            Error::Workspace(_) => "workspace_unresolved",
            Error::NotFound { .. } => "not_found",
            Error::Provisioning { .. } => "provisioning_failed",
            Error::Timeout { .. } => "timeout",
            Error::SchemaMismatch { .. } => "schema_mismatch",
            Error::InvalidConfig(_) => "invalid_config",
            Error::SubmissionRejected(_) => "submission_rejected",
            Error::RunFailed { .. } => "run_failed",
            Error::RunNotComplete { .. } => "run_not_complete",
            Error::Api { .. } => "api_error",
            Error::Http(_) => "http_error",
            Error::Io(_) => "io_error",
            Error::Json(_) => "json_error",
            Error::Yaml(_) => "yaml_error",
        }
    }
}
