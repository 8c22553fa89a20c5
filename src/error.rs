use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BatchError {
    /// Malformed or undersized batch, malformed identifiers or config values.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Operation invoked out of order (e.g. download before the job finished).
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("job {job_name} was not created: HTTP {status}{}", reason_suffix(.message))]
    Submission {
        job_name: String,
        status: u16,
        message: Option<String>,
    },

    #[error("job {job_name} was not stopped: HTTP {status}{}", reason_suffix(.message))]
    Cancellation {
        job_name: String,
        status: u16,
        message: Option<String>,
    },

    #[error("transfer of {key} failed: {message}")]
    Transfer { key: String, message: String },

    #[error("missing artifact {}: {hint}", path.display())]
    MissingArtifact { path: PathBuf, hint: String },

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("malformed identifier: {0}")]
    Format(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("auth failed for {service}: {message}")]
    AuthFailed { service: String, message: String },

    #[error("rate limited by {service}")]
    RateLimited { service: String },

    #[error("upstream error from {service}: {message}")]
    Upstream {
        service: String,
        message: String,
        status: Option<u16>,
    },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("polling cancelled after {0}ms")]
    Cancelled(u64),

    #[error("polling timed out after {0}ms")]
    Timeout(u64),
}

fn reason_suffix(message: &Option<String>) -> String {
    match message {
        Some(m) if !m.is_empty() => format!(" ({m})"),
        _ => String::new(),
    }
}

impl BatchError {
    /// Returns true for transient errors that may succeed if the caller
    /// repeats the same call. Nothing in this crate retries on its own.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Upstream { status, .. } => {
                // None = not from HTTP, don't guess
                status.is_some_and(|s| s >= 500)
            }
            // 429 and 5xx rejections are transient
            Self::Submission { status, .. } | Self::Cancellation { status, .. } => {
                *status == 429 || *status >= 500
            }
            Self::Request(_) => true,
            Self::Transfer { .. } => true,
            _ => false,
        }
    }

    /// Message safe to show to an end user. Does not leak upstream bodies,
    /// endpoints or job ARNs.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(msg) => format!("invalid batch: {msg}"),
            Self::Precondition(msg) => msg.clone(),
            Self::Submission { job_name, .. } => format!("could not create job {job_name}"),
            Self::Cancellation { job_name, .. } => format!("could not stop job {job_name}"),
            Self::Transfer { key, .. } => format!("could not transfer {key}"),
            Self::MissingArtifact { path, hint } => {
                format!("{} does not exist; {hint}", path.display())
            }
            Self::NotFound(_) => "batch job not found".to_string(),
            Self::Format(_) => "malformed job identifier".to_string(),
            Self::InvalidOperation(msg) => msg.clone(),
            Self::AuthFailed { service, .. } => format!("authentication failed for {service}"),
            Self::RateLimited { service } => {
                format!("rate limited by {service}, try again shortly")
            }
            Self::Upstream { service, .. } => format!("upstream error from {service}"),
            Self::Parse(_) => "failed to parse batch artifact".to_string(),
            Self::Request(_) => "request to batch service failed".to_string(),
            Self::Io(e) => format!("filesystem error: {e}"),
            Self::Config(msg) => format!("configuration error: {msg}"),
            Self::Cancelled(ms) => format!("polling cancelled after {ms}ms"),
            Self::Timeout(ms) => format!("polling timed out after {ms}ms"),
        }
    }
}
