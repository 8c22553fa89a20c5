use std::env;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::BatchError;

pub const DEFAULT_TIMEOUT_HOURS: u32 = 24;
pub const MAX_TIMEOUT_HOURS: u32 = 168;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 600;
pub const MAX_JOB_NAME_LEN: usize = 63;

/// Construction parameters for one batch job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Model identifier, e.g. `anthropic.claude-3-haiku-20240307-v1:0`.
    pub model_id: String,
    pub bucket: String,
    pub region: String,
    /// Names the submission file and tags the remote job.
    #[serde(default = "generate_job_name")]
    pub job_name: String,
    /// Service role the batch job runs as.
    pub role_arn: String,
    #[serde(default = "default_timeout_hours")]
    pub timeout_hours: u32,
    /// Where submission and result artifacts live locally.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_timeout_hours() -> u32 {
    DEFAULT_TIMEOUT_HOURS
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

/// Job names the service accepts. The name also becomes a file stem and an
/// object key, so path separators are ruled out here as well.
fn is_valid_job_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= MAX_JOB_NAME_LEN
        && first.is_ascii_alphanumeric()
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '+' | '.'))
}

/// `batch-inference-{millis in hex}`.
pub fn generate_job_name() -> String {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("batch-inference-{ts:x}")
}

impl BatchConfig {
    pub fn new(
        model_id: impl Into<String>,
        bucket: impl Into<String>,
        region: impl Into<String>,
        job_name: impl Into<String>,
        role_arn: impl Into<String>,
    ) -> Self {
        let job_name = job_name.into();
        Self {
            model_id: model_id.into(),
            bucket: bucket.into(),
            region: region.into(),
            job_name: if job_name.is_empty() {
                generate_job_name()
            } else {
                job_name
            },
            role_arn: role_arn.into(),
            timeout_hours: DEFAULT_TIMEOUT_HOURS,
            work_dir: default_work_dir(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
        }
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn with_timeout_hours(mut self, hours: u32) -> Self {
        self.timeout_hours = hours;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Read settings from the environment.
    pub fn from_env() -> Result<Self, BatchError> {
        let required = |name: &str| {
            env::var(name).map_err(|_| BatchError::Config(format!("{name} not set")))
        };

        let mut config = Self::new(
            required("BATCH_MODEL_ID")?,
            required("BATCH_BUCKET")?,
            required("AWS_REGION")?,
            env::var("BATCH_JOB_NAME").unwrap_or_default(),
            required("BATCH_ROLE_ARN")?,
        );

        if let Ok(v) = env::var("BATCH_TIMEOUT_HOURS") {
            config.timeout_hours = v
                .parse()
                .map_err(|e| BatchError::Config(format!("BATCH_TIMEOUT_HOURS={v}: {e}")))?;
        }
        if let Ok(v) = env::var("BATCH_WORK_DIR") {
            config.work_dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var("BATCH_POLL_INTERVAL_SECS") {
            config.poll_interval_secs = v
                .parse()
                .map_err(|e| BatchError::Config(format!("BATCH_POLL_INTERVAL_SECS={v}: {e}")))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load `.env` from the working directory if present, then read the
    /// environment.
    pub fn load() -> Result<Self, BatchError> {
        if dotenvy::dotenv().is_err() {
            tracing::debug!("no .env file loaded");
        }
        Self::from_env()
    }

    pub fn from_toml_str(text: &str) -> Result<Self, BatchError> {
        let config: Self =
            toml::from_str(text).map_err(|e| BatchError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, BatchError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| BatchError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), BatchError> {
        if self.model_id.trim().is_empty() {
            return Err(BatchError::Validation("model id is empty".into()));
        }
        if self.bucket.trim().is_empty() {
            return Err(BatchError::Validation("bucket is empty".into()));
        }
        if !self.role_arn.starts_with("arn:aws:iam::") || !self.role_arn.contains(":role/") {
            return Err(BatchError::Validation(format!(
                "invalid role ARN format: {}",
                self.role_arn
            )));
        }
        if !(DEFAULT_TIMEOUT_HOURS..=MAX_TIMEOUT_HOURS).contains(&self.timeout_hours) {
            return Err(BatchError::Validation(format!(
                "timeout must be {DEFAULT_TIMEOUT_HOURS}..={MAX_TIMEOUT_HOURS} hours, got {}",
                self.timeout_hours
            )));
        }
        if !is_valid_job_name(&self.job_name) {
            return Err(BatchError::Validation(format!(
                "invalid job name {:?}: up to {MAX_JOB_NAME_LEN} of [A-Za-z0-9+.-], starting alphanumeric",
                self.job_name
            )));
        }
        if self.poll_interval_secs == 0 {
            return Err(BatchError::Validation("poll interval must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROLE: &str = "arn:aws:iam::123456789012:role/BatchInferenceRole";

    fn valid() -> BatchConfig {
        BatchConfig::new("anthropic.claude-3-haiku-20240307-v1:0", "bucket", "us-east-1", "job", ROLE)
    }

    #[test]
    fn empty_job_name_is_generated() {
        let config = BatchConfig::new("m", "b", "us-east-1", "", ROLE);
        assert!(config.job_name.starts_with("batch-inference-"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_fills_defaults() {
        let config = BatchConfig::from_toml_str(
            r#"
            model_id = "anthropic.claude-3-haiku-20240307-v1:0"
            bucket = "my-bucket"
            region = "us-west-2"
            role_arn = "arn:aws:iam::123456789012:role/BatchInferenceRole"
            "#,
        )
        .unwrap();
        assert_eq!(config.timeout_hours, DEFAULT_TIMEOUT_HOURS);
        assert_eq!(config.poll_interval(), Duration::from_secs(600));
        assert_eq!(config.work_dir, PathBuf::from("."));
        assert!(config.job_name.starts_with("batch-inference-"));
    }

    #[test]
    fn toml_missing_field_is_config_error() {
        let err = BatchConfig::from_toml_str(r#"bucket = "b""#).unwrap_err();
        assert!(matches!(err, BatchError::Config(_)), "{err:?}");
    }

    #[test]
    fn validate_rejects_bad_values() {
        let bad_role = BatchConfig {
            role_arn: "arn:aws:iam::123:user/bob".into(),
            ..valid()
        };
        assert!(matches!(bad_role.validate(), Err(BatchError::Validation(_))));

        for hours in [0, 23, 169] {
            let config = valid().with_timeout_hours(hours);
            assert!(config.validate().is_err(), "{hours}h accepted");
        }
        assert!(valid().with_timeout_hours(MAX_TIMEOUT_HOURS).validate().is_ok());

        for name in ["a/b", "a\\b", "under_score", "-leading", "", "x".repeat(64).as_str()] {
            let config = BatchConfig {
                job_name: name.to_string(),
                ..valid()
            };
            assert!(config.validate().is_err(), "{name:?} accepted");
        }
        for name in ["nightly.v2", "run+1", "Batch-2024-06-01", "x".repeat(63).as_str()] {
            let config = BatchConfig {
                job_name: name.to_string(),
                ..valid()
            };
            assert!(config.validate().is_ok(), "{name:?} rejected");
        }

        let no_bucket = BatchConfig {
            bucket: " ".into(),
            ..valid()
        };
        assert!(no_bucket.validate().is_err());

        let no_poll = BatchConfig {
            poll_interval_secs: 0,
            ..valid()
        };
        assert!(no_poll.validate().is_err());
    }
}
