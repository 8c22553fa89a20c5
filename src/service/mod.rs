pub mod bedrock;

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::error::BatchError;

/// HTTP status the service answers accepted create/stop requests with.
pub const SUCCESS_STATUS: u16 = 200;

/// Tag key linking a remote job back to its local job name.
pub const JOB_TAG_KEY: &str = "bedrock_batch_inference";

/// Remote batch-job management. Implementations only move bytes; the
/// lifecycle rules live in `BatchJob`.
pub trait JobService: Send + Sync {
    /// Submit a job. Returns the HTTP status and, on success, the job ARN.
    /// Transport failures are errors; rejections are reported via the status.
    fn create_job(
        &self,
        req: &CreateJobRequest,
    ) -> impl Future<Output = Result<CreateJobResponse, BatchError>> + Send;

    /// Fetch job metadata. Unknown identifiers fail with `NotFound`.
    fn get_job(
        &self,
        job_arn: &str,
    ) -> impl Future<Output = Result<JobDescription, BatchError>> + Send;

    /// Ask the service to stop a job. Rejections are reported via the status.
    fn stop_job(
        &self,
        job_arn: &str,
    ) -> impl Future<Output = Result<StopJobResponse, BatchError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    pub job_name: String,
    pub role_arn: String,
    pub client_request_token: String,
    pub model_id: String,
    pub input_data_config: InputDataConfig,
    pub output_data_config: OutputDataConfig,
    pub timeout_duration_in_hours: u32,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputDataConfig {
    pub s3_input_data_config: S3InputDataConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3InputDataConfig {
    #[serde(default = "jsonl_format")]
    pub s3_input_format: String,
    pub s3_uri: String,
}

fn jsonl_format() -> String {
    "JSONL".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputDataConfig {
    pub s3_output_data_config: S3OutputDataConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3OutputDataConfig {
    pub s3_uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateJobResponse {
    pub status: u16,
    pub job_arn: Option<String>,
    /// Service-supplied reason when the request was rejected.
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopJobResponse {
    pub status: u16,
    pub message: Option<String>,
}

/// Job metadata as returned by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescription {
    pub job_arn: String,
    pub job_name: String,
    pub model_id: String,
    pub role_arn: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub input_data_config: InputDataConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_data_config: Option<OutputDataConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_duration_in_hours: Option<u32>,
}

impl JobDescription {
    /// Bucket name taken from the input URI (`s3://bucket/input/...`).
    pub fn bucket(&self) -> Result<&str, BatchError> {
        let uri = &self.input_data_config.s3_input_data_config.s3_uri;
        uri.strip_prefix("s3://")
            .and_then(|rest| rest.split('/').next())
            .filter(|b| !b.is_empty())
            .ok_or_else(|| BatchError::Format(format!("input location {uri} has no bucket")))
    }
}

/// Remote job ARNs look like `arn:aws:bedrock:{region}:{account}:model-invocation-job/{id}`.
pub fn check_job_arn(job_arn: &str) -> Result<(), BatchError> {
    let well_formed = job_arn.starts_with("arn:aws:bedrock:")
        && job_arn
            .rsplit_once('/')
            .is_some_and(|(_, suffix)| !suffix.is_empty());
    if well_formed {
        Ok(())
    } else {
        Err(BatchError::Format(format!("not a batch job ARN: {job_arn}")))
    }
}

/// Idempotency token for a job name. The service only accepts
/// `[a-zA-Z0-9](-*[a-zA-Z0-9])*`, so `.` and `+` become `-` and trailing
/// dashes are dropped.
pub fn client_request_token(job_name: &str) -> String {
    let token: String = job_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    token.trim_matches('-').to_string()
}
