use std::time::Duration;

use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;

use crate::config::BatchConfig;
use crate::error::BatchError;
use crate::service::{
    CreateJobRequest, CreateJobResponse, JobDescription, JobService, StopJobResponse,
};

const SERVICE: &str = "bedrock";

const MAX_RESPONSE_BYTES: usize = 1024 * 1024; // 1MB

/// Env var holding a Bedrock API key.
pub const API_KEY_ENV: &str = "AWS_BEARER_TOKEN_BEDROCK";

/// Bedrock control-plane client for model-invocation jobs.
pub struct BedrockJobService {
    client: Client,
    base_url: Url,
    api_key: String,
}

impl std::fmt::Debug for BedrockJobService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BedrockJobService")
            .field("base_url", &self.base_url.as_str())
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateJobBody {
    job_arn: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(alias = "Message")]
    message: String,
}

impl BedrockJobService {
    /// Client for the regional endpoint `https://bedrock.{region}.amazonaws.com`.
    pub fn new(region: &str, api_key: impl Into<String>) -> Result<Self, BatchError> {
        Self::with_base_url(&format!("https://bedrock.{region}.amazonaws.com"), api_key)
    }

    /// Client against an arbitrary endpoint (VPC endpoints, local mocks).
    pub fn with_base_url(base_url: &str, api_key: impl Into<String>) -> Result<Self, BatchError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| BatchError::Config(format!("invalid base url {base_url}: {e}")))?;
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self {
            client,
            base_url,
            api_key: api_key.into(),
        })
    }

    /// Client for the region the job is configured for.
    pub fn for_config(config: &BatchConfig, api_key: impl Into<String>) -> Result<Self, BatchError> {
        Self::new(&config.region, api_key)
    }

    pub fn from_env(region: &str) -> Result<Self, BatchError> {
        let key = std::env::var(API_KEY_ENV)
            .map_err(|_| BatchError::Config(format!("{API_KEY_ENV} not set")))?;
        Self::new(region, key)
    }

    /// `{base}/model-invocation-job[/{arn}][/{suffix}]`, with the ARN
    /// percent-encoded as a single segment.
    fn job_url(&self, job_arn: Option<&str>, suffix: Option<&str>) -> Result<Url, BatchError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| BatchError::Config(format!("base url {} cannot have a path", self.base_url)))?;
            segments.pop_if_empty().push("model-invocation-job");
            if let Some(arn) = job_arn {
                segments.push(arn);
            }
            if let Some(s) = suffix {
                segments.push(s);
            }
        }
        Ok(url)
    }

    /// Status handling for read calls, before any body is read. Writes
    /// report status instead.
    async fn error_for_status(
        response: reqwest::Response,
        job_arn: &str,
    ) -> Result<reqwest::Response, BatchError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(BatchError::NotFound(job_arn.to_string()));
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(BatchError::AuthFailed {
                service: SERVICE.to_string(),
                message: format!("{status}"),
            });
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(BatchError::RateLimited {
                service: SERVICE.to_string(),
            });
        }
        let text = Self::error_text(response).await;
        Err(BatchError::Upstream {
            service: SERVICE.to_string(),
            message: format!("{status}: {text}"),
            status: Some(status.as_u16()),
        })
    }

    /// Error body, capped at `MAX_RESPONSE_BYTES`.
    async fn error_text(response: reqwest::Response) -> String {
        let error_bytes = response.bytes().await.unwrap_or_default();
        let truncated = &error_bytes[..error_bytes.len().min(MAX_RESPONSE_BYTES)];
        String::from_utf8_lossy(truncated).into_owned()
    }

    /// The `message` of a JSON error body, or the trimmed text itself.
    async fn rejection_reason(response: reqwest::Response) -> Option<String> {
        let text = Self::error_text(response).await;
        let reason = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => body.message,
            Err(_) => text.trim().to_string(),
        };
        (!reason.is_empty()).then_some(reason)
    }

    async fn read_body(response: reqwest::Response) -> Result<Vec<u8>, BatchError> {
        let bytes = response.bytes().await.map_err(|e| BatchError::Upstream {
            service: SERVICE.to_string(),
            message: format!("failed to read response body: {e}"),
            status: None,
        })?;
        if bytes.len() > MAX_RESPONSE_BYTES {
            return Err(BatchError::Upstream {
                service: SERVICE.to_string(),
                message: format!("response too large: {} bytes", bytes.len()),
                status: None,
            });
        }
        Ok(bytes.to_vec())
    }
}

impl JobService for BedrockJobService {
    async fn create_job(&self, req: &CreateJobRequest) -> Result<CreateJobResponse, BatchError> {
        let url = self.job_url(None, None)?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(req)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = Self::rejection_reason(response).await;
            tracing::warn!(
                job_name = %req.job_name,
                status = status.as_u16(),
                reason = message.as_deref().unwrap_or(""),
                "create job rejected"
            );
            return Ok(CreateJobResponse {
                status: status.as_u16(),
                job_arn: None,
                message,
            });
        }

        let body = Self::read_body(response).await?;
        let parsed: CreateJobBody = serde_json::from_slice(&body)
            .map_err(|e| BatchError::Parse(format!("create job response: {e}")))?;
        Ok(CreateJobResponse {
            status: status.as_u16(),
            job_arn: Some(parsed.job_arn),
            message: None,
        })
    }

    async fn get_job(&self, job_arn: &str) -> Result<JobDescription, BatchError> {
        let url = self.job_url(Some(job_arn), None)?;
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        let response = Self::error_for_status(response, job_arn).await?;
        let body = Self::read_body(response).await?;

        serde_json::from_slice(&body).map_err(|e| BatchError::Parse(format!("get job response: {e}")))
    }

    async fn stop_job(&self, job_arn: &str) -> Result<StopJobResponse, BatchError> {
        let url = self.job_url(Some(job_arn), Some("stop"))?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        let status = response.status();
        let message = if status.is_success() {
            None
        } else {
            Self::rejection_reason(response).await
        };
        Ok(StopJobResponse {
            status: status.as_u16(),
            message,
        })
    }
}
