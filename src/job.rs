//! The batch job controller.
//!
//! `BatchJob` owns one remote job from preparation to harvested results:
//!
//! prepare → upload → create → poll → download → load → validate
//!
//! Every step checks the local state first, so out-of-order calls fail with
//! `Precondition` before touching the network. A failed call leaves the
//! state untouched and can be repeated. Nothing is retried automatically.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::config::BatchConfig;
use crate::error::BatchError;
use crate::events::{BatchEvent, EventSink, TracingSink};
use crate::request::{BatchRecord, ModelInput, prepare_batch, read_jsonl, to_jsonl};
use crate::results::{self, BatchResults};
use crate::schema::{NoValidation, OutputValidator, ToolSchema, ValidatedRecord, force_tool};
use crate::service::{
    CreateJobRequest, CreateJobResponse, InputDataConfig, JOB_TAG_KEY, JobService,
    OutputDataConfig, S3InputDataConfig, S3OutputDataConfig, SUCCESS_STATUS, StopJobResponse, Tag,
    check_job_arn, client_request_token,
};
use crate::state::{JobEvent, JobHandle, JobState, RemoteStatus};
use crate::storage::{JSONL_CONTENT_TYPE, ObjectStore, write_local};

/// How `poll_until_complete` waits between status checks.
#[derive(Debug, Clone)]
pub struct PollOptions {
    pub interval: Duration,
    /// Give up with `Timeout` once the next wait would pass this instant.
    pub deadline: Option<Instant>,
    /// Checked between iterations; never interrupts an in-flight query.
    pub cancellation_token: Option<CancellationToken>,
}

impl PollOptions {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
            cancellation_token: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = Some(token);
        self
    }

    /// Poll at the configured interval, with no deadline.
    pub fn from_config(config: &BatchConfig) -> Self {
        Self::every(config.poll_interval())
    }
}

/// Controller for a single batch job, parameterized by how results are
/// validated. `NoValidation` gives plain mode; `ToolSchema<T>` gives
/// structured mode.
pub struct BatchJob<S, O, V = NoValidation> {
    config: BatchConfig,
    service: S,
    store: O,
    validator: V,
    handle: JobHandle,
    records: Vec<BatchRecord>,
    sink: Arc<dyn EventSink>,
}

impl<S, O, V> std::fmt::Debug for BatchJob<S, O, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchJob")
            .field("config", &self.config)
            .field("handle", &self.handle)
            .field("records", &self.records.len())
            .finish_non_exhaustive()
    }
}

impl<S: JobService, O: ObjectStore> BatchJob<S, O, NoValidation> {
    pub fn new(config: BatchConfig, service: S, store: O) -> Result<Self, BatchError> {
        Self::with_validator(config, service, store, NoValidation)
    }

    /// Rebuild a plain controller from a job ARN. The submission file
    /// `{work_dir}/{job_name}.jsonl` must still exist.
    pub async fn recover(
        job_arn: &str,
        service: S,
        store: O,
        work_dir: impl Into<PathBuf>,
    ) -> Result<Self, BatchError> {
        Self::recover_with(job_arn, service, store, work_dir.into(), NoValidation).await
    }
}

impl<S, O, T> BatchJob<S, O, ToolSchema<T>>
where
    S: JobService,
    O: ObjectStore,
    T: JsonSchema + DeserializeOwned,
{
    pub fn structured(
        config: BatchConfig,
        service: S,
        store: O,
        schema: ToolSchema<T>,
    ) -> Result<Self, BatchError> {
        Self::with_validator(config, service, store, schema)
    }

    /// Rebuild a structured controller. The service keeps no schema, so the
    /// caller has to supply it again.
    pub async fn recover_structured(
        job_arn: &str,
        service: S,
        store: O,
        work_dir: impl Into<PathBuf>,
        schema: Option<ToolSchema<T>>,
    ) -> Result<Self, BatchError> {
        let Some(schema) = schema else {
            return Err(BatchError::InvalidOperation(
                "cannot recover a structured job without its output schema".to_string(),
            ));
        };
        Self::recover_with(job_arn, service, store, work_dir.into(), schema).await
    }
}

impl<S, O, V> BatchJob<S, O, V>
where
    S: JobService,
    O: ObjectStore,
    V: OutputValidator,
{
    pub fn with_validator(
        config: BatchConfig,
        service: S,
        store: O,
        validator: V,
    ) -> Result<Self, BatchError> {
        config.validate()?;
        let handle = JobHandle::new(&config.job_name, &config.work_dir);
        Ok(Self {
            config,
            service,
            store,
            validator,
            handle,
            records: Vec::new(),
            sink: Arc::new(TracingSink),
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn handle(&self) -> &JobHandle {
        &self.handle
    }

    pub fn state(&self) -> JobState {
        self.handle.state()
    }

    pub fn job_arn(&self) -> Option<&str> {
        self.handle.job_arn()
    }

    pub fn records(&self) -> &[BatchRecord] {
        &self.records
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    /// `PollOptions` at this job's configured interval.
    pub fn poll_options(&self) -> PollOptions {
        PollOptions::from_config(&self.config)
    }

    pub fn is_structured(&self) -> bool {
        self.validator.forced_tool().is_some()
    }

    fn emit(&self, event: BatchEvent) {
        self.sink.emit(event);
    }

    fn fail(&self, operation: &'static str, err: BatchError) -> BatchError {
        self.emit(BatchEvent::OperationFailed {
            operation,
            message: err.to_string(),
        });
        err
    }

    fn require_arn(&self) -> Result<String, BatchError> {
        self.handle.job_arn().map(str::to_string).ok_or_else(|| {
            BatchError::Precondition(format!("job {} has not been submitted", self.config.job_name))
        })
    }

    /// Build the batch from caller inputs. In structured mode the forced
    /// tool is added to every request before the batch is checked.
    /// Returns the number of records.
    pub fn prepare_requests<I, K>(&mut self, inputs: I) -> Result<usize, BatchError>
    where
        I: IntoIterator<Item = (K, ModelInput)>,
        K: Into<String>,
    {
        if self.handle.state() != JobState::Unsubmitted {
            return Err(BatchError::Precondition(format!(
                "job {} is already submitted; its batch cannot change",
                self.config.job_name
            )));
        }

        let tool = self.validator.forced_tool();
        let inputs: Vec<(String, ModelInput)> = inputs
            .into_iter()
            .map(|(id, mut input)| {
                if let Some(tool) = tool {
                    force_tool(&mut input, tool);
                }
                (id.into(), input)
            })
            .collect();
        let count = inputs.len();

        let records = prepare_batch(inputs).map_err(|e| self.fail("prepare", e))?;

        if let Some(tool) = tool {
            self.emit(BatchEvent::ToolForced {
                tool: tool.name.clone(),
                count,
            });
        }
        self.emit(BatchEvent::RequestsPrepared {
            job_name: self.config.job_name.clone(),
            count,
        });
        self.records = records;
        Ok(count)
    }

    /// Write the submission artifact locally and upload it to
    /// `input/{job_name}.jsonl`.
    pub async fn upload(&mut self) -> Result<(), BatchError> {
        if self.records.is_empty() {
            return Err(BatchError::Precondition("there are no prepared requests".into()));
        }
        let key = self.handle.input_key.clone();
        let transfer_err = |message: String| BatchError::Transfer {
            key: key.clone(),
            message,
        };

        let body = to_jsonl(&self.records).map_err(|e| transfer_err(e.to_string()))?;
        write_local(&self.handle.submission_path, body.as_bytes())
            .await
            .map_err(|e| self.fail("upload", transfer_err(e.to_string())))?;
        self.emit(BatchEvent::SubmissionWritten {
            path: self.handle.submission_path.display().to_string(),
            records: self.records.len(),
        });

        let bytes = body.len();
        self.store
            .put_object(&self.config.bucket, &key, body.into_bytes(), JSONL_CONTENT_TYPE)
            .await
            .map_err(|e| self.fail("upload", e))?;
        self.emit(BatchEvent::Uploaded {
            bucket: self.config.bucket.clone(),
            key,
            bytes,
        });
        Ok(())
    }

    /// The request `create` sends.
    pub fn create_request(&self) -> CreateJobRequest {
        let bucket = &self.config.bucket;
        CreateJobRequest {
            job_name: self.config.job_name.clone(),
            role_arn: self.config.role_arn.clone(),
            // Same job name, same token: a duplicate submit is a no-op remotely
            client_request_token: client_request_token(&self.config.job_name),
            model_id: self.config.model_id.clone(),
            input_data_config: InputDataConfig {
                s3_input_data_config: S3InputDataConfig {
                    s3_input_format: "JSONL".to_string(),
                    s3_uri: format!("s3://{bucket}/{}", self.handle.input_key),
                },
            },
            output_data_config: OutputDataConfig {
                s3_output_data_config: S3OutputDataConfig {
                    s3_uri: format!("s3://{bucket}/output/"),
                },
            },
            timeout_duration_in_hours: self.config.timeout_hours,
            tags: vec![Tag {
                key: JOB_TAG_KEY.to_string(),
                value: self.config.job_name.clone(),
            }],
        }
    }

    /// Create the remote job. Returns the assigned ARN.
    pub async fn create(&mut self) -> Result<String, BatchError> {
        if self.records.is_empty() {
            return Err(BatchError::Precondition("there are no prepared requests".into()));
        }
        // Rejects a second create before any network call
        self.handle.state().apply(&JobEvent::Created)?;

        let request = self.create_request();
        match self.service.create_job(&request).await? {
            CreateJobResponse {
                status: SUCCESS_STATUS,
                job_arn: Some(job_arn),
                ..
            } => {
                self.handle.assign_arn(job_arn.clone())?;
                self.handle.transition(&JobEvent::Created)?;
                self.emit(BatchEvent::JobCreated {
                    job_name: self.config.job_name.clone(),
                    job_arn: job_arn.clone(),
                });
                Ok(job_arn)
            }
            CreateJobResponse {
                status, message, ..
            } => Err(self.fail(
                "create",
                BatchError::Submission {
                    job_name: self.config.job_name.clone(),
                    status,
                    message,
                },
            )),
        }
    }

    /// One status check. `Some(state)` once terminal, `None` while running.
    ///
    /// A terminal state is cached; later calls return it without asking the
    /// service again.
    pub async fn check_status(&mut self) -> Result<Option<JobState>, BatchError> {
        let job_arn = self.require_arn()?;
        let state = self.handle.state();
        if state.is_terminal() {
            self.emit(BatchEvent::StatusCached { job_arn, state });
            return Ok(Some(state));
        }

        let description = self.service.get_job(&job_arn).await?;
        let remote = RemoteStatus::parse(&description.status);
        self.emit(BatchEvent::StatusChecked {
            job_arn: job_arn.clone(),
            status: description.status.clone(),
        });
        if !remote.is_known() {
            self.emit(BatchEvent::UnmappedStatus {
                job_arn,
                status: description.status,
            });
        }

        let state = self.handle.transition(&JobEvent::Observed(remote))?;
        Ok(state.is_terminal().then_some(state))
    }

    /// Check, wait, repeat until the job is terminal. Errors from a status
    /// query end the loop immediately.
    pub async fn poll_until_complete(&mut self, opts: &PollOptions) -> Result<JobState, BatchError> {
        let start = Instant::now();
        let elapsed_ms = |start: Instant| start.elapsed().as_millis() as u64;

        loop {
            if opts
                .cancellation_token
                .as_ref()
                .is_some_and(CancellationToken::is_cancelled)
            {
                return Err(BatchError::Cancelled(elapsed_ms(start)));
            }

            if let Some(state) = self.check_status().await? {
                return Ok(state);
            }

            if let Some(deadline) = opts.deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining < opts.interval {
                    return Err(BatchError::Timeout(elapsed_ms(start)));
                }
            }

            self.emit(BatchEvent::PollWaiting {
                job_arn: self.require_arn()?,
                interval: opts.interval,
            });

            match &opts.cancellation_token {
                Some(token) => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            return Err(BatchError::Cancelled(elapsed_ms(start)));
                        }
                        _ = tokio::time::sleep(opts.interval) => {}
                    }
                }
                None => tokio::time::sleep(opts.interval).await,
            }
        }
    }

    /// Stop the remote job. On success the local state becomes `Stopped`
    /// whatever it was before; the status is not re-queried.
    ///
    /// Once a terminal state is cached the job is already over remotely and
    /// the service refuses to stop it, so no request is sent.
    pub async fn cancel(&mut self) -> Result<(), BatchError> {
        let job_arn = self.require_arn()?;
        if !self.handle.state().is_terminal() {
            let StopJobResponse { status, message } = self.service.stop_job(&job_arn).await?;
            if status != SUCCESS_STATUS {
                return Err(self.fail(
                    "cancel",
                    BatchError::Cancellation {
                        job_name: self.config.job_name.clone(),
                        status,
                        message,
                    },
                ));
            }
        }
        self.handle.transition(&JobEvent::StopAccepted)?;
        self.emit(BatchEvent::JobStopped { job_arn });
        Ok(())
    }

    /// Fetch the output and manifest artifacts into `work_dir`.
    pub async fn download(&mut self) -> Result<(), BatchError> {
        if self.check_status().await?.is_none() {
            return Err(BatchError::Precondition(format!(
                "job {} has not finished; results are not available yet",
                self.config.job_name
            )));
        }

        let downloads = [
            (self.handle.output_key()?, self.handle.output_path.clone()),
            (self.handle.manifest_key()?, self.handle.manifest_path.clone()),
        ];
        for (key, path) in downloads {
            let body = self
                .store
                .get_object(&self.config.bucket, &key)
                .await
                .map_err(|e| self.fail("download", e))?;
            write_local(&path, &body).await.map_err(|e| BatchError::Transfer {
                key: key.clone(),
                message: e.to_string(),
            })?;
            self.emit(BatchEvent::Downloaded {
                key,
                path: path.display().to_string(),
            });
        }
        Ok(())
    }

    /// Parse the downloaded artifacts.
    pub async fn load_results(&self) -> Result<BatchResults, BatchError> {
        let results =
            results::load_results(&self.handle.output_path, &self.handle.manifest_path).await?;
        self.emit(BatchEvent::ResultsLoaded {
            records: results.records.len(),
            errors: results.errors().count(),
        });
        Ok(results)
    }

    /// One entry per raw result, in order. Records that fail validation
    /// come back as `None`; this never fails as a whole.
    pub fn validate_results(&self, results: &BatchResults) -> Vec<ValidatedRecord<V::Output>> {
        results
            .records
            .iter()
            .map(|raw| ValidatedRecord {
                record_id: raw.record_id.clone(),
                output: match self.validator.validate(raw) {
                    Ok(value) => Some(value),
                    Err(reason) => {
                        self.emit(BatchEvent::RecordRejected {
                            record_id: raw.record_id.clone(),
                            reason,
                        });
                        None
                    }
                },
            })
            .collect()
    }

    /// prepare → upload → create → poll → download → load.
    pub async fn run<I, K>(&mut self, inputs: I, opts: &PollOptions) -> Result<BatchResults, BatchError>
    where
        I: IntoIterator<Item = (K, ModelInput)>,
        K: Into<String>,
    {
        self.prepare_requests(inputs)?;
        self.upload().await?;
        self.create().await?;
        self.poll_until_complete(opts).await?;
        self.download().await?;
        self.load_results().await
    }

    async fn recover_with(
        job_arn: &str,
        service: S,
        store: O,
        work_dir: PathBuf,
        validator: V,
    ) -> Result<Self, BatchError> {
        check_job_arn(job_arn)?;
        let region = job_arn
            .split(':')
            .nth(3)
            .filter(|r| !r.is_empty())
            .ok_or_else(|| BatchError::Format(format!("job ARN {job_arn} has no region")))?
            .to_string();

        let description = service.get_job(job_arn).await?;
        let bucket = description.bucket()?.to_string();

        let mut config = BatchConfig::new(
            description.model_id.clone(),
            bucket,
            region,
            description.job_name.clone(),
            description.role_arn.clone(),
        )
        .with_work_dir(work_dir);
        if let Some(hours) = description.timeout_duration_in_hours {
            config.timeout_hours = hours;
        }

        let submission_path = JobHandle::new(&config.job_name, &config.work_dir).submission_path;
        if !tokio::fs::try_exists(&submission_path).await? {
            return Err(BatchError::MissingArtifact {
                path: submission_path,
                hint: "recovery needs the original submission file".to_string(),
            });
        }
        let text = tokio::fs::read_to_string(&submission_path).await?;
        let records: Vec<BatchRecord> = read_jsonl(&text)?;

        let mut job = Self::with_validator(config, service, store, validator)?;
        let remote = RemoteStatus::parse(&description.status);
        if !remote.is_known() {
            job.emit(BatchEvent::UnmappedStatus {
                job_arn: job_arn.to_string(),
                status: description.status.clone(),
            });
        }
        job.handle.restore(job_arn.to_string(), &remote)?;
        job.records = records;
        job.emit(BatchEvent::Recovered {
            job_arn: job_arn.to_string(),
            job_name: job.config.job_name.clone(),
            state: job.handle.state(),
        });
        Ok(job)
    }
}
