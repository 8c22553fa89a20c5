//! Structured lifecycle events.
//!
//! Every component reports through an injected `EventSink` instead of a
//! process-wide logger. `TracingSink` forwards to `tracing`; tests install a
//! `RecordingSink` and assert on what was emitted.

use std::sync::Mutex;
use std::time::Duration;

use crate::schema::Rejection;
use crate::state::JobState;

#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    RequestsPrepared {
        job_name: String,
        count: usize,
    },
    ToolForced {
        tool: String,
        count: usize,
    },
    SubmissionWritten {
        path: String,
        records: usize,
    },
    Uploaded {
        bucket: String,
        key: String,
        bytes: usize,
    },
    JobCreated {
        job_name: String,
        job_arn: String,
    },
    StatusChecked {
        job_arn: String,
        status: String,
    },
    /// Remote status outside the known vocabulary; treated as still running.
    UnmappedStatus {
        job_arn: String,
        status: String,
    },
    /// Terminal state served from cache, no remote call made.
    StatusCached {
        job_arn: String,
        state: JobState,
    },
    PollWaiting {
        job_arn: String,
        interval: Duration,
    },
    Downloaded {
        key: String,
        path: String,
    },
    ResultsLoaded {
        records: usize,
        errors: usize,
    },
    RecordRejected {
        record_id: String,
        reason: Rejection,
    },
    JobStopped {
        job_arn: String,
    },
    Recovered {
        job_arn: String,
        job_name: String,
        state: JobState,
    },
    OperationFailed {
        operation: &'static str,
        message: String,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: BatchEvent);
}

/// Default sink: one `tracing` record per event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: BatchEvent) {
        match event {
            BatchEvent::RequestsPrepared { job_name, count } => {
                tracing::info!(job_name = %job_name, count, "requests prepared");
            }
            BatchEvent::ToolForced { tool, count } => {
                tracing::info!(tool = %tool, count, "forced tool added to requests");
            }
            BatchEvent::SubmissionWritten { path, records } => {
                tracing::info!(path = %path, records, "submission written");
            }
            BatchEvent::Uploaded { bucket, key, bytes } => {
                tracing::info!(bucket = %bucket, key = %key, bytes, "submission uploaded");
            }
            BatchEvent::JobCreated { job_name, job_arn } => {
                tracing::info!(job_name = %job_name, job_arn = %job_arn, "batch job created");
            }
            BatchEvent::StatusChecked { job_arn, status } => {
                tracing::info!(job_arn = %job_arn, status = %status, "job status checked");
            }
            BatchEvent::UnmappedStatus { job_arn, status } => {
                tracing::warn!(job_arn = %job_arn, status = %status, "unrecognised job status, treating as running");
            }
            BatchEvent::StatusCached { job_arn, state } => {
                tracing::debug!(job_arn = %job_arn, state = %state, "job already terminal");
            }
            BatchEvent::PollWaiting { job_arn, interval } => {
                tracing::debug!(job_arn = %job_arn, interval_secs = interval.as_secs(), "job still running");
            }
            BatchEvent::Downloaded { key, path } => {
                tracing::info!(key = %key, path = %path, "artifact downloaded");
            }
            BatchEvent::ResultsLoaded { records, errors } => {
                tracing::info!(records, errors, "results loaded");
            }
            BatchEvent::RecordRejected { record_id, reason } => {
                tracing::warn!(record_id = %record_id, reason = %reason, "record failed validation");
            }
            BatchEvent::JobStopped { job_arn } => {
                tracing::info!(job_arn = %job_arn, "batch job stopped");
            }
            BatchEvent::Recovered {
                job_arn,
                job_name,
                state,
            } => {
                tracing::info!(job_arn = %job_arn, job_name = %job_name, state = %state, "batch job recovered");
            }
            BatchEvent::OperationFailed { operation, message } => {
                tracing::error!(operation, "{message}");
            }
        }
    }
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<BatchEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BatchEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count(&self, pred: impl Fn(&BatchEvent) -> bool) -> usize {
        self.events
            .lock()
            .map(|e| e.iter().filter(|ev| pred(ev)).count())
            .unwrap_or(0)
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: BatchEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
