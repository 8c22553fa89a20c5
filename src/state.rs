//! The batch job state machine.
//!
//! Transitions are pure: `JobState::apply` takes the current state and an
//! event and returns the next state, so the lifecycle can be tested without
//! any remote service.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::BatchError;

/// Local view of a batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Constructed, no remote job yet.
    Unsubmitted,
    /// Remote job exists and has not reached a terminal status.
    Running,
    Completed,
    Failed,
    Stopped,
    Expired,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Stopped | Self::Expired
        )
    }

    /// Advance the machine. Terminal states absorb remote observations;
    /// only an accepted stop request can overwrite them.
    pub fn apply(self, event: &JobEvent) -> Result<JobState, BatchError> {
        match (self, event) {
            (Self::Unsubmitted, JobEvent::Created) => Ok(Self::Running),
            (_, JobEvent::Created) => Err(BatchError::Precondition(format!(
                "job already submitted (state {self})"
            ))),
            (Self::Unsubmitted, JobEvent::Observed(_) | JobEvent::StopAccepted) => {
                Err(BatchError::Precondition(
                    "job has not been submitted".to_string(),
                ))
            }
            (state, JobEvent::Observed(_)) if state.is_terminal() => Ok(state),
            (_, JobEvent::Observed(remote)) => Ok(remote.local_state()),
            (_, JobEvent::StopAccepted) => Ok(Self::Stopped),
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unsubmitted => "Unsubmitted",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Stopped => "Stopped",
            Self::Expired => "Expired",
        };
        f.write_str(s)
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    /// The service accepted the create request.
    Created,
    /// A status string was read back from the service.
    Observed(RemoteStatus),
    /// The service accepted a stop request.
    StopAccepted,
}

/// Status vocabulary reported by the batch service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    Submitted,
    Validating,
    Scheduled,
    InProgress,
    Stopping,
    Completed,
    PartiallyCompleted,
    Failed,
    Stopped,
    Expired,
    /// Anything the service adds later. Treated as not yet terminal.
    Other(String),
}

impl RemoteStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "Submitted" => Self::Submitted,
            "Validating" => Self::Validating,
            "Scheduled" => Self::Scheduled,
            "InProgress" => Self::InProgress,
            "Stopping" => Self::Stopping,
            "Completed" => Self::Completed,
            "PartiallyCompleted" => Self::PartiallyCompleted,
            "Failed" => Self::Failed,
            "Stopped" => Self::Stopped,
            "Expired" => Self::Expired,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Submitted => "Submitted",
            Self::Validating => "Validating",
            Self::Scheduled => "Scheduled",
            Self::InProgress => "InProgress",
            Self::Stopping => "Stopping",
            Self::Completed => "Completed",
            Self::PartiallyCompleted => "PartiallyCompleted",
            Self::Failed => "Failed",
            Self::Stopped => "Stopped",
            Self::Expired => "Expired",
            Self::Other(s) => s,
        }
    }

    /// Fold the remote vocabulary onto the local five states.
    /// Partially completed jobs still write both artifacts, so they count
    /// as completed; the manifest carries the error count.
    pub fn local_state(&self) -> JobState {
        match self {
            Self::Completed | Self::PartiallyCompleted => JobState::Completed,
            Self::Failed => JobState::Failed,
            Self::Stopped => JobState::Stopped,
            Self::Expired => JobState::Expired,
            Self::Submitted
            | Self::Validating
            | Self::Scheduled
            | Self::InProgress
            | Self::Stopping
            | Self::Other(_) => JobState::Running,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

/// Identity and cached status of one remote job, plus the names of the
/// artifacts that belong to it.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub job_name: String,
    job_arn: Option<String>,
    state: JobState,
    /// Local copy of the submission artifact.
    pub submission_path: PathBuf,
    /// Object key of the uploaded submission.
    pub input_key: String,
    pub output_path: PathBuf,
    pub manifest_path: PathBuf,
}

impl JobHandle {
    pub fn new(job_name: &str, work_dir: &std::path::Path) -> Self {
        Self {
            job_name: job_name.to_string(),
            job_arn: None,
            state: JobState::Unsubmitted,
            submission_path: work_dir.join(format!("{job_name}.jsonl")),
            input_key: format!("input/{job_name}.jsonl"),
            output_path: work_dir.join(format!("{job_name}_out.jsonl")),
            manifest_path: work_dir.join(format!("{job_name}_manifest.jsonl")),
        }
    }

    pub fn job_arn(&self) -> Option<&str> {
        self.job_arn.as_deref()
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Record the remote identifier. Set once, by creation or recovery.
    pub(crate) fn assign_arn(&mut self, job_arn: String) -> Result<(), BatchError> {
        if let Some(existing) = &self.job_arn {
            return Err(BatchError::Precondition(format!(
                "job {} already has identifier {existing}",
                self.job_name
            )));
        }
        self.job_arn = Some(job_arn);
        Ok(())
    }

    pub(crate) fn transition(&mut self, event: &JobEvent) -> Result<JobState, BatchError> {
        self.state = self.state.apply(event)?;
        Ok(self.state)
    }

    /// Recovery only: adopt whatever the service reports without walking
    /// through `Created`.
    pub(crate) fn restore(&mut self, job_arn: String, remote: &RemoteStatus) -> Result<(), BatchError> {
        self.assign_arn(job_arn)?;
        self.state = remote.local_state();
        Ok(())
    }

    /// Last `/` segment of the job ARN. The service writes outputs under it.
    pub fn job_suffix(&self) -> Result<&str, BatchError> {
        let arn = self.job_arn.as_deref().ok_or_else(|| {
            BatchError::Precondition(format!("job {} has no identifier yet", self.job_name))
        })?;
        arn.rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| BatchError::Format(arn.to_string()))
    }

    pub fn output_key(&self) -> Result<String, BatchError> {
        Ok(format!("output/{}/{}.jsonl.out", self.job_suffix()?, self.job_name))
    }

    pub fn manifest_key(&self) -> Result<String, BatchError> {
        Ok(format!("output/{}/manifest.json.out", self.job_suffix()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_moves_unsubmitted_to_running() {
        assert_eq!(
            JobState::Unsubmitted.apply(&JobEvent::Created).unwrap(),
            JobState::Running
        );
        assert!(JobState::Running.apply(&JobEvent::Created).is_err());
    }

    #[test]
    fn observations_before_submission_are_rejected() {
        let err = JobState::Unsubmitted
            .apply(&JobEvent::Observed(RemoteStatus::InProgress))
            .unwrap_err();
        assert!(matches!(err, BatchError::Precondition(_)));
    }

    #[test]
    fn non_terminal_remote_statuses_keep_running() {
        for s in ["Submitted", "Validating", "Scheduled", "InProgress", "Stopping", "Paused"] {
            let next = JobState::Running
                .apply(&JobEvent::Observed(RemoteStatus::parse(s)))
                .unwrap();
            assert_eq!(next, JobState::Running, "{s}");
        }
    }

    #[test]
    fn terminal_remote_statuses_map_onto_local_states() {
        let cases = [
            ("Completed", JobState::Completed),
            ("PartiallyCompleted", JobState::Completed),
            ("Failed", JobState::Failed),
            ("Stopped", JobState::Stopped),
            ("Expired", JobState::Expired),
        ];
        for (s, expected) in cases {
            let next = JobState::Running
                .apply(&JobEvent::Observed(RemoteStatus::parse(s)))
                .unwrap();
            assert_eq!(next, expected);
            assert!(next.is_terminal());
        }
    }

    #[test]
    fn terminal_state_absorbs_later_observations() {
        let next = JobState::Failed
            .apply(&JobEvent::Observed(RemoteStatus::Completed))
            .unwrap();
        assert_eq!(next, JobState::Failed);
    }

    #[test]
    fn stop_overrides_terminal_state() {
        assert_eq!(
            JobState::Completed.apply(&JobEvent::StopAccepted).unwrap(),
            JobState::Stopped
        );
    }

    #[test]
    fn unknown_status_round_trips_text() {
        let s = RemoteStatus::parse("Paused");
        assert!(!s.is_known());
        assert_eq!(s.as_str(), "Paused");
    }

    #[test]
    fn handle_derives_artifact_names() {
        let mut handle = JobHandle::new("nightly", std::path::Path::new("/tmp/work"));
        assert_eq!(handle.input_key, "input/nightly.jsonl");
        assert_eq!(handle.submission_path, PathBuf::from("/tmp/work/nightly.jsonl"));
        assert!(handle.output_key().is_err());

        handle
            .assign_arn("arn:aws:bedrock:us-east-1:123:model-invocation-job/abc123".into())
            .unwrap();
        assert_eq!(handle.job_suffix().unwrap(), "abc123");
        assert_eq!(handle.output_key().unwrap(), "output/abc123/nightly.jsonl.out");
        assert_eq!(handle.manifest_key().unwrap(), "output/abc123/manifest.json.out");
        assert!(handle.assign_arn("arn:other".into()).is_err());
    }
}
