pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod request;
pub mod results;
pub mod schema;
pub mod service;
pub mod state;
pub mod storage;

pub use config::BatchConfig;
pub use error::BatchError;
pub use job::{BatchJob, PollOptions};
pub use request::{BatchRecord, Message, ModelInput, ToolChoice, ToolDefinition};
pub use results::{BatchResults, Manifest, RawResult};
pub use schema::{NoValidation, OutputValidator, ToolSchema, ValidatedRecord, ValidationSummary};
pub use state::{JobHandle, JobState, RemoteStatus};
