use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::BatchError;
use crate::request::read_jsonl;

/// Execution statistics the service writes next to the outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub total_record_count: u64,
    pub processed_record_count: u64,
    pub success_record_count: u64,
    pub error_record_count: u64,
    #[serde(default)]
    pub input_token_count: Option<u64>,
    #[serde(default)]
    pub output_token_count: Option<u64>,
}

impl Manifest {
    /// Fraction of processed records that succeeded. 0.0 for an empty job.
    pub fn success_rate(&self) -> f64 {
        if self.processed_record_count == 0 {
            return 0.0;
        }
        self.success_record_count as f64 / self.processed_record_count as f64
    }
}

/// One line of the output artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawResult {
    pub record_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_output: Option<serde_json::Value>,
    /// Set by the service when the record itself failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchResults {
    pub records: Vec<RawResult>,
    pub manifest: Manifest,
}

impl BatchResults {
    /// Records the service marked as failed.
    pub fn errors(&self) -> impl Iterator<Item = &RawResult> {
        self.records.iter().filter(|r| r.error.is_some())
    }
}

const DOWNLOAD_HINT: &str = "download the results first";

/// Parse the downloaded output and manifest files.
///
/// Both files must exist. Reads only; calling it twice on the same files
/// gives the same answer.
pub async fn load_results(output_path: &Path, manifest_path: &Path) -> Result<BatchResults, BatchError> {
    for path in [output_path, manifest_path] {
        if !tokio::fs::try_exists(path).await? {
            return Err(BatchError::MissingArtifact {
                path: path.to_path_buf(),
                hint: DOWNLOAD_HINT.to_string(),
            });
        }
    }

    let output_text = tokio::fs::read_to_string(output_path).await?;
    let records: Vec<RawResult> = read_jsonl(&output_text)?;

    let manifest_text = tokio::fs::read_to_string(manifest_path).await?;
    // First JSON value in the file, whether or not it spans lines.
    let manifest = serde_json::Deserializer::from_str(&manifest_text)
        .into_iter::<Manifest>()
        .next()
        .ok_or_else(|| BatchError::Parse(format!("{} is empty", manifest_path.display())))?
        .map_err(|e| BatchError::Parse(format!("manifest: {e}")))?;

    Ok(BatchResults { records, manifest })
}
