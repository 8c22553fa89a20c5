//! Structured output via forced tool calls.
//!
//! A `ToolSchema<T>` turns a `JsonSchema` type into a single tool definition,
//! forces every request to call it, and later pulls the tool input back out
//! of each model response and deserializes it as `T`.

use std::fmt;
use std::marker::PhantomData;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;

use crate::request::{ModelInput, ToolChoice, ToolDefinition};
use crate::results::RawResult;

const DEFAULT_TOOL_DESCRIPTION: &str = "please fill in the schema";

/// The service only accepts `[A-Za-z0-9_-]{1,64}` as tool names.
const MAX_TOOL_NAME_LEN: usize = 64;

/// Why a record produced no validated value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The service recorded an error, or wrote no output, for this record.
    MissingOutput,
    /// The model stopped for some other reason than calling the tool.
    NotToolUse(Option<String>),
    /// More or fewer than one content block.
    BlockCount(usize),
    NotToolBlock(String),
    SchemaMismatch(String),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingOutput => f.write_str("no model output"),
            Self::NotToolUse(Some(reason)) => write!(f, "model did not use tool (stop_reason {reason})"),
            Self::NotToolUse(None) => f.write_str("model did not use tool (no stop_reason)"),
            Self::BlockCount(n) => write!(f, "expected exactly one content block, got {n}"),
            Self::NotToolBlock(kind) => write!(f, "content block is {kind}, not tool_use"),
            Self::SchemaMismatch(e) => write!(f, "tool input does not match schema: {e}"),
        }
    }
}

/// Strategy for turning a raw result into a typed value.
pub trait OutputValidator {
    type Output;

    /// Tool to force on every request, if this strategy needs one.
    fn forced_tool(&self) -> Option<&ToolDefinition>;

    fn validate(&self, result: &RawResult) -> Result<Self::Output, Rejection>;
}

/// Plain mode: no forced tool, the validated value is the raw model output.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoValidation;

impl OutputValidator for NoValidation {
    type Output = serde_json::Value;

    fn forced_tool(&self) -> Option<&ToolDefinition> {
        None
    }

    fn validate(&self, result: &RawResult) -> Result<Self::Output, Rejection> {
        result.model_output.clone().ok_or(Rejection::MissingOutput)
    }
}

/// A record id paired with its schema instance, or `None` if the record
/// did not conform.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRecord<T> {
    pub record_id: String,
    pub output: Option<T>,
}

/// Counts of validated and absent records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationSummary {
    pub validated: usize,
    pub absent: usize,
}

impl ValidationSummary {
    pub fn total(&self) -> usize {
        self.validated + self.absent
    }
}

pub fn validation_summary<T>(records: &[ValidatedRecord<T>]) -> ValidationSummary {
    let validated = records.iter().filter(|r| r.output.is_some()).count();
    ValidationSummary {
        validated,
        absent: records.len() - validated,
    }
}

pub struct ToolSchema<T> {
    tool: ToolDefinition,
    _marker: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for ToolSchema<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolSchema").field("tool", &self.tool).finish()
    }
}

impl<T> Clone for ToolSchema<T> {
    fn clone(&self) -> Self {
        Self {
            tool: self.tool.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: JsonSchema + DeserializeOwned> Default for ToolSchema<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: JsonSchema + DeserializeOwned> ToolSchema<T> {
    /// Name and description come from the schema's title and doc comment.
    pub fn new() -> Self {
        let schema = serde_json::to_value(schemars::schema_for!(T)).unwrap_or_default();
        let title = schema
            .get("title")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| T::schema_name().into_owned());
        let description = schema
            .get("description")
            .and_then(|v| v.as_str())
            .filter(|d| !d.trim().is_empty())
            .unwrap_or(DEFAULT_TOOL_DESCRIPTION)
            .to_string();
        Self::from_parts(&title, description, schema)
    }

    /// Override the derived tool name and description.
    pub fn named(name: &str, description: impl Into<String>) -> Self {
        let schema = serde_json::to_value(schemars::schema_for!(T)).unwrap_or_default();
        Self::from_parts(name, description.into(), schema)
    }

    fn from_parts(name: &str, description: String, input_schema: serde_json::Value) -> Self {
        Self {
            tool: ToolDefinition {
                name: sanitize_tool_name(name),
                description,
                input_schema,
            },
            _marker: PhantomData,
        }
    }
}

impl<T> ToolSchema<T> {
    pub fn tool(&self) -> &ToolDefinition {
        &self.tool
    }

    pub fn name(&self) -> &str {
        &self.tool.name
    }

    /// Add the tool to the request and force the model to call it. A
    /// caller tool of the same name is replaced.
    pub fn apply(&self, mut input: ModelInput) -> ModelInput {
        force_tool(&mut input, &self.tool);
        input
    }
}

impl<T: DeserializeOwned> OutputValidator for ToolSchema<T> {
    type Output = T;

    fn forced_tool(&self) -> Option<&ToolDefinition> {
        Some(&self.tool)
    }

    fn validate(&self, result: &RawResult) -> Result<T, Rejection> {
        let output = result.model_output.as_ref().ok_or(Rejection::MissingOutput)?;
        let input = extract_tool_input(output)?;
        serde_json::from_value(input.clone()).map_err(|e| Rejection::SchemaMismatch(e.to_string()))
    }
}

/// Add `tool`, replacing any tool of the same name, then force it.
pub fn force_tool(input: &mut ModelInput, tool: &ToolDefinition) {
    let tools = input.tools.get_or_insert_with(Vec::new);
    match tools.iter_mut().find(|t| t.name == tool.name) {
        Some(existing) => *existing = tool.clone(),
        None => tools.push(tool.clone()),
    }
    input.tool_choice = Some(ToolChoice::Tool {
        name: tool.name.clone(),
    });
}

/// Pull the single tool call's input out of a model response.
pub fn extract_tool_input(output: &serde_json::Value) -> Result<&serde_json::Value, Rejection> {
    let stop_reason = output.get("stop_reason").and_then(|v| v.as_str());
    if stop_reason != Some("tool_use") {
        return Err(Rejection::NotToolUse(stop_reason.map(str::to_string)));
    }

    let blocks = output
        .get("content")
        .and_then(|v| v.as_array())
        .map(Vec::as_slice)
        .unwrap_or_default();
    // Several calls are ambiguous; don't guess which one is the answer.
    let [block] = blocks else {
        return Err(Rejection::BlockCount(blocks.len()));
    };

    let kind = block.get("type").and_then(|v| v.as_str()).unwrap_or("untyped");
    if kind != "tool_use" {
        return Err(Rejection::NotToolBlock(kind.to_string()));
    }
    block
        .get("input")
        .ok_or_else(|| Rejection::SchemaMismatch("tool_use block has no input".into()))
}

/// Only alphanumerics, `-` and `_`, at most 64 chars.
pub fn sanitize_tool_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_TOOL_NAME_LEN)
        .collect();
    if cleaned.is_empty() {
        "output".to_string()
    } else {
        cleaned
    }
}
