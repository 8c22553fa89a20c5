use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::BatchError;

/// The batch service rejects submissions smaller than this.
pub const MIN_BATCH_SIZE: usize = 100;

pub const DEFAULT_ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";
pub const DEFAULT_MAX_TOKENS: u32 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One conversation turn. `content` is either a plain string or a list of
/// content blocks, passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: serde_json::Value,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: serde_json::Value::String(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: serde_json::Value::String(text.into()),
        }
    }
}

/// A callable tool the model may invoke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// How the model may use the tools it is given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolChoice {
    Auto,
    Any,
    /// Forced: the model must call exactly this tool.
    Tool { name: String },
}

/// Per-record model invocation settings (Anthropic messages format).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInput {
    pub messages: Vec<Message>,
    #[serde(default = "default_anthropic_version")]
    pub anthropic_version: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
}

fn default_anthropic_version() -> String {
    DEFAULT_ANTHROPIC_VERSION.to_string()
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

impl ModelInput {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            anthropic_version: default_anthropic_version(),
            max_tokens: DEFAULT_MAX_TOKENS,
            system: None,
            stop_sequences: None,
            temperature: None,
            top_p: None,
            top_k: None,
            tools: None,
            tool_choice: None,
        }
    }

    /// Shorthand for a single user turn.
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self::new(vec![Message::user(prompt)])
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_top_k(mut self, top_k: u32) -> Self {
        self.top_k = Some(top_k);
        self
    }

    /// Check the invariants the service would otherwise reject the whole
    /// batch for.
    pub fn validate(&self) -> Result<(), BatchError> {
        if self.messages.is_empty() {
            return Err(BatchError::Validation("request has no messages".into()));
        }
        if self.max_tokens == 0 {
            return Err(BatchError::Validation("max_tokens must be positive".into()));
        }
        if let Some(ToolChoice::Tool { name }) = &self.tool_choice {
            let declared = self
                .tools
                .as_deref()
                .unwrap_or_default()
                .iter()
                .any(|t| &t.name == name);
            if !declared {
                return Err(BatchError::Validation(format!(
                    "tool_choice names {name} but no such tool is declared"
                )));
            }
        }
        Ok(())
    }
}

/// One line of the submission artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRecord {
    pub record_id: String,
    pub model_input: ModelInput,
}

/// Turn caller inputs into an ordered batch, preserving iteration order.
///
/// Fails before any I/O when the batch is too small, an id repeats, or a
/// request is malformed.
pub fn prepare_batch<I, K>(inputs: I) -> Result<Vec<BatchRecord>, BatchError>
where
    I: IntoIterator<Item = (K, ModelInput)>,
    K: Into<String>,
{
    let records: Vec<BatchRecord> = inputs
        .into_iter()
        .map(|(id, model_input)| BatchRecord {
            record_id: id.into(),
            model_input,
        })
        .collect();

    if records.len() < MIN_BATCH_SIZE {
        return Err(BatchError::Validation(format!(
            "minimum batch size is {MIN_BATCH_SIZE}, {} given",
            records.len()
        )));
    }

    let mut seen = HashSet::with_capacity(records.len());
    for record in &records {
        if record.record_id.is_empty() {
            return Err(BatchError::Validation("empty record id".into()));
        }
        if !seen.insert(record.record_id.as_str()) {
            return Err(BatchError::Validation(format!(
                "duplicate record id {}",
                record.record_id
            )));
        }
        record.model_input.validate().map_err(|e| match e {
            BatchError::Validation(msg) => {
                BatchError::Validation(format!("record {}: {msg}", record.record_id))
            }
            other => other,
        })?;
    }

    Ok(records)
}

/// Serialize records as JSON Lines, one object per line.
pub fn to_jsonl<T: Serialize>(records: &[T]) -> Result<String, BatchError> {
    let mut out = String::new();
    for record in records {
        let line = serde_json::to_string(record)
            .map_err(|e| BatchError::Parse(format!("serialize record: {e}")))?;
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

/// Parse JSON Lines text. Blank lines are skipped.
pub fn read_jsonl<T: serde::de::DeserializeOwned>(text: &str) -> Result<Vec<T>, BatchError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line.trim())
                .map_err(|e| BatchError::Parse(format!("line {}: {e}", i + 1)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn batch(n: usize) -> Vec<(String, ModelInput)> {
        (0..n).map(|i| (format!("r{i}"), ModelInput::from_prompt("hi"))).collect()
    }

    #[test]
    fn model_input_serializes_messages_format() {
        let input = ModelInput::from_prompt("hello")
            .with_system("be brief")
            .with_max_tokens(512);
        let value = serde_json::to_value(&input).unwrap();
        assert_eq!(
            value,
            json!({
                "messages": [{"role": "user", "content": "hello"}],
                "anthropic_version": "bedrock-2023-05-31",
                "max_tokens": 512,
                "system": "be brief"
            })
        );
    }

    #[test]
    fn forced_tool_choice_wire_shape() {
        let choice = ToolChoice::Tool { name: "PersonInfo".into() };
        assert_eq!(
            serde_json::to_value(&choice).unwrap(),
            json!({"type": "tool", "name": "PersonInfo"})
        );
        assert_eq!(serde_json::to_value(ToolChoice::Auto).unwrap(), json!({"type": "auto"}));
    }

    #[test]
    fn record_uses_camel_case_keys() {
        let record = BatchRecord {
            record_id: "001".into(),
            model_input: ModelInput::from_prompt("x"),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["recordId"], "001");
        assert!(value.get("modelInput").is_some());
    }

    #[test]
    fn validate_rejects_empty_messages_and_zero_tokens() {
        assert!(ModelInput::new(vec![]).validate().is_err());
        assert!(ModelInput::from_prompt("x").with_max_tokens(0).validate().is_err());
    }

    #[test]
    fn prepare_batch_boundaries() {
        assert!(prepare_batch(batch(99)).is_err());
        assert_eq!(prepare_batch(batch(100)).unwrap().len(), 100);

        let mut with_empty = batch(100);
        with_empty[10].0 = String::new();
        assert!(matches!(prepare_batch(with_empty), Err(BatchError::Validation(_))));
    }

    #[test]
    fn invalid_record_is_named_in_error() {
        let mut inputs = batch(100);
        inputs[42].1.messages.clear();
        let Err(BatchError::Validation(msg)) = prepare_batch(inputs) else {
            panic!("expected validation error");
        };
        assert!(msg.contains("r42"), "{msg}");
    }

    #[test]
    fn jsonl_skips_blank_lines_and_reports_line_numbers() {
        let text = "{\"a\":1}\n\n{\"a\":2}\n";
        let values: Vec<serde_json::Value> = read_jsonl(text).unwrap();
        assert_eq!(values.len(), 2);

        let err = read_jsonl::<serde_json::Value>("{\"a\":1}\nnot json\n").unwrap_err();
        assert!(matches!(err, BatchError::Parse(ref m) if m.starts_with("line 2")), "{err:?}");

        let records = prepare_batch(batch(100)).unwrap();
        let text = to_jsonl(&records).unwrap();
        assert_eq!(text.lines().count(), 100);
        assert!(text.ends_with('\n'));
    }
}
