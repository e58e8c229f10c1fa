use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// A tool invocation in its executable form: canonical name plus an object of parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }
}

/// Tool call reported through the model's own function-calling channel.
/// `arguments` is whatever the model sent: an object, or a JSON-encoded string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

pub fn result_label(ordinal: usize, tool_name: &str) -> String {
    format!("tool_{ordinal}_{tool_name}")
}

/// Results of one tool sequence, keyed by `tool_{ordinal}_{name}` in execution order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ToolResults {
    entries: IndexMap<String, ToolResult>,
}

impl ToolResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, ordinal: usize, tool_name: &str, result: ToolResult) -> String {
        let label = result_label(ordinal, tool_name);
        self.entries.insert(label.clone(), result);
        label
    }

    pub fn get(&self, label: &str) -> Option<&ToolResult> {
        self.entries.get(label)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ToolResult)> {
        self.entries.iter()
    }

    pub fn labels(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn failed_count(&self) -> usize {
        self.entries.values().filter(|r| !r.success).count()
    }
}
