use serde_json::Value;

use deskmate_types::{ToolResult, ToolResults};

/// Renders results for the follow-up prompt, one block per call in execution order.
pub fn format_tool_results(results: &ToolResults) -> String {
    results
        .iter()
        .map(|(label, result)| format_entry(label, result))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn format_entry(label: &str, result: &ToolResult) -> String {
    if result.success {
        let data = result.data.as_ref().unwrap_or(&Value::Null);
        format!("[{label}] success:\n{data}")
    } else {
        let error = result.error.as_deref().unwrap_or("unknown error");
        format!("[{label}] error: {error}")
    }
}
