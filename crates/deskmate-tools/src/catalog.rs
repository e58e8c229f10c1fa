use serde_json::{json, Map, Value};
use thiserror::Error;

use deskmate_types::{ToolCall, ToolSchema};

use crate::directive::{DIRECTIVE_CLOSE, DIRECTIVE_OPEN};
use crate::normalize::{DEFAULT_SEARCH_LIMIT, SEARCH_TOOL};

/// Tools advertised to the model, both in the system prompt and as native tool schemas.
pub fn tool_catalog() -> Vec<ToolSchema> {
    vec![
        ToolSchema {
            name: SEARCH_TOOL.to_string(),
            description: "Private Desk 全体（日報、ウィキ、ブログ）を横断検索する".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "検索キーワード"},
                    "limit": {"type": "number", "description": "最大件数（デフォルト: 5）"}
                },
                "required": ["query"]
            }),
        },
        ToolSchema {
            name: "read_diary".to_string(),
            description: "指定したIDの日報を読む".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "id": {"type": "number", "description": "日報ID"}
                },
                "required": ["id"]
            }),
        },
        ToolSchema {
            name: "write_diary".to_string(),
            description: "日報を新規作成する".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string", "description": "日報のタイトル"},
                    "content": {"type": "string", "description": "日報の本文"}
                },
                "required": ["title", "content"]
            }),
        },
        ToolSchema {
            name: "read_wiki".to_string(),
            description: "指定したIDのウィキページを読む".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "id": {"type": "number", "description": "ウィキページID"}
                },
                "required": ["id"]
            }),
        },
    ]
}

fn describe_tool(schema: &ToolSchema) -> String {
    let required = schema
        .input_schema
        .get("required")
        .and_then(|v| v.as_array())
        .map(|items| items.iter().filter_map(|v| v.as_str()).collect::<Vec<_>>())
        .unwrap_or_default();
    let params = schema
        .input_schema
        .get("properties")
        .and_then(|v| v.as_object())
        .map(|props| {
            props
                .iter()
                .map(|(key, prop)| {
                    let description = prop
                        .get("description")
                        .and_then(|v| v.as_str())
                        .unwrap_or("");
                    let marker = if required.contains(&key.as_str()) {
                        " (必須)"
                    } else {
                        ""
                    };
                    format!("  - {key}: {description}{marker}")
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();
    format!(
        "## {}\n説明: {}\nパラメータ:\n{}",
        schema.name, schema.description, params
    )
}

pub fn system_prompt(tools: &[ToolSchema]) -> String {
    let tool_section = tools
        .iter()
        .map(describe_tool)
        .collect::<Vec<_>>()
        .join("\n\n");
    format!(
        r#"あなたは Private Desk のアシスタントです。ユーザーの質問に答え、必要なときはツールで情報を取得します。

# 利用可能なツール

{tool_section}

# ツールの呼び出し方

ツールが必要なときは、次の形式で書いてください。複数のツールを呼ぶ場合はそれぞれを囲みます。

{open}
{{"name": "ツール名", "params": {{"key": "value"}}}}
{close}

例:

{open}
{{"name": "{search}", "params": {{"query": "プロジェクトの進捗", "limit": 3}}}}
{close}

# 注意

1. 呼び出しは必ず {open} と {close} で囲む
2. JSON は正確に書く
3. ツールが不要なら直接回答する
4. ツールの結果を受け取ったら、その内容をもとに回答する"#,
        open = DIRECTIVE_OPEN,
        close = DIRECTIVE_CLOSE,
        search = SEARCH_TOOL,
    )
}

/// Appended to tool results in the follow-up turn.
pub const FOLLOW_UP_INSTRUCTION: &str = "上記のツール結果をもとに、ユーザーの質問に日本語で回答してください。これ以上ツールを呼び出さず、[TOOL_CALL] 形式は出力しないでください。";

pub fn follow_up_prompt(formatted_results: &str) -> String {
    format!("ツールの実行結果:\n\n{formatted_results}\n\n{FOLLOW_UP_INSTRUCTION}")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyRequestError {
    #[error("Unknown action: {0}")]
    UnknownAction(String),
    #[error("{0}")]
    MissingParams(&'static str),
}

/// One action accepted by the direct tool proxy.
#[derive(Debug, Clone, Copy)]
pub struct ProxyAction {
    pub action: &'static str,
    pub tool: &'static str,
    pub required: &'static [&'static str],
    pub missing_message: &'static str,
}

pub const PROXY_ACTIONS: &[ProxyAction] = &[
    ProxyAction {
        action: "search",
        tool: SEARCH_TOOL,
        required: &["query"],
        missing_message: "Missing query parameter",
    },
    ProxyAction {
        action: "read_diary",
        tool: "read_diary",
        required: &["id"],
        missing_message: "Missing id parameter",
    },
    ProxyAction {
        action: "write_diary",
        tool: "write_diary",
        required: &["title", "content"],
        missing_message: "Missing title or content",
    },
    ProxyAction {
        action: "read_wiki",
        tool: "read_wiki",
        required: &["id"],
        missing_message: "Missing id parameter",
    },
    ProxyAction {
        action: "write_wiki",
        tool: "write_wiki",
        required: &["title", "content"],
        missing_message: "Missing title or content",
    },
    ProxyAction {
        action: "read_blog",
        tool: "read_blog",
        required: &["id"],
        missing_message: "Missing id parameter",
    },
    ProxyAction {
        action: "write_blog",
        tool: "write_blog",
        required: &[
            "title",
            "content",
            "contentMarkdown",
            "contentHtml",
            "eyecatch",
            "permalink",
            "site",
            "author",
            "persona",
        ],
        missing_message: "Missing required blog parameters",
    },
    ProxyAction {
        action: "search_passwords",
        tool: "search_passwords",
        required: &["query"],
        missing_message: "Missing query parameter",
    },
];

fn is_present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Some(_) => true,
    }
}

/// Maps a proxy `{action, params}` request onto the tool call it stands for. Only the
/// parameters the action declares are forwarded.
pub fn resolve_proxy_action(
    action: &str,
    params: &Map<String, Value>,
) -> Result<ToolCall, ProxyRequestError> {
    let entry = PROXY_ACTIONS
        .iter()
        .find(|entry| entry.action == action)
        .ok_or_else(|| ProxyRequestError::UnknownAction(action.to_string()))?;
    if !entry.required.iter().all(|key| is_present(params.get(*key))) {
        return Err(ProxyRequestError::MissingParams(entry.missing_message));
    }
    let mut arguments = entry
        .required
        .iter()
        .filter_map(|key| params.get(*key).map(|v| ((*key).to_string(), v.clone())))
        .collect::<Map<String, Value>>();
    if entry.tool == SEARCH_TOOL {
        let limit = params
            .get("limit")
            .filter(|v| is_present(Some(*v)))
            .cloned()
            .unwrap_or_else(|| json!(DEFAULT_SEARCH_LIMIT));
        arguments.insert("limit".to_string(), limit);
    }
    Ok(ToolCall::new(entry.tool, arguments))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSchemaValidationError {
    pub tool_name: String,
    pub path: String,
    pub reason: String,
}

impl std::fmt::Display for ToolSchemaValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid tool schema `{}` at `{}`: {}",
            self.tool_name, self.path, self.reason
        )
    }
}

impl std::error::Error for ToolSchemaValidationError {}

/// Checks the parts of a schema that models choke on: array nodes need `items`, and every
/// `required` key must be declared under `properties`.
pub fn validate_tool_schemas(schemas: &[ToolSchema]) -> Result<(), ToolSchemaValidationError> {
    for schema in schemas {
        validate_schema_node(&schema.name, "$", &schema.input_schema)?;
    }
    Ok(())
}

fn validate_schema_node(
    tool_name: &str,
    path: &str,
    value: &Value,
) -> Result<(), ToolSchemaValidationError> {
    let Some(obj) = value.as_object() else {
        return Ok(());
    };
    let fail = |reason: String| ToolSchemaValidationError {
        tool_name: tool_name.to_string(),
        path: path.to_string(),
        reason,
    };

    if obj.get("type").and_then(|t| t.as_str()) == Some("array") && !obj.contains_key("items") {
        return Err(fail("array schema missing items".to_string()));
    }

    let props = obj.get("properties").and_then(|v| v.as_object());
    if let Some(required) = obj.get("required").and_then(|v| v.as_array()) {
        for key in required.iter().filter_map(|v| v.as_str()) {
            if !props.map(|p| p.contains_key(key)).unwrap_or(false) {
                return Err(fail(format!("required key `{key}` is not declared")));
            }
        }
    }

    if let Some(items) = obj.get("items") {
        validate_schema_node(tool_name, &format!("{path}.items"), items)?;
    }
    if let Some(props) = props {
        for (key, child) in props {
            validate_schema_node(tool_name, &format!("{path}.properties.{key}"), child)?;
        }
    }
    Ok(())
}
