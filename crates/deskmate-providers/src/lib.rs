use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use deskmate_types::{ChatMessage, ToolSchema};

pub mod stream;

pub use stream::{
    decode_line, model_event_stream, ChunkReassembler, DecodeError, ModelEvent, ModelEventStream,
};

pub const DEFAULT_OLLAMA_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_OLLAMA_MODEL: &str = "gpt-oss-20b";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<String>,
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn model_id(&self) -> &str;

    /// Opens one streaming chat request. Errors here mean the stream never started; failures
    /// after that arrive as `Err` items on the returned stream.
    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<ToolSchema>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ModelEventStream>;
}

#[derive(Clone)]
pub struct OllamaProvider {
    base_url: String,
    model: String,
    client: Client,
}

impl OllamaProvider {
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            base_url: normalize_base(base_url),
            model: model.trim().to_string(),
            client: Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Installed models, from `GET /api/tags`.
    pub async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .with_context(|| format!("failed to reach model server at {}", self.base_url))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "model list request failed with status {}: {}",
                status,
                truncate_for_error(&text, 500)
            );
        }
        let value: Value = response.json().await?;
        let models = value
            .get("models")
            .and_then(|v| v.as_array())
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| serde_json::from_value::<ModelInfo>(m.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }
}

#[async_trait]
impl ModelProvider for OllamaProvider {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<ToolSchema>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ModelEventStream> {
        let url = format!("{}/api/chat", self.base_url);
        let body = chat_request_body(&self.model, &messages, tools.as_deref());

        let resp = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("failed to reach model server at {}", self.base_url))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "model stream request failed with status {} for `{}`: {}",
                status,
                self.model,
                truncate_for_error(&text, 500)
            );
        }

        Ok(model_event_stream(resp.bytes_stream(), cancel))
    }
}

fn chat_request_body(model: &str, messages: &[ChatMessage], tools: Option<&[ToolSchema]>) -> Value {
    let wire_messages = messages
        .iter()
        .map(|m| json!({"role": m.wire_role(), "content": m.content}))
        .collect::<Vec<_>>();

    let wire_tools = tools
        .unwrap_or_default()
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.input_schema,
                }
            })
        })
        .collect::<Vec<_>>();

    let mut body = json!({
        "model": model,
        "messages": wire_messages,
        "stream": true,
    });
    if !wire_tools.is_empty() {
        body["tools"] = Value::Array(wire_tools);
    }
    body
}

fn normalize_base(input: &str) -> String {
    let trimmed = input.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        DEFAULT_OLLAMA_BASE_URL.to_string()
    } else {
        trimmed.to_string()
    }
}

fn truncate_for_error(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        input.to_string()
    } else {
        format!("{}...", input.chars().take(max_chars).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::State,
        http::StatusCode,
        routing::{get, post},
        Json, Router,
    };
    use futures::StreamExt;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct FakeOllama {
        requests: Arc<Mutex<Vec<Value>>>,
    }

    async fn spawn_fake(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        format!("http://{addr}")
    }

    async fn chat(State(state): State<FakeOllama>, Json(body): Json<Value>) -> String {
        state.requests.lock().expect("lock").push(body);
        [
            r#"{"message":{"role":"assistant","content":"Hello"},"done":false}"#,
            r#"{"message":{"role":"assistant","content":", there"},"done":false}"#,
            r#"{"message":{"role":"assistant","content":""},"done":true,"done_reason":"stop","eval_count":2}"#,
        ]
        .join("\n")
    }

    #[test]
    fn request_body_maps_roles_and_tools() {
        let messages = vec![
            ChatMessage::system("sys"),
            ChatMessage::new("tool", "t"),
            ChatMessage::assistant("a"),
        ];
        let tools = vec![ToolSchema {
            name: "read_diary".to_string(),
            description: "Read a diary entry".to_string(),
            input_schema: json!({"type": "object"}),
        }];
        let body = chat_request_body("m", &messages, Some(&tools));
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["messages"][1]["role"], json!("user"));
        assert_eq!(body["tools"][0]["function"]["name"], json!("read_diary"));

        let bare = chat_request_body("m", &messages, None);
        assert!(bare.get("tools").is_none());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_for_error("日記日記", 2), "日記...");
        assert_eq!(truncate_for_error("short", 10), "short");
    }

    #[tokio::test]
    async fn streams_events_from_chat_endpoint() {
        let fake = FakeOllama::default();
        let app = Router::new()
            .route("/api/chat", post(chat))
            .with_state(fake.clone());
        let base = spawn_fake(app).await;
        let provider = OllamaProvider::new(&format!("{base}/"), "gpt-oss-20b");

        let events = provider
            .stream(vec![ChatMessage::user("hi")], None, CancellationToken::new())
            .await
            .expect("stream")
            .map(|e| e.expect("event"))
            .collect::<Vec<_>>()
            .await;

        assert_eq!(
            events[..2],
            [
                ModelEvent::ContentFragment("Hello".to_string()),
                ModelEvent::ContentFragment(", there".to_string()),
            ]
        );
        assert!(matches!(events[2], ModelEvent::Done { .. }));
        let requests = fake.requests.lock().expect("lock");
        assert_eq!(requests[0]["model"], json!("gpt-oss-20b"));
    }

    #[tokio::test]
    async fn non_success_status_fails_before_streaming() {
        let app = Router::new().route(
            "/api/chat",
            post(|| async { (StatusCode::NOT_FOUND, "model not found") }),
        );
        let base = spawn_fake(app).await;
        let provider = OllamaProvider::new(&base, "missing");
        let err = match provider
            .stream(vec![ChatMessage::user("hi")], None, CancellationToken::new())
            .await
        {
            Ok(_) => panic!("expected error"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("404"));
        assert!(err.to_string().contains("model not found"));
    }

    #[tokio::test]
    async fn lists_installed_models() {
        let app = Router::new().route(
            "/api/tags",
            get(|| async {
                Json(json!({"models": [{"name": "gpt-oss-20b", "size": 12}, {"bogus": true}]}))
            }),
        );
        let base = spawn_fake(app).await;
        let models = OllamaProvider::new(&base, "gpt-oss-20b")
            .list_models()
            .await
            .expect("models");
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].name, "gpt-oss-20b");
    }
}
