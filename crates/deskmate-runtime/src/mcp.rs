use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use deskmate_types::{ToolCall, ToolResult, ToolResults};

pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
pub const MCP_SESSION_HEADER: &str = "Mcp-Session-Id";
pub const DEFAULT_MCP_TIMEOUT: Duration = Duration::from_secs(30);

const NOT_CONFIGURED: &str = "MCP_SERVER_URL is not configured";
const INIT_FAILED: &str = "Failed to initialize MCP server";

#[async_trait]
pub trait ToolBackend: Send + Sync {
    /// Runs one call. Failures come back as a failed `ToolResult`, never as a panic or `Err`.
    async fn invoke(&self, call: &ToolCall) -> ToolResult;

    /// Runs `calls` one after another. A failed call does not stop the ones after it.
    async fn invoke_sequence(&self, calls: &[ToolCall]) -> ToolResults {
        let mut results = ToolResults::new();
        for (ordinal, call) in calls.iter().enumerate() {
            let result = self.invoke(call).await;
            if !result.success {
                tracing::warn!(
                    tool = %call.name,
                    ordinal,
                    "tool call failed: {}",
                    result.error.as_deref().unwrap_or("")
                );
            }
            results.record(ordinal, &call.name, result);
        }
        results
    }

    async fn health(&self) -> anyhow::Result<()>;

    fn endpoint(&self) -> Option<&str>;
}

/// Stand-in used when no tool server is configured; every call fails with a clear message.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredToolBackend;

#[async_trait]
impl ToolBackend for UnconfiguredToolBackend {
    async fn invoke(&self, _call: &ToolCall) -> ToolResult {
        ToolResult::failure(NOT_CONFIGURED)
    }

    async fn health(&self) -> anyhow::Result<()> {
        anyhow::bail!(NOT_CONFIGURED)
    }

    fn endpoint(&self) -> Option<&str> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum SessionState {
    #[default]
    Uninitialized,
    Ready,
}

#[derive(Debug, Default)]
struct McpSession {
    session_id: Option<String>,
    state: SessionState,
}

struct RpcReply {
    status: StatusCode,
    session_id: Option<String>,
    body: String,
}

enum Attempt {
    Finished(ToolResult),
    SessionExpired(String),
}

/// Client for an MCP server speaking streamable HTTP at `{server_url}/mcp`.
///
/// The session is created lazily by the first call and shared by every call after it. The
/// mutex is held for the whole handshake, so callers racing on a fresh invoker wait for one
/// handshake instead of starting their own.
pub struct McpToolInvoker {
    server_url: String,
    endpoint: String,
    client: reqwest::Client,
    session: Mutex<McpSession>,
    next_id: AtomicU64,
}

impl McpToolInvoker {
    pub fn new(server_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let server_url = server_url.trim().trim_end_matches('/').to_string();
        if server_url.is_empty() {
            anyhow::bail!(NOT_CONFIGURED);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build MCP HTTP client")?;
        Ok(Self {
            endpoint: format!("{server_url}/mcp"),
            server_url,
            client,
            session: Mutex::new(McpSession::default()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session.lock().await.session_id.clone()
    }

    /// Performs the handshake unless a session is already up, and returns the session id read
    /// under the same lock. A failed handshake leaves the invoker uninitialized so the next call
    /// tries again.
    pub async fn ensure_ready(&self) -> anyhow::Result<Option<String>> {
        let mut session = self.session.lock().await;
        if session.state == SessionState::Ready {
            return Ok(session.session_id.clone());
        }
        match self.handshake().await {
            Ok(session_id) => {
                tracing::info!(
                    endpoint = %self.endpoint,
                    session = session_id.as_deref().unwrap_or(""),
                    "MCP session initialized"
                );
                session.session_id = session_id.clone();
                session.state = SessionState::Ready;
                Ok(session_id)
            }
            Err(err) => {
                tracing::warn!(endpoint = %self.endpoint, "MCP initialization failed: {err:#}");
                *session = McpSession::default();
                Err(err)
            }
        }
    }

    async fn invalidate(&self, expired: Option<&str>) {
        let mut session = self.session.lock().await;
        // another caller may already have replaced the session
        if session.session_id.as_deref() == expired {
            *session = McpSession::default();
        }
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn handshake(&self) -> anyhow::Result<Option<String>> {
        let initialize = json!({
            "jsonrpc": "2.0",
            "id": self.next_request_id(),
            "method": "initialize",
            "params": {
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "deskmate",
                    "version": env!("CARGO_PKG_VERSION"),
                }
            }
        });
        let reply = self.post(&initialize, None).await?;
        if !reply.status.is_success() {
            anyhow::bail!(
                "initialize returned HTTP {}: {}",
                reply.status.as_u16(),
                truncate(&reply.body, 400)
            );
        }
        let value = parse_rpc_body(&reply.body)?;
        if let Some(error) = value.get("error") {
            anyhow::bail!("initialize rejected: {}", rpc_error_message(error));
        }
        let session_id = reply.session_id;

        let initialized = json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized",
        });
        let ack = self.post(&initialized, session_id.as_deref()).await?;
        if !ack.status.is_success() {
            anyhow::bail!(
                "notifications/initialized returned HTTP {}: {}",
                ack.status.as_u16(),
                truncate(&ack.body, 400)
            );
        }
        Ok(session_id)
    }

    async fn post(&self, payload: &Value, session_id: Option<&str>) -> anyhow::Result<RpcReply> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header(ACCEPT, "application/json, text/event-stream")
            .header(CONTENT_TYPE, "application/json")
            .json(payload);
        if let Some(session_id) = session_id {
            request = request.header(MCP_SESSION_HEADER, session_id);
        }
        let response = request.send().await.context("MCP request failed")?;
        let status = response.status();
        let session_id = response
            .headers()
            .get(MCP_SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        let body = response
            .text()
            .await
            .context("failed to read MCP response")?;
        Ok(RpcReply {
            status,
            session_id,
            body,
        })
    }

    async fn attempt(&self, call: &ToolCall, session_id: Option<&str>) -> Attempt {
        let request = json!({
            "jsonrpc": "2.0",
            "id": self.next_request_id(),
            "method": "tools/call",
            "params": {
                "name": call.name,
                "arguments": call.params,
            }
        });
        let reply = match self.post(&request, session_id).await {
            Ok(reply) => reply,
            Err(err) => return Attempt::Finished(ToolResult::failure(format!("{err:#}"))),
        };
        if reply.status == StatusCode::NOT_FOUND && session_id.is_some() {
            return Attempt::SessionExpired(reply.body);
        }
        if !reply.status.is_success() {
            return Attempt::Finished(ToolResult::failure(format!(
                "HTTP {}: {}",
                reply.status.as_u16(),
                reply.body
            )));
        }
        Attempt::Finished(interpret_tool_reply(&reply.body))
    }

    async fn call_with_session(&self, call: &ToolCall) -> Attempt {
        let Ok(session_id) = self.ensure_ready().await else {
            return Attempt::Finished(ToolResult::failure(INIT_FAILED));
        };
        match self.attempt(call, session_id.as_deref()).await {
            Attempt::SessionExpired(body) => {
                self.invalidate(session_id.as_deref()).await;
                Attempt::SessionExpired(body)
            }
            finished => finished,
        }
    }
}

#[async_trait]
impl ToolBackend for McpToolInvoker {
    async fn invoke(&self, call: &ToolCall) -> ToolResult {
        tracing::debug!(tool = %call.name, "invoking MCP tool");
        let outcome = match self.call_with_session(call).await {
            Attempt::SessionExpired(_) => {
                tracing::info!(tool = %call.name, "MCP session expired, re-initializing");
                self.call_with_session(call).await
            }
            finished => finished,
        };
        match outcome {
            Attempt::Finished(result) => result,
            Attempt::SessionExpired(body) => {
                ToolResult::failure(format!("HTTP {}: {}", StatusCode::NOT_FOUND.as_u16(), body))
            }
        }
    }

    async fn health(&self) -> anyhow::Result<()> {
        let url = format!("{}/health", self.server_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to reach MCP server at {}", self.server_url))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("MCP HTTP error: {} {}", status.as_u16(), truncate(&text, 400));
        }
        Ok(())
    }

    fn endpoint(&self) -> Option<&str> {
        Some(&self.server_url)
    }
}

fn interpret_tool_reply(body: &str) -> ToolResult {
    let value = match parse_rpc_body(body) {
        Ok(value) => value,
        Err(err) => return ToolResult::failure(format!("{err:#}")),
    };
    if let Some(error) = value.get("error") {
        return ToolResult::failure(rpc_error_message(error));
    }
    let result = value.get("result").cloned().unwrap_or(Value::Null);
    if result.get("isError").and_then(|v| v.as_bool()) == Some(true) {
        let content = result.get("content").unwrap_or(&result);
        return ToolResult::failure(render_mcp_content(content));
    }
    ToolResult::ok(result)
}

/// Parses a JSON-RPC reply that arrived either as plain JSON or as an SSE body; for SSE the
/// last `data:` payload that is valid JSON wins.
pub fn parse_rpc_body(body: &str) -> anyhow::Result<Value> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        anyhow::bail!("empty MCP response");
    }
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return serde_json::from_str::<Value>(trimmed).context("invalid MCP JSON response");
    }
    last_sse_payload(trimmed).ok_or_else(|| {
        anyhow::anyhow!(
            "MCP response carried no JSON payload: {}",
            truncate(trimmed, 200)
        )
    })
}

fn last_sse_payload(body: &str) -> Option<Value> {
    let mut last = None;
    let mut data = Vec::new();
    for line in body.lines().chain(std::iter::once("")) {
        if line.trim().is_empty() {
            if !data.is_empty() {
                if let Ok(value) = serde_json::from_str::<Value>(&data.join("\n")) {
                    last = Some(value);
                }
                data.clear();
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            data.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    last
}

fn rpc_error_message(error: &Value) -> String {
    error
        .get("message")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}

fn render_mcp_content(value: &Value) -> String {
    let Some(items) = value.as_array() else {
        return value.to_string();
    };
    let chunks = items
        .iter()
        .map(|item| {
            item.get("text")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| item.to_string())
        })
        .collect::<Vec<_>>();
    if chunks.is_empty() {
        value.to_string()
    } else {
        chunks.join("\n")
    }
}

fn truncate(input: &str, max_chars: usize) -> String {
    input.chars().take(max_chars).collect()
}
