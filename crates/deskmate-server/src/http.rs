use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Map, Value};
use tower_http::cors::{Any, CorsLayer};

use deskmate_observability::redact_text;
use deskmate_tools::resolve_proxy_action;
use deskmate_types::{ChatMessage, MessageRole};

use crate::AppState;

const CHAT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("deskmate server listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/global/health", get(global_health))
        .route("/global/config", get(global_config))
        .route("/api/chat", axum::routing::post(chat))
        .route("/api/threads", get(list_threads).post(create_thread))
        .route("/api/threads/{id}", get(get_thread))
        .route("/api/messages", axum::routing::post(create_message))
        .route("/api/mcp", get(mcp_status).post(mcp_proxy))
        .route("/api/models", get(list_models))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn non_empty_str<'a>(input: &'a Value, key: &str) -> Option<&'a str> {
    input
        .get(key)
        .and_then(Value::as_str)
        .filter(|v| !v.trim().is_empty())
}

async fn global_health() -> impl IntoResponse {
    Json(json!({
        "healthy": true,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn global_config(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "effective": state.config.get_effective_value().await,
        "layers": state.config.get_layers_value().await,
    }))
}

async fn chat(State(state): State<AppState>, Json(input): Json<Value>) -> Response {
    let thread_id = non_empty_str(&input, "threadId");
    let messages = input
        .get("messages")
        .cloned()
        .map(serde_json::from_value::<Vec<ChatMessage>>);
    let (Some(thread_id), Some(Ok(messages))) = (thread_id, messages) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing required fields");
    };

    let turn = match state.orchestrator.begin_turn(Some(thread_id), messages).await {
        Ok(turn) => turn,
        Err(err) => {
            tracing::error!(thread_id, "chat turn failed to start: {err:#}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to process chat");
        }
    };
    tracing::debug!(
        thread_id,
        correlation_id = turn.correlation_id(),
        "streaming chat turn"
    );

    let body = Body::from_stream(turn.into_stream());
    ([(header::CONTENT_TYPE, CHAT_CONTENT_TYPE)], body).into_response()
}

async fn list_threads(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.storage.list_threads().await))
}

async fn create_thread(State(state): State<AppState>, Json(input): Json<Value>) -> Response {
    let Some(title) = non_empty_str(&input, "title") else {
        return error_response(StatusCode::BAD_REQUEST, "タイトルは必須です");
    };
    match state.storage.create_thread(title).await {
        Ok(thread) => (StatusCode::CREATED, Json(json!(thread))).into_response(),
        Err(err) => {
            tracing::error!("failed to create thread: {err:#}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "スレッドの作成に失敗しました")
        }
    }
}

async fn get_thread(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(thread) = state.storage.get_thread(&id).await else {
        return error_response(StatusCode::NOT_FOUND, "Thread not found");
    };
    let messages = state.storage.list_messages(&id).await;
    Json(json!({ "thread": thread, "messages": messages })).into_response()
}

async fn create_message(State(state): State<AppState>, Json(input): Json<Value>) -> Response {
    let thread_id = non_empty_str(&input, "threadId");
    let role = non_empty_str(&input, "role");
    let content = non_empty_str(&input, "content");
    let (Some(thread_id), Some(role), Some(content)) = (thread_id, role, content) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "threadId, role, and content are required",
        );
    };
    let Some(role) = MessageRole::parse(role) else {
        return error_response(StatusCode::BAD_REQUEST, "role must be user or assistant");
    };
    match state.storage.append_message(thread_id, role, content).await {
        Ok(Some(message)) => (StatusCode::CREATED, Json(json!(message))).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Thread not found"),
        Err(err) => {
            tracing::error!(thread_id, "failed to append message: {err:#}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to create message")
        }
    }
}

async fn mcp_status(State(state): State<AppState>) -> Response {
    let Some(endpoint) = state.tools.endpoint().map(str::to_string) else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "status": "disconnected",
                "error": "MCP_SERVER_URL is not configured",
            })),
        )
            .into_response();
    };
    match state.tools.health().await {
        Ok(()) => Json(json!({ "status": "connected", "mcpServer": endpoint })).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "disconnected", "error": format!("{err:#}") })),
        )
            .into_response(),
    }
}

async fn mcp_proxy(State(state): State<AppState>, Json(input): Json<Value>) -> Response {
    let Some(action) = non_empty_str(&input, "action") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing action parameter");
    };
    if state.tools.endpoint().is_none() {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "MCP_SERVER_URL is not configured",
        );
    }
    let params = input
        .get("params")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_else(Map::new);
    let call = match resolve_proxy_action(action, &params) {
        Ok(call) => call,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, err.to_string()),
    };
    tracing::debug!(
        action,
        tool = %call.name,
        params = %redact_text(&serde_json::Value::Object(call.params.clone()).to_string()),
        "tool proxy call"
    );

    let result = state.tools.invoke(&call).await;
    if result.success {
        Json(json!({ "success": true, "data": result.data.unwrap_or(Value::Null) }))
            .into_response()
    } else {
        let message = result
            .error
            .unwrap_or_else(|| "MCP request failed".to_string());
        tracing::warn!(action, tool = %call.name, "tool proxy call failed: {message}");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

async fn list_models(State(state): State<AppState>) -> Json<Value> {
    match state.models.list_models().await {
        Ok(models) => Json(json!(models)),
        Err(err) => {
            tracing::warn!("failed to list models: {err:#}");
            Json(json!([]))
        }
    }
}
