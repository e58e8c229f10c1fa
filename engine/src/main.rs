use std::io::{Read, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tracing::info;
use uuid::Uuid;

use deskmate_core::{
    config_path, orchestrator_from_config, resolve_state_dir, storage_dir, tool_backend_from_config,
    AppConfig, ConfigStore, Storage,
};
use deskmate_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
};
use deskmate_runtime::ToolBackend;
use deskmate_server::{serve, AppState};
use deskmate_tools::{ParameterNormalizer, RawToolCall};
use deskmate_types::ChatMessage;

const LOG_RETENTION_DAYS: u64 = 14;

#[derive(Parser, Debug)]
#[command(name = "deskmate-engine")]
#[command(about = "Chat backend for a private desk of diaries, wiki pages and blog drafts")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug, Clone, Default)]
struct RuntimeArgs {
    #[arg(long)]
    state_dir: Option<String>,
    #[arg(long)]
    config: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    ollama_url: Option<String>,
    #[arg(long)]
    mcp_url: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 3000)]
        port: u16,
        #[command(flatten)]
        runtime: RuntimeArgs,
    },
    Run {
        prompt: String,
        #[command(flatten)]
        runtime: RuntimeArgs,
    },
    Tool {
        /// `{"name": ..., "params": {...}}` inline, `@path` to read a file, or `-` for stdin.
        #[arg(long)]
        json: String,
        #[command(flatten)]
        runtime: RuntimeArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            runtime,
        } => {
            let state_dir = resolve_state_dir(runtime.state_dir.clone().map(PathBuf::from));
            let (_log_guard, log_info) = init_process_logging(
                ProcessKind::Engine,
                &canonical_logs_dir_from_root(&state_dir),
                LOG_RETENTION_DAYS,
            )?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent {
                    event: "logging.initialized",
                    component: "engine.main",
                    status: Some("ok"),
                    detail: Some("engine jsonl logging initialized"),
                    ..Default::default()
                },
            );
            info!(
                logs_dir = %log_info.logs_dir.display(),
                pruned = log_info.pruned_files,
                "engine logging initialized"
            );

            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            let startup_attempt_id = Uuid::new_v4().to_string();
            let started = Instant::now();
            let config = load_config(&state_dir, &runtime).await?;
            log_startup_paths(&state_dir, config.path(), &addr, &startup_attempt_id);
            let state = match build_state(&state_dir, config).await {
                Ok(state) => state,
                Err(err) => {
                    let detail = format!("attempt_id={startup_attempt_id} error={err:#}");
                    emit_event(
                        tracing::Level::ERROR,
                        ProcessKind::Engine,
                        ObservabilityEvent {
                            event: "engine.startup.failed",
                            component: "engine.main",
                            status: Some("failed"),
                            error_code: Some("ENGINE_STARTUP_FAILED"),
                            detail: Some(&detail),
                            ..Default::default()
                        },
                    );
                    return Err(err);
                }
            };
            let detail = format!(
                "attempt_id={} elapsed_ms={}",
                startup_attempt_id,
                started.elapsed().as_millis()
            );
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent {
                    event: "engine.startup.ready",
                    component: "engine.main",
                    model_id: Some(state.orchestrator.model_id()),
                    status: Some("ok"),
                    detail: Some(&detail),
                    ..Default::default()
                },
            );
            info!(
                "effective config: {}",
                effective_config_summary(&state.config.get().await?)
            );
            serve(addr, state).await?;
        }
        Command::Run { prompt, runtime } => {
            let state_dir = resolve_state_dir(runtime.state_dir.clone().map(PathBuf::from));
            let (_log_guard, _) = init_process_logging(
                ProcessKind::Cli,
                &canonical_logs_dir_from_root(&state_dir),
                LOG_RETENTION_DAYS,
            )?;
            let config = load_config(&state_dir, &runtime).await?.get().await?;
            config.validate()?;
            let tools = tool_backend_from_config(&config)?;
            let orchestrator = orchestrator_from_config(&config, tools, ProcessKind::Cli)?;
            let turn = orchestrator
                .begin_turn(None, vec![ChatMessage::user(prompt)])
                .await?;
            let mut output = turn.into_stream();
            let mut stdout = std::io::stdout();
            while let Some(chunk) = output.next().await {
                stdout.write_all(chunk?.as_bytes())?;
                stdout.flush()?;
            }
            writeln!(stdout)?;
        }
        Command::Tool { json, runtime } => {
            let state_dir = resolve_state_dir(runtime.state_dir.clone().map(PathBuf::from));
            let (_log_guard, _) = init_process_logging(
                ProcessKind::Cli,
                &canonical_logs_dir_from_root(&state_dir),
                LOG_RETENTION_DAYS,
            )?;
            let config = load_config(&state_dir, &runtime).await?.get().await?;
            config.validate()?;
            let payload = read_tool_json(&json)?;
            let raw = parse_tool_payload(&payload)?;
            let normalizer = ParameterNormalizer::new(
                &config.tools.default_search_query,
                config.tools.default_search_limit,
            );
            let call = normalizer.normalize(raw);
            let tools = tool_backend_from_config(&config)?;
            let result = tools.invoke(&call).await;
            let output = json!({
                "tool": call.name,
                "params": call.params,
                "result": result,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
            if !result.success {
                anyhow::bail!(
                    "tool `{}` failed: {}",
                    call.name,
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
    }

    Ok(())
}

async fn load_config(state_dir: &Path, runtime: &RuntimeArgs) -> anyhow::Result<ConfigStore> {
    let path = runtime
        .config
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| config_path(state_dir));
    ConfigStore::new(path, build_cli_overrides(runtime)).await
}

async fn build_state(state_dir: &Path, config: ConfigStore) -> anyhow::Result<AppState> {
    let phase_start = Instant::now();
    let storage = Arc::new(Storage::new(storage_dir(state_dir)).await?);
    info!(
        "engine.startup.phase storage_init elapsed_ms={}",
        phase_start.elapsed().as_millis()
    );
    let phase_start = Instant::now();
    let state = AppState::from_config(config, storage).await?;
    info!(
        "engine.startup.phase runtime_init elapsed_ms={}",
        phase_start.elapsed().as_millis()
    );
    Ok(state)
}

fn build_cli_overrides(runtime: &RuntimeArgs) -> Option<Value> {
    let non_blank = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Value::String(v.to_string()))
    };
    let mut ollama = Map::new();
    if let Some(model) = non_blank(&runtime.model) {
        ollama.insert("model".to_string(), model);
    }
    if let Some(url) = non_blank(&runtime.ollama_url) {
        ollama.insert("base_url".to_string(), url);
    }
    let mut mcp = Map::new();
    if let Some(url) = non_blank(&runtime.mcp_url) {
        mcp.insert("server_url".to_string(), url);
    }
    if ollama.is_empty() && mcp.is_empty() {
        return None;
    }

    let mut root = Map::new();
    if !ollama.is_empty() {
        root.insert("ollama".to_string(), Value::Object(ollama));
    }
    if !mcp.is_empty() {
        root.insert("mcp".to_string(), Value::Object(mcp));
    }
    Some(Value::Object(root))
}

fn read_tool_json(input: &str) -> anyhow::Result<Value> {
    if input.trim() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(serde_json::from_str(&buf)?);
    }
    if let Some(path) = input.strip_prefix('@') {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read tool payload from {path}"))?;
        return Ok(serde_json::from_str(&raw)?);
    }
    Ok(serde_json::from_str(input)?)
}

/// Accepts the same `{name, params}` shape the model writes inside a directive block.
fn parse_tool_payload(payload: &Value) -> anyhow::Result<RawToolCall> {
    let name = payload
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow::anyhow!("name is required in input json"))?;
    let params = payload.get("params").cloned().unwrap_or_else(|| json!({}));
    Ok(RawToolCall::Directive {
        name: name.to_string(),
        params,
    })
}

fn log_startup_paths(state_dir: &Path, config_path: &Path, addr: &SocketAddr, attempt_id: &str) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!("starting deskmate-engine on http://{addr}");
    info!(
        "startup paths: attempt_id={} exe={} cwd={} state_dir={} config_path={}",
        attempt_id,
        exe.display(),
        cwd.display(),
        state_dir.display(),
        config_path.display()
    );
}

fn effective_config_summary(config: &AppConfig) -> String {
    format!(
        "model={} ollama={} mcp={}",
        config.ollama.model,
        config.ollama.base_url,
        config.mcp.configured_url().unwrap_or("<none>")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_only_carry_given_flags() {
        let runtime = RuntimeArgs {
            model: Some(" llama3.1 ".to_string()),
            mcp_url: Some("http://desk:3001".to_string()),
            ollama_url: Some("  ".to_string()),
            ..Default::default()
        };
        let overrides = build_cli_overrides(&runtime).expect("some");
        assert_eq!(
            overrides,
            json!({
                "ollama": {"model": "llama3.1"},
                "mcp": {"server_url": "http://desk:3001"}
            })
        );
        assert!(build_cli_overrides(&RuntimeArgs::default()).is_none());
    }

    #[test]
    fn tool_payload_needs_a_name() {
        let err = parse_tool_payload(&json!({"params": {}})).unwrap_err();
        assert!(err.to_string().contains("name is required"));

        let raw = parse_tool_payload(&json!({"name": "search_diary"})).expect("raw");
        let call = ParameterNormalizer::default().normalize(raw);
        assert_eq!(call.name, "search_private_desk");
        assert_eq!(call.params["query"], "最近");
        assert_eq!(call.params["limit"], 5);
    }

    #[test]
    fn tool_json_reads_files() {
        let path = std::env::temp_dir().join(format!("deskmate-tool-{}.json", Uuid::new_v4()));
        std::fs::write(&path, r#"{"name": "read_wiki", "params": {"id": "w-7"}}"#).expect("write");
        let payload = read_tool_json(&format!("@{}", path.display())).expect("payload");
        assert_eq!(payload["params"]["id"], "w-7");
        let _ = std::fs::remove_file(&path);

        assert!(read_tool_json("{not json").is_err());
    }

    #[test]
    fn cli_parses_serve_flags() {
        let cli = Cli::try_parse_from([
            "deskmate-engine",
            "serve",
            "--port",
            "4100",
            "--state-dir",
            "/tmp/desk",
            "--mcp-url",
            "http://desk:3001",
        ])
        .expect("parse");
        match cli.command {
            Command::Serve {
                hostname,
                port,
                runtime,
            } => {
                assert_eq!(hostname, "127.0.0.1");
                assert_eq!(port, 4100);
                assert_eq!(runtime.state_dir.as_deref(), Some("/tmp/desk"));
                assert_eq!(runtime.mcp_url.as_deref(), Some("http://desk:3001"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
