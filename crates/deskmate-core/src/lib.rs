use std::path::{Path, PathBuf};
use std::sync::Arc;

use deskmate_observability::ProcessKind;
use deskmate_providers::OllamaProvider;
use deskmate_runtime::{McpToolInvoker, ToolBackend, UnconfiguredToolBackend};
use deskmate_tools::{tool_catalog, validate_tool_schemas, ParameterNormalizer};

pub mod config;
pub mod orchestrator;
pub mod storage;

pub use config::*;
pub use orchestrator::*;
pub use storage::*;

pub const STATE_DIR_ENV: &str = "DESKMATE_STATE_DIR";

/// `--state-dir`, then `DESKMATE_STATE_DIR`, then `.deskmate` in the working directory.
pub fn resolve_state_dir(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| {
            std::env::var(STATE_DIR_ENV)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
        })
        .unwrap_or_else(|| PathBuf::from(".deskmate"))
}

pub fn storage_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("storage")
}

pub fn config_path(state_dir: &Path) -> PathBuf {
    state_dir.join("config.json")
}

pub fn tool_backend_from_config(config: &AppConfig) -> anyhow::Result<Arc<dyn ToolBackend>> {
    match config.mcp.configured_url() {
        Some(url) => Ok(Arc::new(McpToolInvoker::new(url, config.mcp.timeout())?)),
        None => {
            tracing::warn!("no MCP server configured; tool calls will fail");
            Ok(Arc::new(UnconfiguredToolBackend))
        }
    }
}

pub fn orchestrator_from_config(
    config: &AppConfig,
    tools: Arc<dyn ToolBackend>,
    process: ProcessKind,
) -> anyhow::Result<ChatOrchestrator> {
    let provider = Arc::new(OllamaProvider::new(
        &config.ollama.base_url,
        &config.ollama.model,
    ));
    let normalizer = ParameterNormalizer::new(
        &config.tools.default_search_query,
        config.tools.default_search_limit,
    );
    let mut orchestrator =
        ChatOrchestrator::new(provider, tools, normalizer).with_process(process);
    if config.ollama.native_tools {
        let schemas = tool_catalog();
        validate_tool_schemas(&schemas)?;
        orchestrator = orchestrator.with_native_tools(schemas);
    }
    Ok(orchestrator)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_state_dir_wins() {
        let dir = resolve_state_dir(Some(PathBuf::from("/tmp/desk")));
        assert_eq!(dir, PathBuf::from("/tmp/desk"));
        assert_eq!(storage_dir(&dir), PathBuf::from("/tmp/desk/storage"));
        assert_eq!(config_path(&dir), PathBuf::from("/tmp/desk/config.json"));
    }

    #[test]
    fn missing_mcp_url_selects_the_unconfigured_backend() {
        let backend = tool_backend_from_config(&AppConfig::default()).expect("backend");
        assert_eq!(backend.endpoint(), None);

        let mut config = AppConfig::default();
        config.mcp.server_url = Some("http://127.0.0.1:9".to_string());
        let backend = tool_backend_from_config(&config).expect("backend");
        assert_eq!(backend.endpoint(), Some("http://127.0.0.1:9"));
    }

    #[test]
    fn orchestrator_uses_configured_model() {
        let mut config = AppConfig::default();
        config.ollama.model = "llama3.1".to_string();
        config.ollama.native_tools = true;
        let orchestrator = orchestrator_from_config(
            &config,
            Arc::new(UnconfiguredToolBackend),
            ProcessKind::Cli,
        )
        .expect("orchestrator");
        assert_eq!(orchestrator.model_id(), "llama3.1");
    }
}
