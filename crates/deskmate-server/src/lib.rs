use std::sync::Arc;

use deskmate_core::{
    orchestrator_from_config, tool_backend_from_config, AppConfig, ChatOrchestrator, ConfigStore,
    Storage,
};
use deskmate_observability::ProcessKind;
use deskmate_providers::OllamaProvider;
use deskmate_runtime::ToolBackend;

mod http;

pub use http::{app_router, serve};

#[derive(Clone)]
pub struct AppState {
    pub config: ConfigStore,
    pub storage: Arc<Storage>,
    pub orchestrator: Arc<ChatOrchestrator>,
    pub tools: Arc<dyn ToolBackend>,
    pub models: Arc<OllamaProvider>,
}

impl AppState {
    /// Wires the model provider and tool backend described by `config`. The tool backend is
    /// shared by chat turns and the direct tool proxy, so both use one MCP session.
    pub async fn from_config(config: ConfigStore, storage: Arc<Storage>) -> anyhow::Result<Self> {
        let app_config: AppConfig = config.get().await?;
        app_config.validate()?;
        let tools = tool_backend_from_config(&app_config)?;
        let orchestrator = orchestrator_from_config(&app_config, tools.clone(), ProcessKind::Engine)?;
        let models = Arc::new(OllamaProvider::new(
            &app_config.ollama.base_url,
            &app_config.ollama.model,
        ));
        Ok(Self {
            config,
            storage,
            orchestrator: Arc::new(orchestrator),
            tools,
            models,
        })
    }
}
