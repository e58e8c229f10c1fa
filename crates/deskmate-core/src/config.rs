use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use deskmate_providers::{DEFAULT_OLLAMA_BASE_URL, DEFAULT_OLLAMA_MODEL};
use deskmate_tools::{DEFAULT_SEARCH_LIMIT, DEFAULT_SEARCH_QUERY};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_base_url")]
    pub base_url: String,
    #[serde(default = "default_ollama_model")]
    pub model: String,
    /// Also offer the tool catalog through the model's function-calling channel.
    #[serde(default)]
    pub native_tools: bool,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_base_url(),
            model: default_ollama_model(),
            native_tools: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct McpConfig {
    #[serde(default)]
    pub server_url: Option<String>,
    #[serde(default = "default_mcp_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            timeout_secs: default_mcp_timeout_secs(),
        }
    }
}

impl McpConfig {
    pub fn configured_url(&self) -> Option<&str> {
        self.server_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolDefaultsConfig {
    #[serde(default = "default_search_query")]
    pub default_search_query: String,
    #[serde(default = "default_search_limit")]
    pub default_search_limit: u64,
}

impl Default for ToolDefaultsConfig {
    fn default() -> Self {
        Self {
            default_search_query: default_search_query(),
            default_search_limit: default_search_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct AppConfig {
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub mcp: McpConfig,
    #[serde(default)]
    pub tools: ToolDefaultsConfig,
}

impl AppConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ollama.model.trim().is_empty() {
            anyhow::bail!("ollama.model must not be empty");
        }
        ensure_http_url("ollama.base_url", &self.ollama.base_url)?;
        if let Some(url) = self.mcp.configured_url() {
            ensure_http_url("mcp.server_url", url)?;
        }
        if self.tools.default_search_limit == 0 {
            anyhow::bail!("tools.default_search_limit must be at least 1");
        }
        Ok(())
    }
}

fn ensure_http_url(field: &str, url: &str) -> anyhow::Result<()> {
    let url = url.trim();
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        anyhow::bail!("{field} must be an http(s) URL, got `{url}`")
    }
}

fn default_ollama_base_url() -> String {
    DEFAULT_OLLAMA_BASE_URL.to_string()
}

fn default_ollama_model() -> String {
    DEFAULT_OLLAMA_MODEL.to_string()
}

fn default_mcp_timeout_secs() -> u64 {
    30
}

fn default_search_query() -> String {
    DEFAULT_SEARCH_QUERY.to_string()
}

fn default_search_limit() -> u64 {
    DEFAULT_SEARCH_LIMIT
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    file: Value,
    env: Value,
    cli: Value,
}

/// Layered configuration: `config.json` in the state dir, then environment, then CLI flags.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        Self::with_env(path, env_layer(), cli_overrides).await
    }

    async fn with_env(
        path: impl AsRef<Path>,
        env: Value,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = read_json_file(&path).await?;
        let layers = ConfigLayers {
            file,
            env,
            cli: cli_overrides.unwrap_or_else(empty_object),
        };
        Ok(Self {
            path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The merged layers as an `AppConfig`. A layer with a mistyped field is an error, not a
    /// silent fallback to defaults.
    pub async fn get(&self) -> anyhow::Result<AppConfig> {
        let merged = self.get_effective_value().await;
        serde_json::from_value(merged).with_context(|| {
            format!(
                "invalid configuration (file {} merged with env and CLI overrides)",
                self.path.display()
            )
        })
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.file);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.cli);
        merged
    }

    pub async fn get_layers_value(&self) -> Value {
        let layers = self.layers.read().await;
        json!({
            "file": layers.file,
            "env": layers.env,
            "cli": layers.cli
        })
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let value = serde_json::from_str::<Value>(&raw)
        .with_context(|| format!("config file {} is not valid JSON", path.display()))?;
    if !value.is_object() {
        anyhow::bail!("config file {} must contain a JSON object", path.display());
    }
    Ok(value)
}

fn env_layer() -> Value {
    env_layer_from(|key| std::env::var(key).ok())
}

fn env_layer_from(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let non_blank = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    let mut root = empty_object();

    if let Some(url) = non_blank("OLLAMA_BASE_URL") {
        deep_merge(&mut root, &json!({ "ollama": { "base_url": url.trim() } }));
    }
    if let Some(model) = non_blank("OLLAMA_MODEL") {
        deep_merge(&mut root, &json!({ "ollama": { "model": model.trim() } }));
    }
    if let Some(enabled) = non_blank("OLLAMA_NATIVE_TOOLS").and_then(|v| parse_bool_like(&v)) {
        deep_merge(&mut root, &json!({ "ollama": { "native_tools": enabled } }));
    }
    if let Some(url) = non_blank("MCP_SERVER_URL") {
        deep_merge(&mut root, &json!({ "mcp": { "server_url": url.trim() } }));
    }
    if let Some(secs) = non_blank("MCP_TIMEOUT_SECS").and_then(|v| v.trim().parse::<u64>().ok()) {
        deep_merge(&mut root, &json!({ "mcp": { "timeout_secs": secs } }));
    }
    root
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn temp_config_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("deskmate-config-{}", uuid::Uuid::new_v4()))
            .join("config.json")
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.ollama.base_url, "http://localhost:11434");
        assert_eq!(config.ollama.model, "gpt-oss-20b");
        assert!(!config.ollama.native_tools);
        assert_eq!(config.mcp.configured_url(), None);
        assert_eq!(config.mcp.timeout(), Duration::from_secs(30));
        assert_eq!(config.tools.default_search_query, "最近");
        assert_eq!(config.tools.default_search_limit, 5);
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn env_layer_reads_known_variables() {
        let vars = HashMap::from([
            ("OLLAMA_MODEL", "llama3"),
            ("OLLAMA_NATIVE_TOOLS", "yes"),
            ("MCP_SERVER_URL", " http://desk:3001 "),
            ("MCP_TIMEOUT_SECS", "not-a-number"),
            ("OLLAMA_BASE_URL", "   "),
        ]);
        let layer = env_layer_from(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(
            layer,
            json!({
                "ollama": {"model": "llama3", "native_tools": true},
                "mcp": {"server_url": "http://desk:3001"}
            })
        );
    }

    #[tokio::test]
    async fn cli_overrides_env_which_overrides_file() {
        let path = temp_config_path();
        std::fs::create_dir_all(path.parent().expect("parent")).expect("dir");
        std::fs::write(
            &path,
            r#"{"ollama":{"model":"from-file","base_url":"http://file:11434"},"mcp":{"timeout_secs":5}}"#,
        )
        .expect("write");

        let store = ConfigStore::with_env(
            &path,
            json!({"ollama": {"model": "from-env"}}),
            Some(json!({"ollama": {"model": "from-cli"}, "mcp": {"server_url": null}})),
        )
        .await
        .expect("store");

        let config = store.get().await.expect("config");
        assert_eq!(config.ollama.model, "from-cli");
        assert_eq!(config.ollama.base_url, "http://file:11434");
        assert_eq!(config.mcp.timeout_secs, 5);
        assert_eq!(store.get_layers_value().await["env"]["ollama"]["model"], "from-env");
        let _ = std::fs::remove_dir_all(path.parent().expect("parent"));
    }

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let store = ConfigStore::with_env(temp_config_path(), empty_object(), None)
            .await
            .expect("store");
        assert_eq!(store.get().await.expect("config"), AppConfig::default());
    }

    #[tokio::test]
    async fn mistyped_file_layer_is_an_error() {
        let path = temp_config_path();
        std::fs::create_dir_all(path.parent().expect("parent")).expect("dir");
        std::fs::write(&path, r#"{"mcp":{"timeout_secs":"thirty"}}"#).expect("write");

        let store = ConfigStore::with_env(
            &path,
            json!({"mcp": {"server_url": "http://desk:3001"}}),
            Some(json!({"ollama": {"model": "from-cli"}})),
        )
        .await
        .expect("store");
        let err = store.get().await.expect_err("mistyped timeout must not fall back");
        assert!(format!("{err:#}").contains("thirty"), "{err:#}");
        let _ = std::fs::remove_dir_all(path.parent().expect("parent"));
    }

    #[tokio::test]
    async fn unparseable_file_fails_to_load() {
        let path = temp_config_path();
        std::fs::create_dir_all(path.parent().expect("parent")).expect("dir");
        std::fs::write(&path, r#"{"ollama": {"model": "#).expect("write");
        assert!(ConfigStore::with_env(&path, empty_object(), None).await.is_err());

        std::fs::write(&path, "[1, 2]").expect("write");
        assert!(ConfigStore::with_env(&path, empty_object(), None).await.is_err());
        let _ = std::fs::remove_dir_all(path.parent().expect("parent"));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.ollama.model = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.mcp.server_url = Some("desk:3001".to_string());
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.mcp.server_url = Some("   ".to_string());
        config.validate().expect("blank MCP url means not configured");
    }
}
