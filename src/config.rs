use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub telegram: TelegramConfig,
    pub upstream: UpstreamConfig,
    #[serde(default = "default_registry_config")]
    pub registry: RegistryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Users allowed to run follow/unfollow and the other management commands.
    pub operator_user_ids: Vec<u64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    pub bearer_token: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_stream_base")]
    pub stream_base: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_path")]
    pub path: PathBuf,
}

fn default_api_base() -> String {
    "https://api.microblog.example/1.1".to_string()
}

fn default_stream_base() -> String {
    "https://stream.microblog.example/1.1".to_string()
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("follows.json")
}

fn default_registry_config() -> RegistryConfig {
    RegistryConfig {
        path: default_registry_path(),
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        if let Some(dir) = config.registry.path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                std::fs::create_dir_all(dir).with_context(|| {
                    format!("Failed to create registry directory: {}", dir.display())
                })?;
            }
        }

        Ok(config)
    }
}
