use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ── Top-level config ──────────────────────────────────────────────

/// Top-level Leadcaster configuration, loaded from `config.toml`.
///
/// Resolution order: `--config-dir` flag → `LEADCASTER_DIR` env →
/// platform config dir (`directories`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Workspace directory (campaign DB lives here) - computed, not serialized
    #[serde(skip)]
    pub workspace_dir: PathBuf,
    /// Path to config.toml - computed, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Dashboard API server settings (`[server]`).
    #[serde(default)]
    pub server: ServerConfig,

    /// Messaging gateway (WhatsApp transport) settings (`[messaging]`).
    #[serde(default)]
    pub messaging: MessagingConfig,

    /// Directory search provider settings (`[directory]`).
    #[serde(default)]
    pub directory: DirectoryConfig,

    /// Dispatch pacing defaults and validation pacing (`[dispatch]`).
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Optional bearer token; when set, all /api routes require it.
    #[serde(default)]
    pub api_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// Base URL of the Evolution-style WhatsApp gateway.
    #[serde(default = "default_messaging_base_url")]
    pub base_url: String,
    /// Gateway API key, sent as the `apikey` header.
    #[serde(default)]
    pub api_key: String,
    /// Instance used when a campaign does not name one.
    #[serde(default = "default_instance")]
    pub default_instance: String,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Base URL of the business search provider.
    #[serde(default = "default_directory_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Results requested per page.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Default pacing window for new campaigns, in whole minutes.
    #[serde(default = "default_min_interval")]
    pub min_interval_minutes: u32,
    #[serde(default = "default_max_interval")]
    pub max_interval_minutes: u32,
    /// Delay between gateway number checks during validation.
    #[serde(default = "default_validation_delay_ms")]
    pub validation_delay_ms: u64,
    /// Country prefix prepended to numbers that lack one (e.g. "55").
    #[serde(default)]
    pub default_country_code: Option<String>,
    /// Rolling progress event log capacity per campaign.
    #[serde(default = "default_progress_log_capacity")]
    pub progress_log_capacity: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8740
}

fn default_messaging_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_instance() -> String {
    "main".to_string()
}

fn default_directory_base_url() -> String {
    "https://places.example.com".to_string()
}

fn default_page_size() -> u32 {
    20
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_min_interval() -> u32 {
    2
}

fn default_max_interval() -> u32 {
    5
}

fn default_validation_delay_ms() -> u64 {
    1000
}

fn default_progress_log_capacity() -> usize {
    50
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_token: None,
        }
    }
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            base_url: default_messaging_base_url(),
            api_key: String::new(),
            default_instance: default_instance(),
            timeout_secs: default_http_timeout_secs(),
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            base_url: default_directory_base_url(),
            api_key: None,
            page_size: default_page_size(),
            timeout_secs: default_http_timeout_secs(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            min_interval_minutes: default_min_interval(),
            max_interval_minutes: default_max_interval(),
            validation_delay_ms: default_validation_delay_ms(),
            default_country_code: None,
            progress_log_capacity: default_progress_log_capacity(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let (config_path, workspace_dir) = default_paths();
        Self {
            workspace_dir,
            config_path,
            server: ServerConfig::default(),
            messaging: MessagingConfig::default(),
            directory: DirectoryConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

/// Platform config dir (e.g. `~/.config/leadcaster`), falling back to
/// `./leadcaster` when no home directory can be resolved.
fn default_paths() -> (PathBuf, PathBuf) {
    let base = std::env::var_os("LEADCASTER_DIR")
        .map(PathBuf::from)
        .or_else(|| {
            directories::ProjectDirs::from("", "", "leadcaster")
                .map(|dirs| dirs.config_dir().to_path_buf())
        })
        .unwrap_or_else(|| PathBuf::from("leadcaster"));

    (base.join("config.toml"), base.join("workspace"))
}

impl Config {
    /// Load configuration, creating the workspace directory as needed.
    /// A missing config file yields the defaults (first run).
    pub fn load(config_dir: Option<&Path>) -> Result<Self> {
        let (config_path, workspace_dir) = match config_dir {
            Some(dir) => (dir.join("config.toml"), dir.join("workspace")),
            None => default_paths(),
        };

        let mut config = if config_path.exists() {
            let raw = std::fs::read_to_string(&config_path).with_context(|| {
                format!("Failed to read config file: {}", config_path.display())
            })?;
            toml::from_str::<Config>(&raw).with_context(|| {
                format!("Failed to parse config file: {}", config_path.display())
            })?
        } else {
            Config {
                config_path: config_path.clone(),
                workspace_dir: workspace_dir.clone(),
                ..Config::default()
            }
        };

        config.config_path = config_path;
        config.workspace_dir = workspace_dir;

        std::fs::create_dir_all(&config.workspace_dir).with_context(|| {
            format!(
                "Failed to create workspace directory: {}",
                config.workspace_dir.display()
            )
        })?;

        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;
        if let Some(parent) = self.config_path.parent() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        tokio::fs::write(&self.config_path, toml_str)
            .await
            .with_context(|| format!("Failed to write config: {}", self.config_path.display()))?;
        Ok(())
    }

    /// Reject configurations that would only fail later at dispatch time.
    pub fn validate(&self) -> Result<()> {
        crate::campaign::validate_intervals(
            self.dispatch.min_interval_minutes,
            self.dispatch.max_interval_minutes,
        )
        .context("Invalid [dispatch] interval bounds")?;

        if self.dispatch.progress_log_capacity == 0 {
            anyhow::bail!("[dispatch] progress_log_capacity must be at least 1");
        }
        if self.messaging.base_url.trim().is_empty() {
            anyhow::bail!("[messaging] base_url must not be empty");
        }
        Ok(())
    }
}
