//! autoreply configuration loader.
//!
//! Every section is optional: an empty file (or no file at the default path)
//! yields a runnable configuration with the bot inactive.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::settings::SettingKey;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    /// Seeds for the live settings table; only keys not yet stored are written.
    #[serde(default)]
    pub bot: BotSeedConfig,
    /// Values from the environment; these overwrite stored settings at startup.
    #[serde(skip)]
    pub bot_overrides: BTreeMap<SettingKey, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
    /// Start the engine together with the HTTP surface.
    #[serde(default = "default_true")]
    pub autostart_bot: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
            autostart_bot: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_inactive_sleep_seconds")]
    pub inactive_sleep_seconds: u64,
    #[serde(default = "default_disconnected_sleep_seconds")]
    pub disconnected_sleep_seconds: u64,
    #[serde(default = "default_error_backoff_seconds")]
    pub error_backoff_seconds: u64,
    /// Messages at least this old are never answered.
    #[serde(default = "default_freshness_window_seconds")]
    pub freshness_window_seconds: u64,
    #[serde(default = "default_fetch_count")]
    pub fetch_count: usize,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default)]
    pub reply_to_groups: bool,
    /// Sent when no generation API key is configured.
    #[serde(default = "default_config_error_reply")]
    pub config_error_reply: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval_seconds(),
            inactive_sleep_seconds: default_inactive_sleep_seconds(),
            disconnected_sleep_seconds: default_disconnected_sleep_seconds(),
            error_backoff_seconds: default_error_backoff_seconds(),
            freshness_window_seconds: default_freshness_window_seconds(),
            fetch_count: default_fetch_count(),
            history_limit: default_history_limit(),
            reply_to_groups: false,
            config_error_reply: default_config_error_reply(),
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn inactive_sleep(&self) -> Duration {
        Duration::from_secs(self.inactive_sleep_seconds)
    }

    pub fn disconnected_sleep(&self) -> Duration {
        Duration::from_secs(self.disconnected_sleep_seconds)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_seconds)
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_window_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    /// Fallback chain, tried in order when a model reports zero allowance.
    #[serde(default = "default_models")]
    pub models: Vec<String>,
    #[serde(default = "default_max_calls_per_minute")]
    pub max_calls_per_minute: u32,
    #[serde(default = "default_max_calls_per_day")]
    pub max_calls_per_day: u32,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default)]
    pub apology_reply: Option<String>,
    /// Override for the Gemini REST base URL.
    #[serde(default)]
    pub api_base: Option<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            models: default_models(),
            max_calls_per_minute: default_max_calls_per_minute(),
            max_calls_per_day: default_max_calls_per_day(),
            system_prompt: default_system_prompt(),
            apology_reply: None,
            api_base: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BotSeedConfig {
    pub active: Option<bool>,
    pub transport_base_url: Option<String>,
    pub transport_token: Option<String>,
    pub transport_instance_name: Option<String>,
    pub generation_api_key: Option<String>,
}

impl BotSeedConfig {
    pub fn entries(&self) -> Vec<(SettingKey, String)> {
        let mut entries = Vec::new();
        if let Some(active) = self.active {
            entries.push((SettingKey::Active, active.to_string()));
        }
        let strings = [
            (SettingKey::TransportBaseUrl, &self.transport_base_url),
            (SettingKey::TransportToken, &self.transport_token),
            (SettingKey::TransportInstanceName, &self.transport_instance_name),
            (SettingKey::GenerationApiKey, &self.generation_api_key),
        ];
        for (key, value) in strings {
            if let Some(value) = value.as_ref().filter(|v| !v.trim().is_empty()) {
                entries.push((key, value.trim().to_string()));
            }
        }
        entries
    }
}

fn default_db_path() -> PathBuf {
    default_data_dir().join("autoreply.db")
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_http_max_in_flight() -> usize {
    64
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_seconds() -> u64 {
    5
}

fn default_inactive_sleep_seconds() -> u64 {
    5
}

fn default_disconnected_sleep_seconds() -> u64 {
    10
}

fn default_error_backoff_seconds() -> u64 {
    10
}

fn default_freshness_window_seconds() -> u64 {
    120
}

fn default_fetch_count() -> usize {
    10
}

fn default_history_limit() -> usize {
    10
}

pub const DEFAULT_CONFIG_ERROR_REPLY: &str = "⚠️ O atendimento automático ainda não foi configurado. Um atendente responderá em breve.";

fn default_config_error_reply() -> String {
    DEFAULT_CONFIG_ERROR_REPLY.to_string()
}

fn default_models() -> Vec<String> {
    vec![
        "gemini-2.0-flash".to_string(),
        "gemini-2.0-flash-lite".to_string(),
        "gemini-1.5-flash".to_string(),
    ]
}

fn default_max_calls_per_minute() -> u32 {
    12
}

fn default_max_calls_per_day() -> u32 {
    1400
}

fn default_system_prompt() -> String {
    "Você é um assistente de atendimento pelo WhatsApp. Responda em português, \
     de forma breve, educada e objetiva."
        .to_string()
}

impl AppConfig {
    /// An explicit path must exist; a missing default path falls back to defaults.
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let explicit = path.is_some();
        let path = path.unwrap_or_else(default_config_path);
        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Self::parse(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound && !explicit => {
                tracing::warn!(
                    path = %path.display(),
                    "config file not found; using defaults (run `autoreply init` to create one)"
                );
                Self::default()
            }
            Err(err) => {
                return Err(anyhow::anyhow!("read config {}: {err}", path.display()));
            }
        };

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("AUTOREPLY_DB_PATH") {
            if !v.trim().is_empty() {
                self.store.path = PathBuf::from(v.trim());
            }
        }
        if let Ok(v) = std::env::var("AUTOREPLY_BIND") {
            if !v.trim().is_empty() {
                self.server.bind = v.trim().to_string();
            }
        }
        let settings_env = [
            ("EVOLUTION_API_URL", SettingKey::TransportBaseUrl),
            ("EVOLUTION_API_TOKEN", SettingKey::TransportToken),
            ("EVOLUTION_INSTANCE", SettingKey::TransportInstanceName),
            ("GEMINI_API_KEY", SettingKey::GenerationApiKey),
        ];
        for (var, key) in settings_env {
            if let Ok(v) = std::env::var(var) {
                if !v.trim().is_empty() {
                    self.bot_overrides.insert(key, v.trim().to_string());
                }
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.server.bind.parse::<SocketAddr>().is_err() {
            return Err(anyhow::anyhow!(
                "server.bind must be a socket address, got {:?}",
                self.server.bind
            ));
        }
        if self.server.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("server.http_max_in_flight must be > 0"));
        }
        if self.engine.poll_interval_seconds == 0 {
            return Err(anyhow::anyhow!("engine.poll_interval_seconds must be > 0"));
        }
        if self.engine.fetch_count == 0 {
            return Err(anyhow::anyhow!("engine.fetch_count must be > 0"));
        }
        if self.engine.freshness_window_seconds == 0 {
            return Err(anyhow::anyhow!(
                "engine.freshness_window_seconds must be > 0"
            ));
        }
        if self.generation.models.iter().all(|m| m.trim().is_empty()) {
            return Err(anyhow::anyhow!(
                "generation.models must name at least one model"
            ));
        }
        if self.generation.max_calls_per_minute == 0 || self.generation.max_calls_per_day == 0 {
            return Err(anyhow::anyhow!(
                "generation.max_calls_per_minute and generation.max_calls_per_day must be > 0"
            ));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server
            .bind
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid server.bind {:?}: {e}", self.server.bind))
    }
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".to_string()))
}

pub fn default_config_path() -> PathBuf {
    Path::new(&home_dir()).join(".autoreply").join("config.toml")
}

pub fn default_data_dir() -> PathBuf {
    Path::new(&home_dir()).join(".autoreply").join("data")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = AppConfig::parse("").expect("parse");
        assert_eq!(cfg.server.bind, "127.0.0.1:8787");
        assert_eq!(cfg.engine.freshness_window(), Duration::from_secs(120));
        assert_eq!(cfg.engine.fetch_count, 10);
        assert_eq!(cfg.generation.max_calls_per_minute, 12);
        assert_eq!(cfg.generation.max_calls_per_day, 1400);
        assert_eq!(cfg.generation.models.len(), 3);
        assert!(cfg.bot.entries().is_empty());
        cfg.validate().expect("defaults validate");
    }

    #[test]
    fn bot_seed_entries_skip_blank_values() {
        let cfg = AppConfig::parse(
            r#"
[bot]
active = true
transport_base_url = " https://evo.example.com "
transport_token = ""
transport_instance_name = "loja"
"#,
        )
        .expect("parse");
        assert_eq!(
            cfg.bot.entries(),
            vec![
                (SettingKey::Active, "true".to_string()),
                (
                    SettingKey::TransportBaseUrl,
                    "https://evo.example.com".to_string()
                ),
                (SettingKey::TransportInstanceName, "loja".to_string()),
            ]
        );
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = AppConfig::parse("[server]\nbind = \"localhost\"").expect("parse");
        assert!(cfg.validate().is_err());

        cfg.server.bind = "0.0.0.0:9000".to_string();
        cfg.validate().expect("valid bind");

        cfg.generation.models = vec![" ".to_string()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_sections_fail_to_parse_as_wrong_types() {
        assert!(AppConfig::parse("[engine]\nfetch_count = \"ten\"").is_err());
    }

    #[tokio::test]
    async fn explicit_missing_path_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope.toml");
        assert!(AppConfig::load(Some(missing)).await.is_err());
    }

    #[tokio::test]
    async fn loads_an_explicit_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[engine]\nfetch_count = 25\nreply_to_groups = true\n[generation]\nmodels = [\"m1\"]\n",
        )
        .expect("write config");

        let cfg = AppConfig::load(Some(path)).await.expect("load");
        assert_eq!(cfg.engine.fetch_count, 25);
        assert!(cfg.engine.reply_to_groups);
        assert_eq!(cfg.generation.models, vec!["m1".to_string()]);
    }
}
