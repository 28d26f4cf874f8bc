//! Minimal configuration loading for Deskhand.
//!
//! This crate provides configuration loading with minimal dependencies so the
//! transport and server crates can share one config type without dragging the
//! whole server dependency tree along.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/deskhand/config.toml` (system)
//! 2. `~/.config/deskhand/config.toml` (user)
//! 3. `./deskhand.toml` (local override, or the `--config` path)
//! 4. Environment variables (`DESKHAND_*`)
//!
//! # Example Config
//!
//! ```toml
//! [osc]
//! local_port = 11001
//! remote_port = 11000
//! remote_host = "127.0.0.1"
//!
//! [observer]
//! history_window_secs = 1800
//! debounce_ms = 500
//!
//! [bind]
//! http_port = 8090
//!
//! [telemetry]
//! log_level = "info"
//!
//! [agent]
//! model = "claude-sonnet-4-20250514"
//! ```

pub mod loader;

pub use loader::{discover_config_files_with_override, ConfigSources};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// OSC endpoint settings for talking to the DAW's remote script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OscConfig {
    /// UDP port bound locally for inbound OSC replies and notifications.
    /// Default: 11001
    #[serde(default = "OscConfig::default_local_port")]
    pub local_port: u16,

    /// UDP port the DAW's remote script listens on.
    /// Default: 11000
    #[serde(default = "OscConfig::default_remote_port")]
    pub remote_port: u16,

    /// Host the DAW runs on.
    /// Default: 127.0.0.1
    #[serde(default = "OscConfig::default_remote_host")]
    pub remote_host: String,

    /// Timeout for the liveness probe, in milliseconds.
    /// Default: 5000
    #[serde(default = "OscConfig::default_liveness_timeout_ms")]
    pub liveness_timeout_ms: u64,

    /// Timeout for routine queries, in milliseconds.
    /// Default: 2000
    #[serde(default = "OscConfig::default_query_timeout_ms")]
    pub query_timeout_ms: u64,
}

impl OscConfig {
    fn default_local_port() -> u16 {
        11001
    }

    fn default_remote_port() -> u16 {
        11000
    }

    fn default_remote_host() -> String {
        "127.0.0.1".to_string()
    }

    fn default_liveness_timeout_ms() -> u64 {
        5_000
    }

    fn default_query_timeout_ms() -> u64 {
        2_000
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// The remote endpoint as `host:port`.
    pub fn remote_addr(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }
}

impl Default for OscConfig {
    fn default() -> Self {
        Self {
            local_port: Self::default_local_port(),
            remote_port: Self::default_remote_port(),
            remote_host: Self::default_remote_host(),
            liveness_timeout_ms: Self::default_liveness_timeout_ms(),
            query_timeout_ms: Self::default_query_timeout_ms(),
        }
    }
}

/// Parameter observer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverConfig {
    /// Retention window for the parameter change history, in seconds.
    /// Default: 1800 (30 minutes)
    #[serde(default = "ObserverConfig::default_history_window_secs")]
    pub history_window_secs: u64,

    /// Debounce window for coalescing parameter bursts, in milliseconds.
    /// Default: 500
    #[serde(default = "ObserverConfig::default_debounce_ms")]
    pub debounce_ms: u64,
}

impl ObserverConfig {
    fn default_history_window_secs() -> u64 {
        1_800
    }

    fn default_debounce_ms() -> u64 {
        500
    }

    pub fn history_window(&self) -> Duration {
        Duration::from_secs(self.history_window_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            history_window_secs: Self::default_history_window_secs(),
            debounce_ms: Self::default_debounce_ms(),
        }
    }
}

/// Network bind addresses for this process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindConfig {
    /// HTTP port for the client channel and health endpoints.
    /// Default: 8090
    #[serde(default = "BindConfig::default_http_port")]
    pub http_port: u16,
}

impl BindConfig {
    fn default_http_port() -> u16 {
        8090
    }

    pub fn http_bind_addr(&self) -> String {
        format!("0.0.0.0:{}", self.http_port)
    }
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            http_port: Self::default_http_port(),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level (trace, debug, info, warn, error).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

/// Chat agent settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Model identifier passed to the completion endpoint.
    #[serde(default = "AgentConfig::default_model")]
    pub model: String,

    /// Base URL of the completion endpoint.
    #[serde(default = "AgentConfig::default_api_base")]
    pub api_base: String,

    /// Environment variable holding the API key. The key itself never lives
    /// in a config file.
    #[serde(default = "AgentConfig::default_api_key_env")]
    pub api_key_env: String,

    /// Maximum tokens per completion.
    #[serde(default = "AgentConfig::default_max_tokens")]
    pub max_tokens: u32,

    /// System prompt. Empty selects the built-in mixing-assistant prompt.
    #[serde(default)]
    pub system_prompt: String,
}

impl AgentConfig {
    fn default_model() -> String {
        "claude-sonnet-4-20250514".to_string()
    }

    fn default_api_base() -> String {
        "https://api.anthropic.com".to_string()
    }

    fn default_api_key_env() -> String {
        "ANTHROPIC_API_KEY".to_string()
    }

    fn default_max_tokens() -> u32 {
        4_096
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: Self::default_model(),
            api_base: Self::default_api_base(),
            api_key_env: Self::default_api_key_env(),
            max_tokens: Self::default_max_tokens(),
            system_prompt: String::new(),
        }
    }
}

/// Complete Deskhand configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeskConfig {
    #[serde(default)]
    pub osc: OscConfig,

    #[serde(default)]
    pub observer: ObserverConfig,

    #[serde(default)]
    pub bind: BindConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub agent: AgentConfig,
}

impl DeskConfig {
    /// Load configuration from all standard sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration, optionally from a CLI-provided file path.
    ///
    /// If `config_path` is provided it takes precedence over the local
    /// `./deskhand.toml` override. System and user configs still load first.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let table = loader::load_table(&path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let mut config: DeskConfig =
            toml::Value::Table(merged)
                .try_into()
                .map_err(|e: toml::de::Error| ConfigError::Parse {
                    path: PathBuf::from("<merged>"),
                    message: e.to_string(),
                })?;

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        // Build TOML manually for nicer formatting
        let mut output = String::new();

        output.push_str("# Deskhand Configuration\n\n");

        output.push_str("[osc]\n");
        output.push_str(&format!("local_port = {}\n", self.osc.local_port));
        output.push_str(&format!("remote_port = {}\n", self.osc.remote_port));
        output.push_str(&format!("remote_host = \"{}\"\n", self.osc.remote_host));
        output.push_str(&format!(
            "liveness_timeout_ms = {}\n",
            self.osc.liveness_timeout_ms
        ));
        output.push_str(&format!(
            "query_timeout_ms = {}\n",
            self.osc.query_timeout_ms
        ));

        output.push_str("\n[observer]\n");
        output.push_str(&format!(
            "history_window_secs = {}\n",
            self.observer.history_window_secs
        ));
        output.push_str(&format!("debounce_ms = {}\n", self.observer.debounce_ms));

        output.push_str("\n[bind]\n");
        output.push_str(&format!("http_port = {}\n", self.bind.http_port));

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!("log_level = \"{}\"\n", self.telemetry.log_level));

        output.push_str("\n[agent]\n");
        output.push_str(&format!("model = \"{}\"\n", self.agent.model));
        output.push_str(&format!("api_base = \"{}\"\n", self.agent.api_base));
        output.push_str(&format!("api_key_env = \"{}\"\n", self.agent.api_key_env));
        output.push_str(&format!("max_tokens = {}\n", self.agent.max_tokens));
        if !self.agent.system_prompt.is_empty() {
            output.push_str(&format!(
                "system_prompt = \"{}\"\n",
                self.agent.system_prompt.escape_default()
            ));
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DeskConfig::default();
        assert_eq!(config.osc.local_port, 11001);
        assert_eq!(config.osc.remote_port, 11000);
        assert_eq!(config.osc.remote_host, "127.0.0.1");
        assert_eq!(config.observer.history_window_secs, 1800);
        assert_eq!(config.observer.debounce_ms, 500);
        assert_eq!(config.osc.liveness_timeout_ms, 5000);
        assert_eq!(config.osc.query_timeout_ms, 2000);
    }

    #[test]
    fn test_to_toml() {
        let config = DeskConfig::default();
        let toml = config.to_toml();
        assert!(toml.contains("[osc]"));
        assert!(toml.contains("[observer]"));
        assert!(toml.contains("[agent]"));
        assert!(toml.contains("local_port = 11001"));
    }

    #[test]
    fn test_durations() {
        let config = DeskConfig::default();
        assert_eq!(config.osc.liveness_timeout(), Duration::from_secs(5));
        assert_eq!(config.osc.query_timeout(), Duration::from_secs(2));
        assert_eq!(config.observer.debounce(), Duration::from_millis(500));
        assert_eq!(
            config.observer.history_window(),
            Duration::from_secs(30 * 60)
        );
    }

    #[test]
    fn test_remote_addr() {
        let config = DeskConfig::default();
        assert_eq!(config.osc.remote_addr(), "127.0.0.1:11000");
    }
}
