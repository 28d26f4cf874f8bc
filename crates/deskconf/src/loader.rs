//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, DeskConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
/// Returns paths in load order (system, user, local/cli).
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    // System config
    let system = PathBuf::from("/etc/deskhand/config.toml");
    if system.exists() {
        files.push(system);
    }

    // User config (XDG_CONFIG_HOME or ~/.config)
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("deskhand/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    // CLI override takes precedence over local
    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    // Local override (current directory)
    let local = PathBuf::from("deskhand.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load a TOML file as a raw table.
pub fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    contents
        .parse()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Merge `overlay` into `base`, key by key. Nested tables merge recursively;
/// any other value in the overlay replaces the base value.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(base_sub)), toml::Value::Table(overlay_sub)) => {
                merge_tables(base_sub, overlay_sub);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut DeskConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("DESKHAND_LOCAL_PORT") {
        if let Ok(port) = v.parse() {
            config.osc.local_port = port;
            sources.env_overrides.push("DESKHAND_LOCAL_PORT".to_string());
        }
    }
    if let Ok(v) = env::var("DESKHAND_REMOTE_PORT") {
        if let Ok(port) = v.parse() {
            config.osc.remote_port = port;
            sources.env_overrides.push("DESKHAND_REMOTE_PORT".to_string());
        }
    }
    if let Ok(v) = env::var("DESKHAND_REMOTE_HOST") {
        config.osc.remote_host = v;
        sources.env_overrides.push("DESKHAND_REMOTE_HOST".to_string());
    }
    if let Ok(v) = env::var("DESKHAND_HTTP_PORT") {
        if let Ok(port) = v.parse() {
            config.bind.http_port = port;
            sources.env_overrides.push("DESKHAND_HTTP_PORT".to_string());
        }
    }

    if let Ok(v) = env::var("DESKHAND_LOG_LEVEL") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("DESKHAND_LOG_LEVEL".to_string());
    }
    // Also support RUST_LOG
    if let Ok(v) = env::var("RUST_LOG") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }

    if let Ok(v) = env::var("DESKHAND_MODEL") {
        config.agent.model = v;
        sources.env_overrides.push("DESKHAND_MODEL".to_string());
    }
    if let Ok(v) = env::var("DESKHAND_API_BASE") {
        config.agent.api_base = v;
        sources.env_overrides.push("DESKHAND_API_BASE".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(contents: &str) -> DeskConfig {
        let table: toml::Table = contents.parse().unwrap();
        toml::Value::Table(table).try_into().unwrap()
    }

    #[test]
    fn test_discover_config_files() {
        // Just verify it doesn't panic
        let _files = discover_config_files();
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config = parse(
            r#"
[osc]
remote_host = "10.0.0.5"
"#,
        );
        assert_eq!(config.osc.remote_host, "10.0.0.5");
        // Other values should be defaults
        assert_eq!(config.osc.local_port, 11001);
        assert_eq!(config.observer.debounce_ms, 500);
    }

    #[test]
    fn test_parse_full_toml() {
        let config = parse(
            r#"
[osc]
local_port = 9001
remote_port = 9000
remote_host = "studio.local"
liveness_timeout_ms = 10000
query_timeout_ms = 1000

[observer]
history_window_secs = 60
debounce_ms = 250

[bind]
http_port = 9090

[telemetry]
log_level = "debug"

[agent]
model = "claude-test"
max_tokens = 1024
"#,
        );

        assert_eq!(config.osc.local_port, 9001);
        assert_eq!(config.osc.remote_port, 9000);
        assert_eq!(config.osc.remote_host, "studio.local");
        assert_eq!(config.osc.liveness_timeout_ms, 10000);
        assert_eq!(config.osc.query_timeout_ms, 1000);
        assert_eq!(config.observer.history_window_secs, 60);
        assert_eq!(config.observer.debounce_ms, 250);
        assert_eq!(config.bind.http_port, 9090);
        assert_eq!(config.telemetry.log_level, "debug");
        assert_eq!(config.agent.model, "claude-test");
        assert_eq!(config.agent.max_tokens, 1024);
    }

    #[test]
    fn test_merge_later_wins() {
        let mut base: toml::Table = r#"
[osc]
local_port = 9001
remote_host = "first.local"
"#
        .parse()
        .unwrap();
        let overlay: toml::Table = r#"
[osc]
remote_host = "second.local"

[bind]
http_port = 7000
"#
        .parse()
        .unwrap();

        merge_tables(&mut base, overlay);
        let config: DeskConfig = toml::Value::Table(base).try_into().unwrap();

        // Overlay replaced the host but kept the base port
        assert_eq!(config.osc.remote_host, "second.local");
        assert_eq!(config.osc.local_port, 9001);
        assert_eq!(config.bind.http_port, 7000);
    }

    #[test]
    fn test_load_table_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[osc]\nlocal_port = 4242").unwrap();

        let table = load_table(file.path()).unwrap();
        assert!(table.contains_key("osc"));
    }

    #[test]
    fn test_load_table_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not [ valid toml").unwrap();

        let err = load_table(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
