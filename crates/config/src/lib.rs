//! Configuration file handling for `~/.tabs/config.toml`.
//!
//! Sections mirror the processes that consume them: `[local]` for the
//! loopback UI server and cleanup, `[remote]` for uploads, `[cursor]` and
//! `[claude_code]` for the two capture adapters. All mutation goes through
//! [`apply_set`], which owns the validation rules.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("{0}")]
    Invalid(String),
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub local: LocalConfig,
    pub remote: RemoteConfig,
    pub cursor: CursorConfig,
    pub claude_code: ClaudeCodeConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    pub ui_port: u16,
    pub log_level: String,
    /// 0 = keep forever, >0 = delete empty sessions older than N hours.
    pub empty_session_retention_hours: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub server_url: String,
    pub api_key: String,
    pub auto_push: bool,
    pub default_tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CursorConfig {
    pub db_path: String,
    pub poll_interval: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaudeCodeConfig {
    pub projects_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local: LocalConfig::default(),
            remote: RemoteConfig::default(),
            cursor: CursorConfig::default(),
            claude_code: ClaudeCodeConfig::default(),
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            ui_port: 3787,
            log_level: "info".to_string(),
            empty_session_retention_hours: 24,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            api_key: String::new(),
            auto_push: false,
            default_tags: Vec::new(),
        }
    }
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            db_path: String::new(),
            poll_interval: 2,
        }
    }
}

impl Default for ClaudeCodeConfig {
    fn default() -> Self {
        Self {
            projects_dir: String::new(),
        }
    }
}

/// Default config file location: `~/.tabs/config.toml`.
pub fn config_path() -> Result<PathBuf> {
    let home = std::env::var("HOME")
        .map_err(|_| invalid("HOME is not set"))?;
    Ok(PathBuf::from(home).join(".tabs").join("config.toml"))
}

pub fn load(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)?;
    Ok(toml::from_str(&contents)?)
}

/// Load the config, falling back to defaults when the file does not exist.
pub fn load_or_default(path: &Path) -> Result<Config> {
    match load(path) {
        Ok(cfg) => Ok(cfg),
        Err(ConfigError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
            Ok(Config::default())
        }
        Err(err) => Err(err),
    }
}

pub fn write(path: &Path, cfg: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let contents = toml::to_string_pretty(cfg)?;
    fs::write(path, contents)?;
    Ok(())
}

fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase().replace('-', "_")
}

/// Apply a single `key = value` update with validation. Accepts both the
/// section-qualified form (`remote.api_key`) and the bare key.
pub fn apply_set(cfg: &mut Config, key: &str, raw: &str) -> Result<()> {
    match normalize_key(key).as_str() {
        "remote.server_url" | "server_url" => {
            let value = raw.trim();
            if !value.is_empty() && !value.starts_with("https://") {
                return Err(invalid("server_url must start with https://"));
            }
            cfg.remote.server_url = value.to_string();
            Ok(())
        }
        "remote.api_key" | "api_key" => {
            let value = raw.trim();
            if !value.is_empty() && (!value.starts_with("tabs_") || value.len() < 36) {
                return Err(invalid(
                    "api_key must start with tabs_ and be at least 36 characters",
                ));
            }
            cfg.remote.api_key = value.to_string();
            Ok(())
        }
        "remote.auto_push" | "auto_push" => {
            cfg.remote.auto_push = match raw.trim() {
                "true" => true,
                "false" => false,
                _ => return Err(invalid("auto_push must be true or false")),
            };
            Ok(())
        }
        "remote.default_tags" | "default_tags" => {
            cfg.remote.default_tags = parse_tags(raw);
            Ok(())
        }
        "local.ui_port" | "ui_port" => {
            let port: u32 = raw
                .trim()
                .parse()
                .map_err(|_| invalid("ui_port must be a number"))?;
            if !(1024..=65535).contains(&port) {
                return Err(invalid("ui_port must be between 1024 and 65535"));
            }
            cfg.local.ui_port = port as u16;
            Ok(())
        }
        "local.log_level" | "log_level" => {
            let level = raw.trim().to_lowercase();
            match level.as_str() {
                "debug" | "info" | "warn" | "error" => {
                    cfg.local.log_level = level;
                    Ok(())
                }
                "" => Err(invalid("log_level cannot be empty")),
                _ => Err(invalid("log_level must be one of: debug, info, warn, error")),
            }
        }
        "local.empty_session_retention_hours" | "empty_session_retention_hours" => {
            let hours: i64 = raw
                .trim()
                .parse()
                .map_err(|_| invalid("empty_session_retention_hours must be a number"))?;
            if hours < 0 {
                return Err(invalid("empty_session_retention_hours must be >= 0"));
            }
            cfg.local.empty_session_retention_hours = hours;
            Ok(())
        }
        "cursor.db_path" | "db_path" => {
            cfg.cursor.db_path = expand_home(raw.trim());
            Ok(())
        }
        "cursor.poll_interval" | "poll_interval" => {
            let interval: u64 = raw
                .trim()
                .parse()
                .map_err(|_| invalid("poll_interval must be a number"))?;
            if !(1..=60).contains(&interval) {
                return Err(invalid("poll_interval must be between 1 and 60"));
            }
            cfg.cursor.poll_interval = interval;
            Ok(())
        }
        "claude_code.projects_dir" | "projects_dir" => {
            cfg.claude_code.projects_dir = expand_home(raw.trim());
            Ok(())
        }
        _ => Err(ConfigError::UnknownKey(key.to_string())),
    }
}

fn parse_tags(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if trimmed.starts_with('[') && trimmed.ends_with(']') {
        if let Ok(tags) = serde_json::from_str::<Vec<String>>(trimmed) {
            return tags;
        }
    }
    trimmed
        .split(',')
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

pub fn expand_home(path: &str) -> String {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            if path == "~" {
                return home;
            }
            return format!("{}/{}", home.trim_end_matches('/'), &path[2..]);
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.local.ui_port, 3787);
        assert_eq!(cfg.local.log_level, "info");
        assert_eq!(cfg.local.empty_session_retention_hours, 24);
        assert_eq!(cfg.cursor.poll_interval, 2);
        assert!(cfg.remote.server_url.is_empty());
    }

    #[test]
    fn load_or_default_handles_missing_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cfg = load_or_default(&dir.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config.toml");
        let mut cfg = Config::default();
        cfg.remote.server_url = "https://tabs.example.com".to_string();
        cfg.remote.default_tags = vec!["team:infra".to_string()];
        cfg.cursor.poll_interval = 5;
        write(&path, &cfg).expect("write config");
        let loaded = load(&path).expect("load config");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn load_tolerates_partial_files() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[local]\nui_port = 4000\n").expect("write");
        let cfg = load(&path).expect("load");
        assert_eq!(cfg.local.ui_port, 4000);
        assert_eq!(cfg.local.log_level, "info");
    }

    #[test]
    fn apply_set_validates_server_url() {
        let mut cfg = Config::default();
        assert!(apply_set(&mut cfg, "server_url", "http://insecure").is_err());
        apply_set(&mut cfg, "server_url", "https://tabs.example.com").expect("set url");
        assert_eq!(cfg.remote.server_url, "https://tabs.example.com");
        apply_set(&mut cfg, "remote.server_url", "").expect("clear url");
        assert!(cfg.remote.server_url.is_empty());
    }

    #[test]
    fn apply_set_validates_api_key() {
        let mut cfg = Config::default();
        assert!(apply_set(&mut cfg, "api_key", "sk-wrong-prefix").is_err());
        assert!(apply_set(&mut cfg, "api_key", "tabs_short").is_err());
        let key = format!("tabs_{}", "a".repeat(32));
        apply_set(&mut cfg, "api_key", &key).expect("set key");
        assert_eq!(cfg.remote.api_key, key);
    }

    #[test]
    fn apply_set_validates_port_range() {
        let mut cfg = Config::default();
        assert!(apply_set(&mut cfg, "ui_port", "80").is_err());
        assert!(apply_set(&mut cfg, "ui_port", "70000").is_err());
        assert!(apply_set(&mut cfg, "ui_port", "nope").is_err());
        apply_set(&mut cfg, "ui_port", "8099").expect("set port");
        assert_eq!(cfg.local.ui_port, 8099);
    }

    #[test]
    fn apply_set_validates_poll_interval() {
        let mut cfg = Config::default();
        assert!(apply_set(&mut cfg, "poll_interval", "0").is_err());
        assert!(apply_set(&mut cfg, "poll_interval", "61").is_err());
        apply_set(&mut cfg, "cursor.poll-interval", "10").expect("set interval");
        assert_eq!(cfg.cursor.poll_interval, 10);
    }

    #[test]
    fn apply_set_validates_log_level() {
        let mut cfg = Config::default();
        assert!(apply_set(&mut cfg, "log_level", "verbose").is_err());
        apply_set(&mut cfg, "log_level", "DEBUG").expect("set level");
        assert_eq!(cfg.local.log_level, "debug");
    }

    #[test]
    fn apply_set_rejects_unknown_keys() {
        let mut cfg = Config::default();
        assert!(matches!(
            apply_set(&mut cfg, "nonsense", "1"),
            Err(ConfigError::UnknownKey(_))
        ));
    }

    #[test]
    fn default_tags_accept_json_and_comma_lists() {
        let mut cfg = Config::default();
        apply_set(&mut cfg, "default_tags", r#"["team:infra","env:dev"]"#).expect("json tags");
        assert_eq!(cfg.remote.default_tags, vec!["team:infra", "env:dev"]);
        apply_set(&mut cfg, "default_tags", "a:1, b:2").expect("comma tags");
        assert_eq!(cfg.remote.default_tags, vec!["a:1", "b:2"]);
    }
}
