//! Configuration file: `[general]`, `[server]`, `[pool]`,
//! `[auth]`, `[cache]` sections, TOML or YAML by extension, globally
//! available behind an `ArcSwap` the same way the reference pooler
//! publishes its config (`config::CONFIG`).

use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Configuration file format, detected from the file extension the way
/// the reference pooler's `ConfigFormat::detect` does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Yaml,
}

impl ConfigFormat {
    pub fn detect(path: &str) -> Self {
        let lower = path.to_lowercase();
        if lower.ends_with(".yaml") || lower.ends_with(".yml") {
            ConfigFormat::Yaml
        } else {
            ConfigFormat::Toml
        }
    }
}

fn parse_content<T: serde::de::DeserializeOwned>(
    contents: &str,
    format: ConfigFormat,
) -> Result<T, ConfigError> {
    match format {
        ConfigFormat::Toml => {
            toml::from_str(contents).map_err(|err| ConfigError::Toml(err.to_string()))
        }
        ConfigFormat::Yaml => {
            serde_yaml::from_str(contents).map_err(|err| ConfigError::Yaml(err.to_string()))
        }
    }
}

static CONFIG: Lazy<ArcSwap<Config>> = Lazy::new(|| ArcSwap::from_pointee(Config::default()));

pub fn get_config() -> Arc<Config> {
    CONFIG.load_full()
}

pub fn set_config(config: Config) {
    CONFIG.store(Arc::new(config));
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralSection {
    /// Name of the single database this server exposes; `DB_OPEN` opens a
    /// `Database` against this name.
    #[serde(default = "GeneralSection::default_database_name")]
    pub database_name: String,
    /// If set, logs go to syslog under this program name instead of
    /// stdout.
    #[serde(default)]
    pub syslog_prog_name: Option<String>,
}

impl GeneralSection {
    fn default_database_name() -> String {
        "grafdoor".to_string()
    }
}

impl Default for GeneralSection {
    fn default() -> Self {
        GeneralSection {
            database_name: Self::default_database_name(),
            syslog_prog_name: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    #[serde(default = "ServerSection::default_host")]
    pub host: String,
    #[serde(default = "ServerSection::default_port")]
    pub port: u16,
    #[serde(default = "ServerSection::default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default = "ServerSection::default_min_protocol_version")]
    pub min_protocol_version: i16,
    #[serde(default = "ServerSection::default_max_protocol_version")]
    pub max_protocol_version: i16,
}

impl ServerSection {
    fn default_host() -> String {
        "0.0.0.0".to_string()
    }

    fn default_port() -> u16 {
        2424
    }

    fn default_worker_threads() -> usize {
        num_cpus::get()
    }

    fn default_min_protocol_version() -> i16 {
        crate::session::MIN_PROTOCOL_VERSION
    }

    fn default_max_protocol_version() -> i16 {
        24
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        ServerSection {
            host: Self::default_host(),
            port: Self::default_port(),
            worker_threads: Self::default_worker_threads(),
            min_protocol_version: Self::default_min_protocol_version(),
            max_protocol_version: Self::default_max_protocol_version(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolSection {
    #[serde(default = "PoolSection::default_max_size")]
    pub max_size: u64,
    #[serde(default = "PoolSection::default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "PoolSection::default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

impl PoolSection {
    fn default_max_size() -> u64 {
        40
    }

    fn default_connect_timeout_ms() -> u64 {
        5_000
    }

    fn default_idle_timeout_ms() -> u64 {
        600_000
    }
}

impl Default for PoolSection {
    fn default() -> Self {
        PoolSection {
            max_size: Self::default_max_size(),
            connect_timeout_ms: Self::default_connect_timeout_ms(),
            idle_timeout_ms: Self::default_idle_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AuthSection {
    /// Open Question 1 (DESIGN.md): recovery login only works when this
    /// is explicitly enabled.
    #[serde(default)]
    pub allow_admin_repair: bool,
    #[serde(default)]
    pub users: Vec<ConfiguredUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfiguredUser {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheSection {
    #[serde(default = "CacheSection::default_capacity")]
    pub capacity: usize,
    #[serde(default = "CacheSection::default_mvcc_enabled")]
    pub mvcc_enabled: bool,
}

impl CacheSection {
    fn default_capacity() -> usize {
        10_000
    }

    fn default_mvcc_enabled() -> bool {
        true
    }
}

impl Default for CacheSection {
    fn default() -> Self {
        CacheSection {
            capacity: Self::default_capacity(),
            mvcc_enabled: Self::default_mvcc_enabled(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub cache: CacheSection,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let format = ConfigFormat::detect(path);
        let contents = std::fs::read_to_string(Path::new(path))
            .map_err(|err| ConfigError::Invalid(format!("reading {path}: {err}")))?;
        let config: Config = parse_content(&contents, format)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.min_protocol_version > self.server.max_protocol_version {
            return Err(ConfigError::Invalid(format!(
                "server.min_protocol_version ({}) must not exceed server.max_protocol_version ({})",
                self.server.min_protocol_version, self.server.max_protocol_version
            )));
        }
        if self.pool.max_size == 0 {
            return Err(ConfigError::Invalid(
                "pool.max_size must be greater than zero".to_string(),
            ));
        }
        if self.general.database_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "general.database_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn protocol_version_range_is_checked() {
        let mut config = Config::default();
        config.server.min_protocol_version = 20;
        config.server.max_protocol_version = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trips_through_parse_content() {
        let toml = r#"
            [general]
            database_name = "demo"

            [server]
            port = 3434
        "#;
        let config: Config = parse_content(toml, ConfigFormat::Toml).unwrap();
        assert_eq!(config.general.database_name, "demo");
        assert_eq!(config.server.port, 3434);
    }

    #[test]
    fn format_detection_prefers_yaml_extensions() {
        assert_eq!(ConfigFormat::detect("a.yaml"), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::detect("a.yml"), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::detect("a.toml"), ConfigFormat::Toml);
    }
}
