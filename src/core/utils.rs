/// Configuration and Environment Management
///
/// Configuration is organized hierarchically (server, cache, logging, nuclei)
/// and resolved in layers:
/// 1. Built-in defaults
/// 2. A YAML file: an explicit path, or the first of `./config.yaml`,
///    `$HOME/.nuclei-mcp/config.yaml`, `/etc/nuclei-mcp/config.yaml`
/// 3. Environment variables (see `Config::apply_env`)
///
/// Command line flags are applied on top by the binary.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::core::error::ConfigError;

/// Which transports the server runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Stdio,
    Http,
    Both,
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdio" => Ok(TransportMode::Stdio),
            "http" => Ok(TransportMode::Http),
            "both" => Ok(TransportMode::Both),
            other => Err(format!("invalid transport mode '{}'. Must be 'stdio', 'http', or 'both'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server name as reported in MCP initialize responses
    pub name: String,
    /// Server version string as reported in MCP initialize responses
    pub version: String,
    pub transport: TransportMode,
    /// Bind address for HTTP mode
    pub host: String,
    pub port: u16,
    /// HTTP worker threads; defaults to the CPU count capped at 16
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "nuclei-scanner".to_string(),
            version: "1.0.0".to_string(),
            transport: TransportMode::Stdio,
            host: "127.0.0.1".to_string(),
            port: 3000,
            workers: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    #[serde(with = "humantime_duration")]
    pub expiry: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            expiry: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is not set
    pub level: String,
    /// Optional log file, appended to in addition to stderr
    pub path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NucleiConfig {
    /// Path or name of the nuclei executable
    pub binary: PathBuf,
    /// Directory managed by the template tools
    pub templates_directory: PathBuf,
    /// Directory holding the pre-provisioned basic scan template
    pub basic_templates_directory: PathBuf,
    #[serde(with = "humantime_duration")]
    pub timeout: Duration,
    pub rate_limit: u32,
    pub bulk_size: u32,
    pub template_threads: u32,
    pub headless: bool,
    pub show_browser: bool,
    pub system_resolvers: bool,
}

impl Default for NucleiConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("nuclei"),
            templates_directory: PathBuf::from("nuclei-templates"),
            basic_templates_directory: PathBuf::from("templates"),
            timeout: Duration::from_secs(10),
            rate_limit: 150,
            bulk_size: 25,
            template_threads: 25,
            headless: false,
            show_browser: false,
            system_resolvers: false,
        }
    }
}

/// Complete server configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
    pub nuclei: NucleiConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// An explicit `path` must exist. Without one, the default search paths
    /// are tried and defaults are used when none exists.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(p) => Some(p.to_path_buf()),
            None => default_config_paths().into_iter().find(|p| p.is_file()),
        };

        let mut config = match file {
            Some(p) => Self::from_file(&p)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Parse a YAML configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
        // An empty file deserializes to unit, not a mapping.
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents)
    }

    /// Apply environment overrides using `lookup` to read variables.
    ///
    /// Recognized variables:
    /// - SERVER_NAME, SERVER_VERSION
    /// - MCP_TRANSPORT_MODE: "stdio", "http", or "both"
    /// - HOST, PORT, WORKER_THREADS
    /// - NUCLEI_BINARY, NUCLEI_TEMPLATES_DIR
    /// - CACHE_EXPIRY: humantime duration such as "30m"
    /// - LOG_LEVEL, LOG_PATH
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SERVER_NAME") {
            self.server.name = v;
        }
        if let Some(v) = lookup("SERVER_VERSION") {
            self.server.version = v;
        }
        if let Some(v) = lookup("MCP_TRANSPORT_MODE") {
            self.server.transport = v.parse().map_err(|message| invalid("MCP_TRANSPORT_MODE", message))?;
        }
        if let Some(v) = lookup("HOST") {
            self.server.host = v;
        }
        if let Some(v) = lookup("PORT") {
            self.server.port = v.parse().map_err(|e| invalid("PORT", e))?;
        }
        if let Some(v) = lookup("WORKER_THREADS") {
            self.server.workers = Some(v.parse().map_err(|e| invalid("WORKER_THREADS", e))?);
        }
        if let Some(v) = lookup("NUCLEI_BINARY") {
            self.nuclei.binary = PathBuf::from(v);
        }
        if let Some(v) = lookup("NUCLEI_TEMPLATES_DIR") {
            self.nuclei.templates_directory = PathBuf::from(v);
        }
        if let Some(v) = lookup("CACHE_EXPIRY") {
            self.cache.expiry = humantime::parse_duration(&v).map_err(|e| invalid("CACHE_EXPIRY", e))?;
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("LOG_PATH") {
            self.logging.path = Some(PathBuf::from(v));
        }
        Ok(())
    }

    /// HTTP worker count: configured value, else CPU count capped at 16.
    pub fn http_workers(&self) -> usize {
        self.server.workers.unwrap_or_else(|| num_cpus::get().clamp(1, 16))
    }
}

fn invalid(key: &str, message: impl ToString) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("config.yaml")];
    if let Some(home) = std::env::var_os("HOME") {
        paths.push(PathBuf::from(home).join(".nuclei-mcp").join("config.yaml"));
    }
    paths.push(PathBuf::from("/etc/nuclei-mcp/config.yaml"));
    paths
}

/// Serde adapter for humantime duration strings ("1h", "30s", "1h 30m").
mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
