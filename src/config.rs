//! Configuration for the server.
//!
//! Settings live in a TOML file under a `configuration` table and are read
//! through [`ConfigSource`], a dotted key-path view of the file
//! (`configuration.server.port`). Command-line arguments take precedence:
//! they are written into the source before the final [`Config`] is resolved,
//! so `--write-config` saves exactly what the server runs with.

use clap::Parser;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use toml::{Table, Value};

use crate::protocol::PayloadKind;

/// Config file read when `--config` is not given, if it exists.
pub const DEFAULT_CONFIG_PATH: &str = "server.toml";

pub const PORT_KEY: &str = "configuration.server.port";
pub const HOST_KEY: &str = "configuration.server.host";
pub const DEFAULT_PAYLOAD_KEY: &str = "configuration.server.default_payload";
pub const LIMITS_KEY: &str = "configuration.limits";
pub const STORAGE_KEY: &str = "configuration.storage";
pub const LOGGING_KEY: &str = "configuration.logging";
const LOG_LEVEL_KEY: &str = "configuration.logging.level";

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "service-server")]
#[command(version = "0.1.0")]
#[command(about = "A line-framed request/response server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file (defaults to ./server.toml if present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (defaults to all local addresses)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Write the effective configuration to this path before starting
    #[arg(long)]
    pub write_config: Option<PathBuf>,
}

/// Frame size limits
#[derive(Debug, Deserialize, PartialEq)]
pub struct LimitsConfig {
    /// Bytes allowed before the header's blank-line sentinel must appear
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
    /// Largest declared body accepted
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_header_bytes: default_max_header_bytes(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Storage used by the file payload handler
#[derive(Debug, Deserialize, PartialEq)]
pub struct StorageConfig {
    #[serde(default = "default_file_root")]
    pub file_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            file_root: default_file_root(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_max_header_bytes() -> usize {
    64 * 1024 // 64 KB
}

fn default_max_body_bytes() -> usize {
    16 * 1024 * 1024 // 16 MB
}

fn default_file_root() -> PathBuf {
    PathBuf::from("./files")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Key-path view over a TOML configuration tree.
#[derive(Debug, Clone, Default)]
pub struct ConfigSource {
    tree: Table,
}

impl ConfigSource {
    /// Read and parse a configuration file.
    pub fn open(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents).map_err(|source| ConfigError::TomlParse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        Ok(Self {
            tree: toml::from_str(contents)?,
        })
    }

    /// Look up a scalar by dotted key path and render it as a string.
    ///
    /// Tables, arrays and missing keys yield `None`.
    pub fn get(&self, key: &str) -> Option<String> {
        match self.lookup(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Integer(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Boolean(b) => Some(b.to_string()),
            Value::Datetime(d) => Some(d.to_string()),
            Value::Array(_) | Value::Table(_) => None,
        }
    }

    /// Set a string leaf, creating (or replacing non-table) intermediate nodes.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let mut segments: Vec<&str> = key.split('.').collect();
        let Some(leaf) = segments.pop() else {
            return;
        };

        let mut table = &mut self.tree;
        for segment in segments {
            let entry = table
                .entry(segment.to_string())
                .or_insert(Value::Table(Table::new()));
            if !entry.is_table() {
                *entry = Value::Table(Table::new());
            }
            let Value::Table(next) = entry else {
                return;
            };
            table = next;
        }
        table.insert(leaf.to_string(), Value::String(value.into()));
    }

    /// Deserialize the table at `key`. An absent table yields `T::default()`.
    pub fn section<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T, ConfigError> {
        match self.lookup(key) {
            None => Ok(T::default()),
            Some(value) => value
                .clone()
                .try_into()
                .map_err(|source| ConfigError::Section {
                    key: key.to_string(),
                    source,
                }),
        }
    }

    /// Write the tree to `path` as TOML.
    pub fn flush(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(&self.tree)?;
        std::fs::write(path, contents).map_err(|source| ConfigError::FileWrite {
            path: path.to_path_buf(),
            source,
        })
    }

    fn lookup(&self, key: &str) -> Option<&Value> {
        let mut segments = key.split('.');
        let mut value = self.tree.get(segments.next()?)?;
        for segment in segments {
            value = value.as_table()?.get(segment)?;
        }
        Some(value)
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub default_payload: PayloadKind,
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
    pub file_root: PathBuf,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and the TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let mut source = match cli.config {
            Some(ref path) => ConfigSource::open(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                ConfigSource::open(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => ConfigSource::default(),
        };

        if let Some(host) = cli.host {
            source.set(HOST_KEY, host);
        }
        if let Some(port) = cli.port {
            source.set(PORT_KEY, port.to_string());
        }
        if let Some(level) = cli.log_level {
            source.set(LOG_LEVEL_KEY, level);
        }
        if let Some(ref path) = cli.write_config {
            source.flush(path)?;
        }

        Self::from_source(&source)
    }

    /// Resolve the configuration from a source. The port is required.
    pub fn from_source(source: &ConfigSource) -> Result<Self, ConfigError> {
        let port_text = source.get(PORT_KEY).ok_or(ConfigError::MissingKey(PORT_KEY))?;
        let port = port_text
            .trim()
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidValue {
                key: PORT_KEY,
                value: port_text.clone(),
            })?;

        let default_payload = match source.get(DEFAULT_PAYLOAD_KEY) {
            Some(tag) => tag.parse().map_err(|_| ConfigError::InvalidValue {
                key: DEFAULT_PAYLOAD_KEY,
                value: tag.clone(),
            })?,
            None => PayloadKind::String,
        };

        let limits: LimitsConfig = source.section(LIMITS_KEY)?;
        let storage: StorageConfig = source.section(STORAGE_KEY)?;
        let logging: LoggingConfig = source.section(LOGGING_KEY)?;

        Ok(Config {
            host: source.get(HOST_KEY).unwrap_or_else(default_host),
            port,
            default_payload,
            max_header_bytes: limits.max_header_bytes,
            max_body_bytes: limits.max_body_bytes,
            file_root: storage.file_root,
            log_level: logging.level,
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid section '{key}': {source}")]
    Section {
        key: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("missing required key '{0}'")]
    MissingKey(&'static str),
    #[error("invalid value {value:?} for '{key}'")]
    InvalidValue { key: &'static str, value: String },
    #[error("failed to write config file '{}': {source}", .path.display())]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}
