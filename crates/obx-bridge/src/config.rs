use serde::{Deserialize, Serialize};
use std::path::Path;

pub const ENV_PORT_QUEUE_CAPACITY: &str = "OBX_BRIDGE_PORT_QUEUE_CAPACITY";
pub const ENV_MAX_FINALIZERS: &str = "OBX_BRIDGE_MAX_FINALIZERS";
pub const ENV_STREAM_THREAD_NAME: &str = "OBX_BRIDGE_STREAM_THREAD_NAME";
pub const ENV_STREAM_TERMINAL_TIMEOUT_MS: &str = "OBX_BRIDGE_STREAM_TERMINAL_TIMEOUT_MS";

pub const DEFAULT_PORT_QUEUE_CAPACITY: usize = 4096;
pub const DEFAULT_STREAM_THREAD_NAME: &str = "obx-query-stream";
pub const DEFAULT_STREAM_TERMINAL_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Runtime configuration for the bridge and its in-process ports.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Pending messages each local port queue holds before dropping; `0` is unbounded.
    pub port_queue_capacity: usize,
    /// Pending finalizers allowed before `attach` refuses; `0` is unlimited.
    pub max_finalizers: usize,
    pub stream_thread_name: String,
    /// How long a stream worker keeps retrying its end marker against a full
    /// port before giving up.
    pub stream_terminal_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port_queue_capacity: DEFAULT_PORT_QUEUE_CAPACITY,
            max_finalizers: 0,
            stream_thread_name: DEFAULT_STREAM_THREAD_NAME.to_string(),
            stream_terminal_timeout_ms: DEFAULT_STREAM_TERMINAL_TIMEOUT_MS,
        }
    }
}

impl BridgeConfig {
    pub fn from_json_str(source: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(source)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&source)
    }

    /// Defaults overridden by `OBX_BRIDGE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_lookup(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup` on top of `self`.
    pub fn with_lookup(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(value) = lookup(ENV_PORT_QUEUE_CAPACITY) {
            self.port_queue_capacity = parse_usize(ENV_PORT_QUEUE_CAPACITY, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_FINALIZERS) {
            self.max_finalizers = parse_usize(ENV_MAX_FINALIZERS, &value)?;
        }
        if let Some(value) = lookup(ENV_STREAM_THREAD_NAME) {
            let value = value.trim();
            if value.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: ENV_STREAM_THREAD_NAME,
                    value: value.to_string(),
                });
            }
            self.stream_thread_name = value.to_string();
        }
        if let Some(value) = lookup(ENV_STREAM_TERMINAL_TIMEOUT_MS) {
            self.stream_terminal_timeout_ms = value.trim().parse().map_err(|_| {
                ConfigError::InvalidValue {
                    key: ENV_STREAM_TERMINAL_TIMEOUT_MS,
                    value: value.to_string(),
                }
            })?;
        }
        Ok(self)
    }
}

fn parse_usize(key: &'static str, value: &str) -> Result<usize, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        })
}
