//! Configuration loading for the simlink server.
//!
//! Settings are resolved in three layers, each overriding the last:
//!
//! 1. `simlink-server.yaml` (or the file named by `SIMLINK_CONFIG`), with
//!    every field defaulted when the file or the field is absent
//! 2. Environment variables `SIMLINK_HOST`, `SIMLINK_PORT`, and
//!    `SIMLINK_TIMINGS_PATH`
//! 3. An optional first command-line argument holding the port

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use simlink_engine::DEFAULT_MAX_NODES;
use simlink_timing::{DEFAULT_FLUSH_EVERY, DEFAULT_SHUTDOWN_TIMEOUT};

use crate::dispatch::DEFAULT_MAX_STEP_COUNT;

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "simlink-server.yaml";

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// An override held a value that could not be used.
    #[error("invalid value for {key}: {reason}")]
    Invalid {
        /// Name of the environment variable or argument.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level server configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    /// Listening address.
    #[serde(default)]
    pub listen: ListenConfig,

    /// Wire protocol limits.
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Engine limits.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Server-side latency recording.
    #[serde(default)]
    pub timings: TimingsConfig,

    /// How long shutdown waits for open connections before aborting them.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl ServerConfig {
    /// Load configuration from a YAML file, then apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if the content is not valid YAML, or
    /// [`ConfigError::Invalid`] if an environment override is malformed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = serde_yml::from_str(&contents)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string. No overrides are applied.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yml::from_str(yaml)?;
        Ok(config)
    }

    /// Resolve the configuration file and environment overrides.
    ///
    /// A missing default file is not an error; a missing file named by
    /// `SIMLINK_CONFIG` is.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var("SIMLINK_CONFIG") {
            return Self::from_file(Path::new(&path));
        }
        let path = Path::new(DEFAULT_CONFIG_FILE);
        if path.exists() {
            Self::from_file(path)
        } else {
            let mut config = Self::default();
            config.apply_env_overrides()?;
            Ok(config)
        }
    }

    /// Apply `SIMLINK_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(host) = lookup("SIMLINK_HOST") {
            self.listen.host = host;
        }
        if let Some(port) = lookup("SIMLINK_PORT") {
            self.listen.port = parse_port("SIMLINK_PORT", &port)?;
        }
        if let Some(path) = lookup("SIMLINK_TIMINGS_PATH") {
            self.timings.enabled = true;
            self.timings.path = PathBuf::from(path);
        }
        Ok(())
    }

    /// Apply command-line arguments (program name already stripped).
    ///
    /// The first argument, when present, is the listening port.
    pub fn apply_cli_args<I>(&mut self, args: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = String>,
    {
        if let Some(port) = args.into_iter().next() {
            self.listen.port = parse_port("port argument", &port)?;
        }
        Ok(())
    }

    /// Shutdown grace period as a [`Duration`].
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn parse_port(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.trim().parse().map_err(|e| ConfigError::Invalid {
        key: key.to_owned(),
        reason: format!("{value:?} is not a port: {e}"),
    })
}

/// Listening address settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ListenConfig {
    /// Host name or address to bind.
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port to bind; `0` picks a free port.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_owned()
}

const fn default_port() -> u16 {
    9090
}

/// Wire protocol limits.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProtocolConfig {
    /// Longest accepted request line in bytes, excluding the `\n` or
    /// `\r\n` terminator.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,

    /// Largest `stepCount` a single `step` request may ask for.
    #[serde(default = "default_max_step_count")]
    pub max_step_count: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: default_max_line_bytes(),
            max_step_count: default_max_step_count(),
        }
    }
}

const fn default_max_line_bytes() -> usize {
    1024 * 1024
}

const fn default_max_step_count() -> u32 {
    DEFAULT_MAX_STEP_COUNT
}

/// Engine limits.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EngineConfig {
    /// Largest node count a `create` request may ask for.
    #[serde(default = "default_max_nodes")]
    pub max_nodes: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_nodes: default_max_nodes(),
        }
    }
}

const fn default_max_nodes() -> u32 {
    DEFAULT_MAX_NODES
}

/// Server-side latency recording settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TimingsConfig {
    /// Whether `step.compute` samples are persisted.
    #[serde(default)]
    pub enabled: bool,

    /// CSV file receiving the samples; truncated at startup.
    #[serde(default = "default_timings_path")]
    pub path: PathBuf,

    /// Records written between flushes.
    #[serde(default = "default_flush_every")]
    pub flush_every: usize,

    /// How long shutdown waits for the writer thread.
    #[serde(default = "default_sink_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl TimingsConfig {
    /// Writer shutdown timeout as a [`Duration`].
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for TimingsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_timings_path(),
            flush_every: default_flush_every(),
            shutdown_timeout_ms: default_sink_shutdown_timeout_ms(),
        }
    }
}

fn default_timings_path() -> PathBuf {
    PathBuf::from("server-timings.csv")
}

const fn default_flush_every() -> usize {
    DEFAULT_FLUSH_EVERY
}

fn default_sink_shutdown_timeout_ms() -> u64 {
    u64::try_from(DEFAULT_SHUTDOWN_TIMEOUT.as_millis()).unwrap_or(2000)
}

const fn default_shutdown_grace_ms() -> u64 {
    2000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_protocol_conventions() {
        let config = ServerConfig::default();
        assert_eq!(config.listen.host, "127.0.0.1");
        assert_eq!(config.listen.port, 9090);
        assert_eq!(config.protocol.max_line_bytes, 1_048_576);
        assert_eq!(config.protocol.max_step_count, DEFAULT_MAX_STEP_COUNT);
        assert_eq!(config.engine.max_nodes, DEFAULT_MAX_NODES);
        assert!(!config.timings.enabled);
        assert_eq!(config.timings.flush_every, 200);
        assert_eq!(config.timings.shutdown_timeout(), Duration::from_secs(2));
        assert_eq!(config.shutdown_grace(), Duration::from_secs(2));
    }

    #[test]
    fn parse_full_yaml() {
        let yaml = r"
listen:
  host: 0.0.0.0
  port: 7000
protocol:
  max_line_bytes: 4096
  max_step_count: 250
engine:
  max_nodes: 50
timings:
  enabled: true
  path: /tmp/server.csv
  flush_every: 10
  shutdown_timeout_ms: 500
shutdown_grace_ms: 100
";
        let config = ServerConfig::parse(yaml);
        assert!(config.is_ok());
        let config = config.ok().unwrap_or_default();

        assert_eq!(config.listen.host, "0.0.0.0");
        assert_eq!(config.listen.port, 7000);
        assert_eq!(config.protocol.max_line_bytes, 4096);
        assert_eq!(config.protocol.max_step_count, 250);
        assert_eq!(config.engine.max_nodes, 50);
        assert!(config.timings.enabled);
        assert_eq!(config.timings.path, PathBuf::from("/tmp/server.csv"));
        assert_eq!(config.timings.flush_every, 10);
        assert_eq!(config.timings.shutdown_timeout_ms, 500);
        assert_eq!(config.shutdown_grace_ms, 100);
    }

    #[test]
    fn parse_minimal_yaml() {
        let config = ServerConfig::parse("listen:\n  port: 7001\n");
        assert!(config.is_ok());
        let config = config.ok().unwrap_or_default();

        // Port is overridden
        assert_eq!(config.listen.port, 7001);
        // Everything else uses defaults
        assert_eq!(config.listen.host, "127.0.0.1");
        assert_eq!(config.protocol, ProtocolConfig::default());
        assert_eq!(config.timings, TimingsConfig::default());
    }

    #[test]
    fn invalid_yaml_is_rejected() {
        let result = ServerConfig::parse("listen: [unclosed");
        assert!(matches!(result, Err(ConfigError::Yaml { .. })));
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let mut config = ServerConfig::default();
        let result = config.apply_overrides(lookup(&[
            ("SIMLINK_HOST", "0.0.0.0"),
            ("SIMLINK_PORT", "6001"),
            ("SIMLINK_TIMINGS_PATH", "run.csv"),
        ]));
        assert!(result.is_ok());
        assert_eq!(config.listen.host, "0.0.0.0");
        assert_eq!(config.listen.port, 6001);
        assert!(config.timings.enabled);
        assert_eq!(config.timings.path, PathBuf::from("run.csv"));
    }

    #[test]
    fn malformed_port_override_is_an_error() {
        let mut config = ServerConfig::default();
        let result = config.apply_overrides(lookup(&[("SIMLINK_PORT", "ninety")]));
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
        assert_eq!(config.listen.port, 9090);
    }

    #[test]
    fn first_cli_argument_is_the_port() {
        let mut config = ServerConfig::default();
        assert!(config
            .apply_cli_args(vec!["9191".to_owned(), "ignored".to_owned()])
            .is_ok());
        assert_eq!(config.listen.port, 9191);

        assert!(config.apply_cli_args(Vec::new()).is_ok());
        assert_eq!(config.listen.port, 9191);

        assert!(config.apply_cli_args(vec!["70000".to_owned()]).is_err());
    }
}
