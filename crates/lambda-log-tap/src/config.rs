//! Configuration loading and management.
//!
//! This module provides layered configuration for the extension using figment.
//! Configuration is loaded from (in order of priority):
//! 1. Default values (compiled in)
//! 2. Config file: `/var/task/log-tap.toml` (optional, overridable with `LOG_TAP_CONFIG`)
//! 3. Well-known flat environment variables (see below)
//! 4. Nested overrides with the `LOG_TAP__` prefix, e.g. `LOG_TAP__BUFFER__MAX_RECORDS`
//!
//! # Supported Environment Variables
//!
//! | Variable | Config Path | Description |
//! |----------|-------------|-------------|
//! | `LOG_TAP_STREAM_NAME` | `sink.stream_name` | Destination stream name |
//! | `LOG_TAP_DATA_STREAM` | `sink.kind` | `true` selects Kinesis instead of Firehose |
//! | `LOG_TAP_PORT` | `receiver.port` | Ingestion endpoint port |
//! | `LOG_TAP_DEBUG` | `debug` | Enables debug logging |
//! | `LOG_TAP_SKIP_EXTENSION` | `extension.skip` | Skips Extensions API registration |
//! | `AWS_LAMBDA_RUNTIME_API` | `extension.runtime_api` | Host API address |
//! | `LAMBDA_TASK_ROOT` | `wrapper.task_root` | Base for relative handler paths |

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "/var/task/log-tap.toml";
const CONFIG_PATH_ENV: &str = "LOG_TAP_CONFIG";
const ENV_PREFIX: &str = "LOG_TAP__";

/// Kind of append-only stream the records are delivered to.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Amazon Data Firehose delivery stream (`PutRecordBatch`).
    #[default]
    Firehose,
    /// Kinesis Data Stream (`PutRecords`).
    Kinesis,
}

/// Main configuration struct for the extension.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Delivery backend configuration.
    pub sink: SinkConfig,
    /// Buffer bounds of the delivery engine.
    pub buffer: BufferConfig,
    /// Retry policy for backend delivery.
    pub retry: RetryConfig,
    /// Ingestion endpoint configuration.
    pub receiver: ReceiverConfig,
    /// Extensions API configuration.
    pub extension: ExtensionConfig,
    /// Telemetry API subscription configuration.
    pub telemetry_api: TelemetryApiConfig,
    /// Child-process wrapper configuration.
    pub wrapper: WrapperConfig,
    /// Enables debug logging.
    pub debug: bool,
}

impl Config {
    /// Loads configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration parsing fails.
    #[allow(clippy::result_large_err)]
    pub fn load() -> Result<Self, figment::Error> {
        let path = std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from_path(path)
    }

    /// Loads configuration from a custom config file path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration parsing fails.
    #[allow(clippy::result_large_err)]
    pub fn load_from_path<P: AsRef<Path>>(config_path: P) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));

        if config_path.as_ref().exists() {
            figment = figment.merge(Toml::file(config_path));
        }

        figment = figment.merge(standard_env());
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        figment.extract()
    }

    /// Checks the settings that extension mode cannot run without.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingStreamName`] when no destination stream is configured.
    pub fn validate_for_extension(&self) -> Result<(), ConfigError> {
        match self.sink.stream_name.as_deref() {
            Some(name) if !name.trim().is_empty() => Ok(()),
            _ => Err(ConfigError::MissingStreamName),
        }
    }

    /// Creates a new config builder for testing.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Errors raised when a loaded configuration is unusable.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No destination stream name was configured.
    #[error("destination stream name is required (set LOG_TAP_STREAM_NAME)")]
    MissingStreamName,
}

/// Delivery backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Backend kind.
    pub kind: SinkKind,
    /// Firehose delivery stream or Kinesis stream name.
    pub stream_name: Option<String>,
}

/// Buffer bounds of the delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Maximum number of records per delivery batch.
    pub max_records: usize,
    /// Maximum cumulative size of a delivery batch in bytes.
    pub max_bytes: usize,
    /// Interval of the optional timer-driven flush, in milliseconds.
    #[serde(with = "option_duration_ms")]
    pub flush_interval: Option<Duration>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_records: 500,
            max_bytes: 512 * 1024,
            flush_interval: None,
        }
    }
}

/// Retry policy for backend delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry, in milliseconds.
    #[serde(with = "duration_ms")]
    pub min_delay: Duration,
    /// Upper bound of the backoff delay, in milliseconds.
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Maximum number of delivery attempts per batch.
    pub max_attempts: u32,
    /// Report exhausted retries as errors instead of logging and continuing.
    pub strict: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            max_attempts: 10,
            strict: false,
        }
    }
}

/// Ingestion endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Port to listen on. `0` picks a free port.
    pub port: u16,
    /// Address to bind.
    pub bind_address: String,
    /// Maximum time to wait for in-flight requests on shutdown, in milliseconds.
    #[serde(with = "duration_ms")]
    pub drain_timeout: Duration,
    /// Largest request body accepted, in bytes. Larger bodies get `413`.
    pub max_body_bytes: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_address: "0.0.0.0".to_string(),
            drain_timeout: Duration::from_secs(2),
            max_body_bytes: 6 * 1024 * 1024,
        }
    }
}

/// Extensions API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionConfig {
    /// Skip registration and the event loop entirely.
    pub skip: bool,
    /// Host API address (`host:port`), normally from `AWS_LAMBDA_RUNTIME_API`.
    pub runtime_api: Option<String>,
    /// Name announced in the `Lambda-Extension-Name` header.
    pub name: String,
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        Self {
            skip: false,
            runtime_api: None,
            name: default_extension_name(),
        }
    }
}

impl ExtensionConfig {
    /// Returns whether registration should be skipped.
    ///
    /// Registration is skipped when explicitly requested or when no host API is
    /// available, which means the process runs outside of Lambda.
    pub fn should_skip(&self) -> bool {
        self.skip || self.runtime_api.as_deref().is_none_or(str::is_empty)
    }
}

fn default_extension_name() -> String {
    std::env::args_os()
        .next()
        .and_then(|arg| {
            Path::new(&arg)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string())
}

/// Telemetry API subscription configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryApiConfig {
    /// Maximum events the host buffers before pushing.
    pub max_items: u32,
    /// Maximum bytes the host buffers before pushing.
    pub max_bytes: u32,
    /// Maximum time in milliseconds the host buffers before pushing.
    pub timeout_ms: u32,
}

impl Default for TelemetryApiConfig {
    fn default() -> Self {
        Self {
            max_items: 500,
            max_bytes: 1024 * 1024,
            timeout_ms: 1000,
        }
    }
}

/// Child-process wrapper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WrapperConfig {
    /// Environment variable marking a process that is already wrapped.
    pub marker_env: String,
    /// Directory relative handler paths are resolved against.
    pub task_root: Option<PathBuf>,
    /// Interval between posts to the ingestion endpoint, in milliseconds.
    #[serde(with = "duration_ms")]
    pub post_interval: Duration,
    /// Timeout of a single post, in milliseconds.
    #[serde(with = "duration_ms")]
    pub post_timeout: Duration,
    /// Maximum events per posted chunk.
    pub chunk_size: usize,
    /// Maximum encoded size of a posted chunk, in bytes. Must stay below the
    /// receiver's body limit.
    pub chunk_bytes: usize,
    /// Time a terminated child is given before it is killed, in milliseconds.
    #[serde(with = "duration_ms")]
    pub grace_period: Duration,
}

impl Default for WrapperConfig {
    fn default() -> Self {
        Self {
            marker_env: "LOG_TAP_WRAPPED".to_string(),
            task_root: None,
            post_interval: Duration::from_millis(1000),
            post_timeout: Duration::from_millis(1000),
            chunk_size: 500,
            chunk_bytes: 1024 * 1024,
            grace_period: Duration::from_millis(1500),
        }
    }
}

/// Builder for constructing configuration programmatically.
#[must_use = "builders do nothing unless .build() is called"]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Creates a new config builder with default values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Sets the destination stream name.
    pub fn stream_name(mut self, name: impl Into<String>) -> Self {
        self.config.sink.stream_name = Some(name.into());
        self
    }

    /// Sets the backend kind.
    pub fn sink_kind(mut self, kind: SinkKind) -> Self {
        self.config.sink.kind = kind;
        self
    }

    /// Sets the buffer bounds.
    pub fn buffer_limits(mut self, max_records: usize, max_bytes: usize) -> Self {
        self.config.buffer.max_records = max_records;
        self.config.buffer.max_bytes = max_bytes;
        self
    }

    /// Enables the timer-driven flush.
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.config.buffer.flush_interval = Some(interval);
        self
    }

    /// Sets the retry policy.
    pub fn retry(mut self, min_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        self.config.retry.min_delay = min_delay;
        self.config.retry.max_delay = max_delay;
        self.config.retry.max_attempts = max_attempts;
        self
    }

    /// Enables strict delivery error reporting.
    pub fn strict(mut self, strict: bool) -> Self {
        self.config.retry.strict = strict;
        self
    }

    /// Sets the ingestion endpoint port.
    pub fn receiver_port(mut self, port: u16) -> Self {
        self.config.receiver.port = port;
        self
    }

    /// Sets the ingestion endpoint bind address.
    pub fn bind_address(mut self, address: impl Into<String>) -> Self {
        self.config.receiver.bind_address = address.into();
        self
    }

    /// Sets how long shutdown waits for in-flight requests.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.receiver.drain_timeout = timeout;
        self
    }

    /// Sets the host API address.
    pub fn runtime_api(mut self, address: impl Into<String>) -> Self {
        self.config.extension.runtime_api = Some(address.into());
        self
    }

    /// Skips Extensions API registration.
    pub fn skip_extension(mut self, skip: bool) -> Self {
        self.config.extension.skip = skip;
        self
    }

    /// Sets the interval between wrapper posts.
    pub fn post_interval(mut self, interval: Duration) -> Self {
        self.config.wrapper.post_interval = interval;
        self
    }

    /// Sets the task root for relative handler paths.
    pub fn task_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.wrapper.task_root = Some(root.into());
        self
    }

    /// Sets the re-entrancy marker variable name.
    pub fn marker_env(mut self, name: impl Into<String>) -> Self {
        self.config.wrapper.marker_env = name.into();
        self
    }

    /// Sets the child termination grace period.
    pub fn grace_period(mut self, period: Duration) -> Self {
        self.config.wrapper.grace_period = period;
        self
    }

    /// Enables debug logging.
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, Serialize)]
struct PartialSinkConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<SinkKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_name: Option<String>,
}

#[derive(Debug, Default, Serialize)]
struct PartialReceiverConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
}

#[derive(Debug, Default, Serialize)]
struct PartialExtensionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    skip: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    runtime_api: Option<String>,
}

#[derive(Debug, Default, Serialize)]
struct PartialWrapperConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    task_root: Option<PathBuf>,
}

/// Partial config for the well-known flat environment variables.
#[derive(Debug, Default, Serialize)]
struct PartialConfig {
    sink: PartialSinkConfig,
    receiver: PartialReceiverConfig,
    extension: PartialExtensionConfig,
    wrapper: PartialWrapperConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    debug: Option<bool>,
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_bool(name: &str) -> Option<bool> {
    env_non_empty(name).map(|value| {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "t" | "yes" | "on"
        )
    })
}

fn standard_env() -> Serialized<PartialConfig> {
    let mut config = PartialConfig::default();

    config.sink.stream_name = env_non_empty("LOG_TAP_STREAM_NAME");
    config.sink.kind = env_bool("LOG_TAP_DATA_STREAM").map(|data_stream| {
        if data_stream {
            SinkKind::Kinesis
        } else {
            SinkKind::Firehose
        }
    });

    if let Some(port) = env_non_empty("LOG_TAP_PORT") {
        match port.parse() {
            Ok(port) => config.receiver.port = Some(port),
            Err(_) => tracing::warn!(%port, "Ignoring invalid LOG_TAP_PORT"),
        }
    }

    config.extension.skip = env_bool("LOG_TAP_SKIP_EXTENSION");
    config.extension.runtime_api = env_non_empty("AWS_LAMBDA_RUNTIME_API");
    config.wrapper.task_root = env_non_empty("LAMBDA_TASK_ROOT").map(PathBuf::from);
    config.debug = env_bool("LOG_TAP_DEBUG");

    Serialized::defaults(config)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = Option::<u64>::deserialize(deserializer)?;
        Ok(ms.filter(|ms| *ms > 0).map(Duration::from_millis))
    }
}
