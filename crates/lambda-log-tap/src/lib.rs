//! AWS Lambda extension that captures function logs and delivers them to a
//! Firehose delivery stream or a Kinesis data stream.
//!
//! The same binary runs in two modes. As an extension it registers with the
//! Extensions API, subscribes a local receiver to the Telemetry API and
//! forwards every function log line to the configured stream. As a wrapper
//! (when `_HANDLER` is set) it runs the real handler as a child process and
//! posts the child's stdout lines to the extension's receiver.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod extension;
pub mod normalize;
pub mod receiver;
pub mod retry;
pub mod runtime;
pub mod sender;
pub mod sink;
pub mod telemetry;
pub mod wrapper;

pub use config::{
    BufferConfig, Config, ConfigBuilder, ConfigError, ExtensionConfig, ReceiverConfig,
    RetryConfig, SinkConfig, SinkKind, TelemetryApiConfig, WrapperConfig,
};
pub use error::{Error, Result};
pub use extension::{ExtensionApiError, ExtensionClient, LifecycleState};
pub use normalize::normalize;
pub use receiver::{ReceiverHandle, TelemetryReceiver, listener_uri};
pub use retry::RetryPolicy;
pub use runtime::{ExtensionRuntime, RunningExtension, RuntimeError, spawn_signal_listener};
pub use sender::{FlushError, LogSender, SenderStats};
pub use sink::{RecordSink, SinkError, StreamSink};
pub use telemetry::{TelemetryEvent, TelemetrySubscription, TelemetryType};
pub use wrapper::{TelemetryApiClient, Wrapper, WrapperError};
