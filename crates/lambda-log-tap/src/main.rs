//! AWS Lambda log tap binary.
//!
//! Runs as the function's wrapper when `_HANDLER` is set, and as the
//! extension otherwise.
//!
//! # Configuration
//!
//! Configuration is loaded from (in order of priority):
//! 1. Default values
//! 2. Config file: `/var/task/log-tap.toml` (or `LOG_TAP_CONFIG`)
//! 3. Environment variables
//!
//! # Environment Variables
//!
//! - `LOG_TAP_STREAM_NAME` - Destination stream name (required in extension mode)
//! - `LOG_TAP_DATA_STREAM` - Deliver to Kinesis Data Streams instead of Firehose
//! - `LOG_TAP_PORT` - Receiver port
//! - `LOG_TAP_DEBUG` - Enable debug logging
//!
//! See the crate documentation for full configuration options.

use anyhow::{Context, Result};
use lambda_log_tap::{Config, ExtensionRuntime, Wrapper, spawn_signal_listener};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const HANDLER_ENV: &str = "_HANDLER";

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let config = Config::load().context("failed to load configuration")?;
    init_tracing(config.debug).context("failed to initialise tracing subscriber")?;
    tracing::debug!(?config, "Configuration loaded");

    let code = match std::env::var(HANDLER_ENV).ok().filter(|h| !h.is_empty()) {
        Some(handler) => run_wrapper(config, &handler)
            .await
            .context("wrapper failed")?,
        None => {
            run_extension(config)
                .await
                .context("extension runtime failed")?;
            0
        }
    };

    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}

async fn run_wrapper(config: Config, handler: &str) -> lambda_log_tap::Result<i32> {
    let endpoint = format!("http://127.0.0.1:{}", config.receiver.port);
    let cancel = CancellationToken::new();
    let signals = spawn_signal_listener(cancel.clone());

    let mut wrapper_config = config.wrapper;
    wrapper_config.chunk_bytes = wrapper_config
        .chunk_bytes
        .min(config.receiver.max_body_bytes);

    let code = Wrapper::new(wrapper_config, endpoint)
        .run(handler, cancel)
        .await?;

    signals.abort();
    Ok(code)
}

async fn run_extension(config: Config) -> lambda_log_tap::Result<()> {
    config.validate_for_extension()?;
    ExtensionRuntime::new(config).run().await?;
    Ok(())
}

fn init_tracing(debug: bool) -> lambda_log_tap::Result<()> {
    let default_filter = if debug {
        "info,lambda_log_tap=debug"
    } else {
        "info,lambda_log_tap=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).without_time())
        .with(filter)
        .try_init()?;

    Ok(())
}
