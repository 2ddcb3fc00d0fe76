//! Error types for the log tap.

use crate::config::ConfigError;
use crate::runtime::RuntimeError;
use crate::wrapper::WrapperError;
use thiserror::Error;

/// A specialised Result type for log tap operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in either process mode.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration could not be loaded.
    #[error("configuration error")]
    Config(#[source] Box<figment::Error>),

    /// Configuration was loaded but is unusable.
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    /// Extension mode failed.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// Wrapper mode failed.
    #[error(transparent)]
    Wrapper(#[from] WrapperError),

    /// Tracing subscriber initialisation failed.
    #[error("failed to initialise tracing")]
    Tracing(#[from] tracing_subscriber::util::TryInitError),
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}
