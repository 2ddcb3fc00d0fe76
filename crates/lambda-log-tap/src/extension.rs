//! Lambda Extensions API client.
//!
//! Registers the process as an external extension, subscribes the receiver to
//! the Telemetry API and long-polls lifecycle events until the host announces
//! `SHUTDOWN`.

use crate::config::{ExtensionConfig, TelemetryApiConfig};
use crate::telemetry::{BufferingConfig, TelemetrySubscription};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

const EXTENSION_API_VERSION: &str = "2020-01-01";
const TELEMETRY_API_VERSION: &str = "2022-07-01";

/// Header carrying the extension name on registration.
pub const EXTENSION_NAME_HEADER: &str = "Lambda-Extension-Name";
/// Header carrying the host-assigned extension identifier.
pub const EXTENSION_ID_HEADER: &str = "Lambda-Extension-Identifier";

/// Errors talking to the Extensions or Telemetry API.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ExtensionApiError {
    /// The request could not be sent or its response could not be read.
    #[error("{operation} request failed")]
    Request {
        /// API operation.
        operation: &'static str,
        /// Underlying transport error.
        #[source]
        source: reqwest::Error,
    },

    /// The host answered with a non-success status.
    #[error("{operation} failed with status {status}: {body}")]
    Status {
        /// API operation.
        operation: &'static str,
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// Registration succeeded without an extension identifier.
    #[error("registration response carried no {EXTENSION_ID_HEADER} header")]
    MissingIdentifier,

    /// A lifecycle event did not carry an event type.
    #[error("lifecycle event has no eventType: {0}")]
    MalformedEvent(String),
}

/// Lifecycle of the extension within the execution environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Not yet registered.
    Unregistered,
    /// Registered with the Extensions API.
    Registered,
    /// Subscribed to the Telemetry API.
    Subscribed,
    /// Polling lifecycle events.
    Running,
    /// Shutting down, in-flight work is being drained.
    Draining,
    /// All components have finished.
    Stopped,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NextEvent {
    event_type: Option<String>,
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    shutdown_reason: Option<String>,
    #[serde(default)]
    deadline_ms: Option<u64>,
}

/// Client for the Lambda Extensions API.
pub struct ExtensionClient {
    http: reqwest::Client,
    extension_url: Option<String>,
    telemetry_url: Option<String>,
    name: String,
    buffering: BufferingConfig,
    extension_id: Option<String>,
    state: LifecycleState,
}

impl ExtensionClient {
    /// Creates a client from configuration.
    ///
    /// When registration is skipped (explicitly, or because no host API
    /// address is known) every call becomes a no-op.
    pub fn new(config: &ExtensionConfig, telemetry: &TelemetryApiConfig) -> Self {
        let api = if config.should_skip() {
            tracing::info!("Extensions API not available, running without registration");
            None
        } else {
            config.runtime_api.clone()
        };

        Self {
            http: reqwest::Client::new(),
            extension_url: api
                .as_ref()
                .map(|api| format!("http://{api}/{EXTENSION_API_VERSION}/extension")),
            telemetry_url: api
                .as_ref()
                .map(|api| format!("http://{api}/{TELEMETRY_API_VERSION}/telemetry")),
            name: config.name.clone(),
            buffering: BufferingConfig::from(telemetry),
            extension_id: None,
            state: LifecycleState::Unregistered,
        }
    }

    /// Returns whether the client talks to a host at all.
    pub fn is_skipped(&self) -> bool {
        self.extension_url.is_none()
    }

    /// Returns the identifier assigned on registration.
    pub fn extension_id(&self) -> Option<&str> {
        self.extension_id.as_deref()
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Marks every component as finished.
    pub fn mark_stopped(&mut self) {
        self.state = LifecycleState::Stopped;
    }

    /// Registers for `SHUTDOWN` events.
    ///
    /// # Errors
    ///
    /// Fails on transport errors, non-success status or a missing identifier.
    pub async fn register(&mut self) -> Result<(), ExtensionApiError> {
        let Some(base) = &self.extension_url else {
            self.state = LifecycleState::Registered;
            return Ok(());
        };
        const OPERATION: &str = "register";

        let url = format!("{base}/register");
        tracing::info!(%url, name = %self.name, "Registering extension");

        let response = self
            .http
            .post(&url)
            .header(EXTENSION_NAME_HEADER, &self.name)
            .json(&serde_json::json!({ "events": ["SHUTDOWN"] }))
            .send()
            .await
            .map_err(|source| ExtensionApiError::Request {
                operation: OPERATION,
                source,
            })?;

        let response = check_status(OPERATION, response).await?;
        let extension_id = response
            .headers()
            .get(EXTENSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .ok_or(ExtensionApiError::MissingIdentifier)?;

        if let Ok(body) = response.json::<serde_json::Value>().await {
            tracing::debug!(response = %body, "Registration response");
        }

        tracing::info!(extension_id = %extension_id, "Extension registered");
        self.extension_id = Some(extension_id);
        self.state = LifecycleState::Registered;
        Ok(())
    }

    /// Subscribes `listener_uri` to function and platform telemetry.
    ///
    /// # Errors
    ///
    /// Fails on transport errors or non-success status.
    pub async fn subscribe_telemetry(
        &mut self,
        listener_uri: &str,
    ) -> Result<(), ExtensionApiError> {
        let Some(url) = &self.telemetry_url else {
            self.state = LifecycleState::Subscribed;
            return Ok(());
        };
        const OPERATION: &str = "telemetry subscription";

        let subscription = TelemetrySubscription::new(listener_uri, self.buffering.clone());
        tracing::info!(%url, destination = listener_uri, "Subscribing to telemetry");

        let response = self
            .http
            .put(url)
            .header(EXTENSION_NAME_HEADER, &self.name)
            .header(EXTENSION_ID_HEADER, self.extension_id.as_deref().unwrap_or_default())
            .json(&subscription)
            .send()
            .await
            .map_err(|source| ExtensionApiError::Request {
                operation: OPERATION,
                source,
            })?;

        check_status(OPERATION, response).await?;
        tracing::info!("Subscribed to telemetry");
        self.state = LifecycleState::Subscribed;
        Ok(())
    }

    /// Polls lifecycle events until shutdown.
    ///
    /// A `SHUTDOWN` event cancels `cancel` and returns. Cancellation from
    /// elsewhere interrupts the long poll and returns as well. Without a host
    /// this only waits for cancellation.
    ///
    /// # Errors
    ///
    /// Returns the first transport or decode error of the event loop.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), ExtensionApiError> {
        self.state = LifecycleState::Running;

        let Some(base) = self.extension_url.clone() else {
            cancel.cancelled().await;
            self.state = LifecycleState::Draining;
            return Ok(());
        };
        let url = format!("{base}/event/next");

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => None,
                event = self.next_event(&url) => Some(event?),
            };
            let Some(event) = event else {
                tracing::info!("Shutdown requested locally");
                self.state = LifecycleState::Draining;
                return Ok(());
            };

            match event.event_type.as_deref() {
                Some("INVOKE") => {
                    tracing::debug!(request_id = ?event.request_id, "Invoke event received");
                }
                Some("SHUTDOWN") => {
                    tracing::info!(
                        reason = ?event.shutdown_reason,
                        deadline_ms = ?event.deadline_ms,
                        "Shutdown event received"
                    );
                    self.state = LifecycleState::Draining;
                    cancel.cancel();
                    return Ok(());
                }
                Some(other) => {
                    tracing::debug!(event_type = other, "Ignoring unknown lifecycle event");
                }
                None => {
                    return Err(ExtensionApiError::MalformedEvent(format!("{event:?}")));
                }
            }
        }
    }

    async fn next_event(&self, url: &str) -> Result<NextEvent, ExtensionApiError> {
        const OPERATION: &str = "next event";

        let response = self
            .http
            .get(url)
            .header(EXTENSION_ID_HEADER, self.extension_id.as_deref().unwrap_or_default())
            .send()
            .await
            .map_err(|source| ExtensionApiError::Request {
                operation: OPERATION,
                source,
            })?;

        check_status(OPERATION, response)
            .await?
            .json()
            .await
            .map_err(|source| ExtensionApiError::Request {
                operation: OPERATION,
                source,
            })
    }
}

async fn check_status(
    operation: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response, ExtensionApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ExtensionApiError::Status {
        operation,
        status: status.as_u16(),
        body,
    })
}
