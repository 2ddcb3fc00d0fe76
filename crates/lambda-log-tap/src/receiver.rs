//! Telemetry receiver for collecting function logs.
//!
//! This module provides the HTTP endpoint the Lambda Telemetry API (and the
//! child-process wrapper) pushes batches of events to. Function log records are
//! normalized into lines and handed to the [`LogSender`], which is flushed once
//! per accepted batch.

use crate::config::ReceiverConfig;
use crate::normalize::normalize;
use crate::sender::LogSender;
use crate::sink::RecordSink;
use crate::telemetry::TelemetryEvent;
use axum::{
    Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Host name the Lambda sandbox resolves to the execution environment.
const SANDBOX_HOSTNAME: &str = "sandbox.localdomain";

/// Future running the receiver server until cancellation.
pub type ServerFuture = Pin<Box<dyn Future<Output = std::io::Result<()>> + Send>>;

/// Returns the URI the Telemetry API should push to for the given port.
///
/// Inside Lambda the sandbox host name must be used; elsewhere the loopback
/// address is.
pub fn listener_uri(port: u16) -> String {
    let in_lambda = std::env::var("AWS_LAMBDA_FUNCTION_NAME").is_ok_and(|name| !name.is_empty());
    let host = if in_lambda {
        SANDBOX_HOSTNAME
    } else {
        "127.0.0.1"
    };
    format!("http://{host}:{port}")
}

/// Handle for interacting with a running receiver.
///
/// Gives access to the bound address (useful when port 0 is used for dynamic
/// allocation) and to the ingestion counters.
#[derive(Clone)]
pub struct ReceiverHandle {
    counters: Arc<Counters>,
    local_addr: SocketAddr,
}

impl ReceiverHandle {
    /// Returns the actual bound address of the receiver.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the port the receiver is listening on.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Returns the URL of the receiver on its bound address.
    pub fn url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// Returns the number of batches accepted.
    pub fn requests_received(&self) -> u64 {
        self.counters.requests.load(Ordering::Relaxed)
    }

    /// Returns the number of records handed to the sender.
    pub fn events_sent(&self) -> u64 {
        self.counters.sent.load(Ordering::Relaxed)
    }

    /// Returns the number of events that were not forwarded.
    pub fn events_ignored(&self) -> u64 {
        self.counters.ignored.load(Ordering::Relaxed)
    }

    /// Returns the number of requests currently being handled.
    pub fn requests_in_flight(&self) -> u64 {
        self.counters.in_flight.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    sent: AtomicU64,
    ignored: AtomicU64,
    in_flight: AtomicU64,
}

struct InFlight<'a>(&'a AtomicU64);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

struct ReceiverState<S> {
    sender: Arc<LogSender<S>>,
    counters: Arc<Counters>,
}

/// HTTP receiver for Telemetry API batches.
pub struct TelemetryReceiver<S> {
    config: ReceiverConfig,
    sender: Arc<LogSender<S>>,
    cancel_token: CancellationToken,
}

impl<S: RecordSink> TelemetryReceiver<S> {
    /// Creates a new receiver.
    ///
    /// # Arguments
    ///
    /// * `config` - Receiver configuration
    /// * `sender` - Delivery engine records are handed to
    /// * `cancel_token` - Token for graceful shutdown
    pub fn new(
        config: ReceiverConfig,
        sender: Arc<LogSender<S>>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            config,
            sender,
            cancel_token,
        }
    }

    /// Binds the listener and returns a handle plus the server future.
    ///
    /// The future should be spawned. It stops accepting connections once the
    /// cancellation token fires, lets in-flight requests finish, then resolves.
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails to bind to the address.
    pub async fn start(self) -> Result<(ReceiverHandle, ServerFuture), std::io::Error> {
        let addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;

        let counters = Arc::new(Counters::default());
        let handle = ReceiverHandle {
            counters: Arc::clone(&counters),
            local_addr,
        };

        let state = Arc::new(ReceiverState {
            sender: self.sender,
            counters,
        });
        let app = Router::new()
            .route("/", post(handle_batch::<S>))
            .layer(DefaultBodyLimit::max(self.config.max_body_bytes))
            .with_state(state);

        tracing::info!(
            address = %local_addr,
            max_body_bytes = self.config.max_body_bytes,
            "Telemetry receiver started"
        );

        let cancel_token = self.cancel_token;
        let future: ServerFuture = Box::pin(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(cancel_token.cancelled_owned())
                .await?;
            tracing::info!("Telemetry receiver stopped");
            Ok(())
        });

        Ok((handle, future))
    }
}

async fn handle_batch<S: RecordSink>(
    State(state): State<Arc<ReceiverState<S>>>,
    body: Bytes,
) -> impl IntoResponse {
    let _in_flight = InFlight::enter(&state.counters.in_flight);
    let events: Vec<TelemetryEvent> = match serde_json::from_slice(&body) {
        Ok(events) => events,
        Err(e) => {
            tracing::warn!(error = %e, bytes = body.len(), "Failed to parse telemetry batch");
            return (StatusCode::BAD_REQUEST, "invalid telemetry batch");
        }
    };
    state.counters.requests.fetch_add(1, Ordering::Relaxed);

    let mut sent = 0u64;
    let mut ignored = 0u64;
    let mut failed = false;

    for event in &events {
        let Some(record) = event.forwardable_record() else {
            ignored += 1;
            continue;
        };
        if let Err(e) = state.sender.send(normalize(record)).await {
            tracing::error!(error = %e, "Failed to buffer record");
            failed = true;
        }
        sent += 1;
    }

    state.counters.sent.fetch_add(sent, Ordering::Relaxed);
    state.counters.ignored.fetch_add(ignored, Ordering::Relaxed);
    tracing::debug!(events = events.len(), sent, ignored, "Telemetry batch received");

    if let Err(e) = state.sender.flush().await {
        tracing::error!(error = %e, "Failed to flush records");
        failed = true;
    }

    if failed {
        (StatusCode::INTERNAL_SERVER_ERROR, "delivery failed")
    } else {
        (StatusCode::OK, "")
    }
}
