//! Extension runtime orchestrator.
//!
//! This module wires all extension components together:
//! - Extensions API client for lifecycle management
//! - Telemetry API subscription pointing at the receiver
//! - Telemetry receiver feeding the delivery engine
//! - Optional periodic flusher and the terminal flush on shutdown

use crate::config::Config;
use crate::extension::{ExtensionApiError, ExtensionClient, LifecycleState};
use crate::receiver::{ReceiverHandle, TelemetryReceiver, listener_uri};
use crate::retry::RetryPolicy;
use crate::sender::{FlushError, LogSender};
use crate::sink::{RecordSink, SinkError, StreamSink};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Extension runtime that orchestrates all components.
pub struct ExtensionRuntime {
    config: Config,
    cancel_token: CancellationToken,
}

impl ExtensionRuntime {
    /// Creates a new extension runtime with the given configuration.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Returns a handle to the cancellation token.
    ///
    /// Cancelling it has the same effect as a host `SHUTDOWN` event.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Runs the extension against the configured stream until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if any component fails to start, if the event loop
    /// fails, or (in strict mode) if the terminal flush drops records.
    pub async fn run(self) -> Result<(), RuntimeError> {
        let sink = StreamSink::from_config(&self.config.sink)
            .await
            .map_err(RuntimeError::Sink)?;
        self.run_with_sink(sink).await
    }

    /// Runs the extension delivering to `sink` until shutdown.
    ///
    /// # Errors
    ///
    /// See [`run`](Self::run).
    pub async fn run_with_sink<S: RecordSink>(self, sink: S) -> Result<(), RuntimeError> {
        self.start(sink).await?.wait().await
    }

    /// Performs every startup step and spawns the background components.
    ///
    /// The order is: delivery engine, registration, receiver bind,
    /// subscription with the receiver URI, then the receiver server, the
    /// optional periodic flusher and the OS signal listener. Nothing is served
    /// if a step fails.
    ///
    /// # Errors
    ///
    /// Returns the first startup error.
    pub async fn start<S: RecordSink>(
        self,
        sink: S,
    ) -> Result<RunningExtension<S>, RuntimeError> {
        let config = self.config;
        let cancel = self.cancel_token;

        let sender = Arc::new(
            LogSender::new(sink, &config.buffer, RetryPolicy::from(&config.retry))
                .strict(config.retry.strict),
        );
        tracing::debug!(destination = sender.sink().destination(), "Delivery engine created");

        let mut extension = ExtensionClient::new(&config.extension, &config.telemetry_api);
        extension.register().await.map_err(RuntimeError::Register)?;

        let receiver = TelemetryReceiver::new(
            config.receiver.clone(),
            Arc::clone(&sender),
            cancel.clone(),
        );
        let (receiver_handle, receiver_future) = receiver
            .start()
            .await
            .map_err(RuntimeError::ReceiverStart)?;

        extension
            .subscribe_telemetry(&listener_uri(receiver_handle.port()))
            .await
            .map_err(RuntimeError::Subscribe)?;

        let receiver_task =
            tokio::spawn(receiver_future.instrument(tracing::info_span!("receiver")));

        let flusher_task = config.buffer.flush_interval.map(|interval| {
            tracing::info!(interval_ms = interval.as_millis() as u64, "Periodic flush enabled");
            let sender = Arc::clone(&sender);
            let cancel = cancel.clone();
            tokio::spawn(
                async move { sender.run_periodic(interval, cancel).await }
                    .instrument(tracing::info_span!("flusher")),
            )
        });

        let signal_task = spawn_signal_listener(cancel.clone());

        Ok(RunningExtension {
            extension,
            sender,
            receiver: receiver_handle,
            receiver_task,
            flusher_task,
            signal_task,
            cancel,
            drain_timeout: config.receiver.drain_timeout,
        })
    }
}

/// A started extension whose event loop has not run yet.
pub struct RunningExtension<S> {
    extension: ExtensionClient,
    sender: Arc<LogSender<S>>,
    receiver: ReceiverHandle,
    receiver_task: JoinHandle<std::io::Result<()>>,
    flusher_task: Option<JoinHandle<()>>,
    signal_task: JoinHandle<()>,
    cancel: CancellationToken,
    drain_timeout: Duration,
}

impl<S: RecordSink> RunningExtension<S> {
    /// Returns the handle of the running receiver.
    pub fn receiver(&self) -> &ReceiverHandle {
        &self.receiver
    }

    /// Returns the delivery engine.
    pub fn sender(&self) -> &Arc<LogSender<S>> {
        &self.sender
    }

    /// Returns the lifecycle state of the coordinator.
    pub fn state(&self) -> LifecycleState {
        self.extension.state()
    }

    /// Runs the event loop until shutdown, then drains every component.
    ///
    /// After the loop ends the receiver stops accepting and finishes in-flight
    /// requests (bounded by the drain timeout), the periodic flusher stops and
    /// the sender is closed with a last flush. Requests still running past the
    /// drain timeout have their remaining records dropped and counted.
    ///
    /// # Errors
    ///
    /// Returns the event loop error, or the terminal flush error in strict
    /// mode. Components are drained in both cases.
    pub async fn wait(mut self) -> Result<(), RuntimeError> {
        let loop_result = self
            .extension
            .run(self.cancel.clone())
            .instrument(tracing::info_span!("extension"))
            .await;
        if let Err(e) = &loop_result {
            tracing::error!(error = %e, "Event loop failed");
        }

        self.cancel.cancel();

        match tokio::time::timeout(self.drain_timeout, self.receiver_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::error!(error = %e, "Receiver failed"),
            Ok(Err(e)) => tracing::error!(error = %e, "Receiver task failed"),
            Err(_) => {
                let (records, bytes) = self.sender.buffered().await;
                tracing::warn!(
                    timeout_ms = self.drain_timeout.as_millis() as u64,
                    in_flight = self.receiver.requests_in_flight(),
                    buffered_records = records,
                    buffered_bytes = bytes,
                    "Receiver did not drain in time, records sent after the final flush are dropped"
                );
            }
        }

        if let Some(flusher) = self.flusher_task
            && let Err(e) = flusher.await
        {
            tracing::error!(error = %e, "Periodic flusher task failed");
        }
        self.signal_task.abort();

        let drain_result = self.sender.close().await;
        if let Err(e) = &drain_result {
            tracing::error!(error = %e, "Terminal flush failed");
        }

        let stats = self.sender.stats();
        tracing::info!(
            batches = stats.batches_delivered,
            delivered = stats.records_delivered,
            dropped = stats.records_dropped,
            requests = self.receiver.requests_received(),
            ignored = self.receiver.events_ignored(),
            "Extension stopped"
        );
        self.extension.mark_stopped();

        loop_result.map_err(RuntimeError::EventLoop)?;
        drain_result.map_err(RuntimeError::Drain)
    }
}

/// Cancels `cancel` when the process receives SIGTERM or SIGINT.
///
/// The listener ends on its own once `cancel` fires for another reason.
pub fn spawn_signal_listener(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            result = shutdown_signal() => match result {
                Ok(signal) => {
                    tracing::info!(signal, "Shutdown signal received");
                    cancel.cancel();
                }
                Err(e) => tracing::warn!(error = %e, "Failed to install signal handlers"),
            },
        }
    })
}

async fn shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = terminate.recv() => Ok("SIGTERM"),
        _ = interrupt.recv() => Ok("SIGINT"),
    }
}

/// Errors from the extension runtime.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Failed to build the delivery backend.
    #[error("failed to create sink")]
    Sink(#[source] SinkError),

    /// Failed to register with the Extensions API.
    #[error("failed to register extension")]
    Register(#[source] ExtensionApiError),

    /// Failed to start the telemetry receiver.
    #[error("failed to start telemetry receiver")]
    ReceiverStart(#[source] std::io::Error),

    /// Failed to subscribe to the Telemetry API.
    #[error("failed to subscribe to telemetry")]
    Subscribe(#[source] ExtensionApiError),

    /// Event loop encountered an error.
    #[error("event loop error")]
    EventLoop(#[source] ExtensionApiError),

    /// The terminal flush dropped records.
    #[error("failed to drain buffered records")]
    Drain(#[source] FlushError),
}
