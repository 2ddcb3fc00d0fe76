//! Child-process capture wrapper.
//!
//! In wrapper mode this process is the function's bootstrap: it runs the real
//! handler as a child, turns each line the child writes to stdout into a
//! synthetic `function` telemetry event and periodically posts those events to
//! the receiver of the extension running next to it.

use crate::config::WrapperConfig;
use crate::normalize::normalize;
use crate::telemetry::TelemetryEvent;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, DuplexStream};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Errors from the capture wrapper.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum WrapperError {
    /// The process already runs under the wrapper.
    #[error("recursive execution detected: {marker} is already set")]
    Recursive {
        /// Name of the marker variable.
        marker: String,
    },

    /// The handler could not be started.
    #[error("failed to start handler {}", command.display())]
    Spawn {
        /// Resolved handler path.
        command: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Waiting for or signalling the handler failed.
    #[error("failed to supervise handler")]
    Supervise(#[source] std::io::Error),

    /// The HTTP client could not be built.
    #[error("failed to build telemetry client")]
    Client(#[source] reqwest::Error),

    /// A post to the receiver failed.
    #[error("failed to post telemetry")]
    Post(#[source] reqwest::Error),

    /// The receiver failed a post; the events are kept for the next post.
    #[error("receiver answered with status {0}")]
    PostStatus(u16),

    /// The receiver refused chunks with a client error; their events were dropped.
    #[error("receiver rejected {dropped} events with status {status}")]
    Rejected {
        /// Status of the last rejection.
        status: u16,
        /// Number of events dropped.
        dropped: usize,
    },
}

/// Collects captured lines and posts them to the receiver.
///
/// Lines are pushed by [`capture`](Self::capture) (or through
/// [`pipe`](Self::pipe)) and drained by [`post`](Self::post) in chunks.
pub struct TelemetryApiClient {
    endpoint: String,
    http: reqwest::Client,
    events: Mutex<Vec<TelemetryEvent>>,
    chunk_size: usize,
    chunk_bytes: usize,
    post_interval: Duration,
}

impl TelemetryApiClient {
    /// Creates a client posting to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`WrapperError::Client`] if the HTTP client cannot be built.
    pub fn new(endpoint: impl Into<String>, config: &WrapperConfig) -> Result<Self, WrapperError> {
        let http = reqwest::Client::builder()
            .timeout(config.post_timeout)
            .build()
            .map_err(WrapperError::Client)?;

        Ok(Self {
            endpoint: endpoint.into(),
            http,
            events: Mutex::new(Vec::with_capacity(config.chunk_size)),
            chunk_size: config.chunk_size.max(1),
            chunk_bytes: config.chunk_bytes,
            post_interval: config.post_interval,
        })
    }

    /// Returns the receiver endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Returns a copy of the events not yet posted.
    pub async fn pending(&self) -> Vec<TelemetryEvent> {
        self.events.lock().await.clone()
    }

    /// Reads `reader` to the end, queueing one event per line.
    ///
    /// A trailing line without newline is queued as well. Invalid UTF-8 is
    /// replaced. Returns the number of lines queued.
    ///
    /// # Errors
    ///
    /// Returns the read error; lines read before it stay queued.
    pub async fn capture<R>(&self, reader: R) -> std::io::Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        let mut lines = 0;

        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line).await? == 0 {
                break;
            }
            tracing::trace!(bytes = line.len(), "Captured line");
            let event = TelemetryEvent::function(String::from_utf8_lossy(&line));
            self.events.lock().await.push(event);
            lines += 1;
        }

        Ok(lines)
    }

    /// Returns a writer whose bytes are captured like a child's stdout.
    ///
    /// The returned task completes with the number of captured lines once the
    /// writer is dropped.
    pub fn pipe(self: &Arc<Self>) -> (DuplexStream, JoinHandle<u64>) {
        let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
        let client = Arc::clone(self);
        let task = tokio::spawn(async move {
            match client.capture(reader).await {
                Ok(lines) => lines,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to read captured output");
                    0
                }
            }
        });
        (writer, task)
    }

    /// Posts all pending events in chunks and returns how many were accepted.
    ///
    /// Chunks are bounded by event count and by encoded size. Accepted chunks
    /// are removed even if a later chunk fails. A chunk the receiver rejects
    /// with a client error is dropped, one warning per line, and posting
    /// continues with the next chunk. Transport errors and server errors stop
    /// the post and keep the failed chunk for the next attempt.
    ///
    /// # Errors
    ///
    /// Returns the first retryable failure, otherwise
    /// [`WrapperError::Rejected`] if any chunk was dropped.
    pub async fn post(&self) -> Result<usize, WrapperError> {
        let mut events = self.events.lock().await;
        if events.is_empty() {
            return Ok(0);
        }

        let mut consumed = 0;
        let mut sent = 0;
        let mut rejected: Option<(u16, usize)> = None;
        let mut outcome = Ok(());
        while consumed < events.len() {
            let end = self.chunk_end(&events, consumed);
            let chunk = &events[consumed..end];
            match self.post_chunk(chunk).await {
                Ok(()) => sent += chunk.len(),
                Err(WrapperError::PostStatus(status)) if (400..500).contains(&status) => {
                    tracing::error!(status, events = chunk.len(), "Receiver rejected chunk");
                    for record in chunk.iter().filter_map(|event| event.record.as_ref()) {
                        let line = normalize(record);
                        tracing::warn!(
                            record = %String::from_utf8_lossy(&line).trim_end(),
                            "Dropped captured line"
                        );
                    }
                    let dropped = rejected.map_or(0, |(_, dropped)| dropped) + chunk.len();
                    rejected = Some((status, dropped));
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
            consumed = end;
        }
        events.drain(..consumed);

        outcome?;
        match rejected {
            Some((status, dropped)) => Err(WrapperError::Rejected { status, dropped }),
            None => Ok(sent),
        }
    }

    /// Returns the end of the chunk starting at `start`.
    ///
    /// A chunk always holds at least one event, even one larger than the byte
    /// bound on its own.
    fn chunk_end(&self, events: &[TelemetryEvent], start: usize) -> usize {
        let mut bytes = 2;
        let mut end = start;
        for event in &events[start..] {
            if end - start == self.chunk_size {
                break;
            }
            let size = encoded_len(event) + usize::from(end > start);
            if end > start && bytes + size > self.chunk_bytes {
                break;
            }
            bytes += size;
            end += 1;
        }
        end
    }

    async fn post_chunk(&self, chunk: &[TelemetryEvent]) -> Result<(), WrapperError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(chunk)
            .send()
            .await
            .map_err(WrapperError::Post)?;

        let status = response.status();
        if !status.is_success() {
            return Err(WrapperError::PostStatus(status.as_u16()));
        }
        tracing::debug!(events = chunk.len(), "Telemetry posted");
        Ok(())
    }

    /// Posts on a fixed interval until `cancel` fires, then posts once more.
    ///
    /// Post errors are logged and the loop keeps running.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.post_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            let last = tokio::select! {
                _ = cancel.cancelled() => true,
                _ = ticker.tick() => false,
            };

            match self.post().await {
                Ok(0) => {}
                Ok(sent) => tracing::debug!(events = sent, "Posted captured lines"),
                Err(e) => tracing::error!(error = %e, "Failed to post captured lines"),
            }

            if last {
                break;
            }
        }
        tracing::info!("Telemetry client stopped");
    }
}

/// Runs a handler as a child process and captures its stdout.
pub struct Wrapper {
    config: WrapperConfig,
    endpoint: String,
}

impl Wrapper {
    /// Creates a wrapper posting captured lines to `endpoint`.
    pub fn new(config: WrapperConfig, endpoint: impl Into<String>) -> Self {
        Self {
            config,
            endpoint: endpoint.into(),
        }
    }

    /// Fails if this process is itself a wrapped child.
    ///
    /// # Errors
    ///
    /// Returns [`WrapperError::Recursive`] when the marker variable is set.
    pub fn check_reentrancy(&self) -> Result<(), WrapperError> {
        let marked =
            std::env::var_os(&self.config.marker_env).is_some_and(|value| !value.is_empty());
        if marked {
            return Err(WrapperError::Recursive {
                marker: self.config.marker_env.clone(),
            });
        }
        Ok(())
    }

    /// Runs `handler` until it exits or `cancel` fires.
    ///
    /// Returns the exit code this process should exit with.
    ///
    /// # Errors
    ///
    /// Fails before spawning on re-entrancy, and when the child cannot be
    /// started or supervised.
    pub async fn run(&self, handler: &str, cancel: CancellationToken) -> Result<i32, WrapperError> {
        self.check_reentrancy()?;

        let command = resolve_handler(handler, self.config.task_root.as_deref());
        let client = Arc::new(TelemetryApiClient::new(self.endpoint.clone(), &self.config)?);
        tracing::info!(command = %command.display(), endpoint = %self.endpoint, "Running handler");

        let mut child = Command::new(&command)
            .env(&self.config.marker_env, "1")
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WrapperError::Spawn {
                command: command.clone(),
                source,
            })?;

        let reader = child.stdout.take().map(|stdout| {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                if let Err(e) = client.capture(stdout).await {
                    tracing::error!(error = %e, "Failed to read handler output");
                }
            })
        });

        let poster_cancel = CancellationToken::new();
        let poster = tokio::spawn({
            let client = Arc::clone(&client);
            let cancel = poster_cancel.clone();
            async move { client.run(cancel).await }
        });

        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };
        let status = match exited {
            Some(status) => status,
            None => self.terminate(&mut child).await,
        }
        .map_err(WrapperError::Supervise);

        if let Some(mut reader) = reader
            && tokio::time::timeout(self.config.grace_period, &mut reader)
                .await
                .is_err()
        {
            tracing::warn!("Handler output still open after exit, abandoning reader");
            reader.abort();
        }

        poster_cancel.cancel();
        if let Err(e) = poster.await {
            tracing::error!(error = %e, "Telemetry client task failed");
        }

        let code = exit_code(status?);
        if code != 0 {
            tracing::error!(exit_code = code, "Handler failed");
        } else {
            tracing::info!("Handler exited");
        }
        Ok(code)
    }

    async fn terminate(&self, child: &mut Child) -> std::io::Result<ExitStatus> {
        if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
            tracing::info!(pid, "Sending SIGTERM to handler");
            if let Err(e) = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGTERM,
            ) {
                tracing::warn!(error = %e, "Failed to signal handler");
            }
        }

        match tokio::time::timeout(self.config.grace_period, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                tracing::warn!(
                    grace_ms = self.config.grace_period.as_millis() as u64,
                    "Handler did not exit in time, killing it"
                );
                child.kill().await?;
                child.wait().await
            }
        }
    }
}

fn encoded_len(event: &TelemetryEvent) -> usize {
    serde_json::to_vec(event).map_or(0, |encoded| encoded.len())
}

/// Resolves a relative handler path against the task root.
pub fn resolve_handler(handler: &str, task_root: Option<&Path>) -> PathBuf {
    let path = Path::new(handler);
    match task_root {
        Some(root) if !path.is_absolute() => root.join(path),
        _ => path.to_path_buf(),
    }
}

/// Translates a child exit status into a process exit code.
///
/// Signal deaths map to `128 + signal`.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1)
}
