//! Shared test utilities for lambda-log-tap integration tests.
//!
//! This module provides in-memory sinks, a mock of the Extensions and
//! Telemetry APIs, and event-driven waiting utilities to replace arbitrary
//! sleeps in tests.

#![allow(dead_code)]

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use lambda_log_tap::{RecordSink, SinkError};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Sink that keeps every delivered batch in memory.
#[derive(Clone, Default)]
pub struct CollectingSink {
    batches: Arc<Mutex<Vec<Vec<Vec<u8>>>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all delivered bytes concatenated in delivery order.
    pub fn contents(&self) -> String {
        let batches = self.batches.lock().unwrap();
        let bytes: Vec<u8> = batches.iter().flatten().flatten().copied().collect();
        String::from_utf8(bytes).unwrap()
    }

    /// Returns the number of records of each delivered batch.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().iter().map(Vec::len).collect()
    }

    pub fn record_count(&self) -> usize {
        self.batch_sizes().iter().sum()
    }
}

impl RecordSink for CollectingSink {
    async fn put_records(&self, records: &[Vec<u8>]) -> Result<(), SinkError> {
        self.batches.lock().unwrap().push(records.to_vec());
        Ok(())
    }

    fn destination(&self) -> &str {
        "collecting"
    }
}

/// Sink whose every write fails.
#[derive(Clone, Default)]
pub struct FailingSink {
    calls: Arc<AtomicUsize>,
}

impl FailingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RecordSink for FailingSink {
    async fn put_records(&self, _records: &[Vec<u8>]) -> Result<(), SinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(SinkError::Request {
            backend: "failing",
            message: "service unavailable".to_string(),
        })
    }

    fn destination(&self) -> &str {
        "failing"
    }
}

/// Sink that holds its first write for a while, then collects like
/// [`CollectingSink`].
#[derive(Clone)]
pub struct StallingSink {
    inner: CollectingSink,
    stall: Duration,
    calls: Arc<AtomicUsize>,
}

impl StallingSink {
    pub fn new(stall: Duration) -> Self {
        Self {
            inner: CollectingSink::new(),
            stall,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn contents(&self) -> String {
        self.inner.contents()
    }

    pub fn record_count(&self) -> usize {
        self.inner.record_count()
    }
}

impl RecordSink for StallingSink {
    async fn put_records(&self, records: &[Vec<u8>]) -> Result<(), SinkError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(self.stall).await;
        }
        self.inner.put_records(records).await
    }

    fn destination(&self) -> &str {
        "stalling"
    }
}

/// Telemetry API batch with one `function` event per line.
pub fn function_batch(lines: &[&str]) -> Value {
    Value::Array(
        lines
            .iter()
            .map(|line| {
                json!({"time": "2024-01-01T00:00:00.000Z", "type": "function", "record": line})
            })
            .collect(),
    )
}

/// Polls `condition` until it holds.
///
/// Returns an error describing the failure if `timeout` elapses first.
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> Result<(), String>
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Err(format!("condition not met after {timeout:?}"))
}

/// Request recorded by the mock host.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub headers: HeaderMap,
    pub body: Value,
}

/// Mock of the Lambda Extensions and Telemetry APIs.
#[derive(Default)]
pub struct MockHost {
    registrations: Mutex<Vec<RecordedRequest>>,
    subscriptions: Mutex<Vec<RecordedRequest>>,
    next_event_headers: Mutex<Vec<HeaderMap>>,
    events: Mutex<VecDeque<Value>>,
    event_available: Notify,
    omit_identifier: AtomicBool,
    subscribe_status: AtomicU16,
    addr: Mutex<Option<SocketAddr>>,
}

pub const EXTENSION_ID: &str = "test-extension-id";

impl MockHost {
    /// Starts the mock on a free local port.
    pub async fn start() -> Arc<Self> {
        let host = Arc::new(MockHost {
            subscribe_status: AtomicU16::new(200),
            ..Default::default()
        });

        let app = Router::new()
            .route("/2020-01-01/extension/register", post(register))
            .route("/2020-01-01/extension/event/next", get(next_event))
            .route("/2022-07-01/telemetry", put(subscribe))
            .with_state(Arc::clone(&host));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        *host.addr.lock().unwrap() = Some(listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        host
    }

    /// Returns the address in `AWS_LAMBDA_RUNTIME_API` form.
    pub fn runtime_api(&self) -> String {
        self.addr.lock().unwrap().unwrap().to_string()
    }

    /// Queues a lifecycle event for the next poll.
    pub fn push_event(&self, event: Value) {
        self.events.lock().unwrap().push_back(event);
        self.event_available.notify_one();
    }

    pub fn push_shutdown(&self) {
        self.push_event(json!({
            "eventType": "SHUTDOWN",
            "shutdownReason": "spindown",
            "deadlineMs": 1_700_000_000_000u64
        }));
    }

    pub fn push_invoke(&self, request_id: &str) {
        self.push_event(json!({
            "eventType": "INVOKE",
            "requestId": request_id,
            "deadlineMs": 1_700_000_000_000u64
        }));
    }

    /// Makes registration succeed without an identifier header.
    pub fn omit_identifier(&self) {
        self.omit_identifier.store(true, Ordering::SeqCst);
    }

    pub fn set_subscribe_status(&self, status: u16) {
        self.subscribe_status.store(status, Ordering::SeqCst);
    }

    pub fn registrations(&self) -> Vec<RecordedRequest> {
        self.registrations.lock().unwrap().clone()
    }

    pub fn subscriptions(&self) -> Vec<RecordedRequest> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub fn next_event_headers(&self) -> Vec<HeaderMap> {
        self.next_event_headers.lock().unwrap().clone()
    }
}

async fn register(
    State(host): State<Arc<MockHost>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    host.registrations
        .lock()
        .unwrap()
        .push(RecordedRequest { headers, body });

    let body = Json(json!({
        "functionName": "test-function",
        "functionVersion": "$LATEST",
        "handler": "bootstrap"
    }));
    if host.omit_identifier.load(Ordering::SeqCst) {
        body.into_response()
    } else {
        ([("Lambda-Extension-Identifier", EXTENSION_ID)], body).into_response()
    }
}

async fn next_event(State(host): State<Arc<MockHost>>, headers: HeaderMap) -> Json<Value> {
    host.next_event_headers.lock().unwrap().push(headers);
    loop {
        let notified = host.event_available.notified();
        let event = host.events.lock().unwrap().pop_front();
        if let Some(event) = event {
            return Json(event);
        }
        notified.await;
    }
}

async fn subscribe(
    State(host): State<Arc<MockHost>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    host.subscriptions
        .lock()
        .unwrap()
        .push(RecordedRequest { headers, body });

    let status = StatusCode::from_u16(host.subscribe_status.load(Ordering::SeqCst))
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, "OK")
}
