//! Buffering and delivery engine.
//!
//! [`LogSender`] accumulates normalized log lines and delivers them to a
//! [`RecordSink`] in batches. Batches are flushed explicitly (after each
//! ingested request), when a buffer bound would be exceeded, optionally on a
//! timer, and once more on shutdown. `send` and `flush` are serialized by a
//! single lock, so no two deliveries ever race and a record is never seen by a
//! flush that started before its `send` returned. The shutdown flush closes the
//! sender under the same lock, and records sent afterwards are dropped with a
//! warning.

use crate::config::BufferConfig;
use crate::retry::RetryPolicy;
use crate::sink::{RecordSink, SinkError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Error returned when a batch could not be delivered.
///
/// Only produced in strict mode; otherwise exhausted batches are logged and dropped.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum FlushError {
    /// Delivery failed on every attempt and the batch was dropped.
    #[error("dropped {dropped} records after {attempts} delivery attempts")]
    Exhausted {
        /// Number of records dropped.
        dropped: usize,
        /// Number of attempts made.
        attempts: u32,
        /// Last delivery error.
        #[source]
        source: SinkError,
    },

    /// The sender was closed and the record was dropped.
    #[error("sender is closed, record dropped")]
    Closed,
}

/// Snapshot of the delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderStats {
    /// Batches delivered successfully.
    pub batches_delivered: u64,
    /// Records delivered successfully.
    pub records_delivered: u64,
    /// Records dropped after exhausted retries or after closing.
    pub records_dropped: u64,
}

#[derive(Default)]
struct Buffer {
    records: Vec<Vec<u8>>,
    bytes: usize,
    closed: bool,
}

impl Buffer {
    fn push(&mut self, record: Vec<u8>) {
        self.bytes += record.len();
        self.records.push(record);
    }

    fn reset(&mut self) {
        self.records.clear();
        self.bytes = 0;
    }
}

#[derive(Default)]
struct Counters {
    batches_delivered: AtomicU64,
    records_delivered: AtomicU64,
    records_dropped: AtomicU64,
}

/// Buffers log records and delivers them to a sink with bounded retry.
pub struct LogSender<S> {
    sink: S,
    buffer: Mutex<Buffer>,
    max_records: usize,
    max_bytes: usize,
    retry: RetryPolicy,
    strict: bool,
    counters: Counters,
}

impl<S: RecordSink> LogSender<S> {
    /// Creates a sender delivering to `sink`.
    pub fn new(sink: S, buffer: &BufferConfig, retry: RetryPolicy) -> Self {
        let max_records = buffer.max_records.max(1);
        Self {
            sink,
            buffer: Mutex::new(Buffer {
                records: Vec::with_capacity(max_records),
                bytes: 0,
                closed: false,
            }),
            max_records,
            max_bytes: buffer.max_bytes,
            retry,
            strict: false,
            counters: Counters::default(),
        }
    }

    /// Makes exhausted deliveries return an error instead of only logging.
    ///
    /// The buffer is reset either way.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Returns the sink this sender delivers to.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Appends one record, flushing first if a buffer bound would be exceeded.
    ///
    /// The record is appended even if that inline flush fails. A single record
    /// larger than the byte bound is accepted into an empty buffer.
    ///
    /// # Errors
    ///
    /// Returns the inline flush error in strict mode, and
    /// [`FlushError::Closed`] once the sender is closed.
    pub async fn send(&self, record: Vec<u8>) -> Result<(), FlushError> {
        let mut buffer = self.buffer.lock().await;
        if buffer.closed {
            log_dropped(&record);
            self.counters.records_dropped.fetch_add(1, Ordering::Relaxed);
            return Err(FlushError::Closed);
        }

        let full = buffer.records.len() >= self.max_records
            || buffer.bytes + record.len() > self.max_bytes;
        let result = if full && !buffer.records.is_empty() {
            tracing::debug!(
                records = buffer.records.len(),
                bytes = buffer.bytes,
                "Buffer bound reached, flushing"
            );
            self.flush_locked(&mut buffer).await
        } else {
            Ok(())
        };

        buffer.push(record);
        result
    }

    /// Delivers the buffered records, if any.
    ///
    /// # Errors
    ///
    /// Returns [`FlushError::Exhausted`] in strict mode when every attempt failed.
    pub async fn flush(&self) -> Result<(), FlushError> {
        let mut buffer = self.buffer.lock().await;
        self.flush_locked(&mut buffer).await
    }

    /// Delivers the buffered records one last time and closes the sender.
    ///
    /// # Errors
    ///
    /// See [`flush`](Self::flush).
    pub async fn close(&self) -> Result<(), FlushError> {
        let mut buffer = self.buffer.lock().await;
        buffer.closed = true;
        tracing::debug!(records = buffer.records.len(), "Closing sender");
        self.flush_locked(&mut buffer).await
    }

    async fn flush_locked(&self, buffer: &mut Buffer) -> Result<(), FlushError> {
        if buffer.records.is_empty() {
            return Ok(());
        }

        let count = buffer.records.len();
        let sink = &self.sink;
        let records = &buffer.records;
        tracing::debug!(
            destination = sink.destination(),
            records = count,
            bytes = buffer.bytes,
            "Delivering batch"
        );

        let result = self.retry.retry(move || sink.put_records(records)).await;

        let outcome = match result {
            Ok(()) => {
                tracing::info!(
                    destination = sink.destination(),
                    records = count,
                    "Batch delivered"
                );
                self.counters.batches_delivered.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .records_delivered
                    .fetch_add(count as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    destination = sink.destination(),
                    records = count,
                    attempts = self.retry.max_attempts(),
                    error = %e,
                    "Delivery failed, dropping batch"
                );
                for record in &buffer.records {
                    log_dropped(record);
                }
                self.counters
                    .records_dropped
                    .fetch_add(count as u64, Ordering::Relaxed);
                Err(FlushError::Exhausted {
                    dropped: count,
                    attempts: self.retry.max_attempts(),
                    source: e,
                })
            }
        };

        buffer.reset();

        match outcome {
            Err(e) if self.strict => Err(e),
            _ => Ok(()),
        }
    }

    /// Flushes on a fixed interval until `cancel` fires.
    ///
    /// Does not perform a final flush; the owner drains the sender once every
    /// producer has stopped.
    pub async fn run_periodic(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.flush().await {
                        tracing::warn!(error = %e, "Periodic flush failed");
                    }
                }
            }
        }
        tracing::debug!("Periodic flusher stopped");
    }

    /// Returns the number of buffered records and their total size in bytes.
    pub async fn buffered(&self) -> (usize, usize) {
        let buffer = self.buffer.lock().await;
        (buffer.records.len(), buffer.bytes)
    }

    /// Returns a snapshot of the delivery counters.
    pub fn stats(&self) -> SenderStats {
        SenderStats {
            batches_delivered: self.counters.batches_delivered.load(Ordering::Relaxed),
            records_delivered: self.counters.records_delivered.load(Ordering::Relaxed),
            records_dropped: self.counters.records_dropped.load(Ordering::Relaxed),
        }
    }
}

fn log_dropped(record: &[u8]) {
    tracing::warn!(
        record = %String::from_utf8_lossy(record).trim_end(),
        "Dropped record"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct MemorySink {
        batches: std::sync::Mutex<Vec<Vec<Vec<u8>>>>,
        failures_left: AtomicUsize,
        calls: AtomicUsize,
    }

    impl MemorySink {
        fn failing(times: usize) -> Self {
            Self {
                failures_left: AtomicUsize::new(times),
                ..Default::default()
            }
        }

        fn batch_sizes(&self) -> Vec<usize> {
            self.batches.lock().unwrap().iter().map(Vec::len).collect()
        }

        fn concatenated(&self) -> Vec<u8> {
            self.batches
                .lock()
                .unwrap()
                .iter()
                .flatten()
                .flatten()
                .copied()
                .collect()
        }
    }

    impl RecordSink for Arc<MemorySink> {
        async fn put_records(&self, records: &[Vec<u8>]) -> Result<(), SinkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(SinkError::Request {
                    backend: "memory",
                    message: "unavailable".to_string(),
                });
            }
            self.batches.lock().unwrap().push(records.to_vec());
            Ok(())
        }

        fn destination(&self) -> &str {
            "memory"
        }
    }

    fn sender(
        sink: &Arc<MemorySink>,
        max_records: usize,
        max_bytes: usize,
    ) -> LogSender<Arc<MemorySink>> {
        let buffer = BufferConfig {
            max_records,
            max_bytes,
            flush_interval: None,
        };
        let retry = RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(4), 3);
        LogSender::new(Arc::clone(sink), &buffer, retry)
    }

    #[tokio::test]
    async fn test_flush_delivers_in_order_then_noops() {
        let sink = Arc::new(MemorySink::default());
        let sender = sender(&sink, 10, 1024);

        for line in ["a\n", "b\n", "c\n"] {
            sender.send(line.as_bytes().to_vec()).await.unwrap();
        }
        assert!(sink.batch_sizes().is_empty());

        sender.flush().await.unwrap();
        sender.flush().await.unwrap();

        assert_eq!(sink.batch_sizes(), vec![3]);
        assert_eq!(sink.concatenated(), b"a\nb\nc\n");
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
        assert_eq!(sender.buffered().await, (0, 0));
    }

    #[tokio::test]
    async fn test_count_bound_is_never_exceeded() {
        let sink = Arc::new(MemorySink::default());
        let sender = sender(&sink, 3, 1024);

        for i in 0..7 {
            sender.send(format!("{i}\n").into_bytes()).await.unwrap();
            let (records, _) = sender.buffered().await;
            assert!(records <= 3);
        }

        assert_eq!(sink.batch_sizes(), vec![3, 3]);
        assert_eq!(sender.buffered().await.0, 1);
    }

    #[tokio::test]
    async fn test_byte_bound_is_never_exceeded() {
        let sink = Arc::new(MemorySink::default());
        let sender = sender(&sink, 100, 10);

        for _ in 0..6 {
            sender.send(b"abc\n".to_vec()).await.unwrap();
            let (_, bytes) = sender.buffered().await;
            assert!(bytes <= 10);
        }

        assert_eq!(sink.batch_sizes(), vec![2, 2]);
        assert_eq!(sender.buffered().await, (2, 8));
    }

    #[tokio::test]
    async fn test_oversized_record_is_accepted() {
        let sink = Arc::new(MemorySink::default());
        let sender = sender(&sink, 100, 4);

        sender.send(b"0123456789\n".to_vec()).await.unwrap();
        assert_eq!(sender.buffered().await, (1, 11));
        assert!(sink.batch_sizes().is_empty());

        sender.send(b"x\n".to_vec()).await.unwrap();
        assert_eq!(sink.batch_sizes(), vec![1]);
        assert_eq!(sender.buffered().await, (1, 2));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let sink = Arc::new(MemorySink::failing(2));
        let sender = sender(&sink, 10, 1024);

        sender.send(b"retry me\n".to_vec()).await.unwrap();
        sender.flush().await.unwrap();

        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
        assert_eq!(sink.concatenated(), b"retry me\n");
        assert_eq!(
            sender.stats(),
            SenderStats {
                batches_delivered: 1,
                records_delivered: 1,
                records_dropped: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_exhausted_retries_drop_and_reset() {
        let sink = Arc::new(MemorySink::failing(usize::MAX));
        let sender = sender(&sink, 10, 1024);

        sender.send(b"lost-1\n".to_vec()).await.unwrap();
        sender.send(b"lost-2\n".to_vec()).await.unwrap();
        sender.flush().await.unwrap();

        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
        assert_eq!(sender.buffered().await, (0, 0));
        assert_eq!(sender.stats().records_dropped, 2);

        sender.flush().await.unwrap();
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_strict_mode_reports_and_resets() {
        let sink = Arc::new(MemorySink::failing(usize::MAX));
        let sender = sender(&sink, 10, 1024).strict(true);

        sender.send(b"lost\n".to_vec()).await.unwrap();
        let err = sender.flush().await.unwrap_err();

        assert!(matches!(err, FlushError::Exhausted { dropped: 1, attempts: 3, .. }));
        assert_eq!(sender.buffered().await, (0, 0));
    }

    #[tokio::test]
    async fn test_strict_inline_flush_still_appends() {
        let sink = Arc::new(MemorySink::failing(usize::MAX));
        let sender = sender(&sink, 1, 1024).strict(true);

        sender.send(b"first\n".to_vec()).await.unwrap();
        assert!(sender.send(b"second\n".to_vec()).await.is_err());
        assert_eq!(sender.buffered().await, (1, 7));
    }

    #[tokio::test]
    async fn test_close_flushes_then_drops_later_records() {
        let sink = Arc::new(MemorySink::default());
        let sender = sender(&sink, 10, 1024);

        sender.send(b"before\n".to_vec()).await.unwrap();
        sender.close().await.unwrap();
        assert_eq!(sink.concatenated(), b"before\n");

        let result = sender.send(b"after\n".to_vec()).await;
        assert!(matches!(result, Err(FlushError::Closed)));
        assert_eq!(sender.buffered().await, (0, 0));
        assert_eq!(sender.stats().records_dropped, 1);

        sender.flush().await.unwrap();
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_flush() {
        let sink = Arc::new(MemorySink::default());
        let sender = Arc::new(sender(&sink, 10, 1024));
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let sender = Arc::clone(&sender);
            let cancel = cancel.clone();
            async move { sender.run_periodic(Duration::from_secs(1), cancel).await }
        });

        sender.send(b"tick\n".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(sink.batch_sizes(), vec![1]);

        cancel.cancel();
        task.await.unwrap();
    }
}
