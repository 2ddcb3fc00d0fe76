//! End-to-end tests of the wrapper's telemetry client against a live receiver.

mod common;

use common::{CollectingSink, FailingSink, wait_for};
use lambda_log_tap::{
    BufferConfig, LogSender, ReceiverConfig, ReceiverHandle, RecordSink, RetryPolicy,
    TelemetryApiClient, TelemetryReceiver, WrapperConfig, WrapperError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

async fn start_receiver<S: RecordSink>(
    sink: S,
    strict: bool,
    cancel: &CancellationToken,
) -> ReceiverHandle {
    start_receiver_with_limit(sink, strict, ReceiverConfig::default().max_body_bytes, cancel).await
}

async fn start_receiver_with_limit<S: RecordSink>(
    sink: S,
    strict: bool,
    max_body_bytes: usize,
    cancel: &CancellationToken,
) -> ReceiverHandle {
    let retry = RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(2), 1);
    let sender = Arc::new(LogSender::new(sink, &BufferConfig::default(), retry).strict(strict));
    let config = ReceiverConfig {
        port: 0,
        bind_address: "127.0.0.1".to_string(),
        max_body_bytes,
        ..Default::default()
    };
    let (handle, future) = TelemetryReceiver::new(config, sender, cancel.clone())
        .start()
        .await
        .expect("Failed to start receiver");
    tokio::spawn(future);
    handle
}

fn wrapper_config(post_interval_ms: u64, chunk_size: usize) -> WrapperConfig {
    WrapperConfig {
        post_interval: Duration::from_millis(post_interval_ms),
        chunk_size,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_written_lines_arrive_in_order() {
    let cancel = CancellationToken::new();
    let sink = CollectingSink::new();
    let receiver = start_receiver(sink.clone(), false, &cancel).await;

    let client = Arc::new(
        TelemetryApiClient::new(receiver.url(), &wrapper_config(100, 500)).unwrap(),
    );
    let (mut writer, reader) = client.pipe();

    let poster_cancel = CancellationToken::new();
    let poster = tokio::spawn({
        let client = Arc::clone(&client);
        let cancel = poster_cancel.clone();
        async move { client.run(cancel).await }
    });

    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(60)).await;
        for line in ["foo\n", "bar\n", "baz\n"] {
            writer.write_all(line.as_bytes()).await.unwrap();
        }
    }
    drop(writer);
    assert_eq!(reader.await.unwrap(), 15);

    poster_cancel.cancel();
    poster.await.unwrap();

    assert_eq!(sink.contents(), "foo\nbar\nbaz\n".repeat(5));
    assert!(client.pending().await.is_empty());

    cancel.cancel();
}

#[tokio::test]
async fn test_periodic_post_without_cancellation() {
    let cancel = CancellationToken::new();
    let sink = CollectingSink::new();
    let receiver = start_receiver(sink.clone(), false, &cancel).await;

    let client = Arc::new(
        TelemetryApiClient::new(receiver.url(), &wrapper_config(50, 500)).unwrap(),
    );
    let (mut writer, _reader) = client.pipe();

    let poster_cancel = CancellationToken::new();
    tokio::spawn({
        let client = Arc::clone(&client);
        let cancel = poster_cancel.clone();
        async move { client.run(cancel).await }
    });

    writer.write_all(b"tick\n").await.unwrap();
    wait_for(Duration::from_secs(2), || sink.record_count() == 1)
        .await
        .expect("Line was not posted by the timer");
    assert_eq!(sink.contents(), "tick\n");

    poster_cancel.cancel();
    cancel.cancel();
}

#[tokio::test]
async fn test_post_splits_into_chunks() {
    let cancel = CancellationToken::new();
    let sink = CollectingSink::new();
    let receiver = start_receiver(sink.clone(), false, &cancel).await;

    let client = TelemetryApiClient::new(receiver.url(), &wrapper_config(1000, 2)).unwrap();
    client.capture(&b"1\n2\n3\n4\n5\n"[..]).await.unwrap();

    assert_eq!(client.post().await.unwrap(), 5);
    assert_eq!(sink.batch_sizes(), vec![2, 2, 1]);
    assert_eq!(sink.contents(), "1\n2\n3\n4\n5\n");
    assert_eq!(receiver.requests_received(), 3);
    assert_eq!(client.post().await.unwrap(), 0);

    cancel.cancel();
}

#[tokio::test]
async fn test_rejected_post_keeps_events() {
    let cancel = CancellationToken::new();
    let receiver = start_receiver(FailingSink::new(), true, &cancel).await;

    let client = TelemetryApiClient::new(receiver.url(), &wrapper_config(1000, 500)).unwrap();
    client.capture(&b"retry later\n"[..]).await.unwrap();

    let result = client.post().await;
    assert!(matches!(result, Err(WrapperError::PostStatus(500))));
    assert_eq!(client.pending().await.len(), 1);

    cancel.cancel();
}

#[tokio::test]
async fn test_large_lines_are_split_below_body_limit() {
    let cancel = CancellationToken::new();
    let sink = CollectingSink::new();
    let receiver = start_receiver(sink.clone(), false, &cancel).await;

    let client = TelemetryApiClient::new(receiver.url(), &WrapperConfig::default()).unwrap();
    let line = format!("{}\n", "x".repeat(5000));
    let output = line.repeat(500);
    assert_eq!(client.capture(output.as_bytes()).await.unwrap(), 500);

    assert_eq!(client.post().await.unwrap(), 500);
    assert!(client.pending().await.is_empty());
    assert_eq!(sink.record_count(), 500);
    assert_eq!(sink.contents(), output);
    assert!(receiver.requests_received() > 1);

    cancel.cancel();
}

#[tokio::test]
async fn test_oversized_chunk_is_dropped_and_later_lines_delivered() {
    let cancel = CancellationToken::new();
    let sink = CollectingSink::new();
    let receiver = start_receiver_with_limit(sink.clone(), false, 1024, &cancel).await;

    let config = WrapperConfig {
        chunk_bytes: 512,
        ..Default::default()
    };
    let client = TelemetryApiClient::new(receiver.url(), &config).unwrap();
    let output = format!("small1\n{}\nsmall2\n", "x".repeat(2000));
    client.capture(output.as_bytes()).await.unwrap();

    let result = client.post().await;
    assert!(matches!(
        result,
        Err(WrapperError::Rejected {
            status: 413,
            dropped: 1
        })
    ));
    assert!(client.pending().await.is_empty());
    assert_eq!(sink.contents(), "small1\nsmall2\n");

    assert_eq!(client.post().await.unwrap(), 0);

    cancel.cancel();
}
