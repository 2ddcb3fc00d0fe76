//! Delivery backends.
//!
//! Both supported streams are modeled the same way: one batched write of
//! opaque byte records to a named destination. [`StreamSink`] binds exactly one
//! of them at construction time.

use crate::config::{SinkConfig, SinkKind};
use aws_sdk_firehose::error::DisplayErrorContext as FirehoseErrorContext;
use aws_sdk_kinesis::error::DisplayErrorContext as KinesisErrorContext;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

/// Error returned by a single batched write.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The backend call failed.
    #[error("{backend} request failed: {message}")]
    Request {
        /// Backend name.
        backend: &'static str,
        /// Error description including the service error context.
        message: String,
    },

    /// The call succeeded but some records were rejected.
    #[error("{backend} rejected {failed} of {total} records")]
    PartialFailure {
        /// Backend name.
        backend: &'static str,
        /// Number of rejected records.
        failed: usize,
        /// Number of records in the batch.
        total: usize,
    },

    /// A record could not be converted into a backend entry.
    #[error("failed to build {backend} record")]
    Build {
        /// Backend name.
        backend: &'static str,
        /// Underlying build error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// No destination stream was configured.
    #[error("destination stream name is not configured")]
    NoStream,
}

/// A destination that accepts batches of opaque records.
pub trait RecordSink: Send + Sync + 'static {
    /// Writes all records in one batched call.
    fn put_records(
        &self,
        records: &[Vec<u8>],
    ) -> impl Future<Output = Result<(), SinkError>> + Send;

    /// Returns the name of the destination stream, for logging.
    fn destination(&self) -> &str;
}

/// The configured stream backend.
pub enum StreamSink {
    /// Amazon Data Firehose delivery stream.
    Firehose {
        /// SDK client.
        client: aws_sdk_firehose::Client,
        /// Delivery stream name.
        stream: String,
    },
    /// Kinesis Data Stream.
    Kinesis {
        /// SDK client.
        client: aws_sdk_kinesis::Client,
        /// Stream name.
        stream: String,
        /// Rotating partition key source.
        sequence: AtomicU64,
    },
}

impl StreamSink {
    /// Builds the sink selected by configuration, loading AWS credentials from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::NoStream`] if no stream name is configured.
    pub async fn from_config(config: &SinkConfig) -> Result<Self, SinkError> {
        let stream = config
            .stream_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .ok_or(SinkError::NoStream)?;

        let sdk_config = aws_config::load_from_env().await;
        let sink = match config.kind {
            SinkKind::Firehose => StreamSink::Firehose {
                client: aws_sdk_firehose::Client::new(&sdk_config),
                stream,
            },
            SinkKind::Kinesis => StreamSink::Kinesis {
                client: aws_sdk_kinesis::Client::new(&sdk_config),
                stream,
                sequence: AtomicU64::new(0),
            },
        };
        tracing::info!(backend = sink.backend(), stream = sink.destination(), "Sink configured");
        Ok(sink)
    }

    /// Returns the backend name.
    pub fn backend(&self) -> &'static str {
        match self {
            StreamSink::Firehose { .. } => "firehose",
            StreamSink::Kinesis { .. } => "kinesis",
        }
    }
}

impl RecordSink for StreamSink {
    async fn put_records(&self, records: &[Vec<u8>]) -> Result<(), SinkError> {
        match self {
            StreamSink::Firehose { client, stream } => {
                put_record_batch(client, stream, records).await
            }
            StreamSink::Kinesis {
                client,
                stream,
                sequence,
            } => put_kinesis_records(client, stream, sequence, records).await,
        }
    }

    fn destination(&self) -> &str {
        match self {
            StreamSink::Firehose { stream, .. } | StreamSink::Kinesis { stream, .. } => stream,
        }
    }
}

async fn put_record_batch(
    client: &aws_sdk_firehose::Client,
    stream: &str,
    records: &[Vec<u8>],
) -> Result<(), SinkError> {
    use aws_sdk_firehose::{primitives::Blob, types::Record};

    let entries = records
        .iter()
        .map(|data| Record::builder().data(Blob::new(data.clone())).build())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| SinkError::Build {
            backend: "firehose",
            source: Box::new(e),
        })?;

    let output = client
        .put_record_batch()
        .delivery_stream_name(stream)
        .set_records(Some(entries))
        .send()
        .await
        .map_err(|e| SinkError::Request {
            backend: "firehose",
            message: FirehoseErrorContext(e).to_string(),
        })?;

    match usize::try_from(output.failed_put_count()).unwrap_or(0) {
        0 => Ok(()),
        failed => Err(SinkError::PartialFailure {
            backend: "firehose",
            failed,
            total: records.len(),
        }),
    }
}

async fn put_kinesis_records(
    client: &aws_sdk_kinesis::Client,
    stream: &str,
    sequence: &AtomicU64,
    records: &[Vec<u8>],
) -> Result<(), SinkError> {
    use aws_sdk_kinesis::{primitives::Blob, types::PutRecordsRequestEntry};

    let entries = records
        .iter()
        .map(|data| {
            let key = sequence.fetch_add(1, Ordering::Relaxed);
            PutRecordsRequestEntry::builder()
                .data(Blob::new(data.clone()))
                .partition_key(format!("{key:016x}"))
                .build()
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| SinkError::Build {
            backend: "kinesis",
            source: Box::new(e),
        })?;

    let output = client
        .put_records()
        .stream_name(stream)
        .set_records(Some(entries))
        .send()
        .await
        .map_err(|e| SinkError::Request {
            backend: "kinesis",
            message: KinesisErrorContext(e).to_string(),
        })?;

    match output
        .failed_record_count()
        .and_then(|count| usize::try_from(count).ok())
        .unwrap_or(0)
    {
        0 => Ok(()),
        failed => Err(SinkError::PartialFailure {
            backend: "kinesis",
            failed,
            total: records.len(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_stream_name_is_rejected() {
        let config = SinkConfig::default();
        let result = StreamSink::from_config(&config).await;
        assert!(matches!(result, Err(SinkError::NoStream)));

        let config = SinkConfig {
            kind: SinkKind::Kinesis,
            stream_name: Some(String::new()),
        };
        let result = StreamSink::from_config(&config).await;
        assert!(matches!(result, Err(SinkError::NoStream)));
    }

    #[test]
    fn test_sink_error_display() {
        let err = SinkError::PartialFailure {
            backend: "firehose",
            failed: 2,
            total: 5,
        };
        assert_eq!(err.to_string(), "firehose rejected 2 of 5 records");

        let err = SinkError::Request {
            backend: "kinesis",
            message: "throttled".to_string(),
        };
        assert!(err.to_string().contains("throttled"));
    }
}
