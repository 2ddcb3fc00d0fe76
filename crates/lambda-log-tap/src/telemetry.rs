//! Telemetry API wire types.
//!
//! This module provides the event shape pushed by the Lambda Telemetry API
//! (and by the child-process wrapper, which speaks the same protocol) and the
//! subscription request sent to the host.

use crate::config::TelemetryApiConfig;
use serde::{Deserialize, Serialize};

/// Schema version of the Telemetry API subscription.
pub const SCHEMA_VERSION: &str = "2022-12-13";

/// Types of telemetry events from the Telemetry API.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryType {
    /// Function logs from stdout/stderr.
    Function,
    /// Platform events (start, end, report, fault, extension).
    Platform,
    /// Extension logs.
    Extension,
    /// Any other event type, such as `platform.start`.
    #[serde(other)]
    Other,
}

/// One event of a Telemetry API batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Event time in ISO 8601 format.
    #[serde(default)]
    pub time: String,
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: TelemetryType,
    /// Raw event payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<serde_json::Value>,
}

impl TelemetryEvent {
    /// Creates a `function` event for one captured log line, stamped with the current time.
    pub fn function(line: impl Into<String>) -> Self {
        Self {
            time: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            event_type: TelemetryType::Function,
            record: Some(serde_json::Value::String(line.into())),
        }
    }

    /// Returns the record if this event must be forwarded downstream.
    ///
    /// Only `function` events with a non-empty record are forwarded.
    pub fn forwardable_record(&self) -> Option<&serde_json::Value> {
        if self.event_type != TelemetryType::Function {
            return None;
        }
        match self.record.as_ref()? {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) if s.is_empty() => None,
            record => Some(record),
        }
    }
}

/// Buffering configuration for Telemetry API subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferingConfig {
    /// Maximum number of events to buffer before sending.
    pub max_items: u32,
    /// Maximum size in bytes to buffer before sending.
    pub max_bytes: u32,
    /// Maximum time in milliseconds to buffer before sending.
    pub timeout_ms: u32,
}

impl From<&TelemetryApiConfig> for BufferingConfig {
    fn from(config: &TelemetryApiConfig) -> Self {
        Self {
            max_items: config.max_items,
            max_bytes: config.max_bytes,
            timeout_ms: config.timeout_ms,
        }
    }
}

/// Destination configuration for Telemetry API subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Protocol to use (HTTP only supported).
    pub protocol: String,
    /// URI to send events to.
    #[serde(rename = "URI")]
    pub uri: String,
}

/// Subscription request for the Telemetry API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySubscription {
    /// Schema version.
    pub schema_version: String,
    /// Types of telemetry to subscribe to.
    pub types: Vec<TelemetryType>,
    /// Buffering configuration.
    pub buffering: BufferingConfig,
    /// Destination for events.
    pub destination: DestinationConfig,
}

impl TelemetrySubscription {
    /// Creates a subscription for function logs and platform events.
    pub fn new(listener_uri: impl Into<String>, buffering: BufferingConfig) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            types: vec![TelemetryType::Function, TelemetryType::Platform],
            buffering,
            destination: DestinationConfig {
                protocol: "HTTP".to_string(),
                uri: listener_uri.into(),
            },
        }
    }
}
