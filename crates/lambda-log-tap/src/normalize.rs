//! Conversion of telemetry records into log lines.

use serde_json::Value;

/// Turns one raw telemetry record into exactly one newline-terminated line.
///
/// A JSON string is used as-is, gaining a trailing newline only if it lacks
/// one. Any other value is written as compact single-line JSON followed by a
/// newline. Applying this to its own (string) output is a no-op.
pub fn normalize(record: &Value) -> Vec<u8> {
    let mut line = match record {
        Value::String(s) => s.as_bytes().to_vec(),
        other => serde_json::to_vec(other).unwrap_or_else(|_| other.to_string().into_bytes()),
    };
    if line.last() != Some(&b'\n') {
        line.push(b'\n');
    }
    line
}
