//! The finished-span record consumed by the pipeline.
//!
//! Spans arrive from an instrumentation layer that is out of scope here;
//! this module defines the immutable value the mapper reads. Identifiers
//! follow the W3C trace-context sizes (16-byte trace id, 8-byte span id)
//! and render as lowercase hex on the wire.

use std::collections::HashMap;
use std::fmt;

/// Trace-state entry carrying the sampling percentage applied to the span.
const SAMPLING_TRACE_STATE_KEY: &str = "ai_sampling";

/// A 16-byte trace identifier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TraceId(u128);

impl TraceId {
    /// Invalid (all zero) trace id.
    pub const INVALID: TraceId = TraceId(0);

    /// Construct from the raw big-endian bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        TraceId(u128::from_be_bytes(bytes))
    }

    /// Construct from a u128, mainly useful in tests.
    pub const fn from_u128(value: u128) -> Self {
        TraceId(value)
    }

    /// Parse a 32-character lowercase hex representation.
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 32 {
            return None;
        }
        u128::from_str_radix(hex, 16).ok().map(TraceId)
    }

    /// Whether this id is non-zero.
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// An 8-byte span identifier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SpanId(u64);

impl SpanId {
    /// Invalid (all zero) span id.
    pub const INVALID: SpanId = SpanId(0);

    /// Construct from the raw big-endian bytes.
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        SpanId(u64::from_be_bytes(bytes))
    }

    /// Construct from a u64, mainly useful in tests.
    pub const fn from_u64(value: u64) -> Self {
        SpanId(value)
    }

    /// Parse a 16-character lowercase hex representation.
    pub fn from_hex(hex: &str) -> Option<Self> {
        if !Self::is_valid_hex(hex) {
            return None;
        }
        u64::from_str_radix(hex, 16).ok().map(SpanId)
    }

    /// Whether `hex` is a well-formed, non-zero span id: exactly 16
    /// hex digits that are not all zero.
    pub fn is_valid_hex(hex: &str) -> bool {
        hex.len() == 16
            && hex.bytes().all(|b| b.is_ascii_hexdigit())
            && hex.bytes().any(|b| b != b'0')
    }

    /// Whether this id is non-zero.
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// The role a span plays in a trace.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SpanKind {
    /// Handles a synchronous inbound call.
    Server,
    /// Makes a synchronous outbound call.
    Client,
    /// Publishes to a message broker.
    Producer,
    /// Receives from a message broker.
    Consumer,
    /// Does not cross a process boundary.
    #[default]
    Internal,
}

/// Final disposition of the span.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SpanStatus {
    /// No explicit status was recorded.
    #[default]
    Unset,
    /// Explicitly marked successful.
    Ok,
    /// The operation failed.
    Error,
}

/// A typed attribute value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Boolean value.
    Bool(bool),
    /// Signed integer value.
    I64(i64),
    /// Floating point value.
    F64(f64),
    /// String value.
    String(String),
    /// Homogeneous array of values.
    Array(Vec<Value>),
}

impl Value {
    /// The string payload, when this value is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// The integer payload, when this value is an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    /// The boolean payload, when this value is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
            Value::String(v) => f.write_str(v),
            Value::Array(values) => {
                // Array attributes are rendered comma separated on the wire.
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{value}")?;
                }
                Ok(())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::I64(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::F64(value)
    }
}

/// A timestamped event recorded on a span.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SpanEvent {
    /// Event name.
    pub name: String,
    /// Wall clock time as nanoseconds since the Unix epoch.
    pub unix_nanos: i64,
    /// Event attributes.
    pub attributes: HashMap<String, Value>,
}

/// A causal link to a span in the same or another trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpanLink {
    /// Trace id of the linked span.
    pub trace_id: TraceId,
    /// Span id of the linked span.
    pub span_id: SpanId,
}

/// One finished unit of work, as handed to the pipeline.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Span {
    /// Trace this span belongs to.
    pub trace_id: TraceId,
    /// This span's id.
    pub span_id: SpanId,
    /// Parent span id; `SpanId::INVALID` for root spans.
    pub parent_span_id: SpanId,
    /// Whether the parent context was propagated from another process.
    pub parent_is_remote: bool,
    /// Span kind.
    pub kind: SpanKind,
    /// Span name.
    pub name: String,
    /// Start time, nanoseconds since the Unix epoch.
    pub start_unix_nanos: i64,
    /// End time, nanoseconds since the Unix epoch.
    pub end_unix_nanos: i64,
    /// Final status.
    pub status: SpanStatus,
    /// Name of the instrumentation library that produced the span.
    pub instrumentation_name: String,
    /// Typed attributes.
    pub attributes: HashMap<String, Value>,
    /// Events, in recording order.
    pub events: Vec<SpanEvent>,
    /// Links, in recording order.
    pub links: Vec<SpanLink>,
    /// Raw W3C trace-state header value.
    pub trace_state: String,
}

impl Span {
    /// Attribute lookup returning the string payload.
    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    /// Attribute lookup returning the integer payload.
    pub fn attribute_i64(&self, key: &str) -> Option<i64> {
        self.attributes.get(key).and_then(Value::as_i64)
    }

    /// The sampling percentage carried in the trace state, in (0, 100].
    ///
    /// Absent, malformed, or out-of-range entries count as unsampled-down,
    /// i.e. 100 percent.
    pub fn sample_rate(&self) -> f64 {
        trace_state_get(&self.trace_state, SAMPLING_TRACE_STATE_KEY)
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .filter(|rate| *rate > 0.0 && *rate <= 100.0)
            .unwrap_or(100.0)
    }
}

/// Looks up a list member in a raw trace-state header.
fn trace_state_get<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    header.split(',').find_map(|member| {
        let (k, v) = member.trim().split_once('=')?;
        if k == key {
            Some(v)
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_render_as_padded_lowercase_hex() {
        assert_eq!(
            TraceId::from_u128(0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736).to_string(),
            "4bf92f3577b34da6a3ce929d0e0e4736"
        );
        assert_eq!(SpanId::from_u64(0xff).to_string(), "00000000000000ff");
    }

    #[test]
    fn span_id_hex_validation() {
        assert!(SpanId::is_valid_hex("00f067aa0ba902b7"));
        assert!(!SpanId::is_valid_hex("0000000000000000"));
        assert!(!SpanId::is_valid_hex("00f067aa0ba902b"));
        assert!(!SpanId::is_valid_hex("00f067aa0ba902bg"));
    }

    #[test]
    fn hex_round_trip() {
        let trace_id = TraceId::from_u128(0x0102_0304_0506_0708_090a_0b0c_0d0e_0f10);
        assert_eq!(TraceId::from_hex(&trace_id.to_string()), Some(trace_id));
        let span_id = SpanId::from_u64(0x0102_0304_0506_0708);
        assert_eq!(SpanId::from_hex(&span_id.to_string()), Some(span_id));
        assert_eq!(SpanId::from_hex("0000000000000000"), None);
    }

    fn get_sample_rate_test_data() -> Vec<(&'static str, f64)> {
        vec![
            ("ai_sampling=25", 25.0),
            ("ai_sampling=100", 100.0),
            ("ai_sampling=0.5", 0.5),
            ("other=1,ai_sampling=50", 50.0),
            ("", 100.0),
            ("other=1", 100.0),
            ("ai_sampling=0", 100.0),
            ("ai_sampling=-3", 100.0),
            ("ai_sampling=250", 100.0),
            ("ai_sampling=abc", 100.0),
        ]
    }

    #[test]
    fn sample_rate_from_trace_state() {
        for (header, expected) in get_sample_rate_test_data() {
            let span = Span {
                trace_state: header.to_string(),
                ..Default::default()
            };
            assert_eq!(span.sample_rate(), expected, "header {header:?}");
        }
    }

    #[test]
    fn array_values_join_with_comma() {
        let value = Value::Array(vec![Value::I64(1), Value::String("a".into()), Value::Bool(true)]);
        assert_eq!(value.to_string(), "1, a, true");
    }
}
