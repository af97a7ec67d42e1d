//! The Application Insights envelope schema.
//!
//! One envelope is one unit of telemetry on the wire: a common header
//! (tenant key, time, sample rate, context tags) around one of five
//! `baseData` payloads. The mapper constructs envelopes; serialization to
//! the newline-delimited JSON transport form and the validation pass live
//! here.

use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;
use typed_builder::TypedBuilder;

pub mod sanitize;
pub mod tags;
pub mod time;

/// Envelope schema version.
const ENVELOPE_VER: i32 = 1;

/// Payload schema version shared by all baseData shapes.
const DATA_VER: i32 = 2;

/// Envelope name prefix; the payload kind is appended.
const NAME_PREFIX: &str = "Microsoft.ApplicationInsights.";

/// Errors produced by the validation pass.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum SchemaError {
    /// The envelope has no tenant key and cannot be routed.
    #[error("envelope has an empty instrumentation key")]
    EmptyInstrumentationKey,
    /// A required field of the payload is empty.
    #[error("required field {0} is empty")]
    MissingField(&'static str),
}

/// Severity attached to message and exception telemetry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SeverityLevel {
    /// Detailed diagnostic output.
    Verbose,
    /// Routine information.
    Information,
    /// Something unexpected but recoverable.
    Warning,
    /// A failure.
    Error,
    /// An unrecoverable failure.
    Critical,
}

/// Inbound request telemetry.
#[derive(Clone, Debug, PartialEq, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct RequestData {
    #[builder(default = DATA_VER)]
    pub ver: i32,
    /// Wire id of the request, the span id in lowercase hex.
    pub id: String,
    pub name: String,
    /// Elapsed time in `DD.HH:MM:SS.ffffff` form.
    pub duration: String,
    pub response_code: String,
    pub success: bool,
    #[builder(default, setter(strip_option))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[builder(default, setter(strip_option))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[builder(default)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    #[builder(default)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub measurements: BTreeMap<String, f64>,
}

/// Outbound call telemetry.
#[derive(Clone, Debug, PartialEq, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDependencyData {
    #[builder(default = DATA_VER)]
    pub ver: i32,
    pub name: String,
    /// Wire id of the dependency call, the span id in lowercase hex.
    pub id: String,
    #[builder(default, setter(strip_option))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_code: Option<String>,
    /// Elapsed time in `DD.HH:MM:SS.ffffff` form.
    pub duration: String,
    pub success: bool,
    /// Command or resource detail, e.g. the full URL or SQL text.
    #[builder(default, setter(strip_option))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Remote site the call went to.
    #[builder(default, setter(strip_option))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Dependency classification, e.g. `Http` or `SQL`.
    #[builder(default, setter(strip_option))]
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub dependency_type: Option<String>,
    #[builder(default)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    #[builder(default)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub measurements: BTreeMap<String, f64>,
}

/// Free-form log message telemetry.
#[derive(Clone, Debug, PartialEq, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct MessageData {
    #[builder(default = DATA_VER)]
    pub ver: i32,
    pub message: String,
    #[builder(default, setter(strip_option))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity_level: Option<SeverityLevel>,
    #[builder(default)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

/// One recorded exception.
#[derive(Clone, Debug, PartialEq, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionDetails {
    pub type_name: String,
    pub message: String,
    #[builder(default = true)]
    pub has_full_stack: bool,
    #[builder(default, setter(strip_option))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Exception telemetry.
#[derive(Clone, Debug, PartialEq, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionData {
    #[builder(default = DATA_VER)]
    pub ver: i32,
    pub exceptions: Vec<ExceptionDetails>,
    #[builder(default, setter(strip_option))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity_level: Option<SeverityLevel>,
    #[builder(default)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    #[builder(default)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub measurements: BTreeMap<String, f64>,
}

/// Custom event telemetry.
#[derive(Clone, Debug, PartialEq, Serialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct EventData {
    #[builder(default = DATA_VER)]
    pub ver: i32,
    pub name: String,
    #[builder(default)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    #[builder(default)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub measurements: BTreeMap<String, f64>,
}

/// The five payload shapes an envelope can carry.
///
/// Serializes adjacently tagged, matching the wire form
/// `{"baseType":"RequestData","baseData":{...}}`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "baseType", content = "baseData")]
pub enum Data {
    RequestData(RequestData),
    RemoteDependencyData(RemoteDependencyData),
    MessageData(MessageData),
    ExceptionData(ExceptionData),
    EventData(EventData),
}

impl Data {
    /// The envelope name suffix for this payload.
    fn name_suffix(&self) -> &'static str {
        match self {
            Data::RequestData(_) => "Request",
            Data::RemoteDependencyData(_) => "RemoteDependency",
            Data::MessageData(_) => "Message",
            Data::ExceptionData(_) => "Exception",
            Data::EventData(_) => "Event",
        }
    }
}

/// One unit of telemetry in transport form.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Envelope {
    pub ver: i32,
    pub name: String,
    /// ISO-8601 UTC instant with microsecond precision.
    pub time: String,
    /// Sampling percentage in (0, 100]; the service re-inflates counts by
    /// `100 / sample_rate`.
    #[serde(rename = "sampleRate")]
    pub sample_rate: f64,
    /// Tenant key routing this envelope to a workspace.
    #[serde(rename = "iKey")]
    pub i_key: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    pub data: Data,
}

impl Envelope {
    /// Wraps a payload in an envelope header.
    pub fn new(
        i_key: String,
        time: String,
        sample_rate: f64,
        tags: BTreeMap<String, String>,
        data: Data,
    ) -> Self {
        Envelope {
            ver: ENVELOPE_VER,
            name: format!("{NAME_PREFIX}{}", data.name_suffix()),
            time,
            sample_rate,
            i_key,
            tags,
            data,
        }
    }

    /// Validation pass run before an envelope enters the transmitter.
    ///
    /// Checks required fields and applies wire defaults; an envelope that
    /// fails here is dropped, not repaired.
    pub fn validate(&mut self) -> Result<(), SchemaError> {
        if self.i_key.is_empty() {
            return Err(SchemaError::EmptyInstrumentationKey);
        }
        match &mut self.data {
            Data::RequestData(request) => {
                if request.id.is_empty() {
                    return Err(SchemaError::MissingField("id"));
                }
                if request.response_code.is_empty() {
                    request.response_code = "200".to_string();
                }
            }
            Data::RemoteDependencyData(dependency) => {
                if dependency.id.is_empty() {
                    return Err(SchemaError::MissingField("id"));
                }
                if dependency.name.is_empty() {
                    return Err(SchemaError::MissingField("name"));
                }
            }
            Data::MessageData(message) => {
                if message.message.is_empty() {
                    return Err(SchemaError::MissingField("message"));
                }
            }
            Data::ExceptionData(exception) => {
                if exception.exceptions.is_empty() {
                    return Err(SchemaError::MissingField("exceptions"));
                }
            }
            Data::EventData(event) => {
                if event.name.is_empty() {
                    return Err(SchemaError::MissingField("name"));
                }
            }
        }
        Ok(())
    }

    /// Millisecond duration of request and dependency payloads, parsed back
    /// from the wire form. `None` for other payloads.
    pub fn duration_millis(&self) -> Option<i64> {
        let duration = match &self.data {
            Data::RequestData(request) => &request.duration,
            Data::RemoteDependencyData(dependency) => &dependency.duration,
            _ => return None,
        };
        parse_duration_millis(duration)
    }

    /// Whether the operation this envelope describes succeeded. `None` for
    /// payloads that carry no success flag.
    pub fn success(&self) -> Option<bool> {
        match &self.data {
            Data::RequestData(request) => Some(request.success),
            Data::RemoteDependencyData(dependency) => Some(dependency.success),
            _ => None,
        }
    }
}

/// Parses a `DD.HH:MM:SS.ffffff` duration down to whole milliseconds.
fn parse_duration_millis(duration: &str) -> Option<i64> {
    let (days, rest) = duration.split_once('.')?;
    let (clock, fraction) = rest.rsplit_once('.')?;
    let mut clock_parts = clock.split(':');
    let hours: i64 = clock_parts.next()?.parse().ok()?;
    let minutes: i64 = clock_parts.next()?.parse().ok()?;
    let seconds: i64 = clock_parts.next()?.parse().ok()?;
    if clock_parts.next().is_some() {
        return None;
    }
    let days: i64 = days.parse().ok()?;
    let micros: i64 = fraction.parse().ok()?;
    Some((((days * 24 + hours) * 60 + minutes) * 60 + seconds) * 1_000 + micros / 1_000)
}

/// Encodes a batch as the newline-delimited JSON transport body, one
/// envelope per line.
pub fn serialize_batch(envelopes: &[Envelope]) -> Result<Vec<u8>, serde_json::Error> {
    let mut body = Vec::new();
    for (i, envelope) in envelopes.iter().enumerate() {
        if i > 0 {
            body.push(b'\n');
        }
        body.extend_from_slice(&serde_json::to_vec(envelope)?);
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_envelope() -> Envelope {
        Envelope::new(
            "00000000-0000-0000-0000-000000000001".to_string(),
            "2020-01-01T00:00:00.000000+00:00".to_string(),
            100.0,
            BTreeMap::from([("ai.operation.id".to_string(), "abc".to_string())]),
            Data::MessageData(
                MessageData::builder()
                    .message("boom".to_string())
                    .severity_level(SeverityLevel::Warning)
                    .build(),
            ),
        )
    }

    #[test]
    fn envelope_serializes_to_wire_form() {
        let json = serde_json::to_string(&message_envelope()).unwrap();
        assert_eq!(
            json,
            "{\"ver\":1,\"name\":\"Microsoft.ApplicationInsights.Message\",\
             \"time\":\"2020-01-01T00:00:00.000000+00:00\",\"sampleRate\":100.0,\
             \"iKey\":\"00000000-0000-0000-0000-000000000001\",\
             \"tags\":{\"ai.operation.id\":\"abc\"},\
             \"data\":{\"baseType\":\"MessageData\",\
             \"baseData\":{\"ver\":2,\"message\":\"boom\",\"severityLevel\":\"Warning\"}}}"
        );
    }

    #[test]
    fn request_serialization_skips_empty_collections() {
        let data = Data::RequestData(
            RequestData::builder()
                .id("00f067aa0ba902b7".to_string())
                .name("GET /".to_string())
                .duration("00.00:00:00.150000".to_string())
                .response_code("200".to_string())
                .success(true)
                .build(),
        );
        let json = serde_json::to_string(&data).unwrap();
        assert_eq!(
            json,
            "{\"baseType\":\"RequestData\",\"baseData\":{\"ver\":2,\
             \"id\":\"00f067aa0ba902b7\",\"name\":\"GET /\",\
             \"duration\":\"00.00:00:00.150000\",\"responseCode\":\"200\",\
             \"success\":true}}"
        );
    }

    #[test]
    fn batch_is_newline_delimited() {
        let batch = vec![message_envelope(), message_envelope()];
        let body = serialize_batch(&batch).unwrap();
        let text = String::from_utf8(body).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(!text.ends_with('\n'));
    }

    #[test]
    fn validation_rejects_empty_ikey() {
        let mut envelope = message_envelope();
        envelope.i_key.clear();
        assert_eq!(
            envelope.validate(),
            Err(SchemaError::EmptyInstrumentationKey)
        );
    }

    #[test]
    fn validation_defaults_response_code() {
        let mut envelope = message_envelope();
        envelope.data = Data::RequestData(
            RequestData::builder()
                .id("00f067aa0ba902b7".to_string())
                .name("GET /".to_string())
                .duration("00.00:00:00.000001".to_string())
                .response_code(String::new())
                .success(true)
                .build(),
        );
        envelope.validate().unwrap();
        match &envelope.data {
            Data::RequestData(request) => assert_eq!(request.response_code, "200"),
            _ => unreachable!(),
        }
    }

    fn get_duration_parse_test_data() -> Vec<(&'static str, Option<i64>)> {
        vec![
            ("00.00:00:00.150000", Some(150)),
            ("00.00:00:01.000000", Some(1_000)),
            ("01.01:01:01.000001", Some(90_061_000)),
            ("00.00:00:00.000999", Some(0)),
            ("bogus", None),
            ("00.00:00.150000", None),
        ]
    }

    #[test]
    fn duration_parses_back_to_millis() {
        for (wire, expected) in get_duration_parse_test_data() {
            assert_eq!(parse_duration_millis(wire), expected, "wire {wire:?}");
        }
    }
}
