//! Span to envelope mapping.
//!
//! `SpanMapper::map` turns one finished span into zero or more envelopes:
//! the span itself becomes a request, dependency, message or exception
//! envelope depending on its kind and attributes, and each span event
//! becomes an exception or custom-event envelope. Classification is an
//! ordered match; the first rule that applies wins.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use thiserror::Error;

use crate::model::time::{format_duration, format_instant, NegativeDuration};
use crate::model::{
    sanitize, tags, Data, Envelope, EventData, ExceptionData, ExceptionDetails, MessageData,
    RemoteDependencyData, RequestData, SeverityLevel,
};
use crate::span::{Span, SpanKind, SpanStatus, Value};

mod dependencies;

/// Input attribute keys the mapper understands.
pub(crate) mod attrs {
    pub(crate) const HTTP_METHOD: &str = "http.method";
    pub(crate) const HTTP_URL: &str = "http.url";
    pub(crate) const HTTP_STATUS_CODE: &str = "http.status_code";
    pub(crate) const HTTP_HOST: &str = "http.host";
    pub(crate) const HTTP_CLIENT_IP: &str = "http.client_ip";
    pub(crate) const HTTP_USER_AGENT: &str = "http.user_agent";
    pub(crate) const NET_PEER_NAME: &str = "net.peer.name";
    pub(crate) const NET_PEER_PORT: &str = "net.peer.port";
    pub(crate) const NET_PEER_IP: &str = "net.peer.ip";
    pub(crate) const PEER_SERVICE: &str = "peer.service";
    pub(crate) const PEER_ADDRESS: &str = "peer.address";
    pub(crate) const DB_SYSTEM: &str = "db.system";
    pub(crate) const DB_STATEMENT: &str = "db.statement";
    pub(crate) const DB_NAME: &str = "db.name";
    pub(crate) const RPC_SYSTEM: &str = "rpc.system";
    pub(crate) const MESSAGING_SYSTEM: &str = "messaging.system";
    pub(crate) const MESSAGING_DESTINATION: &str = "messaging.destination";
    pub(crate) const MESSAGE_BUS_DESTINATION: &str = "message_bus.destination";
    pub(crate) const ENDUSER_ID: &str = "enduser.id";
    pub(crate) const EXCEPTION_TYPE: &str = "exception.type";
    pub(crate) const EXCEPTION_MESSAGE: &str = "exception.message";
    pub(crate) const EXCEPTION_STACKTRACE: &str = "exception.stacktrace";

    /// Marker set by the log appender bridge on synthetic log spans.
    pub(crate) const INTERNAL_LOG: &str = "applicationinsights.internal.log";
    pub(crate) const LOG_LEVEL: &str = "log_level";
    pub(crate) const LOG_ERROR_STACK: &str = "log_error_stack";
    pub(crate) const LEGACY_PARENT_ID: &str = "legacy_parent_id";
    pub(crate) const LEGACY_ROOT_ID: &str = "legacy_root_id";
    pub(crate) const SOURCE: &str = "ai.span.source";
    pub(crate) const SOURCE_APP_ID: &str = "ai.span.source.app_id";
    pub(crate) const TARGET_APP_ID: &str = "ai.span.target.app_id";
    pub(crate) const PREVIEW_OPERATION_NAME: &str = "ai.preview.operation_name";
    pub(crate) const PREVIEW_INSTRUMENTATION_KEY: &str = "ai.preview.instrumentation_key";
    pub(crate) const PREVIEW_SERVICE_NAME: &str = "ai.preview.service_name";
    pub(crate) const PREVIEW_SERVICE_INSTANCE_ID: &str = "ai.preview.service_instance_id";
    pub(crate) const PREVIEW_SERVICE_VERSION: &str = "ai.preview.service_version";
}

/// Attribute namespaces that never land in the user property map; their
/// contents are consumed by the mapping rules instead.
const RESERVED_PREFIXES: [&str; 11] = [
    "http",
    "db",
    "message",
    "messaging",
    "rpc",
    "enduser",
    "net",
    "peer",
    "exception",
    "thread",
    "faas",
];

/// Instrumentation whose codec events are noise rather than telemetry.
const LETTUCE_INSTRUMENTATION: &str = "io.opentelemetry.javaagent.lettuce-5.1";

/// Errors from the mapping step. A failed span is dropped; errors never
/// propagate to the instrumented application.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MapError {
    /// The span ended before it started.
    #[error(transparent)]
    InvalidDuration(#[from] NegativeDuration),
}

/// Static context the mapper stamps on every envelope.
#[derive(Clone, Debug, Default)]
pub struct MapperConfig {
    /// Tenant key; can be overridden per span via a preview attribute.
    pub i_key: String,
    /// Logical service name for the `ai.cloud.role` tag.
    pub role_name: Option<String>,
    /// Host/instance name for the `ai.cloud.roleInstance` tag.
    pub role_instance: Option<String>,
    /// This component's own ingestion-side application id, used to detect
    /// cross-component calls.
    pub app_id: Option<String>,
}

/// Maps finished spans onto the envelope schema.
#[derive(Clone, Debug)]
pub struct SpanMapper {
    config: MapperConfig,
    sdk_version: String,
}

/// Wire shape of one `_MS.links` entry.
#[derive(Serialize)]
struct WireLink {
    #[serde(rename = "operation_Id")]
    operation_id: String,
    id: String,
}

enum Classification {
    Log,
    Request,
    Dependency,
}

impl SpanMapper {
    /// Creates a mapper with the given static context.
    pub fn new(config: MapperConfig) -> Self {
        SpanMapper {
            config,
            sdk_version: format!("rs:{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Maps one span to its envelopes: one for the span itself, plus one
    /// per span event. Envelopes inherit the span's sampling percentage.
    pub fn map(&self, span: &Span) -> Result<Vec<Envelope>, MapError> {
        let sample_rate = span.sample_rate();
        let mut envelopes = Vec::with_capacity(1 + span.events.len());
        match self.classify(span) {
            Classification::Log => envelopes.push(self.log_envelope(span, sample_rate)),
            Classification::Request => {
                envelopes.push(self.request_envelope(span, sample_rate)?)
            }
            Classification::Dependency => {
                envelopes.push(self.dependency_envelope(span, sample_rate)?)
            }
        }
        self.event_envelopes(span, sample_rate, &mut envelopes);
        Ok(envelopes)
    }

    fn classify(&self, span: &Span) -> Classification {
        if span.kind == SpanKind::Internal
            && span.attributes.get(attrs::INTERNAL_LOG).and_then(Value::as_bool) == Some(true)
        {
            return Classification::Log;
        }
        let is_request = match span.kind {
            SpanKind::Server => true,
            SpanKind::Consumer => {
                span.parent_is_remote
                    && span.name != "EventHubs.process"
                    && span.name != "ServiceBus.process"
            }
            SpanKind::Internal => {
                span.instrumentation_name.contains("spring-scheduling")
                    && !span.parent_span_id.is_valid()
            }
            SpanKind::Client | SpanKind::Producer => false,
        };
        if is_request {
            Classification::Request
        } else {
            Classification::Dependency
        }
    }

    fn request_envelope(&self, span: &Span, sample_rate: f64) -> Result<Envelope, MapError> {
        let duration = format_duration(span.end_unix_nanos - span.start_unix_nanos)?;
        let method = span.attribute_str(attrs::HTTP_METHOD);
        let name = match method {
            Some(method) if span.name.starts_with('/') => format!("{method} {}", span.name),
            _ => span.name.clone(),
        };
        let response_code = span
            .attribute_i64(attrs::HTTP_STATUS_CODE)
            .map(|code| code.to_string())
            .unwrap_or_else(|| "200".to_string());

        let mut tags = self.base_tags(span);
        tags.entry(tags::OPERATION_NAME.to_string())
            .or_insert_with(|| name.clone());
        if let Some(ip) = span
            .attribute_str(attrs::HTTP_CLIENT_IP)
            .or_else(|| span.attribute_str(attrs::NET_PEER_IP))
        {
            tags.insert(tags::LOCATION_IP.to_string(), ip.to_string());
        }

        let mut request = RequestData::builder()
            .id(span.span_id.to_string())
            .name(name)
            .duration(duration)
            .response_code(response_code)
            .success(span.status != SpanStatus::Error)
            .properties(self.span_properties(span))
            .build();
        request.url = span.attribute_str(attrs::HTTP_URL).map(str::to_string);
        request.source = self.request_source(span);

        Ok(Envelope::new(
            self.i_key(span),
            format_instant(span.start_unix_nanos),
            sample_rate,
            tags,
            Data::RequestData(request),
        ))
    }

    /// Where the request came from, for service-map edges: a foreign
    /// caller app id, then the messaging source, then the value planted by
    /// the legacy correlation bridge (preserved verbatim).
    fn request_source(&self, span: &Span) -> Option<String> {
        if let Some(id) = span.attribute_str(attrs::SOURCE_APP_ID) {
            if !id.is_empty() && self.config.app_id.as_deref() != Some(id) {
                return Some(id.to_string());
            }
        }
        if let Some(system) = span.attribute_str(attrs::MESSAGING_SYSTEM) {
            let destination = dependencies::messaging_target(span, system);
            return Some(match dependencies::peer_target(span, None) {
                Some(peer) => format!("{peer}/{destination}"),
                None => destination,
            });
        }
        span.attribute_str(attrs::SOURCE).map(str::to_string)
    }

    fn dependency_envelope(&self, span: &Span, sample_rate: f64) -> Result<Envelope, MapError> {
        let duration = format_duration(span.end_unix_nanos - span.start_unix_nanos)?;
        let parts = dependencies::classify(span, self.config.app_id.as_deref());

        let mut dependency = RemoteDependencyData::builder()
            .id(span.span_id.to_string())
            .name(parts.name_override.unwrap_or_else(|| span.name.clone()))
            .duration(duration)
            .success(span.status != SpanStatus::Error)
            .properties(self.span_properties(span))
            .build();
        dependency.dependency_type = parts.dependency_type;
        dependency.target = parts.target;
        dependency.data = parts.data;
        dependency.result_code = parts.result_code;

        Ok(Envelope::new(
            self.i_key(span),
            format_instant(span.start_unix_nanos),
            sample_rate,
            self.base_tags(span),
            Data::RemoteDependencyData(dependency),
        ))
    }

    /// Synthetic log spans become message telemetry, or exception
    /// telemetry when the bridge captured an error stack.
    fn log_envelope(&self, span: &Span, sample_rate: f64) -> Envelope {
        let level = span.attribute_str(attrs::LOG_LEVEL);
        let severity = level.map(severity_from_level);

        let mut properties = BTreeMap::new();
        properties.insert("SourceType".to_string(), "Logger".to_string());
        if let Some(level) = level {
            properties.insert("LoggingLevel".to_string(), level.to_string());
        }
        copy_attributes(&mut properties, &span.attributes);
        self.append_links(span, &mut properties);
        let properties = sanitize::sanitize_properties(&properties);

        let data = match span.attribute_str(attrs::LOG_ERROR_STACK) {
            Some(stack) => {
                let (type_name, message) = parse_stack_header(stack, &span.name);
                let mut exception = ExceptionData::builder()
                    .exceptions(vec![ExceptionDetails::builder()
                        .type_name(type_name)
                        .message(message)
                        .stack(stack.to_string())
                        .build()])
                    .properties(properties)
                    .build();
                exception.severity_level = severity;
                Data::ExceptionData(exception)
            }
            None => {
                let mut message = MessageData::builder()
                    .message(span.name.clone())
                    .properties(properties)
                    .build();
                message.severity_level = severity;
                Data::MessageData(message)
            }
        };

        Envelope::new(
            self.i_key(span),
            format_instant(span.start_unix_nanos),
            sample_rate,
            self.base_tags(span),
            data,
        )
    }

    /// Emits one envelope per span event, in recording order. Events with
    /// exception attributes become exception telemetry parented to the
    /// span; the rest become custom events.
    fn event_envelopes(&self, span: &Span, sample_rate: f64, envelopes: &mut Vec<Envelope>) {
        for event in &span.events {
            if span.instrumentation_name == LETTUCE_INSTRUMENTATION
                && event.name.starts_with("redis.encode.")
            {
                continue;
            }

            let mut tags = self.base_tags(span);
            tags.insert(
                tags::OPERATION_PARENT_ID.to_string(),
                span.span_id.to_string(),
            );

            let mut properties = BTreeMap::new();
            copy_attributes(&mut properties, &event.attributes);
            let properties = sanitize::sanitize_properties(&properties);

            let exception_type = event.attributes.get(attrs::EXCEPTION_TYPE).and_then(Value::as_str);
            let exception_message = event
                .attributes
                .get(attrs::EXCEPTION_MESSAGE)
                .and_then(Value::as_str);
            let data = if exception_type.is_some() || exception_message.is_some() {
                let type_name = exception_type.unwrap_or("Exception").to_string();
                let message = exception_message.unwrap_or(type_name.as_str()).to_string();
                let mut details = ExceptionDetails::builder()
                    .type_name(type_name)
                    .message(message)
                    .build();
                details.stack = event
                    .attributes
                    .get(attrs::EXCEPTION_STACKTRACE)
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Data::ExceptionData(
                    ExceptionData::builder()
                        .exceptions(vec![details])
                        .properties(properties)
                        .build(),
                )
            } else {
                Data::EventData(
                    EventData::builder()
                        .name(event.name.clone())
                        .properties(properties)
                        .build(),
                )
            };

            envelopes.push(Envelope::new(
                self.i_key(span),
                format_instant(event.unix_nanos),
                sample_rate,
                tags,
                data,
            ));
        }
    }

    /// Context tags shared by every envelope derived from the span.
    fn base_tags(&self, span: &Span) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        tags.insert(tags::OPERATION_ID.to_string(), span.trace_id.to_string());

        // A parent id planted by the legacy bridge overrides the span's own.
        if let Some(legacy) = span.attribute_str(attrs::LEGACY_PARENT_ID) {
            tags.insert(tags::OPERATION_PARENT_ID.to_string(), legacy.to_string());
        } else if span.parent_span_id.is_valid() {
            tags.insert(
                tags::OPERATION_PARENT_ID.to_string(),
                span.parent_span_id.to_string(),
            );
        }
        if let Some(root) = span.attribute_str(attrs::LEGACY_ROOT_ID) {
            tags.insert(tags::LEGACY_ROOT_ID.to_string(), root.to_string());
        }

        if let Some(name) = span.attribute_str(attrs::PREVIEW_OPERATION_NAME) {
            tags.insert(tags::OPERATION_NAME.to_string(), name.to_string());
        }
        if let Some(role) = span
            .attribute_str(attrs::PREVIEW_SERVICE_NAME)
            .or(self.config.role_name.as_deref())
        {
            tags.insert(tags::CLOUD_ROLE.to_string(), role.to_string());
        }
        if let Some(instance) = span
            .attribute_str(attrs::PREVIEW_SERVICE_INSTANCE_ID)
            .or(self.config.role_instance.as_deref())
        {
            tags.insert(tags::CLOUD_ROLE_INSTANCE.to_string(), instance.to_string());
        }
        if let Some(version) = span.attribute_str(attrs::PREVIEW_SERVICE_VERSION) {
            tags.insert(tags::APPLICATION_VER.to_string(), version.to_string());
        }

        if let Some(user) = span.attribute_str(attrs::ENDUSER_ID) {
            tags.insert(tags::USER_ID.to_string(), user.to_string());
        }
        if let Some(agent) = span.attribute_str(attrs::HTTP_USER_AGENT) {
            tags.insert(tags::USER_AGENT.to_string(), agent.to_string());
        }

        tags.insert(
            tags::INTERNAL_SDK_VERSION.to_string(),
            self.sdk_version.clone(),
        );
        tags
    }

    /// Tenant key for envelopes from this span; a preview attribute can
    /// redirect a span to another workspace.
    fn i_key(&self, span: &Span) -> String {
        span.attribute_str(attrs::PREVIEW_INSTRUMENTATION_KEY)
            .unwrap_or(&self.config.i_key)
            .to_string()
    }

    /// User properties: the non-reserved attributes plus the link list.
    fn span_properties(&self, span: &Span) -> BTreeMap<String, String> {
        let mut properties = BTreeMap::new();
        copy_attributes(&mut properties, &span.attributes);
        self.append_links(span, &mut properties);
        sanitize::sanitize_properties(&properties)
    }

    fn append_links(&self, span: &Span, properties: &mut BTreeMap<String, String>) {
        if span.links.is_empty() {
            return;
        }
        let links: Vec<WireLink> = span
            .links
            .iter()
            .map(|link| WireLink {
                operation_id: link.trace_id.to_string(),
                id: link.span_id.to_string(),
            })
            .collect();
        if let Ok(json) = serde_json::to_string(&links) {
            properties.insert("_MS.links".to_string(), json);
        }
    }
}

/// Copies attributes that are not consumed by the mapping rules into a
/// property map. Arrays are joined with `", "`.
fn copy_attributes(properties: &mut BTreeMap<String, String>, attributes: &HashMap<String, Value>) {
    for (key, value) in attributes {
        if is_reserved_key(key) {
            continue;
        }
        properties.insert(key.clone(), value.to_string());
    }
}

fn is_reserved_key(key: &str) -> bool {
    if key.starts_with("applicationinsights.internal.")
        || key.starts_with("ai.preview.")
        || key.starts_with("ai.span.")
    {
        return true;
    }
    if matches!(
        key,
        attrs::LOG_LEVEL | attrs::LOG_ERROR_STACK | attrs::LEGACY_PARENT_ID | attrs::LEGACY_ROOT_ID
    ) {
        return true;
    }
    RESERVED_PREFIXES
        .iter()
        .any(|prefix| key.starts_with(prefix))
}

/// First line of a captured stack is `type: message`; a line without the
/// separator is all type, and the span name stands in for the message.
fn parse_stack_header(stack: &str, span_name: &str) -> (String, String) {
    let first_line = stack.lines().next().unwrap_or_default();
    match first_line.split_once(':') {
        Some((type_name, message)) => (type_name.trim().to_string(), message.trim().to_string()),
        None => (first_line.trim().to_string(), span_name.to_string()),
    }
}

fn severity_from_level(level: &str) -> SeverityLevel {
    match level.to_ascii_uppercase().as_str() {
        "FATAL" => SeverityLevel::Critical,
        "ERROR" | "SEVERE" => SeverityLevel::Error,
        "WARN" | "WARNING" => SeverityLevel::Warning,
        "INFO" => SeverityLevel::Information,
        // DEBUG, TRACE, CONFIG, FINE, FINER, FINEST, ALL and anything else
        _ => SeverityLevel::Verbose,
    }
}
