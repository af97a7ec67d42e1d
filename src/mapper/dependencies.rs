//! Dependency subtype classification and target derivation.
//!
//! An outbound span is classified by the first matching rule, in a fixed
//! order: HTTP, RPC, database, messaging, the Azure messaging span names,
//! and finally in-process. The derived target names the remote side the
//! way the service map expects it, with well-known default ports elided.

use super::attrs;
use crate::span::{Span, SpanKind};
use url::Url;

/// Database systems reported under the umbrella `SQL` dependency type.
const SQL_DB_SYSTEMS: [&str; 11] = [
    "db2",
    "derby",
    "mariadb",
    "mssql",
    "mysql",
    "oracle",
    "postgresql",
    "sqlite",
    "other_sql",
    "hsqldb",
    "h2",
];

/// What the subtype rules decided for one outbound span.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct DependencyParts {
    pub dependency_type: Option<String>,
    pub target: Option<String>,
    /// Replaces the span name as the telemetry name when set.
    pub name_override: Option<String>,
    /// Command detail, e.g. the full URL or the database statement.
    pub data: Option<String>,
    pub result_code: Option<String>,
}

/// Runs the subtype decision table. `self_app_id` is the component's own
/// ingestion-side application id, used to spot cross-component calls.
pub(crate) fn classify(span: &Span, self_app_id: Option<&str>) -> DependencyParts {
    if span.attributes.contains_key(attrs::HTTP_METHOD) {
        return http_parts(span, self_app_id);
    }
    if let Some(system) = span.attribute_str(attrs::RPC_SYSTEM) {
        return DependencyParts {
            dependency_type: Some(system.to_string()),
            target: peer_target(span, None).or_else(|| Some(system.to_string())),
            ..Default::default()
        };
    }
    if let Some(system) = span.attribute_str(attrs::DB_SYSTEM) {
        return db_parts(span, system);
    }
    if let Some(system) = span.attribute_str(attrs::MESSAGING_SYSTEM) {
        return messaging_parts(span, system);
    }
    match span.name.as_str() {
        "EventHubs.send" | "EventHubs.message" => {
            return DependencyParts {
                dependency_type: Some("Microsoft.EventHub".to_string()),
                target: azure_messaging_target(span),
                ..Default::default()
            }
        }
        "ServiceBus.message" | "ServiceBus.process" => {
            return DependencyParts {
                dependency_type: Some("AZURE SERVICE BUS".to_string()),
                target: azure_messaging_target(span),
                ..Default::default()
            }
        }
        _ => {}
    }
    if span.kind == SpanKind::Internal {
        return DependencyParts {
            dependency_type: Some("InProc".to_string()),
            ..Default::default()
        };
    }
    // A target derived from peer attributes keeps the span generic;
    // without one the call is marked in-process so it does not show up as
    // an unnamed external node on the service map.
    match peer_target(span, None) {
        Some(target) => DependencyParts {
            target: Some(target),
            ..Default::default()
        },
        None => DependencyParts {
            dependency_type: Some("InProc".to_string()),
            ..Default::default()
        },
    }
}

fn http_parts(span: &Span, self_app_id: Option<&str>) -> DependencyParts {
    let target_app_id = span.attribute_str(attrs::TARGET_APP_ID);
    let dependency_type = match target_app_id {
        Some(id) if !id.is_empty() && self_app_id != Some(id) => {
            "Http (tracked component)".to_string()
        }
        _ => "Http".to_string(),
    };
    DependencyParts {
        dependency_type: Some(dependency_type),
        target: http_target(span),
        data: span.attribute_str(attrs::HTTP_URL).map(str::to_string),
        result_code: span
            .attribute_i64(attrs::HTTP_STATUS_CODE)
            .map(|code| code.to_string()),
        ..Default::default()
    }
}

fn db_parts(span: &Span, system: &str) -> DependencyParts {
    let statement = span.attribute_str(attrs::DB_STATEMENT).map(str::to_string);
    let is_sql = SQL_DB_SYSTEMS.contains(&system);
    let dependency_type = if is_sql {
        "SQL".to_string()
    } else {
        system.to_string()
    };
    let base = peer_target(span, default_db_port(system)).or_else(|| Some(system.to_string()));
    let target = match span.attribute_str(attrs::DB_NAME) {
        Some(db_name) => base.map(|base| format!("{base}/{db_name}")),
        None => base,
    };
    DependencyParts {
        dependency_type: Some(dependency_type),
        target,
        // Only SQL statements stand in for the span name; other systems
        // keep their own.
        name_override: if is_sql { statement.clone() } else { None },
        data: statement,
        ..Default::default()
    }
}

fn messaging_parts(span: &Span, system: &str) -> DependencyParts {
    let dependency_type = if span.kind == SpanKind::Producer {
        format!("Queue Message | {system}")
    } else {
        system.to_string()
    };
    DependencyParts {
        dependency_type: Some(dependency_type),
        target: Some(messaging_target(span, system)),
        ..Default::default()
    }
}

/// Destination for messaging spans, shared with the request-source
/// derivation on the consumer side.
pub(crate) fn messaging_target(span: &Span, system: &str) -> String {
    span.attribute_str(attrs::MESSAGING_DESTINATION)
        .unwrap_or(system)
        .to_string()
}

fn azure_messaging_target(span: &Span) -> Option<String> {
    let peer = span.attribute_str(attrs::PEER_ADDRESS)?;
    let destination = span.attribute_str(attrs::MESSAGE_BUS_DESTINATION)?;
    Some(format!("{peer}/{destination}"))
}

/// Target for HTTP dependencies: explicit peer name, then `http.host`,
/// then the authority of `http.url`. Scheme-default ports are elided.
fn http_target(span: &Span) -> Option<String> {
    let scheme = span
        .attribute_str(attrs::HTTP_URL)
        .and_then(|raw| Url::parse(raw).ok())
        .map(|url| url.scheme().to_string());

    if let Some(peer) = span.attribute_str(attrs::NET_PEER_NAME) {
        let port = span.attribute_i64(attrs::NET_PEER_PORT);
        return Some(join_host_port(peer, port, scheme.as_deref()));
    }
    if let Some(host) = span.attribute_str(attrs::HTTP_HOST) {
        return Some(host.to_string());
    }
    let url = Url::parse(span.attribute_str(attrs::HTTP_URL)?).ok()?;
    let host = url.host_str()?.to_string();
    let port = url.port().map(i64::from);
    Some(join_host_port(&host, port, Some(url.scheme())))
}

/// Target from the generic peer attributes: service alias first, then the
/// peer host name, then the bare address.
pub(crate) fn peer_target(span: &Span, default_port: Option<i64>) -> Option<String> {
    if let Some(service) = span.attribute_str(attrs::PEER_SERVICE) {
        return Some(service.to_string());
    }
    let host = span
        .attribute_str(attrs::NET_PEER_NAME)
        .or_else(|| span.attribute_str(attrs::NET_PEER_IP))?;
    let port = span.attribute_i64(attrs::NET_PEER_PORT);
    match (port, default_port) {
        (Some(port), Some(default)) if port == default => Some(host.to_string()),
        (Some(port), _) if port >= 0 => Some(format!("{host}:{port}")),
        _ => Some(host.to_string()),
    }
}

fn join_host_port(host: &str, port: Option<i64>, scheme: Option<&str>) -> String {
    match port {
        Some(port) if !is_default_http_port(port, scheme) => format!("{host}:{port}"),
        _ => host.to_string(),
    }
}

fn is_default_http_port(port: i64, scheme: Option<&str>) -> bool {
    match scheme {
        Some("http") => port == 80 || port == -1,
        Some("https") => port == 443 || port == -1,
        // Without a scheme both well-known ports are treated as default.
        _ => port == 80 || port == 443 || port == -1,
    }
}

fn default_db_port(system: &str) -> Option<i64> {
    match system {
        "mongodb" => Some(27017),
        "cassandra" => Some(9042),
        "redis" => Some(6379),
        "mariadb" | "mysql" => Some(3306),
        "mssql" => Some(1433),
        "db2" => Some(50000),
        "oracle" => Some(1521),
        "h2" => Some(8082),
        "derby" => Some(1527),
        "postgresql" => Some(5432),
        _ => None,
    }
}
