//! Connection string parsing and environment configuration.

use std::env;

use thiserror::Error;

/// Default ingestion endpoint when the connection string names none.
const DEFAULT_INGESTION_ENDPOINT: &str = "https://dc.services.visualstudio.com";

/// Default live metrics endpoint when the connection string names none.
const DEFAULT_LIVE_ENDPOINT: &str = "https://rt.services.visualstudio.com";

/// Ingestion route appended to the ingestion endpoint.
const TRACK_PATH: &str = "/v2.1/track";

/// Full connection string, `Key=Value` pairs separated by semicolons.
pub const ENV_CONNECTION_STRING: &str = "APPLICATIONINSIGHTS_CONNECTION_STRING";

/// Legacy fallback carrying just the instrumentation key.
pub const ENV_INSTRUMENTATION_KEY: &str = "APPINSIGHTS_INSTRUMENTATIONKEY";

/// Logical service name for the cloud role tag.
pub const ENV_ROLE_NAME: &str = "APPLICATIONINSIGHTS_ROLE_NAME";

/// Service instance for the cloud role instance tag.
pub const ENV_ROLE_INSTANCE: &str = "APPLICATIONINSIGHTS_ROLE_INSTANCE";

/// Configuration failures surfaced at pipeline build time.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The connection string parsed but carried no key.
    #[error("connection string has no InstrumentationKey")]
    MissingInstrumentationKey,
    /// Neither a connection string nor a bare key was provided.
    #[error("no connection string or instrumentation key configured")]
    NotConfigured,
}

/// Parsed connection settings. Endpoints are normalized without a
/// trailing slash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionString {
    pub instrumentation_key: String,
    pub ingestion_endpoint: String,
    pub live_endpoint: String,
}

impl ConnectionString {
    /// Parses `Key=Value;Key=Value` form. A value with no `=` at all is
    /// accepted as a bare instrumentation key (legacy mode). Keys are
    /// matched case-insensitively; unknown keys are ignored.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ConfigError::NotConfigured);
        }
        if !raw.contains('=') {
            return Ok(ConnectionString::from_key(raw.to_string()));
        }

        let mut instrumentation_key = None;
        let mut ingestion_endpoint = None;
        let mut live_endpoint = None;
        for pair in raw.split(';') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            if value.is_empty() {
                continue;
            }
            if key.eq_ignore_ascii_case("InstrumentationKey") {
                instrumentation_key = Some(value.to_string());
            } else if key.eq_ignore_ascii_case("IngestionEndpoint") {
                ingestion_endpoint = Some(normalize_endpoint(value));
            } else if key.eq_ignore_ascii_case("LiveEndpoint") {
                live_endpoint = Some(normalize_endpoint(value));
            }
        }

        Ok(ConnectionString {
            instrumentation_key: instrumentation_key
                .ok_or(ConfigError::MissingInstrumentationKey)?,
            ingestion_endpoint: ingestion_endpoint
                .unwrap_or_else(|| DEFAULT_INGESTION_ENDPOINT.to_string()),
            live_endpoint: live_endpoint.unwrap_or_else(|| DEFAULT_LIVE_ENDPOINT.to_string()),
        })
    }

    /// Reads the connection string from the environment, falling back to
    /// the legacy instrumentation key variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Some(raw) = non_empty_var(ENV_CONNECTION_STRING) {
            return Self::parse(&raw);
        }
        if let Some(key) = non_empty_var(ENV_INSTRUMENTATION_KEY) {
            return Ok(ConnectionString::from_key(key));
        }
        Err(ConfigError::NotConfigured)
    }

    fn from_key(instrumentation_key: String) -> Self {
        ConnectionString {
            instrumentation_key,
            ingestion_endpoint: DEFAULT_INGESTION_ENDPOINT.to_string(),
            live_endpoint: DEFAULT_LIVE_ENDPOINT.to_string(),
        }
    }

    /// Full URL telemetry batches are posted to.
    pub fn track_endpoint(&self) -> String {
        format!("{}{}", self.ingestion_endpoint, TRACK_PATH)
    }
}

pub(crate) fn role_name_from_env() -> Option<String> {
    non_empty_var(ENV_ROLE_NAME)
}

pub(crate) fn role_instance_from_env() -> Option<String> {
    non_empty_var(ENV_ROLE_INSTANCE)
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}

fn normalize_endpoint(value: &str) -> String {
    value.trim_end_matches('/').to_string()
}
