//! # Application Insights exporter
//!
//! The agent-side telemetry pipeline for Application Insights: maps
//! finished spans onto the Application Insights envelope schema, streams
//! envelopes to the ingestion endpoint with batching, retry and an
//! on-disk spool, and aggregates a live metrics snapshot stream for the
//! QuickPulse portal experience.
//!
//! ## Quickstart
//!
//! Build a pipeline from a connection string (or the
//! `APPLICATIONINSIGHTS_CONNECTION_STRING` environment variable) and feed
//! it finished spans:
//!
//! ```no_run
//! use appinsights_exporter::{Span, SpanKind};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = appinsights_exporter::new_pipeline()
//!         .with_connection_string("InstrumentationKey=00000000-0000-0000-0000-000000000001")
//!         .with_role_name("checkout")
//!         .build()?;
//!
//!     pipeline.track(&Span {
//!         name: "/api/orders".to_string(),
//!         kind: SpanKind::Server,
//!         ..Default::default()
//!     });
//!
//!     pipeline.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Choosing an HTTP client
//!
//! Both channels send through the [`http_client::HttpClient`] trait. The
//! default `reqwest-client` feature wires in `reqwest` with the
//! pipeline's connect/read timeouts; any other client can be plugged in
//! with [`PipelineBuilder::with_http_client`].
//!
//! ## Delivery semantics
//!
//! Delivery is at-least-once: transient ingestion failures back off and
//! redispatch the same batch, undeliverable batches spill to a bounded
//! on-disk spool for later replay, and envelopes carry their own ids so
//! duplicates are harmless upstream. Telemetry is only dropped on
//! permanent rejection or when both the buffer and the spool are full,
//! and those drops are counted in the transmitter's self-metrics.

#![warn(missing_debug_implementations, unreachable_pub)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod internal_logs;

pub mod config;
pub mod http_client;
pub mod mapper;
pub mod model;
pub mod pipeline;
pub mod quickpulse;
pub mod span;
pub mod transmit;

pub use config::{ConfigError, ConnectionString};
pub use pipeline::{new_pipeline, PipelineBuilder, TelemetryPipeline};
pub use span::{Span, SpanEvent, SpanId, SpanKind, SpanLink, SpanStatus, TraceId, Value};

/// Errors surfaced while assembling a pipeline.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// No HTTP client was configured and no default client feature is
    /// enabled.
    #[error("http client must be set; enable the reqwest-client feature or provide one")]
    NoHttpClient,

    /// The connection string or environment configuration is unusable.
    #[error(transparent)]
    Config(#[from] config::ConfigError),

    /// The spool directory could not be opened.
    #[error(transparent)]
    Spool(#[from] transmit::SpoolError),
}
