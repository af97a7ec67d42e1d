//! Pipeline assembly and the per-span fan-out.
//!
//! The pipeline owns one mapper, one transmitter and (optionally) one
//! live metrics collector. `track` runs on the caller's thread and never
//! blocks on I/O: mapping is synchronous, the live metrics update is a
//! couple of atomic adds, and handing the envelope to the transmitter is
//! a bounded-channel `try_send`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{self, ConnectionString};
use crate::diag_debug;
use crate::http_client::HttpClient;
use crate::mapper::{MapperConfig, SpanMapper};
use crate::quickpulse::{LiveMetrics, LiveMetricsConfig};
use crate::span::Span;
use crate::transmit::{
    BackoffPolicy, StatsSnapshot, TransmitError, Transmitter, TransmitterConfig,
};
use crate::Error;

/// Overall deadline for draining on shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(feature = "reqwest")]
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
#[cfg(feature = "reqwest")]
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(20);

/// Create a new pipeline builder.
pub fn new_pipeline() -> PipelineBuilder {
    PipelineBuilder::default()
}

/// Builder for [`TelemetryPipeline`].
#[derive(Debug)]
pub struct PipelineBuilder {
    connection_string: Option<String>,
    role_name: Option<String>,
    role_instance: Option<String>,
    app_id: Option<String>,
    client: Option<Arc<dyn HttpClient>>,
    spool_dir: Option<PathBuf>,
    buffer_capacity: Option<usize>,
    backoff: Option<BackoffPolicy>,
    live_metrics: bool,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        PipelineBuilder {
            #[cfg(feature = "reqwest")]
            client: Some(Arc::new(
                reqwest::Client::builder()
                    .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
                    .timeout(DEFAULT_READ_TIMEOUT)
                    .build()
                    .unwrap_or_else(|_| reqwest::Client::new()),
            )),
            #[cfg(not(feature = "reqwest"))]
            client: None,

            connection_string: None,
            role_name: None,
            role_instance: None,
            app_id: None,
            spool_dir: None,
            buffer_capacity: None,
            backoff: None,
            live_metrics: true,
        }
    }
}

impl PipelineBuilder {
    /// Set the connection string instead of reading it from the
    /// environment.
    pub fn with_connection_string<T: Into<String>>(mut self, connection_string: T) -> Self {
        self.connection_string = Some(connection_string.into());
        self
    }

    /// Set the logical service name reported as the cloud role.
    pub fn with_role_name<T: Into<String>>(mut self, role_name: T) -> Self {
        self.role_name = Some(role_name.into());
        self
    }

    /// Set the service instance reported as the cloud role instance.
    pub fn with_role_instance<T: Into<String>>(mut self, role_instance: T) -> Self {
        self.role_instance = Some(role_instance.into());
        self
    }

    /// Set this component's own application id, used to recognize
    /// cross-component correlation headers as foreign or self.
    pub fn with_app_id<T: Into<String>>(mut self, app_id: T) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    /// Assign a client implementation.
    pub fn with_http_client<T: HttpClient + 'static>(mut self, client: T) -> Self {
        self.client = Some(Arc::new(client));
        self
    }

    /// Override the spool directory (default: `<tmp>/<crate>/transmission`).
    pub fn with_spool_dir<T: Into<PathBuf>>(mut self, dir: T) -> Self {
        self.spool_dir = Some(dir.into());
        self
    }

    /// Override the in-memory buffer capacity.
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = Some(capacity);
        self
    }

    /// Override the delivery retry pacing.
    pub fn with_backoff_policy(mut self, policy: BackoffPolicy) -> Self {
        self.backoff = Some(policy);
        self
    }

    /// Enable or disable the live metrics channel (default: enabled).
    pub fn with_live_metrics(mut self, enabled: bool) -> Self {
        self.live_metrics = enabled;
        self
    }

    /// Builds the pipeline and starts its background tasks. Must be
    /// called within a tokio runtime.
    pub fn build(self) -> Result<TelemetryPipeline, Error> {
        let connection = match &self.connection_string {
            Some(raw) => ConnectionString::parse(raw)?,
            None => ConnectionString::from_env()?,
        };
        let client = self.client.ok_or(Error::NoHttpClient)?;

        let machine_name =
            sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string());
        let role_name = self.role_name.or_else(config::role_name_from_env);
        let role_instance = self
            .role_instance
            .or_else(config::role_instance_from_env)
            .unwrap_or_else(|| machine_name.clone());

        let mapper = SpanMapper::new(MapperConfig {
            i_key: connection.instrumentation_key.clone(),
            role_name: role_name.clone(),
            role_instance: Some(role_instance.clone()),
            app_id: self.app_id,
        });

        let mut transmitter_config = TransmitterConfig {
            endpoint: connection.track_endpoint(),
            ..TransmitterConfig::default()
        };
        if let Some(dir) = self.spool_dir {
            transmitter_config.spool_dir = dir;
        }
        if let Some(capacity) = self.buffer_capacity {
            transmitter_config.queue_capacity = capacity;
        }
        if let Some(backoff) = self.backoff {
            transmitter_config.backoff = backoff;
        }
        let transmitter = Transmitter::spawn(transmitter_config, client.clone())?;

        let live_metrics = self.live_metrics.then(|| {
            LiveMetrics::spawn(
                LiveMetricsConfig {
                    i_key: connection.instrumentation_key.clone(),
                    endpoint: connection.live_endpoint.clone(),
                    role_name,
                    role_instance,
                    machine_name,
                },
                client,
            )
        });

        Ok(TelemetryPipeline {
            mapper,
            transmitter,
            live_metrics,
        })
    }
}

/// The assembled telemetry pipeline.
#[derive(Debug)]
pub struct TelemetryPipeline {
    mapper: SpanMapper,
    transmitter: Transmitter,
    live_metrics: Option<LiveMetrics>,
}

impl TelemetryPipeline {
    /// Consumes one finished span: maps it, validates each envelope,
    /// feeds the live metrics aggregate and queues delivery.
    ///
    /// Failures are contained here; nothing propagates back into the
    /// instrumented application.
    pub fn track(&self, span: &Span) {
        let envelopes = match self.mapper.map(span) {
            Ok(envelopes) => envelopes,
            Err(err) => {
                diag_debug!(name: "span_dropped", error = format!("{err}"));
                return;
            }
        };
        for mut envelope in envelopes {
            if let Err(err) = envelope.validate() {
                diag_debug!(name: "envelope_dropped", error = format!("{err}"));
                continue;
            }
            if let Some(live_metrics) = &self.live_metrics {
                live_metrics.observe(&envelope);
            }
            if let Err(err) = self.transmitter.enqueue(envelope) {
                diag_debug!(name: "envelope_not_queued", error = format!("{err}"));
            }
        }
    }

    /// Drains queued telemetry within `timeout`.
    pub async fn flush(&self, timeout: Duration) -> Result<(), TransmitError> {
        self.transmitter.flush(timeout).await
    }

    /// Flushes and stops the transmitter, then closes the live metrics
    /// channel.
    pub async fn shutdown(self) -> Result<(), TransmitError> {
        let result = self.transmitter.shutdown(DEFAULT_SHUTDOWN_TIMEOUT).await;
        if let Some(live_metrics) = &self.live_metrics {
            live_metrics.shutdown();
        }
        result
    }

    /// Delivery self-metrics.
    pub fn transmitter_stats(&self) -> StatsSnapshot {
        self.transmitter.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::{SpanId, SpanKind, TraceId, Value};
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::{Request, Response};
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct CapturingClient {
        requests: Mutex<Vec<Request<Vec<u8>>>>,
    }

    #[async_trait]
    impl HttpClient for CapturingClient {
        async fn send(
            &self,
            request: Request<Vec<u8>>,
        ) -> Result<Response<Bytes>, crate::http_client::HttpError> {
            self.requests.lock().unwrap().push(request);
            Ok(Response::builder().status(200).body(Bytes::new()).unwrap())
        }
    }

    fn server_span() -> Span {
        Span {
            trace_id: TraceId::from_u128(1),
            span_id: SpanId::from_u64(2),
            kind: SpanKind::Server,
            name: "/api/x".to_string(),
            start_unix_nanos: 1_577_836_800_000_000_000,
            end_unix_nanos: 1_577_836_800_050_000_000,
            ..Default::default()
        }
    }

    fn build_pipeline(client: Arc<CapturingClient>, dir: &std::path::Path) -> TelemetryPipeline {
        let mut builder = new_pipeline()
            .with_connection_string("InstrumentationKey=test-ikey")
            .with_role_name("checkout")
            .with_role_instance("host-1")
            .with_spool_dir(dir.join("transmission"))
            .with_live_metrics(false);
        builder.client = Some(client as Arc<dyn HttpClient>);
        builder.build().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn tracked_span_is_delivered_as_one_envelope_line() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(CapturingClient::default());
        let pipeline = build_pipeline(client.clone(), dir.path());

        pipeline.track(&server_span());
        pipeline.flush(Duration::from_secs(30)).await.unwrap();

        let requests = client.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0]
            .uri()
            .to_string()
            .ends_with("/v2.1/track"));
        let body = String::from_utf8(requests[0].body().clone()).unwrap();
        assert_eq!(body.lines().count(), 1);
        assert!(body.contains("\"iKey\":\"test-ikey\""));
        assert!(body.contains("\"baseType\":\"RequestData\""));
        drop(requests);
        assert_eq!(pipeline.transmitter_stats().delivered, 1);
        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn envelope_with_empty_tenant_key_is_dropped_before_transmission() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(CapturingClient::default());
        let pipeline = build_pipeline(client.clone(), dir.path());

        let mut span = server_span();
        span.attributes.insert(
            "ai.preview.instrumentation_key".to_string(),
            Value::from(""),
        );
        pipeline.track(&span);
        pipeline.flush(Duration::from_secs(30)).await.unwrap();

        assert_eq!(client.requests.lock().unwrap().len(), 0);
        assert_eq!(pipeline.transmitter_stats().delivered, 0);
        pipeline.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sample_rate_is_stamped_on_every_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(CapturingClient::default());
        let pipeline = build_pipeline(client.clone(), dir.path());

        let mut span = server_span();
        span.trace_state = "ai_sampling=25".to_string();
        pipeline.track(&span);
        pipeline.flush(Duration::from_secs(30)).await.unwrap();

        let requests = client.requests.lock().unwrap();
        let body = String::from_utf8(requests[0].body().clone()).unwrap();
        assert!(body.contains("\"sampleRate\":25.0"));
        drop(requests);
        pipeline.shutdown().await.unwrap();
    }
}
