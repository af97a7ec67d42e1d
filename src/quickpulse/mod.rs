//! Live metrics ("QuickPulse") collection.
//!
//! A background task pings the live metrics service until a portal
//! session subscribes, then streams one aggregate snapshot per second.
//! Counter updates come from the pipeline thread through [`LiveMetrics::
//! observe`] and are folded into packed atomics; the loop owns everything
//! else, including the endpoint redirects the service hands out.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http::{header::CONTENT_TYPE, Method, Request, Response};
use serde::Serialize;
use sysinfo::System;
use tokio::sync::oneshot;

use crate::http_client::HttpClient;
use crate::model::Envelope;
use crate::{diag_debug, diag_warn};

mod counters;

pub use counters::{LiveCounters, Snapshot};

const PING_INTERVAL: Duration = Duration::from_secs(5);
const POST_INTERVAL: Duration = Duration::from_secs(1);

/// Schema version reported with every transmission.
const INVARIANT_VERSION: i32 = 1;

/// Offset between the Unix epoch and 0001-01-01T00:00:00, in ticks.
const EPOCH_OFFSET_TICKS: i64 = 621_355_968_000_000_000;
const TICKS_PER_MILLI: i64 = 10_000;

const STREAM_ID_HEADER: &str = "x-ms-qps-stream-id";
const MACHINE_NAME_HEADER: &str = "x-ms-qps-machine-name";
const ROLE_NAME_HEADER: &str = "x-ms-qps-role-name";
const INSTANCE_NAME_HEADER: &str = "x-ms-qps-instance-name";
const TRANSMISSION_TIME_HEADER: &str = "x-ms-qps-transmission-time";
const INVARIANT_VERSION_HEADER: &str = "x-ms-qps-invariant-version";
const SUBSCRIBED_HEADER: &str = "x-ms-qps-subscribed";
const POLLING_HINT_HEADER: &str = "x-ms-qps-service-polling-interval-hint";
const REDIRECT_HEADER: &str = "x-ms-qps-service-endpoint-redirect";

/// Static identity of this process on the live metrics channel.
#[derive(Clone, Debug)]
pub struct LiveMetricsConfig {
    /// Tenant key; envelopes for other tenants are ignored.
    pub i_key: String,
    /// Base live metrics endpoint, e.g. `https://rt.services.visualstudio.com`.
    pub endpoint: String,
    /// Logical service name, when known.
    pub role_name: Option<String>,
    /// Service instance reported to the portal.
    pub role_instance: String,
    /// Host name reported to the portal.
    pub machine_name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// Not subscribed; the last ping failed at the transport level.
    Disabled,
    /// Not subscribed; waiting for the service to want data.
    PingPending,
    /// A portal session is watching; post a snapshot every second.
    Streaming,
}

/// Handle to the live metrics collector.
///
/// Observing envelopes is cheap and lock-free; the network loop runs on
/// its own task until [`shutdown`](LiveMetrics::shutdown).
#[derive(Debug)]
pub struct LiveMetrics {
    i_key: String,
    counters: Arc<LiveCounters>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl LiveMetrics {
    /// Starts the ping/post loop on the current tokio runtime.
    pub fn spawn(config: LiveMetricsConfig, client: Arc<dyn HttpClient>) -> Self {
        let counters = Arc::new(LiveCounters::new());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let worker = Worker {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            stream_id: new_stream_id(),
            ping_interval: PING_INTERVAL,
            state: State::Disabled,
            counters: counters.clone(),
            system: System::new(),
            last_post: tokio::time::Instant::now(),
            client,
            config: config.clone(),
        };
        tokio::spawn(worker.run(shutdown_rx));
        LiveMetrics {
            i_key: config.i_key,
            counters,
            shutdown: Mutex::new(Some(shutdown_tx)),
        }
    }

    /// Folds an envelope into the current interval. Envelopes addressed
    /// to a different tenant are ignored.
    pub fn observe(&self, envelope: &Envelope) {
        if envelope.i_key == self.i_key {
            self.counters.add(envelope);
        }
    }

    /// Stops the network loop. Idempotent.
    pub fn shutdown(&self) {
        let sender = self
            .shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }
}

/// One data point in the post body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct MetricPoint {
    name: &'static str,
    value: f64,
    weight: i32,
}

/// The transmission document; the ping body is the same shape with no
/// metrics.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct MonitoringPoint<'a> {
    version: String,
    invariant_version: i32,
    instance: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    role_name: Option<&'a str>,
    machine_name: &'a str,
    stream_id: &'a str,
    instrumentation_key: &'a str,
    timestamp: String,
    metrics: Vec<MetricPoint>,
}

struct Worker {
    client: Arc<dyn HttpClient>,
    config: LiveMetricsConfig,
    counters: Arc<LiveCounters>,
    endpoint: String,
    stream_id: String,
    ping_interval: Duration,
    state: State,
    system: System,
    last_post: tokio::time::Instant,
}

impl Worker {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        loop {
            let wait = match self.state {
                State::Streaming => POST_INTERVAL,
                State::Disabled | State::PingPending => self.ping_interval,
            };
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(wait) => {}
            }
            match self.state {
                State::Streaming => self.post().await,
                State::Disabled | State::PingPending => self.ping().await,
            }
        }
        diag_debug!(name: "live_metrics_stopped");
    }

    async fn ping(&mut self) {
        let uri = format!(
            "{}/QuickPulseService.svc/ping?ikey={}",
            self.endpoint, self.config.i_key
        );
        let body = match serde_json::to_vec(&self.document(Vec::new())) {
            Ok(body) => body,
            Err(_) => return,
        };
        match self.send(&uri, body).await {
            Ok(response) => self.handle_ping_response(&response),
            Err(err) => {
                diag_debug!(name: "live_metrics_ping_failed", error = format!("{err}"));
                self.state = State::Disabled;
            }
        }
    }

    fn handle_ping_response(&mut self, response: &Response<Bytes>) {
        if !response.status().is_success() {
            self.state = State::PingPending;
            return;
        }
        self.apply_common_headers(response);
        if header_str(response, SUBSCRIBED_HEADER) == Some("true") {
            // Start the interval fresh so the first post only covers
            // activity from the moment the session attached.
            let _ = self.counters.get_and_restart();
            self.last_post = tokio::time::Instant::now();
            self.state = State::Streaming;
        } else {
            self.state = State::PingPending;
        }
    }

    async fn post(&mut self) {
        let snapshot = self.counters.get_and_restart();
        let elapsed = self.last_post.elapsed().as_secs_f64().max(0.001);
        self.last_post = tokio::time::Instant::now();
        let metrics = self.metrics(&snapshot, elapsed);

        let uri = format!(
            "{}/QuickPulseService.svc/post?ikey={}",
            self.endpoint, self.config.i_key
        );
        let body = match serde_json::to_vec(&[self.document(metrics)]) {
            Ok(body) => body,
            Err(_) => return,
        };
        match self.send(&uri, body).await {
            Ok(response) => {
                if !response.status().is_success()
                    || header_str(&response, SUBSCRIBED_HEADER) == Some("false")
                {
                    self.state = State::PingPending;
                } else {
                    self.apply_common_headers(&response);
                }
            }
            Err(err) => {
                diag_warn!(name: "live_metrics_post_failed", error = format!("{err}"));
                self.state = State::PingPending;
            }
        }
    }

    /// Redirect and polling hints can arrive on any response.
    fn apply_common_headers(&mut self, response: &Response<Bytes>) {
        if let Some(redirect) = header_str(response, REDIRECT_HEADER) {
            let redirect = redirect.trim_end_matches('/');
            if !redirect.is_empty() && redirect != self.endpoint {
                diag_debug!(name: "live_metrics_redirect", endpoint = redirect.to_string());
                self.endpoint = redirect.to_string();
            }
        }
        if let Some(hint) = header_str(response, POLLING_HINT_HEADER) {
            if let Ok(millis) = hint.parse::<u64>() {
                if millis > 0 {
                    self.ping_interval = Duration::from_millis(millis);
                }
            }
        }
    }

    fn metrics(&mut self, snapshot: &Snapshot, elapsed_secs: f64) -> Vec<MetricPoint> {
        self.system.refresh_memory();
        self.system.refresh_cpu_usage();
        let request_duration = if snapshot.requests > 0 {
            snapshot.request_duration_millis as f64 / snapshot.requests as f64
        } else {
            0.0
        };
        let dependency_duration = if snapshot.dependencies > 0 {
            snapshot.dependency_duration_millis as f64 / snapshot.dependencies as f64
        } else {
            0.0
        };
        vec![
            MetricPoint {
                name: "\\ApplicationInsights\\Requests/Sec",
                value: snapshot.requests as f64 / elapsed_secs,
                weight: 1,
            },
            MetricPoint {
                name: "\\ApplicationInsights\\Request Duration",
                value: request_duration,
                weight: snapshot.requests.max(1) as i32,
            },
            MetricPoint {
                name: "\\ApplicationInsights\\Requests Failed/Sec",
                value: snapshot.unsuccessful_requests as f64 / elapsed_secs,
                weight: 1,
            },
            MetricPoint {
                name: "\\ApplicationInsights\\Dependency Calls/Sec",
                value: snapshot.dependencies as f64 / elapsed_secs,
                weight: 1,
            },
            MetricPoint {
                name: "\\ApplicationInsights\\Dependency Call Duration",
                value: dependency_duration,
                weight: snapshot.dependencies.max(1) as i32,
            },
            MetricPoint {
                name: "\\ApplicationInsights\\Dependency Calls Failed/Sec",
                value: snapshot.unsuccessful_dependencies as f64 / elapsed_secs,
                weight: 1,
            },
            MetricPoint {
                name: "\\ApplicationInsights\\Exceptions/Sec",
                value: snapshot.exceptions as f64 / elapsed_secs,
                weight: 1,
            },
            MetricPoint {
                name: "\\Memory\\Committed Bytes",
                value: self.system.used_memory() as f64,
                weight: 1,
            },
            MetricPoint {
                name: "\\Processor(_Total)\\% Processor Time",
                value: f64::from(self.system.global_cpu_usage()),
                weight: 1,
            },
        ]
    }

    fn document(&self, metrics: Vec<MetricPoint>) -> MonitoringPoint<'_> {
        MonitoringPoint {
            version: format!("rs:{}", env!("CARGO_PKG_VERSION")),
            invariant_version: INVARIANT_VERSION,
            instance: &self.config.role_instance,
            role_name: self.config.role_name.as_deref(),
            machine_name: &self.config.machine_name,
            stream_id: &self.stream_id,
            instrumentation_key: &self.config.i_key,
            timestamp: format!("/Date({})/", unix_millis()),
            metrics,
        }
    }

    async fn send(
        &self,
        uri: &str,
        body: Vec<u8>,
    ) -> Result<Response<Bytes>, crate::http_client::HttpError> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .header(STREAM_ID_HEADER, self.stream_id.as_str())
            .header(MACHINE_NAME_HEADER, self.config.machine_name.as_str())
            .header(INSTANCE_NAME_HEADER, self.config.role_instance.as_str())
            .header(TRANSMISSION_TIME_HEADER, transmission_ticks().to_string())
            .header(INVARIANT_VERSION_HEADER, INVARIANT_VERSION.to_string());
        if let Some(role_name) = &self.config.role_name {
            builder = builder.header(ROLE_NAME_HEADER, role_name.as_str());
        }
        let request = builder.body(body)?;
        self.client.send(request).await
    }
}

fn header_str<'a>(response: &'a Response<Bytes>, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Milliseconds since the Unix epoch.
fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Current time in .NET ticks, as the transmission-time header expects.
fn transmission_ticks() -> i64 {
    unix_millis() * TICKS_PER_MILLI + EPOCH_OFFSET_TICKS
}

fn new_stream_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{nanos:032x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Data, RequestData};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Default)]
    struct ScriptedClient {
        subscribe: bool,
        requests: StdMutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl HttpClient for ScriptedClient {
        async fn send(
            &self,
            request: Request<Vec<u8>>,
        ) -> Result<Response<Bytes>, crate::http_client::HttpError> {
            let uri = request.uri().to_string();
            self.requests
                .lock()
                .unwrap()
                .push((uri, request.body().clone()));
            let mut builder = Response::builder().status(200);
            if self.subscribe {
                builder = builder.header(SUBSCRIBED_HEADER, "true");
            }
            Ok(builder.body(Bytes::new()).unwrap())
        }
    }

    fn request_envelope(i_key: &str) -> Envelope {
        Envelope::new(
            i_key.to_string(),
            "2020-01-01T00:00:00.000000+00:00".to_string(),
            100.0,
            BTreeMap::new(),
            Data::RequestData(
                RequestData::builder()
                    .id("00f067aa0ba902b7".to_string())
                    .name("GET /".to_string())
                    .duration("00.00:00:00.150000".to_string())
                    .response_code("200".to_string())
                    .success(true)
                    .build(),
            ),
        )
    }

    fn config() -> LiveMetricsConfig {
        LiveMetricsConfig {
            i_key: "ikey-1".to_string(),
            endpoint: "https://rt.example.test".to_string(),
            role_name: Some("checkout".to_string()),
            role_instance: "host-1".to_string(),
            machine_name: "host-1".to_string(),
        }
    }

    async fn wait_for<F: Fn(&[(String, Vec<u8>)]) -> bool>(
        client: &ScriptedClient,
        predicate: F,
    ) {
        for _ in 0..200 {
            if predicate(&client.requests.lock().unwrap()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        panic!("condition not reached: {:?}", client.requests.lock().unwrap().len());
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribed_collector_keeps_pinging() {
        let client = Arc::new(ScriptedClient::default());
        let live = LiveMetrics::spawn(config(), client.clone());
        wait_for(&client, |requests| requests.len() >= 3).await;
        let requests = client.requests.lock().unwrap();
        assert!(requests
            .iter()
            .all(|(uri, _)| uri.contains("/QuickPulseService.svc/ping?ikey=ikey-1")));
        drop(requests);
        live.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn subscribed_collector_posts_snapshots() {
        let client = Arc::new(ScriptedClient {
            subscribe: true,
            ..Default::default()
        });
        let live = LiveMetrics::spawn(config(), client.clone());
        live.observe(&request_envelope("ikey-1"));
        live.observe(&request_envelope("other-ikey")); // ignored
        wait_for(&client, |requests| {
            requests.iter().any(|(uri, _)| uri.contains("/post?ikey="))
        })
        .await;

        let requests = client.requests.lock().unwrap();
        let (_, post_body) = requests
            .iter()
            .find(|(uri, _)| uri.contains("/post?ikey="))
            .unwrap();
        let body = String::from_utf8(post_body.clone()).unwrap();
        assert!(body.contains("\\\\ApplicationInsights\\\\Requests/Sec"));
        assert!(body.contains("\"InstrumentationKey\":\"ikey-1\""));
        drop(requests);
        live.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_tenant_envelopes_are_ignored() {
        let client = Arc::new(ScriptedClient::default());
        let live = LiveMetrics::spawn(config(), client.clone());
        live.observe(&request_envelope("other-ikey"));
        assert_eq!(live.counters.get_and_restart(), Snapshot::default());
        live.shutdown();
    }
}
