//! Reliable delivery of envelope batches to the ingestion endpoint.
//!
//! Envelopes are queued on a bounded channel and drained by a worker
//! task into batches, bounded by size and by the age of the oldest
//! queued envelope. Delivery failures classified as transient back off
//! exponentially and redispatch the same batch; a batch that exhausts
//! its retries is written to the on-disk spool, which a slow drainer
//! replays once deliveries succeed again. Permanent rejections drop the
//! batch and are logged once per status code.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::{
    header::{CONTENT_ENCODING, CONTENT_TYPE},
    Method, Request,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Notify};

use crate::http_client::HttpClient;
use crate::internal_logs::OnceSet;
use crate::model::{serialize_batch, Envelope};
use crate::{diag_debug, diag_warn};

mod backoff;
mod spool;

pub use backoff::BackoffPolicy;
pub use spool::{Spool, SpoolError, SpoolHeader, SpooledBatch};

use backoff::Backoff;

const TRACK_CONTENT_TYPE: &str = "application/x-json-stream";

/// Bodies smaller than this are not worth compressing.
#[cfg(feature = "gzip")]
const GZIP_THRESHOLD: usize = 1024;

/// Transmitter tuning; the defaults match the service's expectations.
#[derive(Clone, Debug)]
pub struct TransmitterConfig {
    /// Full ingestion URL, e.g. `https://dc.services.visualstudio.com/v2.1/track`.
    pub endpoint: String,
    /// Envelopes per batch.
    pub max_batch_size: usize,
    /// A partial batch is sent once its oldest envelope is this old.
    pub batch_timeout: Duration,
    /// In-memory buffer cap; beyond it envelopes overflow to the spool.
    pub queue_capacity: usize,
    pub backoff: BackoffPolicy,
    /// Directory for undeliverable batches.
    pub spool_dir: PathBuf,
    /// Total on-disk spool cap, oldest evicted first.
    pub spool_max_bytes: u64,
    /// How often the drainer looks for spooled batches to replay.
    pub spool_drain_interval: Duration,
}

impl Default for TransmitterConfig {
    fn default() -> Self {
        TransmitterConfig {
            endpoint: "https://dc.services.visualstudio.com/v2.1/track".to_string(),
            max_batch_size: 500,
            batch_timeout: Duration::from_millis(2_000),
            queue_capacity: 2_048,
            backoff: BackoffPolicy::default(),
            spool_dir: std::env::temp_dir()
                .join(env!("CARGO_PKG_NAME"))
                .join("transmission"),
            spool_max_bytes: 50 * 1024 * 1024,
            spool_drain_interval: Duration::from_secs(10),
        }
    }
}

/// Errors surfaced to pipeline callers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransmitError {
    /// Both the in-memory buffer and the spool refused the envelope.
    #[error("telemetry buffer is full")]
    BufferFull,
    /// The worker has already shut down.
    #[error("transmitter is shut down")]
    Closed,
    /// A flush or shutdown did not finish in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Spool(#[from] SpoolError),
}

/// Self-metrics; the only place dropped telemetry is accounted for.
#[derive(Debug, Default)]
pub struct TransmitterStats {
    delivered: AtomicU64,
    dropped: AtomicU64,
    retries: AtomicU64,
    spooled: AtomicU64,
    replayed: AtomicU64,
}

/// Point-in-time view of [`TransmitterStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Envelopes acknowledged by the service.
    pub delivered: u64,
    /// Envelopes dropped (permanent rejection, serialization failure, or
    /// overflow with a full spool).
    pub dropped: u64,
    /// Retry-triggering delivery outcomes.
    pub retries: u64,
    /// Envelopes written to the spool.
    pub spooled: u64,
    /// Spooled batches replayed successfully.
    pub replayed: u64,
}

impl TransmitterStats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            spooled: self.spooled.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
enum Message {
    Item(Box<Envelope>),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the delivery worker and spool drainer.
#[derive(Debug)]
pub struct Transmitter {
    sender: mpsc::Sender<Message>,
    stats: Arc<TransmitterStats>,
    spool: Arc<Spool>,
    cancel: Arc<Notify>,
    drainer_shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl Transmitter {
    /// Opens the spool and starts the worker and drainer tasks on the
    /// current tokio runtime.
    pub fn spawn(
        config: TransmitterConfig,
        client: Arc<dyn HttpClient>,
    ) -> Result<Self, SpoolError> {
        let spool = Arc::new(Spool::open(&config.spool_dir, config.spool_max_bytes)?);
        let stats = Arc::new(TransmitterStats::default());
        let healthy = Arc::new(AtomicBool::new(true));
        let cancel = Arc::new(Notify::new());
        let (sender, receiver) = mpsc::channel(config.queue_capacity);

        let worker = Worker {
            client: client.clone(),
            spool: spool.clone(),
            stats: stats.clone(),
            healthy: healthy.clone(),
            cancel: cancel.clone(),
            rejected_status_logged: OnceSet::new(),
            batch: Vec::new(),
            oldest: None,
            config: config.clone(),
        };
        tokio::spawn(worker.run(receiver));

        let (drainer_tx, drainer_rx) = oneshot::channel();
        tokio::spawn(drain_spool(
            spool.clone(),
            client,
            config,
            stats.clone(),
            healthy,
            drainer_rx,
        ));

        Ok(Transmitter {
            sender,
            stats,
            spool,
            cancel,
            drainer_shutdown: Mutex::new(Some(drainer_tx)),
        })
    }

    /// Hands one envelope to the worker without blocking. When the
    /// buffer is saturated the envelope is stored durably in the spool
    /// instead; only when that also fails is it dropped and counted.
    pub fn enqueue(&self, envelope: Envelope) -> Result<(), TransmitError> {
        match self.sender.try_send(Message::Item(Box::new(envelope))) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(Message::Item(envelope))) => {
                self.overflow(*envelope)
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(TransmitError::BufferFull),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                Err(TransmitError::Closed)
            }
        }
    }

    fn overflow(&self, envelope: Envelope) -> Result<(), TransmitError> {
        let body = match serialize_batch(&[envelope]) {
            Ok(body) => body,
            Err(_) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                return Err(TransmitError::BufferFull);
            }
        };
        match self.spool.store(&body, None, 0) {
            Ok(_) => {
                self.stats.spooled.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                diag_debug!(name: "telemetry_overflow_dropped", error = format!("{err}"));
                Err(TransmitError::BufferFull)
            }
        }
    }

    /// Drains queued envelopes and in-flight batches.
    pub async fn flush(&self, timeout: Duration) -> Result<(), TransmitError> {
        self.signal(Message::Flush, timeout).await
    }

    /// Flushes, then stops the worker and the drainer. An in-progress
    /// backoff wait is interrupted and its batch goes to the spool.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), TransmitError> {
        self.cancel.notify_one();
        let drainer = self
            .drainer_shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(drainer) = drainer {
            let _ = drainer.send(());
        }
        self.signal(Message::Shutdown, timeout).await
    }

    async fn signal(
        &self,
        message: fn(oneshot::Sender<()>) -> Message,
        timeout: Duration,
    ) -> Result<(), TransmitError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        tokio::time::timeout(timeout, async {
            self.sender
                .send(message(ack_tx))
                .await
                .map_err(|_| TransmitError::Closed)?;
            ack_rx.await.map_err(|_| TransmitError::Closed)
        })
        .await
        .map_err(|_| TransmitError::Timeout(timeout))?
    }

    /// Current self-metrics.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

struct Worker {
    client: Arc<dyn HttpClient>,
    config: TransmitterConfig,
    spool: Arc<Spool>,
    stats: Arc<TransmitterStats>,
    healthy: Arc<AtomicBool>,
    cancel: Arc<Notify>,
    rejected_status_logged: OnceSet,
    batch: Vec<Envelope>,
    oldest: Option<tokio::time::Instant>,
}

impl Worker {
    async fn run(mut self, mut receiver: mpsc::Receiver<Message>) {
        loop {
            let deadline = self.oldest.map(|oldest| oldest + self.config.batch_timeout);
            let batch_aged = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                message = receiver.recv() => match message {
                    Some(Message::Item(envelope)) => {
                        if self.batch.is_empty() {
                            self.oldest = Some(tokio::time::Instant::now());
                        }
                        self.batch.push(*envelope);
                        if self.batch.len() >= self.config.max_batch_size {
                            self.dispatch().await;
                        }
                    }
                    Some(Message::Flush(ack)) => {
                        self.dispatch().await;
                        let _ = ack.send(());
                    }
                    Some(Message::Shutdown(ack)) => {
                        self.dispatch().await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.dispatch().await;
                        break;
                    }
                },
                _ = batch_aged => self.dispatch().await,
            }
        }
        diag_debug!(name: "transmitter_stopped");
    }

    /// Sends the current batch, retrying transient failures until the
    /// backoff policy gives up and the batch goes to the spool.
    async fn dispatch(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let envelopes = std::mem::take(&mut self.batch);
        self.oldest = None;
        let count = envelopes.len() as u64;
        let body = match serialize_batch(&envelopes) {
            Ok(body) => body,
            Err(err) => {
                self.stats.dropped.fetch_add(count, Ordering::Relaxed);
                diag_warn!(name: "batch_serialize_failed", error = format!("{err}"));
                return;
            }
        };
        let (body, encoding) = encode_body(body);

        let mut backoff = Backoff::new(self.config.backoff.clone());
        loop {
            match send_once(&*self.client, &self.config.endpoint, &body, encoding).await {
                Disposition::Delivered => {
                    self.healthy.store(true, Ordering::Relaxed);
                    self.stats.delivered.fetch_add(count, Ordering::Relaxed);
                    return;
                }
                Disposition::Retry => {
                    self.healthy.store(false, Ordering::Relaxed);
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    if backoff.exhausted() {
                        self.spool_batch(&body, encoding, backoff.attempts() as u32, count);
                        return;
                    }
                    let delay = backoff.next_delay();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        // Shutdown interrupts the wait; the batch is kept
                        // durable instead of retried.
                        _ = self.cancel.notified() => {
                            self.spool_batch(&body, encoding, backoff.attempts() as u32, count);
                            return;
                        }
                    }
                }
                Disposition::Rejected(status) => {
                    self.stats.dropped.fetch_add(count, Ordering::Relaxed);
                    if self.rejected_status_logged.first(status.to_string()) {
                        diag_warn!(name: "telemetry_rejected", status = i64::from(status));
                    }
                    return;
                }
            }
        }
    }

    fn spool_batch(&self, body: &[u8], encoding: Option<&str>, retry_count: u32, count: u64) {
        match self.spool.store(body, encoding, retry_count) {
            Ok(_) => {
                self.stats.spooled.fetch_add(count, Ordering::Relaxed);
            }
            Err(err) => {
                self.stats.dropped.fetch_add(count, Ordering::Relaxed);
                diag_warn!(name: "batch_spool_failed", error = format!("{err}"));
            }
        }
    }
}

/// Replays spooled batches, one per tick, while deliveries are healthy.
async fn drain_spool(
    spool: Arc<Spool>,
    client: Arc<dyn HttpClient>,
    config: TransmitterConfig,
    stats: Arc<TransmitterStats>,
    healthy: Arc<AtomicBool>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = tokio::time::sleep(config.spool_drain_interval) => {}
        }
        if !healthy.load(Ordering::Relaxed) {
            continue;
        }
        let batch = match spool.oldest() {
            Ok(Some(batch)) => batch,
            Ok(None) => continue,
            Err(err) => {
                diag_warn!(name: "spool_read_failed", error = format!("{err}"));
                continue;
            }
        };
        let encoding = batch.header.content_encoding.as_deref();
        match send_once(&*client, &config.endpoint, &batch.body, encoding).await {
            Disposition::Delivered => {
                let _ = spool.remove(&batch.path);
                stats.replayed.fetch_add(1, Ordering::Relaxed);
            }
            Disposition::Retry => {
                let _ = spool.bump_retry(&batch);
                healthy.store(false, Ordering::Relaxed);
            }
            Disposition::Rejected(status) => {
                let _ = spool.remove(&batch.path);
                diag_warn!(name: "spooled_batch_rejected", status = i64::from(status));
            }
        }
    }
}

enum Disposition {
    Delivered,
    Retry,
    Rejected(u16),
}

async fn send_once(
    client: &dyn HttpClient,
    endpoint: &str,
    body: &[u8],
    encoding: Option<&str>,
) -> Disposition {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(endpoint)
        .header(CONTENT_TYPE, TRACK_CONTENT_TYPE);
    if let Some(encoding) = encoding {
        builder = builder.header(CONTENT_ENCODING, encoding);
    }
    let request = match builder.body(body.to_vec()) {
        Ok(request) => request,
        Err(_) => return Disposition::Rejected(0),
    };
    match client.send(request).await {
        Ok(response) => classify_status(response.status().as_u16()),
        Err(err) => {
            diag_debug!(name: "ingestion_send_failed", error = format!("{err}"));
            Disposition::Retry
        }
    }
}

/// Request timeout and server errors are worth retrying; everything else
/// the service rejected for good.
fn classify_status(status: u16) -> Disposition {
    match status {
        200..=299 => Disposition::Delivered,
        408 => Disposition::Retry,
        500..=599 => Disposition::Retry,
        other => Disposition::Rejected(other),
    }
}

#[cfg(feature = "gzip")]
fn encode_body(body: Vec<u8>) -> (Vec<u8>, Option<&'static str>) {
    use std::io::Write;

    if body.len() < GZIP_THRESHOLD {
        return (body, None);
    }
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    if encoder.write_all(&body).is_ok() {
        if let Ok(compressed) = encoder.finish() {
            return (compressed, Some("gzip"));
        }
    }
    (body, None)
}

#[cfg(not(feature = "gzip"))]
fn encode_body(body: Vec<u8>) -> (Vec<u8>, Option<&'static str>) {
    (body, None)
}
