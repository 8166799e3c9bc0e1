// Querier-side worker: dials the frontend, pulls queries over parallel
// process streams, runs them against the local handler, and reports the
// results. Reconnects with jittered exponential backoff until the
// frontend tells it to shut down.
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use quill_transport::{QuicClient, QuicConnection, TransportConfig, read_message, tls,
    write_message};
use quill_wire::{ErrorKind, HttpRequest, HttpResponse, Message};
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Connection settings for a querier worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Frontend QUIC address, host:port.
    pub frontend_address: String,
    /// TLS server name the frontend's certificate must carry.
    pub server_name: String,
    /// Number of parallel process streams when `match_max_concurrency`
    /// is off.
    pub parallelism: usize,
    /// Pull exactly as many streams as the local handler can serve.
    pub match_max_concurrency: bool,
    /// Label reported to the frontend for logging.
    pub label: String,
    /// Accept any frontend certificate (self-signed dev deployments).
    pub insecure: bool,
    pub max_frame_bytes: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            frontend_address: "127.0.0.1:9095".to_string(),
            server_name: "localhost".to_string(),
            parallelism: 1,
            match_max_concurrency: false,
            label: "querier".to_string(),
            insecure: false,
            max_frame_bytes: TransportConfig::default().max_frame_bytes,
        }
    }
}

impl WorkerConfig {
    // Environment variables provide defaults for local development.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            frontend_address: std::env::var("QUILL_FRONTEND_ADDRESS")
                .unwrap_or(defaults.frontend_address),
            server_name: std::env::var("QUILL_FRONTEND_SERVER_NAME")
                .unwrap_or(defaults.server_name),
            parallelism: std::env::var("QUILL_WORKER_PARALLELISM")
                .ok()
                .and_then(|value| value.parse::<usize>().ok())
                .filter(|value| *value > 0)
                .unwrap_or(defaults.parallelism),
            match_max_concurrency: std::env::var("QUILL_MATCH_MAX_CONCURRENCY")
                .ok()
                .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
                .unwrap_or(defaults.match_max_concurrency),
            label: std::env::var("QUILL_WORKER_LABEL").unwrap_or(defaults.label),
            insecure: std::env::var("QUILL_FRONTEND_INSECURE")
                .ok()
                .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
                .unwrap_or(defaults.insecure),
            max_frame_bytes: std::env::var("QUILL_MAX_FRAME_BYTES")
                .ok()
                .and_then(|value| value.parse::<usize>().ok())
                .filter(|value| *value > 0)
                .unwrap_or(defaults.max_frame_bytes),
        }
    }
}

/// Capacity of the local querier the worker fronts.
#[derive(Debug, Clone)]
pub struct QuerierConfig {
    pub max_concurrent: usize,
}

impl Default for QuerierConfig {
    fn default() -> Self {
        Self { max_concurrent: 4 }
    }
}

impl QuerierConfig {
    pub fn from_env() -> Self {
        Self {
            max_concurrent: std::env::var("QUILL_QUERIER_MAX_CONCURRENT")
                .ok()
                .and_then(|value| value.parse::<usize>().ok())
                .filter(|value| *value > 0)
                .unwrap_or_else(|| Self::default().max_concurrent),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum HandlerError {
    #[error("query cancelled")]
    Cancelled,
    #[error("query deadline exceeded")]
    DeadlineExceeded,
    /// A failure the querier wants reported with a specific HTTP status.
    #[error("{1}")]
    Status(u16, String),
    #[error("{0}")]
    Internal(String),
}

/// The local query engine, treated as a black box.
///
/// The `cancel` receiver fires when the frontend propagates a caller
/// cancellation; handlers may watch it or ignore it — the worker also
/// races it against the handler and answers with a cancelled error.
#[async_trait]
pub trait QueryHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        request: HttpRequest,
        cancel: watch::Receiver<bool>,
    ) -> std::result::Result<HttpResponse, HandlerError>;
}

/// Number of process streams the worker keeps open.
pub fn effective_concurrency(config: &WorkerConfig, querier: &QuerierConfig) -> usize {
    if config.match_max_concurrency {
        querier.max_concurrent.max(1)
    } else {
        config.parallelism.max(1)
    }
}

/// Running worker handle.
pub struct Worker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Worker {
    /// Start the worker's connection loop in the background.
    pub fn spawn(
        config: WorkerConfig,
        querier: QuerierConfig,
        handler: Arc<dyn QueryHandler>,
    ) -> Result<Self> {
        let concurrency = effective_concurrency(&config, &querier);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run(config, concurrency, handler, shutdown_rx));
        Ok(Self { shutdown, handle })
    }

    /// Stop pulling work and wait for the loop to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

async fn run(
    config: WorkerConfig,
    concurrency: usize,
    handler: Arc<dyn QueryHandler>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    // Set when the frontend sends Shutdown: reconnecting afterwards would
    // tie up a draining instance.
    let frontend_closed = Arc::new(AtomicBool::new(false));
    let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(5));
    loop {
        if stop_requested(&shutdown_rx) || frontend_closed.load(Ordering::Relaxed) {
            return;
        }
        match connect(&config).await {
            Ok(connection) => {
                backoff.reset();
                metrics::gauge!("quill_worker_connected").set(1.0);
                run_streams(
                    &connection,
                    concurrency,
                    &config,
                    Arc::clone(&handler),
                    Arc::clone(&frontend_closed),
                    shutdown_rx.clone(),
                )
                .await;
                metrics::gauge!("quill_worker_connected").set(0.0);
                connection.close("worker stopping");
            }
            Err(err) => {
                tracing::warn!(error = %err, address = %config.frontend_address, "frontend dial failed");
            }
        }
        if stop_requested(&shutdown_rx) || frontend_closed.load(Ordering::Relaxed) {
            return;
        }
        let delay = backoff.delay();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => {}
        }
    }
}

// A dropped shutdown handle counts as a shutdown; otherwise a worker
// whose owner is gone would reconnect forever.
fn stop_requested(shutdown_rx: &watch::Receiver<bool>) -> bool {
    *shutdown_rx.borrow() || shutdown_rx.has_changed().is_err()
}

async fn connect(config: &WorkerConfig) -> Result<QuicConnection> {
    tls::install_default_crypto_provider();
    let addr: SocketAddr = config
        .frontend_address
        .parse()
        .with_context(|| format!("parse frontend address {}", config.frontend_address))?;
    let client_config = if config.insecure {
        tls::insecure_client_config()?
    } else {
        quinn::ClientConfig::with_platform_verifier()
    };
    let client = QuicClient::bind(
        "0.0.0.0:0".parse().expect("wildcard addr"),
        client_config,
        TransportConfig {
            max_frame_bytes: config.max_frame_bytes,
            ..TransportConfig::default()
        },
    )?;
    client.connect(addr, &config.server_name).await
}

async fn run_streams(
    connection: &QuicConnection,
    concurrency: usize,
    config: &WorkerConfig,
    handler: Arc<dyn QueryHandler>,
    frontend_closed: Arc<AtomicBool>,
    shutdown_rx: watch::Receiver<bool>,
) {
    let mut tasks = Vec::with_capacity(concurrency);
    for ordinal in 0..concurrency {
        let connection = connection.clone();
        let handler = Arc::clone(&handler);
        let frontend_closed = Arc::clone(&frontend_closed);
        let shutdown_rx = shutdown_rx.clone();
        let label = format!("{}-{ordinal}", config.label);
        let max_frame_bytes = config.max_frame_bytes;
        tasks.push(tokio::spawn(async move {
            if let Err(err) = process_stream(
                connection,
                label,
                max_frame_bytes,
                handler,
                frontend_closed,
                shutdown_rx,
            )
            .await
            {
                tracing::debug!(error = %err, "process stream ended");
            }
        }));
    }
    for task in tasks {
        let _ = task.await;
    }
}

// One process stream: announce ourselves, then serve Request/Cancel
// messages until the stream dies or a shutdown is signalled. The send
// half lives in a writer task so query results never interleave with
// the read loop.
async fn process_stream(
    connection: QuicConnection,
    label: String,
    max_frame_bytes: usize,
    handler: Arc<dyn QueryHandler>,
    frontend_closed: Arc<AtomicBool>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let (mut send, mut recv) = connection.open_bi().await?;
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(16);
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if let Err(err) = write_message(&mut send, &message).await {
                tracing::debug!(error = %err, "stream writer stopped");
                break;
            }
        }
        let _ = send.finish();
    });

    out_tx
        .send(Message::Hello { label })
        .await
        .context("send hello")?;

    // Cancel switches for queries currently executing on this stream.
    let cancels: Arc<Mutex<HashMap<u64, watch::Sender<bool>>>> =
        Arc::new(Mutex::new(HashMap::new()));
    let mut scratch = BytesMut::with_capacity(64 * 1024);
    loop {
        let message = tokio::select! {
            message = read_message(&mut recv, max_frame_bytes, &mut scratch) => message?,
            _ = shutdown_rx.changed() => break,
        };
        match message {
            Some(Message::Request {
                query_id,
                request,
                deadline_ms,
            }) => {
                let (cancel_tx, cancel_rx) = watch::channel(false);
                cancels
                    .lock()
                    .expect("cancel lock")
                    .insert(query_id, cancel_tx);
                metrics::counter!("quill_worker_queries_total").increment(1);
                tokio::spawn(execute(
                    Arc::clone(&handler),
                    query_id,
                    request,
                    deadline_ms,
                    cancel_rx,
                    out_tx.clone(),
                    Arc::clone(&cancels),
                ));
            }
            Some(Message::Cancel { query_id }) => {
                if let Some(cancel) = cancels.lock().expect("cancel lock").get(&query_id) {
                    let _ = cancel.send(true);
                } else {
                    tracing::debug!(query_id, "cancel for unknown query");
                }
            }
            Some(Message::Shutdown) => {
                tracing::info!("frontend is shutting down, not reconnecting");
                frontend_closed.store(true, Ordering::Relaxed);
                break;
            }
            Some(other) => {
                tracing::warn!(message = ?other, "unexpected message on process stream");
            }
            None => break,
        }
    }
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

async fn execute(
    handler: Arc<dyn QueryHandler>,
    query_id: u64,
    request: HttpRequest,
    deadline_ms: Option<u64>,
    mut cancel_rx: watch::Receiver<bool>,
    out_tx: mpsc::Sender<Message>,
    cancels: Arc<Mutex<HashMap<u64, watch::Sender<bool>>>>,
) {
    let work = handler.handle(request, cancel_rx.clone());
    let result = match deadline_ms {
        Some(ms) => {
            match tokio::time::timeout(
                Duration::from_millis(ms),
                run_with_cancel(work, &mut cancel_rx),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(HandlerError::DeadlineExceeded),
            }
        }
        None => run_with_cancel(work, &mut cancel_rx).await,
    };
    cancels.lock().expect("cancel lock").remove(&query_id);
    let _ = out_tx.send(reply_for(query_id, result)).await;
}

// Race the handler against the cancel switch; whichever finishes first
// produces the single reply for this query.
async fn run_with_cancel<F>(
    work: F,
    cancel_rx: &mut watch::Receiver<bool>,
) -> std::result::Result<HttpResponse, HandlerError>
where
    F: std::future::Future<Output = std::result::Result<HttpResponse, HandlerError>>,
{
    tokio::select! {
        result = work => result,
        _ = cancelled(cancel_rx) => Err(HandlerError::Cancelled),
    }
}

async fn cancelled(cancel_rx: &mut watch::Receiver<bool>) {
    loop {
        if *cancel_rx.borrow() {
            return;
        }
        if cancel_rx.changed().await.is_err() {
            // Sender gone without firing: never resolves.
            std::future::pending::<()>().await;
        }
    }
}

fn reply_for(query_id: u64, result: std::result::Result<HttpResponse, HandlerError>) -> Message {
    match result {
        Ok(response) => Message::Result { query_id, response },
        // A failure with an explicit status is still a response as far as
        // the caller is concerned.
        Err(HandlerError::Status(status, message)) => Message::Result {
            query_id,
            response: HttpResponse::new(status, message.into_bytes().into()),
        },
        Err(HandlerError::Cancelled) => Message::Fail {
            query_id,
            kind: ErrorKind::Cancelled,
            message: "query cancelled".to_string(),
        },
        Err(HandlerError::DeadlineExceeded) => Message::Fail {
            query_id,
            kind: ErrorKind::DeadlineExceeded,
            message: "query deadline exceeded".to_string(),
        },
        Err(HandlerError::Internal(message)) => Message::Fail {
            query_id,
            kind: ErrorKind::Internal,
            message,
        },
    }
}

// Jittered exponential backoff for frontend reconnects.
struct Backoff {
    min: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            next: min,
        }
    }

    fn delay(&mut self) -> Duration {
        let base = self.next;
        self.next = (self.next * 2).min(self.max);
        let jitter_ms = base.as_millis() as u64 / 2;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
    }

    fn reset(&mut self) {
        self.next = self.min;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn config_reads_environment_overrides() {
        unsafe {
            std::env::set_var("QUILL_FRONTEND_ADDRESS", "10.0.0.1:9095");
            std::env::set_var("QUILL_WORKER_PARALLELISM", "6");
            std::env::set_var("QUILL_MATCH_MAX_CONCURRENCY", "true");
            std::env::set_var("QUILL_QUERIER_MAX_CONCURRENT", "2");
        }
        let config = WorkerConfig::from_env();
        assert_eq!(config.frontend_address, "10.0.0.1:9095");
        assert_eq!(config.parallelism, 6);
        assert!(config.match_max_concurrency);
        let querier = QuerierConfig::from_env();
        assert_eq!(querier.max_concurrent, 2);
        assert_eq!(effective_concurrency(&config, &querier), 2);
        unsafe {
            std::env::remove_var("QUILL_FRONTEND_ADDRESS");
            std::env::remove_var("QUILL_WORKER_PARALLELISM");
            std::env::remove_var("QUILL_MATCH_MAX_CONCURRENCY");
            std::env::remove_var("QUILL_QUERIER_MAX_CONCURRENT");
        }
    }

    #[test]
    fn concurrency_follows_parallelism_by_default() {
        let config = WorkerConfig {
            parallelism: 3,
            ..WorkerConfig::default()
        };
        let querier = QuerierConfig { max_concurrent: 8 };
        assert_eq!(effective_concurrency(&config, &querier), 3);
    }

    #[test]
    fn concurrency_matches_querier_capacity_when_asked() {
        let config = WorkerConfig {
            parallelism: 16,
            match_max_concurrency: true,
            ..WorkerConfig::default()
        };
        let querier = QuerierConfig { max_concurrent: 1 };
        assert_eq!(effective_concurrency(&config, &querier), 1);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(400));
        let first = backoff.delay();
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(200));
        backoff.delay();
        backoff.delay();
        let capped = backoff.delay();
        assert!(capped >= Duration::from_millis(400) && capped < Duration::from_millis(700));
        backoff.reset();
        let reset = backoff.delay();
        assert!(reset < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn cancel_switch_beats_a_stuck_handler() {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let work = async {
            std::future::pending::<()>().await;
            unreachable!()
        };
        cancel_tx.send(true).expect("fire cancel");
        let result = run_with_cancel(work, &mut cancel_rx).await;
        assert!(matches!(result, Err(HandlerError::Cancelled)));
    }

    #[test]
    fn replies_map_errors_to_wire_messages() {
        match reply_for(1, Err(HandlerError::Cancelled)) {
            Message::Fail { kind, .. } => assert_eq!(kind, ErrorKind::Cancelled),
            other => panic!("expected fail, got {other:?}"),
        }
        match reply_for(2, Err(HandlerError::DeadlineExceeded)) {
            Message::Fail { kind, .. } => assert_eq!(kind, ErrorKind::DeadlineExceeded),
            other => panic!("expected fail, got {other:?}"),
        }
        match reply_for(3, Err(HandlerError::Status(400, "bad request".to_string()))) {
            Message::Result { response, .. } => assert_eq!(response.status, 400),
            other => panic!("expected result, got {other:?}"),
        }
        match reply_for(4, Ok(HttpResponse::new(200, bytes::Bytes::from_static(b"ok")))) {
            Message::Result { query_id, response } => {
                assert_eq!(query_id, 4);
                assert_eq!(response.status, 200);
            }
            other => panic!("expected result, got {other:?}"),
        }
    }
}
