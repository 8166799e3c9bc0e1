// Shared test harness: boots a full frontend (HTTP ingress + querier
// QUIC listener) and optionally a worker driven by an in-process query
// handler, everything on ephemeral localhost ports.
//
// Helpers use strict client timeouts and no_proxy so a hung test fails
// fast instead of hanging the suite.
#![allow(dead_code)]
use anyhow::{Context, Result};
use async_trait::async_trait;
use frontend::config::FrontendConfig;
use frontend::frontend::Frontend;
use frontend::handler::{self, HandlerState};
use frontend::rpc;
use quill_queue::{FixedLimits, QueueSet};
use quill_transport::{QuicServer, TransportConfig, tls};
use quill_wire::{HttpRequest, HttpResponse};
use quill_worker::{HandlerError, QuerierConfig, QueryHandler, Worker, WorkerConfig};
use reqwest::redirect::Policy;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};

pub fn test_config() -> FrontendConfig {
    FrontendConfig {
        http_bind: "127.0.0.1:0".parse().expect("addr"),
        rpc_bind: "127.0.0.1:0".parse().expect("addr"),
        admin_bind: "127.0.0.1:0".parse().expect("addr"),
        downstream_url: None,
        max_body_size: 10 * 1024 * 1024,
        log_queries_longer_than_ms: 0,
        max_outstanding_per_tenant: 100,
        max_queriers_per_tenant: 0,
        query_timeout_ms: 0,
        drain_timeout_ms: 1000,
        max_frame_bytes: 16 * 1024 * 1024,
        server_name: "localhost".to_string(),
    }
}

pub struct TestFrontend {
    pub http_addr: SocketAddr,
    pub rpc_addr: SocketAddr,
    pub frontend: Arc<Frontend>,
    http_shutdown: Option<oneshot::Sender<()>>,
    rpc_shutdown: watch::Sender<bool>,
}

impl TestFrontend {
    pub async fn start(config: FrontendConfig) -> Result<Self> {
        tls::install_default_crypto_provider();
        let queues = Arc::new(QueueSet::new(
            config.max_outstanding_per_tenant,
            FixedLimits(config.max_queriers_per_tenant),
        ));
        let frontend = Arc::new(Frontend::new(queues));

        let (server_config, _cert) = tls::self_signed_server_config(&config.server_name)?;
        let quic_server = Arc::new(QuicServer::bind(
            "127.0.0.1:0".parse()?,
            server_config,
            TransportConfig::default(),
        )?);
        let rpc_addr = quic_server.local_addr()?;
        let (rpc_shutdown, rpc_shutdown_rx) = watch::channel(false);
        {
            let frontend = Arc::clone(&frontend);
            let max_frame_bytes = config.max_frame_bytes;
            tokio::spawn(async move {
                let _ = rpc::serve(quic_server, frontend, max_frame_bytes, rpc_shutdown_rx).await;
            });
        }

        let state = Arc::new(HandlerState::new(Arc::clone(&frontend), &config)?);
        let app = axum::Router::new()
            .fallback(handler::handle_query)
            .with_state(state);
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let http_addr = listener.local_addr()?;
        let (http_shutdown, http_shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async move {
                    let _ = http_shutdown_rx.await;
                })
                .await;
        });

        Ok(Self {
            http_addr,
            rpc_addr,
            frontend,
            http_shutdown: Some(http_shutdown),
            rpc_shutdown,
        })
    }

    /// Spawn a worker wired to this frontend's QUIC listener.
    pub fn start_worker(
        &self,
        handler: Arc<dyn QueryHandler>,
        parallelism: usize,
        match_max_concurrency: bool,
        max_concurrent: usize,
    ) -> Result<Worker> {
        let config = WorkerConfig {
            frontend_address: self.rpc_addr.to_string(),
            server_name: "localhost".to_string(),
            parallelism,
            match_max_concurrency,
            label: "test-worker".to_string(),
            insecure: true,
            ..WorkerConfig::default()
        };
        Worker::spawn(config, QuerierConfig { max_concurrent }, handler)
    }

    /// Block until at least one querier stream is registered.
    pub async fn wait_ready(&self) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if self.frontend.check_ready(false).is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(anyhow::anyhow!("no querier connected within the deadline"));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub fn url(&self, path_and_query: &str) -> String {
        format!("http://{}{path_and_query}", self.http_addr)
    }
}

impl Drop for TestFrontend {
    fn drop(&mut self) {
        if let Some(shutdown) = self.http_shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = self.rpc_shutdown.send(true);
    }
}

pub fn test_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .no_proxy()
        .redirect(Policy::none())
        .build()
        .context("build test http client")
}

/// Adapter so tests can express queriers as plain closures.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> QueryHandler for FnHandler<F>
where
    F: Fn(HttpRequest, watch::Receiver<bool>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<HttpResponse, HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        request: HttpRequest,
        cancel: watch::Receiver<bool>,
    ) -> std::result::Result<HttpResponse, HandlerError> {
        (self.0)(request, cancel).await
    }
}

/// Spawn an axum server with graceful shutdown, for downstream mocks.
pub async fn spawn_downstream(
    router: axum::Router,
) -> Result<(SocketAddr, oneshot::Sender<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await;
    });
    Ok((addr, shutdown_tx))
}
