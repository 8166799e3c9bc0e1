// Frontend service main entry point.
use anyhow::{Context, Result};
use frontend::config::FrontendConfig;
use frontend::frontend::Frontend;
use frontend::handler::{self, HandlerState};
use frontend::{observability, rpc};
use quill_queue::{FixedLimits, QueueSet};
use quill_transport::{QuicServer, TransportConfig, tls};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    let config = FrontendConfig::from_env_or_yaml()?;
    let metrics_handle = observability::init_observability("quill-frontend");
    tls::install_default_crypto_provider();

    let queues = Arc::new(QueueSet::new(
        config.max_outstanding_per_tenant,
        FixedLimits(config.max_queriers_per_tenant),
    ));
    let frontend = Arc::new(Frontend::new(Arc::clone(&queues)));
    let downstream_mode = config.downstream_url.is_some();
    tracing::info!(downstream_mode, "frontend starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Querier-facing QUIC listener. A downstream proxy serves without it,
    // but keeping it up lets queriers connect ahead of a mode change.
    let (server_config, _cert) = tls::self_signed_server_config(&config.server_name)
        .context("build QUIC server config")?;
    let quic_server = Arc::new(
        QuicServer::bind(
            config.rpc_bind,
            server_config,
            TransportConfig {
                max_frame_bytes: config.max_frame_bytes,
                ..TransportConfig::default()
            },
        )
        .context("bind QUIC listener")?,
    );
    tracing::info!(addr = %quic_server.local_addr()?, "querier listener started");
    let rpc_task = {
        let frontend = Arc::clone(&frontend);
        let shutdown_rx = shutdown_rx.clone();
        let max_frame_bytes = config.max_frame_bytes;
        tokio::spawn(async move {
            if let Err(err) = rpc::serve(quic_server, frontend, max_frame_bytes, shutdown_rx).await {
                tracing::warn!(error = %err, "querier accept loop exited");
            }
        })
    };

    // Admin surface: metrics and readiness.
    let admin_task = {
        let frontend = Arc::clone(&frontend);
        let admin_bind = config.admin_bind;
        tokio::spawn(async move {
            if let Err(err) =
                observability::serve_admin(metrics_handle, admin_bind, frontend, downstream_mode)
                    .await
            {
                tracing::warn!(error = %err, "admin listener exited");
            }
        })
    };

    // Query ingress.
    let state = Arc::new(HandlerState::new(Arc::clone(&frontend), &config)?);
    let app = axum::Router::new()
        .fallback(handler::handle_query)
        .with_state(state);
    let listener = tokio::net::TcpListener::bind(config.http_bind)
        .await
        .context("bind HTTP listener")?;
    tracing::info!(addr = %listener.local_addr()?, "http listener started");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("serve HTTP")?;

    // Graceful stop: drain queued work first so blocked querier streams
    // keep serving, then let them send their shutdown notice and close
    // the accept loop.
    tracing::info!("frontend stopping");
    queues.stop(Duration::from_millis(config.drain_timeout_ms)).await;
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(1), rpc_task).await;
    admin_task.abort();
    tracing::info!("frontend stopped");
    Ok(())
}
