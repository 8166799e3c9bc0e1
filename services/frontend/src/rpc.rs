// Querier-facing QUIC server. Queriers pull queued queries over
// long-lived process streams; results and cancellations travel the
// same stream, correlated by query id. A separate short-lived stream
// whose first message is already a result delivers out-of-band results.
use crate::error::QueryError;
use crate::frontend::Frontend;
use anyhow::{Context, Result};
use bytes::BytesMut;
use quill_queue::WorkerId;
use quill_transport::{QuicConnection, QuicServer, read_message, write_message};
use quill_wire::Message;
use quinn::{RecvStream, SendStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::{mpsc, watch};

// Each process stream is an independent execution slot with its own id.
static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

// Outgoing queue depth per stream: requests, cancels, and the terminal
// shutdown notice.
const STREAM_WRITER_DEPTH: usize = 16;

/// Accept querier connections until shutdown fires.
pub async fn serve(
    server: Arc<QuicServer>,
    frontend: Arc<Frontend>,
    max_frame_bytes: usize,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        let connection = tokio::select! {
            result = server.accept() => result?,
            _ = wait_for(shutdown.clone()) => return Ok(()),
        };
        let frontend = Arc::clone(&frontend);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(frontend, connection, max_frame_bytes, shutdown).await
            {
                tracing::warn!(error = %err, "querier connection handler failed");
            }
        });
    }
}

async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn handle_connection(
    frontend: Arc<Frontend>,
    connection: QuicConnection,
    max_frame_bytes: usize,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    tracing::info!(conn = %connection.id(), peer = %connection.remote_addr(), "querier connected");
    loop {
        let (send, recv) = match connection.accept_bi().await {
            Ok(streams) => streams,
            Err(err) => {
                tracing::info!(conn = %connection.id(), error = %err, "querier connection closed");
                return Ok(());
            }
        };
        let frontend = Arc::clone(&frontend);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_stream(frontend, send, recv, max_frame_bytes, shutdown).await {
                tracing::warn!(error = %err, "querier stream handler failed");
            }
        });
    }
}

// Stream role is declared by the first client message: a Hello opens a
// process stream, a Result/Fail is an out-of-band delivery.
async fn handle_stream(
    frontend: Arc<Frontend>,
    mut send: SendStream,
    mut recv: RecvStream,
    max_frame_bytes: usize,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut scratch = BytesMut::with_capacity(64 * 1024);
    match read_message(&mut recv, max_frame_bytes, &mut scratch).await? {
        Some(Message::Hello { label }) => {
            process_stream(frontend, label, send, recv, max_frame_bytes, shutdown).await
        }
        Some(Message::Result { query_id, response }) => {
            frontend.deliver(query_id, Ok(response));
            write_message(&mut send, &Message::Ok).await?;
            let _ = send.finish();
            Ok(())
        }
        Some(Message::Fail {
            query_id,
            kind,
            message,
        }) => {
            frontend.deliver(query_id, Err(QueryError::from_wire(kind, message)));
            write_message(&mut send, &Message::Ok).await?;
            let _ = send.finish();
            Ok(())
        }
        Some(other) => {
            tracing::warn!(message = ?other, "unexpected first message on querier stream");
            Ok(())
        }
        None => Ok(()),
    }
}

// The v1 process contract: dequeue a query for this worker, send it,
// await the correlated reply, repeat. Depth-1 per stream; queriers add
// parallelism by opening more streams. The writer task owns the send
// half so handler-initiated cancels never interleave with this loop.
async fn process_stream(
    frontend: Arc<Frontend>,
    label: String,
    send: SendStream,
    mut recv: RecvStream,
    max_frame_bytes: usize,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let worker = WorkerId(NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed));
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(STREAM_WRITER_DEPTH);
    let writer = tokio::spawn(async move {
        let mut send = send;
        while let Some(message) = out_rx.recv().await {
            if let Err(err) = write_message(&mut send, &message).await {
                tracing::debug!(error = %err, "stream writer stopped");
                break;
            }
        }
        let _ = send.finish();
    });

    frontend.worker_connected(worker);
    tracing::info!(%worker, label, "querier process stream opened");

    let result = process_loop(
        &frontend,
        worker,
        &out_tx,
        &mut recv,
        max_frame_bytes,
        &mut shutdown,
    )
    .await;

    frontend.worker_disconnected(worker);
    tracing::info!(%worker, "querier process stream closed");

    // A stopped queue means this instance is going away: the querier is
    // told not to come back. A dead stream gets nothing — the querier
    // will reconnect.
    if matches!(result, Ok(true)) {
        let _ = out_tx.send(Message::Shutdown).await;
    }
    drop(out_tx);
    let _ = writer.await;
    result.map(|_| ())
}

// Returns Ok(true) when the loop ended because the queue set stopped
// (graceful shutdown), Ok(false) when the querier finished the stream.
async fn process_loop(
    frontend: &Frontend,
    worker: WorkerId,
    out_tx: &mpsc::Sender<Message>,
    recv: &mut RecvStream,
    max_frame_bytes: usize,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<bool> {
    let mut scratch = BytesMut::with_capacity(64 * 1024);
    loop {
        // Blocks until there is work this worker may serve, or until the
        // queue set stops.
        let envelope = match frontend.queues().dequeue(worker, shutdown).await {
            Ok(envelope) => envelope,
            Err(_) => return Ok(true),
        };
        let query_id = envelope.query_id;

        // The caller may have cancelled while the query was queued; the
        // querier must not see it in that case.
        if !frontend.mark_dispatched(query_id, out_tx.clone()) {
            continue;
        }
        let deadline_ms = envelope.deadline.map(|deadline| {
            deadline
                .saturating_duration_since(Instant::now())
                .as_millis() as u64
        });
        out_tx
            .send(Message::Request {
                query_id,
                request: envelope.request,
                deadline_ms,
            })
            .await
            .context("send request to querier")?;

        // Await the correlated reply. The stream dying here means the
        // querier took the query down with it: flag the pending entry so
        // the handler reports a lost querier instead of a timeout.
        loop {
            let message = match read_message(recv, max_frame_bytes, &mut scratch).await {
                Ok(message) => message,
                Err(err) => {
                    frontend.mark_worker_lost(&[query_id]);
                    return Err(err);
                }
            };
            match message {
                Some(Message::Result {
                    query_id: id,
                    response,
                }) => {
                    frontend.deliver(id, Ok(response));
                    if id == query_id {
                        break;
                    }
                }
                Some(Message::Fail {
                    query_id: id,
                    kind,
                    message,
                }) => {
                    frontend.deliver(id, Err(QueryError::from_wire(kind, message)));
                    if id == query_id {
                        break;
                    }
                }
                Some(other) => {
                    tracing::warn!(message = ?other, "unexpected message on process stream");
                }
                None => {
                    frontend.mark_worker_lost(&[query_id]);
                    return Ok(false);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::Frontend;
    use quill_queue::{Envelope, FixedLimits, QueueSet};
    use quill_transport::{QuicClient, TransportConfig, tls};
    use quill_wire::{HttpRequest, HttpResponse};
    use std::time::Duration;

    async fn start_server(frontend: Arc<Frontend>) -> Result<(std::net::SocketAddr, watch::Sender<bool>)> {
        tls::install_default_crypto_provider();
        let (server_config, _cert) = tls::self_signed_server_config("localhost")?;
        let server = Arc::new(QuicServer::bind(
            "127.0.0.1:0".parse()?,
            server_config,
            TransportConfig::default(),
        )?);
        let addr = server.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(serve(server, frontend, 1024 * 1024, shutdown_rx));
        Ok((addr, shutdown_tx))
    }

    async fn dial(addr: std::net::SocketAddr) -> Result<QuicConnection> {
        let client = QuicClient::bind(
            "0.0.0.0:0".parse()?,
            tls::insecure_client_config()?,
            TransportConfig::default(),
        )?;
        client.connect(addr, "localhost").await
    }

    #[tokio::test]
    async fn process_stream_round_trip() -> Result<()> {
        let queues = Arc::new(QueueSet::new(10, FixedLimits(0)));
        let frontend = Arc::new(Frontend::new(queues));
        let (addr, _shutdown) = start_server(Arc::clone(&frontend)).await?;

        let connection = dial(addr).await?;
        let (mut send, mut recv) = connection.open_bi().await?;
        write_message(&mut send, &Message::Hello { label: "test".to_string() }).await?;

        // Wait for the stream to register before queueing.
        for _ in 0..100 {
            if frontend.connected_workers() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(frontend.connected_workers(), 1);

        let query_id = frontend.next_query_id();
        let response_rx = frontend.register(query_id);
        frontend
            .enqueue(Envelope::new(query_id, "t1", HttpRequest::default()))
            .expect("enqueue");

        let mut scratch = BytesMut::new();
        let request = read_message(&mut recv, 1024 * 1024, &mut scratch)
            .await?
            .context("request expected")?;
        let received_id = match request {
            Message::Request { query_id: id, .. } => id,
            other => panic!("expected request, got {other:?}"),
        };
        assert_eq!(received_id, query_id);

        write_message(
            &mut send,
            &Message::Result {
                query_id,
                response: HttpResponse::new(200, "done".into()),
            },
        )
        .await?;

        let result = response_rx.await.expect("delivery").expect("response");
        assert_eq!(result.status, 200);
        assert_eq!(result.body.as_ref(), b"done");
        Ok(())
    }

    #[tokio::test]
    async fn out_of_band_result_is_delivered() -> Result<()> {
        let queues = Arc::new(QueueSet::new(10, FixedLimits(0)));
        let frontend = Arc::new(Frontend::new(queues));
        let (addr, _shutdown) = start_server(Arc::clone(&frontend)).await?;

        let query_id = frontend.next_query_id();
        let response_rx = frontend.register(query_id);

        let connection = dial(addr).await?;
        let (mut send, mut recv) = connection.open_bi().await?;
        write_message(
            &mut send,
            &Message::Result {
                query_id,
                response: HttpResponse::new(200, "oob".into()),
            },
        )
        .await?;
        send.finish().ok();

        let mut scratch = BytesMut::new();
        let ack = read_message(&mut recv, 1024 * 1024, &mut scratch).await?;
        assert_eq!(ack, Some(Message::Ok));

        let result = response_rx.await.expect("delivery").expect("response");
        assert_eq!(result.body.as_ref(), b"oob");
        Ok(())
    }

    #[tokio::test]
    async fn stream_death_flags_in_flight_queries() -> Result<()> {
        let queues = Arc::new(QueueSet::new(10, FixedLimits(0)));
        let frontend = Arc::new(Frontend::new(queues));
        let (addr, _shutdown) = start_server(Arc::clone(&frontend)).await?;

        let connection = dial(addr).await?;
        let (mut send, mut recv) = connection.open_bi().await?;
        write_message(&mut send, &Message::Hello { label: "dying".to_string() }).await?;

        let query_id = frontend.next_query_id();
        let _response_rx = frontend.register(query_id);
        frontend
            .enqueue(Envelope::new(query_id, "t1", HttpRequest::default()))
            .expect("enqueue");

        // Take the request, then vanish without answering.
        let mut scratch = BytesMut::new();
        read_message(&mut recv, 1024 * 1024, &mut scratch)
            .await?
            .context("request expected")?;
        connection.close("gone");

        for _ in 0..100 {
            if frontend.connected_workers() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(frontend.connected_workers(), 0);
        // The entry was left in place, flagged as lost.
        assert_eq!(frontend.take_expired(query_id), Some(true));
        Ok(())
    }
}
