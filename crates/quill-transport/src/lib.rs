// QUIC transport for the frontend <-> querier protocol: endpoint wrappers,
// framed message IO, and TLS helpers for dev/test deployments.
use anyhow::{Context, Result, anyhow};
use bytes::{Bytes, BytesMut};
use quinn::{ClientConfig, Connection, Endpoint, ReadExactError, RecvStream, SendStream,
    ServerConfig};
use quill_wire::{Frame, FrameHeader, Message};
use std::net::SocketAddr;
use std::sync::Arc;

pub mod tls;

/// Transport-level configuration.
///
/// ```
/// use quill_transport::TransportConfig;
///
/// let config = TransportConfig::default();
/// assert!(config.max_frame_bytes > 0);
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Largest frame payload accepted before the stream is torn down.
    pub max_frame_bytes: usize,
    /// Concurrent bidirectional streams allowed per connection.
    pub max_streams: u16,
}

impl Default for TransportConfig {
    fn default() -> Self {
        // Queries and their responses are buffered whole, so the frame cap
        // bounds per-query memory on both sides.
        Self {
            max_frame_bytes: 16 * 1024 * 1024,
            max_streams: 256,
        }
    }
}

impl TransportConfig {
    fn quinn_transport_config(&self) -> quinn::TransportConfig {
        let mut config = quinn::TransportConfig::default();
        let streams = quinn::VarInt::from_u32(self.max_streams as u32);
        config.max_concurrent_bidi_streams(streams);
        config
    }
}

/// Stable identifier for a querier connection, used for shard placement
/// and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// QUIC listener for the frontend side.
#[derive(Debug)]
pub struct QuicServer {
    endpoint: Endpoint,
}

impl QuicServer {
    pub fn bind(
        addr: SocketAddr,
        mut server_config: ServerConfig,
        transport: TransportConfig,
    ) -> Result<Self> {
        server_config.transport_config(Arc::new(transport.quinn_transport_config()));
        let endpoint = Endpoint::server(server_config, addr).context("bind QUIC server")?;
        Ok(Self { endpoint })
    }

    pub async fn accept(&self) -> Result<QuicConnection> {
        let connecting = self
            .endpoint
            .accept()
            .await
            .ok_or_else(|| anyhow!("QUIC endpoint closed"))?;
        let connection = connecting.await.context("accept QUIC connection")?;
        Ok(QuicConnection::new(connection))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint.local_addr().context("read QUIC local address")
    }
}

/// QUIC dialer for the querier side.
#[derive(Debug)]
pub struct QuicClient {
    endpoint: Endpoint,
}

impl QuicClient {
    pub fn bind(
        addr: SocketAddr,
        mut client_config: ClientConfig,
        transport: TransportConfig,
    ) -> Result<Self> {
        client_config.transport_config(Arc::new(transport.quinn_transport_config()));
        let mut endpoint = Endpoint::client(addr).context("bind QUIC client")?;
        endpoint.set_default_client_config(client_config);
        Ok(Self { endpoint })
    }

    pub async fn connect(&self, addr: SocketAddr, server_name: &str) -> Result<QuicConnection> {
        let connecting = self
            .endpoint
            .connect(addr, server_name)
            .context("initiate QUIC connection")?;
        let connection = connecting.await.context("establish QUIC connection")?;
        Ok(QuicConnection::new(connection))
    }
}

/// Live QUIC connection with stream helpers.
#[derive(Debug, Clone)]
pub struct QuicConnection {
    inner: Connection,
    id: ConnectionId,
}

impl QuicConnection {
    fn new(connection: Connection) -> Self {
        let id = ConnectionId(connection.stable_id() as u64);
        Self {
            inner: connection,
            id,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_address()
    }

    pub async fn open_bi(&self) -> Result<(SendStream, RecvStream)> {
        self.inner.open_bi().await.context("open bidi stream")
    }

    pub async fn accept_bi(&self) -> Result<(SendStream, RecvStream)> {
        self.inner.accept_bi().await.context("accept bidi stream")
    }

    pub fn close(&self, reason: &str) {
        self.inner.close(0u32.into(), reason.as_bytes());
    }
}

/// Read one protocol message, or `None` on a cleanly finished stream.
pub async fn read_message(
    recv: &mut RecvStream,
    max_frame_bytes: usize,
    scratch: &mut BytesMut,
) -> Result<Option<Message>> {
    let frame = match read_frame_into(recv, max_frame_bytes, scratch).await? {
        Some(frame) => frame,
        None => return Ok(None),
    };
    Message::decode(frame).map(Some).context("decode message")
}

/// Encode and write a single protocol message.
pub async fn write_message(send: &mut SendStream, message: &Message) -> Result<()> {
    let frame = message.encode().context("encode message")?;
    write_frame(send, &frame).await
}

// Low-level frame reader with a max payload cap. The scratch buffer is
// reused across frames to avoid per-frame allocations.
async fn read_frame_into(
    recv: &mut RecvStream,
    max_payload_bytes: usize,
    scratch: &mut BytesMut,
) -> Result<Option<Frame>> {
    let mut header_bytes = [0u8; FrameHeader::LEN];
    match recv.read_exact(&mut header_bytes).await {
        Ok(()) => {}
        Err(ReadExactError::FinishedEarly(_)) => return Ok(None),
        Err(ReadExactError::ReadError(err)) => return Err(err.into()),
    }

    let header = FrameHeader::decode(Bytes::copy_from_slice(&header_bytes))
        .context("decode frame header")?;
    let length = usize::try_from(header.length).context("frame length")?;
    // The cap is enforced before the payload is allocated.
    if length > max_payload_bytes {
        return Err(anyhow!(
            "frame length {length} exceeds max_frame_bytes {max_payload_bytes}"
        ));
    }
    scratch.clear();
    scratch.resize(length, 0u8);
    recv.read_exact(&mut scratch[..])
        .await
        .context("read frame payload")?;
    Ok(Some(Frame {
        header,
        payload: scratch.split().freeze(),
    }))
}

async fn write_frame(send: &mut SendStream, frame: &Frame) -> Result<()> {
    let mut header_bytes = [0u8; FrameHeader::LEN];
    frame.header.encode_into(&mut header_bytes);
    send.write_all(&header_bytes)
        .await
        .context("write frame header")?;
    send.write_all(&frame.payload)
        .await
        .context("write frame payload")?;
    Ok(())
}
