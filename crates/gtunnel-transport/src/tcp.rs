//! TCP data plane
//!
//! Every TCP stream opened towards a relay starts with one [`StreamHeader`]
//! frame. The agent side dials ([`DialStreamHandler`]); the relay side reads
//! the header in its accept loop and hands data streams to a
//! [`DataStreamRendezvous`], from which [`AcceptStreamHandler`] claims them.

use crate::{
    BoxedByteStream, ConnectionStreamHandler, Rendezvous, StreamKey, TransportError,
    TransportResult,
};
use async_trait::async_trait;
use gtunnel_proto::{
    CodecError, ConnectionId, HeaderCodec, StreamHeader, StreamRole, TunnelControlMessage,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Headers are tiny; anything larger is garbage
const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Default time allowed for dialing the relay
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time a relay waits for the agent's data stream
pub const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(30);

/// Write the header that opens a relay-bound stream
pub async fn write_header<W>(writer: &mut W, header: &StreamHeader) -> TransportResult<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = HeaderCodec::encode(header)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly one header frame, leaving any following bytes unread
pub async fn read_header<R>(reader: &mut R) -> TransportResult<StreamHeader>
where
    R: AsyncRead + Unpin,
{
    let length = reader.read_u32().await? as usize;
    if length > MAX_HEADER_SIZE {
        return Err(CodecError::MessageTooLarge(length).into());
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    Ok(HeaderCodec::decode_payload(&payload)?)
}

/// Agent-side handler: opens each byte stream by dialing the relay
pub struct DialStreamHandler {
    relay_addr: String,
    tunnel_id: String,
    connect_timeout: Duration,
}

impl DialStreamHandler {
    pub fn new(relay_addr: impl Into<String>, tunnel_id: impl Into<String>) -> Self {
        Self {
            relay_addr: relay_addr.into(),
            tunnel_id: tunnel_id.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn open(
        &self,
        connection_id: ConnectionId,
        role: StreamRole,
    ) -> TransportResult<BoxedByteStream> {
        let mut stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect(&self.relay_addr),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;
        stream.set_nodelay(true)?;

        let header = StreamHeader::Data {
            tunnel_id: self.tunnel_id.clone(),
            connection_id,
            role,
        };
        write_header(&mut stream, &header).await?;

        debug!(
            tunnel_id = %self.tunnel_id,
            connection_id,
            role = ?role,
            relay = %self.relay_addr,
            "Opened data stream to relay"
        );
        Ok(Box::new(stream))
    }
}

#[async_trait]
impl ConnectionStreamHandler for DialStreamHandler {
    async fn get_byte_stream(
        &self,
        message: &TunnelControlMessage,
    ) -> TransportResult<BoxedByteStream> {
        self.open(message.connection_id, StreamRole::Responder).await
    }

    async fn acknowledge(
        &self,
        message: &TunnelControlMessage,
    ) -> TransportResult<BoxedByteStream> {
        self.open(message.connection_id, StreamRole::Initiator).await
    }

    fn close_stream(&self, connection_id: ConnectionId) {
        // Dialed streams are owned by their Connection; nothing is parked here.
        trace!(tunnel_id = %self.tunnel_id, connection_id, "Data stream released");
    }
}

/// Streams delivered by the relay's accept loop, keyed by tunnel and connection
pub type DataStreamRendezvous = Rendezvous<BoxedByteStream>;

/// Relay-side handler: waits for the agent to dial in the matching data stream
pub struct AcceptStreamHandler {
    tunnel_id: String,
    rendezvous: Arc<DataStreamRendezvous>,
    claim_timeout: Duration,
}

impl AcceptStreamHandler {
    pub fn new(tunnel_id: impl Into<String>, rendezvous: Arc<DataStreamRendezvous>) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            rendezvous,
            claim_timeout: DEFAULT_CLAIM_TIMEOUT,
        }
    }

    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    fn key(&self, connection_id: ConnectionId) -> StreamKey {
        (self.tunnel_id.clone(), connection_id)
    }

    async fn claim(&self, connection_id: ConnectionId) -> TransportResult<BoxedByteStream> {
        debug!(
            tunnel_id = %self.tunnel_id,
            connection_id,
            "Waiting for data stream from agent"
        );
        self.rendezvous
            .claim(self.key(connection_id), self.claim_timeout)
            .await
    }
}

#[async_trait]
impl ConnectionStreamHandler for AcceptStreamHandler {
    async fn get_byte_stream(
        &self,
        message: &TunnelControlMessage,
    ) -> TransportResult<BoxedByteStream> {
        self.claim(message.connection_id).await
    }

    async fn acknowledge(
        &self,
        message: &TunnelControlMessage,
    ) -> TransportResult<BoxedByteStream> {
        self.claim(message.connection_id).await
    }

    fn close_stream(&self, connection_id: ConnectionId) {
        if self.rendezvous.cancel(&self.key(connection_id)) {
            debug!(
                tunnel_id = %self.tunnel_id,
                connection_id,
                "Dropped unclaimed data stream"
            );
        }
    }
}
