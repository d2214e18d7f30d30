//! Control stream over any byte-oriented I/O object

use crate::{TransportError, TransportResult, TunnelControlStream};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use gtunnel_proto::{ControlCodec, TunnelControlMessage};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::trace;

/// [`TunnelControlStream`] framing control messages with [`ControlCodec`]
///
/// The read and write halves are locked independently so a task parked in
/// `recv` never blocks a concurrent `send`.
pub struct FramedControlStream<S> {
    reader: Mutex<FramedRead<ReadHalf<S>, ControlCodec>>,
    writer: Mutex<FramedWrite<WriteHalf<S>, ControlCodec>>,
}

impl<S> FramedControlStream<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(io: S) -> Self {
        let (read_half, write_half) = tokio::io::split(io);

        Self {
            reader: Mutex::new(FramedRead::new(read_half, ControlCodec::new())),
            writer: Mutex::new(FramedWrite::new(write_half, ControlCodec::new())),
        }
    }
}

#[async_trait]
impl<S> TunnelControlStream for FramedControlStream<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(&self, message: &TunnelControlMessage) -> TransportResult<()> {
        trace!(
            operation = %message.operation,
            connection_id = message.connection_id,
            "Sending control message"
        );

        let mut writer = self.writer.lock().await;
        writer.send(message).await?;
        Ok(())
    }

    async fn recv(&self) -> TransportResult<Option<TunnelControlMessage>> {
        let mut reader = self.reader.lock().await;
        match reader.next().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => Err(TransportError::from(e)),
            None => Ok(None),
        }
    }
}
