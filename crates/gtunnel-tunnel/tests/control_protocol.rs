//! Control state machine tests
//!
//! The Tunnel under test talks to a scripted peer: the test holds the other
//! end of an in-process control stream and the shared memory stream hub.

use async_trait::async_trait;
use gtunnel_proto::{error_status, ConnectionId, Operation, TunnelControlMessage};
use gtunnel_transport::{
    control_pair, BoxedByteStream, ConnectionStreamHandler, MemoryControlStream,
    MemoryStreamHub, TransportError, TransportResult, TunnelControlStream,
};
use gtunnel_tunnel::{
    ConnectionOrigin, ConnectionState, Direction, ShutdownReport, Tunnel, TunnelConfig,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const STEP: Duration = Duration::from_secs(2);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Echo server on an ephemeral port
async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// An address nobody listens on
async fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Stream handler whose byte streams never materialize
#[derive(Default)]
struct BrokenStreams {
    /// Never answer instead of failing
    stall: bool,
    released: Mutex<Vec<ConnectionId>>,
}

impl BrokenStreams {
    fn stalling() -> Self {
        Self {
            stall: true,
            ..Self::default()
        }
    }

    fn released(&self) -> Vec<ConnectionId> {
        self.released.lock().unwrap().clone()
    }

    async fn open(&self) -> TransportResult<BoxedByteStream> {
        if self.stall {
            std::future::pending::<()>().await;
        }
        Err(TransportError::ConnectionError("no data plane".to_string()))
    }
}

#[async_trait]
impl ConnectionStreamHandler for BrokenStreams {
    async fn get_byte_stream(
        &self,
        _message: &TunnelControlMessage,
    ) -> TransportResult<BoxedByteStream> {
        self.open().await
    }

    async fn acknowledge(
        &self,
        _message: &TunnelControlMessage,
    ) -> TransportResult<BoxedByteStream> {
        self.open().await
    }

    fn close_stream(&self, connection_id: ConnectionId) {
        self.released.lock().unwrap().push(connection_id);
    }
}

struct Harness {
    tunnel: Arc<Tunnel>,
    peer: MemoryControlStream,
    hub: MemoryStreamHub,
}

impl Harness {
    fn new(destination: SocketAddr) -> Self {
        let hub = MemoryStreamHub::new();
        let handler = Arc::new(hub.handler("T1"));
        Self::build(destination, Duration::from_secs(1), handler, hub)
    }

    fn with_handler(destination: SocketAddr, handler: Arc<dyn ConnectionStreamHandler>) -> Self {
        Self::build(
            destination,
            Duration::from_secs(1),
            handler,
            MemoryStreamHub::new(),
        )
    }

    fn build(
        destination: SocketAddr,
        dial_timeout: Duration,
        handler: Arc<dyn ConnectionStreamHandler>,
        hub: MemoryStreamHub,
    ) -> Self {
        init_tracing();
        let config = TunnelConfig::new(
            "T1",
            Direction::Forward,
            "0.0.0.0:0".parse().unwrap(),
            destination,
        )
        .with_dial_timeout(dial_timeout);
        let tunnel = Tunnel::new(config, handler);

        let (local, peer) = control_pair();
        tunnel.set_control_stream(Arc::new(local)).unwrap();
        tunnel.start().unwrap();

        Self { tunnel, peer, hub }
    }

    async fn listen(&self) -> SocketAddr {
        let bound = self.tunnel.add_listener(0, "agent-1").await.unwrap();
        SocketAddr::from(([127, 0, 0, 1], bound.port()))
    }

    async fn recv(&self) -> TunnelControlMessage {
        timeout(STEP, self.peer.recv())
            .await
            .expect("timed out waiting for control message")
            .unwrap()
            .expect("control stream closed")
    }

    async fn send(&self, message: TunnelControlMessage) {
        self.peer.send(&message).await.unwrap();
    }

    async fn wait_for_state(&self, id: i32, state: Option<ConnectionState>) {
        timeout(STEP, async {
            loop {
                let current = self.tunnel.get_connection(id).await.map(|info| info.state);
                if current == state {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("connection {} never reached {:?}", id, state));
    }

    async fn shutdown(self) {
        self.tunnel.stop().await;
        timeout(STEP, self.tunnel.wait()).await.unwrap();
    }
}

async fn assert_eof(socket: &mut TcpStream) {
    let mut buf = [0u8; 16];
    let n = timeout(STEP, socket.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_accept_emits_connect_for_registered_connection() {
    let h = Harness::new(refused_addr().await);
    let addr = h.listen().await;

    let _client = TcpStream::connect(addr).await.unwrap();
    let connect = h.recv().await;

    assert_eq!(connect.operation, Operation::Connect);
    assert_eq!(connect.tunnel_id, "T1");
    assert_eq!(connect.connection_id, 0);
    assert_eq!(connect.endpoint_id, "agent-1");

    let info = h.tunnel.get_connection(0).await.unwrap();
    assert_eq!(info.state, ConnectionState::Pending);
    assert_eq!(info.endpoint_id, "agent-1");

    h.shutdown().await;
}

#[tokio::test]
async fn test_connection_ids_strictly_increase() {
    let h = Harness::new(refused_addr().await);
    let addr = h.listen().await;
    let mut clients = Vec::new();

    for expected in 0..3 {
        clients.push(TcpStream::connect(addr).await.unwrap());
        assert_eq!(h.recv().await.connection_id, expected);
    }

    let ids: Vec<_> = h.tunnel.connections().await.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![0, 1, 2]);

    h.shutdown().await;
}

#[tokio::test]
async fn test_dial_failure_sends_nack() {
    let h = Harness::new(refused_addr().await);

    h.send(TunnelControlMessage::connect("T1", 5, "agent-1")).await;
    let reply = h.recv().await;

    assert_eq!(reply.operation, Operation::Ack);
    assert_eq!(reply.connection_id, 5);
    assert_eq!(reply.error_status, error_status::DIAL_FAILED);
    assert_eq!(h.tunnel.connection_count().await, 0);

    h.shutdown().await;
}

#[tokio::test]
async fn test_connect_dials_destination_and_serves_stream() {
    let h = Harness::new(echo_server().await);

    h.send(TunnelControlMessage::connect("T1", 0, "agent-1")).await;
    let ack = h.recv().await;
    assert_eq!(ack.operation, Operation::Ack);
    assert_eq!(ack.connection_id, 0);
    assert!(ack.is_success());

    let mut stream = h.hub.pair("T1", 0);
    h.wait_for_state(0, Some(ConnectionState::Started)).await;

    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(STEP, stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"ping");

    h.shutdown().await;
}

#[tokio::test]
async fn test_ack_starts_initiator_connection() {
    let h = Harness::new(refused_addr().await);
    let addr = h.listen().await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let connect = h.recv().await;
    h.send(connect.reply(Operation::Ack)).await;

    let mut stream = h.hub.pair("T1", connect.connection_id);
    h.wait_for_state(0, Some(ConnectionState::Started)).await;

    client.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    timeout(STEP, stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"hello");

    stream.write_all(b"world").await.unwrap();
    timeout(STEP, client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"world");

    h.shutdown().await;
}

#[tokio::test]
async fn test_nack_releases_pending_connection() {
    let h = Harness::new(refused_addr().await);
    let addr = h.listen().await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let connect = h.recv().await;
    h.send(
        connect
            .reply(Operation::Ack)
            .with_status(error_status::DIAL_FAILED),
    )
    .await;

    h.wait_for_state(0, None).await;
    assert_eof(&mut client).await;

    h.shutdown().await;
}

#[tokio::test]
async fn test_ack_for_unknown_connection_replies_disconnect() {
    let h = Harness::new(refused_addr().await);

    h.send(TunnelControlMessage::ack("T1", 42, "agent-1")).await;
    let reply = h.recv().await;

    assert_eq!(reply.operation, Operation::Disconnect);
    assert_eq!(reply.connection_id, 42);
    assert_eq!(reply.error_status, error_status::UNKNOWN_CONNECTION);

    h.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_closes_connection() {
    let h = Harness::new(refused_addr().await);
    let addr = h.listen().await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let connect = h.recv().await;
    h.send(connect.reply(Operation::Ack)).await;
    let _stream = h.hub.pair("T1", 0);
    h.wait_for_state(0, Some(ConnectionState::Started)).await;

    h.send(TunnelControlMessage::disconnect("T1", 0, "agent-1"))
        .await;
    h.wait_for_state(0, None).await;
    assert_eof(&mut client).await;

    // Unknown ids are ignored
    h.send(TunnelControlMessage::disconnect("T1", 0, "agent-1"))
        .await;
    h.send(TunnelControlMessage::ack("T1", 77, "")).await;
    assert_eq!(h.recv().await.connection_id, 77);

    h.shutdown().await;
}

#[tokio::test]
async fn test_local_eof_sends_disconnect() {
    let h = Harness::new(refused_addr().await);
    let addr = h.listen().await;

    let client = TcpStream::connect(addr).await.unwrap();
    let connect = h.recv().await;
    h.send(connect.reply(Operation::Ack)).await;
    let stream = h.hub.pair("T1", 0);
    h.wait_for_state(0, Some(ConnectionState::Started)).await;

    drop(client);
    drop(stream);

    let disconnect = h.recv().await;
    assert_eq!(disconnect.operation, Operation::Disconnect);
    assert_eq!(disconnect.connection_id, 0);
    assert_eq!(disconnect.endpoint_id, "agent-1");
    h.wait_for_state(0, None).await;

    h.shutdown().await;
}

#[tokio::test]
async fn test_unknown_operation_and_foreign_tunnel_ignored() {
    let h = Harness::new(refused_addr().await);

    let mut unknown = TunnelControlMessage::connect("T1", 1, "");
    unknown.operation = Operation::Unknown(42);
    h.send(unknown).await;
    h.send(TunnelControlMessage::connect("OTHER", 2, "")).await;

    // The loop is still alive and only answers this one
    h.send(TunnelControlMessage::ack("T1", 3, "")).await;
    let reply = h.recv().await;
    assert_eq!(reply.connection_id, 3);
    assert_eq!(reply.operation, Operation::Disconnect);
    assert_eq!(h.tunnel.connection_count().await, 0);

    h.shutdown().await;
}

#[tokio::test]
async fn test_remove_connection_then_lookup() {
    let h = Harness::new(refused_addr().await);
    let addr = h.listen().await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let id = h.recv().await.connection_id;

    assert!(h.tunnel.remove_connection(id).await);
    assert!(h.tunnel.get_connection(id).await.is_none());
    assert!(!h.tunnel.remove_connection(id).await);
    assert_eof(&mut client).await;

    h.shutdown().await;
}

#[tokio::test]
async fn test_stop_closes_everything_once() {
    let h = Harness::new(refused_addr().await);
    let addr = h.listen().await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    h.recv().await;

    let report = h.tunnel.stop().await;
    assert_eq!(
        report,
        ShutdownReport {
            listeners_closed: 1,
            connections_closed: 1,
        }
    );
    assert_eq!(h.tunnel.stop().await, ShutdownReport::default());

    timeout(STEP, h.tunnel.wait()).await.unwrap();
    timeout(STEP, h.tunnel.ingress_closed()).await.unwrap();
    assert!(h.tunnel.listener_addrs().is_empty());
    assert_eq!(h.tunnel.connection_count().await, 0);
    assert_eof(&mut client).await;
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_dial_timeout_sends_nack() {
    // TEST-NET-1: either unroutable or silently dropped, never accepted
    let blackhole: SocketAddr = "192.0.2.1:9".parse().unwrap();
    let hub = MemoryStreamHub::new();
    let handler = Arc::new(hub.handler("T1"));
    let h = Harness::build(blackhole, Duration::from_millis(200), handler, hub);

    let started = std::time::Instant::now();
    h.send(TunnelControlMessage::connect("T1", 4, "agent-1")).await;
    let reply = h.recv().await;

    assert_eq!(reply.operation, Operation::Ack);
    assert_eq!(reply.connection_id, 4);
    assert_eq!(reply.error_status, error_status::DIAL_FAILED);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(h.tunnel.connection_count().await, 0);

    h.shutdown().await;
}

#[tokio::test]
async fn test_responder_stream_failure_sends_disconnect() {
    let handler = Arc::new(BrokenStreams::default());
    let h = Harness::with_handler(echo_server().await, handler.clone());

    h.send(TunnelControlMessage::connect("T1", 0, "agent-1")).await;
    let ack = h.recv().await;
    assert_eq!(ack.operation, Operation::Ack);
    assert!(ack.is_success());

    let disconnect = h.recv().await;
    assert_eq!(disconnect.operation, Operation::Disconnect);
    assert_eq!(disconnect.connection_id, 0);
    assert_eq!(disconnect.error_status, error_status::STREAM_FAILED);

    assert_eq!(h.tunnel.connection_count().await, 0);
    assert_eq!(handler.released(), vec![0]);

    h.shutdown().await;
}

#[tokio::test]
async fn test_initiator_stream_failure_sends_disconnect() {
    let handler = Arc::new(BrokenStreams::default());
    let h = Harness::with_handler(refused_addr().await, handler.clone());
    let addr = h.listen().await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let connect = h.recv().await;
    h.send(connect.reply(Operation::Ack)).await;

    let disconnect = h.recv().await;
    assert_eq!(disconnect.operation, Operation::Disconnect);
    assert_eq!(disconnect.connection_id, connect.connection_id);
    assert_eq!(disconnect.error_status, error_status::STREAM_FAILED);

    assert_eq!(h.tunnel.connection_count().await, 0);
    assert_eq!(handler.released(), vec![connect.connection_id]);
    assert_eof(&mut client).await;

    h.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_connect_keeps_pending_setup() {
    let handler = Arc::new(BrokenStreams::stalling());
    let h = Harness::with_handler(echo_server().await, handler);

    h.send(TunnelControlMessage::connect("T1", 0, "agent-1")).await;
    assert!(h.recv().await.is_success());
    h.wait_for_state(0, Some(ConnectionState::Pending)).await;

    h.send(TunnelControlMessage::connect("T1", 0, "agent-1")).await;
    h.send(TunnelControlMessage::ack("T1", 9, "")).await;

    // Only the unknown-id Disconnect comes back; the duplicate gets no reply
    let reply = h.recv().await;
    assert_eq!(reply.operation, Operation::Disconnect);
    assert_eq!(reply.connection_id, 9);

    let info = h.tunnel.get_connection(0).await.unwrap();
    assert_eq!(info.origin, ConnectionOrigin::Dialed);
    assert_eq!(info.state, ConnectionState::Pending);
    assert_eq!(h.tunnel.connection_count().await, 1);

    h.shutdown().await;
}

#[tokio::test]
async fn test_connect_for_locally_accepted_id_is_refused() {
    let h = Harness::new(echo_server().await);
    let addr = h.listen().await;

    let _client = TcpStream::connect(addr).await.unwrap();
    let connect = h.recv().await;

    h.send(TunnelControlMessage::connect(
        "T1",
        connect.connection_id,
        "agent-1",
    ))
    .await;
    let nack = h.recv().await;
    assert_eq!(nack.operation, Operation::Ack);
    assert_eq!(nack.connection_id, connect.connection_id);
    assert_eq!(nack.error_status, error_status::ID_IN_USE);

    let info = h.tunnel.get_connection(connect.connection_id).await.unwrap();
    assert_eq!(info.origin, ConnectionOrigin::Accepted);
    assert_eq!(info.state, ConnectionState::Pending);

    h.shutdown().await;
}
