//! Integration tests for the TCP data plane
//!
//! A minimal relay accept loop reads the stream header and routes data streams
//! into the rendezvous; the agent side dials with `DialStreamHandler`.

use gtunnel_proto::{StreamHeader, TunnelControlMessage};
use gtunnel_transport::{
    read_header, write_header, AcceptStreamHandler, ConnectionStreamHandler,
    DataStreamRendezvous, DialStreamHandler, FramedControlStream, TunnelControlStream,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Spawn a relay-like acceptor; control streams are reported on the channel
async fn spawn_relay(
    rendezvous: Arc<DataStreamRendezvous>,
) -> (String, mpsc::UnboundedReceiver<(String, TcpStream)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (control_tx, control_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            match read_header(&mut socket).await.unwrap() {
                StreamHeader::Control { tunnel_id } => {
                    let _ = control_tx.send((tunnel_id, socket));
                }
                StreamHeader::Data {
                    tunnel_id,
                    connection_id,
                    ..
                } => rendezvous.offer((tunnel_id, connection_id), Box::new(socket)),
            }
        }
    });

    (addr, control_rx)
}

#[tokio::test]
async fn test_dial_and_accept_handlers_meet() {
    let rendezvous = Arc::new(DataStreamRendezvous::new());
    let (relay_addr, _control) = spawn_relay(rendezvous.clone()).await;

    let relay_side = AcceptStreamHandler::new("T1", rendezvous.clone());
    let agent_side = DialStreamHandler::new(relay_addr, "T1");
    let ack = TunnelControlMessage::ack("T1", 0, "agent-1");

    // Relay claims first (responder), agent dials afterwards (initiator)
    let claim = tokio::spawn(async move { relay_side.get_byte_stream(&ack).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut agent_stream = agent_side
        .acknowledge(&TunnelControlMessage::ack("T1", 0, "agent-1"))
        .await
        .unwrap();
    let mut relay_stream = timeout(Duration::from_secs(2), claim)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    agent_stream.write_all(b"hello relay").await.unwrap();
    let mut buf = [0u8; 11];
    relay_stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello relay");

    relay_stream.write_all(b"hi").await.unwrap();
    let mut buf = [0u8; 2];
    agent_stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hi");
}

#[tokio::test]
async fn test_stream_dialed_before_claim_is_parked() {
    let rendezvous = Arc::new(DataStreamRendezvous::new());
    let (relay_addr, _control) = spawn_relay(rendezvous.clone()).await;

    let agent_side = DialStreamHandler::new(relay_addr, "T2");
    let mut agent_stream = agent_side
        .get_byte_stream(&TunnelControlMessage::connect("T2", 4, ""))
        .await
        .unwrap();
    agent_stream.write_all(b"x").await.unwrap();

    // Give the relay loop time to park it
    for _ in 0..50 {
        if rendezvous.pending() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(rendezvous.pending(), 1);

    let relay_side = AcceptStreamHandler::new("T2", rendezvous.clone());
    let mut relay_stream = relay_side
        .acknowledge(&TunnelControlMessage::ack("T2", 4, ""))
        .await
        .unwrap();
    let mut buf = [0u8; 1];
    relay_stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"x");
}

#[tokio::test]
async fn test_control_header_then_framed_messages() {
    let rendezvous = Arc::new(DataStreamRendezvous::new());
    let (relay_addr, mut control) = spawn_relay(rendezvous).await;

    let mut socket = TcpStream::connect(&relay_addr).await.unwrap();
    write_header(
        &mut socket,
        &StreamHeader::Control {
            tunnel_id: "T3".to_string(),
        },
    )
    .await
    .unwrap();
    let agent = FramedControlStream::new(socket);
    agent
        .send(&TunnelControlMessage::connect("T3", 0, "agent-1"))
        .await
        .unwrap();

    let (tunnel_id, relay_socket) = timeout(Duration::from_secs(2), control.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tunnel_id, "T3");

    let relay = FramedControlStream::new(relay_socket);
    let msg = timeout(Duration::from_secs(2), relay.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(msg.tunnel_id, "T3");
    assert_eq!(msg.endpoint_id, "agent-1");
}
