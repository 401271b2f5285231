use std::collections::VecDeque;
use std::net::SocketAddr;
use std::str::FromStr;

use stun::agent::TransactionId;
use stun::message::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use turn::proto::data::Data;
use turn::proto::peeraddr::PeerAddress;
use waitgroup::WaitGroup;

use super::framing::*;
use super::proxy::*;
use super::tcp_established::{push_bounded, TcpEstablishedSocket};
use super::turn_sock::TurnSocket;
use super::*;
use crate::error::Result;

fn test_socket_id() -> SocketId {
    crate::arena::Id::new(0, 0)
}

#[test]
fn test_frame_len_rfc4571() {
    // Too short for the prefix.
    assert_eq!(frame_len(TcpFraming::Rfc4571, &[0]), None);

    // Prefix present, payload incomplete.
    assert_eq!(frame_len(TcpFraming::Rfc4571, &[0, 4, 1, 2]), None);

    // One complete frame with trailing bytes of the next.
    let buf = [0, 2, 0xaa, 0xbb, 0, 1];
    assert_eq!(frame_len(TcpFraming::Rfc4571, &buf), Some(4));
    assert_eq!(strip_rfc4571(&buf[..4]), &[0xaa, 0xbb]);
}

#[test]
fn test_frame_rfc4571_round_trip() {
    let framed = frame_rfc4571(b"hello");
    assert_eq!(framed.len(), 7);
    assert_eq!(frame_len(TcpFraming::Rfc4571, &framed), Some(7));
    assert_eq!(strip_rfc4571(&framed), b"hello");
}

#[test]
fn test_frame_len_turn_stun_message() {
    let mut msg = Message::new();
    msg.build(&[Box::new(TransactionId::new()), Box::new(BINDING_REQUEST)])
        .unwrap();

    assert_eq!(frame_len(TcpFraming::Turn, &msg.raw), Some(msg.raw.len()));
    assert_eq!(frame_len(TcpFraming::Turn, &msg.raw[..10]), None);
}

#[test]
fn test_frame_len_turn_channel_data_padding() {
    // Channel 0x4000, 3-byte payload pads to 4 on stream transports.
    let buf = [0x40, 0x00, 0x00, 0x03, 1, 2, 3, 0];
    assert_eq!(frame_len(TcpFraming::Turn, &buf), Some(8));
    assert_eq!(frame_len(TcpFraming::Turn, &buf[..6]), None);
}

#[test]
fn test_push_bounded_drops_oldest() {
    let mut queue: VecDeque<Vec<u8>> = VecDeque::new();

    assert!(!push_bounded(&mut queue, 2, vec![1]));
    assert!(!push_bounded(&mut queue, 2, vec![2]));
    assert!(push_bounded(&mut queue, 2, vec![3]));

    // The oldest packet was discarded, the newest kept.
    assert_eq!(queue.len(), 2);
    assert_eq!(queue[0], vec![2]);
    assert_eq!(queue[1], vec![3]);
}

#[test]
fn test_turn_encapsulate() -> Result<()> {
    let peer = SocketAddr::from_str("10.0.0.2:6000").unwrap();
    let sock = TurnSocket::new(
        test_socket_id(),
        SocketAddr::from_str("10.1.0.1:3478").unwrap(),
        SocketAddr::from_str("203.0.113.5:40000").unwrap(),
    );

    let wrapped = sock.encapsulate(b"payload", peer)?;

    let mut msg = Message::new();
    msg.write(&wrapped)?;
    assert_eq!(msg.typ.method, METHOD_SEND);
    assert_eq!(msg.typ.class, CLASS_INDICATION);

    let mut data = Data::default();
    data.get_from(&msg)?;
    assert_eq!(data.0, b"payload");

    let mut addr = PeerAddress::default();
    addr.get_from(&msg)?;
    assert_eq!(SocketAddr::new(addr.ip, addr.port), peer);

    Ok(())
}

#[test]
fn test_turn_decapsulate_data_indication() -> Result<()> {
    let peer = SocketAddr::from_str("10.0.0.2:6000").unwrap();

    let mut msg = Message::new();
    msg.build(&[
        Box::new(TransactionId::new()),
        Box::new(MessageType::new(METHOD_DATA, CLASS_INDICATION)),
        Box::new(PeerAddress {
            ip: peer.ip(),
            port: peer.port(),
        }),
        Box::new(Data(b"media".to_vec())),
    ])?;

    let (from, payload) = TurnSocket::decapsulate(&msg).expect("data indication");
    assert_eq!(from, peer);
    assert_eq!(payload, b"media");

    // A Binding request is not application data.
    let mut other = Message::new();
    other.build(&[Box::new(TransactionId::new()), Box::new(BINDING_REQUEST)])?;
    assert!(TurnSocket::decapsulate(&other).is_none());

    Ok(())
}

#[tokio::test]
async fn test_tcp_established_round_trip() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let server_addr = listener.local_addr()?;

    let client = TcpStream::connect(server_addr).await?;
    let (mut server, _) = listener.accept().await?;

    let (net_tx, mut net_rx) = mpsc::unbounded_channel();
    let wg = WaitGroup::new();
    let mut sock = TcpEstablishedSocket::start(
        client,
        test_socket_id(),
        TcpFraming::Rfc4571,
        8,
        net_tx,
        wg.worker(),
    )?;

    // Outbound: the peer must observe RFC 4571 framing.
    sock.enqueue(b"ping")?;
    let mut framed = [0u8; 6];
    server.read_exact(&mut framed).await?;
    assert_eq!(&framed[..2], &[0, 4]);
    assert_eq!(&framed[2..], b"ping");

    // Inbound, delivered across two partial writes.
    server.write_all(&[0, 4, b'p']).await?;
    server.write_all(b"ong").await?;
    match net_rx.recv().await {
        Some(NetEvent::Packet { data, .. }) => assert_eq!(data, b"pong"),
        other => panic!("expected packet, got {other:?}"),
    }

    sock.close();
    Ok(())
}

#[tokio::test]
async fn test_tcp_established_reader_reports_close() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let server_addr = listener.local_addr()?;

    let client = TcpStream::connect(server_addr).await?;
    let (server, _) = listener.accept().await?;

    let (net_tx, mut net_rx) = mpsc::unbounded_channel();
    let wg = WaitGroup::new();
    let _sock = TcpEstablishedSocket::start(
        client,
        test_socket_id(),
        TcpFraming::Rfc4571,
        8,
        net_tx,
        wg.worker(),
    )?;

    drop(server);
    match net_rx.recv().await {
        Some(NetEvent::SocketClosed { .. }) => {}
        other => panic!("expected close, got {other:?}"),
    }

    Ok(())
}

#[tokio::test]
async fn test_socks5_connect_handshake() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let proxy_addr = listener.local_addr()?;
    let target = SocketAddr::from_str("192.0.2.1:3478").unwrap();

    let proxy = tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();

        let mut greeting = [0u8; 3];
        conn.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [0x05, 0x01, 0x00]);
        conn.write_all(&[0x05, 0x00]).await.unwrap();

        let mut request = [0u8; 10];
        conn.read_exact(&mut request).await.unwrap();
        assert_eq!(&request[..4], &[0x05, 0x01, 0x00, 0x01]);
        assert_eq!(&request[4..8], &[192, 0, 2, 1]);
        assert_eq!(u16::from_be_bytes([request[8], request[9]]), 3478);

        conn.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
    });

    let mut stream = TcpStream::connect(proxy_addr).await?;
    socks5_connect(&mut stream, target, None, None).await?;
    proxy.await.unwrap();

    Ok(())
}

#[tokio::test]
async fn test_http_connect_handshake() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let proxy_addr = listener.local_addr()?;
    let target = SocketAddr::from_str("192.0.2.1:3478").unwrap();

    let proxy = tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();
        let mut request = vec![];
        let mut byte = [0u8; 1];
        while !request.ends_with(b"\r\n\r\n") {
            conn.read_exact(&mut byte).await.unwrap();
            request.push(byte[0]);
        }
        let text = String::from_utf8(request).unwrap();
        assert!(text.starts_with("CONNECT 192.0.2.1:3478 HTTP/1.1\r\n"));
        conn.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await
            .unwrap();
    });

    let mut stream = TcpStream::connect(proxy_addr).await?;
    http_connect(&mut stream, target, None, None).await?;
    proxy.await.unwrap();

    Ok(())
}

#[tokio::test]
async fn test_http_connect_rejected() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let proxy_addr = listener.local_addr()?;
    let target = SocketAddr::from_str("192.0.2.1:3478").unwrap();

    tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();
        let mut request = vec![];
        let mut byte = [0u8; 1];
        while !request.ends_with(b"\r\n\r\n") {
            conn.read_exact(&mut byte).await.unwrap();
            request.push(byte[0]);
        }
        conn.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
            .await
            .unwrap();
    });

    let mut stream = TcpStream::connect(proxy_addr).await?;
    let result = http_connect(&mut stream, target, None, None).await;
    assert_eq!(result, Err(crate::Error::ErrProxyNegotiationFailed));

    Ok(())
}

#[tokio::test]
async fn test_pseudo_ssl_handshake() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let server_addr = listener.local_addr()?;

    let server = tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();
        pseudo_ssl_server(&mut conn).await.unwrap();
        conn
    });

    let mut client = TcpStream::connect(server_addr).await?;
    pseudo_ssl_client(&mut client).await?;

    // The stream is plain passthrough once the hellos are swapped.
    let mut server_conn = server.await.unwrap();
    client.write_all(b"after-hello").await?;
    let mut got = [0u8; 11];
    server_conn.read_exact(&mut got).await?;
    assert_eq!(&got, b"after-hello");

    Ok(())
}

#[tokio::test]
async fn test_pseudo_ssl_rejects_garbage() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let server_addr = listener.local_addr()?;

    tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();
        // Send something that is not the expected canned hello.
        let mut junk = [0u8; 79];
        junk[0] = 0x17;
        let _ = conn.write_all(&junk).await;
        let mut sink = vec![0u8; 128];
        let _ = conn.read_exact(&mut sink[..72]).await;
    });

    let mut client = TcpStream::connect(server_addr).await?;
    assert_eq!(
        pseudo_ssl_client(&mut client).await,
        Err(crate::Error::ErrProxyNegotiationFailed)
    );

    Ok(())
}

#[test]
fn test_base64_encode() {
    assert_eq!(base64_encode(b"user:pass"), "dXNlcjpwYXNz");
    assert_eq!(base64_encode(b"a"), "YQ==");
    assert_eq!(base64_encode(b"ab"), "YWI=");
}
