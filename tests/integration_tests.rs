//! End-to-end tests: agent retransmission timing against mock servers,
//! TCP transactions, TURN allocation and permission-gated relaying, and the
//! long-term credential handshake.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::{sleep, timeout};
use tracing::info;

use turnpike::relay::{
    handle_allocate, handle_create_permission, handle_send, AuthConfig, AuthOutcome,
    Authenticator, RelayConfig,
};
use turnpike::{
    AgentConfig, AllocationManager, Attribute, MessageBuilder, MessageClass, Method, StunError,
    StunMessage, TcpAgent, TransactionId, TransportProtocol, UdpAgent,
};

fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

fn binding_request() -> StunMessage {
    MessageBuilder::new(MessageClass::Request, Method::Binding, TransactionId::new()).build()
}

fn binding_response(tid: TransactionId, mapped: SocketAddr) -> StunMessage {
    let mut b = MessageBuilder::new(MessageClass::SuccessResponse, Method::Binding, tid);
    b.add_attr(Attribute::XorMappedAddress(mapped)).unwrap();
    b.build()
}

/// UDP server that counts inbound datagrams and answers the `reply_after`th
/// one with a binding success response.
async fn mock_udp_server(reply_after: Option<u32>) -> Result<(SocketAddr, Arc<AtomicU32>)> {
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    let addr = socket.local_addr()?;
    let received = Arc::new(AtomicU32::new(0));
    let counter = received.clone();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                break;
            };
            let seen = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if reply_after == Some(seen) {
                if let Ok(req) = StunMessage::decode(bytes::Bytes::copy_from_slice(&buf[..len])) {
                    let resp = binding_response(req.header.transaction_id, from);
                    let _ = socket.send_to(&resp.raw, from).await;
                }
            }
        }
    });

    Ok((addr, received))
}

#[tokio::test]
async fn udp_request_hits_the_overall_deadline() -> Result<()> {
    setup_test_logging();
    let (server, received) = mock_udp_server(None).await?;

    // Four sends at 0/10/20/30ms, then the 30ms deadline fires.
    let config = AgentConfig::new(server).with_udp_timers(Duration::from_millis(10), 7, 3);
    let agent = UdpAgent::bind(config).await?;

    let start = Instant::now();
    let err = agent.request(binding_request().raw.as_ref()).await.unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(err, StunError::Timeout(_)), "got {err:?}");
    assert!(elapsed >= Duration::from_millis(30), "deadline fired early: {elapsed:?}");

    sleep(Duration::from_millis(20)).await;
    assert_eq!(received.load(Ordering::SeqCst), 4);
    Ok(())
}

#[tokio::test]
async fn udp_request_exhausts_the_attempt_cap() -> Result<()> {
    setup_test_logging();
    let (server, received) = mock_udp_server(None).await?;

    // Rc = 4 bites before the Rm = 16 deadline ever gets close.
    let config = AgentConfig::new(server).with_udp_timers(Duration::from_millis(10), 4, 16);
    let agent = UdpAgent::bind(config).await?;

    let err = agent.request(binding_request().raw.as_ref()).await.unwrap_err();
    assert!(matches!(err, StunError::MaxAttemptsExceeded(4)), "got {err:?}");

    sleep(Duration::from_millis(20)).await;
    assert_eq!(received.load(Ordering::SeqCst), 4);
    Ok(())
}

#[tokio::test]
async fn udp_request_resolves_on_a_late_response() -> Result<()> {
    setup_test_logging();
    let (server, received) = mock_udp_server(Some(2)).await?;

    let config = AgentConfig::new(server).with_udp_timers(Duration::from_millis(20), 7, 16);
    let agent = UdpAgent::bind(config).await?;

    let req = binding_request();
    let raw = agent.request(req.raw.as_ref()).await?;
    let resp = StunMessage::decode(raw)?;

    assert_eq!(resp.header.class, MessageClass::SuccessResponse);
    assert_eq!(resp.header.transaction_id, req.header.transaction_id);
    assert_eq!(resp.xor_mapped_address(), Some(agent.local_addr()?));

    sleep(Duration::from_millis(40)).await;
    assert_eq!(received.load(Ordering::SeqCst), 2, "no retransmission after resolution");
    Ok(())
}

#[tokio::test]
async fn close_settles_an_in_flight_request() -> Result<()> {
    setup_test_logging();
    let (server, _received) = mock_udp_server(None).await?;

    let config = AgentConfig::new(server).with_udp_timers(Duration::from_secs(3), 7, 16);
    let agent = Arc::new(UdpAgent::bind(config).await?);

    let in_flight = {
        let agent = agent.clone();
        let msg = binding_request();
        tokio::spawn(async move { agent.request(msg.raw.as_ref()).await })
    };

    sleep(Duration::from_millis(50)).await;
    agent.close();
    assert!(agent.is_closed());

    let err = timeout(Duration::from_secs(1), in_flight).await??.unwrap_err();
    assert!(matches!(err, StunError::AgentClosed), "got {err:?}");

    // Once closed, new requests fail immediately.
    let err = agent.request(binding_request().raw.as_ref()).await.unwrap_err();
    assert!(matches!(err, StunError::AgentClosed));
    Ok(())
}

#[tokio::test]
async fn tcp_request_round_trips() -> Result<()> {
    setup_test_logging();
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let server = listener.local_addr()?;

    tokio::spawn(async move {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let Ok((mut stream, peer)) = listener.accept().await else {
            return;
        };
        let mut buf = vec![0u8; 1500];
        let Ok(len) = stream.read(&mut buf).await else {
            return;
        };
        if let Ok(req) = StunMessage::decode(bytes::Bytes::copy_from_slice(&buf[..len])) {
            let resp = binding_response(req.header.transaction_id, peer);
            let _ = stream.write_all(&resp.raw).await;
        }
    });

    let config = AgentConfig::new(server).with_tcp_timeout(Duration::from_secs(5));
    let agent = TcpAgent::new(config);

    let req = binding_request();
    let raw = agent.request(req.raw.as_ref()).await?;
    let resp = StunMessage::decode(raw)?;
    assert_eq!(resp.header.class, MessageClass::SuccessResponse);
    assert_eq!(resp.header.transaction_id, req.header.transaction_id);
    Ok(())
}

#[tokio::test]
async fn tcp_request_times_out_against_a_silent_server() -> Result<()> {
    setup_test_logging();
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let server = listener.local_addr()?;
    tokio::spawn(async move {
        // Accept and hold the connection open without answering.
        let _held = listener.accept().await;
        sleep(Duration::from_secs(10)).await;
    });

    let config = AgentConfig::new(server).with_tcp_timeout(Duration::from_millis(100));
    let agent = TcpAgent::new(config);

    let err = agent.request(binding_request().raw.as_ref()).await.unwrap_err();
    assert!(matches!(err, StunError::Timeout(_)), "got {err:?}");
    Ok(())
}

fn relay_manager() -> Arc<AllocationManager> {
    let server = SocketAddr::from(([127, 0, 0, 1], 3478));
    Arc::new(AllocationManager::new(RelayConfig::new("127.0.0.1".parse().unwrap(), server)))
}

fn allocate_request() -> StunMessage {
    let mut b =
        MessageBuilder::new(MessageClass::Request, Method::Allocate, TransactionId::new());
    b.add_attr(Attribute::RequestedTransport(turnpike::message::TRANSPORT_UDP)).unwrap();
    b.build()
}

#[tokio::test]
async fn relay_forwards_only_permitted_peers() -> Result<()> {
    setup_test_logging();
    let manager = relay_manager();

    // Client gets an allocation; its "control" socket receives indications.
    let client = UdpSocket::bind("127.0.0.1:0").await?;
    let client_addr = client.local_addr()?;
    let resp = handle_allocate(&manager, "turnpike-test", &allocate_request(), client_addr).await?;
    assert_eq!(resp.header.class, MessageClass::SuccessResponse);
    let relayed = resp.xor_relayed_address().expect("relayed address");
    info!("allocation for {} relayed at {}", client_addr, relayed);

    let peer = UdpSocket::bind("127.0.0.1:0").await?;
    let peer_addr = peer.local_addr()?;

    // No permission yet: the datagram must be dropped.
    peer.send_to(b"early", relayed).await?;
    let mut buf = vec![0u8; 1500];
    assert!(
        timeout(Duration::from_millis(200), client.recv_from(&mut buf)).await.is_err(),
        "unpermitted datagram was forwarded"
    );

    // Install a permission for the peer's IP, claimed from a different port.
    let claimed = SocketAddr::new(peer_addr.ip(), peer_addr.port().wrapping_add(1));
    let mut b = MessageBuilder::new(
        MessageClass::Request,
        Method::CreatePermission,
        TransactionId::new(),
    );
    b.add_attr(Attribute::XorPeerAddress(claimed)).unwrap();
    let resp = handle_create_permission(&manager, &b.build(), client_addr).await?;
    assert_eq!(resp.header.class, MessageClass::SuccessResponse);

    // The permission is per IP, so the peer's real port now qualifies.
    peer.send_to(b"hello via relay", relayed).await?;
    let (len, _) = timeout(Duration::from_secs(1), client.recv_from(&mut buf)).await??;
    let indication = StunMessage::decode(bytes::Bytes::copy_from_slice(&buf[..len]))?;

    assert!(indication.is_indication(Method::Data));
    assert_eq!(indication.xor_peer_address(), Some(peer_addr));
    assert_eq!(indication.data(), Some(b"hello via relay".as_slice()));
    Ok(())
}

#[tokio::test]
async fn send_indication_reaches_a_permitted_peer() -> Result<()> {
    setup_test_logging();
    let manager = relay_manager();

    let client = UdpSocket::bind("127.0.0.1:0").await?;
    let client_addr = client.local_addr()?;
    handle_allocate(&manager, "turnpike-test", &allocate_request(), client_addr).await?;

    let peer = UdpSocket::bind("127.0.0.1:0").await?;
    let peer_addr = peer.local_addr()?;
    manager
        .install_permission(client_addr, TransportProtocol::Udp, peer_addr)
        .await?;

    let mut b =
        MessageBuilder::new(MessageClass::Indication, Method::Send, TransactionId::new());
    b.add_attr(Attribute::XorPeerAddress(peer_addr)).unwrap();
    b.add_attr(Attribute::Data(b"outbound".to_vec())).unwrap();
    handle_send(&manager, &b.build(), client_addr).await;

    let mut buf = vec![0u8; 1500];
    let (len, from) = timeout(Duration::from_secs(1), peer.recv_from(&mut buf)).await??;
    // The payload arrives raw from the relay socket, not STUN-framed.
    assert_eq!(&buf[..len], b"outbound");
    let alloc = manager.get(client_addr, TransportProtocol::Udp).await.unwrap();
    assert_eq!(from, alloc.relayed_addr());
    Ok(())
}

#[tokio::test]
async fn second_allocation_on_the_same_five_tuple_is_refused() -> Result<()> {
    setup_test_logging();
    let manager = relay_manager();
    let client_addr = SocketAddr::from(([127, 0, 0, 1], 41000));

    let first = handle_allocate(&manager, "turnpike-test", &allocate_request(), client_addr).await?;
    assert_eq!(first.header.class, MessageClass::SuccessResponse);
    let relayed = first.xor_relayed_address();

    let second =
        handle_allocate(&manager, "turnpike-test", &allocate_request(), client_addr).await?;
    assert_eq!(second.error_code().map(|(c, _)| c), Some(437));

    // The original allocation survives the refused retry.
    let alloc = manager.get(client_addr, TransportProtocol::Udp).await.unwrap();
    assert_eq!(Some(alloc.relayed_addr()), relayed);
    assert_eq!(manager.len().await, 1);
    Ok(())
}

#[tokio::test]
async fn credential_handshake_then_allocate() -> Result<()> {
    setup_test_logging();
    let auth = Authenticator::new(AuthConfig {
        username: "alice".into(),
        password: "wonderland".into(),
        realm: "example.org".into(),
        nonce: "nonce-1".into(),
        software: "turnpike-test".into(),
    });
    let manager = relay_manager();
    let client_addr = SocketAddr::from(([127, 0, 0, 1], 42000));

    // First attempt carries no credentials and earns a challenge.
    let bare = allocate_request();
    let AuthOutcome::Reject(challenge) = auth.authenticate(&bare)? else {
        panic!("unsigned request must be challenged");
    };
    assert_eq!(challenge.error_code().map(|(c, _)| c), Some(401));
    let realm = challenge.realm().expect("challenge realm").to_string();
    let nonce = challenge.nonce().expect("challenge nonce").to_vec();

    // Retry signed with the realm and nonce from the challenge.
    let mut b =
        MessageBuilder::new(MessageClass::Request, Method::Allocate, TransactionId::new());
    b.add_attr(Attribute::RequestedTransport(turnpike::message::TRANSPORT_UDP))?;
    b.add_attr(Attribute::Username("alice".into()))?;
    b.add_attr(Attribute::Realm(realm))?;
    b.add_attr(Attribute::Nonce(nonce))?;
    b.add_message_integrity(auth.key())?;
    let signed = b.build();

    assert!(matches!(auth.authenticate(&signed)?, AuthOutcome::Authenticated));
    let resp = handle_allocate(&manager, &auth.config().software, &signed, client_addr).await?;
    assert_eq!(resp.header.class, MessageClass::SuccessResponse);
    assert!(resp.xor_relayed_address().is_some());
    Ok(())
}
