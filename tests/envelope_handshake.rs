//! Envelope encryption over real carriers

use std::time::Duration;

use cmlink_core::{EncryptionState, EnvelopeEncryptedConnection};
use cmlink_crypto::FilterKind;
use cmlink_integration_tests::{
    FramedPeer, MessagePeer, UdpPeer, WAIT, accept_encryption, envelope_config, fast_udp_config,
    tcp_server, udp_server,
};
use cmlink_transport::{Connection, ConnectionEvent, TcpConnection, UdpConnection};

const QUIET: Duration = Duration::from_millis(200);

fn tcp_session() -> (EnvelopeEncryptedConnection<TcpConnection>, FramedPeer) {
    let (listener, endpoint) = tcp_server();
    let conn = EnvelopeEncryptedConnection::new(TcpConnection::new(), envelope_config()).unwrap();
    conn.connect(&endpoint, WAIT);
    let peer = FramedPeer::accept(&listener);
    (conn, peer)
}

#[test]
fn test_tcp_handshake_with_challenge() {
    let (conn, mut peer) = tcp_session();
    let events = conn.events();

    // The carrier is up but the consumer hears nothing until the channel is encrypted
    assert!(events.recv_timeout(QUIET).is_err());

    let server = accept_encryption(&mut peer, &[0x42; 16]);
    assert_eq!(events.recv_timeout(WAIT).unwrap(), ConnectionEvent::Connected);
    assert_eq!(conn.state(), EncryptionState::Encrypted);
    assert_eq!(conn.filter_kind(), Some(FilterKind::Hmac));

    conn.send(b"logon".to_vec());
    let wire = peer.recv();
    assert_ne!(wire, b"logon");
    assert_eq!(server.decrypt(&wire).unwrap(), b"logon");

    peer.send(&server.encrypt(b"welcome").unwrap());
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        ConnectionEvent::NetMsgReceived(b"welcome".to_vec())
    );
}

#[test]
fn test_tcp_handshake_without_challenge() {
    let (conn, mut peer) = tcp_session();
    let events = conn.events();

    let server = accept_encryption(&mut peer, &[]);
    assert_eq!(events.recv_timeout(WAIT).unwrap(), ConnectionEvent::Connected);
    assert_eq!(conn.filter_kind(), Some(FilterKind::Plain));

    peer.send(&server.encrypt(b"plain filter").unwrap());
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        ConnectionEvent::NetMsgReceived(b"plain filter".to_vec())
    );
}

#[test]
fn test_no_plaintext_before_encryption() {
    let (conn, mut peer) = tcp_session();
    let events = conn.events();

    // Neither a stray payload nor an early send leaks through
    peer.send(b"not a handshake message, long enough for a header");
    conn.send(b"too early".to_vec());
    assert!(events.recv_timeout(QUIET).is_err());

    let server = accept_encryption(&mut peer, &[0x01; 16]);
    assert_eq!(events.recv_timeout(WAIT).unwrap(), ConnectionEvent::Connected);

    conn.send(b"first".to_vec());
    assert_eq!(server.decrypt(&peer.recv()).unwrap(), b"first");
}

#[test]
fn test_decrypt_failure_disconnects_once() {
    let (conn, mut peer) = tcp_session();
    let events = conn.events();

    let server = accept_encryption(&mut peer, &[0x24; 16]);
    assert_eq!(events.recv_timeout(WAIT).unwrap(), ConnectionEvent::Connected);

    peer.send(&[0xAB; 64]);
    peer.send(&server.encrypt(b"after the fault").unwrap());

    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        ConnectionEvent::Disconnected {
            user_initiated: false
        }
    );
    assert!(events.recv_timeout(QUIET).is_err());
    assert_eq!(conn.state(), EncryptionState::Disconnected);
    assert!(conn.filter_kind().is_none());
}

#[test]
fn test_universe_mismatch_disconnects() {
    let (conn, mut peer) = tcp_session();
    let events = conn.events();

    let request = cmlink_core::msg::ChannelEncryptRequest {
        protocol_version: cmlink_core::msg::PROTOCOL_VERSION,
        universe: cmlink_core::Universe::Beta.raw(),
        challenge: vec![0; 16],
    }
    .encode();
    peer.send(&request);

    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        ConnectionEvent::Disconnected {
            user_initiated: false
        }
    );
    assert!(events.recv_timeout(QUIET).is_err());
    assert_eq!(conn.state(), EncryptionState::Disconnected);
}

#[test]
fn test_udp_handshake_and_payloads() {
    let (socket, endpoint) = udp_server();
    let conn =
        EnvelopeEncryptedConnection::new(UdpConnection::with_config(fast_udp_config()), envelope_config())
            .unwrap();
    let events = conn.events();
    conn.connect(&endpoint, WAIT);

    let mut peer = UdpPeer::accept(socket);
    let server = accept_encryption(&mut peer, &[0x77; 16]);
    assert_eq!(events.recv_timeout(WAIT).unwrap(), ConnectionEvent::Connected);

    // Large enough to span several UDP fragments once encrypted
    let big = vec![0x33; 5000];
    conn.send(big.clone());
    assert_eq!(server.decrypt(&peer.recv()).unwrap(), big);

    peer.send(&server.encrypt(&big).unwrap());
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        ConnectionEvent::NetMsgReceived(big)
    );

    conn.disconnect(true);
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        ConnectionEvent::Disconnected {
            user_initiated: true
        }
    );
}
