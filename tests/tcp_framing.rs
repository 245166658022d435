//! TCP carrier framing against a raw loopback server

use std::time::Duration;

use cmlink_integration_tests::{FramedPeer, MessagePeer, WAIT, tcp_server};
use cmlink_transport::frame::{FRAME_MAGIC, encode_frame};
use cmlink_transport::{Connection, ConnectionEvent, TcpConnection};

fn connected() -> (TcpConnection, crossbeam_channel::Receiver<ConnectionEvent>, FramedPeer) {
    let (listener, endpoint) = tcp_server();
    let conn = TcpConnection::new();
    let events = conn.events();
    conn.connect(&endpoint, WAIT);
    let peer = FramedPeer::accept(&listener);
    assert_eq!(events.recv_timeout(WAIT).unwrap(), ConnectionEvent::Connected);
    (conn, events, peer)
}

#[test]
fn test_bad_magic_disconnects_without_messages() {
    let (_conn, events, mut peer) = connected();

    let mut frame = Vec::new();
    frame.extend_from_slice(&4u32.to_le_bytes());
    frame.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
    frame.extend_from_slice(b"oops");
    peer.send_raw(&frame);

    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        ConnectionEvent::Disconnected {
            user_initiated: false
        }
    );
    assert!(events.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn test_bad_magic_after_valid_frame() {
    let (_conn, events, mut peer) = connected();

    peer.send(b"first");
    let mut bogus = encode_frame(b"second").unwrap();
    bogus[4..8].copy_from_slice(&(FRAME_MAGIC ^ 1).to_le_bytes());
    peer.send_raw(&bogus);

    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        ConnectionEvent::NetMsgReceived(b"first".to_vec())
    );
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        ConnectionEvent::Disconnected {
            user_initiated: false
        }
    );
}

#[test]
fn test_frames_split_and_coalesced() {
    let (_conn, events, mut peer) = connected();

    // One frame dribbled a byte at a time
    let frame = encode_frame(b"dribble").unwrap();
    for byte in &frame {
        peer.send_raw(std::slice::from_ref(byte));
    }
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        ConnectionEvent::NetMsgReceived(b"dribble".to_vec())
    );

    // Several frames in one write, including an empty one
    let mut batch = Vec::new();
    for payload in [&b"a"[..], b"", b"ccc"] {
        batch.extend_from_slice(&encode_frame(payload).unwrap());
    }
    peer.send_raw(&batch);
    for expected in [&b"a"[..], b"", b"ccc"] {
        assert_eq!(
            events.recv_timeout(WAIT).unwrap(),
            ConnectionEvent::NetMsgReceived(expected.to_vec())
        );
    }
}

#[test]
fn test_outbound_frames() {
    let (conn, _events, mut peer) = connected();

    let large = vec![0x5A; 100_000];
    conn.send(b"hello".to_vec());
    conn.send(large.clone());
    conn.send(Vec::new());

    assert_eq!(peer.recv(), b"hello");
    assert_eq!(peer.recv(), large);
    assert!(peer.recv().is_empty());
}

#[test]
fn test_user_disconnect_reported_once() {
    let (conn, events, _peer) = connected();

    conn.disconnect(true);
    conn.disconnect(true);
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        ConnectionEvent::Disconnected {
            user_initiated: true
        }
    );
    assert!(events.recv_timeout(Duration::from_millis(200)).is_err());
    assert!(conn.current_endpoint().is_none());
}
