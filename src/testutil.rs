//! Broker-side helpers shared by connection-level tests. The test owns
//! the far end of a socketpair and speaks the wire protocol through the
//! same codec the library uses.

use std::io::{Read, Write};
use std::num::NonZeroU32;
use std::os::unix::net::UnixStream;

use crate::message::Message;
use crate::wire;

pub(crate) const TEST_GUID: &str = "00112233445566778899aabbccddeeff";

pub(crate) fn read_line(peer: &mut UnixStream) -> Vec<u8> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        peer.read_exact(&mut byte).unwrap();

        if byte[0] == b'\n' {
            break;
        }

        line.push(byte[0]);
    }

    if line.last() == Some(&b'\r') {
        line.pop();
    }

    line
}

pub(crate) fn read_frame(peer: &mut UnixStream) -> Message {
    let mut prefix = [0u8; 16];
    peer.read_exact(&mut prefix).unwrap();

    let total = wire::frame_size(&prefix).unwrap();

    let mut frame = prefix.to_vec();
    frame.resize(total, 0);
    peer.read_exact(&mut frame[16..]).unwrap();

    wire::decode(&frame, Vec::new()).unwrap()
}

pub(crate) fn send_frame(peer: &mut UnixStream, mut m: Message, serial: u32) {
    m.seal(NonZeroU32::new(serial).unwrap(), 1).unwrap();
    peer.write_all(m.wire.as_ref().unwrap()).unwrap();
}

/// Play the whole broker side blocking: SASL handshake, then answer the
/// `Hello` call with the unique name `:1.42`. For use from a thread while
/// the connection is driven concurrently.
pub(crate) fn broker_establish(peer: &mut UnixStream) {
    let line = read_line(peer);
    assert!(line.starts_with(b"\0AUTH EXTERNAL"), "{line:?}");

    peer.write_all(format!("OK {TEST_GUID}\r\n").as_bytes())
        .unwrap();
    assert_eq!(read_line(peer), b"NEGOTIATE_UNIX_FD");

    peer.write_all(b"AGREE_UNIX_FD\r\n").unwrap();
    assert_eq!(read_line(peer), b"BEGIN");

    let hello = read_frame(peer);
    assert_eq!(hello.member(), Some("Hello"));

    let reply = hello
        .method_return()
        .unwrap()
        .with_body("s", wire::string_body(":1.42"));

    send_frame(peer, reply, 1);
}
