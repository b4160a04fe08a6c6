use super::{take_line, Auth, SaslClient, SaslServer};
use crate::utils::Id128;

const GUID: &str = "00112233445566778899aabbccddeeff";

#[test]
fn test_external_from_u32() {
    assert_eq!(
        Auth::external_from_u32(1000),
        Auth::External(b"31303030".to_vec())
    );
    assert_eq!(
        Auth::external_from_u32(u32::MAX),
        Auth::External(b"34323934393637323935".to_vec())
    );
    assert_eq!(Auth::external_from_u32(0), Auth::External(b"30".to_vec()));
}

#[test]
fn test_client_exchange() {
    let mut client = SaslClient::new(&Auth::external_from_u32(1000), true);

    assert_eq!(client.pending(), b"\0AUTH EXTERNAL 31303030\r\n");
    let n = client.pending().len();
    client.consume(n);

    client.handle_line(format!("OK {GUID}").as_bytes()).unwrap();
    assert_eq!(client.pending(), b"NEGOTIATE_UNIX_FD\r\n");
    let n = client.pending().len();
    client.consume(n);

    client.handle_line(b"AGREE_UNIX_FD").unwrap();
    assert_eq!(client.pending(), b"BEGIN\r\n");
    assert!(!client.is_done());
    let n = client.pending().len();
    client.consume(n);

    assert!(client.is_done());
    assert!(client.can_fds());
    assert_eq!(client.guid(), Id128::from_hex(GUID.as_bytes()));
}

#[test]
fn test_client_without_fd_negotiation() {
    let mut client = SaslClient::new(&Auth::Anonymous, false);

    assert_eq!(client.pending(), b"\0AUTH ANONYMOUS\r\n");
    let n = client.pending().len();
    client.consume(n);

    client.handle_line(format!("OK {GUID}").as_bytes()).unwrap();
    assert_eq!(client.pending(), b"BEGIN\r\n");
    let n = client.pending().len();
    client.consume(n);

    assert!(client.is_done());
    assert!(!client.can_fds());
}

#[test]
fn test_client_rejected() {
    let mut client = SaslClient::new(&Auth::external_from_u32(0), true);
    let n = client.pending().len();
    client.consume(n);

    assert!(client.handle_line(b"REJECTED EXTERNAL").is_err());
}

#[test]
fn test_server_exchange() {
    let guid = Id128::from_hex(GUID.as_bytes()).unwrap();
    let mut server = SaslServer::new(guid, false, true);

    let mut buf = b"\0".to_vec();
    server.feed_nul(&mut buf).unwrap();
    assert!(buf.is_empty());

    server.handle_line(b"AUTH EXTERNAL 31303030").unwrap();
    assert_eq!(server.pending(), format!("OK {GUID}\r\n").as_bytes());
    let n = server.pending().len();
    server.consume(n);

    server.handle_line(b"NEGOTIATE_UNIX_FD").unwrap();
    assert_eq!(server.pending(), b"AGREE_UNIX_FD\r\n");
    let n = server.pending().len();
    server.consume(n);

    server.handle_line(b"BEGIN").unwrap();
    assert!(server.is_done());
    assert!(server.can_fds());
}

#[test]
fn test_server_rejects_anonymous() {
    let guid = Id128::from_hex(GUID.as_bytes()).unwrap();
    let mut server = SaslServer::new(guid, false, false);

    server.handle_line(b"AUTH ANONYMOUS").unwrap();
    assert_eq!(server.pending(), b"REJECTED EXTERNAL\r\n");
    assert!(!server.is_done());
}

#[test]
fn test_take_line() {
    let mut buf = b"OK abc\r\nBEGIN\r\n".to_vec();

    assert_eq!(take_line(&mut buf).unwrap(), b"OK abc");
    assert_eq!(take_line(&mut buf).unwrap(), b"BEGIN");
    assert!(take_line(&mut buf).is_none());

    let mut partial = b"NEGOT".to_vec();
    assert!(take_line(&mut partial).is_none());
    assert_eq!(partial, b"NEGOT");
}
