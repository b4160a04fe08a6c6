use std::cell::{Cell, RefCell};
use std::io::Write;
use std::num::NonZeroU32;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

use crate::error::ErrorKind;
use crate::message::Message;
use crate::protocol::{
    Events, ERROR_NO_REPLY, ERROR_UNKNOWN_METHOD, ERROR_UNKNOWN_OBJECT,
};
use crate::testutil::{read_frame, read_line, send_frame, TEST_GUID as GUID};
use crate::utils::Id128;
use crate::wire;

use super::{BusState, Connection};

/// A connection on one end of a socketpair, with the test driving the
/// other end as the broker.
fn pair() -> (Connection, UnixStream) {
    let (ours, theirs) = UnixStream::pair().unwrap();

    let mut conn = Connection::new();
    conn.set_fd(OwnedFd::from(ours)).unwrap();
    conn.set_bus_client(true).unwrap();
    conn.start().unwrap();

    (conn, theirs)
}

/// Play the broker side of the SASL handshake.
fn handshake(conn: &mut Connection, peer: &mut UnixStream) {
    assert_eq!(conn.state(), BusState::Authenticating);

    conn.process().unwrap();
    let line = read_line(peer);
    assert!(line.starts_with(b"\0AUTH EXTERNAL"), "{line:?}");

    peer.write_all(format!("OK {GUID}\r\n").as_bytes()).unwrap();
    conn.process().unwrap();
    assert_eq!(read_line(peer), b"NEGOTIATE_UNIX_FD");

    peer.write_all(b"AGREE_UNIX_FD\r\n").unwrap();
    conn.process().unwrap();
    assert_eq!(read_line(peer), b"BEGIN");

    assert_eq!(conn.state(), BusState::Hello);
}

/// Handshake plus the Hello round trip, leaving the connection running
/// with unique name `:1.42`.
fn establish(conn: &mut Connection, peer: &mut UnixStream) {
    handshake(conn, peer);

    // Flush the queued Hello call.
    conn.process().unwrap();

    let hello = read_frame(peer);
    assert_eq!(hello.path(), Some("/"));
    assert_eq!(hello.member(), Some("Hello"));
    assert_eq!(hello.destination(), Some("org.freedesktop.DBus"));
    assert_eq!(hello.serial(), conn.hello_serial());

    let reply = hello
        .method_return()
        .unwrap()
        .with_body("s", wire::string_body(":1.42"));

    send_frame(peer, reply, 1);

    conn.process().unwrap();
    assert_eq!(conn.state(), BusState::Running);
    assert_eq!(conn.unique_name(), Some(":1.42"));
}

fn peer_signal(member: &str) -> Message {
    Message::signal("/org/example/Object", member).with_interface("org.example.Interface")
}

#[test]
fn test_hello_round_trip() {
    let (mut conn, mut peer) = pair();
    establish(&mut conn, &mut peer);

    assert_eq!(conn.server_id(), Id128::from_hex(GUID.as_bytes()).unwrap());
    assert_eq!(conn.pending_replies(), 0);
    assert!(conn.can_send_fds());
}

#[test]
fn test_hello_gate_closes_on_stray_message() {
    let (mut conn, mut peer) = pair();
    handshake(&mut conn, &mut peer);
    conn.process().unwrap();
    let _hello = read_frame(&mut peer);

    // Anything that is not the Hello reply is a protocol violation.
    send_frame(&mut peer, peer_signal("Changed"), 99);

    let e = conn.process().unwrap_err();
    assert!(matches!(e.kind(), ErrorKind::Protocol(..)), "{e}");
    assert_eq!(conn.state(), BusState::Closed);

    let e = conn.process().unwrap_err();
    assert!(matches!(e.kind(), ErrorKind::NotConnected), "{e}");
}

#[test]
fn test_serials_are_monotonic() {
    let (mut conn, mut peer) = pair();
    establish(&mut conn, &mut peer);

    let first = conn.send(peer_signal("One")).unwrap();
    let second = conn.send(peer_signal("Two")).unwrap();

    assert!(first.get() > 1, "hello owns the first serial");
    assert!(second.get() > first.get());

    assert_eq!(read_frame(&mut peer).serial(), Some(first));
    assert_eq!(read_frame(&mut peer).serial(), Some(second));
}

#[test]
fn test_builtin_ping() {
    let (mut conn, mut peer) = pair();
    establish(&mut conn, &mut peer);

    let ping = Message::method_call("/", "Ping")
        .with_interface("org.freedesktop.DBus.Peer")
        .with_destination(":1.42");

    send_frame(&mut peer, ping, 7);
    conn.process().unwrap();

    let reply = read_frame(&mut peer);
    assert_eq!(reply.reply_serial(), NonZeroU32::new(7));
    assert!(reply.body().is_empty());
    assert!(reply.error_name().is_none());
}

#[test]
fn test_builtin_get_machine_id() {
    let (mut conn, mut peer) = pair();
    establish(&mut conn, &mut peer);

    let call = Message::method_call("/", "GetMachineId")
        .with_interface("org.freedesktop.DBus.Peer");

    send_frame(&mut peer, call, 8);
    conn.process().unwrap();

    let reply = read_frame(&mut peer);
    assert_eq!(reply.reply_serial(), NonZeroU32::new(8));

    let id = wire::read_string_body(&reply).unwrap();
    assert_eq!(id.len(), 32);
    assert!(id.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
}

#[test]
fn test_builtin_unknown_method() {
    let (mut conn, mut peer) = pair();
    establish(&mut conn, &mut peer);

    let call = Message::method_call("/", "Frobnicate")
        .with_interface("org.freedesktop.DBus.Peer");

    send_frame(&mut peer, call, 9);
    conn.process().unwrap();

    let reply = read_frame(&mut peer);
    assert_eq!(reply.error_name(), Some(ERROR_UNKNOWN_METHOD));
    assert_eq!(reply.reply_serial(), NonZeroU32::new(9));
}

#[test]
fn test_unclaimed_call_gets_unknown_object() {
    let (mut conn, mut peer) = pair();
    establish(&mut conn, &mut peer);

    let call = Message::method_call("/no/such/object", "Anything")
        .with_interface("org.example.Interface");

    send_frame(&mut peer, call, 11);
    conn.process().unwrap();

    let reply = read_frame(&mut peer);
    assert_eq!(reply.error_name(), Some(ERROR_UNKNOWN_OBJECT));
    assert_eq!(reply.reply_serial(), NonZeroU32::new(11));
}

#[test]
fn test_reply_correlation() {
    let (mut conn, mut peer) = pair();
    establish(&mut conn, &mut peer);

    let got = Rc::new(RefCell::new(None));
    let got2 = Rc::clone(&got);

    let call = Message::method_call("/org/example/Object", "Get")
        .with_interface("org.example.Interface")
        .with_destination(":1.9");

    let serial = conn
        .send_with_reply(call, u64::MAX, move |_, reply| {
            *got2.borrow_mut() = Some(wire::read_string_body(reply).unwrap().to_owned());
            Ok(())
        })
        .unwrap();

    assert_eq!(conn.pending_replies(), 1);

    let outbound = read_frame(&mut peer);
    assert_eq!(outbound.serial(), Some(serial));

    let reply = outbound
        .method_return()
        .unwrap()
        .with_body("s", wire::string_body("value"));

    send_frame(&mut peer, reply, 1);
    conn.process().unwrap();

    assert_eq!(got.borrow().as_deref(), Some("value"));
    assert_eq!(conn.pending_replies(), 0);
}

#[test]
fn test_reply_timeout() {
    let (mut conn, mut peer) = pair();
    establish(&mut conn, &mut peer);

    let got = Rc::new(RefCell::new(None));
    let got2 = Rc::clone(&got);

    let call = Message::method_call("/org/example/Object", "Hang")
        .with_interface("org.example.Interface");

    conn.send_with_reply(call, 10_000, move |_, reply| {
        *got2.borrow_mut() = reply.error_name().map(str::to_owned);
        Ok(())
    })
    .unwrap();

    let _outbound = read_frame(&mut peer);
    assert_eq!(conn.get_timeout().unwrap().map(|t| t > 0), Some(true));

    std::thread::sleep(Duration::from_millis(15));

    assert!(conn.process().unwrap());
    assert_eq!(got.borrow().as_deref(), Some(ERROR_NO_REPLY));
    assert_eq!(conn.pending_replies(), 0);
}

#[test]
fn test_cancelled_reply_is_discarded() {
    let (mut conn, mut peer) = pair();
    establish(&mut conn, &mut peer);

    let invoked = Rc::new(Cell::new(false));
    let invoked2 = Rc::clone(&invoked);

    let call = Message::method_call("/org/example/Object", "Get")
        .with_interface("org.example.Interface");

    let serial = conn
        .send_with_reply(call, u64::MAX, move |_, _| {
            invoked2.set(true);
            Ok(())
        })
        .unwrap();

    assert!(conn.cancel_reply(serial).unwrap());
    assert!(!conn.cancel_reply(serial).unwrap());

    let outbound = read_frame(&mut peer);
    send_frame(&mut peer, outbound.method_return().unwrap(), 1);

    assert!(conn.process().unwrap());
    assert!(!invoked.get());
}

#[test]
fn test_filter_consumes_message() {
    let (mut conn, mut peer) = pair();
    establish(&mut conn, &mut peer);

    let count = Rc::new(Cell::new(0u32));
    let count2 = Rc::clone(&count);

    conn.add_filter(move |_, _| {
        count2.set(count2.get() + 1);
        Ok(true)
    })
    .unwrap();

    send_frame(&mut peer, peer_signal("Changed"), 20);
    conn.process().unwrap();

    assert_eq!(count.get(), 1);
}

#[test]
fn test_filter_removing_itself_runs_once() {
    let (mut conn, mut peer) = pair();
    establish(&mut conn, &mut peer);

    let first_runs = Rc::new(Cell::new(0u32));
    let second_runs = Rc::new(Cell::new(0u32));
    let handle = Rc::new(Cell::new(None));

    let first_runs2 = Rc::clone(&first_runs);
    let handle2 = Rc::clone(&handle);

    // Registered second so it runs first, removing itself mid-dispatch.
    let second_runs2 = Rc::clone(&second_runs);
    conn.add_filter(move |_, _| {
        second_runs2.set(second_runs2.get() + 1);
        Ok(false)
    })
    .unwrap();

    let h = conn
        .add_filter(move |conn, _| {
            first_runs2.set(first_runs2.get() + 1);
            let h = handle2.get().unwrap();
            conn.remove_filter(h).unwrap();
            Ok(false)
        })
        .unwrap();

    handle.set(Some(h));

    send_frame(&mut peer, peer_signal("Changed"), 21);
    conn.process().unwrap();

    // The list was modified mid-scan, the scan restarted, and the
    // iteration stamps kept every callback to a single run.
    assert_eq!(first_runs.get(), 1);
    assert_eq!(second_runs.get(), 1);
}

#[test]
fn test_process_is_not_reentrant() {
    let (mut conn, mut peer) = pair();
    establish(&mut conn, &mut peer);

    let saw_busy = Rc::new(Cell::new(false));
    let saw_busy2 = Rc::clone(&saw_busy);

    conn.add_filter(move |conn, _| {
        let e = conn.process().unwrap_err();
        saw_busy2.set(matches!(e.kind(), ErrorKind::Busy));
        Ok(true)
    })
    .unwrap();

    send_frame(&mut peer, peer_signal("Changed"), 22);
    conn.process().unwrap();

    assert!(saw_busy.get());
}

#[test]
fn test_match_predicate_selects_messages() {
    let (mut conn, mut peer) = pair();
    establish(&mut conn, &mut peer);

    let count = Rc::new(Cell::new(0u32));
    let count2 = Rc::clone(&count);

    conn.add_match(
        |m| m.member() == Some("Interesting"),
        move |_, _| {
            count2.set(count2.get() + 1);
            Ok(true)
        },
    )
    .unwrap();

    send_frame(&mut peer, peer_signal("Boring"), 23);
    conn.process().unwrap();
    assert_eq!(count.get(), 0);

    send_frame(&mut peer, peer_signal("Interesting"), 24);
    conn.process().unwrap();
    assert_eq!(count.get(), 1);
}

#[test]
fn test_blocking_call_preserves_arrival_order() {
    let (mut conn, mut peer) = pair();
    establish(&mut conn, &mut peer);

    let broker = std::thread::spawn(move || {
        let call = read_frame(&mut peer);

        // An unrelated signal lands before the reply; the caller must
        // re-enqueue it for regular dispatch without serving it now.
        send_frame(&mut peer, peer_signal("Meanwhile"), 30);

        let reply = call
            .method_return()
            .unwrap()
            .with_body("s", wire::string_body("pong"));

        send_frame(&mut peer, reply, 31);
        peer
    });

    let seen_during_call = Rc::new(Cell::new(0u32));
    let seen = Rc::clone(&seen_during_call);

    conn.add_filter(move |_, _| {
        seen.set(seen.get() + 1);
        Ok(true)
    })
    .unwrap();

    let call = Message::method_call("/org/example/Object", "Ping")
        .with_interface("org.example.Interface");

    let reply = conn.call(call, 0).unwrap();
    assert_eq!(wire::read_string_body(&reply).unwrap(), "pong");

    // The signal was buffered, not dispatched, while blocking.
    assert_eq!(seen_during_call.get(), 0);
    assert_eq!(conn.queued_inbound(), 1);

    let _peer = broker.join().unwrap();

    conn.process().unwrap();
    assert_eq!(seen_during_call.get(), 1);
    assert_eq!(conn.queued_inbound(), 0);
}

#[test]
fn test_blocking_call_surfaces_error_reply() {
    let (mut conn, mut peer) = pair();
    establish(&mut conn, &mut peer);

    let broker = std::thread::spawn(move || {
        let call = read_frame(&mut peer);

        let reply = call
            .error_reply("org.example.Error.Denied", "no")
            .unwrap();

        send_frame(&mut peer, reply, 40);
    });

    let call = Message::method_call("/org/example/Object", "Ask")
        .with_interface("org.example.Interface");

    let e = conn.call(call, 0).unwrap_err();
    assert_eq!(e.error_name(), Some("org.example.Error.Denied"));
    assert!(e.errno() < 0);

    broker.join().unwrap();
}

#[test]
fn test_fork_guard() {
    let (mut conn, mut peer) = pair();
    establish(&mut conn, &mut peer);

    conn.simulate_fork();

    let e = conn.process().unwrap_err();
    assert!(matches!(e.kind(), ErrorKind::Forked));

    let e = conn.send(peer_signal("One")).unwrap_err();
    assert!(matches!(e.kind(), ErrorKind::Forked));

    let e = conn.get_events().unwrap_err();
    assert!(matches!(e.kind(), ErrorKind::Forked));

    // Close must not touch the inherited descriptors either.
    conn.close();
    assert_eq!(conn.state(), BusState::Running);
}

#[test]
fn test_configuration_is_frozen_after_start() {
    let (mut conn, _peer) = pair();

    let e = conn.set_bus_client(false).unwrap_err();
    assert!(matches!(e.kind(), ErrorKind::InvalidState(..)));

    let e = conn.set_address("unix:path=/x").unwrap_err();
    assert!(matches!(e.kind(), ErrorKind::InvalidState(..)));

    let e = conn.negotiate_fds(false).unwrap_err();
    assert!(matches!(e.kind(), ErrorKind::InvalidState(..)));
}

#[test]
fn test_server_and_bus_client_conflict() {
    let (a, _b) = UnixStream::pair().unwrap();

    let mut conn = Connection::new();
    conn.set_fd(OwnedFd::from(a)).unwrap();
    conn.set_server(true, Id128::from_hex(GUID.as_bytes()).unwrap())
        .unwrap();
    conn.set_bus_client(true).unwrap();

    let e = conn.start().unwrap_err();
    assert!(matches!(e.kind(), ErrorKind::InvalidArgument(..)));
    assert_eq!(conn.state(), BusState::Closed);
}

#[test]
fn test_flush_on_empty_queue_is_noop() {
    let (mut conn, mut peer) = pair();
    establish(&mut conn, &mut peer);

    conn.flush().unwrap();
    conn.flush().unwrap();
}

#[test]
fn test_events_and_timeout_inquiries() {
    let (mut conn, mut peer) = pair();
    establish(&mut conn, &mut peer);

    let events = conn.get_events().unwrap();
    assert!(events & Events::POLLIN);
    assert!(!(events & Events::POLLOUT));

    assert_eq!(conn.get_timeout().unwrap(), None);

    let call = Message::method_call("/org/example/Object", "Get")
        .with_interface("org.example.Interface");

    conn.send_with_reply(call, 0, |_, _| Ok(())).unwrap();

    // A pending reply with a deadline surfaces through get_timeout.
    assert!(conn.get_timeout().unwrap().is_some());
}

#[test]
fn test_operations_before_start() {
    let mut conn = Connection::new();

    let e = conn.process().unwrap_err();
    assert!(matches!(e.kind(), ErrorKind::NotConnected));

    let e = conn.send(peer_signal("One")).unwrap_err();
    assert!(matches!(e.kind(), ErrorKind::NotConnected));

    let e = conn.get_fd().unwrap_err();
    assert!(matches!(e.kind(), ErrorKind::NotConnected));
}

#[test]
fn test_server_and_client_pair() {
    let (a, b) = UnixStream::pair().unwrap();

    let mut server = Connection::new();
    server.set_fd(OwnedFd::from(a)).unwrap();
    server
        .set_server(true, Id128::from_hex(GUID.as_bytes()).unwrap())
        .unwrap();
    server.start().unwrap();

    let mut client = Connection::new();
    client.set_fd(OwnedFd::from(b)).unwrap();
    client.start().unwrap();

    for _ in 0..32 {
        if client.state() == BusState::Running && server.state() == BusState::Running {
            break;
        }

        let _ = client.process().unwrap();
        let _ = server.process().unwrap();
    }

    assert_eq!(client.state(), BusState::Running);
    assert_eq!(server.state(), BusState::Running);
    assert_eq!(
        client.server_id(),
        Id128::from_hex(GUID.as_bytes()).unwrap()
    );

    let count = Rc::new(Cell::new(0u32));
    let count2 = Rc::clone(&count);

    server
        .add_filter(move |_, m| {
            assert_eq!(m.member(), Some("Ready"));
            count2.set(count2.get() + 1);
            Ok(true)
        })
        .unwrap();

    client.send(peer_signal("Ready")).unwrap();

    while count.get() == 0 {
        server.process().unwrap();
    }

    assert_eq!(count.get(), 1);
}
