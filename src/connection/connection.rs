use std::io;
use std::mem::zeroed;
use std::num::NonZeroU32;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::rc::Rc;
use std::sync::Arc;

use crate::address::{self, Address};
use crate::error::{Error, ErrorKind, Result};
use crate::filter::{FilterHandle, FilterList, MatchHandle, MatchList, MessageHandler};
use crate::memfd::MemfdCache;
use crate::message::{Message, MessageKind};
use crate::protocol::{
    AttachFlags, Events, Flags, MessageType, DBUS_INTERFACE, DBUS_SERVICE,
    DEFAULT_TIMEOUT_USEC, ERROR_NO_REPLY, ERROR_UNKNOWN_METHOD, ERROR_UNKNOWN_OBJECT,
    PEER_INTERFACE, VERSION,
};
use crate::queue::{ReadQueue, WriteQueue};
use crate::reply::PendingReplies;
use crate::sasl::Auth;
use crate::transport::{container, kernel::KernelTransport, stream, AuthProgress};
use crate::transport::{StreamTransport, Transport};
use crate::utils::{machine_id, now_usec, Id128};
use crate::wire;

use super::BusState;

const ENV_SYSTEM_BUS: &str = "DBUS_SYSTEM_BUS_ADDRESS";
const ENV_SESSION_BUS: &str = "DBUS_SESSION_BUS_ADDRESS";
const DEFAULT_SYSTEM_PATH: &str = "/run/dbus/system_bus_socket";

type ReplyHandler = Box<dyn FnOnce(&mut Connection, &Message) -> Result<()>>;

/// A connection to a D-Bus peer or broker.
///
/// The connection is a single-owner, single-threaded object: it performs
/// non-blocking I/O and cooperates with one event loop, either through the
/// [`get_fd`]/[`get_events`]/[`get_timeout`] inquiries or through the
/// tokio binding. [`process`] is the dispatch entry point and consumes at
/// most one inbound message per call.
///
/// [`get_fd`]: Connection::get_fd
/// [`get_events`]: Connection::get_events
/// [`get_timeout`]: Connection::get_timeout
/// [`process`]: Connection::process
pub struct Connection {
    state: BusState,
    // Configuration, all frozen once `start` is called.
    address: Option<String>,
    address_pos: usize,
    target: Option<Address>,
    fixed_fds: Option<(OwnedFd, Option<OwnedFd>)>,
    bus_client: bool,
    is_server: bool,
    anonymous: bool,
    accept_fds: bool,
    attach_flags: AttachFlags,
    server_id: Id128,
    // Runtime.
    transport: Option<Transport>,
    last_connect_error: Option<Error>,
    serial: u32,
    hello_serial: Option<NonZeroU32>,
    unique_name: Option<Box<str>>,
    wqueue: WriteQueue,
    rqueue: ReadQueue,
    replies: PendingReplies<ReplyHandler>,
    filters: FilterList,
    matches: MatchList,
    object_handler: Option<MessageHandler>,
    iteration: u64,
    processing: bool,
    original_pid: u32,
    memfd_cache: Arc<MemfdCache>,
}

impl Connection {
    /// Construct a new, unconfigured connection.
    pub fn new() -> Self {
        Self {
            state: BusState::Unset,
            address: None,
            address_pos: 0,
            target: None,
            fixed_fds: None,
            bus_client: false,
            is_server: false,
            anonymous: false,
            // Accepting descriptors is the default; whether they can
            // actually be sent depends on what the peer agrees to.
            accept_fds: true,
            attach_flags: AttachFlags::EMPTY,
            server_id: Id128::NULL,
            transport: None,
            last_connect_error: None,
            serial: 0,
            hello_serial: None,
            unique_name: None,
            wqueue: WriteQueue::new(),
            rqueue: ReadQueue::new(),
            replies: PendingReplies::new(),
            filters: FilterList::new(),
            matches: MatchList::new(),
            object_handler: None,
            iteration: 0,
            processing: false,
            original_pid: std::process::id(),
            memfd_cache: Arc::new(MemfdCache::new()),
        }
    }

    /// Connect to the system bus.
    ///
    /// Honors `DBUS_SYSTEM_BUS_ADDRESS`, falling back to the well-known
    /// system bus socket.
    pub fn open_system() -> Result<Self> {
        let mut conn = Self::new();

        match std::env::var(ENV_SYSTEM_BUS) {
            Ok(address) => conn.set_address(&address)?,
            Err(..) => {
                conn.target = Some(Address::Unix {
                    path: DEFAULT_SYSTEM_PATH.into(),
                });
            }
        }

        conn.bus_client = true;
        conn.start()?;
        Ok(conn)
    }

    /// Connect to the user session bus.
    ///
    /// Honors `DBUS_SESSION_BUS_ADDRESS`, falling back to the bus socket
    /// in `XDG_RUNTIME_DIR`.
    pub fn open_user() -> Result<Self> {
        let mut conn = Self::new();

        match std::env::var(ENV_SESSION_BUS) {
            Ok(address) => conn.set_address(&address)?,
            Err(..) => {
                let runtime = std::env::var_os("XDG_RUNTIME_DIR")
                    .ok_or(Error::new(ErrorKind::MissingBus))?;

                let mut path = std::path::PathBuf::from(runtime);
                path.push("bus");
                conn.target = Some(Address::Unix { path });
            }
        }

        conn.bus_client = true;
        conn.start()?;
        Ok(conn)
    }

    /// Connect to the system bus of a remote host, bridged over an `ssh`
    /// pipe.
    pub fn open_system_remote(host: &str) -> Result<Self> {
        let address = format!(
            "unixexec:path=ssh,argv1=-xT,argv2={},argv3=systemd-stdio-bridge",
            address::escape(host)
        );

        let mut conn = Self::new();
        conn.set_address(&address)?;
        conn.bus_client = true;
        conn.start()?;
        Ok(conn)
    }

    /// Connect to the system bus inside a local container.
    pub fn open_system_machine(machine: &str) -> Result<Self> {
        let address = format!("x-container:machine={}", address::escape(machine));

        let mut conn = Self::new();
        conn.set_address(&address)?;
        conn.bus_client = true;
        conn.start()?;
        Ok(conn)
    }

    /// Configure the address list to connect to.
    pub fn set_address(&mut self, address: &str) -> Result<()> {
        self.check_unset()?;
        self.address = Some(address.to_owned());
        self.address_pos = 0;
        Ok(())
    }

    /// Hand an already connected descriptor to the connection, used for
    /// both input and output.
    pub fn set_fd(&mut self, fd: OwnedFd) -> Result<()> {
        self.check_unset()?;
        self.fixed_fds = Some((fd, None));
        Ok(())
    }

    /// Like [`set_fd`], with distinct input and output descriptors.
    ///
    /// [`set_fd`]: Connection::set_fd
    pub fn set_fd_pair(&mut self, input: OwnedFd, output: OwnedFd) -> Result<()> {
        self.check_unset()?;
        self.fixed_fds = Some((input, Some(output)));
        Ok(())
    }

    /// Configure a bridge subprocess to connect through.
    pub fn set_exec(&mut self, path: &str, argv: Vec<String>) -> Result<()> {
        self.check_unset()?;

        if argv.is_empty() {
            return Err(Error::new(ErrorKind::InvalidArgument("empty argv")));
        }

        self.target = Some(Address::Exec {
            path: path.to_owned(),
            argv,
        });

        Ok(())
    }

    /// Configure whether this connection talks to a bus broker, issuing
    /// the `Hello` call on connect.
    pub fn set_bus_client(&mut self, bus_client: bool) -> Result<()> {
        self.check_unset()?;
        self.bus_client = bus_client;
        Ok(())
    }

    /// Configure the server role, answering the authentication handshake
    /// with the given GUID.
    pub fn set_server(&mut self, server: bool, id: Id128) -> Result<()> {
        self.check_unset()?;

        if server && id.is_null() {
            return Err(Error::new(ErrorKind::InvalidArgument("null server id")));
        }

        if !server && !id.is_null() {
            return Err(Error::new(ErrorKind::InvalidArgument("server id without server role")));
        }

        self.is_server = server;
        self.server_id = id;
        Ok(())
    }

    /// Accept ANONYMOUS authentication (client offers it, server accepts
    /// it).
    pub fn set_anonymous(&mut self, anonymous: bool) -> Result<()> {
        self.check_unset()?;
        self.anonymous = anonymous;
        Ok(())
    }

    /// Configure whether file descriptor passing should be negotiated.
    pub fn negotiate_fds(&mut self, accept: bool) -> Result<()> {
        self.check_unset()?;
        self.accept_fds = accept;
        Ok(())
    }

    /// Configure the peer metadata the kernel transport attaches to
    /// inbound messages.
    pub fn negotiate_attach(&mut self, flags: AttachFlags) -> Result<()> {
        self.check_unset()?;
        self.attach_flags = flags;
        Ok(())
    }

    /// Start connecting with the accumulated configuration.
    pub fn start(&mut self) -> Result<()> {
        self.check_pid()?;

        if self.state != BusState::Unset {
            return Err(Error::new(ErrorKind::InvalidState(self.state)));
        }

        self.state = BusState::Opening;

        let r = if self.is_server && self.bus_client {
            Err(Error::new(ErrorKind::InvalidArgument(
                "a server cannot be a bus client",
            )))
        } else if self.fixed_fds.is_some() {
            self.start_fd()
        } else if self.target.is_some() || self.address.is_some() {
            self.start_address()
        } else {
            Err(Error::new(ErrorKind::MissingBus))
        };

        if let Err(e) = r {
            self.close();
            return Err(e);
        }

        self.send_hello()
    }

    /// The current lifecycle state.
    pub fn state(&self) -> BusState {
        self.state
    }

    /// Whether the connection has been started and not yet closed.
    pub fn is_open(&self) -> bool {
        self.state.is_open()
    }

    /// The unique name assigned by the broker, available once running.
    pub fn unique_name(&self) -> Option<&str> {
        self.unique_name.as_deref()
    }

    /// The GUID of the server, learned during authentication (or
    /// configured with [`set_server`]).
    ///
    /// [`set_server`]: Connection::set_server
    pub fn server_id(&self) -> Id128 {
        self.server_id
    }

    /// Whether messages carrying file descriptors can currently be sent.
    pub fn can_send_fds(&self) -> bool {
        self.accept_fds
            && self
                .transport
                .as_ref()
                .map_or(false, |transport| transport.can_fds())
    }

    /// The memfd pool shared with the marshaller. Safe to use from any
    /// thread.
    pub fn memfd_cache(&self) -> Arc<MemfdCache> {
        Arc::clone(&self.memfd_cache)
    }

    /// Take a pooled memfd for marshalling use.
    pub fn memfd(&self) -> io::Result<OwnedFd> {
        self.memfd_cache.acquire()
    }

    /// Send a message, returning its serial.
    ///
    /// Never blocks: the message is written directly when the transport
    /// has room, and queued otherwise.
    pub fn send(&mut self, m: Message) -> Result<NonZeroU32> {
        self.send_internal(m, true)
    }

    /// Send a message whose reply is of no interest. Sets
    /// `NO_REPLY_EXPECTED` before sealing.
    pub fn send_no_reply(&mut self, m: Message) -> Result<()> {
        self.send_internal(m, false)?;
        Ok(())
    }

    fn send_internal(&mut self, mut m: Message, want_serial: bool) -> Result<NonZeroU32> {
        self.check_pid()?;
        self.check_open()?;

        if m.fd_count() > 0 && !self.can_send_fds() {
            return Err(Error::new(ErrorKind::NotSupported));
        }

        if !want_serial && !m.sealed {
            m.flags |= Flags::NO_REPLY_EXPECTED;
        }

        let serial = self.seal_message(&mut m)?;
        self.queue_or_write(m)?;
        Ok(serial)
    }

    /// Send a method call and register a callback for its reply.
    ///
    /// `usec` is the reply timeout: `u64::MAX` disables it, `0` applies
    /// the default of 25 seconds. When the deadline passes, the callback
    /// is invoked with a synthesized error carrying
    /// `org.freedesktop.DBus.Error.NoReply`.
    pub fn send_with_reply<F>(&mut self, m: Message, usec: u64, callback: F) -> Result<NonZeroU32>
    where
        F: FnOnce(&mut Connection, &Message) -> Result<()> + 'static,
    {
        self.check_pid()?;
        self.check_open()?;

        if !matches!(m.kind, MessageKind::MethodCall { .. }) {
            return Err(Error::new(ErrorKind::InvalidArgument("not a method call")));
        }

        if m.flags & Flags::NO_REPLY_EXPECTED {
            return Err(Error::new(ErrorKind::InvalidArgument(
                "method call does not expect a reply",
            )));
        }

        if m.fd_count() > 0 && !self.can_send_fds() {
            return Err(Error::new(ErrorKind::NotSupported));
        }

        let mut m = m;
        let serial = self.seal_message(&mut m)?;
        let deadline = calc_elapse(usec);

        // The record must exist before the message can hit the wire, and
        // is rolled back if the send fails.
        self.replies.insert(serial, Box::new(callback), deadline);

        if let Err(e) = self.queue_or_write(m) {
            self.replies.remove(serial);
            return Err(e);
        }

        Ok(serial)
    }

    /// Forget a pending reply. A reply arriving later is discarded
    /// silently.
    pub fn cancel_reply(&mut self, serial: NonZeroU32) -> Result<bool> {
        self.check_pid()?;
        Ok(self.replies.remove(serial).is_some())
    }

    /// Send a method call and block until its reply arrives.
    ///
    /// Unrelated inbound messages observed while waiting are queued in
    /// arrival order and dispatched by later [`process`] calls; filters
    /// and matches never run from inside this call. An error reply is
    /// converted into an [`Error`] carrying the error name. Must not be
    /// invoked from a dispatch callback.
    ///
    /// [`process`]: Connection::process
    pub fn call(&mut self, m: Message, usec: u64) -> Result<Message> {
        self.check_pid()?;
        self.check_open()?;

        if self.processing {
            return Err(Error::new(ErrorKind::Busy));
        }

        if !matches!(m.kind, MessageKind::MethodCall { .. }) {
            return Err(Error::new(ErrorKind::InvalidArgument("not a method call")));
        }

        if m.flags & Flags::NO_REPLY_EXPECTED {
            return Err(Error::new(ErrorKind::InvalidArgument(
                "method call does not expect a reply",
            )));
        }

        self.ensure_running()?;

        let serial = self.send(m)?;
        let deadline = calc_elapse(usec);

        loop {
            if self.rqueue.is_full() {
                return Err(Error::new(ErrorKind::QueueFull));
            }

            let transport = self
                .transport
                .as_mut()
                .ok_or(Error::new(ErrorKind::NotConnected))?;

            match transport.read_message() {
                Err(e) => {
                    self.close();
                    return Err(e);
                }
                Ok(Some(m)) => {
                    if m.reply_serial() == Some(serial) {
                        match m.message_type() {
                            MessageType::METHOD_RETURN => return Ok(m),
                            MessageType::ERROR => {
                                let name = m.error_name().unwrap_or("").to_owned();
                                let text =
                                    wire::read_string_body(&m).unwrap_or("").to_owned();
                                return Err(Error::method_error(&name, &text));
                            }
                            _ => {
                                return Err(Error::new(ErrorKind::Protocol(
                                    "reply with unexpected message type",
                                )));
                            }
                        }
                    }

                    // Not ours; keep it for the regular dispatch pipeline
                    // in arrival order.
                    self.rqueue.push(m)?;
                    continue;
                }
                Ok(None) => {}
            }

            let left = if deadline != 0 {
                let now = now_usec();

                if now >= deadline {
                    return Err(Error::new(ErrorKind::TimedOut));
                }

                deadline - now
            } else {
                u64::MAX
            };

            self.poll_fds(true, left)?;
            self.dispatch_wqueue()?;
        }
    }

    /// Drive the connection state machine.
    ///
    /// Returns `true` when any progress was made; `false` asks the caller
    /// to wait for I/O or timers first. At most one inbound message is
    /// dispatched per call, so callbacks observe a totally ordered stream.
    /// Re-entrant invocation from a callback fails with a busy error.
    pub fn process(&mut self) -> Result<bool> {
        self.check_pid()?;

        if self.processing {
            return Err(Error::new(ErrorKind::Busy));
        }

        match self.state {
            BusState::Unset | BusState::Closed => Err(Error::new(ErrorKind::NotConnected)),
            BusState::Opening => self.process_opening(),
            BusState::Authenticating => self.process_authenticating(),
            BusState::Hello | BusState::Running => {
                self.processing = true;
                let r = self.process_running();
                self.processing = false;
                r
            }
        }
    }

    /// Block until the connection has something to process.
    ///
    /// `timeout_usec` of `u64::MAX` waits indefinitely.
    pub fn wait(&mut self, timeout_usec: u64) -> Result<bool> {
        self.check_pid()?;
        self.check_open()?;

        if !self.rqueue.is_empty() {
            return Ok(true);
        }

        self.poll_fds(false, timeout_usec)
    }

    /// Block until every queued outgoing message reached the transport.
    /// A no-op on an empty queue.
    pub fn flush(&mut self) -> Result<()> {
        self.check_pid()?;
        self.check_open()?;
        self.ensure_running()?;

        loop {
            self.dispatch_wqueue()?;

            if self.wqueue.is_empty() {
                return Ok(());
            }

            self.poll_fds(false, u64::MAX)?;
        }
    }

    /// Close the connection. Terminal: every subsequent operation fails.
    ///
    /// Stream descriptors are closed immediately. The kernel transport
    /// descriptor lives on until the last message borrowed from its pool
    /// is dropped. Pending replies are dropped without being invoked.
    pub fn close(&mut self) {
        if self.state == BusState::Closed {
            return;
        }

        if self.check_pid().is_err() {
            return;
        }

        tracing::debug!(state = %self.state, "closing connection");

        self.state = BusState::Closed;
        self.transport = None;
    }

    /// The descriptor to poll, when input and output share one.
    pub fn get_fd(&self) -> Result<RawFd> {
        self.check_pid()?;
        self.check_open()?;

        let transport = self
            .transport
            .as_ref()
            .ok_or(Error::new(ErrorKind::NotConnected))?;

        if transport.input_fd() != transport.output_fd() {
            return Err(Error::new(ErrorKind::InvalidArgument(
                "connection uses distinct input and output descriptors",
            )));
        }

        Ok(transport.input_fd())
    }

    /// The poll events the connection is currently interested in.
    pub fn get_events(&self) -> Result<Events> {
        self.check_pid()?;
        self.check_open()?;

        let mut events = Events::EMPTY;

        match self.state {
            BusState::Opening => events |= Events::POLLOUT,
            BusState::Authenticating => {
                events |= Events::POLLIN;

                let needs_write = self
                    .transport
                    .as_ref()
                    .and_then(Transport::as_stream)
                    .map_or(false, StreamTransport::auth_needs_write);

                if needs_write {
                    events |= Events::POLLOUT;
                }
            }
            BusState::Hello | BusState::Running => {
                if self.rqueue.is_empty() {
                    events |= Events::POLLIN;
                }

                if !self.wqueue.is_empty() {
                    events |= Events::POLLOUT;
                }
            }
            _ => {}
        }

        Ok(events)
    }

    /// The absolute monotonic deadline of the next internal timer, or
    /// `None` for infinity. A deadline of `0` asks for immediate
    /// dispatch.
    pub fn get_timeout(&self) -> Result<Option<u64>> {
        self.check_pid()?;
        self.check_open()?;

        match self.state {
            BusState::Authenticating => Ok(self
                .transport
                .as_ref()
                .and_then(Transport::as_stream)
                .and_then(StreamTransport::auth_deadline)),
            BusState::Hello | BusState::Running => {
                if !self.rqueue.is_empty() {
                    return Ok(Some(0));
                }

                Ok(self.replies.next_deadline())
            }
            _ => Ok(None),
        }
    }

    /// Register a filter invoked for every inbound message. Returning
    /// `true` from the callback consumes the message.
    pub fn add_filter<F>(&mut self, callback: F) -> Result<FilterHandle>
    where
        F: Fn(&mut Connection, &Message) -> Result<bool> + 'static,
    {
        self.check_pid()?;
        Ok(self.filters.add(Rc::new(callback)))
    }

    /// Unregister a filter.
    pub fn remove_filter(&mut self, handle: FilterHandle) -> Result<bool> {
        self.check_pid()?;
        Ok(self.filters.remove(handle))
    }

    /// Register a match: the callback runs for inbound messages accepted
    /// by the predicate. The predicate is compiled from a match
    /// expression by the caller.
    pub fn add_match<P, F>(&mut self, predicate: P, callback: F) -> Result<MatchHandle>
    where
        P: Fn(&Message) -> bool + 'static,
        F: Fn(&mut Connection, &Message) -> Result<bool> + 'static,
    {
        self.check_pid()?;
        Ok(self.matches.add(Rc::new(predicate), Rc::new(callback)))
    }

    /// Unregister a match.
    pub fn remove_match(&mut self, handle: MatchHandle) -> Result<bool> {
        self.check_pid()?;
        Ok(self.matches.remove(handle))
    }

    /// Install the object dispatch hook, the last stage of the pipeline.
    pub fn set_object_handler<F>(&mut self, callback: F) -> Result<()>
    where
        F: Fn(&mut Connection, &Message) -> Result<bool> + 'static,
    {
        self.check_pid()?;
        self.object_handler = Some(Rc::new(callback));
        Ok(())
    }

    fn check_pid(&self) -> Result<()> {
        // Connections do not survive fork(): the child must not touch the
        // descriptors it inherited.
        if self.original_pid != std::process::id() {
            return Err(Error::new(ErrorKind::Forked));
        }

        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if !self.state.is_open() {
            return Err(Error::new(ErrorKind::NotConnected));
        }

        Ok(())
    }

    fn check_unset(&self) -> Result<()> {
        self.check_pid()?;

        if self.state != BusState::Unset {
            return Err(Error::new(ErrorKind::InvalidState(self.state)));
        }

        Ok(())
    }

    fn is_kernel(&self) -> bool {
        self.transport.as_ref().map_or(false, Transport::is_kernel)
    }

    fn next_serial(&mut self) -> NonZeroU32 {
        self.serial = self.serial.wrapping_add(1);

        if self.serial == 0 {
            self.serial = 1;
        }

        NonZeroU32::new(self.serial).unwrap()
    }

    /// Assign the next serial and build the wire image. An already sealed
    /// message keeps its serial.
    fn seal_message(&mut self, m: &mut Message) -> Result<NonZeroU32> {
        if m.sealed {
            return m.serial.ok_or(Error::new(ErrorKind::ZeroSerial));
        }

        let serial = self.next_serial();
        m.seal(serial, VERSION)?;
        Ok(serial)
    }

    /// Write directly when the connection is past authentication and
    /// nothing is queued ahead, otherwise append to the queue.
    fn queue_or_write(&mut self, m: Message) -> Result<()> {
        let direct = matches!(self.state, BusState::Hello | BusState::Running)
            && self.wqueue.is_empty();

        if !direct {
            return self.wqueue.push(m);
        }

        let transport = self
            .transport
            .as_mut()
            .ok_or(Error::new(ErrorKind::NotConnected))?;

        let mut idx = 0;

        match transport.write_message(&m, &mut idx) {
            Ok(true) => Ok(()),
            Ok(false) => {
                // Remember how much went out; the head slot is always
                // available for this.
                self.wqueue.push_partial(m, idx);
                Ok(())
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    /// Drive the write queue as far as the transport allows.
    fn dispatch_wqueue(&mut self) -> Result<bool> {
        let mut progressed = false;

        while !self.wqueue.is_empty() {
            let transport = self
                .transport
                .as_mut()
                .ok_or(Error::new(ErrorKind::NotConnected))?;

            let mut idx = self.wqueue.windex();
            let head = self.wqueue.head().unwrap();

            match transport.write_message(head, &mut idx) {
                Ok(true) => {
                    self.wqueue.pop_head();
                    progressed = true;
                }
                Ok(false) => {
                    self.wqueue.set_windex(idx);
                    return Ok(progressed);
                }
                Err(e) => {
                    self.close();
                    return Err(e);
                }
            }
        }

        Ok(progressed)
    }

    /// Take the next inbound message, reading from the transport when the
    /// queue is empty.
    fn dispatch_rqueue(&mut self) -> Result<Option<Message>> {
        if let Some(m) = self.rqueue.pop() {
            return Ok(Some(m));
        }

        let transport = self
            .transport
            .as_mut()
            .ok_or(Error::new(ErrorKind::NotConnected))?;

        match transport.read_message() {
            Ok(m) => Ok(m),
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    fn process_opening(&mut self) -> Result<bool> {
        let finished = {
            let Some(stream) = self.transport.as_ref().and_then(Transport::as_stream) else {
                return Err(Error::new(ErrorKind::NotConnected));
            };

            stream.connect_finished()
        };

        match finished {
            Ok(false) => Ok(false),
            Ok(true) => {
                self.begin_auth();
                Ok(true)
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    fn begin_auth(&mut self) {
        let now = now_usec();
        let is_server = self.is_server;
        let anonymous = self.anonymous;
        let accept_fds = self.accept_fds;
        let server_id = self.server_id;

        let Some(stream) = self.transport.as_mut().and_then(Transport::as_stream_mut) else {
            return;
        };

        if is_server {
            stream.start_auth_server(server_id, anonymous, accept_fds, now);
        } else {
            let auth = if anonymous {
                Auth::Anonymous
            } else {
                Auth::external_from_uid()
            };

            stream.start_auth_client(&auth, accept_fds, now);
        }

        self.state = BusState::Authenticating;
    }

    fn process_authenticating(&mut self) -> Result<bool> {
        let now = now_usec();

        let progress = {
            let Some(stream) = self.transport.as_mut().and_then(Transport::as_stream_mut)
            else {
                return Err(Error::new(ErrorKind::NotConnected));
            };

            stream.process_auth(now)
        };

        match progress {
            Ok(AuthProgress::Pending(progressed)) => Ok(progressed),
            Ok(AuthProgress::Done { guid, .. }) => {
                if let Some(guid) = guid {
                    if !self.is_server && !self.server_id.is_null() && self.server_id != guid
                    {
                        self.close();
                        return Err(Error::new(ErrorKind::Protocol("server GUID mismatch")));
                    }

                    self.server_id = guid;
                }

                self.start_running();
                Ok(true)
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    /// Authentication is done; a bus client still has to pass the `Hello`
    /// gate before it is fully running.
    fn start_running(&mut self) {
        if self.bus_client && !self.is_kernel() {
            self.state = BusState::Hello;
        } else {
            self.state = BusState::Running;
        }
    }

    fn start_fd(&mut self) -> Result<()> {
        let (input, output) = self.fixed_fds.take().unwrap();

        let mut st: libc::stat = unsafe { zeroed() };

        if unsafe { libc::fstat(input.as_raw_fd(), &mut st) } < 0 {
            return Err(io::Error::last_os_error().into());
        }

        // A character device is the kernel bus; everything else speaks the
        // stream protocol.
        if (st.st_mode & libc::S_IFMT) == libc::S_IFCHR {
            if output.is_some() {
                return Err(Error::new(ErrorKind::InvalidArgument(
                    "kernel transport uses a single descriptor",
                )));
            }

            let kernel = KernelTransport::take_fd(
                input,
                self.accept_fds,
                self.attach_flags,
                Arc::clone(&self.memfd_cache),
            )?;

            self.finish_kernel_attach(kernel);
            return Ok(());
        }

        let stream = StreamTransport::new(input, output)?;
        self.transport = Some(Transport::Stream(stream));
        self.begin_auth();
        Ok(())
    }

    fn start_address(&mut self) -> Result<()> {
        loop {
            let Some((address, guid)) = self.next_target()? else {
                return Err(self.last_connect_error.take().unwrap_or_else(|| {
                    Error::from(io::Error::from(io::ErrorKind::ConnectionRefused))
                }));
            };

            if let Some(guid) = guid {
                self.server_id = guid;
            }

            match self.connect_address(&address) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::debug!(?address, error = %e, "connection attempt failed");
                    self.last_connect_error = Some(e);
                }
            }
        }
    }

    fn next_target(&mut self) -> Result<Option<(Address, Option<Id128>)>> {
        if let Some(target) = self.target.take() {
            return Ok(Some((target, None)));
        }

        let Some(address) = self.address.clone() else {
            return Ok(None);
        };

        address::parse_next(&address, &mut self.address_pos)
    }

    fn connect_address(&mut self, address: &Address) -> Result<()> {
        match address {
            Address::Unix { path } => {
                let (fd, pending) = stream::connect_unix(path.as_os_str().as_bytes(), false)?;
                self.setup_stream(fd, pending)
            }
            Address::Abstract { name } => {
                let (fd, pending) = stream::connect_unix(name, true)?;
                self.setup_stream(fd, pending)
            }
            Address::Tcp { addr } => {
                let (fd, pending) = stream::connect_tcp(*addr)?;
                self.setup_stream(fd, pending)
            }
            Address::Exec { path, argv } => {
                let fd = stream::connect_exec(path, argv)?;
                self.setup_stream(fd, false)
            }
            Address::Kernel { path } => {
                let kernel = KernelTransport::connect(
                    path,
                    self.accept_fds,
                    self.attach_flags,
                    Arc::clone(&self.memfd_cache),
                )?;

                self.finish_kernel_attach(kernel);
                Ok(())
            }
            Address::Container { machine } => {
                let fd = container::connect_container(machine)?;
                self.setup_stream(fd, false)
            }
        }
    }

    fn setup_stream(&mut self, fd: OwnedFd, pending: bool) -> Result<()> {
        let stream = StreamTransport::new(fd, None)?;
        self.transport = Some(Transport::Stream(stream));

        if pending {
            self.state = BusState::Opening;
        } else {
            self.begin_auth();
        }

        Ok(())
    }

    /// The kernel transport has no handshake and no `Hello` gate: the
    /// unique name falls out of the attach ioctl.
    fn finish_kernel_attach(&mut self, kernel: KernelTransport) {
        if self.bus_client {
            self.unique_name = Some(format!(":1.{}", kernel.unique_id()).into());
        }

        self.transport = Some(Transport::Kernel(kernel));
        self.state = BusState::Running;
    }

    /// Queue the `Hello` call. Its reply must be the first inbound
    /// message.
    fn send_hello(&mut self) -> Result<()> {
        if !self.bus_client || self.is_kernel() {
            return Ok(());
        }

        let m = Message::method_call("/", "Hello")
            .with_interface(DBUS_INTERFACE)
            .with_destination(DBUS_SERVICE);

        let serial = self.send_with_reply(m, 0, |conn, reply| conn.hello_reply(reply))?;
        self.hello_serial = Some(serial);
        Ok(())
    }

    fn hello_reply(&mut self, reply: &Message) -> Result<()> {
        if let Some(error_name) = reply.error_name() {
            let e = Error::method_error(
                error_name,
                wire::read_string_body(reply).unwrap_or(""),
            );

            self.close();
            return Err(e);
        }

        let name = wire::read_string_body(reply)?;

        if !name.starts_with(':') || name.len() < 2 {
            self.close();
            return Err(Error::new(ErrorKind::Protocol("malformed unique name")));
        }

        tracing::debug!(unique_name = name, "hello complete");

        self.unique_name = Some(name.into());
        self.state = BusState::Running;
        Ok(())
    }

    fn process_running(&mut self) -> Result<bool> {
        if self.process_timeout()? {
            return Ok(true);
        }

        if self.dispatch_wqueue()? {
            return Ok(true);
        }

        let Some(m) = self.dispatch_rqueue()? else {
            return Ok(false);
        };

        self.iteration = self.iteration.wrapping_add(1);

        tracing::debug!(
            sender = m.sender().unwrap_or("n/a"),
            path = m.path().unwrap_or("n/a"),
            interface = m.interface().unwrap_or("n/a"),
            member = m.member().unwrap_or("n/a"),
            "got message"
        );

        // While waiting for the Hello reply, nothing else may arrive.
        if self.state == BusState::Hello {
            let is_reply = matches!(
                m.kind,
                MessageKind::MethodReturn { .. } | MessageKind::Error { .. }
            );

            if !is_reply || m.reply_serial() != self.hello_serial {
                self.close();
                return Err(Error::new(ErrorKind::Protocol(
                    "message received before Hello reply",
                )));
            }
        }

        if self.process_reply(&m)? {
            return Ok(true);
        }

        if self.process_filter(&m)? {
            return Ok(true);
        }

        if self.process_match(&m)? {
            return Ok(true);
        }

        if self.process_builtin(&m)? {
            return Ok(true);
        }

        if self.process_object(&m)? {
            return Ok(true);
        }

        // Unclaimed method calls get an error reply so the caller is not
        // left hanging.
        if matches!(m.kind, MessageKind::MethodCall { .. })
            && !(m.flags & Flags::NO_REPLY_EXPECTED)
        {
            let reply = m.error_reply(
                ERROR_UNKNOWN_OBJECT,
                &format!("Unknown object '{}'.", m.path().unwrap_or("")),
            )?;

            self.send_no_reply(reply)?;
        }

        Ok(true)
    }

    /// Expire the earliest pending reply whose deadline has passed,
    /// delivering a synthesized error to its callback.
    fn process_timeout(&mut self) -> Result<bool> {
        let now = now_usec();

        let Some((serial, callback)) = self.replies.pop_expired(now) else {
            return Ok(false);
        };

        let m = Message::synthetic_error(serial, ERROR_NO_REPLY, "Method call timed out");
        callback(self, &m)?;
        Ok(true)
    }

    fn process_reply(&mut self, m: &Message) -> Result<bool> {
        let Some(reply_serial) = m.reply_serial() else {
            return Ok(false);
        };

        let Some(callback) = self.replies.remove(reply_serial) else {
            return Ok(false);
        };

        callback(self, m)?;
        Ok(true)
    }

    fn process_filter(&mut self, m: &Message) -> Result<bool> {
        loop {
            self.filters.begin_scan();

            let mut index = 0;

            while index < self.filters.len() {
                if self.filters.is_modified() {
                    break;
                }

                if let Some(callback) = self.filters.stamp(index, self.iteration) {
                    if callback(self, m)? {
                        return Ok(true);
                    }
                }

                index += 1;
            }

            if !self.filters.is_modified() {
                return Ok(false);
            }
        }
    }

    fn process_match(&mut self, m: &Message) -> Result<bool> {
        loop {
            self.matches.begin_scan();

            let mut index = 0;

            while index < self.matches.len() {
                if self.matches.is_modified() {
                    break;
                }

                if let Some(callback) = self.matches.stamp(index, self.iteration, m) {
                    if callback(self, m)? {
                        return Ok(true);
                    }
                }

                index += 1;
            }

            if !self.matches.is_modified() {
                return Ok(false);
            }
        }
    }

    /// The `org.freedesktop.DBus.Peer` interface every connection
    /// implements on its own.
    fn process_builtin(&mut self, m: &Message) -> Result<bool> {
        if !matches!(m.kind, MessageKind::MethodCall { .. }) {
            return Ok(false);
        }

        if m.interface() != Some(PEER_INTERFACE) {
            return Ok(false);
        }

        if m.flags & Flags::NO_REPLY_EXPECTED {
            return Ok(true);
        }

        let reply = match m.member() {
            Some("Ping") => m.method_return()?,
            Some("GetMachineId") => {
                let id = machine_id().map_err(Error::from)?;
                m.method_return()?
                    .with_body("s", wire::string_body(&id.to_hex()))
            }
            member => m.error_reply(
                ERROR_UNKNOWN_METHOD,
                &format!(
                    "Unknown method '{}' on interface '{}'.",
                    member.unwrap_or(""),
                    PEER_INTERFACE
                ),
            )?,
        };

        self.send_no_reply(reply)?;
        Ok(true)
    }

    /// Delegate to the external object dispatch layer.
    fn process_object(&mut self, m: &Message) -> Result<bool> {
        let Some(handler) = self.object_handler.clone() else {
            return Ok(false);
        };

        handler(self, m)
    }

    /// Loop process/wait until the connection is fully running.
    fn ensure_running(&mut self) -> Result<()> {
        match self.state {
            BusState::Unset | BusState::Closed => {
                return Err(Error::new(ErrorKind::NotConnected));
            }
            BusState::Running => return Ok(()),
            _ => {}
        }

        loop {
            let progressed = self.process()?;

            match self.state {
                BusState::Running => return Ok(()),
                BusState::Closed => return Err(Error::new(ErrorKind::NotConnected)),
                _ => {}
            }

            if progressed {
                continue;
            }

            self.wait(u64::MAX)?;
        }
    }

    /// Poll the transport descriptors. With `need_more` the caller wants
    /// data regardless of queued work and internal deadlines.
    fn poll_fds(&mut self, need_more: bool, timeout_usec: u64) -> Result<bool> {
        self.check_open()?;

        let mut events = self.get_events()?;
        let mut wait = u64::MAX;

        if need_more {
            events |= Events::POLLIN;
        } else if let Some(until) = self.get_timeout()? {
            wait = until.saturating_sub(now_usec());
        }

        if timeout_usec != u64::MAX && timeout_usec < wait {
            wait = timeout_usec;
        }

        let transport = self
            .transport
            .as_ref()
            .ok_or(Error::new(ErrorKind::NotConnected))?;

        let input = transport.input_fd();
        let output = transport.output_fd();

        let mut fds = [libc::pollfd {
            fd: input,
            events: 0,
            revents: 0,
        }; 2];

        let nfds = if input == output {
            fds[0].events = poll_bits(events);
            1
        } else {
            fds[0].events = poll_bits(events) & libc::POLLIN;
            fds[1].fd = output;
            fds[1].events = poll_bits(events) & libc::POLLOUT;
            2
        };

        let ts = libc::timespec {
            tv_sec: (wait / 1_000_000) as libc::time_t,
            tv_nsec: ((wait % 1_000_000) * 1_000) as libc::c_long,
        };

        let r = unsafe {
            libc::ppoll(
                fds.as_mut_ptr(),
                nfds as libc::nfds_t,
                if wait == u64::MAX {
                    std::ptr::null()
                } else {
                    &ts
                },
                std::ptr::null(),
            )
        };

        if r < 0 {
            let err = io::Error::last_os_error();

            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(false);
            }

            return Err(err.into());
        }

        Ok(r > 0)
    }

    /// The input descriptor, for event-loop adapters that register input
    /// and output separately.
    pub(crate) fn input_fd_raw(&self) -> Result<RawFd> {
        self.check_open()?;

        Ok(self
            .transport
            .as_ref()
            .ok_or(Error::new(ErrorKind::NotConnected))?
            .input_fd())
    }

    /// The output descriptor, see [`input_fd_raw`].
    ///
    /// [`input_fd_raw`]: Connection::input_fd_raw
    pub(crate) fn output_fd_raw(&self) -> Result<RawFd> {
        self.check_open()?;

        Ok(self
            .transport
            .as_ref()
            .ok_or(Error::new(ErrorKind::NotConnected))?
            .output_fd())
    }

    /// One non-blocking flush step. Returns `true` once the outgoing
    /// queue is empty.
    pub(crate) fn flush_step(&mut self) -> Result<bool> {
        self.check_pid()?;
        self.check_open()?;
        self.dispatch_wqueue()?;
        Ok(self.wqueue.is_empty())
    }

    #[cfg(test)]
    pub(crate) fn simulate_fork(&mut self) {
        self.original_pid = self.original_pid.wrapping_add(1);
    }

    #[cfg(test)]
    pub(crate) fn hello_serial(&self) -> Option<NonZeroU32> {
        self.hello_serial
    }

    #[cfg(test)]
    pub(crate) fn pending_replies(&self) -> usize {
        self.replies.len()
    }

    #[cfg(test)]
    pub(crate) fn queued_inbound(&self) -> usize {
        self.rqueue.len()
    }
}

impl Default for Connection {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Pending reply records are dropped without invoking their
        // callbacks; callers observe no reply.
        self.close();
    }
}

fn poll_bits(events: Events) -> libc::c_short {
    let mut bits = 0;

    if events & Events::POLLIN {
        bits |= libc::POLLIN;
    }

    if events & Events::POLLOUT {
        bits |= libc::POLLOUT;
    }

    bits
}

/// Translate a relative timeout into an absolute deadline: `u64::MAX`
/// disables the timeout, `0` applies the default.
fn calc_elapse(usec: u64) -> u64 {
    if usec == u64::MAX {
        return 0;
    }

    let usec = if usec == 0 { DEFAULT_TIMEOUT_USEC } else { usec };
    now_usec() + usec
}
