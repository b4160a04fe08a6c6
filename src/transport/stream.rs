//! The byte-stream transport: unix sockets, TCP and exec pipes.
//!
//! All I/O is non-blocking on cloexec descriptors. Inbound bytes are
//! reassembled into frames by peeking the fixed header, and file
//! descriptors ride along as `SCM_RIGHTS` ancillary data on unix sockets.

use std::io;
use std::mem::{size_of, zeroed};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use crate::error::{Error, ErrorKind, Result};
use crate::message::Message;
use crate::protocol::{AUTH_TIMEOUT_USEC, MAX_FDS, MIN_FRAME_SIZE};
use crate::sasl::{take_line, Auth, SaslClient, SaslServer};
use crate::utils::Id128;
use crate::wire;

/// Space for ancillary data, enough for [`MAX_FDS`] descriptors.
const CMSG_BUF: usize = 256;

/// Progress of the authentication handshake.
pub(crate) enum AuthProgress {
    /// Still in flight; the flag records whether any bytes moved.
    Pending(bool),
    /// Handshake complete.
    Done {
        /// Server GUID learned by a client.
        guid: Option<Id128>,
        /// Whether fd passing was agreed.
        can_fds: bool,
    },
}

enum SaslRole {
    Client(SaslClient),
    Server(SaslServer),
}

struct AuthPhase {
    role: SaslRole,
    inbuf: Vec<u8>,
    deadline: u64,
}

pub(crate) struct StreamTransport {
    input: OwnedFd,
    /// Separate output descriptor, `None` when input and output share one.
    output: Option<OwnedFd>,
    /// Whether the descriptors are unix sockets, enabling fd passing.
    unix: bool,
    recv: Vec<u8>,
    recv_fds: Vec<OwnedFd>,
    auth: Option<AuthPhase>,
    can_fds: bool,
}

impl StreamTransport {
    /// Take ownership of raw descriptors, forcing them non-blocking and
    /// cloexec.
    pub(crate) fn new(input: OwnedFd, output: Option<OwnedFd>) -> io::Result<Self> {
        prepare_fd(input.as_raw_fd())?;

        if let Some(output) = &output {
            prepare_fd(output.as_raw_fd())?;
        }

        let unix = is_unix_socket(input.as_raw_fd());

        Ok(Self {
            input,
            output,
            unix,
            recv: Vec::new(),
            recv_fds: Vec::new(),
            auth: None,
            can_fds: false,
        })
    }

    pub(crate) fn input_fd(&self) -> RawFd {
        self.input.as_raw_fd()
    }

    pub(crate) fn output_fd(&self) -> RawFd {
        match &self.output {
            Some(output) => output.as_raw_fd(),
            None => self.input.as_raw_fd(),
        }
    }

    pub(crate) fn can_fds(&self) -> bool {
        self.can_fds
    }

    /// Whether a non-blocking connect has completed. Reports the queued
    /// socket error if it failed.
    pub(crate) fn connect_finished(&self) -> Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.output_fd(),
            events: libc::POLLOUT,
            revents: 0,
        };

        let r = unsafe { libc::poll(&mut pfd, 1, 0) };

        if r < 0 {
            return Err(io::Error::last_os_error().into());
        }

        if r == 0 {
            return Ok(false);
        }

        let mut error: libc::c_int = 0;
        let mut len = size_of::<libc::c_int>() as libc::socklen_t;

        let r = unsafe {
            libc::getsockopt(
                self.output_fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut error as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };

        if r < 0 {
            return Err(io::Error::last_os_error().into());
        }

        if error != 0 {
            return Err(io::Error::from_raw_os_error(error).into());
        }

        Ok(true)
    }

    pub(crate) fn start_auth_client(&mut self, auth: &Auth, negotiate_fds: bool, now: u64) {
        let client = SaslClient::new(auth, negotiate_fds && self.unix);

        self.auth = Some(AuthPhase {
            role: SaslRole::Client(client),
            inbuf: Vec::new(),
            deadline: now + AUTH_TIMEOUT_USEC,
        });
    }

    pub(crate) fn start_auth_server(
        &mut self,
        guid: Id128,
        anonymous: bool,
        negotiate_fds: bool,
        now: u64,
    ) {
        let server = SaslServer::new(guid, anonymous, negotiate_fds && self.unix);

        self.auth = Some(AuthPhase {
            role: SaslRole::Server(server),
            inbuf: Vec::new(),
            deadline: now + AUTH_TIMEOUT_USEC,
        });
    }

    /// Whether the handshake has bytes waiting to be written.
    pub(crate) fn auth_needs_write(&self) -> bool {
        match &self.auth {
            Some(phase) => !self.auth_pending(phase).is_empty(),
            None => false,
        }
    }

    pub(crate) fn auth_deadline(&self) -> Option<u64> {
        self.auth.as_ref().map(|phase| phase.deadline)
    }

    fn auth_pending<'a>(&self, phase: &'a AuthPhase) -> &'a [u8] {
        match &phase.role {
            SaslRole::Client(client) => client.pending(),
            SaslRole::Server(server) => server.pending(),
        }
    }

    /// Drive the handshake as far as the socket allows.
    pub(crate) fn process_auth(&mut self, now: u64) -> Result<AuthProgress> {
        let Some(mut phase) = self.auth.take() else {
            return Err(Error::new(ErrorKind::Protocol("no handshake in progress")));
        };

        if now >= phase.deadline {
            return Err(Error::new(ErrorKind::TimedOut));
        }

        let out_fd = self.output_fd();
        let in_fd = self.input.as_raw_fd();

        let mut progressed = false;

        loop {
            // Flush whatever the machine wants on the wire.
            loop {
                let pending = match &phase.role {
                    SaslRole::Client(client) => client.pending(),
                    SaslRole::Server(server) => server.pending(),
                };

                if pending.is_empty() {
                    break;
                }

                match write_raw(out_fd, pending)? {
                    Some(n) => {
                        match &mut phase.role {
                            SaslRole::Client(client) => client.consume(n),
                            SaslRole::Server(server) => server.consume(n),
                        }

                        progressed = true;
                    }
                    None => {
                        self.auth = Some(phase);
                        return Ok(AuthProgress::Pending(progressed));
                    }
                }
            }

            let done = match &phase.role {
                SaslRole::Client(client) => client.is_done(),
                SaslRole::Server(server) => server.is_done(),
            };

            if done {
                // Bytes the peer pipelined after the handshake already
                // belong to the message stream.
                self.recv.extend_from_slice(&phase.inbuf);

                let (guid, can_fds) = match phase.role {
                    SaslRole::Client(client) => (client.guid(), client.can_fds()),
                    SaslRole::Server(server) => (None, server.can_fds()),
                };

                self.can_fds = can_fds;
                return Ok(AuthProgress::Done { guid, can_fds });
            }

            let mut chunk = [0u8; 4096];

            match read_plain(in_fd, &mut chunk)? {
                Some(0) => return Err(Error::new(ErrorKind::Disconnected)),
                Some(n) => {
                    phase.inbuf.extend_from_slice(&chunk[..n]);
                    progressed = true;
                }
                None => {
                    self.auth = Some(phase);
                    return Ok(AuthProgress::Pending(progressed));
                }
            }

            if let SaslRole::Server(server) = &mut phase.role {
                server.feed_nul(&mut phase.inbuf)?;
            }

            while let Some(line) = take_line(&mut phase.inbuf) {
                match &mut phase.role {
                    SaslRole::Client(client) => client.handle_line(&line)?,
                    SaslRole::Server(server) => server.handle_line(&line)?,
                }
            }
        }
    }

    /// Write a sealed message starting at byte `idx`, advancing it.
    /// Returns `true` once the message is fully on the wire.
    pub(crate) fn write_message(&mut self, m: &Message, idx: &mut usize) -> Result<bool> {
        let bytes = m
            .wire
            .as_deref()
            .ok_or(Error::new(ErrorKind::Protocol("message not sealed")))?;

        let out_fd = self.output_fd();

        while *idx < bytes.len() {
            let written = if *idx == 0 && !m.fds.is_empty() {
                // Descriptors travel with the first byte of the message.
                sendmsg_with_fds(out_fd, bytes, &m.fds)?
            } else if self.unix {
                send_raw(out_fd, &bytes[*idx..])?
            } else {
                write_raw(out_fd, &bytes[*idx..])?
            };

            match written {
                Some(n) => *idx += n,
                None => return Ok(false),
            }
        }

        Ok(true)
    }

    /// Read one complete message if the transport has it, without
    /// blocking.
    pub(crate) fn read_message(&mut self) -> Result<Option<Message>> {
        loop {
            if self.recv.len() >= MIN_FRAME_SIZE {
                let total = wire::frame_size(&self.recv[..MIN_FRAME_SIZE])?;

                if self.recv.len() >= total {
                    let frame: Vec<u8> = self.recv.drain(..total).collect();
                    let fds = std::mem::take(&mut self.recv_fds);
                    return Ok(Some(wire::decode(&frame, fds)?));
                }
            }

            if !self.read_some()? {
                return Ok(None);
            }
        }
    }

    /// Pull bytes (and any ancillary descriptors) into the reassembly
    /// buffer. Returns `false` when the read would block.
    fn read_some(&mut self) -> Result<bool> {
        let mut chunk = [0u8; 4096];

        if !self.unix {
            return match read_plain(self.input.as_raw_fd(), &mut chunk)? {
                Some(0) => Err(Error::new(ErrorKind::Disconnected)),
                Some(n) => {
                    self.recv.extend_from_slice(&chunk[..n]);
                    Ok(true)
                }
                None => Ok(false),
            };
        }

        let mut iov = libc::iovec {
            iov_base: chunk.as_mut_ptr() as *mut libc::c_void,
            iov_len: chunk.len(),
        };

        let mut cmsg_buf = [0u8; CMSG_BUF];

        let mut msg: libc::msghdr = unsafe { zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_buf.len() as _;

        let n = loop {
            let n = unsafe {
                libc::recvmsg(self.input.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC)
            };

            if n >= 0 {
                break n as usize;
            }

            let err = io::Error::last_os_error();

            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => return Ok(false),
                _ => return Err(err.into()),
            }
        };

        if n == 0 {
            return Err(Error::new(ErrorKind::Disconnected));
        }

        self.recv.extend_from_slice(&chunk[..n]);

        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);

            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET
                    && (*cmsg).cmsg_type == libc::SCM_RIGHTS
                {
                    let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                    let count = ((*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize)
                        / size_of::<RawFd>();

                    for i in 0..count {
                        let fd = data.add(i).read_unaligned();
                        self.recv_fds.push(OwnedFd::from_raw_fd(fd));
                    }
                }

                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }

        Ok(true)
    }
}

/// Connect to a filesystem or abstract unix socket. Returns the socket
/// and whether the connect is still in progress.
pub(crate) fn connect_unix(path: &[u8], abstract_: bool) -> Result<(OwnedFd, bool)> {
    let fd = socket_nonblock(libc::AF_UNIX)?;

    let mut sa: libc::sockaddr_un = unsafe { zeroed() };
    sa.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let offset = usize::from(abstract_);

    if path.len() + offset > sa.sun_path.len() {
        return Err(Error::new(ErrorKind::InvalidAddress));
    }

    for (i, &b) in path.iter().enumerate() {
        sa.sun_path[i + offset] = b as libc::c_char;
    }

    let len = size_of::<libc::sa_family_t>() + offset + path.len();

    let pending = start_connect(
        fd.as_raw_fd(),
        &sa as *const _ as *const libc::sockaddr,
        len as libc::socklen_t,
    )?;

    Ok((fd, pending))
}

/// Connect to a resolved TCP address.
pub(crate) fn connect_tcp(addr: SocketAddr) -> Result<(OwnedFd, bool)> {
    match addr {
        SocketAddr::V4(v4) => {
            let fd = socket_nonblock(libc::AF_INET)?;

            let mut sa: libc::sockaddr_in = unsafe { zeroed() };
            sa.sin_family = libc::AF_INET as libc::sa_family_t;
            sa.sin_port = v4.port().to_be();
            sa.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());

            let pending = start_connect(
                fd.as_raw_fd(),
                &sa as *const _ as *const libc::sockaddr,
                size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )?;

            Ok((fd, pending))
        }
        SocketAddr::V6(v6) => {
            let fd = socket_nonblock(libc::AF_INET6)?;

            let mut sa: libc::sockaddr_in6 = unsafe { zeroed() };
            sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sa.sin6_port = v6.port().to_be();
            sa.sin6_addr.s6_addr = v6.ip().octets();
            sa.sin6_scope_id = v6.scope_id();

            let pending = start_connect(
                fd.as_raw_fd(),
                &sa as *const _ as *const libc::sockaddr,
                size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )?;

            Ok((fd, pending))
        }
    }
}

/// Spawn the bridge subprocess of a `unixexec` address, with one end of a
/// socketpair as its stdin and stdout.
pub(crate) fn connect_exec(path: &str, argv: &[String]) -> Result<OwnedFd> {
    let (ours, theirs) = UnixStream::pair()?;

    let stdin = theirs.try_clone()?;

    let mut command = Command::new(path);

    if let Some(argv0) = argv.first() {
        command.arg0(argv0);
        command.args(&argv[1..]);
    }

    command.stdin(Stdio::from(OwnedFd::from(stdin)));
    command.stdout(Stdio::from(OwnedFd::from(theirs)));
    command.spawn()?;

    Ok(OwnedFd::from(ours))
}

fn prepare_fd(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);

        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }

        let flags = libc::fcntl(fd, libc::F_GETFD);

        if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(())
}

fn is_unix_socket(fd: RawFd) -> bool {
    let mut domain: libc::c_int = 0;
    let mut len = size_of::<libc::c_int>() as libc::socklen_t;

    let r = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_DOMAIN,
            &mut domain as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };

    r == 0 && domain == libc::AF_UNIX
}

fn socket_nonblock(family: libc::c_int) -> Result<OwnedFd> {
    let fd = unsafe {
        libc::socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };

    if fd < 0 {
        return Err(io::Error::last_os_error().into());
    }

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn start_connect(
    fd: RawFd,
    addr: *const libc::sockaddr,
    len: libc::socklen_t,
) -> Result<bool> {
    loop {
        let r = unsafe { libc::connect(fd, addr, len) };

        if r == 0 {
            return Ok(false);
        }

        let err = io::Error::last_os_error();

        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EINPROGRESS) => return Ok(true),
            _ => return Err(err.into()),
        }
    }
}

/// `write(2)` returning `None` on would-block.
fn write_raw(fd: RawFd, bytes: &[u8]) -> Result<Option<usize>> {
    loop {
        let n = unsafe {
            libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len())
        };

        if n >= 0 {
            return Ok(Some(n as usize));
        }

        let err = io::Error::last_os_error();

        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => return Ok(None),
            _ => return Err(err.into()),
        }
    }
}

/// `send(2)` with `MSG_NOSIGNAL`, returning `None` on would-block.
fn send_raw(fd: RawFd, bytes: &[u8]) -> Result<Option<usize>> {
    loop {
        let n = unsafe {
            libc::send(
                fd,
                bytes.as_ptr() as *const libc::c_void,
                bytes.len(),
                libc::MSG_NOSIGNAL,
            )
        };

        if n >= 0 {
            return Ok(Some(n as usize));
        }

        let err = io::Error::last_os_error();

        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => return Ok(None),
            _ => return Err(err.into()),
        }
    }
}

/// `read(2)` returning `None` on would-block.
fn read_plain(fd: RawFd, buf: &mut [u8]) -> Result<Option<usize>> {
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };

        if n >= 0 {
            return Ok(Some(n as usize));
        }

        let err = io::Error::last_os_error();

        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => return Ok(None),
            _ => return Err(err.into()),
        }
    }
}

/// Send the full message buffer with descriptors attached as
/// `SCM_RIGHTS`.
fn sendmsg_with_fds(fd: RawFd, bytes: &[u8], fds: &[OwnedFd]) -> Result<Option<usize>> {
    if fds.len() > MAX_FDS {
        return Err(Error::new(ErrorKind::InvalidArgument(
            "too many file descriptors",
        )));
    }

    let mut iov = libc::iovec {
        iov_base: bytes.as_ptr() as *mut libc::c_void,
        iov_len: bytes.len(),
    };

    let mut cmsg_buf = [0u8; CMSG_BUF];
    let space =
        unsafe { libc::CMSG_SPACE((fds.len() * size_of::<RawFd>()) as u32) } as usize;

    let mut msg: libc::msghdr = unsafe { zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = space as _;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN((fds.len() * size_of::<RawFd>()) as u32) as _;

        let data = libc::CMSG_DATA(cmsg) as *mut RawFd;

        for (i, fd) in fds.iter().enumerate() {
            data.add(i).write_unaligned(fd.as_raw_fd());
        }
    }

    loop {
        let n = unsafe { libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL) };

        if n >= 0 {
            return Ok(Some(n as usize));
        }

        let err = io::Error::last_os_error();

        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => return Ok(None),
            _ => return Err(err.into()),
        }
    }
}
