//! Connecting to the system bus inside a local container.
//!
//! The container's leader pid is looked up in the machine registry, then a
//! short-lived child enters the leader's mount namespace, connects to the
//! system bus socket visible in there, and passes the connected socket
//! back over a socketpair.

use std::fs;
use std::io;
use std::mem::{size_of, zeroed};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::address::CONTAINER_SOCKET;
use crate::error::{Error, ErrorKind, Result};

/// Resolve the leader pid of a registered machine.
fn machine_leader(machine: &str) -> Result<libc::pid_t> {
    if machine.is_empty() || machine.contains('/') {
        return Err(Error::new(ErrorKind::InvalidArgument("machine name")));
    }

    let registry = format!("/run/systemd/machines/{machine}");
    let content = fs::read_to_string(registry)?;

    for line in content.lines() {
        if let Some(value) = line.strip_prefix("LEADER=") {
            let pid: libc::pid_t = value
                .trim()
                .parse()
                .map_err(|_| Error::new(ErrorKind::InvalidArgument("machine leader")))?;

            return Ok(pid);
        }
    }

    Err(Error::new(ErrorKind::InvalidArgument(
        "machine has no leader",
    )))
}

/// Connect to the system bus of the given machine, returning the connected
/// stream socket.
pub(crate) fn connect_container(machine: &str) -> Result<OwnedFd> {
    let leader = machine_leader(machine)?;

    let ns = fs::File::open(format!("/proc/{leader}/ns/mnt"))?;

    let mut pair = [0 as RawFd; 2];

    let r = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
            0,
            pair.as_mut_ptr(),
        )
    };

    if r < 0 {
        return Err(io::Error::last_os_error().into());
    }

    let (ours, theirs) = unsafe { (OwnedFd::from_raw_fd(pair[0]), OwnedFd::from_raw_fd(pair[1])) };

    let pid = unsafe { libc::fork() };

    if pid < 0 {
        return Err(io::Error::last_os_error().into());
    }

    if pid == 0 {
        // Child: enter the namespace, connect, hand the socket back. Only
        // async-signal-safe calls from here on.
        let status = child_connect(ns.as_raw_fd(), theirs.as_raw_fd());
        unsafe { libc::_exit(status) };
    }

    drop(theirs);
    drop(ns);

    let mut status = 0;

    loop {
        let r = unsafe { libc::waitpid(pid, &mut status, 0) };

        if r >= 0 {
            break;
        }

        let err = io::Error::last_os_error();

        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err.into());
        }
    }

    if !libc::WIFEXITED(status) || libc::WEXITSTATUS(status) != 0 {
        return Err(Error::new(ErrorKind::Io(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "failed to connect inside container",
        ))));
    }

    recv_fd(ours.as_raw_fd())
}

/// Runs in the forked child.
fn child_connect(ns_fd: RawFd, out_fd: RawFd) -> i32 {
    unsafe {
        if libc::setns(ns_fd, libc::CLONE_NEWNS) < 0 {
            return 1;
        }

        let sock = libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);

        if sock < 0 {
            return 1;
        }

        let mut sa: libc::sockaddr_un = zeroed();
        sa.sun_family = libc::AF_UNIX as libc::sa_family_t;

        let path = CONTAINER_SOCKET.as_bytes();

        for (i, &b) in path.iter().enumerate() {
            sa.sun_path[i] = b as libc::c_char;
        }

        let len = (size_of::<libc::sa_family_t>() + path.len()) as libc::socklen_t;

        loop {
            let r = libc::connect(sock, &sa as *const _ as *const libc::sockaddr, len);

            if r == 0 {
                break;
            }

            if *libc::__errno_location() != libc::EINTR {
                return 1;
            }
        }

        if send_fd(out_fd, sock) < 0 {
            return 1;
        }
    }

    0
}

unsafe fn send_fd(via: RawFd, fd: RawFd) -> isize {
    let mut dummy = 0u8;

    let mut iov = libc::iovec {
        iov_base: &mut dummy as *mut _ as *mut libc::c_void,
        iov_len: 1,
    };

    let mut cmsg_buf = [0u8; 64];

    let mut msg: libc::msghdr = zeroed();
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = libc::CMSG_SPACE(size_of::<RawFd>() as u32) as _;

    let cmsg = libc::CMSG_FIRSTHDR(&msg);
    (*cmsg).cmsg_level = libc::SOL_SOCKET;
    (*cmsg).cmsg_type = libc::SCM_RIGHTS;
    (*cmsg).cmsg_len = libc::CMSG_LEN(size_of::<RawFd>() as u32) as _;
    (libc::CMSG_DATA(cmsg) as *mut RawFd).write_unaligned(fd);

    libc::sendmsg(via, &msg, libc::MSG_NOSIGNAL)
}

fn recv_fd(via: RawFd) -> Result<OwnedFd> {
    let mut dummy = 0u8;

    let mut iov = libc::iovec {
        iov_base: &mut dummy as *mut _ as *mut libc::c_void,
        iov_len: 1,
    };

    let mut cmsg_buf = [0u8; 64];

    let mut msg: libc::msghdr = unsafe { zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len() as _;

    loop {
        let n = unsafe { libc::recvmsg(via, &mut msg, libc::MSG_CMSG_CLOEXEC) };

        if n >= 0 {
            break;
        }

        let err = io::Error::last_os_error();

        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err.into());
        }
    }

    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);

        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS
            {
                let fd = (libc::CMSG_DATA(cmsg) as *const RawFd).read_unaligned();
                return Ok(OwnedFd::from_raw_fd(fd));
            }

            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Err(Error::new(ErrorKind::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        "no descriptor received from container helper",
    ))))
}
