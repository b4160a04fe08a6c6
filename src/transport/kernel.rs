//! The kernel datagram transport.
//!
//! Messages are exchanged with the bus device through ioctls. Outbound
//! payloads are referenced in place (or through a sealed memfd once they
//! get large); inbound messages land in a read-only pool mapped from the
//! device, and every consumed slot must be released back with an ioctl.
//! The device descriptor therefore stays alive for as long as any message
//! borrowed from the pool does.

use std::ffi::CString;
use std::io;
use std::mem::size_of;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

use crate::error::{Error, ErrorKind, Result};
use crate::memfd::MemfdCache;
use crate::message::Message;
use crate::protocol::AttachFlags;
use crate::wire;

/// Size of the receive pool mapping.
const POOL_SIZE: usize = 16 * 1024 * 1024;

/// Payloads above this are shipped through a sealed memfd instead of being
/// copied by the kernel.
const MEMFD_THRESHOLD: usize = 512 * 1024;

mod abi {
    use std::mem::size_of;

    const WRITE: libc::c_ulong = 1;
    const READ: libc::c_ulong = 2;
    const MAGIC: libc::c_ulong = 0x95;

    const fn ioc(dir: libc::c_ulong, nr: libc::c_ulong, size: usize) -> libc::c_ulong {
        (dir << 30) | ((size as libc::c_ulong) << 16) | (MAGIC << 8) | nr
    }

    const fn iow<T>(nr: libc::c_ulong) -> libc::c_ulong {
        ioc(WRITE, nr, size_of::<T>())
    }

    const fn iowr<T>(nr: libc::c_ulong) -> libc::c_ulong {
        ioc(READ | WRITE, nr, size_of::<T>())
    }

    pub(super) const CMD_HELLO: libc::c_ulong = iowr::<CmdHello>(0x30);
    pub(super) const CMD_MSG_SEND: libc::c_ulong = iow::<MsgHeader>(0x40);
    pub(super) const CMD_MSG_RECV: libc::c_ulong = iowr::<CmdRecv>(0x41);
    pub(super) const CMD_FREE: libc::c_ulong = iow::<u64>(0x42);

    pub(super) const HELLO_ACCEPT_FD: u64 = 1;

    pub(super) const ITEM_PAYLOAD_VEC: u64 = 1;
    pub(super) const ITEM_PAYLOAD_OFF: u64 = 2;
    pub(super) const ITEM_PAYLOAD_MEMFD: u64 = 3;
    pub(super) const ITEM_FDS: u64 = 4;

    #[repr(C)]
    pub(super) struct CmdHello {
        pub size: u64,
        pub conn_flags: u64,
        pub attach_flags: u64,
        pub bus_flags: u64,
        pub id: u64,
        pub bloom_size: u64,
        pub pool_size: u64,
        pub id128: [u8; 16],
    }

    #[repr(C)]
    pub(super) struct CmdRecv {
        pub flags: u64,
        pub offset: u64,
    }

    #[repr(C)]
    pub(super) struct MsgHeader {
        pub size: u64,
        pub flags: u64,
        pub dst_id: u64,
        pub src_id: u64,
        pub cookie: u64,
        pub timeout_ns: u64,
    }

    #[repr(C)]
    pub(super) struct ItemHeader {
        pub size: u64,
        pub kind: u64,
    }

    #[repr(C)]
    pub(super) struct ItemVec {
        pub address: u64,
        pub size: u64,
    }

    #[repr(C)]
    pub(super) struct ItemMemfd {
        pub size: u64,
        pub fd: i32,
        pub _pad: u32,
    }
}

/// The shared device handle. Dropped only once the transport and every
/// outstanding pool slot released it.
pub(crate) struct KernelHandle {
    fd: OwnedFd,
    pool: *mut libc::c_void,
    pool_size: usize,
}

impl Drop for KernelHandle {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.pool, self.pool_size);
        }
    }
}

/// Keeps one receive pool slot (and thereby the device) alive until the
/// borrowing message is dropped.
pub(crate) struct PoolSlot {
    handle: Rc<KernelHandle>,
    offset: u64,
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        unsafe {
            libc::ioctl(
                self.handle.fd.as_raw_fd(),
                abi::CMD_FREE,
                &self.offset as *const u64,
            );
        }
    }
}

pub(crate) struct KernelTransport {
    handle: Rc<KernelHandle>,
    unique_id: u64,
    can_fds: bool,
    memfds: Arc<MemfdCache>,
}

impl KernelTransport {
    /// Open the bus device and attach to it.
    pub(crate) fn connect(
        path: &Path,
        accept_fds: bool,
        attach: AttachFlags,
        memfds: Arc<MemfdCache>,
    ) -> Result<Self> {
        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| Error::new(ErrorKind::InvalidAddress))?;

        let fd = unsafe {
            libc::open(
                cpath.as_ptr(),
                libc::O_RDWR | libc::O_CLOEXEC | libc::O_NONBLOCK,
            )
        };

        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Self::take_fd(fd, accept_fds, attach, memfds)
    }

    /// Attach to an already opened bus device.
    pub(crate) fn take_fd(
        fd: OwnedFd,
        accept_fds: bool,
        attach: AttachFlags,
        memfds: Arc<MemfdCache>,
    ) -> Result<Self> {
        let mut hello = abi::CmdHello {
            size: size_of::<abi::CmdHello>() as u64,
            conn_flags: if accept_fds { abi::HELLO_ACCEPT_FD } else { 0 },
            attach_flags: attach.0,
            bus_flags: 0,
            id: 0,
            bloom_size: 0,
            pool_size: POOL_SIZE as u64,
            id128: [0; 16],
        };

        ioctl_retry(fd.as_raw_fd(), abi::CMD_HELLO, &mut hello as *mut _ as *mut _)?;

        let pool = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                POOL_SIZE,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };

        if pool == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }

        Ok(Self {
            handle: Rc::new(KernelHandle {
                fd,
                pool,
                pool_size: POOL_SIZE,
            }),
            unique_id: hello.id,
            can_fds: accept_fds,
            memfds,
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.handle.fd.as_raw_fd()
    }

    pub(crate) fn unique_id(&self) -> u64 {
        self.unique_id
    }

    pub(crate) fn can_fds(&self) -> bool {
        self.can_fds
    }

    /// Submit a sealed message. Datagram sends are atomic, so there is no
    /// partial-write bookkeeping; `false` means the pool is congested and
    /// the send should be retried.
    pub(crate) fn write_message(&mut self, m: &Message) -> Result<bool> {
        let bytes = m
            .wire
            .as_deref()
            .ok_or(Error::new(ErrorKind::Protocol("message not sealed")))?;

        let cookie = m.serial.map(|serial| serial.get() as u64).unwrap_or(0);

        let mut buf = Vec::<u8>::new();
        let mut memfd = None;

        push_struct(
            &mut buf,
            abi::MsgHeader {
                size: 0,
                flags: 0,
                dst_id: 0,
                src_id: self.unique_id,
                cookie,
                timeout_ns: 0,
            },
        );

        if bytes.len() >= MEMFD_THRESHOLD {
            let fd = self.memfds.acquire().map_err(Error::from)?;
            write_all_to(&fd, bytes)?;
            seal(&fd)?;

            push_struct(
                &mut buf,
                abi::ItemHeader {
                    size: (size_of::<abi::ItemHeader>() + size_of::<abi::ItemMemfd>()) as u64,
                    kind: abi::ITEM_PAYLOAD_MEMFD,
                },
            );
            push_struct(
                &mut buf,
                abi::ItemMemfd {
                    size: bytes.len() as u64,
                    fd: fd.as_raw_fd(),
                    _pad: 0,
                },
            );

            memfd = Some(fd);
        } else {
            push_struct(
                &mut buf,
                abi::ItemHeader {
                    size: (size_of::<abi::ItemHeader>() + size_of::<abi::ItemVec>()) as u64,
                    kind: abi::ITEM_PAYLOAD_VEC,
                },
            );
            push_struct(
                &mut buf,
                abi::ItemVec {
                    address: bytes.as_ptr() as u64,
                    size: bytes.len() as u64,
                },
            );
        }

        if !m.fds.is_empty() {
            push_struct(
                &mut buf,
                abi::ItemHeader {
                    size: (size_of::<abi::ItemHeader>() + m.fds.len() * size_of::<RawFd>())
                        as u64,
                    kind: abi::ITEM_FDS,
                },
            );

            for fd in &m.fds {
                buf.extend_from_slice(&fd.as_raw_fd().to_ne_bytes());
            }

            pad8(&mut buf);
        }

        let size = buf.len() as u64;
        buf[..8].copy_from_slice(&size.to_ne_bytes());

        let r = ioctl_retry(self.fd(), abi::CMD_MSG_SEND, buf.as_mut_ptr() as *mut _);
        drop(memfd);

        match r {
            Ok(()) => Ok(true),
            Err(e) if e.would_block() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Receive one message from the pool, if any is queued.
    pub(crate) fn read_message(&mut self) -> Result<Option<Message>> {
        let mut recv = abi::CmdRecv { flags: 0, offset: 0 };

        match ioctl_retry(self.fd(), abi::CMD_MSG_RECV, &mut recv as *mut _ as *mut _) {
            Ok(()) => {}
            Err(e) if e.would_block() => return Ok(None),
            Err(e) => return Err(e),
        }

        // The slot is released when the guard drops, including on parse
        // errors below.
        let slot = PoolSlot {
            handle: Rc::clone(&self.handle),
            offset: recv.offset,
        };

        let header: abi::MsgHeader = self.pool_read(recv.offset)?;

        let mut body = Vec::new();
        let mut fds = Vec::new();

        let end = recv
            .offset
            .checked_add(header.size)
            .filter(|&end| end <= self.handle.pool_size as u64)
            .ok_or(Error::new(ErrorKind::Protocol("pool message out of bounds")))?;

        let mut pos = recv.offset + size_of::<abi::MsgHeader>() as u64;

        while pos + (size_of::<abi::ItemHeader>() as u64) <= end {
            let item: abi::ItemHeader = self.pool_read(pos)?;

            if item.size < size_of::<abi::ItemHeader>() as u64
                || pos + item.size > end
            {
                return Err(Error::new(ErrorKind::Protocol("pool item out of bounds")));
            }

            let data = pos + size_of::<abi::ItemHeader>() as u64;

            match item.kind {
                abi::ITEM_PAYLOAD_OFF => {
                    let vec: abi::ItemVec = self.pool_read(data)?;
                    let start = vec.address as usize;
                    let len = vec.size as usize;

                    if start + len > self.handle.pool_size {
                        return Err(Error::new(ErrorKind::Protocol(
                            "pool payload out of bounds",
                        )));
                    }

                    let bytes = unsafe {
                        std::slice::from_raw_parts(
                            (self.handle.pool as *const u8).add(start),
                            len,
                        )
                    };

                    body.extend_from_slice(bytes);
                }
                abi::ITEM_PAYLOAD_MEMFD => {
                    let memfd: abi::ItemMemfd = self.pool_read(data)?;
                    let fd = unsafe { OwnedFd::from_raw_fd(memfd.fd) };
                    read_exact_from(&fd, memfd.size as usize, &mut body)?;
                }
                abi::ITEM_FDS => {
                    let count =
                        (item.size as usize - size_of::<abi::ItemHeader>()) / size_of::<RawFd>();

                    for i in 0..count {
                        let raw: RawFd =
                            self.pool_read(data + (i * size_of::<RawFd>()) as u64)?;
                        fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
                    }
                }
                _ => {
                    // Metadata items requested via attach flags.
                }
            }

            pos += item.size + (item.size.wrapping_neg() & 7);
        }

        let mut m = wire::decode(&body, fds)?;
        m.slot = Some(slot);
        Ok(Some(m))
    }

    /// Copy a structure out of the receive pool.
    fn pool_read<T>(&self, offset: u64) -> Result<T> {
        let offset = offset as usize;

        if offset + size_of::<T>() > self.handle.pool_size {
            return Err(Error::new(ErrorKind::Protocol("pool read out of bounds")));
        }

        unsafe {
            let ptr = (self.handle.pool as *const u8).add(offset) as *const T;
            Ok(ptr.read_unaligned())
        }
    }
}

fn ioctl_retry(fd: RawFd, cmd: libc::c_ulong, arg: *mut libc::c_void) -> Result<()> {
    loop {
        let r = unsafe { libc::ioctl(fd, cmd, arg) };

        if r >= 0 {
            return Ok(());
        }

        let err = io::Error::last_os_error();

        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            _ => return Err(err.into()),
        }
    }
}

fn push_struct<T>(buf: &mut Vec<u8>, value: T) {
    let bytes = unsafe {
        std::slice::from_raw_parts(&value as *const T as *const u8, size_of::<T>())
    };

    buf.extend_from_slice(bytes);
    pad8(buf);
}

fn pad8(buf: &mut Vec<u8>) {
    while buf.len() % 8 != 0 {
        buf.push(0);
    }
}

fn write_all_to(fd: &OwnedFd, mut bytes: &[u8]) -> Result<()> {
    while !bytes.is_empty() {
        let n = unsafe {
            libc::write(
                fd.as_raw_fd(),
                bytes.as_ptr() as *const libc::c_void,
                bytes.len(),
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();

            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }

            return Err(err.into());
        }

        bytes = &bytes[n as usize..];
    }

    Ok(())
}

fn read_exact_from(fd: &OwnedFd, len: usize, out: &mut Vec<u8>) -> Result<()> {
    let mut remaining = len;
    let mut offset = 0;

    while remaining > 0 {
        let mut chunk = [0u8; 4096];
        let want = remaining.min(chunk.len());

        let n = unsafe {
            libc::pread(
                fd.as_raw_fd(),
                chunk.as_mut_ptr() as *mut libc::c_void,
                want,
                offset,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();

            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }

            return Err(err.into());
        }

        if n == 0 {
            return Err(Error::new(ErrorKind::Protocol("short memfd payload")));
        }

        out.extend_from_slice(&chunk[..n as usize]);
        remaining -= n as usize;
        offset += n as i64;
    }

    Ok(())
}

fn seal(fd: &OwnedFd) -> Result<()> {
    let seals = libc::F_SEAL_SHRINK | libc::F_SEAL_GROW | libc::F_SEAL_WRITE;

    let r = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_ADD_SEALS, seals) };

    if r < 0 {
        return Err(io::Error::last_os_error().into());
    }

    Ok(())
}
