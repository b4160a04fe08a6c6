//! A small cache of memfds handed out to the marshaller.
//!
//! This is the only piece of connection state shared across threads: a
//! marshaller may return a memfd from whatever thread drops its buffer, so
//! the pool is guarded by a mutex. Everything else on a connection is
//! single-owner.

use std::ffi::CStr;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Mutex;

/// Upper bound of pooled descriptors.
const CACHE_MAX: usize = 8;

/// A mutex-protected pool of anonymous memory descriptors.
pub struct MemfdCache {
    cache: Mutex<Vec<OwnedFd>>,
}

impl MemfdCache {
    pub(crate) fn new() -> Self {
        Self {
            cache: Mutex::new(Vec::new()),
        }
    }

    /// Take a descriptor out of the pool, creating a fresh one when the
    /// pool is empty.
    pub fn acquire(&self) -> io::Result<OwnedFd> {
        if let Some(fd) = self.cache.lock().unwrap().pop() {
            return Ok(fd);
        }

        let name = CStr::from_bytes_with_nul(b"dbus-conn\0").unwrap();

        let fd = unsafe {
            libc::memfd_create(
                name.as_ptr(),
                libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING,
            )
        };

        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// Return a descriptor to the pool. The descriptor is truncated; a
    /// sealed descriptor cannot be reused and is dropped instead.
    pub fn release(&self, fd: OwnedFd) {
        if unsafe { libc::ftruncate(fd.as_raw_fd(), 0) } < 0 {
            return;
        }

        let mut cache = self.cache.lock().unwrap();

        if cache.len() < CACHE_MAX {
            cache.push(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use super::MemfdCache;

    #[test]
    fn test_acquire_release() {
        let cache = MemfdCache::new();

        let a = cache.acquire().unwrap();
        let b = cache.acquire().unwrap();
        assert_ne!(a.as_raw_fd(), b.as_raw_fd());

        let raw = a.as_raw_fd();
        cache.release(a);

        // The pooled descriptor comes back out.
        let c = cache.acquire().unwrap();
        assert_eq!(c.as_raw_fd(), raw);

        cache.release(b);
        cache.release(c);
    }
}
