//! Transport variants a connection can sit on.

pub(crate) use self::stream::{AuthProgress, StreamTransport};
pub(crate) mod stream;

pub(crate) use self::kernel::KernelTransport;
pub(crate) mod kernel;

pub(crate) mod container;

use std::os::fd::RawFd;

use crate::error::Result;
use crate::message::Message;

/// A connected transport. The stream variant frames messages over a byte
/// stream; the kernel variant exchanges whole datagrams with the bus
/// device.
pub(crate) enum Transport {
    Stream(StreamTransport),
    Kernel(KernelTransport),
}

impl Transport {
    pub(crate) fn is_kernel(&self) -> bool {
        matches!(self, Transport::Kernel(..))
    }

    pub(crate) fn as_stream_mut(&mut self) -> Option<&mut StreamTransport> {
        match self {
            Transport::Stream(stream) => Some(stream),
            Transport::Kernel(..) => None,
        }
    }

    pub(crate) fn as_stream(&self) -> Option<&StreamTransport> {
        match self {
            Transport::Stream(stream) => Some(stream),
            Transport::Kernel(..) => None,
        }
    }

    /// Write a sealed message, advancing `idx` over the bytes already on
    /// the wire. Returns `true` when the message has been fully written.
    pub(crate) fn write_message(&mut self, m: &Message, idx: &mut usize) -> Result<bool> {
        match self {
            Transport::Stream(stream) => stream.write_message(m, idx),
            Transport::Kernel(kernel) => kernel.write_message(m),
        }
    }

    /// Read one complete message, or `None` when the transport has no full
    /// message available without blocking.
    pub(crate) fn read_message(&mut self) -> Result<Option<Message>> {
        match self {
            Transport::Stream(stream) => stream.read_message(),
            Transport::Kernel(kernel) => kernel.read_message(),
        }
    }

    pub(crate) fn input_fd(&self) -> RawFd {
        match self {
            Transport::Stream(stream) => stream.input_fd(),
            Transport::Kernel(kernel) => kernel.fd(),
        }
    }

    pub(crate) fn output_fd(&self) -> RawFd {
        match self {
            Transport::Stream(stream) => stream.output_fd(),
            Transport::Kernel(kernel) => kernel.fd(),
        }
    }

    /// Whether fd passing has been negotiated and confirmed.
    pub(crate) fn can_fds(&self) -> bool {
        match self {
            Transport::Stream(stream) => stream.can_fds(),
            Transport::Kernel(kernel) => kernel.can_fds(),
        }
    }
}
