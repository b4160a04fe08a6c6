use std::error;
use std::fmt;
use std::io;
use std::str::Utf8Error;

use crate::connection::BusState;
use crate::protocol::error_name_to_errno;

/// Result alias using an [`Error`] as the error type by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised by this crate.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    #[inline]
    pub(crate) fn new(kind: ErrorKind) -> Error {
        Self { kind }
    }

    /// Test if the error indicates that the operation would block.
    #[inline]
    pub(crate) fn would_block(&self) -> bool {
        matches!(self.kind, ErrorKind::WouldBlock)
    }

    #[inline]
    pub(crate) fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Test if this is the expiry of a method call deadline.
    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::TimedOut)
    }

    /// Test if the error indicates the connection is closed or was never
    /// opened.
    #[inline]
    pub fn is_disconnected(&self) -> bool {
        matches!(self.kind, ErrorKind::NotConnected | ErrorKind::Disconnected)
    }

    /// The D-Bus error name, if this error surfaced from an error reply.
    pub fn error_name(&self) -> Option<&str> {
        match &self.kind {
            ErrorKind::MethodError(name, _) => Some(name),
            _ => None,
        }
    }

    /// The closest errno for this error, as a negative value.
    pub fn errno(&self) -> i32 {
        let errno = match &self.kind {
            ErrorKind::Io(error) => error.raw_os_error().unwrap_or(libc::EIO),
            ErrorKind::MethodError(name, _) => error_name_to_errno(name),
            ErrorKind::WouldBlock => libc::EAGAIN,
            ErrorKind::InvalidState(..) => libc::EPERM,
            ErrorKind::NotConnected | ErrorKind::Disconnected => libc::ENOTCONN,
            ErrorKind::Busy => libc::EBUSY,
            ErrorKind::Forked => libc::ECHILD,
            ErrorKind::QueueFull => libc::ENOBUFS,
            ErrorKind::NotSupported => libc::EOPNOTSUPP,
            ErrorKind::TimedOut => libc::ETIMEDOUT,
            ErrorKind::InvalidAddress | ErrorKind::InvalidArgument(..) => libc::EINVAL,
            ErrorKind::MissingBus => libc::ENOENT,
            _ => libc::EIO,
        };

        -errno
    }

    pub(crate) fn method_error(name: &str, message: &str) -> Error {
        Self::new(ErrorKind::MethodError(name.into(), message.into()))
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::WouldBlock => Self::new(ErrorKind::WouldBlock),
            io::ErrorKind::UnexpectedEof => Self::new(ErrorKind::Disconnected),
            _ => Self::new(ErrorKind::Io(error)),
        }
    }
}

impl From<Utf8Error> for Error {
    #[inline]
    fn from(error: Utf8Error) -> Self {
        Self::new(ErrorKind::Utf8(error))
    }
}

impl From<ErrorKind> for Error {
    #[inline]
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ErrorKind::Io(error) => error.fmt(f),
            ErrorKind::Utf8(error) => error.fmt(f),
            ErrorKind::WouldBlock => write!(f, "Would block"),
            ErrorKind::InvalidState(state) => {
                write!(f, "Operation not permitted in state `{state}`")
            }
            ErrorKind::NotConnected => write!(f, "Not connected"),
            ErrorKind::Disconnected => write!(f, "Connection closed by peer"),
            ErrorKind::Busy => write!(f, "Dispatch already in progress"),
            ErrorKind::Forked => write!(f, "Connection inherited across fork()"),
            ErrorKind::Protocol(what) => write!(f, "Protocol violation: {what}"),
            ErrorKind::VersionMismatch(version) => {
                write!(f, "Unsupported protocol version {version}")
            }
            ErrorKind::InvalidAddress => write!(f, "Invalid bus address"),
            ErrorKind::MissingBus => write!(f, "No bus address configured"),
            ErrorKind::QueueFull => write!(f, "Message queue full"),
            ErrorKind::NotSupported => {
                write!(f, "File descriptor passing not negotiated")
            }
            ErrorKind::TimedOut => write!(f, "Method call timed out"),
            ErrorKind::InvalidSasl => write!(f, "Invalid SASL exchange"),
            ErrorKind::AuthRejected => write!(f, "Authentication rejected by peer"),
            ErrorKind::BodyTooLong(length) => {
                write!(f, "Body of length {length} is too long")
            }
            ErrorKind::HeadersTooLong(length) => {
                write!(f, "Header fields of length {length} are too long")
            }
            ErrorKind::MissingField(field) => {
                write!(f, "Missing required {field} header field")
            }
            ErrorKind::ZeroSerial => write!(f, "Zero serial in header"),
            ErrorKind::InvalidArgument(what) => write!(f, "Invalid argument: {what}"),
            ErrorKind::MethodError(name, message) => write!(f, "{name}: {message}"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Io(error) => Some(error),
            ErrorKind::Utf8(error) => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub(crate) enum ErrorKind {
    Io(io::Error),
    Utf8(Utf8Error),
    WouldBlock,
    InvalidState(BusState),
    NotConnected,
    Disconnected,
    Busy,
    Forked,
    Protocol(&'static str),
    VersionMismatch(u8),
    InvalidAddress,
    MissingBus,
    QueueFull,
    NotSupported,
    TimedOut,
    InvalidSasl,
    AuthRejected,
    BodyTooLong(u32),
    HeadersTooLong(u32),
    MissingField(&'static str),
    ZeroSerial,
    InvalidArgument(&'static str),
    MethodError(Box<str>, Box<str>),
}
