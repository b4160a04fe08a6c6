//! Low level constants and types of the D-Bus wire protocol.

use std::mem::size_of;

raw_enum! {
    #[repr(u8)]
    /// The endianness marker of a message.
    pub enum Endianness {
        /// Little endian.
        LITTLE = b'l',
        /// Big endian.
        BIG = b'B',
    }
}

impl Endianness {
    /// Native endian.
    #[cfg(target_endian = "little")]
    pub const NATIVE: Self = Self::LITTLE;
    /// Native endian.
    #[cfg(target_endian = "big")]
    pub const NATIVE: Self = Self::BIG;
}

raw_enum! {
    #[repr(u8)]
    /// The type of a message.
    pub enum MessageType {
        /// Method call. This message type may prompt a reply.
        METHOD_CALL = 1,
        /// Method reply with returned data.
        METHOD_RETURN = 2,
        /// Error reply.
        ERROR = 3,
        /// Signal emission.
        SIGNAL = 4,
    }
}

raw_set! {
    #[repr(u8)]
    /// Flags inside of a D-Bus message header.
    pub enum Flags {
        /// An empty set of flags.
        EMPTY = 0,
        /// This message does not expect method return replies or error
        /// replies, even if it is of a type that can have a reply; the reply
        /// should be omitted.
        NO_REPLY_EXPECTED = 1,
        /// The bus must not launch an owner for the destination name in
        /// response to this message.
        NO_AUTO_START = 2,
        /// The caller is prepared to wait for interactive authorization of
        /// the call, which might take a considerable time.
        ALLOW_INTERACTIVE_AUTHORIZATION = 4,
    }
}

raw_enum! {
    #[repr(u8)]
    /// Header field codes of the variable header array.
    pub(crate) enum HeaderField {
        /// The object to send a call to, or the object a signal is emitted
        /// from.
        PATH = 1,
        /// The interface to invoke a method call on, or that a signal is
        /// emitted from.
        INTERFACE = 2,
        /// The member, either the method name or signal name.
        MEMBER = 3,
        /// The name of the error that occurred, for errors.
        ERROR_NAME = 4,
        /// The serial number of the message this message is a reply to.
        REPLY_SERIAL = 5,
        /// The name of the connection this message is intended for.
        DESTINATION = 6,
        /// Unique name of the sending connection.
        SENDER = 7,
        /// The signature of the message body.
        SIGNATURE = 8,
        /// The number of Unix file descriptors that accompany the message.
        UNIX_FDS = 9,
    }
}

raw_set! {
    #[repr(u32)]
    /// Poll events a connection is interested in, compatible with the
    /// `poll(2)` event bits.
    pub enum Events {
        /// No events.
        EMPTY = 0,
        /// Readable.
        POLLIN = 0x001,
        /// Writable.
        POLLOUT = 0x004,
    }
}

raw_set! {
    #[repr(u64)]
    /// Peer metadata a connection asks the kernel transport to attach to
    /// each inbound message.
    pub enum AttachFlags {
        /// Nothing attached.
        EMPTY = 0,
        /// The comm field of the sending task.
        COMM = 1 << 0,
        /// The executable path of the sender.
        EXE = 1 << 1,
        /// The command line of the sender.
        CMDLINE = 1 << 2,
        /// The control group of the sender.
        CGROUP = 1 << 3,
        /// The capability sets of the sender.
        CAPS = 1 << 4,
        /// The SELinux context of the sender.
        SELINUX_CONTEXT = 1 << 5,
        /// The audit session and login data of the sender.
        AUDIT = 1 << 6,
    }
}

/// The protocol version this implementation speaks and accepts.
pub(crate) const VERSION: u8 = 1;

/// Size of the fixed part of the message header.
pub(crate) const FIXED_HEADER_SIZE: usize = 12;

/// Fixed header plus the length of the variable header array. This is the
/// prefix needed to compute the full frame size.
pub(crate) const MIN_FRAME_SIZE: usize = FIXED_HEADER_SIZE + size_of::<u32>();

/// Maximum length of a message body.
pub(crate) const MAX_BODY_LENGTH: u32 = 134217728;

/// Maximum length of the variable header array.
pub(crate) const MAX_HEADERS_LENGTH: u32 = 67108864;

/// Maximum number of file descriptors attached to one message.
pub(crate) const MAX_FDS: usize = 16;

/// Limit of the outgoing message queue.
pub(crate) const WQUEUE_MAX: usize = 128;

/// Limit of the incoming message queue.
pub(crate) const RQUEUE_MAX: usize = 128;

/// Timeout applied to method calls which do not specify one.
pub(crate) const DEFAULT_TIMEOUT_USEC: u64 = 25 * 1000 * 1000;

/// Deadline for the authentication handshake.
pub(crate) const AUTH_TIMEOUT_USEC: u64 = 90 * 1000 * 1000;

/// Well known name of the message broker.
pub(crate) const DBUS_SERVICE: &str = "org.freedesktop.DBus";

/// Interface of the message broker.
pub(crate) const DBUS_INTERFACE: &str = "org.freedesktop.DBus";

/// Interface every connection answers on its own.
pub(crate) const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";

/// Error name used for replies which timed out.
pub const ERROR_NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";

/// Error name used for unknown members on handled interfaces.
pub const ERROR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";

/// Error name used for method calls nothing claimed.
pub const ERROR_UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";

/// Error name used for malformed arguments.
pub const ERROR_INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";

/// Map a D-Bus error name to the closest errno.
pub(crate) fn error_name_to_errno(name: &str) -> i32 {
    match name {
        ERROR_NO_REPLY => libc::ETIMEDOUT,
        ERROR_UNKNOWN_METHOD | ERROR_UNKNOWN_OBJECT => libc::EBADR,
        ERROR_INVALID_ARGS => libc::EINVAL,
        "org.freedesktop.DBus.Error.AccessDenied" => libc::EACCES,
        "org.freedesktop.DBus.Error.NoMemory" => libc::ENOMEM,
        "org.freedesktop.DBus.Error.ServiceUnknown" => libc::EHOSTUNREACH,
        _ => libc::EIO,
    }
}
