use std::fmt;
use std::num::NonZeroU32;
use std::os::fd::OwnedFd;

use crate::error::{Error, ErrorKind, Result};
use crate::protocol::{Endianness, Flags, MessageType, VERSION};
use crate::transport::kernel::PoolSlot;
use crate::wire;

/// The kind of a D-Bus message.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum MessageKind {
    /// Method call. This message type may prompt a reply.
    MethodCall {
        /// The path being called.
        path: Box<str>,
        /// The member being called.
        member: Box<str>,
    },
    /// Method reply with returned data.
    MethodReturn {
        /// The serial this is a reply to.
        reply_serial: NonZeroU32,
    },
    /// Error reply. By convention the first body argument is an error
    /// message string.
    Error {
        /// The name of the error.
        error_name: Box<str>,
        /// The serial this is a reply to.
        reply_serial: NonZeroU32,
    },
    /// Signal emission.
    Signal {
        /// The path the signal is emitted from.
        path: Box<str>,
        /// The member being signalled.
        member: Box<str>,
    },
}

/// An owned D-Bus message.
///
/// A message starts out unsealed. Sealing happens when it is handed to a
/// connection for sending: the next send serial is assigned, the header is
/// finalized and the wire image is built. A sealed message is immutable.
pub struct Message {
    pub(crate) kind: MessageKind,
    pub(crate) serial: Option<NonZeroU32>,
    pub(crate) flags: Flags,
    pub(crate) version: u8,
    pub(crate) interface: Option<Box<str>>,
    pub(crate) destination: Option<Box<str>>,
    pub(crate) sender: Option<Box<str>>,
    pub(crate) signature: Box<str>,
    pub(crate) body: Vec<u8>,
    pub(crate) endianness: Endianness,
    pub(crate) fds: Vec<OwnedFd>,
    pub(crate) sealed: bool,
    /// Encoded wire image, built at seal time.
    pub(crate) wire: Option<Vec<u8>>,
    /// Keeps the kernel receive pool slot alive while this message is.
    pub(crate) slot: Option<PoolSlot>,
}

impl Message {
    fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            serial: None,
            flags: Flags::EMPTY,
            version: VERSION,
            interface: None,
            destination: None,
            sender: None,
            signature: "".into(),
            body: Vec::new(),
            endianness: Endianness::NATIVE,
            fds: Vec::new(),
            sealed: false,
            wire: None,
            slot: None,
        }
    }

    /// Construct a method call message.
    pub fn method_call(path: &str, member: &str) -> Self {
        Self::new(MessageKind::MethodCall {
            path: path.into(),
            member: member.into(),
        })
    }

    /// Construct a signal message.
    pub fn signal(path: &str, member: &str) -> Self {
        Self::new(MessageKind::Signal {
            path: path.into(),
            member: member.into(),
        })
    }

    /// Construct a method return replying to this message, with sender and
    /// destination swapped.
    ///
    /// Fails if this message has not been sealed, since an unsealed message
    /// carries no serial to reply to.
    pub fn method_return(&self) -> Result<Self> {
        let reply_serial = self.serial.ok_or(Error::new(ErrorKind::ZeroSerial))?;

        let mut m = Self::new(MessageKind::MethodReturn { reply_serial });
        m.destination = self.sender.clone();
        m.sender = self.destination.clone();
        Ok(m)
    }

    /// Construct an error replying to this message, carrying a descriptive
    /// message string as its body.
    pub fn error_reply(&self, error_name: &str, text: &str) -> Result<Self> {
        let reply_serial = self.serial.ok_or(Error::new(ErrorKind::ZeroSerial))?;

        let mut m = Self::new(MessageKind::Error {
            error_name: error_name.into(),
            reply_serial,
        });

        m.destination = self.sender.clone();
        m.sender = self.destination.clone();
        Ok(m.with_body("s", wire::string_body(text)))
    }

    /// Construct the sealed error message delivered in place of a reply
    /// which never arrived.
    pub(crate) fn synthetic_error(
        reply_serial: NonZeroU32,
        error_name: &str,
        text: &str,
    ) -> Self {
        let mut m = Self::new(MessageKind::Error {
            error_name: error_name.into(),
            reply_serial,
        });

        m.signature = "s".into();
        m.body = wire::string_body(text);
        m.serial = NonZeroU32::new(u32::MAX);
        m.sealed = true;
        m
    }

    /// Get the kind of the message.
    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    /// The serial, if the message has been sealed or was received.
    pub fn serial(&self) -> Option<NonZeroU32> {
        self.serial
    }

    /// Get the flags of the message.
    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Modify the flags of the message.
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Get the interface of the message.
    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    /// Modify the interface of the message.
    pub fn with_interface(mut self, interface: &str) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Get the destination of the message.
    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    /// Modify the destination of the message.
    pub fn with_destination(mut self, destination: &str) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Get the sender of the message.
    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    /// Modify the sender of the message.
    pub fn with_sender(mut self, sender: &str) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// The signature of the body.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// The raw bytes of the body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The endianness the body is encoded with.
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// Replace body and signature. The body bytes must already be in
    /// marshalled form.
    pub fn with_body(mut self, signature: &str, body: Vec<u8>) -> Self {
        self.signature = signature.into();
        self.body = body;
        self
    }

    /// Attach a file descriptor to the message.
    pub fn with_fd(mut self, fd: OwnedFd) -> Self {
        self.fds.push(fd);
        self
    }

    /// Number of file descriptors attached to the message.
    pub fn fd_count(&self) -> usize {
        self.fds.len()
    }

    /// Take the attached file descriptors out of the message.
    pub fn take_fds(&mut self) -> Vec<OwnedFd> {
        std::mem::take(&mut self.fds)
    }

    /// Whether the header of this message has been finalized.
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// The path, for method calls and signals.
    pub fn path(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::MethodCall { path, .. } => Some(path),
            MessageKind::Signal { path, .. } => Some(path),
            _ => None,
        }
    }

    /// The member, for method calls and signals.
    pub fn member(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::MethodCall { member, .. } => Some(member),
            MessageKind::Signal { member, .. } => Some(member),
            _ => None,
        }
    }

    /// The serial this message replies to, for returns and errors.
    pub fn reply_serial(&self) -> Option<NonZeroU32> {
        match &self.kind {
            MessageKind::MethodReturn { reply_serial } => Some(*reply_serial),
            MessageKind::Error { reply_serial, .. } => Some(*reply_serial),
            _ => None,
        }
    }

    /// The error name, for error replies.
    pub fn error_name(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::Error { error_name, .. } => Some(error_name),
            _ => None,
        }
    }

    pub(crate) fn message_type(&self) -> MessageType {
        match &self.kind {
            MessageKind::MethodCall { .. } => MessageType::METHOD_CALL,
            MessageKind::MethodReturn { .. } => MessageType::METHOD_RETURN,
            MessageKind::Error { .. } => MessageType::ERROR,
            MessageKind::Signal { .. } => MessageType::SIGNAL,
        }
    }

    /// Assign the serial and build the wire image. Sealing twice is a no-op
    /// so a message which failed to send keeps its serial on retry.
    pub(crate) fn seal(&mut self, serial: NonZeroU32, max_version: u8) -> Result<()> {
        if self.version > max_version {
            return Err(Error::new(ErrorKind::VersionMismatch(self.version)));
        }

        if self.sealed {
            return Ok(());
        }

        self.serial = Some(serial);
        self.wire = Some(wire::encode(self)?);
        self.sealed = true;
        Ok(())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("serial", &self.serial)
            .field("flags", &self.flags)
            .field("interface", &self.interface)
            .field("destination", &self.destination)
            .field("sender", &self.sender)
            .field("signature", &self.signature)
            .field("body", &self.body.len())
            .field("fds", &self.fds.len())
            .field("sealed", &self.sealed)
            .finish_non_exhaustive()
    }
}
