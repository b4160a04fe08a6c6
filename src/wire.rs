//! Encoding and decoding of the D-Bus message header.
//!
//! Only the framing layer lives here: the fixed header, the variable header
//! field array and the length math tying them to the body. Message bodies
//! are carried as opaque marshalled bytes, with just enough string support
//! for the `Hello` exchange and the built-in peer interface.

use std::num::NonZeroU32;
use std::os::fd::OwnedFd;

use crate::error::{Error, ErrorKind, Result};
use crate::message::{Message, MessageKind};
use crate::protocol::{
    Endianness, Flags, HeaderField, MessageType, FIXED_HEADER_SIZE, MAX_BODY_LENGTH,
    MAX_HEADERS_LENGTH, MIN_FRAME_SIZE, VERSION,
};
use crate::utils::padding_to;

/// Compute the size of the full frame from its first [`MIN_FRAME_SIZE`]
/// bytes.
pub(crate) fn frame_size(prefix: &[u8]) -> Result<usize> {
    debug_assert!(prefix.len() >= MIN_FRAME_SIZE);

    let endianness = match prefix[0] {
        b'l' => Endianness::LITTLE,
        b'B' => Endianness::BIG,
        _ => return Err(Error::new(ErrorKind::Protocol("bad endianness marker"))),
    };

    let body_length = load_u32(&prefix[4..8], endianness);
    let headers = load_u32(&prefix[12..16], endianness);

    if body_length > MAX_BODY_LENGTH {
        return Err(Error::new(ErrorKind::BodyTooLong(body_length)));
    }

    if headers > MAX_HEADERS_LENGTH {
        return Err(Error::new(ErrorKind::HeadersTooLong(headers)));
    }

    let headers = headers as usize;

    Ok(MIN_FRAME_SIZE + headers + padding_to(8, headers) + body_length as usize)
}

/// Encode a message into its native-endian wire image. The serial must
/// have been assigned.
pub(crate) fn encode(m: &Message) -> Result<Vec<u8>> {
    let serial = m.serial.ok_or(Error::new(ErrorKind::ZeroSerial))?;

    let Ok(body_length) = u32::try_from(m.body.len()) else {
        return Err(Error::new(ErrorKind::BodyTooLong(u32::MAX)));
    };

    if body_length > MAX_BODY_LENGTH {
        return Err(Error::new(ErrorKind::BodyTooLong(body_length)));
    }

    let mut buf = Vec::with_capacity(MIN_FRAME_SIZE + 64 + m.body.len());

    buf.push(Endianness::NATIVE.0);
    buf.push(m.message_type().0);
    buf.push(m.flags.0);
    buf.push(m.version);
    buf.extend_from_slice(&body_length.to_ne_bytes());
    buf.extend_from_slice(&serial.get().to_ne_bytes());
    // Patched once all header fields are written.
    buf.extend_from_slice(&0u32.to_ne_bytes());

    match &m.kind {
        MessageKind::MethodCall { path, member } => {
            field_str(&mut buf, HeaderField::PATH, b'o', path);
            field_str(&mut buf, HeaderField::MEMBER, b's', member);
        }
        MessageKind::MethodReturn { reply_serial } => {
            field_u32(&mut buf, HeaderField::REPLY_SERIAL, reply_serial.get());
        }
        MessageKind::Error {
            error_name,
            reply_serial,
        } => {
            field_str(&mut buf, HeaderField::ERROR_NAME, b's', error_name);
            field_u32(&mut buf, HeaderField::REPLY_SERIAL, reply_serial.get());
        }
        MessageKind::Signal { path, member } => {
            field_str(&mut buf, HeaderField::PATH, b'o', path);
            field_str(&mut buf, HeaderField::MEMBER, b's', member);
        }
    }

    if let Some(interface) = &m.interface {
        field_str(&mut buf, HeaderField::INTERFACE, b's', interface);
    }

    if let Some(destination) = &m.destination {
        field_str(&mut buf, HeaderField::DESTINATION, b's', destination);
    }

    if let Some(sender) = &m.sender {
        field_str(&mut buf, HeaderField::SENDER, b's', sender);
    }

    if !m.signature.is_empty() {
        field_sig(&mut buf, HeaderField::SIGNATURE, &m.signature);
    }

    if !m.fds.is_empty() {
        field_u32(&mut buf, HeaderField::UNIX_FDS, m.fds.len() as u32);
    }

    let headers = buf.len() - MIN_FRAME_SIZE;

    let Ok(headers32) = u32::try_from(headers) else {
        return Err(Error::new(ErrorKind::HeadersTooLong(u32::MAX)));
    };

    if headers32 > MAX_HEADERS_LENGTH {
        return Err(Error::new(ErrorKind::HeadersTooLong(headers32)));
    }

    buf[FIXED_HEADER_SIZE..MIN_FRAME_SIZE].copy_from_slice(&headers32.to_ne_bytes());

    pad(&mut buf, 8);
    buf.extend_from_slice(&m.body);

    Ok(buf)
}

/// Decode one complete frame, attaching the file descriptors received
/// alongside it.
pub(crate) fn decode(frame: &[u8], fds: Vec<OwnedFd>) -> Result<Message> {
    if frame.len() < MIN_FRAME_SIZE {
        return Err(Error::new(ErrorKind::Protocol("truncated frame")));
    }

    let endianness = match frame[0] {
        b'l' => Endianness::LITTLE,
        b'B' => Endianness::BIG,
        _ => return Err(Error::new(ErrorKind::Protocol("bad endianness marker"))),
    };

    let message_type = MessageType(frame[1]);
    let flags = Flags(frame[2] & 0x7);
    let version = frame[3];

    if version != VERSION {
        return Err(Error::new(ErrorKind::VersionMismatch(version)));
    }

    let body_length = load_u32(&frame[4..8], endianness) as usize;
    let serial = load_u32(&frame[8..12], endianness);
    let headers = load_u32(&frame[12..16], endianness) as usize;

    let Some(serial) = NonZeroU32::new(serial) else {
        return Err(Error::new(ErrorKind::ZeroSerial));
    };

    let headers_end = MIN_FRAME_SIZE + headers;
    let body_offset = headers_end + padding_to(8, headers);

    if frame.len() != body_offset + body_length {
        return Err(Error::new(ErrorKind::Protocol("frame length mismatch")));
    }

    let mut r = Reader {
        buf: &frame[..headers_end],
        pos: MIN_FRAME_SIZE,
        endianness,
    };

    let mut path = None;
    let mut interface = None;
    let mut member = None;
    let mut error_name = None;
    let mut reply_serial = None;
    let mut destination = None;
    let mut sender = None;
    let mut signature: Box<str> = "".into();
    let mut unix_fds = 0;

    while r.pos < headers_end {
        r.align(8)?;

        if r.pos >= headers_end {
            break;
        }

        let field = HeaderField(r.u8()?);
        let sig = r.signature()?.to_vec();

        match (field, sig.as_slice()) {
            (HeaderField::PATH, b"o") => path = Some(r.string()?),
            (HeaderField::INTERFACE, b"s") => interface = Some(r.string()?),
            (HeaderField::MEMBER, b"s") => member = Some(r.string()?),
            (HeaderField::ERROR_NAME, b"s") => error_name = Some(r.string()?),
            (HeaderField::REPLY_SERIAL, b"u") => {
                let value = r.u32()?;
                let value =
                    NonZeroU32::new(value).ok_or(Error::new(ErrorKind::ZeroSerial))?;
                reply_serial = Some(value);
            }
            (HeaderField::DESTINATION, b"s") => destination = Some(r.string()?),
            (HeaderField::SENDER, b"s") => sender = Some(r.string()?),
            (HeaderField::SIGNATURE, b"g") => {
                let sig = r.signature()?;
                signature = std::str::from_utf8(sig)?.into();
            }
            (HeaderField::UNIX_FDS, b"u") => unix_fds = r.u32()? as usize,
            _ => r.skip_value(&sig)?,
        }
    }

    if unix_fds != fds.len() {
        return Err(Error::new(ErrorKind::Protocol("descriptor count mismatch")));
    }

    let kind = match message_type {
        MessageType::METHOD_CALL => MessageKind::MethodCall {
            path: path.ok_or(Error::new(ErrorKind::MissingField("PATH")))?.into(),
            member: member
                .ok_or(Error::new(ErrorKind::MissingField("MEMBER")))?
                .into(),
        },
        MessageType::METHOD_RETURN => MessageKind::MethodReturn {
            reply_serial: reply_serial
                .ok_or(Error::new(ErrorKind::MissingField("REPLY_SERIAL")))?,
        },
        MessageType::ERROR => MessageKind::Error {
            error_name: error_name
                .ok_or(Error::new(ErrorKind::MissingField("ERROR_NAME")))?
                .into(),
            reply_serial: reply_serial
                .ok_or(Error::new(ErrorKind::MissingField("REPLY_SERIAL")))?,
        },
        MessageType::SIGNAL => MessageKind::Signal {
            path: path.ok_or(Error::new(ErrorKind::MissingField("PATH")))?.into(),
            member: member
                .ok_or(Error::new(ErrorKind::MissingField("MEMBER")))?
                .into(),
        },
        _ => return Err(Error::new(ErrorKind::Protocol("unknown message type"))),
    };

    Ok(Message {
        kind,
        serial: Some(serial),
        flags,
        version,
        interface: interface.map(Box::from),
        destination: destination.map(Box::from),
        sender: sender.map(Box::from),
        signature,
        body: frame[body_offset..].to_vec(),
        endianness,
        fds,
        sealed: true,
        wire: None,
        slot: None,
    })
}

/// Marshal a string the way it appears in a message body.
pub(crate) fn string_body(s: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(s.len() + 5);
    buf.extend_from_slice(&(s.len() as u32).to_ne_bytes());
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    buf
}

/// Read a single string out of a message body.
pub(crate) fn read_string_body(m: &Message) -> Result<&str> {
    let mut r = Reader {
        buf: &m.body,
        pos: 0,
        endianness: m.endianness,
    };

    r.string()
}

fn load_u32(bytes: &[u8], endianness: Endianness) -> u32 {
    let array = [bytes[0], bytes[1], bytes[2], bytes[3]];

    if endianness == Endianness::LITTLE {
        u32::from_le_bytes(array)
    } else {
        u32::from_be_bytes(array)
    }
}

fn pad(buf: &mut Vec<u8>, align: usize) {
    for _ in 0..padding_to(align, buf.len()) {
        buf.push(0);
    }
}

/// Append one header field holding a string-like value.
fn field_str(buf: &mut Vec<u8>, field: HeaderField, sig: u8, value: &str) {
    pad(buf, 8);
    buf.push(field.0);
    buf.extend_from_slice(&[1, sig, 0]);
    pad(buf, 4);
    buf.extend_from_slice(&(value.len() as u32).to_ne_bytes());
    buf.extend_from_slice(value.as_bytes());
    buf.push(0);
}

/// Append one header field holding a `u32`.
fn field_u32(buf: &mut Vec<u8>, field: HeaderField, value: u32) {
    pad(buf, 8);
    buf.push(field.0);
    buf.extend_from_slice(&[1, b'u', 0]);
    pad(buf, 4);
    buf.extend_from_slice(&value.to_ne_bytes());
}

/// Append one header field holding a signature value.
fn field_sig(buf: &mut Vec<u8>, field: HeaderField, value: &str) {
    pad(buf, 8);
    buf.push(field.0);
    buf.extend_from_slice(&[1, b'g', 0]);
    buf.push(value.len() as u8);
    buf.extend_from_slice(value.as_bytes());
    buf.push(0);
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    endianness: Endianness,
}

impl<'a> Reader<'a> {
    fn align(&mut self, align: usize) -> Result<()> {
        let aligned = self.pos + padding_to(align, self.pos);

        if aligned > self.buf.len() {
            return Err(Error::new(ErrorKind::Protocol("truncated header")));
        }

        self.pos = aligned;
        Ok(())
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::new(ErrorKind::Protocol("truncated header")));
        }

        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        self.align(4)?;
        let bytes = self.bytes(4)?;
        Ok(load_u32(bytes, self.endianness))
    }

    /// A signature value: length byte, bytes, NUL.
    fn signature(&mut self) -> Result<&'a [u8]> {
        let len = self.u8()? as usize;
        let bytes = self.bytes(len + 1)?;

        if bytes[len] != 0 {
            return Err(Error::new(ErrorKind::Protocol("signature not terminated")));
        }

        Ok(&bytes[..len])
    }

    /// A string value: aligned length, bytes, NUL.
    fn string(&mut self) -> Result<&'a str> {
        let len = self.u32()? as usize;
        let bytes = self.bytes(len + 1)?;

        if bytes[len] != 0 {
            return Err(Error::new(ErrorKind::Protocol("string not terminated")));
        }

        Ok(std::str::from_utf8(&bytes[..len])?)
    }

    /// Skip the value of a header field with an unrecognized code. Header
    /// field values are single complete types; container types do not
    /// occur here.
    fn skip_value(&mut self, sig: &[u8]) -> Result<()> {
        match sig {
            [b'y'] => {
                self.bytes(1)?;
            }
            [b'n'] | [b'q'] => {
                self.align(2)?;
                self.bytes(2)?;
            }
            [b'b'] | [b'i'] | [b'u'] | [b'h'] => {
                self.align(4)?;
                self.bytes(4)?;
            }
            [b'x'] | [b't'] | [b'd'] => {
                self.align(8)?;
                self.bytes(8)?;
            }
            [b's'] | [b'o'] => {
                self.string()?;
            }
            [b'g'] => {
                self.signature()?;
            }
            _ => {
                return Err(Error::new(ErrorKind::Protocol(
                    "unsupported header field type",
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests;
