use std::num::NonZeroU32;

use super::{decode, encode, frame_size, read_string_body, string_body};
use crate::message::{Message, MessageKind};
use crate::protocol::Flags;

#[rustfmt::skip]
const LE_BLOB: [u8; 36] = [
    // yyyyuu fixed header: little endian, method return, no auto start,
    // version 1
    b'l', b'\x02', b'\x02', b'\x01',
    // bytes in body = 4
    b'\x04', b'\0', b'\0', b'\0',
    // serial = 0x12345678
    b'\x78', b'\x56', b'\x34', b'\x12',
    // bytes in the header field array = 15
    b'\x0f', b'\0', b'\0', b'\0',
    // in reply to: (yv with signature u)
    b'\x05', b'\x01', b'u', b'\0',
    // 0xabcdef12
    b'\x12', b'\xef', b'\xcd', b'\xab',
    // signature field, padded to the 8-byte struct boundary
    b'\x08', b'\x01', b'g', b'\0',
    // 1 byte signature: u
    b'\x01', b'u', b'\0',
    // pad to 8-byte boundary for the body
    b'\0',
    // body: 0xdeadbeef
    b'\xef', b'\xbe', b'\xad', b'\xde',
];

#[rustfmt::skip]
const BE_BLOB: [u8; 36] = [
    b'B', b'\x02', b'\x02', b'\x01',
    b'\0', b'\0', b'\0', b'\x04',
    b'\x12', b'\x34', b'\x56', b'\x78',
    b'\0', b'\0', b'\0', b'\x0f',
    b'\x05', b'\x01', b'u', b'\0',
    b'\xab', b'\xcd', b'\xef', b'\x12',
    b'\x08', b'\x01', b'g', b'\0',
    b'\x01', b'u', b'\0',
    b'\0',
    b'\xde', b'\xad', b'\xbe', b'\xef',
];

fn reply_message() -> Message {
    let mut m = Message {
        kind: MessageKind::MethodReturn {
            reply_serial: NonZeroU32::new(0xabcdef12).unwrap(),
        },
        ..Message::method_call("/", "unused")
    };

    m.flags = Flags::NO_AUTO_START;
    m.serial = NonZeroU32::new(0x12345678);
    m.signature = "u".into();
    m.body = 0xdeadbeefu32.to_ne_bytes().to_vec();
    m
}

#[cfg(target_endian = "little")]
#[test]
fn test_encode_blob() {
    let m = reply_message();
    assert_eq!(encode(&m).unwrap(), &LE_BLOB[..]);
}

#[test]
fn test_decode_le_blob() {
    let m = decode(&LE_BLOB, Vec::new()).unwrap();

    assert_eq!(
        m.kind,
        MessageKind::MethodReturn {
            reply_serial: NonZeroU32::new(0xabcdef12).unwrap(),
        }
    );
    assert_eq!(m.serial, NonZeroU32::new(0x12345678));
    assert!(m.flags & Flags::NO_AUTO_START);
    assert_eq!(&*m.signature, "u");
    assert_eq!(m.body, [0xef, 0xbe, 0xad, 0xde]);
}

#[test]
fn test_decode_be_blob() {
    let m = decode(&BE_BLOB, Vec::new()).unwrap();

    assert_eq!(
        m.kind,
        MessageKind::MethodReturn {
            reply_serial: NonZeroU32::new(0xabcdef12).unwrap(),
        }
    );
    assert_eq!(m.serial, NonZeroU32::new(0x12345678));
    assert_eq!(m.body, [0xde, 0xad, 0xbe, 0xef]);
}

#[test]
fn test_frame_size() {
    assert_eq!(frame_size(&LE_BLOB[..16]).unwrap(), LE_BLOB.len());
    assert_eq!(frame_size(&BE_BLOB[..16]).unwrap(), BE_BLOB.len());

    let mut bogus = LE_BLOB;
    bogus[0] = b'x';
    assert!(frame_size(&bogus[..16]).is_err());
}

#[test]
fn test_method_call_round() {
    let mut m = Message::method_call("/org/freedesktop/DBus", "Hello")
        .with_interface("org.freedesktop.DBus")
        .with_destination("org.freedesktop.DBus");

    m.serial = NonZeroU32::new(1);

    let frame = encode(&m).unwrap();
    assert_eq!(frame_size(&frame[..16]).unwrap(), frame.len());

    let decoded = decode(&frame, Vec::new()).unwrap();
    assert_eq!(decoded.path(), Some("/org/freedesktop/DBus"));
    assert_eq!(decoded.member(), Some("Hello"));
    assert_eq!(decoded.interface(), Some("org.freedesktop.DBus"));
    assert_eq!(decoded.destination(), Some("org.freedesktop.DBus"));
    assert_eq!(decoded.serial(), NonZeroU32::new(1));
}

#[test]
fn test_rejects_bad_version() {
    let mut blob = LE_BLOB;
    blob[3] = 2;
    assert!(decode(&blob, Vec::new()).is_err());
}

#[test]
fn test_rejects_zero_serial() {
    let mut blob = LE_BLOB;
    blob[8..12].copy_from_slice(&[0, 0, 0, 0]);
    assert!(decode(&blob, Vec::new()).is_err());
}

#[test]
fn test_string_body() {
    let body = string_body(":1.42");
    let mut m = Message::method_call("/", "x");
    m.body = body;

    assert_eq!(read_string_body(&m).unwrap(), ":1.42");
}
