//! Parsing of D-Bus server addresses.
//!
//! An address is a `;`-separated list of transport descriptors of the form
//! `type:key1=value1,key2=value2`, where values use `%HH` escaping.
//! Descriptors of unknown type are skipped so that a client can fall back
//! to the next address it understands.

use std::ffi::OsString;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;

use crate::error::{Error, ErrorKind, Result};
use crate::utils::{hexchar, unhexchar, Id128};

/// Space available in `sockaddr_un`.
const SUN_PATH_MAX: usize = 108;

/// Maximum argv index accepted in a `unixexec` descriptor.
const EXEC_ARGV_MAX: usize = 256;

/// The inner unix socket a container descriptor connects to.
pub(crate) const CONTAINER_SOCKET: &str = "/run/dbus/system_bus_socket";

/// A single parsed transport descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// A unix socket bound to a filesystem path.
    Unix {
        /// Path of the socket.
        path: PathBuf,
    },
    /// A unix socket in the abstract namespace.
    Abstract {
        /// Name of the socket, without the leading NUL.
        name: Vec<u8>,
    },
    /// A TCP connection. The host is resolved when the address is parsed.
    Tcp {
        /// The resolved socket address.
        addr: SocketAddr,
    },
    /// A subprocess bridging the bus over its stdin/stdout.
    Exec {
        /// Path of the executable.
        path: String,
        /// Arguments, including `argv[0]`.
        argv: Vec<String>,
    },
    /// The kernel datagram transport.
    Kernel {
        /// Path of the bus device node.
        path: PathBuf,
    },
    /// The system bus inside a local container.
    Container {
        /// Name of the container machine.
        machine: String,
    },
}

/// Parse the next descriptor out of `input`, starting at `*pos`.
///
/// Returns `None` when the list is exhausted. Descriptors with an unknown
/// type prefix are skipped; descriptors of a known type which are malformed
/// fail with an invalid-address error.
pub(crate) fn parse_next(
    input: &str,
    pos: &mut usize,
) -> Result<Option<(Address, Option<Id128>)>> {
    let bytes = input.as_bytes();

    loop {
        while *pos < bytes.len() && bytes[*pos] == b';' {
            *pos += 1;
        }

        if *pos >= bytes.len() {
            return Ok(None);
        }

        let rest = &bytes[*pos..];

        let parsed = if let Some(tail) = strip_prefix(rest, b"unix:") {
            *pos += rest.len() - tail.len();
            Some(parse_unix(bytes, pos)?)
        } else if let Some(tail) = strip_prefix(rest, b"tcp:") {
            *pos += rest.len() - tail.len();
            Some(parse_tcp(bytes, pos)?)
        } else if let Some(tail) = strip_prefix(rest, b"unixexec:") {
            *pos += rest.len() - tail.len();
            Some(parse_exec(bytes, pos)?)
        } else if let Some(tail) = strip_prefix(rest, b"kernel:") {
            *pos += rest.len() - tail.len();
            Some(parse_kernel(bytes, pos)?)
        } else if let Some(tail) = strip_prefix(rest, b"x-container:") {
            *pos += rest.len() - tail.len();
            Some(parse_container(bytes, pos)?)
        } else {
            None
        };

        match parsed {
            Some(parsed) => return Ok(Some(parsed)),
            None => {
                // Unknown transport type, skip to the next descriptor.
                match bytes[*pos..].iter().position(|&b| b == b';') {
                    Some(n) => *pos += n + 1,
                    None => return Ok(None),
                }
            }
        }
    }
}

/// Escape a value for embedding into an address string.
pub(crate) fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());

    for &b in s.as_bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'/' | b'.') {
            out.push(b as char);
        } else {
            out.push('%');
            out.push(hexchar(b >> 4) as char);
            out.push(hexchar(b & 0xf) as char);
        }
    }

    out
}

fn strip_prefix<'a>(bytes: &'a [u8], prefix: &[u8]) -> Option<&'a [u8]> {
    if bytes.starts_with(prefix) {
        Some(&bytes[prefix.len()..])
    } else {
        None
    }
}

fn invalid() -> Error {
    Error::new(ErrorKind::InvalidAddress)
}

/// Consume `key=value` at `*pos` if it starts with the given key, storing
/// the `%HH`-decoded value. A duplicate key is an error.
fn parse_key(
    bytes: &[u8],
    pos: &mut usize,
    key: &str,
    value: &mut Option<Vec<u8>>,
) -> Result<bool> {
    let rest = &bytes[*pos..];

    let Some(tail) = strip_prefix(rest, key.as_bytes()) else {
        return Ok(false);
    };

    if tail.first() != Some(&b'=') {
        return Ok(false);
    }

    if value.is_some() {
        return Err(invalid());
    }

    *pos += key.len() + 1;
    *value = Some(parse_value(bytes, pos)?);
    Ok(true)
}

/// Decode a `%HH`-escaped value up to the next `,`, `;` or end of input,
/// consuming the trailing `,` if present.
fn parse_value(bytes: &[u8], pos: &mut usize) -> Result<Vec<u8>> {
    let mut value = Vec::new();

    while *pos < bytes.len() && bytes[*pos] != b',' && bytes[*pos] != b';' {
        if bytes[*pos] == b'%' {
            if *pos + 2 >= bytes.len() {
                return Err(invalid());
            }

            let hi = unhexchar(bytes[*pos + 1]).ok_or_else(invalid)?;
            let lo = unhexchar(bytes[*pos + 2]).ok_or_else(invalid)?;
            value.push((hi << 4) | lo);
            *pos += 3;
        } else {
            value.push(bytes[*pos]);
            *pos += 1;
        }
    }

    if *pos < bytes.len() && bytes[*pos] == b',' {
        *pos += 1;
    }

    Ok(value)
}

/// Skip an unrecognized key and its value.
fn skip_key(bytes: &[u8], pos: &mut usize) {
    while *pos < bytes.len() && bytes[*pos] != b',' && bytes[*pos] != b';' {
        *pos += 1;
    }

    if *pos < bytes.len() && bytes[*pos] == b',' {
        *pos += 1;
    }
}

fn parse_guid(guid: Option<Vec<u8>>) -> Result<Option<Id128>> {
    match guid {
        None => Ok(None),
        Some(hex) => match Id128::from_hex(&hex) {
            Some(id) => Ok(Some(id)),
            None => Err(invalid()),
        },
    }
}

fn into_string(value: Vec<u8>) -> Result<String> {
    String::from_utf8(value).map_err(|_| invalid())
}

fn parse_unix(bytes: &[u8], pos: &mut usize) -> Result<(Address, Option<Id128>)> {
    let mut guid = None;
    let mut path = None;
    let mut abstract_ = None;

    while *pos < bytes.len() && bytes[*pos] != b';' {
        if parse_key(bytes, pos, "guid", &mut guid)?
            || parse_key(bytes, pos, "path", &mut path)?
            || parse_key(bytes, pos, "abstract", &mut abstract_)?
        {
            continue;
        }

        skip_key(bytes, pos);
    }

    let address = match (path, abstract_) {
        (Some(path), None) => {
            if path.len() > SUN_PATH_MAX {
                return Err(invalid());
            }

            Address::Unix {
                path: PathBuf::from(OsString::from_vec(path)),
            }
        }
        (None, Some(name)) => {
            if name.len() > SUN_PATH_MAX - 1 {
                return Err(invalid());
            }

            Address::Abstract { name }
        }
        _ => return Err(invalid()),
    };

    Ok((address, parse_guid(guid)?))
}

fn parse_tcp(bytes: &[u8], pos: &mut usize) -> Result<(Address, Option<Id128>)> {
    let mut guid = None;
    let mut host = None;
    let mut port = None;
    let mut family = None;

    while *pos < bytes.len() && bytes[*pos] != b';' {
        if parse_key(bytes, pos, "guid", &mut guid)?
            || parse_key(bytes, pos, "host", &mut host)?
            || parse_key(bytes, pos, "port", &mut port)?
            || parse_key(bytes, pos, "family", &mut family)?
        {
            continue;
        }

        skip_key(bytes, pos);
    }

    let (Some(host), Some(port)) = (host, port) else {
        return Err(invalid());
    };

    let host = into_string(host)?;
    let port: u16 = into_string(port)?.parse().map_err(|_| invalid())?;

    let want_v6 = match family.as_deref() {
        None => None,
        Some(b"ipv4") => Some(false),
        Some(b"ipv6") => Some(true),
        Some(_) => return Err(invalid()),
    };

    let addr = (host.as_str(), port)
        .to_socket_addrs()?
        .find(|addr| match want_v6 {
            None => true,
            Some(v6) => addr.is_ipv6() == v6,
        })
        .ok_or_else(|| {
            Error::from(io::Error::from(io::ErrorKind::AddrNotAvailable))
        })?;

    Ok((Address::Tcp { addr }, parse_guid(guid)?))
}

fn parse_exec(bytes: &[u8], pos: &mut usize) -> Result<(Address, Option<Id128>)> {
    let mut guid = None;
    let mut path = None;
    let mut argv: Vec<Option<Vec<u8>>> = Vec::new();

    while *pos < bytes.len() && bytes[*pos] != b';' {
        if parse_key(bytes, pos, "guid", &mut guid)?
            || parse_key(bytes, pos, "path", &mut path)?
        {
            continue;
        }

        if let Some(tail) = strip_prefix(&bytes[*pos..], b"argv") {
            let digits = tail.iter().take_while(|b| b.is_ascii_digit()).count();

            if digits > 0 && tail.get(digits) == Some(&b'=') {
                let index: usize = std::str::from_utf8(&tail[..digits])
                    .map_err(|_| invalid())?
                    .parse()
                    .map_err(|_| invalid())?;

                if index > EXEC_ARGV_MAX {
                    return Err(invalid());
                }

                if index >= argv.len() {
                    argv.resize(index + 1, None);
                }

                if argv[index].is_some() {
                    return Err(invalid());
                }

                *pos += 4 + digits + 1;
                argv[index] = Some(parse_value(bytes, pos)?);
                continue;
            }
        }

        skip_key(bytes, pos);
    }

    let Some(path) = path else {
        return Err(invalid());
    };

    let path = into_string(path)?;

    // No holes allowed, with the exception of argv0 which defaults to the
    // executable path.
    if argv.is_empty() {
        argv.push(Some(path.clone().into_bytes()));
    } else if argv[0].is_none() {
        argv[0] = Some(path.clone().into_bytes());
    }

    let argv = argv
        .into_iter()
        .map(|arg| arg.ok_or_else(invalid).and_then(into_string))
        .collect::<Result<Vec<_>>>()?;

    Ok((Address::Exec { path, argv }, parse_guid(guid)?))
}

fn parse_kernel(bytes: &[u8], pos: &mut usize) -> Result<(Address, Option<Id128>)> {
    let mut guid = None;
    let mut path = None;

    while *pos < bytes.len() && bytes[*pos] != b';' {
        if parse_key(bytes, pos, "guid", &mut guid)?
            || parse_key(bytes, pos, "path", &mut path)?
        {
            continue;
        }

        skip_key(bytes, pos);
    }

    let Some(path) = path else {
        return Err(invalid());
    };

    let address = Address::Kernel {
        path: PathBuf::from(OsString::from_vec(path)),
    };

    Ok((address, parse_guid(guid)?))
}

fn parse_container(bytes: &[u8], pos: &mut usize) -> Result<(Address, Option<Id128>)> {
    let mut guid = None;
    let mut machine = None;

    while *pos < bytes.len() && bytes[*pos] != b';' {
        if parse_key(bytes, pos, "guid", &mut guid)?
            || parse_key(bytes, pos, "machine", &mut machine)?
        {
            continue;
        }

        skip_key(bytes, pos);
    }

    let Some(machine) = machine else {
        return Err(invalid());
    };

    let machine = into_string(machine)?;

    if machine.is_empty() || machine.contains('/') {
        return Err(invalid());
    }

    Ok((Address::Container { machine }, parse_guid(guid)?))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{escape, parse_next, Address};

    fn parse_all(input: &str) -> Vec<Address> {
        let mut pos = 0;
        let mut out = Vec::new();

        while let Some((address, _)) = parse_next(input, &mut pos).unwrap() {
            out.push(address);
        }

        out
    }

    #[test]
    fn test_parse_list() {
        let addresses =
            parse_all("unix:path=/run/dbus/system_bus_socket;tcp:host=127.0.0.1,port=1234");

        assert_eq!(addresses.len(), 2);

        assert_eq!(
            addresses[0],
            Address::Unix {
                path: Path::new("/run/dbus/system_bus_socket").into()
            }
        );

        match &addresses[1] {
            Address::Tcp { addr } => {
                assert_eq!(addr.port(), 1234);
                assert!(addr.ip().is_loopback());
            }
            other => panic!("expected tcp address, got {other:?}"),
        }
    }

    #[test]
    fn test_percent_decoding() {
        let addresses = parse_all("x-container:machine=foo%2Fbar");

        assert_eq!(
            addresses,
            [Address::Container {
                machine: "foo/bar".into()
            }]
        );
    }

    #[test]
    fn test_exec_argv() {
        let addresses =
            parse_all("unixexec:path=ssh,argv1=-xT,argv2=host,argv3=systemd-stdio-bridge");

        assert_eq!(
            addresses,
            [Address::Exec {
                path: "ssh".into(),
                argv: vec![
                    "ssh".into(),
                    "-xT".into(),
                    "host".into(),
                    "systemd-stdio-bridge".into()
                ],
            }]
        );
    }

    #[test]
    fn test_abstract() {
        let addresses = parse_all("unix:abstract=frobnicator");

        assert_eq!(
            addresses,
            [Address::Abstract {
                name: b"frobnicator".to_vec()
            }]
        );
    }

    #[test]
    fn test_unknown_type_skipped() {
        let addresses = parse_all("autolaunch:scope=user;unix:path=/x");

        assert_eq!(
            addresses,
            [Address::Unix {
                path: Path::new("/x").into()
            }]
        );
    }

    #[test]
    fn test_unknown_key_skipped() {
        let addresses = parse_all("unix:frobnicate=1,path=/x");

        assert_eq!(
            addresses,
            [Address::Unix {
                path: Path::new("/x").into()
            }]
        );
    }

    #[test]
    fn test_invalid() {
        for input in [
            "unix:path=/a,abstract=b",
            "unix:guid=00112233445566778899aabbccddeeff",
            "unix:path=%zz",
            "unix:path=/a,path=/b",
            "tcp:host=localhost",
            "unixexec:argv1=x",
            "unixexec:path=x,argv999=y",
            "x-container:machine=",
            "x-container:machine=../escape",
            "unix:path=/x,guid=nothex",
        ] {
            let mut pos = 0;
            assert!(parse_next(input, &mut pos).is_err(), "{input}");
        }
    }

    #[test]
    fn test_guid() {
        let mut pos = 0;
        let (_, guid) =
            parse_next("unix:path=/x,guid=00112233445566778899aabbccddeeff", &mut pos)
                .unwrap()
                .unwrap();

        assert_eq!(guid.unwrap().to_hex(), "00112233445566778899aabbccddeeff");
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("foo/bar"), "foo/bar");
        assert_eq!(escape("foo bar"), "foo%20bar");
        assert_eq!(escape("host=x"), "host%3dx");
    }
}
