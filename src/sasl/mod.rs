//! The SASL handshake D-Bus performs before switching to the binary
//! protocol.
//!
//! Both sides are line based. The client leads with a single NUL byte,
//! then an `AUTH` exchange, optionally negotiates file descriptor passing,
//! and finishes with `BEGIN`. The machines here own the pending output
//! bytes; the transport shovels them to and from the socket.

#[cfg(test)]
mod tests;

use crate::error::{Error, ErrorKind, Result};
use crate::utils::{hexchar, split_once, trim_end, Id128};

/// The authentication mechanism offered by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Auth {
    /// EXTERNAL authentication with the ascii-hex encoded identity.
    External(Vec<u8>),
    /// ANONYMOUS authentication.
    Anonymous,
}

impl Auth {
    /// EXTERNAL authentication for the current real uid.
    pub(crate) fn external_from_uid() -> Auth {
        Self::external_from_u32(unsafe { libc::getuid() })
    }

    /// EXTERNAL authentication for a numeric identity, encoded as the
    /// ascii-hex form of its decimal representation.
    pub(crate) fn external_from_u32(id: u32) -> Auth {
        let decimal = id.to_string();
        let mut hex = Vec::with_capacity(decimal.len() * 2);

        for b in decimal.bytes() {
            hex.push(hexchar(b >> 4));
            hex.push(hexchar(b & 0xf));
        }

        Auth::External(hex)
    }
}

/// Pop one `\r\n`-terminated line off the front of a buffer.
pub(crate) fn take_line(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let n = buf.iter().position(|&b| b == b'\n')?;
    let line: Vec<u8> = buf.drain(..=n).collect();
    Some(trim_end(&line).to_vec())
}

enum ClientState {
    WaitOk,
    WaitAgree,
    Done,
}

/// Client side of the handshake.
pub(crate) struct SaslClient {
    state: ClientState,
    out: Vec<u8>,
    negotiate_fds: bool,
    guid: Option<Id128>,
    can_fds: bool,
}

impl SaslClient {
    pub(crate) fn new(auth: &Auth, negotiate_fds: bool) -> Self {
        let mut out = Vec::new();
        out.push(0);

        match auth {
            Auth::External(id) => {
                out.extend_from_slice(b"AUTH EXTERNAL ");
                out.extend_from_slice(id);
            }
            Auth::Anonymous => {
                out.extend_from_slice(b"AUTH ANONYMOUS");
            }
        }

        out.extend_from_slice(b"\r\n");

        Self {
            state: ClientState::WaitOk,
            out,
            negotiate_fds,
            guid: None,
            can_fds: false,
        }
    }

    /// Bytes waiting to be written to the peer.
    pub(crate) fn pending(&self) -> &[u8] {
        &self.out
    }

    /// Mark `n` pending bytes as written.
    pub(crate) fn consume(&mut self, n: usize) {
        self.out.drain(..n);
    }

    /// Handle one line received from the server.
    pub(crate) fn handle_line(&mut self, line: &[u8]) -> Result<()> {
        let (command, rest) = split_once(line, b' ').unwrap_or((line, &[]));

        match self.state {
            ClientState::WaitOk => match command {
                b"OK" => {
                    self.guid = Id128::from_hex(trim_end(rest));

                    if self.guid.is_none() {
                        return Err(Error::new(ErrorKind::InvalidSasl));
                    }

                    if self.negotiate_fds {
                        self.out.extend_from_slice(b"NEGOTIATE_UNIX_FD\r\n");
                        self.state = ClientState::WaitAgree;
                    } else {
                        self.begin();
                    }

                    Ok(())
                }
                b"REJECTED" => Err(Error::new(ErrorKind::AuthRejected)),
                _ => Err(Error::new(ErrorKind::InvalidSasl)),
            },
            ClientState::WaitAgree => match command {
                b"AGREE_UNIX_FD" => {
                    self.can_fds = true;
                    self.begin();
                    Ok(())
                }
                b"ERROR" => {
                    self.begin();
                    Ok(())
                }
                _ => Err(Error::new(ErrorKind::InvalidSasl)),
            },
            ClientState::Done => Err(Error::new(ErrorKind::InvalidSasl)),
        }
    }

    fn begin(&mut self) {
        self.out.extend_from_slice(b"BEGIN\r\n");
        self.state = ClientState::Done;
    }

    /// The handshake is complete once `BEGIN` has been queued and flushed.
    pub(crate) fn is_done(&self) -> bool {
        matches!(self.state, ClientState::Done) && self.out.is_empty()
    }

    pub(crate) fn guid(&self) -> Option<Id128> {
        self.guid
    }

    pub(crate) fn can_fds(&self) -> bool {
        self.can_fds
    }
}

enum ServerState {
    WaitAuth,
    WaitBegin,
    Done,
}

/// Server side of the handshake.
pub(crate) struct SaslServer {
    state: ServerState,
    guid: Id128,
    anonymous: bool,
    negotiate_fds: bool,
    out: Vec<u8>,
    can_fds: bool,
    nul_seen: bool,
}

impl SaslServer {
    pub(crate) fn new(guid: Id128, anonymous: bool, negotiate_fds: bool) -> Self {
        Self {
            state: ServerState::WaitAuth,
            guid,
            anonymous,
            negotiate_fds,
            out: Vec::new(),
            can_fds: false,
            nul_seen: false,
        }
    }

    pub(crate) fn pending(&self) -> &[u8] {
        &self.out
    }

    pub(crate) fn consume(&mut self, n: usize) {
        self.out.drain(..n);
    }

    /// Strip the credentials NUL the client leads with.
    pub(crate) fn feed_nul(&mut self, buf: &mut Vec<u8>) -> Result<()> {
        if self.nul_seen || buf.is_empty() {
            return Ok(());
        }

        if buf[0] != 0 {
            return Err(Error::new(ErrorKind::InvalidSasl));
        }

        buf.remove(0);
        self.nul_seen = true;
        Ok(())
    }

    pub(crate) fn handle_line(&mut self, line: &[u8]) -> Result<()> {
        let (command, rest) = split_once(line, b' ').unwrap_or((line, &[]));

        match self.state {
            ServerState::WaitAuth => match command {
                b"AUTH" => {
                    let (mechanism, _) = split_once(rest, b' ').unwrap_or((rest, &[]));

                    let accepted = match mechanism {
                        b"EXTERNAL" => true,
                        b"ANONYMOUS" => self.anonymous,
                        _ => false,
                    };

                    if accepted {
                        self.out.extend_from_slice(b"OK ");
                        self.out.extend_from_slice(self.guid.to_hex().as_bytes());
                        self.out.extend_from_slice(b"\r\n");
                        self.state = ServerState::WaitBegin;
                    } else {
                        self.reject();
                    }

                    Ok(())
                }
                b"ERROR" | b"CANCEL" => {
                    self.reject();
                    Ok(())
                }
                b"BEGIN" => Err(Error::new(ErrorKind::InvalidSasl)),
                _ => {
                    self.out.extend_from_slice(b"ERROR\r\n");
                    Ok(())
                }
            },
            ServerState::WaitBegin => match command {
                b"NEGOTIATE_UNIX_FD" => {
                    if self.negotiate_fds {
                        self.can_fds = true;
                        self.out.extend_from_slice(b"AGREE_UNIX_FD\r\n");
                    } else {
                        self.out.extend_from_slice(b"ERROR\r\n");
                    }

                    Ok(())
                }
                b"BEGIN" => {
                    self.state = ServerState::Done;
                    Ok(())
                }
                b"CANCEL" => {
                    self.reject();
                    self.state = ServerState::WaitAuth;
                    Ok(())
                }
                _ => {
                    self.out.extend_from_slice(b"ERROR\r\n");
                    Ok(())
                }
            },
            ServerState::Done => Err(Error::new(ErrorKind::InvalidSasl)),
        }
    }

    fn reject(&mut self) {
        if self.anonymous {
            self.out.extend_from_slice(b"REJECTED EXTERNAL ANONYMOUS\r\n");
        } else {
            self.out.extend_from_slice(b"REJECTED EXTERNAL\r\n");
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        matches!(self.state, ServerState::Done) && self.out.is_empty()
    }

    pub(crate) fn can_fds(&self) -> bool {
        self.can_fds
    }
}
