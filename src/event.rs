//! Binding of a connection to the tokio reactor.
//!
//! The connection itself only exposes poll inquiries; this adapter owns
//! the registration with the reactor, re-synchronizing the interest set
//! and the internal timer before every wait, and waking up on whichever
//! fires first.

use std::os::fd::RawFd;
use std::time::Duration;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use crate::connection::Connection;
use crate::error::{Error, ErrorKind, Result};
use crate::protocol::Events;
use crate::utils::now_usec;

/// A [`Connection`] driven by the tokio reactor.
pub struct AsyncConnection {
    conn: Connection,
    input: AsyncFd<RawFd>,
    output: Option<AsyncFd<RawFd>>,
}

impl AsyncConnection {
    /// Register a started connection with the reactor.
    pub fn new(conn: Connection) -> Result<Self> {
        if !conn.is_open() {
            return Err(Error::new(ErrorKind::NotConnected));
        }

        let input = conn.get_fd();

        let (input, output) = match input {
            Ok(fd) => (fd, None),
            // Distinct input and output descriptors each get their own
            // registration.
            Err(..) => {
                let input = conn.input_fd_raw()?;
                let output = conn.output_fd_raw()?;
                (input, Some(output))
            }
        };

        Ok(Self {
            conn,
            input: AsyncFd::new(input).map_err(Error::from)?,
            output: match output {
                Some(fd) => Some(AsyncFd::new(fd).map_err(Error::from)?),
                None => None,
            },
        })
    }

    /// Access the connection, e.g. to queue messages or add filters.
    pub fn get_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Access the connection immutably.
    pub fn get_ref(&self) -> &Connection {
        &self.conn
    }

    /// Detach from the reactor and hand the connection back.
    pub fn into_inner(self) -> Connection {
        self.conn
    }

    /// Drive the connection until one unit of work was done, waiting on
    /// the reactor in between.
    pub async fn process(&mut self) -> Result<bool> {
        loop {
            if self.conn.process()? {
                return Ok(true);
            }

            // The state machine drained the transport, so readiness has
            // genuinely been consumed and it is safe to wait again.
            self.wait_for_work().await?;
        }
    }

    /// Run the dispatch loop until an error occurs or the connection is
    /// closed.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            self.process().await?;
        }
    }

    /// Flush queued outgoing messages, then return. The final flush on
    /// shutdown goes through here.
    pub async fn shutdown(mut self) -> Result<Connection> {
        while !self.conn.flush_step()? {
            self.wait_for_work().await?;
        }

        Ok(self.conn)
    }

    async fn wait_for_work(&mut self) -> Result<()> {
        let events = self.conn.get_events()?;
        let timeout = self.conn.get_timeout()?;

        let read_interest = events & Events::POLLIN;
        let write_interest = events & Events::POLLOUT;

        let write_fd = self.output.as_ref().unwrap_or(&self.input);

        if let Some(until) = timeout {
            let wait = Duration::from_micros(until.saturating_sub(now_usec()));

            tokio::select! {
                guard = self.input.ready(Interest::READABLE), if read_interest => {
                    let mut guard = guard.map_err(Error::from)?;
                    guard.clear_ready();
                }
                guard = write_fd.ready(Interest::WRITABLE), if write_interest => {
                    let mut guard = guard.map_err(Error::from)?;
                    guard.clear_ready();
                }
                _ = tokio::time::sleep(wait) => {}
            }
        } else {
            tokio::select! {
                guard = self.input.ready(Interest::READABLE), if read_interest => {
                    let mut guard = guard.map_err(Error::from)?;
                    guard.clear_ready();
                }
                guard = write_fd.ready(Interest::WRITABLE), if write_interest => {
                    let mut guard = guard.map_err(Error::from)?;
                    guard.clear_ready();
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;

    use crate::connection::{BusState, Connection};
    use crate::message::Message;
    use crate::testutil::{broker_establish, read_frame, send_frame};

    use super::AsyncConnection;

    #[tokio::test]
    async fn test_async_connection_reaches_running() {
        let (ours, theirs) = UnixStream::pair().unwrap();

        let mut conn = Connection::new();
        conn.set_fd(OwnedFd::from(ours)).unwrap();
        conn.set_bus_client(true).unwrap();
        conn.start().unwrap();

        let broker = std::thread::spawn(move || {
            let mut peer = theirs;
            broker_establish(&mut peer);
            peer
        });

        let mut conn = AsyncConnection::new(conn).unwrap();

        while conn.get_ref().state() != BusState::Running {
            conn.process().await.unwrap();
        }

        assert_eq!(conn.get_ref().unique_name(), Some(":1.42"));
        let mut peer = broker.join().unwrap();

        // A reply pending on the wire wakes the loop up and lands in its
        // callback.
        let call = Message::method_call("/org/example/Object", "Get")
            .with_interface("org.example.Interface");

        let serial = conn
            .get_mut()
            .send_with_reply(call, 0, |_, _| Ok(()))
            .unwrap();

        let outbound = read_frame(&mut peer);
        assert_eq!(outbound.serial(), Some(serial));
        send_frame(&mut peer, outbound.method_return().unwrap(), 2);

        conn.process().await.unwrap();

        let conn = conn.shutdown().await.unwrap();
        assert_eq!(conn.state(), BusState::Running);
    }
}
