use std::fmt;

pub use self::connection::Connection;
mod connection;

#[cfg(test)]
mod tests;

/// The lifecycle state of a connection.
///
/// A connection is "open" from the moment it starts connecting until it is
/// closed; closed is terminal, there is no reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    /// Freshly created, still configurable.
    Unset,
    /// A non-blocking connect is in flight.
    Opening,
    /// The SASL handshake is running.
    Authenticating,
    /// Waiting for the reply to the `Hello` call.
    Hello,
    /// Fully established.
    Running,
    /// Closed, terminally.
    Closed,
}

impl BusState {
    pub(crate) fn is_open(self) -> bool {
        matches!(
            self,
            BusState::Opening | BusState::Authenticating | BusState::Hello | BusState::Running
        )
    }
}

impl fmt::Display for BusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusState::Unset => write!(f, "unset"),
            BusState::Opening => write!(f, "opening"),
            BusState::Authenticating => write!(f, "authenticating"),
            BusState::Hello => write!(f, "hello"),
            BusState::Running => write!(f, "running"),
            BusState::Closed => write!(f, "closed"),
        }
    }
}
