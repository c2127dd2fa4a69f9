use std::fmt::{Display, Formatter};

/// Lifecycle of a single connection.
///
/// ```ascii
/// Pending -> Connecting -> Connected -> Disconnecting -> Disconnected -> NotConnected
///               |              |                              ^
///               |              +------------------------------+  (timeout, remote disconnect)
///               +-> SilentlyDisconnecting -> NotConnected        (attempts exhausted, cancelled)
/// ```
///
/// `NotConnected` is terminal: the entry is removed from the connection table when it gets there.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ConnectionState {
    Pending,
    Connecting,
    Connected,
    Disconnecting,
    SilentlyDisconnecting,
    Disconnected,
    NotConnected,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!((self, next),
            (Pending, Connecting) |
            (Pending, SilentlyDisconnecting) |
            (Connecting, Connected) |
            (Connecting, SilentlyDisconnecting) |
            (Connected, Disconnecting) |
            (Connected, Disconnected) |
            (Disconnecting, Disconnected) |
            (SilentlyDisconnecting, NotConnected) |
            (Disconnected, NotConnected)
        )
    }

    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }

    /// handshake not complete yet
    pub fn is_connecting(self) -> bool {
        matches!(self, ConnectionState::Pending | ConnectionState::Connecting)
    }

    /// true for states in which the connection may still send and receive
    pub fn is_active(self) -> bool {
        matches!(self,
            ConnectionState::Pending |
            ConnectionState::Connecting |
            ConnectionState::Connected |
            ConnectionState::Disconnecting
        )
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
