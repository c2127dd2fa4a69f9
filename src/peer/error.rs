use std::fmt::{Display, Formatter};
use crate::addr::{AddressError, AddressOrGuid, SystemAddress};
use crate::socket::SocketError;

/// Why a remote peer refused a connection attempt
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RefusalReason {
    IncompatibleProtocolVersion {
        remote: u8,
    },
    Banned,
    NoFreeIncomingConnections,
    AlreadyConnected,
    IpRecentlyConnected,
    InvalidPassword,
}

impl Display for RefusalReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RefusalReason::IncompatibleProtocolVersion { remote } => write!(f, "incompatible protocol version (remote: {})", remote),
            RefusalReason::Banned => write!(f, "banned"),
            RefusalReason::NoFreeIncomingConnections => write!(f, "no free incoming connections"),
            RefusalReason::AlreadyConnected => write!(f, "already connected"),
            RefusalReason::IpRecentlyConnected => write!(f, "IP recently connected"),
            RefusalReason::InvalidPassword => write!(f, "invalid password"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RakNetError {
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("connection timed out")]
    ConnectionTimeout,
    #[error("connection refused: {reason}")]
    ConnectionRefused {
        reason: RefusalReason,
    },
    #[error("connection attempt failed after {attempts} attempts")]
    AttemptExhausted {
        attempts: u32,
    },
    #[error("peer is already started")]
    AlreadyStarted,
    #[error("peer is not started")]
    NotStarted,
    #[error("already connected to {0}")]
    AlreadyConnected(SystemAddress),
    #[error("no connection to {0}")]
    UnknownTarget(AddressOrGuid),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type RakNetResult<T> = Result<T, RakNetError>;
