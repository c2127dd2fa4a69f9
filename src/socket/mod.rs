//! Datagram sockets: the [Transport] capability that does the actual I/O, and [RakNetSocket]
//!  which owns a transport, polls it and reports to a [SocketEventHandler].

pub mod mtu;
pub mod raknet_socket;
pub mod udp;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

pub use raknet_socket::{BoundSocket, RakNetSocket};
pub use udp::UdpTransport;

#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("socket is already bound")]
    AlreadyBound,
    #[error("socket is not bound")]
    NotBound,
    #[error("socket is closed")]
    Closed,
    #[error("negative time to live: {0}")]
    NegativeTtl(i32),
    #[error("poll interval must be greater than zero")]
    InvalidPollInterval,
    #[error("no network interface for address {0}")]
    NoSuchInterface(IpAddr),
    #[error("interface MTU {mtu} is below the minimum of {minimum}")]
    MtuTooLow {
        mtu: u32,
        minimum: u16,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// This is an abstraction for a single bound datagram endpoint, introduced to make the I/O
///  replaceable for testing (see [crate::test_util::MemoryNetwork])
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Binds to the given address, returning the actual bound address (i.e. with the port
    ///  resolved if 0 was requested) and the MTU of the network interface behind it
    async fn bind(&self, address: SocketAddr) -> Result<(SocketAddr, u32), SocketError>;

    /// `ttl` is the IP time to live, `None` for the system default
    async fn send_to(&self, data: &[u8], to: SocketAddr, ttl: Option<u32>) -> Result<(), SocketError>;

    /// Waits at most `timeout` for a datagram
    async fn receive(&self, timeout: Duration) -> Result<Option<(SocketAddr, Bytes)>, SocketError>;

    async fn close(&self);
}

/// Creates a fresh transport for each socket a peer binds
pub type TransportFactory = Arc<dyn Fn() -> Arc<dyn Transport> + Send + Sync>;

/// Callbacks of a [RakNetSocket]. All of them are invoked with the socket's index, so a single
///  handler can serve several sockets.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SocketEventHandler: Send + Sync + 'static {
    async fn on_bind(&self, socket_index: usize, bound: BoundSocket);

    async fn on_send(&self, socket_index: usize, to: SocketAddr, len: usize);

    async fn on_receive(&self, socket_index: usize, from: SocketAddr, data: Bytes);

    /// `cause` is the error that made the socket close itself, `None` for regular closing
    async fn on_close(&self, socket_index: usize, cause: Option<Arc<SocketError>>);
}
