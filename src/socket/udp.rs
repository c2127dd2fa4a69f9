use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tracing::{debug, trace};
use crate::socket::mtu::interface_mtu;
use crate::socket::{SocketError, Transport};

const SOCKET_BUFFER_SIZE: usize = 1024*1024;
/// large enough for any UDP datagram, so that nothing is truncated on receipt
const RECEIVE_BUFFER_SIZE: usize = 64*1024;

/// [Transport] on a UDP socket
#[derive(Default)]
pub struct UdpTransport {
    socket: RwLock<Option<Arc<UdpSocket>>>,
}

impl UdpTransport {
    pub fn new() -> UdpTransport {
        UdpTransport::default()
    }

    fn create_socket(address: SocketAddr) -> Result<UdpSocket, SocketError> {
        let domain = if address.is_ipv4() {
            Domain::IPV4
        }
        else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE)?;
        socket.set_send_buffer_size(SOCKET_BUFFER_SIZE)?;
        socket.bind(&address.into())?;

        Ok(UdpSocket::from_std(socket.into())?)
    }

    async fn socket(&self) -> Result<Arc<UdpSocket>, SocketError> {
        self.socket.read().await
            .clone()
            .ok_or(SocketError::NotBound)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn bind(&self, address: SocketAddr) -> Result<(SocketAddr, u32), SocketError> {
        let mut socket = self.socket.write().await;
        if socket.is_some() {
            return Err(SocketError::AlreadyBound);
        }

        let mtu = interface_mtu(address.ip())?;
        let udp_socket = Self::create_socket(address)?;
        let bound_address = udp_socket.local_addr()?;
        debug!("UDP socket bound to {:?}, interface MTU {}", bound_address, mtu);

        *socket = Some(Arc::new(udp_socket));
        Ok((bound_address, mtu))
    }

    async fn send_to(&self, data: &[u8], to: SocketAddr, ttl: Option<u32>) -> Result<(), SocketError> {
        let socket = self.socket().await?;
        if let Some(ttl) = ttl {
            socket.set_ttl(ttl)?;
        }
        trace!("UDP socket: sending {} bytes to {:?}", data.len(), to);
        socket.send_to(data, to).await?;
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<(SocketAddr, Bytes)>, SocketError> {
        let socket = self.socket().await?;

        let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
        match tokio::time::timeout(timeout, socket.recv_from(&mut buf)).await {
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok((len, from))) => {
                buf.truncate(len);
                Ok(Some((from, Bytes::from(buf))))
            }
        }
    }

    async fn close(&self) {
        self.socket.write().await.take();
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use std::str::FromStr;
    use super::*;

    #[tokio::test]
    async fn test_send_and_receive() {
        let a = UdpTransport::new();
        let b = UdpTransport::new();
        let (_, mtu) = a.bind(SocketAddr::from_str("127.0.0.1:0").unwrap()).await.unwrap();
        assert!(mtu >= 1500);
        let (b_addr, _) = b.bind(SocketAddr::from_str("127.0.0.1:0").unwrap()).await.unwrap();

        a.send_to(b"hello", b_addr, None).await.unwrap();
        let (_, data) = b.receive(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(data.as_ref(), b"hello");

        assert!(b.receive(Duration::from_millis(10)).await.unwrap().is_none());

        b.close().await;
        assert!(matches!(b.receive(Duration::from_millis(10)).await, Err(SocketError::NotBound)));
        assert!(matches!(a.bind(SocketAddr::from_str("127.0.0.1:0").unwrap()).await, Err(SocketError::AlreadyBound)));
    }

    #[tokio::test]
    async fn test_receive_datagram_above_mtu() {
        let a = UdpTransport::new();
        let b = UdpTransport::new();
        a.bind(SocketAddr::from_str("127.0.0.1:0").unwrap()).await.unwrap();
        let (b_addr, _) = b.bind(SocketAddr::from_str("127.0.0.1:0").unwrap()).await.unwrap();

        let payload = (0..4000).map(|i| i as u8).collect::<Vec<_>>();
        a.send_to(&payload, b_addr, None).await.unwrap();
        let (_, data) = b.receive(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(data.as_ref(), payload.as_slice());
    }
}
