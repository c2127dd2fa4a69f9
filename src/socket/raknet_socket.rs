use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, trace};
use crate::protocol::message_ids::{MAXIMUM_MTU, MINIMUM_MTU};
use crate::socket::{SocketError, SocketEventHandler, Transport};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BoundSocket {
    pub address: SocketAddr,
    /// the interface MTU, clamped to the protocol's bounds
    pub mtu: u16,
}

#[derive(Default)]
struct SocketState {
    bound: Option<BoundSocket>,
    closed: bool,
}

/// Owns a single bound [Transport], polling it for incoming datagrams on a task of its own once
///  it is bound.
///
/// Binds and sends serialize on the write side of the state lock, so datagrams leave a socket in
///  the order in which `send` was called. The event handler has a lock of its own: replacing it
///  waits for callbacks that are in progress.
pub struct RakNetSocket {
    index: usize,
    transport: Arc<dyn Transport>,
    poll_interval: Duration,
    state: RwLock<SocketState>,
    handler: RwLock<Option<Arc<dyn SocketEventHandler>>>,
}

impl RakNetSocket {
    pub fn new(index: usize, transport: Arc<dyn Transport>, poll_interval: Duration) -> Result<Arc<RakNetSocket>, SocketError> {
        if poll_interval.is_zero() {
            return Err(SocketError::InvalidPollInterval);
        }

        Ok(Arc::new(RakNetSocket {
            index,
            transport,
            poll_interval,
            state: Default::default(),
            handler: Default::default(),
        }))
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub async fn set_event_handler(&self, handler: Arc<dyn SocketEventHandler>) {
        *self.handler.write().await = Some(handler);
    }

    pub async fn bound(&self) -> Option<BoundSocket> {
        self.state.read().await.bound
    }

    pub async fn is_closed(&self) -> bool {
        self.state.read().await.closed
    }

    /// Binds the socket and starts polling. The MTU is determined from the network interface;
    ///  an MTU below the protocol minimum fails the bind.
    pub async fn bind(self: &Arc<Self>, address: SocketAddr) -> Result<BoundSocket, SocketError> {
        let bound = {
            let mut state = self.state.write().await;
            if state.closed {
                return Err(SocketError::Closed);
            }
            if state.bound.is_some() {
                return Err(SocketError::AlreadyBound);
            }

            let (bound_address, interface_mtu) = self.transport.bind(address).await?;
            let mtu = match clamp_mtu(interface_mtu) {
                Ok(mtu) => mtu,
                Err(e) => {
                    self.transport.close().await;
                    return Err(e);
                }
            };

            let bound = BoundSocket {
                address: bound_address,
                mtu,
            };
            state.bound = Some(bound);
            bound
        };

        info!("socket {} bound to {:?} with MTU {}", self.index, bound.address, bound.mtu);

        if let Some(handler) = self.handler.read().await.as_ref() {
            handler.on_bind(self.index, bound).await;
        }

        tokio::spawn(self.clone().poll_loop());
        Ok(bound)
    }

    /// `ttl` of 0 means the system default
    pub async fn send(&self, data: &[u8], to: SocketAddr, ttl: i32) -> Result<(), SocketError> {
        if ttl < 0 {
            return Err(SocketError::NegativeTtl(ttl));
        }

        {
            let state = self.state.write().await;
            if state.closed {
                return Err(SocketError::Closed);
            }
            if state.bound.is_none() {
                return Err(SocketError::NotBound);
            }

            trace!("socket {}: sending {} bytes to {:?}", self.index, data.len(), to);
            let ttl = if ttl == 0 { None } else { Some(ttl as u32) };
            self.transport.send_to(data, to, ttl).await?;
        }

        if let Some(handler) = self.handler.read().await.as_ref() {
            handler.on_send(self.index, to, data.len()).await;
        }
        Ok(())
    }

    /// Closing is idempotent, only the first call has an effect
    pub async fn close(&self) {
        self.close_with(None).await
    }

    async fn close_with(&self, cause: Option<Arc<SocketError>>) {
        {
            let mut state = self.state.write().await;
            if state.closed {
                return;
            }
            state.closed = true;
            state.bound = None;
        }

        self.transport.close().await;
        info!("socket {} closed", self.index);

        if let Some(handler) = self.handler.read().await.as_ref() {
            handler.on_close(self.index, cause).await;
        }
    }

    async fn poll_loop(self: Arc<Self>) {
        debug!("starting poll loop for socket {}", self.index);

        loop {
            if self.is_closed().await {
                break;
            }

            match self.transport.receive(self.poll_interval).await {
                Ok(Some((from, data))) => {
                    trace!("socket {}: received {} bytes from {:?}", self.index, data.len(), from);
                    if let Some(handler) = self.handler.read().await.as_ref() {
                        handler.on_receive(self.index, from, data).await;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    if self.is_closed().await {
                        break;
                    }
                    error!("socket {}: receive failed, closing: {}", self.index, e);
                    self.close_with(Some(Arc::new(e))).await;
                    break;
                }
            }
        }

        debug!("poll loop for socket {} stopped", self.index);
    }
}

fn clamp_mtu(interface_mtu: u32) -> Result<u16, SocketError> {
    if interface_mtu < MINIMUM_MTU as u32 {
        return Err(SocketError::MtuTooLow {
            mtu: interface_mtu,
            minimum: MINIMUM_MTU,
        });
    }
    Ok(interface_mtu.min(MAXIMUM_MTU as u32) as u16)
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use bytes::Bytes;
    use mockall::predicate::eq;
    use rstest::rstest;
    use crate::socket::{MockSocketEventHandler, MockTransport};
    use crate::test_util::MemoryNetwork;
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        SocketAddr::from_str(s).unwrap()
    }

    #[rstest]
    #[case::loopback(65536, Some(1492))]
    #[case::ethernet(1500, Some(1492))]
    #[case::small(576, Some(576))]
    #[case::minimum(400, Some(400))]
    #[case::too_small(399, None)]
    fn test_clamp_mtu(#[case] interface_mtu: u32, #[case] expected: Option<u16>) {
        assert_eq!(clamp_mtu(interface_mtu).ok(), expected);
    }

    #[test]
    fn test_zero_poll_interval() {
        let network = MemoryNetwork::new(0);
        assert!(matches!(RakNetSocket::new(0, network.transport(), Duration::ZERO), Err(SocketError::InvalidPollInterval)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_twice() {
        let network = MemoryNetwork::new(0);
        let socket = RakNetSocket::new(0, network.transport(), DEFAULT_POLL_INTERVAL).unwrap();
        let bound = socket.bind(addr("127.0.0.1:0")).await.unwrap();
        assert_eq!(bound.mtu, 1492);
        assert_ne!(bound.address.port(), 0);

        assert!(matches!(socket.bind(addr("127.0.0.1:0")).await, Err(SocketError::AlreadyBound)));
        socket.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_checks() {
        let network = MemoryNetwork::new(0);
        let socket = RakNetSocket::new(0, network.transport(), DEFAULT_POLL_INTERVAL).unwrap();
        assert!(matches!(socket.send(b"x", addr("127.0.0.1:1"), 0).await, Err(SocketError::NotBound)));

        socket.bind(addr("127.0.0.1:0")).await.unwrap();
        assert!(matches!(socket.send(b"x", addr("127.0.0.1:1"), -1).await, Err(SocketError::NegativeTtl(-1))));
        socket.send(b"x", addr("127.0.0.1:1"), 0).await.unwrap();

        socket.close().await;
        assert!(matches!(socket.send(b"x", addr("127.0.0.1:1"), 0).await, Err(SocketError::Closed)));
        assert!(matches!(socket.bind(addr("127.0.0.1:0")).await, Err(SocketError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_and_close() {
        let network = MemoryNetwork::new(0);
        let sender = RakNetSocket::new(0, network.transport(), DEFAULT_POLL_INTERVAL).unwrap();
        let receiver = RakNetSocket::new(1, network.transport(), DEFAULT_POLL_INTERVAL).unwrap();

        let mut handler = MockSocketEventHandler::new();
        handler.expect_on_bind()
            .withf(|idx, bound| *idx == 1 && bound.mtu == 1492)
            .times(1)
            .return_const(());
        handler.expect_on_receive()
            .with(eq(1), mockall::predicate::always(), eq(Bytes::from_static(b"hello")))
            .times(1)
            .return_const(());
        handler.expect_on_close()
            .withf(|idx, cause| *idx == 1 && cause.is_none())
            .times(1)
            .return_const(());
        receiver.set_event_handler(Arc::new(handler)).await;

        sender.bind(addr("127.0.0.1:0")).await.unwrap();
        let receiver_addr = receiver.bind(addr("127.0.0.1:0")).await.unwrap().address;

        sender.send(b"hello", receiver_addr, 0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        receiver.close().await;
        receiver.close().await;
        assert!(receiver.is_closed().await);
        assert!(receiver.bound().await.is_none());
        sender.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_error_closes_socket() {
        let mut transport = MockTransport::new();
        transport.expect_bind()
            .returning(|a| Ok((a, 1500)));
        transport.expect_receive()
            .times(1)
            .returning(|_| Err(SocketError::Io(std::io::Error::other("boom"))));
        transport.expect_close()
            .times(1)
            .return_const(());

        let mut handler = MockSocketEventHandler::new();
        handler.expect_on_bind().return_const(());
        handler.expect_on_close()
            .withf(|_, cause| matches!(cause.as_deref(), Some(SocketError::Io(_))))
            .times(1)
            .return_const(());

        let socket = RakNetSocket::new(0, Arc::new(transport), DEFAULT_POLL_INTERVAL).unwrap();
        socket.set_event_handler(Arc::new(handler)).await;
        socket.bind(addr("127.0.0.1:5000")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(socket.is_closed().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mtu_too_low_fails_bind() {
        let mut transport = MockTransport::new();
        transport.expect_bind()
            .returning(|a| Ok((a, 300)));
        transport.expect_close()
            .times(1)
            .return_const(());

        let socket = RakNetSocket::new(0, Arc::new(transport), DEFAULT_POLL_INTERVAL).unwrap();
        assert!(matches!(socket.bind(addr("127.0.0.1:5000")).await, Err(SocketError::MtuTooLow { mtu: 300, .. })));
        assert!(socket.bound().await.is_none());
    }
}
