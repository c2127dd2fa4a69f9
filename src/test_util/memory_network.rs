use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::trace;
use crate::socket::{SocketError, Transport, TransportFactory};

type Inbox = mpsc::UnboundedSender<(SocketAddr, Bytes)>;

struct NetworkState {
    endpoints: FxHashMap<SocketAddr, Inbox>,
    rng: StdRng,
    loss: f64,
    mtu: u32,
    next_port: u16,
    num_delivered: u64,
    num_dropped: u64,
}

/// An in-memory datagram network for tests. Transports created by the same network can reach
///  each other by their bound addresses. Datagrams are dropped at random with a configurable
///  probability, the random generator is seeded for reproducible runs.
#[derive(Clone)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new(seed: u64) -> MemoryNetwork {
        MemoryNetwork {
            state: Arc::new(Mutex::new(NetworkState {
                endpoints: FxHashMap::default(),
                rng: StdRng::seed_from_u64(seed),
                loss: 0.0,
                mtu: 1500,
                next_port: 40000,
                num_delivered: 0,
                num_dropped: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// probability of a datagram being dropped, between 0.0 and 1.0
    pub fn set_loss(&self, loss: f64) {
        self.lock().loss = loss.clamp(0.0, 1.0);
    }

    /// the interface MTU reported when binding
    pub fn set_mtu(&self, mtu: u32) {
        self.lock().mtu = mtu;
    }

    pub fn num_delivered(&self) -> u64 {
        self.lock().num_delivered
    }

    pub fn num_dropped(&self) -> u64 {
        self.lock().num_dropped
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(MemoryTransport {
            network: self.clone(),
            address: Mutex::new(None),
            inbox: tokio::sync::Mutex::new(None),
        })
    }

    pub fn transport_factory(&self) -> TransportFactory {
        let network = self.clone();
        Arc::new(move || network.transport())
    }
}

struct MemoryTransport {
    network: MemoryNetwork,
    address: Mutex<Option<SocketAddr>>,
    inbox: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<(SocketAddr, Bytes)>>>,
}

impl MemoryTransport {
    fn address(&self) -> Option<SocketAddr> {
        *self.address.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn bind(&self, address: SocketAddr) -> Result<(SocketAddr, u32), SocketError> {
        if self.address().is_some() {
            return Err(SocketError::AlreadyBound);
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let (bound, mtu) = {
            let mut network = self.network.lock();
            let mut bound = address;
            if bound.port() == 0 {
                bound.set_port(network.next_port);
                network.next_port += 1;
            }
            if network.endpoints.contains_key(&bound) {
                return Err(std::io::Error::from(std::io::ErrorKind::AddrInUse).into());
            }
            network.endpoints.insert(bound, sender);
            (bound, network.mtu)
        };

        *self.address.lock().unwrap_or_else(|e| e.into_inner()) = Some(bound);
        *self.inbox.lock().await = Some(receiver);
        Ok((bound, mtu))
    }

    async fn send_to(&self, data: &[u8], to: SocketAddr, _ttl: Option<u32>) -> Result<(), SocketError> {
        let from = self.address().ok_or(SocketError::NotBound)?;

        let mut network = self.network.lock();
        let loss = network.loss;
        if loss > 0.0 && network.rng.gen_bool(loss) {
            trace!("memory network: dropping datagram {:?} -> {:?}", from, to);
            network.num_dropped += 1;
            return Ok(());
        }

        if let Some(inbox) = network.endpoints.get(&to) {
            if inbox.send((from, Bytes::copy_from_slice(data))).is_ok() {
                network.num_delivered += 1;
            }
        }
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<(SocketAddr, Bytes)>, SocketError> {
        let mut inbox = self.inbox.lock().await;
        let Some(inbox) = inbox.as_mut() else {
            return Err(SocketError::NotBound);
        };

        match tokio::time::timeout(timeout, inbox.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(datagram)) => Ok(Some(datagram)),
            Ok(None) => Err(SocketError::Closed),
        }
    }

    async fn close(&self) {
        let address = self.address.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(address) = address {
            self.network.lock().endpoints.remove(&address);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        SocketAddr::from_str(s).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery() {
        let network = MemoryNetwork::new(1);
        let a = network.transport();
        let b = network.transport();
        let (a_addr, mtu) = a.bind(addr("127.0.0.1:0")).await.unwrap();
        assert_eq!(mtu, 1500);
        let (b_addr, _) = b.bind(addr("127.0.0.1:0")).await.unwrap();
        assert_ne!(a_addr, b_addr);

        a.send_to(b"x", b_addr, None).await.unwrap();
        assert_eq!(b.receive(Duration::from_millis(1)).await.unwrap(), Some((a_addr, Bytes::from_static(b"x"))));
        assert_eq!(b.receive(Duration::from_millis(1)).await.unwrap(), None);

        b.close().await;
        a.send_to(b"x", b_addr, None).await.unwrap();
        assert!(b.receive(Duration::from_millis(1)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_address_in_use() {
        let network = MemoryNetwork::new(1);
        network.transport().bind(addr("127.0.0.1:5000")).await.unwrap();
        assert!(network.transport().bind(addr("127.0.0.1:5000")).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loss() {
        let network = MemoryNetwork::new(7);
        network.set_loss(0.5);
        let a = network.transport();
        let b = network.transport();
        a.bind(addr("127.0.0.1:0")).await.unwrap();
        let (b_addr, _) = b.bind(addr("127.0.0.1:0")).await.unwrap();

        for _ in 0..1000 {
            a.send_to(b"x", b_addr, None).await.unwrap();
        }
        assert_eq!(network.num_delivered() + network.num_dropped(), 1000);
        assert!(network.num_dropped() > 400 && network.num_dropped() < 600);
    }
}
