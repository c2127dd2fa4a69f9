use std::fmt::{Debug, Formatter};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use anyhow::bail;
use crate::connection::reliability_layer::ReliabilityConfig;
use crate::protocol::datagram::MAX_RANGE_LEN;
use crate::protocol::message_ids::{MAXIMUM_MTU, MINIMUM_MTU, PROTOCOL_VERSION};
use crate::protocol::seq::Seq24;
use crate::socket::raknet_socket::DEFAULT_POLL_INTERVAL;
use crate::socket::{Transport, TransportFactory, UdpTransport};

/// A local endpoint for [crate::peer::PeerLifecycle::startup] to bind a socket to
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SocketDescriptor {
    pub address: SocketAddr,
}

impl SocketDescriptor {
    /// all IPv4 interfaces, port 0 for a port picked by the system
    pub fn new(port: u16) -> SocketDescriptor {
        SocketDescriptor {
            address: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)),
        }
    }

    pub fn with_address(address: SocketAddr) -> SocketDescriptor {
        SocketDescriptor { address }
    }
}

pub struct PeerConfig {
    /// Interval of the update task that flushes send queues, handles resends, timeouts and
    ///  keep-alives. Messages with a priority other than `Immediate` wait for the next update.
    pub update_interval: Duration,
    /// upper bound for the time a socket's poll task waits for a datagram in a single poll
    pub poll_interval: Duration,

    /// Connections are lost if nothing is received from the remote for this long (or ten times
    ///  the average ping if that is longer)
    pub default_timeout: Duration,
    /// How long disconnected entries stay in the connection table before they are evicted
    pub dead_connection_retention: Duration,

    /// MTU sizes probed during the connection handshake, in descending order
    pub mtu_candidates: Vec<u16>,
    pub protocol_version: u8,

    pub reliability: ReliabilityConfig,

    /// interval of the unreliable pings sent if occasional pings are switched on
    pub occasional_ping_interval: Duration,
    /// window for rejecting repeated connection attempts from the same IP address, if limiting
    ///  is switched on
    pub connection_frequency_window: Duration,
    /// maximum size of the payload returned in response to unconnected pings
    pub max_offline_ping_response_len: usize,

    pub default_connect_attempts: u32,
    pub default_time_between_connect_attempts: Duration,

    pub transport_factory: TransportFactory,
}

impl Debug for PeerConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConfig")
            .field("update_interval", &self.update_interval)
            .field("poll_interval", &self.poll_interval)
            .field("default_timeout", &self.default_timeout)
            .field("dead_connection_retention", &self.dead_connection_retention)
            .field("mtu_candidates", &self.mtu_candidates)
            .field("protocol_version", &self.protocol_version)
            .field("reliability", &self.reliability)
            .finish_non_exhaustive()
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfig {
            update_interval: Duration::from_millis(10),
            poll_interval: DEFAULT_POLL_INTERVAL,
            default_timeout: Duration::from_secs(10),
            dead_connection_retention: Duration::from_secs(1),
            mtu_candidates: vec![MAXIMUM_MTU, 1200, 576],
            protocol_version: PROTOCOL_VERSION,
            reliability: ReliabilityConfig::default(),
            occasional_ping_interval: Duration::from_secs(30),
            connection_frequency_window: Duration::from_millis(100),
            max_offline_ping_response_len: 400,
            default_connect_attempts: 6,
            default_time_between_connect_attempts: Duration::from_millis(1000),
            transport_factory: Arc::new(|| Arc::new(UdpTransport::new()) as Arc<dyn Transport>),
        }
    }
}

impl PeerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.update_interval.is_zero() {
            bail!("update interval must be greater than zero");
        }
        if self.poll_interval.is_zero() {
            bail!("poll interval must be greater than zero");
        }
        if self.default_timeout.is_zero() {
            bail!("default timeout must be greater than zero");
        }

        if self.mtu_candidates.is_empty() {
            bail!("at least one MTU candidate is required");
        }
        for mtu in &self.mtu_candidates {
            if !(MINIMUM_MTU..=MAXIMUM_MTU).contains(mtu) {
                bail!("MTU candidate {} is outside of [{}, {}]", mtu, MINIMUM_MTU, MAXIMUM_MTU);
            }
        }
        if self.mtu_candidates.windows(2).any(|w| w[0] <= w[1]) {
            bail!("MTU candidates must be in descending order");
        }

        let reliability = &self.reliability;
        if reliability.initial_resend_timeout.is_zero() || reliability.initial_resend_timeout > reliability.max_resend_timeout {
            bail!("initial resend timeout must be greater than zero and not exceed the maximum resend timeout");
        }
        if reliability.resend_backoff_factor_eighths < 8 {
            bail!("resend backoff factor must be at least 8 (i.e. 1.0)");
        }
        if reliability.max_split_parts == 0 {
            bail!("maximum number of split parts must be greater than zero");
        }
        if reliability.max_datagram_gap == 0 || reliability.max_datagram_gap >= MAX_RANGE_LEN {
            bail!("maximum datagram gap must be in [1, {})", MAX_RANGE_LEN);
        }
        if !reliability.reliable_window_size.is_power_of_two() || reliability.reliable_window_size >= Seq24::MODULUS / 2 {
            bail!("reliable window size must be a power of two below {}", Seq24::MODULUS / 2);
        }
        if reliability.max_ordering_gap == 0 || reliability.max_ordering_gap >= Seq24::MODULUS / 2 {
            bail!("maximum ordering gap must be in [1, {})", Seq24::MODULUS / 2);
        }
        if reliability.max_datagrams_per_tick == 0 {
            bail!("maximum datagrams per tick must be greater than zero");
        }

        if self.default_connect_attempts == 0 {
            bail!("default connect attempts must be greater than zero");
        }
        Ok(())
    }
}
