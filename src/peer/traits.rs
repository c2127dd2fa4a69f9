//! The peer's API, segmented by concern. [crate::peer::RakPeer] implements all of them.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use crate::addr::{AddressOrGuid, RakNetGuid, SystemAddress};
use crate::connection::state::ConnectionState;
use crate::peer::config::SocketDescriptor;
use crate::peer::error::RakNetResult;
use crate::peer::packet::Packet;
use crate::peer::plugin::{PeerPlugin, PluginId};
use crate::protocol::reliability::{PacketPriority, PacketReliability};
use crate::socket::RakNetSocket;

/// returned by [MessageTransfer::send] for messages without an ack receipt
pub const NO_RECEIPT: u32 = 0;

#[async_trait]
pub trait PeerLifecycle {
    /// Binds one socket per descriptor and starts the peer's update task. Fails if the peer is
    ///  started already or if any of the sockets can not be bound, in which case sockets bound
    ///  so far are closed again.
    async fn startup(&self, max_connections: usize, socket_descriptors: &[SocketDescriptor]) -> RakNetResult<()>;

    /// Closes all connections, notifying the remote peers with a disconnection notification
    ///  sent on `ordering_channel` with `priority`. Waits at most `block_duration` for pending
    ///  reliable messages to be acknowledged, then closes the sockets.
    async fn shutdown(&self, block_duration: Duration, ordering_channel: u8, priority: PacketPriority);

    async fn is_active(&self) -> bool;

    fn get_my_guid(&self) -> RakNetGuid;

    async fn get_my_bound_address(&self, socket_index: usize) -> Option<SystemAddress>;

    async fn get_sockets(&self) -> Vec<Arc<RakNetSocket>>;

    async fn attach_plugin(&self, plugin: Arc<dyn PeerPlugin>) -> PluginId;

    async fn detach_plugin(&self, id: PluginId) -> bool;
}

#[async_trait]
pub trait ConnectionManagement {
    /// Starts connecting to a remote peer; the outcome is reported through
    ///  [MessageTransfer::receive]. Connecting to an address with an attempt in progress is a
    ///  no-op.
    async fn connect(
        &self,
        address: SystemAddress,
        password: &[u8],
        socket_index: usize,
        attempts: u32,
        time_between_attempts: Duration,
        timeout: Duration,
    ) -> RakNetResult<()>;

    /// [ConnectionManagement::connect] with the configured defaults for attempts, on socket 0
    async fn connect_default(&self, address: SystemAddress, password: &[u8]) -> RakNetResult<()>;

    /// Stops an outgoing connection attempt without notifying anyone
    async fn cancel_connection_attempt(&self, address: SystemAddress);

    async fn close_connection(&self, target: AddressOrGuid, send_notification: bool, ordering_channel: u8, priority: PacketPriority) -> RakNetResult<()>;

    /// [ConnectionState::NotConnected] for peers without an entry in the connection table
    async fn get_connection_state(&self, target: AddressOrGuid) -> ConnectionState;

    /// addresses of all connected peers
    async fn get_connection_list(&self) -> Vec<SystemAddress>;

    /// addresses and GUIDs of all connected peers
    async fn get_system_list(&self) -> Vec<(SystemAddress, RakNetGuid)>;

    async fn get_number_of_connections(&self) -> usize;

    /// Defaults to 0, i.e. a peer accepts no incoming connections until this is raised. Never
    ///  exceeds the maximum number of connections passed to startup.
    async fn set_maximum_incoming_connections(&self, number_allowed: usize);

    async fn get_maximum_incoming_connections(&self) -> usize;

    async fn set_incoming_password(&self, password: &[u8]);

    async fn get_incoming_password(&self) -> Bytes;

    /// [SystemAddress::ZERO] returns this peer's own GUID
    async fn get_guid_from_address(&self, address: SystemAddress) -> Option<RakNetGuid>;

    async fn get_address_from_guid(&self, guid: RakNetGuid) -> Option<SystemAddress>;

    /// Moves the connection with a given GUID to a new address
    async fn change_system_address(&self, guid: RakNetGuid, address: SystemAddress) -> RakNetResult<()>;

    /// If allowed, a connection reply from a different address than the one connected to is
    ///  accepted if it carries the GUID of the server the handshake started with
    async fn allow_connection_response_ip_migration(&self, allow: bool);

    /// `None` sets the default for new connections and the timeout of all existing ones
    async fn set_timeout_time(&self, timeout: Duration, target: Option<SystemAddress>);

    async fn get_timeout_time(&self, target: Option<SystemAddress>) -> Duration;

    /// The negotiated MTU of a connection, or the largest MTU candidate for `None`
    async fn get_mtu_size(&self, target: Option<SystemAddress>) -> Option<u16>;
}

#[async_trait]
pub trait MessageTransfer {
    /// Sends a message to a connected peer, or with `broadcast` to all connected peers except
    ///  `target` (which may be unassigned). Returns the receipt number for messages with ack
    ///  receipt and [NO_RECEIPT] otherwise; `force_receipt` overrides the number.
    #[allow(clippy::too_many_arguments)]
    async fn send(
        &self,
        payload: Bytes,
        priority: PacketPriority,
        reliability: PacketReliability,
        ordering_channel: u8,
        target: AddressOrGuid,
        broadcast: bool,
        force_receipt: Option<u32>,
    ) -> RakNetResult<u32>;

    /// Sends the concatenation of several payloads as a single message
    #[allow(clippy::too_many_arguments)]
    async fn send_list(
        &self,
        payloads: &[Bytes],
        priority: PacketPriority,
        reliability: PacketReliability,
        ordering_channel: u8,
        target: AddressOrGuid,
        broadcast: bool,
        force_receipt: Option<u32>,
    ) -> RakNetResult<u32>;

    /// Queues a message for this peer's own [MessageTransfer::receive]
    async fn send_loopback(&self, payload: Bytes);

    /// The next event or message, `None` if there is none. This never waits.
    fn receive(&self) -> Option<Packet>;

    fn get_next_send_receipt(&self) -> u32;

    fn increment_next_send_receipt(&self) -> u32;
}

#[async_trait]
pub trait PeerDiagnostics {
    /// Sends an unreliable timestamped ping to a connected peer
    async fn ping(&self, target: AddressOrGuid) -> RakNetResult<()>;

    /// Pings an address without a connection. The answer arrives as
    ///  [crate::peer::PacketKind::UnconnectedPong].
    async fn ping_unconnected(&self, address: SystemAddress, only_reply_on_accepting_connections: bool, socket_index: usize) -> RakNetResult<()>;

    async fn get_average_ping(&self, target: AddressOrGuid) -> Option<Duration>;

    async fn get_last_ping(&self, target: AddressOrGuid) -> Option<Duration>;

    async fn get_lowest_ping(&self, target: AddressOrGuid) -> Option<Duration>;

    /// The remote's clock minus ours in milliseconds, estimated from the ping sample with the
    ///  lowest round trip time
    async fn get_clock_differential(&self, target: AddressOrGuid) -> Option<i64>;

    /// regular unreliable pings for connected peers, for up to date ping statistics
    async fn set_occasional_ping(&self, enabled: bool);

    async fn set_offline_ping_response(&self, data: &[u8]) -> RakNetResult<()>;

    async fn get_offline_ping_response(&self) -> Bytes;
}

#[async_trait]
pub trait PeerSecurity {
    /// A `duration` of zero bans permanently
    async fn add_to_ban_list(&self, ip: IpAddr, duration: Duration);

    async fn remove_from_ban_list(&self, ip: IpAddr);

    async fn clear_ban_list(&self);

    async fn is_banned(&self, ip: IpAddr) -> bool;

    async fn add_to_security_exception_list(&self, ip: IpAddr);

    async fn remove_from_security_exception_list(&self, ip: IpAddr);

    async fn is_in_security_exception_list(&self, ip: IpAddr) -> bool;

    /// Rejects connection attempts from an IP address that attempted to connect very recently
    async fn set_limit_ip_connection_frequency(&self, limit: bool);
}
