use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::time::Instant;
use tracing::{debug, info};
use crate::addr::{AddressOrGuid, RakNetGuid, SystemAddress};
use crate::connection::state::ConnectionState;
use crate::connection::Connection;
use crate::peer::config::{PeerConfig, SocketDescriptor};
use crate::peer::engine::{Outgoing, PeerCore, PeerSocketHandler, PeerState};
use crate::peer::error::{RakNetError, RakNetResult};
use crate::peer::packet::{Packet, PacketKind};
use crate::peer::plugin::{PeerPlugin, PluginId};
use crate::peer::traits::{ConnectionManagement, MessageTransfer, PeerDiagnostics, PeerLifecycle, PeerSecurity, NO_RECEIPT};
use crate::protocol::message_ids::NUM_ORDERING_CHANNELS;
use crate::protocol::offline::OfflineMessage;
use crate::protocol::online::OnlineMessage;
use crate::protocol::reliability::{PacketPriority, PacketReliability};
use crate::socket::RakNetSocket;

/// A peer: it can connect to other peers and accept connections from them, exchanging messages
///  with the delivery guarantees of [PacketReliability].
///
/// Cloning is cheap, clones refer to the same peer.
#[derive(Clone)]
pub struct RakPeer {
    core: Arc<PeerCore>,
}

impl RakPeer {
    pub fn new(config: PeerConfig) -> anyhow::Result<RakPeer> {
        Ok(RakPeer {
            core: Arc::new(PeerCore::new(config)?),
        })
    }

    pub fn config(&self) -> &PeerConfig {
        &self.core.config
    }

    async fn started_state(&self) -> RakNetResult<tokio::sync::RwLockWriteGuard<'_, PeerState>> {
        let state = self.core.state.write().await;
        if !state.started {
            return Err(RakNetError::NotStarted);
        }
        Ok(state)
    }

    /// Applies a read-only query to the connection a reference resolves to
    async fn with_connection<T>(&self, target: &AddressOrGuid, f: impl FnOnce(&Connection) -> Option<T>) -> Option<T> {
        let state = self.core.state.read().await;
        let address = state.connections.resolve(target)?;
        state.connections.get(&address).and_then(f)
    }

    fn check_channel(ordering_channel: u8) -> RakNetResult<()> {
        if ordering_channel >= NUM_ORDERING_CHANNELS {
            return Err(RakNetError::InvalidArgument(format!("ordering channel {} out of range, maximum is {}", ordering_channel, NUM_ORDERING_CHANNELS - 1)));
        }
        Ok(())
    }

    /// Starts disconnecting a connection; the connection is not resolved again
    #[allow(clippy::too_many_arguments)]
    fn close_in_state(state: &mut PeerState, address: SystemAddress, send_notification: bool, ordering_channel: u8, priority: PacketPriority, deadline: Option<Instant>, now: Instant, outgoing: &mut Outgoing) -> RakNetResult<()> {
        let Some(connection) = state.connections.get_mut(&address) else {
            return Ok(());
        };

        match connection.state() {
            ConnectionState::Connected => {
                if send_notification {
                    outgoing.send_online(connection, &OnlineMessage::DisconnectionNotification, priority, PacketReliability::ReliableOrdered, ordering_channel, now)
                        .map_err(|e| RakNetError::InvalidArgument(e.to_string()))?;
                    let deadline = deadline.unwrap_or(now + connection.effective_timeout());
                    connection.start_disconnecting(deadline, now);
                }
                else {
                    connection.transition(ConnectionState::Disconnected, now);
                    outgoing.abandon(connection);
                    outgoing.closed_connections.push((connection.address(), connection.guid()));
                }
            }
            ConnectionState::Pending | ConnectionState::Connecting => {
                debug!("closing connection {} before it was established", address);
                connection.transition(ConnectionState::SilentlyDisconnecting, now);
                outgoing.abandon(connection);
            }
            _ => {}
        }
        Ok(())
    }
}

#[async_trait]
impl PeerLifecycle for RakPeer {
    async fn startup(&self, max_connections: usize, socket_descriptors: &[SocketDescriptor]) -> RakNetResult<()> {
        if socket_descriptors.is_empty() {
            return Err(RakNetError::InvalidArgument("at least one socket descriptor is required".to_string()));
        }
        if max_connections == 0 {
            return Err(RakNetError::InvalidArgument("maximum number of connections must be greater than zero".to_string()));
        }

        let mut state = self.core.state.write().await;
        if state.started {
            return Err(RakNetError::AlreadyStarted);
        }

        let mut sockets: Vec<Arc<RakNetSocket>> = Vec::new();
        let mut bound = Vec::new();
        for (index, descriptor) in socket_descriptors.iter().enumerate() {
            let result = async {
                let socket = RakNetSocket::new(index, (self.core.config.transport_factory)(), self.core.config.poll_interval)?;
                socket.set_event_handler(Arc::new(PeerSocketHandler { core: Arc::downgrade(&self.core) })).await;
                let b = socket.bind(descriptor.address).await?;
                Ok::<_, RakNetError>((socket, b))
            }.await;

            match result {
                Ok((socket, b)) => {
                    sockets.push(socket);
                    bound.push(b);
                }
                Err(e) => {
                    for socket in sockets {
                        socket.close().await;
                    }
                    return Err(e);
                }
            }
        }

        *self.core.sockets.write().await = sockets;
        state.bound = bound;
        state.started = true;
        state.max_connections = max_connections;
        state.max_incoming = state.max_incoming.min(max_connections);
        state.update_task = Some(self.core.spawn_update_task());
        info!("peer {} started on {:?}", self.core.guid, state.bound.iter().map(|b| b.address).collect::<Vec<_>>());
        drop(state);

        for plugin in self.core.plugins.read().await.all() {
            plugin.on_startup();
        }
        Ok(())
    }

    async fn shutdown(&self, block_duration: Duration, ordering_channel: u8, priority: PacketPriority) {
        let now = Instant::now();
        let deadline = now + block_duration;

        let mut outgoing = Outgoing::default();
        {
            let Ok(mut state) = self.started_state().await else {
                return;
            };
            info!("shutting down peer {}", self.core.guid);
            for address in state.connections.addresses() {
                if let Err(e) = Self::close_in_state(&mut state, address, true, ordering_channel.min(NUM_ORDERING_CHANNELS - 1), priority, Some(deadline), now, &mut outgoing) {
                    debug!("failed to notify {} of the shutdown: {}", address, e);
                }
            }
        }
        self.core.dispatch(outgoing).await;

        // the update task completes disconnects as the remote peers acknowledge
        loop {
            let disconnecting = self.core.state.read().await.connections.iter()
                .any(|c| c.state() == ConnectionState::Disconnecting);
            if !disconnecting || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.core.config.update_interval).await;
        }

        let mut outgoing = Outgoing::default();
        {
            let mut state = self.core.state.write().await;
            if let Some(task) = state.update_task.take() {
                task.abort();
            }

            let now = Instant::now();
            for connection in state.connections.iter_mut() {
                if connection.state().is_active() {
                    outgoing.flush(connection, now, false);
                }
                if connection.state() == ConnectionState::Disconnecting || connection.state().is_connected() {
                    connection.transition(ConnectionState::Disconnected, now);
                    outgoing.closed_connections.push((connection.address(), connection.guid()));
                }
                outgoing.abandon(connection);
            }
            state.connections.clear();
            state.started = false;
            state.bound.clear();
        }
        self.core.dispatch(outgoing).await;

        let sockets = std::mem::take(&mut *self.core.sockets.write().await);
        for socket in sockets {
            socket.close().await;
        }

        for plugin in self.core.plugins.read().await.all() {
            plugin.on_shutdown();
        }
        info!("peer {} shut down", self.core.guid);
    }

    async fn is_active(&self) -> bool {
        self.core.state.read().await.started
    }

    fn get_my_guid(&self) -> RakNetGuid {
        self.core.guid
    }

    async fn get_my_bound_address(&self, socket_index: usize) -> Option<SystemAddress> {
        self.core.state.read().await.bound
            .get(socket_index)
            .map(|b| b.address.into())
    }

    async fn get_sockets(&self) -> Vec<Arc<RakNetSocket>> {
        self.core.sockets.read().await.clone()
    }

    async fn attach_plugin(&self, plugin: Arc<dyn PeerPlugin>) -> PluginId {
        self.core.plugins.write().await.attach(plugin)
    }

    async fn detach_plugin(&self, id: PluginId) -> bool {
        self.core.plugins.write().await.detach(id)
    }
}

#[async_trait]
impl ConnectionManagement for RakPeer {
    async fn connect(
        &self,
        address: SystemAddress,
        password: &[u8],
        socket_index: usize,
        attempts: u32,
        time_between_attempts: Duration,
        timeout: Duration,
    ) -> RakNetResult<()> {
        if address.is_zero() {
            return Err(RakNetError::InvalidArgument("can not connect to the zero address".to_string()));
        }
        if attempts == 0 {
            return Err(RakNetError::InvalidArgument("at least one connection attempt is required".to_string()));
        }

        let mut outgoing = Outgoing::default();
        {
            let mut state = self.started_state().await?;
            self.core.start_connect(&mut state, address, Bytes::copy_from_slice(password), socket_index, attempts, time_between_attempts, timeout, Instant::now(), &mut outgoing)?;
        }
        self.core.dispatch(outgoing).await;
        Ok(())
    }

    async fn connect_default(&self, address: SystemAddress, password: &[u8]) -> RakNetResult<()> {
        let config = &self.core.config;
        self.connect(address, password, 0, config.default_connect_attempts, config.default_time_between_connect_attempts, Duration::ZERO).await
    }

    async fn cancel_connection_attempt(&self, address: SystemAddress) {
        let mut state = self.core.state.write().await;
        let now = Instant::now();
        if let Some(connection) = state.connections.get_mut(&address) {
            if !connection.is_incoming() && connection.state().is_connecting() {
                info!("cancelling connection attempt to {}", address);
                connection.transition(ConnectionState::SilentlyDisconnecting, now);
                state.connections.remove(&address);
            }
        }
    }

    async fn close_connection(&self, target: AddressOrGuid, send_notification: bool, ordering_channel: u8, priority: PacketPriority) -> RakNetResult<()> {
        Self::check_channel(ordering_channel)?;

        let mut outgoing = Outgoing::default();
        {
            let mut state = self.started_state().await?;
            let Some(address) = state.connections.resolve(&target) else {
                return Err(RakNetError::UnknownTarget(target));
            };
            debug!("closing connection to {}", address);
            Self::close_in_state(&mut state, address, send_notification, ordering_channel, priority, None, Instant::now(), &mut outgoing)?;
        }
        self.core.dispatch(outgoing).await;
        Ok(())
    }

    async fn get_connection_state(&self, target: AddressOrGuid) -> ConnectionState {
        self.with_connection(&target, |c| Some(c.state())).await
            .unwrap_or(ConnectionState::NotConnected)
    }

    async fn get_connection_list(&self) -> Vec<SystemAddress> {
        self.get_system_list().await
            .into_iter()
            .map(|(address, _)| address)
            .collect()
    }

    async fn get_system_list(&self) -> Vec<(SystemAddress, RakNetGuid)> {
        let state = self.core.state.read().await;
        let mut result = state.connections.iter()
            .filter(|c| c.state().is_connected())
            .map(|c| (c.address(), c.guid()))
            .collect::<Vec<_>>();
        result.sort();
        result
    }

    async fn get_number_of_connections(&self) -> usize {
        self.core.state.read().await.connections.iter()
            .filter(|c| c.state().is_connected())
            .count()
    }

    async fn set_maximum_incoming_connections(&self, number_allowed: usize) {
        let mut state = self.core.state.write().await;
        state.max_incoming = if state.started {
            number_allowed.min(state.max_connections)
        }
        else {
            number_allowed
        };
    }

    async fn get_maximum_incoming_connections(&self) -> usize {
        self.core.state.read().await.max_incoming
    }

    async fn set_incoming_password(&self, password: &[u8]) {
        self.core.state.write().await.incoming_password = Bytes::copy_from_slice(password);
    }

    async fn get_incoming_password(&self) -> Bytes {
        self.core.state.read().await.incoming_password.clone()
    }

    async fn get_guid_from_address(&self, address: SystemAddress) -> Option<RakNetGuid> {
        if address.is_zero() {
            return Some(self.core.guid);
        }
        self.with_connection(&address.into(), |c| Some(c.guid()).filter(|g| !g.is_unassigned())).await
    }

    async fn get_address_from_guid(&self, guid: RakNetGuid) -> Option<SystemAddress> {
        self.core.state.read().await.connections.address_of(&guid)
    }

    async fn change_system_address(&self, guid: RakNetGuid, address: SystemAddress) -> RakNetResult<()> {
        let mut state = self.core.state.write().await;
        let Some(current) = state.connections.address_of(&guid) else {
            return Err(RakNetError::UnknownTarget(guid.into()));
        };
        if !state.connections.change_address(&current, address) {
            return Err(RakNetError::AlreadyConnected(address));
        }
        info!("connection {} moved from {} to {}", guid, current, address);
        Ok(())
    }

    async fn allow_connection_response_ip_migration(&self, allow: bool) {
        self.core.state.write().await.allow_ip_migration = allow;
    }

    async fn set_timeout_time(&self, timeout: Duration, target: Option<SystemAddress>) {
        let mut state = self.core.state.write().await;
        match target {
            Some(address) => {
                if let Some(connection) = state.connections.get_mut(&address) {
                    connection.set_timeout(timeout);
                }
            }
            None => {
                state.default_timeout = timeout;
                for connection in state.connections.iter_mut() {
                    connection.set_timeout(timeout);
                }
            }
        }
    }

    async fn get_timeout_time(&self, target: Option<SystemAddress>) -> Duration {
        let state = self.core.state.read().await;
        target
            .and_then(|address| state.connections.get(&address))
            .map(|c| c.timeout())
            .unwrap_or(state.default_timeout)
    }

    async fn get_mtu_size(&self, target: Option<SystemAddress>) -> Option<u16> {
        match target {
            Some(address) => self.with_connection(&address.into(), |c| Some(c.mtu())).await,
            None => self.core.config.mtu_candidates.first().copied(),
        }
    }
}

#[async_trait]
impl MessageTransfer for RakPeer {
    async fn send(
        &self,
        payload: Bytes,
        priority: PacketPriority,
        reliability: PacketReliability,
        ordering_channel: u8,
        target: AddressOrGuid,
        broadcast: bool,
        force_receipt: Option<u32>,
    ) -> RakNetResult<u32> {
        Self::check_channel(ordering_channel)?;
        if payload.is_empty() {
            return Err(RakNetError::InvalidArgument("empty message".to_string()));
        }

        let receipt = match force_receipt {
            Some(receipt) => receipt,
            None if reliability.requires_ack_receipt() => self.core.increment_next_send_receipt(),
            None => NO_RECEIPT,
        };
        let tracked_receipt = Some(receipt).filter(|_| reliability.requires_ack_receipt());
        let message = OnlineMessage::User(payload).to_bytes();

        let mut outgoing = Outgoing::default();
        {
            let mut state = self.started_state().await?;
            let now = Instant::now();

            let targets = if broadcast {
                let excluded = state.connections.resolve(&target);
                state.connections.iter()
                    .filter(|c| c.state().is_connected() && Some(c.address()) != excluded)
                    .map(|c| c.address())
                    .collect::<Vec<_>>()
            }
            else {
                let address = state.connections.resolve(&target)
                    .filter(|a| state.connections.get(a).map(|c| c.state().is_connected()).unwrap_or(false))
                    .ok_or(RakNetError::UnknownTarget(target))?;
                vec![address]
            };

            for address in targets {
                let Some(connection) = state.connections.get_mut(&address) else {
                    continue;
                };
                connection.layer.send(message.clone(), priority, reliability, ordering_channel, tracked_receipt, now)
                    .map_err(|e| RakNetError::InvalidArgument(e.to_string()))?;
                if priority == PacketPriority::Immediate {
                    outgoing.flush(connection, now, true);
                }
            }
        }
        self.core.dispatch(outgoing).await;
        Ok(receipt)
    }

    async fn send_list(
        &self,
        payloads: &[Bytes],
        priority: PacketPriority,
        reliability: PacketReliability,
        ordering_channel: u8,
        target: AddressOrGuid,
        broadcast: bool,
        force_receipt: Option<u32>,
    ) -> RakNetResult<u32> {
        let mut buf = BytesMut::with_capacity(payloads.iter().map(|p| p.len()).sum());
        for payload in payloads {
            buf.extend_from_slice(payload);
        }
        self.send(buf.freeze(), priority, reliability, ordering_channel, target, broadcast, force_receipt).await
    }

    async fn send_loopback(&self, payload: Bytes) {
        let address = self.get_my_bound_address(0).await
            .unwrap_or(SystemAddress::ZERO);
        self.core.push_event(Packet::new(address, self.core.guid, PacketKind::UserMessage(payload)));
    }

    fn receive(&self) -> Option<Packet> {
        self.core.try_receive()
    }

    fn get_next_send_receipt(&self) -> u32 {
        self.core.next_send_receipt()
    }

    fn increment_next_send_receipt(&self) -> u32 {
        self.core.increment_next_send_receipt()
    }
}

#[async_trait]
impl PeerDiagnostics for RakPeer {
    async fn ping(&self, target: AddressOrGuid) -> RakNetResult<()> {
        let mut outgoing = Outgoing::default();
        {
            let mut state = self.started_state().await?;
            let now = Instant::now();
            let ping = OnlineMessage::ConnectedPing { send_time: self.core.millis(now) };

            let address = state.connections.resolve(&target)
                .ok_or(RakNetError::UnknownTarget(target))?;
            let connection = state.connections.get_mut(&address)
                .filter(|c| c.state().is_connected())
                .ok_or(RakNetError::UnknownTarget(target))?;
            outgoing.send_online(connection, &ping, PacketPriority::Immediate, PacketReliability::Unreliable, 0, now)
                .map_err(|e| RakNetError::InvalidArgument(e.to_string()))?;
            connection.on_ping_sent(now);
        }
        self.core.dispatch(outgoing).await;
        Ok(())
    }

    async fn ping_unconnected(&self, address: SystemAddress, only_reply_on_accepting_connections: bool, socket_index: usize) -> RakNetResult<()> {
        let mut outgoing = Outgoing::default();
        {
            let state = self.started_state().await?;
            if state.bound.get(socket_index).is_none() {
                return Err(RakNetError::InvalidArgument(format!("no socket with index {}", socket_index)));
            }
            outgoing.offline(socket_index, address, &OfflineMessage::UnconnectedPing {
                time: self.core.millis(Instant::now()),
                client_guid: self.core.guid,
                only_if_open_connections: only_reply_on_accepting_connections,
            });
        }
        self.core.dispatch(outgoing).await;
        Ok(())
    }

    async fn get_average_ping(&self, target: AddressOrGuid) -> Option<Duration> {
        self.with_connection(&target, |c| c.average_ping()).await
    }

    async fn get_last_ping(&self, target: AddressOrGuid) -> Option<Duration> {
        self.with_connection(&target, |c| c.last_ping()).await
    }

    async fn get_lowest_ping(&self, target: AddressOrGuid) -> Option<Duration> {
        self.with_connection(&target, |c| c.lowest_ping()).await
    }

    async fn get_clock_differential(&self, target: AddressOrGuid) -> Option<i64> {
        self.with_connection(&target, |c| c.clock_differential()).await
    }

    async fn set_occasional_ping(&self, enabled: bool) {
        self.core.state.write().await.occasional_ping = enabled;
    }

    async fn set_offline_ping_response(&self, data: &[u8]) -> RakNetResult<()> {
        let max_len = self.core.config.max_offline_ping_response_len;
        if data.len() > max_len {
            return Err(RakNetError::InvalidArgument(format!("offline ping response has {} bytes, maximum is {}", data.len(), max_len)));
        }
        self.core.state.write().await.offline_ping_response = Bytes::copy_from_slice(data);
        Ok(())
    }

    async fn get_offline_ping_response(&self) -> Bytes {
        self.core.state.read().await.offline_ping_response.clone()
    }
}

#[async_trait]
impl PeerSecurity for RakPeer {
    async fn add_to_ban_list(&self, ip: IpAddr, duration: Duration) {
        info!("banning {} for {:?}", ip, duration);
        self.core.state.write().await.security.ban(ip, duration, Instant::now());
    }

    async fn remove_from_ban_list(&self, ip: IpAddr) {
        self.core.state.write().await.security.unban(&ip);
    }

    async fn clear_ban_list(&self) {
        self.core.state.write().await.security.clear_bans();
    }

    async fn is_banned(&self, ip: IpAddr) -> bool {
        self.core.state.write().await.security.is_banned(&ip, Instant::now())
    }

    async fn add_to_security_exception_list(&self, ip: IpAddr) {
        self.core.state.write().await.security.add_exception(ip);
    }

    async fn remove_from_security_exception_list(&self, ip: IpAddr) {
        self.core.state.write().await.security.remove_exception(&ip);
    }

    async fn is_in_security_exception_list(&self, ip: IpAddr) -> bool {
        self.core.state.read().await.security.is_exception(&ip)
    }

    async fn set_limit_ip_connection_frequency(&self, limit: bool) {
        self.core.state.write().await.security.set_limit_connection_frequency(limit);
    }
}
