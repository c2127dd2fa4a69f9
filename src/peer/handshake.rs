//! The connection handshake, both for outgoing and incoming connections:
//!
//! ```ascii
//! client                                    server
//!   OpenConnectionRequest1 (padded to MTU) ->
//!                                          <- OpenConnectionReply1 (server guid, MTU)
//!   OpenConnectionRequest2 (MTU, guid)     ->
//!                                          <- OpenConnectionReply2 (MTU)      connection created
//!   ConnectionRequest (reliable)           ->
//!                                          <- ConnectionRequestAccepted (reliable)
//!   NewIncomingConnection (reliable)       ->                                 connected
//! ```
//!
//! The offline requests are retried on a timer; a smaller MTU is probed when larger ones get
//!  no answer. Refusals are offline messages naming the reason.

use std::time::Duration;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use crate::addr::{RakNetGuid, SystemAddress};
use crate::connection::state::ConnectionState;
use crate::connection::{Connection, Handshake, HandshakePhase};
use crate::peer::engine::{Outgoing, PeerCore, PeerState};
use crate::peer::error::{RakNetError, RefusalReason};
use crate::peer::packet::{Packet, PacketKind};
use crate::protocol::message_ids::{is_valid_mtu, MAXIMUM_MTU, MINIMUM_MTU};
use crate::protocol::offline::OfflineMessage;
use crate::protocol::online::OnlineMessage;
use crate::protocol::reliability::{PacketPriority, PacketReliability};

impl PeerCore {
    pub(crate) fn on_offline_message(&self, state: &mut PeerState, socket_index: usize, from: SystemAddress, data: &[u8], now: Instant, outgoing: &mut Outgoing) -> anyhow::Result<()> {
        let message = OfflineMessage::deser(data)?;
        trace!("offline message from {}: {:?}", from, message.id());

        if let Some(mtu) = message.announced_mtu() {
            if !is_valid_mtu(mtu) {
                debug!("{:?} from {} with MTU {} outside [{}, {}] - ignoring", message.id(), from, mtu, MINIMUM_MTU, MAXIMUM_MTU);
                return Ok(());
            }
        }

        match message {
            OfflineMessage::UnconnectedPing { time, only_if_open_connections, .. } => {
                if only_if_open_connections && !state.has_free_incoming_slot() {
                    trace!("no open connections - not answering ping from {}", from);
                    return Ok(());
                }
                outgoing.offline(socket_index, from, &OfflineMessage::UnconnectedPong {
                    time,
                    server_guid: self.guid,
                    data: state.offline_ping_response.clone(),
                });
            }
            OfflineMessage::UnconnectedPong { time, server_guid, data } => {
                let ping = Duration::from_millis(self.millis(now).saturating_sub(time));
                outgoing.events.push(Packet::new(from, server_guid, PacketKind::UnconnectedPong { ping, data }));
            }
            OfflineMessage::OpenConnectionRequest1 { protocol_version, mtu } => {
                self.on_open_connection_request1(state, socket_index, from, protocol_version, mtu, now, outgoing);
            }
            OfflineMessage::OpenConnectionRequest2 { mtu, client_guid, .. } => {
                self.on_open_connection_request2(state, socket_index, from, mtu, client_guid, now, outgoing);
            }
            OfflineMessage::OpenConnectionReply1 { server_guid, mtu, .. } => {
                self.on_open_connection_reply1(state, from, server_guid, mtu, now, outgoing);
            }
            OfflineMessage::OpenConnectionReply2 { server_guid, mtu, .. } => {
                self.on_open_connection_reply2(state, from, server_guid, mtu, now, outgoing)?;
            }
            OfflineMessage::IncompatibleProtocolVersion { protocol_version, .. } => {
                self.on_refused(state, from, RefusalReason::IncompatibleProtocolVersion { remote: protocol_version }, outgoing);
            }
            OfflineMessage::AlreadyConnected { .. } => {
                self.on_refused(state, from, RefusalReason::AlreadyConnected, outgoing);
            }
            OfflineMessage::NoFreeIncomingConnections { .. } => {
                self.on_refused(state, from, RefusalReason::NoFreeIncomingConnections, outgoing);
            }
            OfflineMessage::ConnectionBanned { .. } => {
                self.on_refused(state, from, RefusalReason::Banned, outgoing);
            }
            OfflineMessage::IpRecentlyConnected { .. } => {
                self.on_refused(state, from, RefusalReason::IpRecentlyConnected, outgoing);
            }
        }
        Ok(())
    }

    //----------------------------------------- server side

    #[allow(clippy::too_many_arguments)]
    fn on_open_connection_request1(&self, state: &mut PeerState, socket_index: usize, from: SystemAddress, protocol_version: u8, mtu: u16, now: Instant, outgoing: &mut Outgoing) {
        if protocol_version != self.config.protocol_version {
            warn!("connection request from {} with incompatible protocol version {}", from, protocol_version);
            outgoing.offline(socket_index, from, &OfflineMessage::IncompatibleProtocolVersion {
                protocol_version: self.config.protocol_version,
                server_guid: self.guid,
            });
            return;
        }
        if state.security.is_banned(&from.ip(), now) {
            debug!("connection request from banned address {}", from);
            outgoing.offline(socket_index, from, &OfflineMessage::ConnectionBanned { guid: self.guid });
            return;
        }

        let socket_mtu = state.socket_mtu(socket_index).unwrap_or(mtu);
        outgoing.offline(socket_index, from, &OfflineMessage::OpenConnectionReply1 {
            server_guid: self.guid,
            has_security: false,
            mtu: mtu.min(socket_mtu),
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn on_open_connection_request2(&self, state: &mut PeerState, socket_index: usize, from: SystemAddress, mtu: u16, client_guid: RakNetGuid, now: Instant, outgoing: &mut Outgoing) {
        let refuse = |outgoing: &mut Outgoing, message: OfflineMessage| {
            outgoing.offline(socket_index, from, &message);
        };

        if state.security.is_banned(&from.ip(), now) {
            debug!("connection request from banned address {}", from);
            refuse(outgoing, OfflineMessage::ConnectionBanned { guid: self.guid });
            return;
        }

        let socket_mtu = state.socket_mtu(socket_index).unwrap_or(mtu);
        let mtu = mtu.min(socket_mtu);
        let reply = OfflineMessage::OpenConnectionReply2 {
            server_guid: self.guid,
            client_address: from,
            mtu,
            has_security: false,
        };

        if let Some(existing) = state.connections.get(&from) {
            if existing.is_incoming() && existing.state().is_connecting() && existing.guid() == client_guid {
                trace!("repeated open connection request from {} - resending reply", from);
                outgoing.offline(socket_index, from, &reply);
                return;
            }
            if existing.state().is_active() {
                debug!("open connection request from {} which is already connected", from);
                refuse(outgoing, OfflineMessage::AlreadyConnected { guid: self.guid });
                return;
            }
            state.connections.remove(&from);
        }

        if let Some(address) = state.connections.address_of(&client_guid) {
            let is_active = state.connections.get(&address)
                .map(|c| c.state().is_active())
                .unwrap_or(false);
            if is_active {
                debug!("open connection request from {} with GUID {} which is already connected from {}", from, client_guid, address);
                refuse(outgoing, OfflineMessage::AlreadyConnected { guid: self.guid });
                return;
            }
        }

        if !state.has_free_incoming_slot() {
            debug!("no free incoming connections for {}", from);
            refuse(outgoing, OfflineMessage::NoFreeIncomingConnections { guid: self.guid });
            return;
        }

        if state.security.register_attempt(from.ip(), now) {
            debug!("connection attempt from {} too soon after the previous one", from);
            refuse(outgoing, OfflineMessage::IpRecentlyConnected { guid: self.guid });
            return;
        }

        let mut connection = Connection::new_incoming(from, client_guid, socket_index, self.reliability_config.clone(), mtu, state.default_timeout, now);
        connection.transition(ConnectionState::Connecting, now);
        debug!("accepting incoming connection from {} with MTU {}", from, mtu);
        state.connections.insert(connection);

        outgoing.offline(socket_index, from, &reply);
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn on_connection_request(&self, state: &mut PeerState, from: SystemAddress, client_guid: RakNetGuid, request_time: u64, password: Bytes, now: Instant, outgoing: &mut Outgoing) -> anyhow::Result<()> {
        let local_millis = self.millis(now);
        let password_ok = password == state.incoming_password;

        let Some(connection) = state.connections.get_mut(&from) else {
            return Ok(());
        };
        if !connection.is_incoming() || connection.state() != ConnectionState::Connecting || connection.guid() != client_guid {
            debug!("unexpected connection request from {} - ignoring", from);
            return Ok(());
        }

        if !password_ok {
            warn!("connection request from {} with invalid password", from);
            outgoing.send_online(connection, &OnlineMessage::InvalidPassword, PacketPriority::Immediate, PacketReliability::Reliable, 0, now)?;
            connection.transition(ConnectionState::SilentlyDisconnecting, now);
            return Ok(());
        }

        let accepted = OnlineMessage::ConnectionRequestAccepted {
            client_address: from,
            request_time,
            accept_time: local_millis,
        };
        outgoing.send_online(connection, &accepted, PacketPriority::Immediate, PacketReliability::ReliableOrdered, 0, now)?;
        connection.set_request_accepted();
        Ok(())
    }

    pub(crate) fn on_new_incoming_connection(&self, state: &mut PeerState, from: SystemAddress, request_time: u64, accept_time: u64, now: Instant, outgoing: &mut Outgoing) {
        let local_millis = self.millis(now);
        let Some(connection) = state.connections.get_mut(&from) else {
            return;
        };
        if !connection.is_incoming() || !connection.is_request_accepted() {
            debug!("unexpected new incoming connection message from {} - ignoring", from);
            return;
        }

        connection.on_pong(request_time, accept_time, local_millis);
        if connection.state() == ConnectionState::Connecting {
            Self::complete_incoming(connection, now, outgoing);
        }
    }

    //----------------------------------------- client side

    /// Sends the next offline handshake message if it is due, or returns the reason for giving
    ///  up on the connection attempt
    pub(crate) fn drive_handshake(&self, connection: &mut Connection, socket_mtu: u16, now: Instant, outgoing: &mut Outgoing) -> Option<RakNetError> {
        let address = connection.address();
        let socket_index = connection.socket_index();
        let was_pending = connection.state() == ConnectionState::Pending;

        let handshake = connection.handshake.as_mut()?;
        if now >= handshake.deadline {
            return Some(RakNetError::ConnectionTimeout);
        }
        if !handshake.is_offline_phase() || now < handshake.next_attempt_at {
            return None;
        }
        if handshake.attempts_exhausted() {
            return Some(RakNetError::AttemptExhausted { attempts: handshake.attempts_made });
        }

        let message = match handshake.phase {
            HandshakePhase::OpenRequest1 => {
                let mut candidates = self.config.mtu_candidates.iter()
                    .copied()
                    .filter(|mtu| *mtu <= socket_mtu)
                    .collect::<Vec<_>>();
                if candidates.is_empty() {
                    candidates.push(socket_mtu);
                }
                OfflineMessage::OpenConnectionRequest1 {
                    protocol_version: self.config.protocol_version,
                    mtu: handshake.mtu_for_next_attempt(&candidates),
                }
            }
            HandshakePhase::OpenRequest2 { mtu, .. } => OfflineMessage::OpenConnectionRequest2 {
                server_address: address,
                mtu,
                client_guid: self.guid,
            },
            HandshakePhase::ConnectionRequest { .. } => return None,
        };

        handshake.attempts_made += 1;
        handshake.next_attempt_at = now + handshake.time_between_attempts;
        trace!("handshake with {}: attempt {} of {}", address, handshake.attempts_made, handshake.max_attempts);

        if was_pending {
            connection.transition(ConnectionState::Connecting, now);
        }
        outgoing.offline(socket_index, address, &message);
        None
    }

    /// The outgoing connection attempt to `address`, if there is one in the given phase
    fn outgoing_attempt<'a>(state: &'a mut PeerState, address: &SystemAddress, phase_matches: impl Fn(&HandshakePhase) -> bool) -> Option<&'a mut Connection> {
        state.connections.get_mut(address)
            .filter(|c| !c.is_incoming() && c.state().is_connecting())
            .filter(|c| c.handshake.as_ref().map(|h| phase_matches(&h.phase)).unwrap_or(false))
    }

    fn on_open_connection_reply1(&self, state: &mut PeerState, from: SystemAddress, server_guid: RakNetGuid, mtu: u16, now: Instant, outgoing: &mut Outgoing) {
        let socket_mtu = state.connections.get(&from)
            .and_then(|c| state.socket_mtu(c.socket_index()))
            .unwrap_or(mtu);
        let mtu = mtu.min(socket_mtu);

        let Some(connection) = Self::outgoing_attempt(state, &from, |p| matches!(p, HandshakePhase::OpenRequest1)) else {
            trace!("unexpected open connection reply 1 from {} - ignoring", from);
            return;
        };
        connection.on_received(now);
        if let Some(handshake) = connection.handshake.as_mut() {
            handshake.advance_to(HandshakePhase::OpenRequest2 { server_guid, mtu }, now);
        }
        self.drive_handshake(connection, mtu, now, outgoing);
    }

    fn on_open_connection_reply2(&self, state: &mut PeerState, from: SystemAddress, server_guid: RakNetGuid, mtu: u16, now: Instant, outgoing: &mut Outgoing) -> anyhow::Result<()> {
        let is_reply2_phase = |p: &HandshakePhase| matches!(p, HandshakePhase::OpenRequest2 { server_guid: g, .. } if *g == server_guid);

        if Self::outgoing_attempt(state, &from, is_reply2_phase).is_none() {
            if !state.allow_ip_migration {
                trace!("unexpected open connection reply 2 from {} - ignoring", from);
                return Ok(());
            }

            let migrated = state.connections.iter()
                .find(|c| !c.is_incoming() && c.state().is_connecting() && c.handshake.as_ref().map(|h| is_reply2_phase(&h.phase)).unwrap_or(false))
                .map(|c| c.address());
            let Some(original) = migrated else {
                trace!("unexpected open connection reply 2 from {} - ignoring", from);
                return Ok(());
            };
            info!("server {} answered from {} instead of {} - migrating", server_guid, from, original);
            if !state.connections.change_address(&original, from) {
                return Ok(());
            }
        }

        state.connections.set_guid(&from, server_guid);

        let local_millis = self.millis(now);
        let Some(connection) = state.connections.get_mut(&from) else {
            return Ok(());
        };
        let Some(handshake) = connection.handshake.as_mut() else {
            return Ok(());
        };
        let password = handshake.password.clone();
        handshake.advance_to(HandshakePhase::ConnectionRequest { request_time: local_millis }, now);

        connection.on_received(now);
        connection.layer.set_mtu(mtu);
        debug!("open connection reply 2 from {}: MTU {}, sending connection request", from, mtu);

        let request = OnlineMessage::ConnectionRequest {
            client_guid: self.guid,
            time: local_millis,
            password,
        };
        outgoing.send_online(connection, &request, PacketPriority::Immediate, PacketReliability::Reliable, 0, now)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn on_connection_request_accepted(&self, state: &mut PeerState, from: SystemAddress, _client_address: SystemAddress, request_time: u64, accept_time: u64, now: Instant, outgoing: &mut Outgoing) -> anyhow::Result<()> {
        let local_millis = self.millis(now);
        let Some(connection) = Self::outgoing_attempt(state, &from, |p| matches!(p, HandshakePhase::ConnectionRequest { .. })) else {
            debug!("unexpected connection request accepted from {} - ignoring", from);
            return Ok(());
        };

        if !connection.transition(ConnectionState::Connected, now) {
            return Ok(());
        }
        connection.handshake = None;
        connection.on_pong(request_time, accept_time, local_millis);
        info!("connected to {} ({})", from, connection.guid());

        let confirmation = OnlineMessage::NewIncomingConnection {
            server_address: from,
            request_time: accept_time,
            accept_time: local_millis,
        };
        outgoing.send_online(connection, &confirmation, PacketPriority::Immediate, PacketReliability::ReliableOrdered, 0, now)?;
        outgoing.event(connection, PacketKind::ConnectionRequestAccepted);
        outgoing.new_connections.push((connection.address(), connection.guid(), false));
        Ok(())
    }

    /// The remote refused our connection attempt
    pub(crate) fn on_refused(&self, state: &mut PeerState, from: SystemAddress, reason: RefusalReason, outgoing: &mut Outgoing) {
        let is_attempt = state.connections.get(&from)
            .map(|c| !c.is_incoming() && c.state().is_connecting())
            .unwrap_or(false);
        if !is_attempt {
            debug!("refusal ({}) from {} without a connection attempt - ignoring", reason, from);
            return;
        }
        Self::fail_attempt(&mut state.connections, &from, RakNetError::ConnectionRefused { reason }, Instant::now(), outgoing);
    }

    /// Creates the entry for an outgoing connection and sends the first request
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start_connect(
        &self,
        state: &mut PeerState,
        address: SystemAddress,
        password: Bytes,
        socket_index: usize,
        attempts: u32,
        time_between_attempts: Duration,
        timeout: Duration,
        now: Instant,
        outgoing: &mut Outgoing,
    ) -> Result<(), RakNetError> {
        let Some(socket_mtu) = state.socket_mtu(socket_index) else {
            return Err(RakNetError::InvalidArgument(format!("no socket with index {}", socket_index)));
        };

        if let Some(existing) = state.connections.get(&address) {
            if !existing.is_incoming() && existing.state().is_connecting() {
                debug!("connection attempt to {} is already in progress", address);
                return Ok(());
            }
            if existing.state().is_active() {
                return Err(RakNetError::AlreadyConnected(address));
            }
            state.connections.remove(&address);
        }

        if state.num_active_connections() >= state.max_connections {
            return Err(RakNetError::InvalidArgument(format!("maximum number of connections ({}) reached", state.max_connections)));
        }

        let timeout = if timeout.is_zero() {
            state.default_timeout
        }
        else {
            timeout
        };

        let handshake = Handshake::new(password, attempts, time_between_attempts, timeout, now);
        let mut connection = Connection::new_outgoing(address, socket_index, self.reliability_config.clone(), socket_mtu, timeout, handshake, now);
        info!("connecting to {}", address);

        if let Some(e) = self.drive_handshake(&mut connection, socket_mtu, now, outgoing) {
            return Err(e);
        }
        state.connections.insert(connection);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use bytes::BytesMut;
    use rstest::rstest;
    use crate::peer::config::PeerConfig;
    use crate::protocol::message_ids::PROTOCOL_VERSION;
    use crate::socket::BoundSocket;
    use super::*;

    fn server_address() -> SystemAddress {
        SystemAddress::from_str("127.0.0.1|2000").unwrap()
    }

    fn client_address() -> SystemAddress {
        SystemAddress::from_str("127.0.0.1|3000").unwrap()
    }

    async fn started_core() -> PeerCore {
        let core = PeerCore::new(PeerConfig::default()).unwrap();
        {
            let mut state = core.state.write().await;
            state.started = true;
            state.bound = vec![BoundSocket { address: "127.0.0.1:1000".parse().unwrap(), mtu: MAXIMUM_MTU }];
            state.max_connections = 4;
            state.max_incoming = 4;
        }
        core
    }

    fn offline(core: &PeerCore, state: &mut PeerState, from: SystemAddress, message: OfflineMessage) -> Outgoing {
        let mut buf = BytesMut::new();
        message.ser(&mut buf);
        let mut outgoing = Outgoing::default();
        core.on_offline_message(state, 0, from, &buf, Instant::now(), &mut outgoing).unwrap();
        outgoing
    }

    fn phase(state: &PeerState) -> Option<HandshakePhase> {
        state.connections.get(&server_address())
            .and_then(|c| c.handshake.as_ref())
            .map(|h| h.phase)
    }

    async fn connecting_core() -> PeerCore {
        let core = started_core().await;
        {
            let mut state = core.state.write().await;
            let mut outgoing = Outgoing::default();
            core.start_connect(&mut state, server_address(), Bytes::new(), 0, 5, Duration::from_millis(500), Duration::from_secs(10), Instant::now(), &mut outgoing).unwrap();
            assert_eq!(outgoing.datagrams.len(), 1);
        }
        core
    }

    #[rstest]
    #[case::zero(0)]
    #[case::below_udp_header(10)]
    #[case::below_minimum(MINIMUM_MTU - 1)]
    #[case::above_maximum(MAXIMUM_MTU + 1)]
    #[case::huge(u16::MAX)]
    #[tokio::test(start_paused = true)]
    async fn test_request2_with_invalid_mtu_ignored(#[case] mtu: u16) {
        let core = started_core().await;
        let mut state = core.state.write().await;

        let outgoing = offline(&core, &mut state, client_address(), OfflineMessage::OpenConnectionRequest2 {
            server_address: server_address(),
            mtu,
            client_guid: RakNetGuid::from_raw(9),
        });
        assert!(outgoing.datagrams.is_empty());
        assert!(state.connections.is_empty());

        let mut outgoing = Outgoing::default();
        core.update(&mut state, Instant::now(), &mut outgoing);
        assert!(outgoing.datagrams.is_empty());
    }

    #[rstest]
    #[case::below_minimum(100)]
    #[case::above_maximum(2000)]
    #[tokio::test(start_paused = true)]
    async fn test_request1_with_invalid_mtu_ignored(#[case] mtu: u16) {
        let core = started_core().await;
        let mut state = core.state.write().await;

        let outgoing = offline(&core, &mut state, client_address(), OfflineMessage::OpenConnectionRequest1 {
            protocol_version: PROTOCOL_VERSION,
            mtu,
        });
        assert!(outgoing.datagrams.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_incoming_handshake_with_valid_mtu() {
        let core = started_core().await;
        let mut state = core.state.write().await;

        let outgoing = offline(&core, &mut state, client_address(), OfflineMessage::OpenConnectionRequest1 {
            protocol_version: PROTOCOL_VERSION,
            mtu: 576,
        });
        assert_eq!(outgoing.datagrams.len(), 1);
        let reply1 = OfflineMessage::deser(&outgoing.datagrams[0].2).unwrap();
        assert_eq!(reply1.announced_mtu(), Some(576));

        let outgoing = offline(&core, &mut state, client_address(), OfflineMessage::OpenConnectionRequest2 {
            server_address: server_address(),
            mtu: 576,
            client_guid: RakNetGuid::from_raw(9),
        });
        assert_eq!(outgoing.datagrams.len(), 1);
        let connection = state.connections.get(&client_address()).unwrap();
        assert_eq!(connection.mtu(), 576);
        assert!(connection.state().is_connecting());
    }

    #[rstest]
    #[case::below_minimum(100)]
    #[case::above_maximum(2000)]
    #[tokio::test(start_paused = true)]
    async fn test_reply1_with_invalid_mtu_ignored(#[case] mtu: u16) {
        let core = connecting_core().await;
        let mut state = core.state.write().await;

        let outgoing = offline(&core, &mut state, server_address(), OfflineMessage::OpenConnectionReply1 {
            server_guid: RakNetGuid::from_raw(7),
            has_security: false,
            mtu,
        });
        assert!(outgoing.datagrams.is_empty());
        assert_eq!(phase(&state), Some(HandshakePhase::OpenRequest1));
    }

    #[rstest]
    #[case::below_minimum(10)]
    #[case::above_maximum(2000)]
    #[tokio::test(start_paused = true)]
    async fn test_reply2_with_invalid_mtu_ignored(#[case] mtu: u16) {
        let core = connecting_core().await;
        let mut state = core.state.write().await;
        let server_guid = RakNetGuid::from_raw(7);

        let outgoing = offline(&core, &mut state, server_address(), OfflineMessage::OpenConnectionReply1 {
            server_guid,
            has_security: false,
            mtu: 576,
        });
        assert_eq!(outgoing.datagrams.len(), 1);
        assert_eq!(phase(&state), Some(HandshakePhase::OpenRequest2 { server_guid, mtu: 576 }));

        let outgoing = offline(&core, &mut state, server_address(), OfflineMessage::OpenConnectionReply2 {
            server_guid,
            client_address: client_address(),
            mtu,
            has_security: false,
        });
        assert!(outgoing.datagrams.is_empty());
        assert_eq!(phase(&state), Some(HandshakePhase::OpenRequest2 { server_guid, mtu: 576 }));

        let outgoing = offline(&core, &mut state, server_address(), OfflineMessage::OpenConnectionReply2 {
            server_guid,
            client_address: client_address(),
            mtu: 576,
            has_security: false,
        });
        assert!(!outgoing.datagrams.is_empty());
        assert!(matches!(phase(&state), Some(HandshakePhase::ConnectionRequest { .. })));
        assert_eq!(state.connections.get(&server_address()).unwrap().mtu(), 576);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tiny_mtu_request_does_not_break_update() {
        let core = started_core().await;
        let mut buf = BytesMut::new();
        OfflineMessage::OpenConnectionRequest2 {
            server_address: server_address(),
            mtu: 10,
            client_guid: RakNetGuid::from_raw(9),
        }.ser(&mut buf);

        core.on_datagram(0, client_address().into(), buf.freeze()).await;
        core.tick().await;

        let state = core.state.read().await;
        assert!(state.connections.get(&client_address()).is_none());
    }
}
