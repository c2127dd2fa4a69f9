use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;
use crate::addr::{RakNetGuid, SystemAddress};
use crate::connection::reliability_layer::{LayerOutput, Receipt, ReliabilityConfig};
use crate::connection::state::ConnectionState;
use crate::connection::Connection;
use crate::peer::config::PeerConfig;
use crate::peer::connection_table::ConnectionTable;
use crate::peer::error::{RakNetError, RefusalReason};
use crate::peer::packet::{Packet, PacketKind};
use crate::peer::plugin::PluginRegistry;
use crate::peer::security::SecurityLists;
use crate::peer::traits::NO_RECEIPT;
use crate::protocol::message_ids::MINIMUM_MTU;
use crate::protocol::offline::{is_offline_message, OfflineMessage};
use crate::protocol::online::OnlineMessage;
use crate::protocol::reliability::{PacketPriority, PacketReliability};
use crate::socket::{BoundSocket, RakNetSocket, SocketError, SocketEventHandler};

/// Mutable state of a peer, behind a single lock: lookups take the read side, everything that
///  changes connections takes the write side.
pub(crate) struct PeerState {
    pub started: bool,
    pub connections: ConnectionTable,
    pub security: SecurityLists,
    pub max_connections: usize,
    pub max_incoming: usize,
    pub incoming_password: Bytes,
    pub offline_ping_response: Bytes,
    pub occasional_ping: bool,
    pub allow_ip_migration: bool,
    pub default_timeout: Duration,
    pub bound: Vec<BoundSocket>,
    pub update_task: Option<JoinHandle<()>>,
}

impl PeerState {
    fn new(config: &PeerConfig) -> PeerState {
        PeerState {
            started: false,
            connections: ConnectionTable::default(),
            security: SecurityLists::new(config.connection_frequency_window),
            max_connections: 0,
            max_incoming: 0,
            incoming_password: Bytes::new(),
            offline_ping_response: Bytes::new(),
            occasional_ping: false,
            allow_ip_migration: false,
            default_timeout: config.default_timeout,
            bound: Vec::new(),
            update_task: None,
        }
    }

    pub fn num_active_connections(&self) -> usize {
        self.connections.iter()
            .filter(|c| c.state().is_active())
            .count()
    }

    pub fn num_active_incoming(&self) -> usize {
        self.connections.iter()
            .filter(|c| c.is_incoming() && c.state().is_active())
            .count()
    }

    pub fn has_free_incoming_slot(&self) -> bool {
        self.num_active_incoming() < self.max_incoming && self.num_active_connections() < self.max_connections
    }

    pub fn socket_mtu(&self, socket_index: usize) -> Option<u16> {
        self.bound.get(socket_index).map(|b| b.mtu)
    }
}

/// Everything that processing under the state lock wants to do afterwards, when the lock is
///  released: datagrams to send, events for the application and plugin notifications.
#[derive(Default)]
pub(crate) struct Outgoing {
    pub datagrams: Vec<(usize, SystemAddress, Bytes)>,
    pub events: Vec<Packet>,
    pub new_connections: Vec<(SystemAddress, RakNetGuid, bool)>,
    pub closed_connections: Vec<(SystemAddress, RakNetGuid)>,
}

impl Outgoing {
    pub fn offline(&mut self, socket_index: usize, to: SystemAddress, message: &OfflineMessage) {
        let mut buf = BytesMut::new();
        message.ser(&mut buf);
        self.datagrams.push((socket_index, to, buf.freeze()));
    }

    pub fn event(&mut self, connection: &Connection, kind: PacketKind) {
        self.events.push(Packet::new(connection.address(), connection.guid(), kind));
    }

    /// Datagrams and receipts produced by a connection's reliability layer. Delivered messages
    ///  are not touched: they need protocol handling first.
    pub fn layer_output(&mut self, connection: &Connection, out: LayerOutput) {
        for datagram in out.datagrams {
            self.datagrams.push((connection.socket_index(), connection.address(), datagram));
        }
        for receipt in out.receipts {
            let kind = match receipt {
                Receipt::Acked(n) => PacketKind::ReceiptAcked(n),
                Receipt::Lost(n) => PacketKind::ReceiptLoss(n),
            };
            self.event(connection, kind);
        }
    }

    pub fn flush(&mut self, connection: &mut Connection, now: Instant, immediate_only: bool) {
        let mut out = LayerOutput::default();
        connection.layer.flush(now, immediate_only, &mut out);
        self.layer_output(connection, out);
    }

    /// Queues a protocol message on a connection, flushing right away for immediate priority
    pub fn send_online(
        &mut self,
        connection: &mut Connection,
        message: &OnlineMessage,
        priority: PacketPriority,
        reliability: PacketReliability,
        ordering_channel: u8,
        now: Instant,
    ) -> anyhow::Result<()> {
        connection.layer.send(message.to_bytes(), priority, reliability, ordering_channel, None, now)?;
        if priority == PacketPriority::Immediate {
            self.flush(connection, now, true);
        }
        Ok(())
    }

    /// Gives up on all pending data of a connection that ended, reporting lost receipts
    pub fn abandon(&mut self, connection: &mut Connection) {
        let mut out = LayerOutput::default();
        connection.layer.abandon(&mut out);
        self.layer_output(connection, out);
    }
}

pub(crate) struct PeerCore {
    pub config: PeerConfig,
    pub reliability_config: Arc<ReliabilityConfig>,
    pub guid: RakNetGuid,
    epoch: Instant,
    pub state: RwLock<PeerState>,
    pub sockets: RwLock<Vec<Arc<RakNetSocket>>>,
    pub plugins: RwLock<PluginRegistry>,
    events_tx: mpsc::UnboundedSender<Packet>,
    events_rx: Mutex<mpsc::UnboundedReceiver<Packet>>,
    next_receipt: AtomicU32,
}

impl PeerCore {
    pub fn new(config: PeerConfig) -> anyhow::Result<PeerCore> {
        config.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(PeerCore {
            reliability_config: Arc::new(config.reliability.clone()),
            guid: RakNetGuid::random(),
            epoch: Instant::now(),
            state: RwLock::new(PeerState::new(&config)),
            sockets: Default::default(),
            plugins: Default::default(),
            events_tx,
            events_rx: Mutex::new(events_rx),
            next_receipt: AtomicU32::new(1),
            config,
        })
    }

    /// Milliseconds since the peer was created, the time base for all timestamps on the wire
    pub fn millis(&self, now: Instant) -> u64 {
        u64::try_from(now.duration_since(self.epoch).as_millis())
            .unwrap_or(u64::MAX)
    }

    pub fn next_send_receipt(&self) -> u32 {
        self.next_receipt.load(Ordering::Acquire)
    }

    /// Returns the current receipt number and moves on to the next one, skipping [NO_RECEIPT]
    ///  on wrap-around
    pub fn increment_next_send_receipt(&self) -> u32 {
        loop {
            let receipt = self.next_receipt.fetch_add(1, Ordering::AcqRel);
            if receipt != NO_RECEIPT {
                return receipt;
            }
        }
    }

    pub fn push_event(&self, packet: Packet) {
        // the receiver lives as long as self
        let _ = self.events_tx.send(packet);
    }

    pub fn try_receive(&self) -> Option<Packet> {
        self.events_rx.lock()
            .unwrap_or_else(|e| e.into_inner())
            .try_recv()
            .ok()
    }

    /// Sends datagrams and publishes events collected while holding the state lock
    pub async fn dispatch(&self, outgoing: Outgoing) {
        let plugins = self.plugins.read().await.all();

        if !outgoing.datagrams.is_empty() {
            let sockets = self.sockets.read().await.clone();
            for (socket_index, to, data) in outgoing.datagrams {
                for plugin in &plugins {
                    plugin.on_raw_send(&data, to);
                }

                let Some(socket) = sockets.get(socket_index) else {
                    warn!("no socket with index {} - dropping datagram to {}", socket_index, to);
                    continue;
                };
                if let Err(e) = socket.send(&data, to.into(), 0).await {
                    debug!("sending to {} failed: {}", to, e);
                }
            }
        }

        for (address, guid, is_incoming) in outgoing.new_connections {
            for plugin in &plugins {
                plugin.on_new_connection(address, guid, is_incoming);
            }
        }
        for (address, guid) in outgoing.closed_connections {
            for plugin in &plugins {
                plugin.on_closed_connection(address, guid);
            }
        }

        for event in outgoing.events {
            self.push_event(event);
        }
    }

    /// Entry point for every datagram received on any of the peer's sockets
    pub async fn on_datagram(&self, socket_index: usize, from: SocketAddr, data: Bytes) {
        let from = SystemAddress::from(from);
        trace!("received {} bytes from {}", data.len(), from);

        for plugin in self.plugins.read().await.all() {
            plugin.on_raw_receive(&data, from);
        }

        let mut outgoing = Outgoing::default();
        {
            let mut state = self.state.write().await;
            if !state.started {
                debug!("peer is not started - dropping datagram from {}", from);
                return;
            }

            let now = Instant::now();
            let result = if is_offline_message(&data) {
                self.on_offline_message(&mut state, socket_index, from, &data, now, &mut outgoing)
            }
            else {
                self.on_connected_datagram(&mut state, from, &data, now, &mut outgoing)
            };

            if let Err(e) = result {
                let e = RakNetError::ProtocolViolation(e.to_string());
                warn!("dropping datagram from {}: {}", from, e);
            }
        }
        self.dispatch(outgoing).await;
    }

    fn on_connected_datagram(&self, state: &mut PeerState, from: SystemAddress, data: &[u8], now: Instant, outgoing: &mut Outgoing) -> anyhow::Result<()> {
        let Some(connection) = state.connections.get_mut(&from) else {
            debug!("connected datagram from unknown address {} - dropping", from);
            return Ok(());
        };
        if !connection.state().is_active() {
            debug!("datagram for connection {} in state {} - dropping", from, connection.state());
            return Ok(());
        }

        connection.on_received(now);
        let mut out = LayerOutput::default();
        connection.layer.on_datagram(data, now, &mut out)?;
        let delivered = std::mem::take(&mut out.delivered);
        outgoing.layer_output(connection, out);

        for payload in delivered {
            if let Err(e) = self.on_connected_message(state, from, &payload, now, outgoing) {
                let e = RakNetError::ProtocolViolation(e.to_string());
                warn!("dropping message from {}: {}", from, e);
            }
        }
        Ok(())
    }

    /// Handles a single reassembled message that passed ordering / sequencing
    fn on_connected_message(&self, state: &mut PeerState, from: SystemAddress, payload: &Bytes, now: Instant, outgoing: &mut Outgoing) -> anyhow::Result<()> {
        let message = OnlineMessage::deser(payload)?;
        trace!("message from {}: {:?}", from, message.id());

        match message {
            OnlineMessage::ConnectionRequest { client_guid, time, password } => {
                self.on_connection_request(state, from, client_guid, time, password, now, outgoing)
            }
            OnlineMessage::ConnectionRequestAccepted { client_address, request_time, accept_time } => {
                self.on_connection_request_accepted(state, from, client_address, request_time, accept_time, now, outgoing)
            }
            OnlineMessage::NewIncomingConnection { request_time, accept_time, .. } => {
                self.on_new_incoming_connection(state, from, request_time, accept_time, now, outgoing);
                Ok(())
            }
            OnlineMessage::InvalidPassword => {
                self.on_refused(state, from, RefusalReason::InvalidPassword, outgoing);
                Ok(())
            }
            other => {
                let local_millis = self.millis(now);
                let Some(connection) = state.connections.get_mut(&from) else {
                    return Ok(());
                };
                Self::on_session_message(connection, other, local_millis, now, outgoing)
            }
        }
    }

    /// Messages that belong to an established session rather than to the handshake
    fn on_session_message(connection: &mut Connection, message: OnlineMessage, local_millis: u64, now: Instant, outgoing: &mut Outgoing) -> anyhow::Result<()> {
        match message {
            OnlineMessage::ConnectedPing { send_time } => {
                let pong = OnlineMessage::ConnectedPong {
                    ping_time: send_time,
                    pong_time: local_millis,
                };
                outgoing.send_online(connection, &pong, PacketPriority::Immediate, PacketReliability::Unreliable, 0, now)?;
            }
            OnlineMessage::ConnectedPong { ping_time, pong_time } => {
                connection.on_pong(ping_time, pong_time, local_millis);
            }
            OnlineMessage::DisconnectionNotification => {
                match connection.state() {
                    ConnectionState::Connected | ConnectionState::Disconnecting => {
                        info!("connection {} closed by the remote peer", connection.address());
                        connection.transition(ConnectionState::Disconnected, now);
                        outgoing.abandon(connection);
                        // acknowledge the notification, the connection is not flushed any more
                        outgoing.flush(connection, now, true);
                        outgoing.event(connection, PacketKind::DisconnectionNotification);
                        outgoing.closed_connections.push((connection.address(), connection.guid()));
                    }
                    ConnectionState::Pending | ConnectionState::Connecting if connection.is_incoming() => {
                        debug!("incoming connection {} abandoned by the remote peer", connection.address());
                        connection.transition(ConnectionState::SilentlyDisconnecting, now);
                    }
                    _ => {}
                }
            }
            OnlineMessage::User(payload) => {
                if connection.state() == ConnectionState::Connecting && connection.is_incoming() && connection.is_request_accepted() {
                    // the client got our acceptance, its confirmation is still underway
                    Self::complete_incoming(connection, now, outgoing);
                }

                match connection.state() {
                    ConnectionState::Connected | ConnectionState::Disconnecting => {
                        outgoing.event(connection, PacketKind::UserMessage(payload));
                    }
                    state => {
                        debug!("user message from {} in state {} - dropping", connection.address(), state);
                    }
                }
            }
            other => {
                debug!("unexpected {:?} from {} - ignoring", other.id(), connection.address());
            }
        }
        Ok(())
    }

    pub(crate) fn complete_incoming(connection: &mut Connection, now: Instant, outgoing: &mut Outgoing) {
        if connection.transition(ConnectionState::Connected, now) {
            info!("new incoming connection from {} ({})", connection.address(), connection.guid());
            outgoing.event(connection, PacketKind::NewIncomingConnection);
            outgoing.new_connections.push((connection.address(), connection.guid(), true));
        }
    }

    /// Periodic work: handshake retries, timeouts, keep-alives, flushing the send queues and
    ///  retiring connections that ended
    pub fn update(&self, state: &mut PeerState, now: Instant, outgoing: &mut Outgoing) {
        let local_millis = self.millis(now);
        let PeerState { connections, bound, occasional_ping, .. } = state;

        let mut failed = Vec::new();
        let mut evicted = Vec::new();

        for connection in connections.iter_mut() {
            match connection.state() {
                ConnectionState::Pending | ConnectionState::Connecting => {
                    if connection.is_incoming() {
                        if connection.is_timed_out(now) {
                            debug!("incoming connection {} timed out during the handshake", connection.address());
                            connection.transition(ConnectionState::SilentlyDisconnecting, now);
                        }
                    }
                    else {
                        let socket_mtu = bound.get(connection.socket_index())
                            .map(|b| b.mtu)
                            .unwrap_or(MINIMUM_MTU);
                        if let Some(e) = self.drive_handshake(connection, socket_mtu, now, outgoing) {
                            failed.push((connection.address(), e));
                            continue;
                        }
                    }
                }
                ConnectionState::Connected => {
                    if connection.is_timed_out(now) {
                        info!("connection {} timed out", connection.address());
                        connection.transition(ConnectionState::Disconnected, now);
                        outgoing.abandon(connection);
                        outgoing.event(connection, PacketKind::ConnectionLost);
                        outgoing.closed_connections.push((connection.address(), connection.guid()));
                        continue;
                    }

                    let ping = OnlineMessage::ConnectedPing { send_time: local_millis };
                    let ping_reliability = if connection.needs_keepalive(now) {
                        Some(PacketReliability::Reliable)
                    }
                    else if *occasional_ping && connection.needs_occasional_ping(now, self.config.occasional_ping_interval) {
                        Some(PacketReliability::Unreliable)
                    }
                    else {
                        None
                    };
                    if let Some(reliability) = ping_reliability {
                        trace!("pinging {}", connection.address());
                        if let Err(e) = outgoing.send_online(connection, &ping, PacketPriority::High, reliability, 0, now) {
                            warn!("failed to queue ping for {}: {}", connection.address(), e);
                        }
                        connection.on_ping_sent(now);
                    }
                }
                ConnectionState::Disconnecting => {
                    let past_deadline = connection.disconnect_deadline()
                        .map(|d| now >= d)
                        .unwrap_or(true);
                    if connection.layer.is_idle() || past_deadline || connection.is_timed_out(now) {
                        debug!("connection {} finished disconnecting", connection.address());
                        connection.transition(ConnectionState::Disconnected, now);
                        outgoing.abandon(connection);
                        outgoing.closed_connections.push((connection.address(), connection.guid()));
                        continue;
                    }
                }
                ConnectionState::Disconnected => {
                    if now.duration_since(connection.state_since()) >= self.config.dead_connection_retention {
                        connection.transition(ConnectionState::NotConnected, now);
                        evicted.push(connection.address());
                    }
                    continue;
                }
                ConnectionState::SilentlyDisconnecting => {
                    connection.transition(ConnectionState::NotConnected, now);
                    evicted.push(connection.address());
                    continue;
                }
                ConnectionState::NotConnected => {
                    evicted.push(connection.address());
                    continue;
                }
            }

            if connection.state().is_active() {
                outgoing.flush(connection, now, false);
            }
        }

        for (address, e) in failed {
            Self::fail_attempt(connections, &address, e, now, outgoing);
        }
        for address in evicted {
            debug!("evicting connection {}", address);
            connections.remove(&address);
        }
    }

    /// Ends an outgoing connection attempt: the entry is removed and the application is told why
    pub(crate) fn fail_attempt(connections: &mut ConnectionTable, address: &SystemAddress, e: RakNetError, now: Instant, outgoing: &mut Outgoing) {
        let Some(connection) = connections.get_mut(address) else {
            return;
        };
        warn!("connection attempt to {} failed: {}", address, e);
        connection.transition(ConnectionState::SilentlyDisconnecting, now);
        connection.transition(ConnectionState::NotConnected, now);
        outgoing.abandon(connection);
        outgoing.event(connection, PacketKind::ConnectionAttemptFailed(Arc::new(e)));
        connections.remove(address);
    }

    pub async fn tick(&self) {
        let mut outgoing = Outgoing::default();
        {
            let mut state = self.state.write().await;
            if !state.started {
                return;
            }
            self.update(&mut state, Instant::now(), &mut outgoing);
        }
        self.dispatch(outgoing).await;
    }

    /// The update task holds only a weak reference, it ends when the peer is dropped
    pub fn spawn_update_task(self: &Arc<Self>) -> JoinHandle<()> {
        let core = Arc::downgrade(self);
        let interval = self.config.update_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(core) = core.upgrade() else {
                    break;
                };
                core.tick().await;
            }
            debug!("update task stopped");
        })
    }
}

impl Drop for PeerCore {
    fn drop(&mut self) {
        if let Some(task) = self.state.get_mut().update_task.take() {
            task.abort();
        }

        let sockets = std::mem::take(self.sockets.get_mut());
        if sockets.is_empty() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                for socket in sockets {
                    socket.close().await;
                }
            });
        }
    }
}

/// Connects a peer's sockets to the peer. It holds a weak reference to avoid a reference cycle
///  through the sockets' poll tasks.
pub(crate) struct PeerSocketHandler {
    pub core: Weak<PeerCore>,
}

#[async_trait]
impl SocketEventHandler for PeerSocketHandler {
    async fn on_bind(&self, socket_index: usize, bound: BoundSocket) {
        debug!("peer socket {} bound to {:?}", socket_index, bound.address);
    }

    async fn on_send(&self, _socket_index: usize, _to: SocketAddr, _len: usize) {
    }

    async fn on_receive(&self, socket_index: usize, from: SocketAddr, data: Bytes) {
        let Some(core) = self.core.upgrade() else {
            return;
        };

        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
        core.on_datagram(socket_index, from, data)
            .instrument(span)
            .await;
    }

    async fn on_close(&self, socket_index: usize, cause: Option<Arc<SocketError>>) {
        match cause {
            Some(cause) => error!("peer socket {} closed after an error: {}", socket_index, cause),
            None => debug!("peer socket {} closed", socket_index),
        }
    }
}
