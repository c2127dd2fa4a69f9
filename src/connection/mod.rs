//! Per-connection state: the connection's lifecycle, its reliability layer, round trip time
//!  statistics and (for outgoing connections) the progress of the handshake.

pub mod ordering;
pub mod receive_window;
pub mod reliability_layer;
pub mod send_queue;
pub mod split_assembler;
pub mod state;

use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, warn};
use crate::addr::{RakNetGuid, SystemAddress};
use crate::connection::reliability_layer::{ReliabilityConfig, ReliabilityLayer};
use crate::connection::state::ConnectionState;
use crate::util::rolling_data::RollingData;

/// number of round trip samples that ping statistics are based on
pub const NUM_PING_SAMPLES: usize = 5;

/// How far an outgoing connection attempt got. The offline phases are retried on a timer, the
///  connection request is sent reliably and needs no retries of its own.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HandshakePhase {
    OpenRequest1,
    OpenRequest2 {
        server_guid: RakNetGuid,
        mtu: u16,
    },
    ConnectionRequest {
        request_time: u64,
    },
}

#[derive(Debug, Clone)]
pub struct Handshake {
    pub phase: HandshakePhase,
    pub password: Bytes,
    pub max_attempts: u32,
    pub attempts_made: u32,
    pub time_between_attempts: Duration,
    pub next_attempt_at: Instant,
    /// bounds the time without progress; moved forward whenever the remote answers
    pub timeout: Duration,
    pub deadline: Instant,
}

impl Handshake {
    pub fn new(password: Bytes, max_attempts: u32, time_between_attempts: Duration, timeout: Duration, now: Instant) -> Handshake {
        Handshake {
            phase: HandshakePhase::OpenRequest1,
            password,
            max_attempts,
            attempts_made: 0,
            time_between_attempts,
            next_attempt_at: now,
            timeout,
            deadline: now + timeout,
        }
    }

    pub fn advance_to(&mut self, phase: HandshakePhase, now: Instant) {
        self.phase = phase;
        self.attempts_made = 0;
        self.next_attempt_at = now;
        self.deadline = now + self.timeout;
    }

    pub fn is_offline_phase(&self) -> bool {
        !matches!(self.phase, HandshakePhase::ConnectionRequest { .. })
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts_made >= self.max_attempts
    }

    /// Picks the MTU to probe with for the next attempt: the candidates are tried in descending
    ///  order, each for an equal share of the attempts
    pub fn mtu_for_next_attempt(&self, candidates: &[u16]) -> u16 {
        let idx = (self.attempts_made as usize * candidates.len()) / (self.max_attempts.max(1) as usize);
        candidates[idx.min(candidates.len() - 1)]
    }
}

/// A single entry of the connection table.
pub struct Connection {
    address: SystemAddress,
    guid: RakNetGuid,
    socket_index: usize,
    incoming: bool,
    state: ConnectionState,
    state_since: Instant,
    pub layer: ReliabilityLayer,
    pub handshake: Option<Handshake>,
    /// incoming only: the connection request was accepted, waiting for the client to confirm
    request_accepted: bool,

    last_received: Instant,
    timeout: Duration,
    disconnect_deadline: Option<Instant>,

    pings: RollingData<NUM_PING_SAMPLES>,
    /// round trip time and clock differential of the sample with the lowest round trip time
    clock_sample: Option<(u64, i64)>,
    last_ping_sent: Option<Instant>,
}

impl Connection {
    pub fn new_outgoing(
        address: SystemAddress,
        socket_index: usize,
        reliability_config: Arc<ReliabilityConfig>,
        mtu: u16,
        timeout: Duration,
        handshake: Handshake,
        now: Instant,
    ) -> Connection {
        Self::new(address, RakNetGuid::UNASSIGNED, socket_index, false, reliability_config, mtu, timeout, Some(handshake), now)
    }

    pub fn new_incoming(
        address: SystemAddress,
        guid: RakNetGuid,
        socket_index: usize,
        reliability_config: Arc<ReliabilityConfig>,
        mtu: u16,
        timeout: Duration,
        now: Instant,
    ) -> Connection {
        Self::new(address, guid, socket_index, true, reliability_config, mtu, timeout, None, now)
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        address: SystemAddress,
        guid: RakNetGuid,
        socket_index: usize,
        incoming: bool,
        reliability_config: Arc<ReliabilityConfig>,
        mtu: u16,
        timeout: Duration,
        handshake: Option<Handshake>,
        now: Instant,
    ) -> Connection {
        Connection {
            address,
            guid,
            socket_index,
            incoming,
            state: ConnectionState::Pending,
            state_since: now,
            layer: ReliabilityLayer::new(reliability_config, mtu),
            handshake,
            request_accepted: false,
            last_received: now,
            timeout,
            disconnect_deadline: None,
            pings: RollingData::new(),
            clock_sample: None,
            last_ping_sent: None,
        }
    }

    pub fn address(&self) -> SystemAddress {
        self.address
    }

    pub fn set_address(&mut self, address: SystemAddress) {
        self.address = address;
    }

    pub fn guid(&self) -> RakNetGuid {
        self.guid
    }

    pub fn set_guid(&mut self, guid: RakNetGuid) {
        self.guid = guid;
    }

    pub fn socket_index(&self) -> usize {
        self.socket_index
    }

    pub fn is_incoming(&self) -> bool {
        self.incoming
    }

    pub fn is_request_accepted(&self) -> bool {
        self.request_accepted
    }

    pub fn set_request_accepted(&mut self) {
        self.request_accepted = true;
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn state_since(&self) -> Instant {
        self.state_since
    }

    pub fn mtu(&self) -> u16 {
        self.layer.mtu()
    }

    /// Moves to a new state if the state machine permits it, returning `false` otherwise
    pub fn transition(&mut self, new_state: ConnectionState, now: Instant) -> bool {
        if !self.state.can_transition_to(new_state) {
            warn!("connection {}: rejecting state transition {} -> {}", self.address, self.state, new_state);
            return false;
        }
        debug!("connection {}: {} -> {}", self.address, self.state, new_state);
        self.state = new_state;
        self.state_since = now;
        true
    }

    pub fn on_received(&mut self, now: Instant) {
        self.last_received = now;
    }

    pub fn last_received(&self) -> Instant {
        self.last_received
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// The configured timeout, but at least ten times the average round trip time so slow links
    ///  do not time out spuriously
    pub fn effective_timeout(&self) -> Duration {
        match self.average_ping() {
            Some(ping) => self.timeout.max(ping * 10),
            None => self.timeout,
        }
    }

    pub fn is_timed_out(&self, now: Instant) -> bool {
        now.duration_since(self.last_received) > self.effective_timeout()
    }

    pub fn disconnect_deadline(&self) -> Option<Instant> {
        self.disconnect_deadline
    }

    pub fn start_disconnecting(&mut self, deadline: Instant, now: Instant) -> bool {
        if self.transition(ConnectionState::Disconnecting, now) {
            self.disconnect_deadline = Some(deadline);
            true
        }
        else {
            false
        }
    }

    /// true if a keep-alive ping is due: nothing reliable was sent for half the timeout, so the
    ///  remote would otherwise not hear from us
    pub fn needs_keepalive(&self, now: Instant) -> bool {
        let last_activity = self.layer.last_reliable_send()
            .unwrap_or(self.state_since)
            .max(self.state_since);
        now.duration_since(last_activity) >= self.effective_timeout() / 2
    }

    pub fn needs_occasional_ping(&self, now: Instant, interval: Duration) -> bool {
        match self.last_ping_sent {
            Some(t) => now.duration_since(t) >= interval,
            None => now.duration_since(self.state_since) >= interval,
        }
    }

    pub fn on_ping_sent(&mut self, now: Instant) {
        self.last_ping_sent = Some(now);
    }

    /// Registers a round trip measurement. Times are in milliseconds, `ping_time` and `now` on
    ///  the local clock, `remote_time` on the remote clock at the time it answered.
    pub fn on_pong(&mut self, ping_time: u64, remote_time: u64, now: u64) {
        if ping_time > now {
            debug!("connection {}: pong from the future - ignoring", self.address);
            return;
        }
        let rtt = now - ping_time;
        self.pings.add_value(rtt as f64);

        let is_better = match self.clock_sample {
            Some((best_rtt, _)) => rtt <= best_rtt,
            None => true,
        };
        if is_better {
            let differential = remote_time as i64 - (ping_time + rtt / 2) as i64;
            self.clock_sample = Some((rtt, differential));
        }
    }

    pub fn average_ping(&self) -> Option<Duration> {
        self.pings.mean().map(millis)
    }

    pub fn last_ping(&self) -> Option<Duration> {
        self.pings.last().map(millis)
    }

    pub fn lowest_ping(&self) -> Option<Duration> {
        self.pings.min().map(millis)
    }

    /// remote clock minus local clock in milliseconds
    pub fn clock_differential(&self) -> Option<i64> {
        self.clock_sample.map(|(_, d)| d)
    }
}

fn millis(value: f64) -> Duration {
    Duration::from_micros((value * 1000.0) as u64)
}
