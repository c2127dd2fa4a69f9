use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use anyhow::bail;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::connection::ordering::{OrderingChannels, SendChannel};
use crate::connection::receive_window::{DatagramWindow, ReliableIndexWindow, WindowCheck};
use crate::connection::send_queue::{QueuedFrame, SendQueue};
use crate::connection::split_assembler::SplitAssembler;
use crate::protocol::datagram::{AckRanges, DataDatagram, Datagram};
use crate::protocol::frame::{Frame, OrderingInfo, SplitInfo};
use crate::protocol::message_ids::{MAXIMUM_MTU, MINIMUM_MTU, NUM_ORDERING_CHANNELS, UDP_HEADER_SIZE};
use crate::protocol::reliability::{PacketPriority, PacketReliability};
use crate::protocol::seq::Seq24;
use crate::util::exponential_backoff::ExponentialBackoff;
use crate::util::safe_converter::PrecheckedCast;

/// Tuning parameters of the per-connection reliability layer, derived from
///  [crate::peer::config::PeerConfig]
#[derive(Debug, Clone)]
pub struct ReliabilityConfig {
    pub initial_resend_timeout: Duration,
    pub max_resend_timeout: Duration,
    /// growth factor of the resend timeout in eighths, i.e. 12 means 1.5
    pub resend_backoff_factor_eighths: u32,
    pub max_split_parts: u32,
    pub max_pending_splits: usize,
    pub split_timeout: Duration,
    /// maximum number of datagrams that may be missing between the last received and a newly
    ///  received one
    pub max_datagram_gap: u32,
    /// size of the duplicate detection window for reliable messages, must be a power of two
    pub reliable_window_size: u32,
    /// ordered messages further ahead of the next expected one are dropped instead of held back
    pub max_ordering_gap: u32,
    pub unreliable_timeout: Option<Duration>,
    pub max_datagrams_per_tick: usize,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        ReliabilityConfig {
            initial_resend_timeout: Duration::from_millis(300),
            max_resend_timeout: Duration::from_secs(3),
            resend_backoff_factor_eighths: 12,
            max_split_parts: 8192,
            max_pending_splits: 64,
            split_timeout: Duration::from_secs(30),
            max_datagram_gap: 4096,
            reliable_window_size: 16384,
            max_ordering_gap: 16384,
            unreliable_timeout: None,
            max_datagrams_per_tick: 64,
        }
    }
}

/// Notification for a message that was sent with an ack receipt, see
///  [PacketReliability::requires_ack_receipt]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Receipt {
    Acked(u32),
    Lost(u32),
}

/// Everything the reliability layer produces in a single call: datagrams to put on the wire,
///  messages to deliver to the application (in delivery order) and receipts.
#[derive(Debug, Default)]
pub struct LayerOutput {
    pub datagrams: Vec<Bytes>,
    pub delivered: Vec<Bytes>,
    pub receipts: Vec<Receipt>,
}

struct InFlightDatagram {
    resend_at: Instant,
    /// frames that are resent or have a receipt, see [QueuedFrame::needs_tracking]
    frames: Vec<QueuedFrame>,
}

/// The reliability layer of a single connection. It turns messages into frames and frames into
///  datagrams, keeping track of everything that is needed for resending, duplicate detection,
///  reassembly and ordering.
///
/// This is pure bookkeeping without I/O: incoming datagrams are passed in, and outgoing datagrams
///  are returned for the caller to send. All timing is based on the `now` passed into each call.
pub struct ReliabilityLayer {
    config: Arc<ReliabilityConfig>,
    mtu: u16,

    next_datagram_seq: Seq24,
    next_reliable_index: Seq24,
    next_split_id: u16,
    send_channels: Vec<SendChannel>,
    send_queue: SendQueue,
    /// frames from lost datagrams, sent before anything from the regular queues
    resend_queue: VecDeque<QueuedFrame>,
    in_flight: FxHashMap<Seq24, InFlightDatagram>,
    resend_backoff: ExponentialBackoff,
    /// number of frames per receipt that were not acknowledged yet
    pending_receipts: FxHashMap<u32, u32>,
    last_reliable_send: Option<Instant>,

    datagram_window: DatagramWindow,
    reliable_window: ReliableIndexWindow,
    splits: SplitAssembler,
    ordering: OrderingChannels,
    pending_acks: AckRanges,
}

impl ReliabilityLayer {
    pub fn new(config: Arc<ReliabilityConfig>, mtu: u16) -> ReliabilityLayer {
        ReliabilityLayer {
            mtu: mtu.clamp(MINIMUM_MTU, MAXIMUM_MTU),
            next_datagram_seq: Seq24::ZERO,
            next_reliable_index: Seq24::ZERO,
            next_split_id: 0,
            send_channels: vec![SendChannel::default(); NUM_ORDERING_CHANNELS as usize],
            send_queue: SendQueue::new(),
            resend_queue: VecDeque::new(),
            in_flight: FxHashMap::default(),
            resend_backoff: ExponentialBackoff::new(config.initial_resend_timeout, config.max_resend_timeout, config.resend_backoff_factor_eighths),
            pending_receipts: FxHashMap::default(),
            last_reliable_send: None,
            datagram_window: DatagramWindow::new(config.max_datagram_gap),
            reliable_window: ReliableIndexWindow::new(config.reliable_window_size),
            splits: SplitAssembler::new(config.max_split_parts, config.max_pending_splits, config.split_timeout),
            ordering: OrderingChannels::new(config.max_ordering_gap),
            pending_acks: AckRanges::new(),
            config,
        }
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// The MTU is negotiated during the handshake, before any frames are sent
    pub fn set_mtu(&mut self, mtu: u16) {
        self.mtu = mtu.clamp(MINIMUM_MTU, MAXIMUM_MTU);
    }

    fn max_datagram_len(&self) -> usize {
        (self.mtu as usize).saturating_sub(UDP_HEADER_SIZE)
    }

    /// no unacknowledged or unsent data
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && self.resend_queue.is_empty() && self.send_queue.is_empty()
    }

    pub fn has_pending_acks(&self) -> bool {
        !self.pending_acks.is_empty()
    }

    pub fn last_reliable_send(&self) -> Option<Instant> {
        self.last_reliable_send
    }

    /// Splits a message into frames and puts them into the send queue. Messages with
    ///  [PacketPriority::Immediate] should be followed by a call to [ReliabilityLayer::flush]
    ///  with `immediate_only` set.
    pub fn send(
        &mut self,
        payload: Bytes,
        priority: PacketPriority,
        reliability: PacketReliability,
        ordering_channel: u8,
        receipt: Option<u32>,
        now: Instant,
    ) -> anyhow::Result<()> {
        if ordering_channel >= NUM_ORDERING_CHANNELS {
            bail!("ordering channel {} out of range", ordering_channel);
        }
        if payload.is_empty() {
            bail!("empty message");
        }

        let max_frame_len = self.max_datagram_len().saturating_sub(DataDatagram::HEADER_LEN);

        let (reliability, parts) = if Frame::header_len(reliability, false) + payload.len() <= max_frame_len {
            (reliability, vec![payload])
        }
        else {
            let reliability = reliability.upgraded_for_split();
            let part_len = max_frame_len.saturating_sub(Frame::header_len(reliability, true));
            if part_len == 0 {
                bail!("MTU {} leaves no room for split message parts", self.mtu);
            }
            let count = payload.len().div_ceil(part_len);
            if count > self.config.max_split_parts as usize {
                bail!("message of {} bytes would need {} parts, maximum is {}", payload.len(), count, self.config.max_split_parts);
            }
            let parts = (0..count)
                .map(|i| payload.slice(i*part_len .. payload.len().min((i+1)*part_len)))
                .collect::<Vec<_>>();
            (reliability, parts)
        };

        let channel = &mut self.send_channels[ordering_channel as usize];
        let (sequencing_index, ordering) = if reliability.is_sequenced() {
            let index = channel.next_sequenced;
            channel.next_sequenced = index.next();
            (Some(index), Some(OrderingInfo { index: channel.next_ordered, channel: ordering_channel }))
        }
        else if reliability.is_ordered() {
            let index = channel.next_ordered;
            channel.next_ordered = index.next();
            (None, Some(OrderingInfo { index, channel: ordering_channel }))
        }
        else {
            (None, None)
        };

        let split_id = if parts.len() > 1 {
            let id = self.next_split_id;
            self.next_split_id = id.wrapping_add(1);
            Some(id)
        }
        else {
            None
        };

        if let Some(receipt) = receipt {
            let num_parts: u32 = parts.len().prechecked_cast();
            *self.pending_receipts.entry(receipt).or_default() += num_parts;
        }

        trace!("queueing message of {} parts with {:?} at {:?}", parts.len(), reliability, priority);

        let count = parts.len();
        for (index, part) in parts.into_iter().enumerate() {
            let reliable_index = if reliability.is_reliable() {
                let index = self.next_reliable_index;
                self.next_reliable_index = index.next();
                Some(index)
            }
            else {
                None
            };

            self.send_queue.push(priority, QueuedFrame {
                frame: Frame {
                    reliability,
                    reliable_index,
                    sequencing_index,
                    ordering,
                    split: split_id.map(|id| SplitInfo {
                        count: count.prechecked_cast(),
                        id,
                        index: index.prechecked_cast(),
                    }),
                    payload: part,
                },
                receipt,
                enqueued_at: now,
            });
        }
        Ok(())
    }

    /// Handles a connected datagram received from the peer
    pub fn on_datagram(&mut self, data: &[u8], now: Instant, out: &mut LayerOutput) -> anyhow::Result<()> {
        match Datagram::deser(data)? {
            Datagram::Ack(ranges) => {
                self.on_ack(&ranges, out);
            }
            Datagram::Nak(ranges) => {
                self.on_nak(&ranges, out);
            }
            Datagram::Data(datagram) => {
                if let Some(acks) = &datagram.acks {
                    self.on_ack(acks, out);
                }
                self.on_data(datagram, now, out)?;
            }
        }
        Ok(())
    }

    fn on_ack(&mut self, ranges: &AckRanges, out: &mut LayerOutput) {
        for seq in ranges.iter() {
            if let Some(acked) = self.in_flight.remove(&seq) {
                trace!("datagram {} was acknowledged", seq);
                self.resend_backoff.reset();

                for queued in acked.frames {
                    if let Some(receipt) = queued.receipt {
                        self.frame_acked(receipt, out);
                    }
                }
            }
        }
    }

    fn frame_acked(&mut self, receipt: u32, out: &mut LayerOutput) {
        if let Some(remaining) = self.pending_receipts.get_mut(&receipt) {
            *remaining -= 1;
            if *remaining == 0 {
                self.pending_receipts.remove(&receipt);
                out.receipts.push(Receipt::Acked(receipt));
            }
        }
    }

    fn frame_lost(&mut self, receipt: u32, out: &mut LayerOutput) {
        if self.pending_receipts.remove(&receipt).is_some() {
            out.receipts.push(Receipt::Lost(receipt));
        }
    }

    fn on_nak(&mut self, ranges: &AckRanges, out: &mut LayerOutput) {
        for seq in ranges.iter() {
            if let Some(lost) = self.in_flight.remove(&seq) {
                trace!("datagram {} was NAKed", seq);
                self.requeue_lost(lost, out);
            }
        }
    }

    fn requeue_lost(&mut self, lost: InFlightDatagram, out: &mut LayerOutput) {
        for queued in lost.frames {
            if queued.frame.reliability.is_reliable() {
                self.resend_queue.push_back(queued);
            }
            else if let Some(receipt) = queued.receipt {
                self.frame_lost(receipt, out);
            }
        }
    }

    fn on_data(&mut self, datagram: DataDatagram, now: Instant, out: &mut LayerOutput) -> anyhow::Result<()> {
        let seq = datagram.sequence_number;
        match self.datagram_window.on_datagram(seq) {
            WindowCheck::New => {}
            WindowCheck::Duplicate => {
                trace!("duplicate datagram {}", seq);
                self.pending_acks.push(seq);
                return Ok(());
            }
            WindowCheck::BeyondWindow => {
                debug!("datagram {} is beyond the receive window - dropping", seq);
                return Ok(());
            }
        }

        // the datagram is acknowledged unless a reliable frame had to be dropped for being
        //  beyond the window - the sender keeps it and resends it later
        let mut acknowledge = true;

        for frame in datagram.frames {
            if let Some(index) = frame.reliable_index {
                match self.reliable_window.check_and_mark(index) {
                    WindowCheck::New => {}
                    WindowCheck::Duplicate => {
                        trace!("duplicate reliable frame {}", index);
                        continue;
                    }
                    WindowCheck::BeyondWindow => {
                        debug!("reliable frame {} is beyond the receive window - dropping", index);
                        acknowledge = false;
                        continue;
                    }
                }
            }

            if let Some(message) = self.splits.add(frame, now)? {
                out.delivered.extend(self.ordering.on_message(message));
            }
        }

        if acknowledge {
            self.pending_acks.push(seq);
        }
        Ok(())
    }

    /// Assembles and returns datagrams: NAKs, acknowledgements, resends and queued frames. With
    ///  `immediate_only` set, only frames with [PacketPriority::Immediate] are sent and there is
    ///  no resend or timeout handling.
    pub fn flush(&mut self, now: Instant, immediate_only: bool, out: &mut LayerOutput) {
        let max_len = self.max_datagram_len();
        let mut budget = usize::MAX;

        if !immediate_only {
            budget = self.config.max_datagrams_per_tick;
            self.handle_resend_timeouts(now, out);

            if let Some(timeout) = self.config.unreliable_timeout {
                for expired in self.send_queue.drain_expired(now, timeout) {
                    trace!("unreliable frame timed out in the send queue");
                    if let Some(receipt) = expired.receipt {
                        self.frame_lost(receipt, out);
                    }
                }
            }

            self.splits.expire(now);

            let mut naks = self.datagram_window.collect_naks();
            while !naks.is_empty() {
                let chunk = naks.split_off_front(max_len - 1);
                let mut buf = BytesMut::new();
                Datagram::Nak(chunk).ser(&mut buf);
                out.datagrams.push(buf.freeze());
            }
        }

        let mut carry: Option<QueuedFrame> = None;
        while budget > 0 {
            let mut acks = None;
            let mut len = DataDatagram::HEADER_LEN;
            if !self.pending_acks.is_empty() {
                let chunk = self.pending_acks.split_off_front(max_len / 2);
                len += chunk.serialized_len();
                acks = Some(chunk);
            }

            let mut frames = Vec::new();
            loop {
                let next = carry.take()
                    .or_else(|| self.resend_queue.pop_front())
                    .or_else(|| self.send_queue.pop_next(immediate_only));
                let Some(next) = next else {
                    break;
                };
                if len + next.frame.serialized_len() > max_len && (!frames.is_empty() || acks.is_some()) {
                    carry = Some(next);
                    break;
                }
                len += next.frame.serialized_len();
                frames.push(next);
            }

            if frames.is_empty() {
                if let Some(acks) = acks {
                    // nothing to piggy-back on, or no room for it
                    let mut buf = BytesMut::new();
                    Datagram::Ack(acks).ser(&mut buf);
                    out.datagrams.push(buf.freeze());
                    continue;
                }
                break;
            }

            self.send_data_datagram(acks, frames, now, out);
            budget -= 1;
        }

        if let Some(carry) = carry {
            self.resend_queue.push_front(carry);
        }
    }

    fn send_data_datagram(&mut self, acks: Option<AckRanges>, frames: Vec<QueuedFrame>, now: Instant, out: &mut LayerOutput) {
        let seq = self.next_datagram_seq;
        self.next_datagram_seq = seq.next();

        let datagram = DataDatagram {
            acks,
            sequence_number: seq,
            frames: frames.iter().map(|q| q.frame.clone()).collect(),
        };
        let mut buf = BytesMut::with_capacity(self.max_datagram_len());
        Datagram::Data(datagram).ser(&mut buf);
        out.datagrams.push(buf.freeze());

        let tracked = frames.into_iter()
            .filter(|q| q.needs_tracking())
            .collect::<Vec<_>>();
        if tracked.iter().any(|q| q.frame.reliability.is_reliable()) {
            self.last_reliable_send = Some(now);
        }
        if !tracked.is_empty() {
            trace!("sent datagram {} with {} tracked frames", seq, tracked.len());
            self.in_flight.insert(seq, InFlightDatagram {
                resend_at: now + self.resend_backoff.current(),
                frames: tracked,
            });
        }
    }

    fn handle_resend_timeouts(&mut self, now: Instant, out: &mut LayerOutput) {
        let mut timed_out = self.in_flight.iter()
            .filter(|(_, d)| d.resend_at <= now)
            .map(|(seq, _)| *seq)
            .collect::<Vec<_>>();
        if timed_out.is_empty() {
            return;
        }

        // resend in the order of the original datagrams
        let next = self.next_datagram_seq;
        timed_out.sort_by_key(|seq| std::cmp::Reverse(next.distance_from(*seq)));

        debug!("resend timeout for {} datagrams", timed_out.len());
        for seq in timed_out {
            if let Some(lost) = self.in_flight.remove(&seq) {
                self.requeue_lost(lost, out);
            }
        }
        self.resend_backoff.next_timeout();
    }

    /// Gives up on everything that was not acknowledged yet, reporting all outstanding receipts
    ///  as lost. Used when the connection is lost.
    pub fn abandon(&mut self, out: &mut LayerOutput) {
        self.in_flight.clear();
        self.resend_queue.clear();
        self.send_queue.clear();

        let mut receipts = self.pending_receipts.drain()
            .map(|(r, _)| r)
            .collect::<Vec<_>>();
        receipts.sort();
        out.receipts.extend(receipts.into_iter().map(Receipt::Lost));
    }
}
