use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};
use crate::protocol::frame::Frame;
use crate::protocol::message_ids::NUM_ORDERING_CHANNELS;
use crate::protocol::seq::Seq24;

#[derive(Default)]
struct ReceiveChannel {
    next_ordered: Seq24,
    held_back: FxHashMap<Seq24, Bytes>,
    highest_sequenced: Option<Seq24>,
}

/// Receiver side of the ordering channels. Ordered messages are held back until all earlier
///  messages of their channel were delivered, sequenced messages are dropped if a newer one on
///  the same channel was delivered before. Ordered and sequenced messages use independent
///  counters, so they do not interfere even on the same channel.
///
/// This operates on complete messages, i.e. after split messages were reassembled.
///
/// Ordered messages more than `max_gap` ahead of the next expected index are dropped, which
///  bounds the number of held back messages per channel.
pub struct OrderingChannels {
    channels: Vec<ReceiveChannel>,
    max_gap: u32,
}

impl OrderingChannels {
    pub fn new(max_gap: u32) -> OrderingChannels {
        OrderingChannels {
            channels: (0..NUM_ORDERING_CHANNELS).map(|_| ReceiveChannel::default()).collect(),
            max_gap,
        }
    }

    pub fn num_held_back(&self) -> usize {
        self.channels.iter()
            .map(|c| c.held_back.len())
            .sum()
    }

    /// Returns the payloads that become deliverable through this message, in delivery order
    pub fn on_message(&mut self, frame: Frame) -> Vec<Bytes> {
        let ordering = match frame.ordering {
            Some(o) if frame.reliability.has_ordering_channel() => o,
            _ => return vec![frame.payload],
        };

        let channel = match self.channels.get_mut(ordering.channel as usize) {
            Some(c) => c,
            None => {
                debug!("message for ordering channel {} - dropping", ordering.channel);
                return vec![];
            }
        };

        if frame.reliability.is_sequenced() {
            let index = match frame.sequencing_index {
                Some(i) => i,
                None => return vec![],
            };
            if let Some(highest) = channel.highest_sequenced {
                if !index.is_newer_than(highest) {
                    trace!("dropping stale sequenced message {} on channel {} (highest: {})", index, ordering.channel, highest);
                    return vec![];
                }
            }
            channel.highest_sequenced = Some(index);
            return vec![frame.payload];
        }

        if ordering.index != channel.next_ordered {
            if ordering.index.distance_from(channel.next_ordered) > self.max_gap && ordering.index.is_newer_than(channel.next_ordered) {
                debug!("ordered message {} on channel {} is too far ahead of {} - dropping", ordering.index, ordering.channel, channel.next_ordered);
            }
            else if ordering.index.is_newer_than(channel.next_ordered) {
                trace!("holding back ordered message {} on channel {}, waiting for {}", ordering.index, ordering.channel, channel.next_ordered);
                channel.held_back.insert(ordering.index, frame.payload);
            }
            else {
                trace!("dropping old ordered message {} on channel {}", ordering.index, ordering.channel);
            }
            return vec![];
        }

        let mut result = vec![frame.payload];
        channel.next_ordered = channel.next_ordered.next();
        while let Some(payload) = channel.held_back.remove(&channel.next_ordered) {
            result.push(payload);
            channel.next_ordered = channel.next_ordered.next();
        }
        result
    }
}

/// Sender side counters of an ordering channel
#[derive(Debug, Default, Clone, Copy)]
pub struct SendChannel {
    pub next_ordered: Seq24,
    pub next_sequenced: Seq24,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use crate::protocol::frame::OrderingInfo;
    use crate::protocol::reliability::PacketReliability;
    use super::*;

    const MAX_GAP: u32 = 16;

    fn ordered(index: u32, channel: u8, payload: u8) -> Frame {
        Frame {
            reliability: PacketReliability::ReliableOrdered,
            reliable_index: Some(Seq24::ZERO),
            sequencing_index: None,
            ordering: Some(OrderingInfo { index: Seq24::from_raw(index), channel }),
            split: None,
            payload: Bytes::from(vec![payload]),
        }
    }

    fn sequenced(index: u32, channel: u8, payload: u8) -> Frame {
        Frame {
            reliability: PacketReliability::UnreliableSequenced,
            reliable_index: None,
            sequencing_index: Some(Seq24::from_raw(index)),
            ordering: Some(OrderingInfo { index: Seq24::ZERO, channel }),
            split: None,
            payload: Bytes::from(vec![payload]),
        }
    }

    fn deliver_all(channels: &mut OrderingChannels, frames: Vec<Frame>) -> Vec<u8> {
        frames.into_iter()
            .flat_map(|f| channels.on_message(f))
            .map(|b| b[0])
            .collect()
    }

    #[test]
    fn test_sequenced_drops_stale() {
        let mut channels = OrderingChannels::new(MAX_GAP);
        let delivered = deliver_all(&mut channels, vec![
            sequenced(1, 0, 1),
            sequenced(3, 0, 3),
            sequenced(2, 0, 2),
            sequenced(4, 0, 4),
        ]);
        assert_eq!(delivered, vec![1, 3, 4]);
    }

    #[test]
    fn test_ordered_holds_back() {
        let mut channels = OrderingChannels::new(MAX_GAP);
        let delivered = deliver_all(&mut channels, vec![
            ordered(0, 0, 1),
            ordered(2, 0, 3),
        ]);
        assert_eq!(delivered, vec![1]);
        assert_eq!(channels.num_held_back(), 1);

        assert_eq!(deliver_all(&mut channels, vec![ordered(1, 0, 2)]), vec![2, 3]);
        assert_eq!(channels.num_held_back(), 0);
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2], vec![0, 1, 2])]
    #[case::swapped(vec![1, 0, 2], vec![0, 1, 2])]
    #[case::reversed(vec![3, 2, 1, 0], vec![0, 1, 2, 3])]
    #[case::duplicate(vec![0, 0, 1], vec![0, 1])]
    #[case::duplicate_held_back(vec![2, 2, 1, 0], vec![0, 1, 2])]
    #[case::gap(vec![0, 2, 3], vec![0])]
    fn test_ordered(#[case] indices: Vec<u32>, #[case] expected: Vec<u8>) {
        let mut channels = OrderingChannels::new(MAX_GAP);
        let frames = indices.iter()
            .map(|&i| ordered(i, 4, i as u8))
            .collect();
        assert_eq!(deliver_all(&mut channels, frames), expected);
    }

    #[test]
    fn test_channels_are_independent() {
        let mut channels = OrderingChannels::new(MAX_GAP);
        let delivered = deliver_all(&mut channels, vec![
            ordered(1, 0, 11),
            ordered(0, 1, 20),
            sequenced(5, 0, 50),
            sequenced(1, 1, 60),
            ordered(0, 0, 10),
        ]);
        assert_eq!(delivered, vec![20, 50, 60, 10, 11]);
    }

    #[test]
    fn test_unordered_passes_through() {
        let mut channels = OrderingChannels::new(MAX_GAP);
        let frame = Frame {
            reliability: PacketReliability::Reliable,
            reliable_index: Some(Seq24::ZERO),
            sequencing_index: None,
            ordering: None,
            split: None,
            payload: Bytes::from_static(&[9]),
        };
        assert_eq!(deliver_all(&mut channels, vec![frame.clone(), frame]), vec![9, 9]);
    }

    #[test]
    fn test_invalid_channel_dropped() {
        let mut channels = OrderingChannels::new(MAX_GAP);
        assert!(deliver_all(&mut channels, vec![ordered(0, NUM_ORDERING_CHANNELS, 1)]).is_empty());
    }

    #[test]
    fn test_far_ahead_not_held_back() {
        let mut channels = OrderingChannels::new(MAX_GAP);
        let frames = (1..10_000)
            .map(|i| ordered(i * 7, 2, 0))
            .collect();
        assert!(deliver_all(&mut channels, frames).is_empty());
        assert!(channels.num_held_back() <= MAX_GAP as usize);

        // the edge of the window is still held back
        let mut channels = OrderingChannels::new(MAX_GAP);
        assert!(deliver_all(&mut channels, vec![ordered(MAX_GAP, 0, 2), ordered(MAX_GAP + 1, 0, 3)]).is_empty());
        assert_eq!(channels.num_held_back(), 1);
    }

    #[test]
    fn test_flood_bounded_per_channel() {
        let mut channels = OrderingChannels::new(MAX_GAP);
        for channel in 0..NUM_ORDERING_CHANNELS {
            let frames = (1..1000)
                .map(|i| ordered(i, channel, 0))
                .collect();
            assert!(deliver_all(&mut channels, frames).is_empty());
        }
        assert_eq!(channels.num_held_back(), MAX_GAP as usize * NUM_ORDERING_CHANNELS as usize);
    }
}
