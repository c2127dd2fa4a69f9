use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use crate::protocol::frame::Frame;
use crate::protocol::reliability::PacketPriority;

/// A frame waiting for (re)transmission, together with the receipt of the message it belongs to.
#[derive(Debug, Clone)]
pub struct QueuedFrame {
    pub frame: Frame,
    pub receipt: Option<u32>,
    pub enqueued_at: Instant,
}

impl QueuedFrame {
    /// Frames that need to stay around after sending, either to be resent or to report their
    ///  receipt
    pub fn needs_tracking(&self) -> bool {
        self.frame.reliability.is_reliable() || self.receipt.is_some()
    }
}

/// One queue per [PacketPriority], drained in a weighted round robin: as long as all queues have
///  frames, each priority gets twice as many frames as the next lower one.
pub struct SendQueue {
    queues: [VecDeque<QueuedFrame>; 4],
    credits: [u32; 4],
}

impl Default for SendQueue {
    fn default() -> Self {
        SendQueue::new()
    }
}

impl SendQueue {
    pub fn new() -> SendQueue {
        SendQueue {
            queues: Default::default(),
            credits: PacketPriority::ALL.map(|p| p.scheduling_weight()),
        }
    }

    pub fn push(&mut self, priority: PacketPriority, frame: QueuedFrame) {
        self.queues[Self::idx(priority)].push_back(frame);
    }

    pub fn len(&self) -> usize {
        self.queues.iter()
            .map(|q| q.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(|q| q.is_empty())
    }

    pub fn has_immediate(&self) -> bool {
        !self.queues[Self::idx(PacketPriority::Immediate)].is_empty()
    }

    fn idx(priority: PacketPriority) -> usize {
        u8::from(priority) as usize
    }

    /// Returns the next frame to send, or only frames with [PacketPriority::Immediate] if
    ///  `immediate_only` is set
    pub fn pop_next(&mut self, immediate_only: bool) -> Option<QueuedFrame> {
        if immediate_only {
            return self.queues[Self::idx(PacketPriority::Immediate)].pop_front();
        }

        if self.is_empty() {
            return None;
        }

        loop {
            for i in 0..self.queues.len() {
                if self.credits[i] > 0 && !self.queues[i].is_empty() {
                    self.credits[i] -= 1;
                    return self.queues[i].pop_front();
                }
            }
            self.credits = PacketPriority::ALL.map(|p| p.scheduling_weight());
        }
    }

    /// Removes unreliable frames that waited longer than `timeout`
    pub fn drain_expired(&mut self, now: Instant, timeout: Duration) -> Vec<QueuedFrame> {
        let mut result = Vec::new();
        for queue in self.queues.iter_mut() {
            let mut retained = VecDeque::with_capacity(queue.len());
            for queued in queue.drain(..) {
                if !queued.frame.reliability.is_reliable() && now.duration_since(queued.enqueued_at) > timeout {
                    result.push(queued);
                }
                else {
                    retained.push_back(queued);
                }
            }
            *queue = retained;
        }
        result
    }

    /// Removes all queued frames, e.g. when the connection is lost
    pub fn clear(&mut self) -> Vec<QueuedFrame> {
        self.queues.iter_mut()
            .flat_map(|q| q.drain(..))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rstest::rstest;
    use crate::protocol::reliability::PacketReliability;
    use super::*;

    fn queued(marker: u8, reliability: PacketReliability, enqueued_at: Instant) -> QueuedFrame {
        QueuedFrame {
            frame: Frame {
                reliability,
                reliable_index: None,
                sequencing_index: None,
                ordering: None,
                split: None,
                payload: Bytes::from(vec![marker]),
            },
            receipt: None,
            enqueued_at,
        }
    }

    fn priority_marker(p: PacketPriority) -> u8 {
        u8::from(p)
    }

    #[test]
    fn test_weighted_round_robin() {
        let now = Instant::now();
        let mut queue = SendQueue::new();
        for p in PacketPriority::ALL {
            for _ in 0..20 {
                queue.push(p, queued(priority_marker(p), PacketReliability::Unreliable, now));
            }
        }

        let first_round = (0..15)
            .map(|_| queue.pop_next(false).unwrap().frame.payload[0])
            .collect::<Vec<_>>();
        assert_eq!(first_round, vec![0,0,0,0,0,0,0,0, 1,1,1,1, 2,2, 3]);

        let second_round = (0..15)
            .map(|_| queue.pop_next(false).unwrap().frame.payload[0])
            .collect::<Vec<_>>();
        assert_eq!(second_round, first_round);
        assert_eq!(queue.len(), 80 - 30);
    }

    #[test]
    fn test_lower_priority_gets_unused_share() {
        let now = Instant::now();
        let mut queue = SendQueue::new();
        for _ in 0..5 {
            queue.push(PacketPriority::Low, queued(3, PacketReliability::Unreliable, now));
        }
        queue.push(PacketPriority::High, queued(1, PacketReliability::Unreliable, now));

        let order = (0..6)
            .map(|_| queue.pop_next(false).unwrap().frame.payload[0])
            .collect::<Vec<_>>();
        assert_eq!(order, vec![1, 3, 3, 3, 3, 3]);
        assert!(queue.pop_next(false).is_none());
        assert!(queue.is_empty());
    }

    #[rstest]
    #[case::only_immediate(true, vec![0])]
    #[case::all(false, vec![0, 2])]
    fn test_immediate_only(#[case] immediate_only: bool, #[case] expected: Vec<u8>) {
        let now = Instant::now();
        let mut queue = SendQueue::new();
        queue.push(PacketPriority::Medium, queued(2, PacketReliability::Unreliable, now));
        queue.push(PacketPriority::Immediate, queued(0, PacketReliability::Unreliable, now));
        assert!(queue.has_immediate());

        let mut actual = Vec::new();
        while let Some(f) = queue.pop_next(immediate_only) {
            actual.push(f.frame.payload[0]);
        }
        assert_eq!(actual, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_expired() {
        let start = Instant::now();
        let mut queue = SendQueue::new();
        queue.push(PacketPriority::Low, queued(1, PacketReliability::Unreliable, start));
        queue.push(PacketPriority::Low, queued(2, PacketReliability::Reliable, start));
        tokio::time::advance(Duration::from_millis(500)).await;
        queue.push(PacketPriority::Low, queued(3, PacketReliability::Unreliable, Instant::now()));

        let expired = queue.drain_expired(Instant::now(), Duration::from_millis(100));
        assert_eq!(expired.iter().map(|f| f.frame.payload[0]).collect::<Vec<_>>(), vec![1]);
        assert_eq!(queue.len(), 2);
    }
}
