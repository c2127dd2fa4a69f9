use std::cmp::Reverse;
use bit_set::BitSet;
use rustc_hash::FxHashMap;
use tracing::trace;
use crate::protocol::datagram::AckRanges;
use crate::protocol::seq::Seq24;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WindowCheck {
    New,
    Duplicate,
    /// too far ahead of what was received so far to be tracked
    BeyondWindow,
}

#[derive(Debug, Clone, Copy)]
struct MissingDatagram {
    detected_tick: u64,
    nak_sent: bool,
}

/// Tracks received datagram sequence numbers for duplicate detection and NAKs.
///
/// A datagram is 'missing' if it was not received, but a datagram with a higher sequence number
///  was, and it is within `max_gap` of the highest received sequence number. Anything older than
///  the next expected sequence number that is not missing was received before and is a duplicate.
///
/// NAKs are collected once per update tick. To give reordered datagrams a chance to arrive, a
///  missing datagram is *not* included in the first NAK after its absence was detected, but only
///  from the tick after that. Each missing datagram is NAKed only once; if the resent data is
///  lost as well, the sender's resend timeout takes over.
pub struct DatagramWindow {
    next_expected: Seq24,
    missing: FxHashMap<Seq24, MissingDatagram>,
    tick: u64,
    max_gap: u32,
}

impl DatagramWindow {
    pub fn new(max_gap: u32) -> DatagramWindow {
        DatagramWindow {
            next_expected: Seq24::ZERO,
            missing: FxHashMap::default(),
            tick: 0,
            max_gap,
        }
    }

    pub fn on_datagram(&mut self, seq: Seq24) -> WindowCheck {
        if seq == self.next_expected {
            self.next_expected = seq.next();
            return WindowCheck::New;
        }

        if seq.is_newer_than(self.next_expected) {
            let gap = seq.distance_from(self.next_expected);
            if gap > self.max_gap {
                return WindowCheck::BeyondWindow;
            }
            for i in 0..gap {
                self.missing.insert(self.next_expected.wrapping_add(i), MissingDatagram {
                    detected_tick: self.tick,
                    nak_sent: false,
                });
            }
            self.next_expected = seq.next();
            return WindowCheck::New;
        }

        if self.missing.remove(&seq).is_some() {
            WindowCheck::New
        }
        else {
            WindowCheck::Duplicate
        }
    }

    pub fn num_missing(&self) -> usize {
        self.missing.len()
    }

    /// Returns the datagrams to NAK in this tick, oldest first, and advances the tick counter
    pub fn collect_naks(&mut self) -> AckRanges {
        let next_expected = self.next_expected;
        let max_gap = self.max_gap;
        self.missing.retain(|seq, _| next_expected.distance_from(*seq) <= max_gap);

        let mut to_nak = self.missing.iter_mut()
            .filter(|(_, m)| !m.nak_sent && m.detected_tick < self.tick)
            .map(|(seq, m)| {
                m.nak_sent = true;
                *seq
            })
            .collect::<Vec<_>>();
        to_nak.sort_by_key(|seq| Reverse(next_expected.distance_from(*seq)));

        self.tick += 1;

        let mut result = AckRanges::new();
        for seq in to_nak {
            result.push(seq);
        }
        if !result.is_empty() {
            trace!("NAKing datagrams {:?}", result);
        }
        result
    }
}

/// Duplicate detection for reliable message indices.
///
/// Every index below `base` was received. Indices in `[base, base + size)` are tracked in a bit
///  set addressed by `index % size`, which stays consistent across the wrap-around of the 24 bit
///  counter because `size` is a power of two.
pub struct ReliableIndexWindow {
    base: Seq24,
    received: BitSet,
    size: u32,
}

impl ReliableIndexWindow {
    pub fn new(size: u32) -> ReliableIndexWindow {
        assert!(size.is_power_of_two() && size < Seq24::MODULUS / 2);

        ReliableIndexWindow {
            base: Seq24::ZERO,
            received: BitSet::with_capacity(size as usize),
            size,
        }
    }

    fn bit(&self, index: Seq24) -> usize {
        (index.to_raw() % self.size) as usize
    }

    pub fn check_and_mark(&mut self, index: Seq24) -> WindowCheck {
        if self.base.is_newer_than(index) {
            return WindowCheck::Duplicate;
        }
        if index.distance_from(self.base) >= self.size {
            return WindowCheck::BeyondWindow;
        }

        if !self.received.insert(self.bit(index)) {
            return WindowCheck::Duplicate;
        }

        while self.received.contains(self.bit(self.base)) {
            let bit = self.bit(self.base);
            self.received.remove(bit);
            self.base = self.base.next();
        }
        WindowCheck::New
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;
    use WindowCheck::*;

    #[rstest]
    #[case::in_order(vec![0, 1, 2], vec![New, New, New], 0)]
    #[case::duplicate(vec![0, 1, 1, 0], vec![New, New, Duplicate, Duplicate], 0)]
    #[case::gap(vec![0, 3], vec![New, New], 2)]
    #[case::gap_filled(vec![0, 3, 1, 2], vec![New, New, New, New], 0)]
    #[case::gap_filled_twice(vec![0, 3, 1, 1], vec![New, New, New, Duplicate], 1)]
    #[case::beyond_window(vec![0, 12], vec![New, BeyondWindow], 0)]
    #[case::at_window_edge(vec![0, 11], vec![New, New], 10)]
    fn test_datagram_window(#[case] seqs: Vec<u32>, #[case] expected: Vec<WindowCheck>, #[case] expected_missing: usize) {
        let mut window = DatagramWindow::new(10);
        let actual = seqs.into_iter()
            .map(|s| window.on_datagram(Seq24::from_raw(s)))
            .collect::<Vec<_>>();
        assert_eq!(actual, expected);
        assert_eq!(window.num_missing(), expected_missing);
    }

    #[test]
    fn test_datagram_window_wrap() {
        let mut window = DatagramWindow::new(10);
        window.next_expected = Seq24::from_raw(0xff_fffe);
        assert_eq!(window.on_datagram(Seq24::from_raw(1)), New);
        assert_eq!(window.num_missing(), 3);
        assert_eq!(window.on_datagram(Seq24::from_raw(0xff_ffff)), New);
        assert_eq!(window.on_datagram(Seq24::from_raw(0xff_ffff)), Duplicate);
        assert_eq!(window.on_datagram(Seq24::from_raw(0xff_fff0)), Duplicate);
    }

    #[test]
    fn test_nak_grace_tick() {
        let mut window = DatagramWindow::new(100);
        window.on_datagram(Seq24::from_raw(0));
        window.on_datagram(Seq24::from_raw(3));

        // detected in this tick - not NAKed yet
        assert!(window.collect_naks().is_empty());

        window.on_datagram(Seq24::from_raw(6));

        let naks = window.collect_naks();
        assert_eq!(naks.iter().map(|s| s.to_raw()).collect::<Vec<_>>(), vec![1, 2]);

        // 4 and 5 become eligible now, 1 and 2 are not NAKed again
        let naks = window.collect_naks();
        assert_eq!(naks.iter().map(|s| s.to_raw()).collect::<Vec<_>>(), vec![4, 5]);
        assert!(window.collect_naks().is_empty());
    }

    #[test]
    fn test_nak_skips_arrived() {
        let mut window = DatagramWindow::new(100);
        window.on_datagram(Seq24::from_raw(4));
        window.collect_naks();
        window.on_datagram(Seq24::from_raw(2));

        let naks = window.collect_naks();
        assert_eq!(naks.iter().map(|s| s.to_raw()).collect::<Vec<_>>(), vec![0, 1, 3]);
        assert_eq!(naks.ranges().len(), 2);
    }

    #[test]
    fn test_missing_evicted_out_of_window() {
        let mut window = DatagramWindow::new(5);
        window.on_datagram(Seq24::from_raw(2));
        assert_eq!(window.num_missing(), 2);
        for s in 3..10 {
            window.on_datagram(Seq24::from_raw(s));
        }
        window.collect_naks();
        assert_eq!(window.num_missing(), 0);
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2], vec![New, New, New], 3)]
    #[case::duplicate(vec![0, 0], vec![New, Duplicate], 1)]
    #[case::reordered(vec![1, 0, 1], vec![New, New, Duplicate], 2)]
    #[case::hole(vec![0, 2, 3], vec![New, New, New], 1)]
    #[case::beyond_window(vec![8], vec![BeyondWindow], 0)]
    #[case::window_moves(vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10], vec![New; 11], 11)]
    #[case::old(vec![0, 1, 2, 1], vec![New, New, New, Duplicate], 3)]
    fn test_reliable_window(#[case] indices: Vec<u32>, #[case] expected: Vec<WindowCheck>, #[case] expected_base: u32) {
        let mut window = ReliableIndexWindow::new(8);
        let actual = indices.into_iter()
            .map(|i| window.check_and_mark(Seq24::from_raw(i)))
            .collect::<Vec<_>>();
        assert_eq!(actual, expected);
        assert_eq!(window.base, Seq24::from_raw(expected_base));
    }

    #[test]
    fn test_reliable_window_wrap() {
        let mut window = ReliableIndexWindow::new(8);
        window.base = Seq24::from_raw(0xff_fffe);
        assert_eq!(window.check_and_mark(Seq24::from_raw(0)), New);
        assert_eq!(window.check_and_mark(Seq24::from_raw(0xff_fffe)), New);
        assert_eq!(window.check_and_mark(Seq24::from_raw(0xff_ffff)), New);
        assert_eq!(window.base, Seq24::from_raw(1));
        assert_eq!(window.check_and_mark(Seq24::from_raw(0)), Duplicate);
    }
}
