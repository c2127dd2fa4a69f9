use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use crate::protocol::frame::Frame;
use crate::protocol::seq::Seq24;
use crate::util::buf_ext::BufExt;
use crate::util::safe_converter::PrecheckedCast;

const FLAG_VALID: u8 = 0x80;
const FLAG_ACK: u8 = 0x40;
const FLAG_NAK: u8 = 0x20;
const FLAG_HAS_ACKS: u8 = 0x08;

/// upper bound for the number of sequence numbers a single range may cover when decoding, to
///  keep a malicious peer from making us iterate over the entire sequence number space
pub const MAX_RANGE_LEN: u32 = 8192;

/// A list of datagram sequence number ranges (both ends inclusive), as carried by ACK and NAK
///  datagrams.
///
/// ```ascii
/// count u16
/// per range:  single u8 (1 if min == max), min u24, max u24 (only if not single)
/// ```
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct AckRanges {
    ranges: Vec<(Seq24, Seq24)>,
}

impl AckRanges {
    pub fn new() -> AckRanges {
        AckRanges::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[(Seq24, Seq24)] {
        &self.ranges
    }

    /// appends a sequence number, extending the last range if it is its direct successor
    pub fn push(&mut self, seq: Seq24) {
        if let Some((_, max)) = self.ranges.last_mut() {
            if max.next() == seq {
                *max = seq;
                return;
            }
        }
        self.ranges.push((seq, seq));
    }

    pub fn iter(&self) -> impl Iterator<Item=Seq24> + '_ {
        self.ranges.iter()
            .flat_map(|&(min, max)| (0..=max.distance_from(min)).map(move |d| min.wrapping_add(d)))
    }

    pub fn serialized_len(&self) -> usize {
        2 + self.ranges.iter()
            .map(|(min, max)| if min == max { 4 } else { 7 })
            .sum::<usize>()
    }

    /// Removes and returns as many leading ranges as fit into `max_len` serialized bytes
    pub fn split_off_front(&mut self, max_len: usize) -> AckRanges {
        let mut len = 2;
        let mut num = 0;
        for (min, max) in &self.ranges {
            let range_len = if min == max { 4 } else { 7 };
            if len + range_len > max_len {
                break;
            }
            len += range_len;
            num += 1;
        }
        let rest = self.ranges.split_off(num);
        AckRanges {
            ranges: std::mem::replace(&mut self.ranges, rest),
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.ranges.len().prechecked_cast());
        for (min, max) in &self.ranges {
            if min == max {
                buf.put_u8(1);
                min.ser(buf);
            }
            else {
                buf.put_u8(0);
                min.ser(buf);
                max.ser(buf);
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<AckRanges> {
        let count = buf.try_read_u16()?;
        let mut ranges = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let single = buf.try_read_u8()? != 0;
            let min = Seq24::deser(buf)?;
            let max = if single {
                min
            }
            else {
                Seq24::deser(buf)?
            };
            if max.distance_from(min) >= MAX_RANGE_LEN {
                bail!("ack range {}..={} is too long", min, max);
            }
            ranges.push((min, max));
        }
        Ok(AckRanges { ranges })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DataDatagram {
    /// acknowledgements piggy-backed on a data datagram
    pub acks: Option<AckRanges>,
    pub sequence_number: Seq24,
    pub frames: Vec<Frame>,
}

impl DataDatagram {
    /// size of the datagram header without piggy-backed acks
    pub const HEADER_LEN: usize = 4;
}

/// A datagram on an established connection, distinguished from offline messages by its first
///  byte having the high bit set.
///
/// ```ascii
/// 0xc0  ACK   ranges
/// 0xa0  NAK   ranges
/// 0x80  data  [ranges if 0x08 is set], sequence number u24, frames
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Datagram {
    Ack(AckRanges),
    Nak(AckRanges),
    Data(DataDatagram),
}

impl Datagram {
    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            Datagram::Ack(ranges) => {
                buf.put_u8(FLAG_VALID | FLAG_ACK);
                ranges.ser(buf);
            }
            Datagram::Nak(ranges) => {
                buf.put_u8(FLAG_VALID | FLAG_NAK);
                ranges.ser(buf);
            }
            Datagram::Data(data) => {
                match &data.acks {
                    Some(acks) => {
                        buf.put_u8(FLAG_VALID | FLAG_HAS_ACKS);
                        acks.ser(buf);
                    }
                    None => {
                        buf.put_u8(FLAG_VALID);
                    }
                }
                data.sequence_number.ser(buf);
                for frame in &data.frames {
                    frame.ser(buf);
                }
            }
        }
    }

    pub fn deser(mut buf: &[u8]) -> anyhow::Result<Datagram> {
        let flags = buf.try_read_u8()?;
        if flags & FLAG_VALID == 0 {
            bail!("not a connected datagram: {:#04x}", flags);
        }

        if flags & FLAG_ACK != 0 {
            return Ok(Datagram::Ack(AckRanges::deser(&mut buf)?));
        }
        if flags & FLAG_NAK != 0 {
            return Ok(Datagram::Nak(AckRanges::deser(&mut buf)?));
        }

        let acks = if flags & FLAG_HAS_ACKS != 0 {
            Some(AckRanges::deser(&mut buf)?)
        }
        else {
            None
        };
        let sequence_number = Seq24::deser(&mut buf)?;

        let mut frames = Vec::new();
        while buf.has_remaining() {
            frames.push(Frame::deser(&mut buf)?);
        }

        Ok(Datagram::Data(DataDatagram {
            acks,
            sequence_number,
            frames,
        }))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rstest::rstest;
    use crate::protocol::reliability::PacketReliability;
    use super::*;

    fn ranges(seqs: &[u32]) -> AckRanges {
        let mut result = AckRanges::new();
        for &s in seqs {
            result.push(Seq24::from_raw(s));
        }
        result
    }

    #[rstest]
    #[case::empty(vec![], vec![])]
    #[case::single(vec![5], vec![(5, 5)])]
    #[case::consecutive(vec![5, 6, 7], vec![(5, 7)])]
    #[case::gap(vec![5, 6, 9], vec![(5, 6), (9, 9)])]
    #[case::out_of_order(vec![5, 4], vec![(5, 5), (4, 4)])]
    #[case::wrap(vec![0xff_fffe, 0xff_ffff, 0, 1], vec![(0xff_fffe, 1)])]
    fn test_push(#[case] seqs: Vec<u32>, #[case] expected: Vec<(u32, u32)>) {
        let r = ranges(&seqs);
        let actual = r.ranges().iter()
            .map(|(a, b)| (a.to_raw(), b.to_raw()))
            .collect::<Vec<_>>();
        assert_eq!(actual, expected);
        assert_eq!(r.iter().map(|s| s.to_raw()).collect::<Vec<_>>(), seqs);
    }

    #[test]
    fn test_ack_ser() {
        let mut buf = BytesMut::new();
        Datagram::Ack(ranges(&[1, 2, 3, 7])).ser(&mut buf);
        assert_eq!(buf.as_ref(), &[0xc0, 0,2, 0, 1,0,0, 3,0,0, 1, 7,0,0]);
        assert_eq!(ranges(&[1, 2, 3, 7]).serialized_len(), buf.len() - 1);

        assert_eq!(Datagram::deser(&buf).unwrap(), Datagram::Ack(ranges(&[1, 2, 3, 7])));
    }

    #[test]
    fn test_nak_ser() {
        let mut buf = BytesMut::new();
        Datagram::Nak(ranges(&[4])).ser(&mut buf);
        assert_eq!(buf.as_ref(), &[0xa0, 0,1, 1, 4,0,0]);
        assert_eq!(Datagram::deser(&buf).unwrap(), Datagram::Nak(ranges(&[4])));
    }

    #[rstest]
    #[case::no_acks(None)]
    #[case::piggy_backed(Some(ranges(&[10, 11])))]
    fn test_data_ser_deser(#[case] acks: Option<AckRanges>) {
        let datagram = Datagram::Data(DataDatagram {
            acks,
            sequence_number: Seq24::from_raw(77),
            frames: vec![
                Frame {
                    reliability: PacketReliability::Unreliable,
                    reliable_index: None,
                    sequencing_index: None,
                    ordering: None,
                    split: None,
                    payload: Bytes::from_static(&[0x86, 1]),
                },
                Frame {
                    reliability: PacketReliability::Reliable,
                    reliable_index: Some(Seq24::from_raw(3)),
                    sequencing_index: None,
                    ordering: None,
                    split: None,
                    payload: Bytes::from_static(&[0x86, 2]),
                },
            ],
        });

        let mut buf = BytesMut::new();
        datagram.ser(&mut buf);
        assert_eq!(Datagram::deser(&buf).unwrap(), datagram);
    }

    #[test]
    fn test_data_layout() {
        let mut buf = BytesMut::new();
        Datagram::Data(DataDatagram {
            acks: None,
            sequence_number: Seq24::from_raw(2),
            frames: vec![],
        }).ser(&mut buf);
        assert_eq!(buf.as_ref(), &[0x80, 2,0,0]);
        assert_eq!(buf.len(), DataDatagram::HEADER_LEN);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::offline(vec![0x05, 1, 2])]
    #[case::truncated_ranges(vec![0xc0, 0,1, 1, 4,0])]
    #[case::range_too_long(vec![0xc0, 0,1, 0, 0,0,0, 0xff,0xff,0])]
    #[case::truncated_frame(vec![0x80, 1,0,0, 0x00, 0,16, 1])]
    fn test_deser_invalid(#[case] data: Vec<u8>) {
        assert!(Datagram::deser(&data).is_err());
    }

    #[rstest]
    #[case::all_fit(vec![1, 3, 5], 100, vec![1, 3, 5], vec![])]
    #[case::two_fit(vec![1, 3, 5], 10, vec![1, 3], vec![5])]
    #[case::none_fit(vec![1, 2], 8, vec![], vec![1, 2])]
    fn test_split_off_front(#[case] seqs: Vec<u32>, #[case] max_len: usize, #[case] expected_front: Vec<u32>, #[case] expected_rest: Vec<u32>) {
        let mut r = ranges(&seqs);
        let front = r.split_off_front(max_len);
        assert_eq!(front.iter().map(|s| s.to_raw()).collect::<Vec<_>>(), expected_front);
        assert_eq!(r.iter().map(|s| s.to_raw()).collect::<Vec<_>>(), expected_rest);
        assert!(front.serialized_len() <= max_len || front.is_empty());
    }
}
