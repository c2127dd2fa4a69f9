use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes};
use num_enum::TryFromPrimitive;
use crate::protocol::reliability::PacketReliability;
use crate::protocol::seq::Seq24;
use crate::util::buf_ext::BufExt;
use crate::util::safe_converter::PrecheckedCast;

const FLAG_SPLIT: u8 = 0x10;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SplitInfo {
    pub count: u32,
    pub id: u16,
    pub index: u32,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct OrderingInfo {
    pub index: Seq24,
    pub channel: u8,
}

/// One message (or one fragment of a message) inside a connected datagram.
///
/// ```ascii
/// flags u8            reliability << 5, 0x10 if split
/// length u16          payload length in *bits*
/// reliable index      u24, reliable frames only
/// sequencing index    u24, sequenced frames only
/// ordering index      u24 + channel u8, ordered and sequenced frames
/// split count         u32, split id u16, split index u32 - split frames only
/// payload
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    pub reliability: PacketReliability,
    pub reliable_index: Option<Seq24>,
    pub sequencing_index: Option<Seq24>,
    pub ordering: Option<OrderingInfo>,
    pub split: Option<SplitInfo>,
    pub payload: Bytes,
}

impl Frame {
    pub fn header_len(reliability: PacketReliability, is_split: bool) -> usize {
        let mut result = 3;
        if reliability.is_reliable() {
            result += 3;
        }
        if reliability.is_sequenced() {
            result += 3;
        }
        if reliability.has_ordering_channel() {
            result += 4;
        }
        if is_split {
            result += 10;
        }
        result
    }

    pub fn serialized_len(&self) -> usize {
        Self::header_len(self.reliability, self.split.is_some()) + self.payload.len()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        let mut flags = u8::from(self.reliability) << 5;
        if self.split.is_some() {
            flags |= FLAG_SPLIT;
        }
        buf.put_u8(flags);
        buf.put_u16((self.payload.len() * 8).prechecked_cast());

        if let Some(index) = self.reliable_index {
            index.ser(buf);
        }
        if let Some(index) = self.sequencing_index {
            index.ser(buf);
        }
        if let Some(ordering) = self.ordering {
            ordering.index.ser(buf);
            buf.put_u8(ordering.channel);
        }
        if let Some(split) = self.split {
            buf.put_u32(split.count);
            buf.put_u16(split.id);
            buf.put_u32(split.index);
        }
        buf.put_slice(&self.payload);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Frame> {
        let flags = buf.try_read_u8()?;
        let reliability = PacketReliability::try_from_primitive(flags >> 5)
            .map_err(|_| anyhow!("invalid reliability in frame flags {:#04x}", flags))?;
        let bit_len = buf.try_read_u16()? as usize;
        let byte_len = (bit_len + 7) / 8;

        let reliable_index = if reliability.is_reliable() {
            Some(Seq24::deser(buf)?)
        }
        else {
            None
        };
        let sequencing_index = if reliability.is_sequenced() {
            Some(Seq24::deser(buf)?)
        }
        else {
            None
        };
        let ordering = if reliability.has_ordering_channel() {
            Some(OrderingInfo {
                index: Seq24::deser(buf)?,
                channel: buf.try_read_u8()?,
            })
        }
        else {
            None
        };
        let split = if flags & FLAG_SPLIT != 0 {
            let split = SplitInfo {
                count: buf.try_read_u32()?,
                id: buf.try_read_u16()?,
                index: buf.try_read_u32()?,
            };
            if split.count == 0 || split.index >= split.count {
                bail!("invalid split info {:?}", split);
            }
            Some(split)
        }
        else {
            None
        };

        if byte_len == 0 {
            bail!("empty frame payload");
        }

        Ok(Frame {
            reliability,
            reliable_index,
            sequencing_index,
            ordering,
            split,
            payload: buf.try_read_bytes(byte_len)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rstest::rstest;
    use super::*;

    fn frame(reliability: PacketReliability, reliable: Option<u32>, sequencing: Option<u32>, ordering: Option<(u32, u8)>, split: Option<SplitInfo>, payload: &[u8]) -> Frame {
        Frame {
            reliability,
            reliable_index: reliable.map(Seq24::from_raw),
            sequencing_index: sequencing.map(Seq24::from_raw),
            ordering: ordering.map(|(index, channel)| OrderingInfo { index: Seq24::from_raw(index), channel }),
            split,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[rstest]
    #[case::unreliable(frame(PacketReliability::Unreliable, None, None, None, None, &[0x86, 1, 2]), vec![0x00, 0,24, 0x86,1,2])]
    #[case::reliable(frame(PacketReliability::Reliable, Some(0x010203), None, None, None, &[9]), vec![0x40, 0,8, 3,2,1, 9])]
    #[case::ordered(frame(PacketReliability::ReliableOrdered, Some(1), None, Some((2, 5)), None, &[9]), vec![0x60, 0,8, 1,0,0, 2,0,0,5, 9])]
    #[case::unreliable_sequenced(frame(PacketReliability::UnreliableSequenced, None, Some(7), Some((3, 1)), None, &[9]), vec![0x20, 0,8, 7,0,0, 3,0,0,1, 9])]
    #[case::reliable_sequenced(frame(PacketReliability::ReliableSequenced, Some(4), Some(7), Some((3, 1)), None, &[9]), vec![0x80, 0,8, 4,0,0, 7,0,0, 3,0,0,1, 9])]
    #[case::split(frame(PacketReliability::Reliable, Some(1), None, None, Some(SplitInfo { count: 3, id: 0x0102, index: 2 }), &[9, 8]), vec![0x50, 0,16, 1,0,0, 0,0,0,3, 1,2, 0,0,0,2, 9,8])]
    fn test_ser(#[case] frame: Frame, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(frame.serialized_len(), expected.len());

        let mut b: &[u8] = &expected;
        assert_eq!(Frame::deser(&mut b).unwrap(), frame);
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::truncated_payload(vec![0x00, 0,24, 1,2])]
    #[case::truncated_index(vec![0x40, 0,8, 3,2])]
    #[case::zero_split_count(vec![0x50, 0,8, 1,0,0, 0,0,0,0, 0,1, 0,0,0,0, 9])]
    #[case::split_index_out_of_range(vec![0x50, 0,8, 1,0,0, 0,0,0,2, 0,1, 0,0,0,2, 9])]
    #[case::empty_payload(vec![0x00, 0,0])]
    fn test_deser_invalid(#[case] data: Vec<u8>) {
        let mut b: &[u8] = &data;
        assert!(Frame::deser(&mut b).is_err());
    }

    #[rstest]
    #[case::unreliable(PacketReliability::Unreliable, false, 3)]
    #[case::reliable(PacketReliability::Reliable, false, 6)]
    #[case::ordered(PacketReliability::ReliableOrdered, false, 10)]
    #[case::reliable_sequenced(PacketReliability::ReliableSequenced, false, 13)]
    #[case::split(PacketReliability::ReliableOrdered, true, 20)]
    fn test_header_len(#[case] reliability: PacketReliability, #[case] split: bool, #[case] expected: usize) {
        assert_eq!(Frame::header_len(reliability, split), expected);
    }
}
