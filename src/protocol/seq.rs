use std::fmt::{Display, Formatter};
use bytes::{Buf, BufMut};
use crate::util::buf_ext::{BufExt, BufMutExt};

/// A 24-bit counter that wraps around. Datagram sequence numbers, reliable message indices and
///  per-channel ordering / sequencing indices all use this representation.
///
/// Comparisons are modular: a number is 'newer' than another if it is less than half the number
///  space ahead of it.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Default)]
pub struct Seq24(u32);

impl Display for Seq24 {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Seq24 {
    pub const ZERO: Seq24 = Seq24(0);
    pub const MODULUS: u32 = 1 << 24;
    const MASK: u32 = Self::MODULUS - 1;
    const HALF: u32 = Self::MODULUS / 2;

    pub fn from_raw(raw: u32) -> Seq24 {
        Seq24(raw & Self::MASK)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> Seq24 {
        self.wrapping_add(1)
    }

    pub fn wrapping_add(&self, n: u32) -> Seq24 {
        Seq24(self.0.wrapping_add(n) & Self::MASK)
    }

    /// steps from `earlier` to `self`, modulo 2^24
    pub fn distance_from(&self, earlier: Seq24) -> u32 {
        self.0.wrapping_sub(earlier.0) & Self::MASK
    }

    pub fn is_newer_than(&self, other: Seq24) -> bool {
        let d = self.distance_from(other);
        d != 0 && d < Self::HALF
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u24_le(self.0);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Seq24> {
        Ok(Seq24(buf.try_read_u24_le()?))
    }
}
