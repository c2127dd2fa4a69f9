use std::fmt::{Debug, Display, Formatter};
use std::num::ParseIntError;
use std::str::FromStr;
use crate::util::random::{Random, RngRandom};

/// The logical identity of a peer, stable for the lifetime of its process and independent of the
///  network address it happens to use.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct RakNetGuid(u64);

impl RakNetGuid {
    /// all ones - never assigned to an actual peer
    pub const UNASSIGNED: RakNetGuid = RakNetGuid(u64::MAX);

    pub const fn from_raw(raw: u64) -> RakNetGuid {
        RakNetGuid(raw)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }

    pub fn is_unassigned(&self) -> bool {
        *self == Self::UNASSIGNED
    }

    pub fn or_unassigned(guid: Option<RakNetGuid>) -> RakNetGuid {
        guid.unwrap_or(Self::UNASSIGNED)
    }

    pub fn random() -> RakNetGuid {
        Self::random_with::<RngRandom>()
    }

    pub fn random_with<R: Random>() -> RakNetGuid {
        loop {
            let raw = R::next_u64();
            if raw != Self::UNASSIGNED.0 {
                return RakNetGuid(raw);
            }
        }
    }

    /// The 32-bit hash older RakNet versions derived from a GUID (xor of the high and low
    ///  halves). Only needed for interoperating with code that persisted these values.
    pub fn legacy_hash_code(&self) -> i32 {
        ((self.0 >> 32) as u32 ^ self.0 as u32) as i32
    }
}

impl Display for RakNetGuid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Debug for RakNetGuid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_unassigned() {
            write!(f, "RakNetGuid(UNASSIGNED)")
        }
        else {
            write!(f, "RakNetGuid({:016x})", self.0)
        }
    }
}

impl FromStr for RakNetGuid {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(RakNetGuid(s.parse()?))
    }
}

impl From<u64> for RakNetGuid {
    fn from(value: u64) -> Self {
        RakNetGuid(value)
    }
}
