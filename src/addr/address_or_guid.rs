use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use crate::addr::{RakNetGuid, SystemAddress};

/// Identifies a peer either by its network address or by its GUID.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum AddressOrGuid {
    Address(SystemAddress),
    Guid(RakNetGuid),
}

impl AddressOrGuid {
    pub fn address(&self) -> Option<SystemAddress> {
        match self {
            AddressOrGuid::Address(addr) => Some(*addr),
            AddressOrGuid::Guid(_) => None,
        }
    }

    pub fn guid(&self) -> Option<RakNetGuid> {
        match self {
            AddressOrGuid::Address(_) => None,
            AddressOrGuid::Guid(guid) => Some(*guid),
        }
    }

    /// true for the sentinels [SystemAddress::ZERO] and [RakNetGuid::UNASSIGNED], i.e. for
    ///  references that do not name any peer
    pub fn is_unassigned(&self) -> bool {
        match self {
            AddressOrGuid::Address(addr) => addr.is_zero(),
            AddressOrGuid::Guid(guid) => guid.is_unassigned(),
        }
    }

    fn variant_index(&self) -> u8 {
        match self {
            AddressOrGuid::Address(_) => 0,
            AddressOrGuid::Guid(_) => 1,
        }
    }
}

/// GUIDs are compared first, with [RakNetGuid::UNASSIGNED] standing in for an address-only
///  reference, then addresses with [SystemAddress::ZERO] standing in for a GUID-only reference.
impl Ord for AddressOrGuid {
    fn cmp(&self, other: &Self) -> Ordering {
        RakNetGuid::or_unassigned(self.guid()).cmp(&RakNetGuid::or_unassigned(other.guid()))
            .then_with(|| SystemAddress::or_zero(self.address()).cmp(&SystemAddress::or_zero(other.address())))
            .then_with(|| self.variant_index().cmp(&other.variant_index()))
    }
}
impl PartialOrd for AddressOrGuid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for AddressOrGuid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressOrGuid::Address(addr) => write!(f, "{}", addr),
            AddressOrGuid::Guid(guid) => write!(f, "{}", guid),
        }
    }
}

impl From<SystemAddress> for AddressOrGuid {
    fn from(value: SystemAddress) -> Self {
        AddressOrGuid::Address(value)
    }
}

impl From<SocketAddr> for AddressOrGuid {
    fn from(value: SocketAddr) -> Self {
        AddressOrGuid::Address(value.into())
    }
}

impl From<RakNetGuid> for AddressOrGuid {
    fn from(value: RakNetGuid) -> Self {
        AddressOrGuid::Guid(value)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use rstest::rstest;
    use super::*;

    fn a(s: &str) -> AddressOrGuid {
        AddressOrGuid::Address(SocketAddr::from_str(s).unwrap().into())
    }
    fn g(raw: u64) -> AddressOrGuid {
        AddressOrGuid::Guid(RakNetGuid::from_raw(raw))
    }

    #[rstest]
    #[case::guid_guid(g(1), g(2), Ordering::Less)]
    #[case::guid_equal(g(7), g(7), Ordering::Equal)]
    #[case::guid_before_address(g(1), a("1.2.3.4:5"), Ordering::Less)]
    #[case::address_address(a("1.2.3.4:5"), a("1.2.3.4:6"), Ordering::Less)]
    #[case::address_equal(a("1.2.3.4:5"), a("1.2.3.4:5"), Ordering::Equal)]
    #[case::max_guid_vs_zero_address(g(u64::MAX), a("0.0.0.0:1"), Ordering::Less)]
    #[case::sentinels_differ(g(u64::MAX), a("0.0.0.0:0"), Ordering::Greater)]
    fn test_ordering(#[case] x: AddressOrGuid, #[case] y: AddressOrGuid, #[case] expected: Ordering) {
        assert_eq!(x.cmp(&y), expected);
        assert_eq!(y.cmp(&x), expected.reverse());
        assert_eq!(x == y, expected == Ordering::Equal);
    }

    #[rstest]
    #[case::zero_address(a("0.0.0.0:0"), true)]
    #[case::unassigned_guid(g(u64::MAX), true)]
    #[case::address(a("1.2.3.4:5"), false)]
    #[case::guid(g(0), false)]
    fn test_is_unassigned(#[case] x: AddressOrGuid, #[case] expected: bool) {
        assert_eq!(x.is_unassigned(), expected);
    }

    #[test]
    fn test_accessors() {
        assert_eq!(g(3).guid(), Some(RakNetGuid::from_raw(3)));
        assert_eq!(g(3).address(), None);
        assert_eq!(a("1.2.3.4:5").guid(), None);
        assert_eq!(a("1.2.3.4:5").to_string(), "1.2.3.4|5");
    }
}
