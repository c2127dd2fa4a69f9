use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum InetFamily {
    V4,
    V6,
}

impl InetFamily {
    pub fn of_ip(ip: &IpAddr) -> InetFamily {
        match ip {
            IpAddr::V4(_) => InetFamily::V4,
            IpAddr::V6(_) => InetFamily::V6,
        }
    }

    pub fn of(addr: &SocketAddr) -> InetFamily {
        Self::of_ip(&addr.ip())
    }

    /// the IP protocol version number, which doubles as the address family tag on the wire
    pub fn version(self) -> u8 {
        match self {
            InetFamily::V4 => 4,
            InetFamily::V6 => 6,
        }
    }

    pub fn from_version(version: u8) -> Option<InetFamily> {
        match version {
            4 => Some(InetFamily::V4),
            6 => Some(InetFamily::V6),
            _ => None,
        }
    }

    pub fn address_len(self) -> usize {
        match self {
            InetFamily::V4 => 4,
            InetFamily::V6 => 16,
        }
    }

    pub fn loopback(self) -> IpAddr {
        match self {
            InetFamily::V4 => IpAddr::V4(Ipv4Addr::LOCALHOST),
            InetFamily::V6 => IpAddr::V6(Ipv6Addr::LOCALHOST),
        }
    }

    pub fn unspecified(self) -> IpAddr {
        match self {
            InetFamily::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            InetFamily::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

impl Display for InetFamily {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "IPv{}", self.version())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::v4(InetFamily::V4, 4, 4, "127.0.0.1")]
    #[case::v6(InetFamily::V6, 6, 16, "::1")]
    fn test_family(#[case] family: InetFamily, #[case] version: u8, #[case] len: usize, #[case] loopback: &str) {
        assert_eq!(family.version(), version);
        assert_eq!(InetFamily::from_version(version), Some(family));
        assert_eq!(family.address_len(), len);
        assert_eq!(family.loopback(), loopback.parse::<IpAddr>().unwrap());
        assert_eq!(InetFamily::of_ip(&family.unspecified()), family);
    }

    #[test]
    fn test_unknown_version() {
        assert_eq!(InetFamily::from_version(5), None);
    }
}
