use std::cmp::Ordering;
use std::fmt::{Debug, Display, Formatter};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};
use std::num::{IntErrorKind, ParseIntError};
use std::str::FromStr;
use anyhow::anyhow;
use bytes::{Buf, BufMut};
use tracing::trace;
use crate::addr::{AddressError, InetFamily};
use crate::util::buf_ext::BufExt;

/// The physical network endpoint of a peer.
///
/// Endpoints are ordered by port first and then by the address interpreted as an unsigned
///  integer. IPv4 sorts before IPv6 for otherwise identical numbers so that the ordering stays
///  consistent with equality.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct SystemAddress(SocketAddr);

impl SystemAddress {
    /// `0.0.0.0:0`, standing in for "no address"
    pub const ZERO: SystemAddress = SystemAddress(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)));

    pub const DEFAULT_PORT_DELIMITER: char = '|';

    pub fn new(ip: IpAddr, port: u16) -> SystemAddress {
        SystemAddress(SocketAddr::new(ip, port))
    }

    pub fn or_zero(addr: Option<SystemAddress>) -> SystemAddress {
        addr.unwrap_or(Self::ZERO)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn family(&self) -> InetFamily {
        InetFamily::of(&self.0)
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// true for addresses that refer to the local host, including the wildcard address
    pub fn is_loopback(&self) -> bool {
        self.ip().is_loopback() || self.ip().is_unspecified()
    }

    /// true for IPv4 addresses in one of the private ranges of RFC 1918
    pub fn is_lan_address(&self) -> bool {
        match self.ip() {
            IpAddr::V4(ip) => {
                let octets = ip.octets();
                match octets[0] {
                    10 => true,
                    172 => (16..=31).contains(&octets[1]),
                    192 => octets[1] == 168,
                    _ => false,
                }
            }
            IpAddr::V6(_) => false,
        }
    }

    fn address_bits(ip: &IpAddr) -> u128 {
        match ip {
            IpAddr::V4(ip) => ip.to_bits() as u128,
            IpAddr::V6(ip) => ip.to_bits(),
        }
    }

    /// Parses `host<delimiter>port`, or `[host]<delimiter>port` for IPv6 literals that would
    ///  otherwise collide with the delimiter. Without a delimiter, the whole string is the host and
    ///  `default_port` is used; the same happens if the string has no port part.
    ///
    /// If a `preferred_family` is given and the host is a loopback address of the other family,
    ///  it is rewritten to that family's loopback address.
    pub fn parse_with(
        s: &str,
        port_delimiter: Option<char>,
        default_port: u16,
        preferred_family: Option<InetFamily>,
    ) -> Result<SystemAddress, AddressError> {
        let Some(delimiter) = port_delimiter else {
            let ip = Self::parse_host(s, preferred_family)?;
            return Ok(SystemAddress::new(ip, default_port));
        };

        let (host, port) = Self::split_host_port(s, delimiter)?;
        let ip = Self::parse_host(host, preferred_family)?;
        let port = match port {
            None => default_port,
            Some(port) => Self::parse_port(port)?,
        };
        Ok(SystemAddress::new(ip, port))
    }

    fn split_host_port(s: &str, delimiter: char) -> Result<(&str, Option<&str>), AddressError> {
        if let Some(bracketed) = s.strip_prefix('[') {
            if let Some(close) = bracketed.find(']') {
                if let Some(port) = bracketed[close + 1..].strip_prefix(delimiter) {
                    return Ok((&bracketed[..close], Some(port)));
                }
            }
        }

        let mut parts = s.split(delimiter).collect::<Vec<_>>();
        // trailing empty parts carry no information, "host|" is just "host"
        while parts.len() > 1 && parts.last() == Some(&"") {
            parts.pop();
        }

        match parts.as_slice() {
            [host] => Ok((host, None)),
            [host, port] => Ok((host, Some(port))),
            _ => Err(AddressError::InvalidFormat {
                input: s.to_string(),
                reason: "expecting only an address and a port",
            }),
        }
    }

    fn parse_port(s: &str) -> Result<u16, AddressError> {
        let value: i64 = s.parse()
            .map_err(|e: ParseIntError| match e.kind() {
                // numeric, just too large for any port
                IntErrorKind::PosOverflow => AddressError::PortOutOfRange(i64::MAX),
                IntErrorKind::NegOverflow => AddressError::PortOutOfRange(i64::MIN),
                _ => AddressError::InvalidFormat {
                    input: s.to_string(),
                    reason: "could not parse port",
                },
            })?;
        u16::try_from(value)
            .map_err(|_| AddressError::PortOutOfRange(value))
    }

    fn parse_host(host: &str, preferred_family: Option<InetFamily>) -> Result<IpAddr, AddressError> {
        let host = host.strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        let ip = if host.is_empty() {
            preferred_family.unwrap_or(InetFamily::V4).loopback()
        }
        else if let Ok(ip) = host.parse::<IpAddr>() {
            ip
        }
        else {
            Self::resolve(host, preferred_family)?
        };

        Ok(match (preferred_family, ip) {
            (Some(InetFamily::V4), IpAddr::V6(v6)) if v6.is_loopback() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            (Some(InetFamily::V6), IpAddr::V4(v4)) if v4.is_loopback() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            _ => ip,
        })
    }

    fn resolve(host: &str, preferred_family: Option<InetFamily>) -> Result<IpAddr, AddressError> {
        let candidates = (host, 0).to_socket_addrs()
            .map_err(|e| AddressError::HostResolution { host: host.to_string(), source: e })?
            .map(|a| a.ip())
            .collect::<Vec<_>>();
        trace!("resolved {} to {:?}", host, candidates);

        candidates.iter()
            .find(|ip| Some(InetFamily::of_ip(ip)) == preferred_family)
            .or(candidates.first())
            .cloned()
            .ok_or_else(|| AddressError::HostResolution {
                host: host.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
            })
    }

    /// Renders as `host<delimiter>port`, bracketing IPv6 hosts if the delimiter is `:`. Without a
    ///  delimiter, only the host is rendered.
    pub fn to_string_with(&self, port_delimiter: Option<char>) -> String {
        let host = self.ip().to_string();
        match port_delimiter {
            None => host,
            Some(':') if self.0.is_ipv6() => format!("[{}]:{}", host, self.port()),
            Some(delimiter) => format!("{}{}{}", host, delimiter, self.port()),
        }
    }

    pub fn serialized_len(&self) -> usize {
        1 + self.family().address_len() + 2
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        match &self.0 {
            SocketAddr::V4(data) => {
                buf.put_u8(4);
                buf.put_u32(data.ip().to_bits());
                buf.put_u16(data.port());
            }
            SocketAddr::V6(data) => {
                buf.put_u8(6);
                buf.put_u128(data.ip().to_bits());
                buf.put_u16(data.port());
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<SystemAddress> {
        let addr = match buf.try_read_u8()? {
            4 => {
                let ip = buf.try_read_u32()?;
                let port = buf.try_read_u16()?;
                SocketAddr::V4(SocketAddrV4::new(ip.into(), port))
            }
            6 => {
                let ip = buf.try_read_u128()?;
                let port = buf.try_read_u16()?;
                SocketAddr::V6(SocketAddrV6::new(ip.into(), port, 0, 0))
            }
            n => {
                return Err(anyhow!("invalid address family discriminator: {}", n));
            }
        };
        Ok(SystemAddress(addr))
    }
}

impl Ord for SystemAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.port().cmp(&other.port())
            .then_with(|| Self::address_bits(&self.ip()).cmp(&Self::address_bits(&other.ip())))
            .then_with(|| self.family().cmp(&other.family()))
            .then_with(|| match (&self.0, &other.0) {
                (SocketAddr::V6(a), SocketAddr::V6(b)) => (a.scope_id(), a.flowinfo()).cmp(&(b.scope_id(), b.flowinfo())),
                _ => Ordering::Equal,
            })
    }
}
impl PartialOrd for SystemAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for SystemAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_with(Some(Self::DEFAULT_PORT_DELIMITER)))
    }
}

impl Debug for SystemAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl FromStr for SystemAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_with(s, Some(Self::DEFAULT_PORT_DELIMITER), 0, None)
    }
}

impl From<SocketAddr> for SystemAddress {
    fn from(value: SocketAddr) -> Self {
        SystemAddress(value)
    }
}

impl From<SystemAddress> for SocketAddr {
    fn from(value: SystemAddress) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rstest::rstest;
    use super::*;

    fn addr(s: &str) -> SystemAddress {
        SystemAddress(SocketAddr::from_str(s).unwrap())
    }

    #[rstest]
    #[case::v4_pipe("1.2.3.4|80", Some('|'), 0, None, "1.2.3.4:80")]
    #[case::v4_colon("1.2.3.4:80", Some(':'), 0, None, "1.2.3.4:80")]
    #[case::v4_default_port("1.2.3.4", Some('|'), 99, None, "1.2.3.4:99")]
    #[case::v4_trailing_delimiter("1.2.3.4|", Some('|'), 99, None, "1.2.3.4:99")]
    #[case::no_delimiter("1.2.3.4", None, 77, None, "1.2.3.4:77")]
    #[case::no_delimiter_v6("::1", None, 77, None, "[::1]:77")]
    #[case::v6_pipe("::1|80", Some('|'), 0, None, "[::1]:80")]
    #[case::v6_bracketed_colon("[fe80::1]:443", Some(':'), 0, None, "[fe80::1]:443")]
    #[case::v6_bracketed_pipe("[fe80::1]|443", Some('|'), 0, None, "[fe80::1]:443")]
    #[case::v6_bracketed_no_port("[fe80::1]", Some('|'), 5, None, "[fe80::1]:5")]
    #[case::plus_sign_port("1.2.3.4|+80", Some('|'), 0, None, "1.2.3.4:80")]
    #[case::empty_host("|80", Some('|'), 0, None, "127.0.0.1:80")]
    #[case::loopback_to_v4("::1|80", Some('|'), 0, Some(InetFamily::V4), "127.0.0.1:80")]
    #[case::loopback_to_v6("127.0.0.1|80", Some('|'), 0, Some(InetFamily::V6), "[::1]:80")]
    #[case::other_loopback_to_v6("127.0.0.5|80", Some('|'), 0, Some(InetFamily::V6), "[::1]:80")]
    #[case::loopback_same_family("127.0.0.1|80", Some('|'), 0, Some(InetFamily::V4), "127.0.0.1:80")]
    #[case::no_rewrite_non_loopback("10.0.0.1|80", Some('|'), 0, Some(InetFamily::V6), "10.0.0.1:80")]
    #[case::localhost_v4("localhost|80", Some('|'), 0, Some(InetFamily::V4), "127.0.0.1:80")]
    fn test_parse(#[case] s: &str, #[case] delimiter: Option<char>, #[case] default_port: u16, #[case] preferred: Option<InetFamily>, #[case] expected: &str) {
        let actual = SystemAddress::parse_with(s, delimiter, default_port, preferred).unwrap();
        assert_eq!(actual, addr(expected));
    }

    #[rstest]
    #[case::too_many_parts("1.2.3.4|80|90", Some('|'))]
    #[case::unbracketed_v6_colon("::1:80", Some(':'))]
    #[case::non_numeric_port("1.2.3.4|http", Some('|'))]
    #[case::empty_bracketed_port("[::1]|", Some('|'))]
    fn test_parse_invalid_format(#[case] s: &str, #[case] delimiter: Option<char>) {
        match SystemAddress::parse_with(s, delimiter, 0, None) {
            Err(AddressError::InvalidFormat { .. }) => {}
            other => panic!("expected InvalidFormat, got {:?}", other),
        }
    }

    #[rstest]
    #[case::too_big("1.2.3.4|65536", 65536)]
    #[case::negative("1.2.3.4|-1", -1)]
    #[case::beyond_u32("1.2.3.4|4294967296", 4294967296)]
    #[case::beyond_i64("1.2.3.4|99999999999999999999", i64::MAX)]
    #[case::below_i64("1.2.3.4|-99999999999999999999", i64::MIN)]
    fn test_parse_port_out_of_range(#[case] s: &str, #[case] expected: i64) {
        match SystemAddress::parse_with(s, Some('|'), 0, None) {
            Err(AddressError::PortOutOfRange(port)) => assert_eq!(port, expected),
            other => panic!("expected PortOutOfRange, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_unresolvable() {
        match SystemAddress::parse_with("no-such-host.invalid|80", Some('|'), 0, None) {
            Err(AddressError::HostResolution { host, .. }) => assert_eq!(host, "no-such-host.invalid"),
            other => panic!("expected HostResolution, got {:?}", other),
        }
    }

    #[rstest]
    #[case::v4_pipe("1.2.3.4:80", Some('|'), "1.2.3.4|80")]
    #[case::v4_colon("1.2.3.4:80", Some(':'), "1.2.3.4:80")]
    #[case::v6_pipe("[::1]:80", Some('|'), "::1|80")]
    #[case::v6_colon("[::1]:80", Some(':'), "[::1]:80")]
    #[case::v6_space("[fe80::1:2]:80", Some(' '), "fe80::1:2 80")]
    #[case::no_delimiter("[::1]:80", None, "::1")]
    fn test_render(#[case] a: &str, #[case] delimiter: Option<char>, #[case] expected: &str) {
        assert_eq!(addr(a).to_string_with(delimiter), expected);
    }

    #[rstest]
    #[case("1.2.3.4:80", '|')]
    #[case("1.2.3.4:80", ':')]
    #[case("255.255.255.255:65535", ',')]
    #[case("[::1]:80", '|')]
    #[case("[::1]:80", ':')]
    #[case("[2001:db8::ff00:42:8329]:1", ':')]
    #[case("[2001:db8::ff00:42:8329]:1", '/')]
    #[case("0.0.0.0:0", '|')]
    fn test_round_trip(#[case] a: &str, #[case] delimiter: char) {
        let original = addr(a);
        let rendered = original.to_string_with(Some(delimiter));
        assert_eq!(SystemAddress::parse_with(&rendered, Some(delimiter), 12345, None).unwrap(), original);
    }

    #[test]
    fn test_display_and_from_str() {
        let a = addr("10.1.2.3:19132");
        assert_eq!(a.to_string(), "10.1.2.3|19132");
        assert_eq!(SystemAddress::from_str("10.1.2.3|19132").unwrap(), a);
    }

    #[rstest]
    #[case::port_first("9.9.9.9:1", "1.1.1.1:2", Ordering::Less)]
    #[case::same_port_address("1.1.1.1:2", "1.1.1.2:2", Ordering::Less)]
    #[case::unsigned_address("200.0.0.1:2", "100.0.0.1:2", Ordering::Greater)]
    #[case::equal("1.2.3.4:5", "1.2.3.4:5", Ordering::Equal)]
    #[case::v4_below_big_v6("255.255.255.255:5", "[::1:0:0]:5", Ordering::Less)]
    #[case::same_bits_family("0.0.0.1:5", "[::1]:5", Ordering::Less)]
    #[case::zero_lowest("0.0.0.0:0", "[::]:1", Ordering::Less)]
    fn test_ordering(#[case] a: &str, #[case] b: &str, #[case] expected: Ordering) {
        assert_eq!(addr(a).cmp(&addr(b)), expected);
        assert_eq!(addr(b).cmp(&addr(a)), expected.reverse());
        assert_eq!(addr(a) == addr(b), expected == Ordering::Equal);
    }

    #[rstest]
    #[case::ten("10.255.0.1:1", true)]
    #[case::one_seven_two_low("172.16.0.1:1", true)]
    #[case::one_seven_two_high("172.31.255.255:1", true)]
    #[case::one_seven_two_outside("172.32.0.1:1", false)]
    #[case::one_nine_two("192.168.1.1:1", true)]
    #[case::one_nine_two_outside("192.169.1.1:1", false)]
    #[case::public("8.8.8.8:1", false)]
    #[case::v6("[fd00::1]:1", false)]
    fn test_is_lan_address(#[case] a: &str, #[case] expected: bool) {
        assert_eq!(addr(a).is_lan_address(), expected);
    }

    #[rstest]
    #[case::v4("127.0.0.1:1", true)]
    #[case::v4_other("127.1.2.3:1", true)]
    #[case::v6("[::1]:1", true)]
    #[case::zero("0.0.0.0:0", true)]
    #[case::lan("192.168.0.1:1", false)]
    fn test_is_loopback(#[case] a: &str, #[case] expected: bool) {
        assert_eq!(addr(a).is_loopback(), expected);
    }

    #[rstest]
    #[case::v4("1.2.3.4:258", vec![4, 1,2,3,4, 1,2])]
    #[case::v6("[::1]:1", vec![6, 0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,1, 0,1])]
    fn test_ser(#[case] a: &str, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        addr(a).ser(&mut buf);
        assert_eq!(buf.as_ref(), expected.as_slice());
        assert_eq!(addr(a).serialized_len(), expected.len());

        let mut b: &[u8] = &expected;
        assert_eq!(SystemAddress::deser(&mut b).unwrap(), addr(a));
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::bad_family(vec![5, 1,2,3,4, 0,1])]
    #[case::truncated(vec![4, 1,2,3])]
    fn test_deser_invalid(#[case] data: Vec<u8>) {
        let mut b: &[u8] = &data;
        assert!(SystemAddress::deser(&mut b).is_err());
    }

    #[test]
    fn test_zero() {
        assert!(SystemAddress::ZERO.is_zero());
        assert_eq!(SystemAddress::or_zero(None), SystemAddress::ZERO);
        assert_eq!(SystemAddress::ZERO, addr("0.0.0.0:0"));
    }
}
