//! Looks up the MTU of the network interface behind a local address. For the unspecified
//!  address, i.e. binding to all interfaces, this is the smallest MTU of all interfaces of the
//!  address family.

use std::net::IpAddr;
use crate::socket::SocketError;

#[cfg(target_os = "linux")]
pub fn interface_mtu(ip: IpAddr) -> Result<u32, SocketError> {
    let names = linux::interface_names(ip)?;

    let mut result: Option<u32> = None;
    for name in names {
        let mtu = linux::query_mtu(&name)?;
        result = Some(result.map_or(mtu, |r| r.min(mtu)));
    }
    result.ok_or(SocketError::NoSuchInterface(ip))
}

#[cfg(not(target_os = "linux"))]
pub fn interface_mtu(ip: IpAddr) -> Result<u32, SocketError> {
    Err(SocketError::NoSuchInterface(ip))
}

#[cfg(target_os = "linux")]
mod linux {
    use std::ffi::CStr;
    use std::io;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
    use crate::socket::SocketError;

    const IFNAMSIZ: usize = 16;

    /// `struct ifreq` with the MTU member of the union, padded to the kernel's size
    #[repr(C)]
    struct IfreqMtu {
        ifr_name: [u8; IFNAMSIZ],
        ifr_mtu: libc::c_int,
        _pad: [u8; 20],
    }

    /// names of the interfaces that carry `ip`, or of all interfaces of its family if it is
    ///  unspecified
    pub fn interface_names(ip: IpAddr) -> Result<Vec<String>, SocketError> {
        let mut addrs: *mut libc::ifaddrs = std::ptr::null_mut();

        // SAFETY: FFI call with a valid out pointer; the list is released with freeifaddrs below.
        if unsafe { libc::getifaddrs(&mut addrs) } != 0 {
            return Err(io::Error::last_os_error().into());
        }

        let mut result = Vec::new();
        let mut cur = addrs;
        while !cur.is_null() {
            // SAFETY: cur is a non-null element of the list returned by getifaddrs
            let entry = unsafe { &*cur };
            cur = entry.ifa_next;

            if entry.ifa_addr.is_null() || entry.ifa_name.is_null() {
                continue;
            }

            // SAFETY: ifa_addr is non-null and points to a sockaddr of the family it declares
            let if_ip = unsafe { sockaddr_ip(entry.ifa_addr) };
            let Some(if_ip) = if_ip else {
                continue;
            };

            let matches = if ip.is_unspecified() {
                if_ip.is_ipv4() == ip.is_ipv4()
            }
            else {
                if_ip == ip
            };

            if matches {
                // SAFETY: ifa_name is a non-null, NUL terminated string owned by the list
                let name = unsafe { CStr::from_ptr(entry.ifa_name) }
                    .to_string_lossy()
                    .into_owned();
                if !result.contains(&name) {
                    result.push(name);
                }
            }
        }

        // SAFETY: addrs was returned by getifaddrs and is not used afterwards
        unsafe { libc::freeifaddrs(addrs) };
        Ok(result)
    }

    unsafe fn sockaddr_ip(addr: *const libc::sockaddr) -> Option<IpAddr> {
        match (*addr).sa_family as libc::c_int {
            libc::AF_INET => {
                let v4 = &*(addr as *const libc::sockaddr_in);
                Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(v4.sin_addr.s_addr))))
            }
            libc::AF_INET6 => {
                let v6 = &*(addr as *const libc::sockaddr_in6);
                Some(IpAddr::V6(Ipv6Addr::from(v6.sin6_addr.s6_addr)))
            }
            _ => None,
        }
    }

    pub fn query_mtu(name: &str) -> Result<u32, SocketError> {
        let name_bytes = name.as_bytes();
        if name_bytes.len() >= IFNAMSIZ {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, format!("interface name too long: {}", name)).into());
        }

        let mut req = IfreqMtu {
            ifr_name: [0; IFNAMSIZ],
            ifr_mtu: 0,
            _pad: [0; 20],
        };
        req.ifr_name[..name_bytes.len()].copy_from_slice(name_bytes);

        // SAFETY: FFI calls with a valid socket fd and a pointer to an ifreq sized struct
        unsafe {
            let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            let rc = libc::ioctl(fd, libc::SIOCGIFMTU, &mut req);
            let err = io::Error::last_os_error();
            libc::close(fd);
            if rc < 0 {
                return Err(err.into());
            }
        }

        Ok(req.ifr_mtu.max(0) as u32)
    }
}
