use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::TryFromPrimitive;
use crate::addr::{RakNetGuid, SystemAddress};
use crate::protocol::message_ids::{MessageId, OFFLINE_MAGIC, UDP_HEADER_SIZE};
use crate::util::buf_ext::BufExt;
use crate::util::safe_converter::PrecheckedCast;

/// Messages exchanged before a connection exists. Each one is a datagram of its own, starting
///  with its [MessageId] and (with the exception of the ping / pong timestamps) the
///  [OFFLINE_MAGIC] right after it.
///
/// ```ascii
/// UnconnectedPing              id, time u64, magic, client guid u64
/// UnconnectedPong              id, time u64, server guid u64, magic, data len u16, data
/// OpenConnectionRequest1       id, magic, protocol u8, zero padding up to the probed MTU
/// OpenConnectionReply1         id, magic, server guid, security u8, mtu u16
/// OpenConnectionRequest2       id, magic, server address, mtu u16, client guid
/// OpenConnectionReply2         id, magic, server guid, client address, mtu u16, security u8
/// IncompatibleProtocolVersion  id, protocol u8, magic, server guid
/// AlreadyConnected etc.        id, magic, guid
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum OfflineMessage {
    UnconnectedPing {
        time: u64,
        client_guid: RakNetGuid,
        only_if_open_connections: bool,
    },
    UnconnectedPong {
        time: u64,
        server_guid: RakNetGuid,
        data: Bytes,
    },
    OpenConnectionRequest1 {
        protocol_version: u8,
        /// not transmitted explicitly: the datagram is padded so that its size reflects the MTU
        mtu: u16,
    },
    OpenConnectionReply1 {
        server_guid: RakNetGuid,
        has_security: bool,
        mtu: u16,
    },
    OpenConnectionRequest2 {
        server_address: SystemAddress,
        mtu: u16,
        client_guid: RakNetGuid,
    },
    OpenConnectionReply2 {
        server_guid: RakNetGuid,
        client_address: SystemAddress,
        mtu: u16,
        has_security: bool,
    },
    IncompatibleProtocolVersion {
        protocol_version: u8,
        server_guid: RakNetGuid,
    },
    AlreadyConnected { guid: RakNetGuid },
    NoFreeIncomingConnections { guid: RakNetGuid },
    ConnectionBanned { guid: RakNetGuid },
    IpRecentlyConnected { guid: RakNetGuid },
}

/// true if a datagram starts like an offline message rather than a connected datagram
pub fn is_offline_message(datagram: &[u8]) -> bool {
    datagram.first()
        .map(|b| b & 0x80 == 0)
        .unwrap_or(false)
}

fn read_magic(buf: &mut impl Buf) -> anyhow::Result<()> {
    let magic = buf.try_read_array::<16>()?;
    if magic != OFFLINE_MAGIC {
        bail!("offline message magic mismatch");
    }
    Ok(())
}

fn read_guid(buf: &mut impl Buf) -> anyhow::Result<RakNetGuid> {
    Ok(RakNetGuid::from_raw(buf.try_read_u64()?))
}

impl OfflineMessage {
    pub fn id(&self) -> MessageId {
        match self {
            OfflineMessage::UnconnectedPing { only_if_open_connections: false, .. } => MessageId::UnconnectedPing,
            OfflineMessage::UnconnectedPing { only_if_open_connections: true, .. } => MessageId::UnconnectedPingOpenConnections,
            OfflineMessage::UnconnectedPong { .. } => MessageId::UnconnectedPong,
            OfflineMessage::OpenConnectionRequest1 { .. } => MessageId::OpenConnectionRequest1,
            OfflineMessage::OpenConnectionReply1 { .. } => MessageId::OpenConnectionReply1,
            OfflineMessage::OpenConnectionRequest2 { .. } => MessageId::OpenConnectionRequest2,
            OfflineMessage::OpenConnectionReply2 { .. } => MessageId::OpenConnectionReply2,
            OfflineMessage::IncompatibleProtocolVersion { .. } => MessageId::IncompatibleProtocolVersion,
            OfflineMessage::AlreadyConnected { .. } => MessageId::AlreadyConnected,
            OfflineMessage::NoFreeIncomingConnections { .. } => MessageId::NoFreeIncomingConnections,
            OfflineMessage::ConnectionBanned { .. } => MessageId::ConnectionBanned,
            OfflineMessage::IpRecentlyConnected { .. } => MessageId::IpRecentlyConnected,
        }
    }

    /// The MTU announced by the sender, for the handshake messages that carry one
    pub fn announced_mtu(&self) -> Option<u16> {
        match self {
            OfflineMessage::OpenConnectionRequest1 { mtu, .. }
            | OfflineMessage::OpenConnectionReply1 { mtu, .. }
            | OfflineMessage::OpenConnectionRequest2 { mtu, .. }
            | OfflineMessage::OpenConnectionReply2 { mtu, .. } => Some(*mtu),
            _ => None,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let start_len = buf.len();
        buf.put_u8(self.id().into());

        match self {
            OfflineMessage::UnconnectedPing { time, client_guid, .. } => {
                buf.put_u64(*time);
                buf.put_slice(&OFFLINE_MAGIC);
                buf.put_u64(client_guid.to_raw());
            }
            OfflineMessage::UnconnectedPong { time, server_guid, data } => {
                buf.put_u64(*time);
                buf.put_u64(server_guid.to_raw());
                buf.put_slice(&OFFLINE_MAGIC);
                buf.put_u16(data.len().prechecked_cast());
                buf.put_slice(data);
            }
            OfflineMessage::OpenConnectionRequest1 { protocol_version, mtu } => {
                buf.put_slice(&OFFLINE_MAGIC);
                buf.put_u8(*protocol_version);
                let target_len = (*mtu as usize).saturating_sub(UDP_HEADER_SIZE);
                let written = buf.len() - start_len;
                if target_len > written {
                    buf.put_bytes(0, target_len - written);
                }
            }
            OfflineMessage::OpenConnectionReply1 { server_guid, has_security, mtu } => {
                buf.put_slice(&OFFLINE_MAGIC);
                buf.put_u64(server_guid.to_raw());
                buf.put_u8(*has_security as u8);
                buf.put_u16(*mtu);
            }
            OfflineMessage::OpenConnectionRequest2 { server_address, mtu, client_guid } => {
                buf.put_slice(&OFFLINE_MAGIC);
                server_address.ser(buf);
                buf.put_u16(*mtu);
                buf.put_u64(client_guid.to_raw());
            }
            OfflineMessage::OpenConnectionReply2 { server_guid, client_address, mtu, has_security } => {
                buf.put_slice(&OFFLINE_MAGIC);
                buf.put_u64(server_guid.to_raw());
                client_address.ser(buf);
                buf.put_u16(*mtu);
                buf.put_u8(*has_security as u8);
            }
            OfflineMessage::IncompatibleProtocolVersion { protocol_version, server_guid } => {
                buf.put_u8(*protocol_version);
                buf.put_slice(&OFFLINE_MAGIC);
                buf.put_u64(server_guid.to_raw());
            }
            OfflineMessage::AlreadyConnected { guid } |
            OfflineMessage::NoFreeIncomingConnections { guid } |
            OfflineMessage::ConnectionBanned { guid } |
            OfflineMessage::IpRecentlyConnected { guid } => {
                buf.put_slice(&OFFLINE_MAGIC);
                buf.put_u64(guid.to_raw());
            }
        }
    }

    /// Parses a complete datagram. The MTU of [OfflineMessage::OpenConnectionRequest1] is
    ///  derived from the datagram's size.
    pub fn deser(datagram: &[u8]) -> anyhow::Result<OfflineMessage> {
        let mut buf = datagram;
        let raw_id = buf.try_read_u8()?;
        let id = MessageId::try_from_primitive(raw_id)
            .map_err(|_| anyhow!("unknown offline message id {:#04x}", raw_id))?;

        let result = match id {
            MessageId::UnconnectedPing | MessageId::UnconnectedPingOpenConnections => {
                let time = buf.try_read_u64()?;
                read_magic(&mut buf)?;
                OfflineMessage::UnconnectedPing {
                    time,
                    client_guid: read_guid(&mut buf)?,
                    only_if_open_connections: id == MessageId::UnconnectedPingOpenConnections,
                }
            }
            MessageId::UnconnectedPong => {
                let time = buf.try_read_u64()?;
                let server_guid = read_guid(&mut buf)?;
                read_magic(&mut buf)?;
                let len = buf.try_read_u16()?;
                OfflineMessage::UnconnectedPong {
                    time,
                    server_guid,
                    data: buf.try_read_bytes(len as usize)?,
                }
            }
            MessageId::OpenConnectionRequest1 => {
                read_magic(&mut buf)?;
                let protocol_version = buf.try_read_u8()?;
                let mtu = datagram.len() + UDP_HEADER_SIZE;
                buf.advance(buf.remaining());
                OfflineMessage::OpenConnectionRequest1 {
                    protocol_version,
                    mtu: u16::try_from(mtu)?,
                }
            }
            MessageId::OpenConnectionReply1 => {
                read_magic(&mut buf)?;
                OfflineMessage::OpenConnectionReply1 {
                    server_guid: read_guid(&mut buf)?,
                    has_security: buf.try_read_u8()? != 0,
                    mtu: buf.try_read_u16()?,
                }
            }
            MessageId::OpenConnectionRequest2 => {
                read_magic(&mut buf)?;
                OfflineMessage::OpenConnectionRequest2 {
                    server_address: SystemAddress::deser(&mut buf)?,
                    mtu: buf.try_read_u16()?,
                    client_guid: read_guid(&mut buf)?,
                }
            }
            MessageId::OpenConnectionReply2 => {
                read_magic(&mut buf)?;
                OfflineMessage::OpenConnectionReply2 {
                    server_guid: read_guid(&mut buf)?,
                    client_address: SystemAddress::deser(&mut buf)?,
                    mtu: buf.try_read_u16()?,
                    has_security: buf.try_read_u8()? != 0,
                }
            }
            MessageId::IncompatibleProtocolVersion => {
                let protocol_version = buf.try_read_u8()?;
                read_magic(&mut buf)?;
                OfflineMessage::IncompatibleProtocolVersion {
                    protocol_version,
                    server_guid: read_guid(&mut buf)?,
                }
            }
            MessageId::AlreadyConnected => {
                read_magic(&mut buf)?;
                OfflineMessage::AlreadyConnected { guid: read_guid(&mut buf)? }
            }
            MessageId::NoFreeIncomingConnections => {
                read_magic(&mut buf)?;
                OfflineMessage::NoFreeIncomingConnections { guid: read_guid(&mut buf)? }
            }
            MessageId::ConnectionBanned => {
                read_magic(&mut buf)?;
                OfflineMessage::ConnectionBanned { guid: read_guid(&mut buf)? }
            }
            MessageId::IpRecentlyConnected => {
                read_magic(&mut buf)?;
                OfflineMessage::IpRecentlyConnected { guid: read_guid(&mut buf)? }
            }
            other => bail!("{:?} is not an offline message", other),
        };

        if buf.has_remaining() {
            bail!("{} trailing bytes after offline message {:?}", buf.remaining(), id);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use rstest::rstest;
    use super::*;

    fn guid(raw: u64) -> RakNetGuid {
        RakNetGuid::from_raw(raw)
    }

    #[rstest]
    #[case::ping(OfflineMessage::UnconnectedPing { time: 5, client_guid: guid(9), only_if_open_connections: false })]
    #[case::ping_open(OfflineMessage::UnconnectedPing { time: 5, client_guid: guid(9), only_if_open_connections: true })]
    #[case::pong(OfflineMessage::UnconnectedPong { time: 5, server_guid: guid(9), data: Bytes::from_static(b"MOTD") })]
    #[case::request1(OfflineMessage::OpenConnectionRequest1 { protocol_version: 6, mtu: 576 })]
    #[case::reply1(OfflineMessage::OpenConnectionReply1 { server_guid: guid(1), has_security: false, mtu: 1492 })]
    #[case::request2(OfflineMessage::OpenConnectionRequest2 { server_address: SystemAddress::from_str("1.2.3.4|19132").unwrap(), mtu: 1200, client_guid: guid(2) })]
    #[case::reply2(OfflineMessage::OpenConnectionReply2 { server_guid: guid(3), client_address: SystemAddress::from_str("::1|5").unwrap(), mtu: 1200, has_security: false })]
    #[case::incompatible(OfflineMessage::IncompatibleProtocolVersion { protocol_version: 6, server_guid: guid(4) })]
    #[case::already_connected(OfflineMessage::AlreadyConnected { guid: guid(5) })]
    #[case::no_free(OfflineMessage::NoFreeIncomingConnections { guid: guid(6) })]
    #[case::banned(OfflineMessage::ConnectionBanned { guid: guid(7) })]
    #[case::recently(OfflineMessage::IpRecentlyConnected { guid: guid(8) })]
    fn test_ser_deser(#[case] msg: OfflineMessage) {
        let mut buf = BytesMut::new();
        msg.ser(&mut buf);
        assert!(is_offline_message(&buf));
        assert_eq!(OfflineMessage::deser(&buf).unwrap(), msg);
    }

    #[test]
    fn test_request1_padding() {
        let mut buf = BytesMut::new();
        OfflineMessage::OpenConnectionRequest1 { protocol_version: 6, mtu: 1492 }.ser(&mut buf);
        assert_eq!(buf.len(), 1492 - UDP_HEADER_SIZE);
        assert_eq!(buf[0], 0x05);
        assert_eq!(&buf[1..17], &OFFLINE_MAGIC);
        assert_eq!(buf[17], 6);
        assert!(buf[18..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_ser_layout() {
        let mut buf = BytesMut::new();
        OfflineMessage::ConnectionBanned { guid: guid(0x0102030405060708) }.ser(&mut buf);

        let mut expected = vec![0x17];
        expected.extend_from_slice(&OFFLINE_MAGIC);
        expected.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(buf.as_ref(), expected.as_slice());
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::unknown_id(vec![0x7f])]
    #[case::connected_id(vec![0x09])]
    #[case::truncated(vec![0x17, 0x00, 0xff])]
    #[case::bad_magic(vec![0x17, 1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1, 0,0,0,0,0,0,0,1])]
    fn test_deser_invalid(#[case] data: Vec<u8>) {
        assert!(OfflineMessage::deser(&data).is_err());
    }

    #[test]
    fn test_trailing_bytes() {
        let mut buf = BytesMut::new();
        OfflineMessage::AlreadyConnected { guid: guid(1) }.ser(&mut buf);
        buf.put_u8(0);
        assert!(OfflineMessage::deser(&buf).is_err());
    }

    #[rstest]
    #[case::offline(vec![0x05], true)]
    #[case::online(vec![0x84], false)]
    #[case::empty(vec![], false)]
    fn test_is_offline_message(#[case] data: Vec<u8>, #[case] expected: bool) {
        assert_eq!(is_offline_message(&data), expected);
    }
}
