use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::TryFromPrimitive;
use crate::addr::{RakNetGuid, SystemAddress};
use crate::protocol::message_ids::MessageId;
use crate::util::buf_ext::BufExt;

/// The payload of a frame on an established (or establishing) connection: either one of the
///  engine's own control messages or an application message.
///
/// ```ascii
/// ConnectedPing              0x00, send time u64
/// ConnectedPong              0x03, ping time u64, pong time u64
/// ConnectionRequest          0x09, client guid u64, time u64, password (rest of payload)
/// ConnectionRequestAccepted  0x10, client address, request time u64, accept time u64
/// NewIncomingConnection      0x13, server address, request time u64, accept time u64
/// DisconnectionNotification  0x15
/// InvalidPassword            0x18
/// User                       0x86, application payload (rest of payload)
/// ```
///
/// Times are milliseconds on the sending peer's clock.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum OnlineMessage {
    ConnectedPing {
        send_time: u64,
    },
    ConnectedPong {
        ping_time: u64,
        pong_time: u64,
    },
    ConnectionRequest {
        client_guid: RakNetGuid,
        time: u64,
        password: Bytes,
    },
    ConnectionRequestAccepted {
        client_address: SystemAddress,
        request_time: u64,
        accept_time: u64,
    },
    NewIncomingConnection {
        server_address: SystemAddress,
        request_time: u64,
        accept_time: u64,
    },
    DisconnectionNotification,
    InvalidPassword,
    User(Bytes),
}

impl OnlineMessage {
    pub fn id(&self) -> MessageId {
        match self {
            OnlineMessage::ConnectedPing { .. } => MessageId::ConnectedPing,
            OnlineMessage::ConnectedPong { .. } => MessageId::ConnectedPong,
            OnlineMessage::ConnectionRequest { .. } => MessageId::ConnectionRequest,
            OnlineMessage::ConnectionRequestAccepted { .. } => MessageId::ConnectionRequestAccepted,
            OnlineMessage::NewIncomingConnection { .. } => MessageId::NewIncomingConnection,
            OnlineMessage::DisconnectionNotification => MessageId::DisconnectionNotification,
            OnlineMessage::InvalidPassword => MessageId::InvalidPassword,
            OnlineMessage::User(_) => MessageId::UserPacket,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.id().into());
        match self {
            OnlineMessage::ConnectedPing { send_time } => {
                buf.put_u64(*send_time);
            }
            OnlineMessage::ConnectedPong { ping_time, pong_time } => {
                buf.put_u64(*ping_time);
                buf.put_u64(*pong_time);
            }
            OnlineMessage::ConnectionRequest { client_guid, time, password } => {
                buf.put_u64(client_guid.to_raw());
                buf.put_u64(*time);
                buf.put_slice(password);
            }
            OnlineMessage::ConnectionRequestAccepted { client_address, request_time, accept_time } => {
                client_address.ser(buf);
                buf.put_u64(*request_time);
                buf.put_u64(*accept_time);
            }
            OnlineMessage::NewIncomingConnection { server_address, request_time, accept_time } => {
                server_address.ser(buf);
                buf.put_u64(*request_time);
                buf.put_u64(*accept_time);
            }
            OnlineMessage::DisconnectionNotification |
            OnlineMessage::InvalidPassword => {}
            OnlineMessage::User(payload) => {
                buf.put_slice(payload);
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    /// Parses a complete (reassembled) frame payload
    pub fn deser(payload: &Bytes) -> anyhow::Result<OnlineMessage> {
        let mut buf = payload.clone();
        let raw_id = buf.try_read_u8()?;
        let id = MessageId::try_from_primitive(raw_id)
            .map_err(|_| anyhow!("unknown message id {:#04x}", raw_id))?;

        let result = match id {
            MessageId::ConnectedPing => OnlineMessage::ConnectedPing {
                send_time: buf.try_read_u64()?,
            },
            MessageId::ConnectedPong => OnlineMessage::ConnectedPong {
                ping_time: buf.try_read_u64()?,
                pong_time: buf.try_read_u64()?,
            },
            MessageId::ConnectionRequest => OnlineMessage::ConnectionRequest {
                client_guid: RakNetGuid::from_raw(buf.try_read_u64()?),
                time: buf.try_read_u64()?,
                password: buf.split_to(buf.len()),
            },
            MessageId::ConnectionRequestAccepted => OnlineMessage::ConnectionRequestAccepted {
                client_address: SystemAddress::deser(&mut buf)?,
                request_time: buf.try_read_u64()?,
                accept_time: buf.try_read_u64()?,
            },
            MessageId::NewIncomingConnection => OnlineMessage::NewIncomingConnection {
                server_address: SystemAddress::deser(&mut buf)?,
                request_time: buf.try_read_u64()?,
                accept_time: buf.try_read_u64()?,
            },
            MessageId::DisconnectionNotification => OnlineMessage::DisconnectionNotification,
            MessageId::InvalidPassword => OnlineMessage::InvalidPassword,
            MessageId::UserPacket => OnlineMessage::User(buf.split_to(buf.len())),
            other => bail!("{:?} is not a connected message", other),
        };

        if buf.has_remaining() {
            bail!("{} trailing bytes after {:?}", buf.remaining(), id);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::ping(OnlineMessage::ConnectedPing { send_time: 17 })]
    #[case::pong(OnlineMessage::ConnectedPong { ping_time: 17, pong_time: 99 })]
    #[case::request(OnlineMessage::ConnectionRequest { client_guid: RakNetGuid::from_raw(3), time: 5, password: Bytes::from_static(b"secret") })]
    #[case::request_no_password(OnlineMessage::ConnectionRequest { client_guid: RakNetGuid::from_raw(3), time: 5, password: Bytes::new() })]
    #[case::accepted(OnlineMessage::ConnectionRequestAccepted { client_address: SystemAddress::from_str("10.0.0.1|4000").unwrap(), request_time: 5, accept_time: 6 })]
    #[case::new_incoming(OnlineMessage::NewIncomingConnection { server_address: SystemAddress::from_str("::1|4000").unwrap(), request_time: 5, accept_time: 6 })]
    #[case::disconnect(OnlineMessage::DisconnectionNotification)]
    #[case::invalid_password(OnlineMessage::InvalidPassword)]
    #[case::user(OnlineMessage::User(Bytes::from_static(&[1, 2, 3])))]
    #[case::user_empty(OnlineMessage::User(Bytes::new()))]
    fn test_ser_deser(#[case] msg: OnlineMessage) {
        let bytes = msg.to_bytes();
        assert_eq!(bytes[0], u8::from(msg.id()));
        assert_eq!(OnlineMessage::deser(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_ping_layout() {
        assert_eq!(
            OnlineMessage::ConnectedPing { send_time: 0x0102 }.to_bytes().as_ref(),
            &[0x00, 0,0,0,0,0,0,1,2]
        );
        assert_eq!(
            OnlineMessage::User(Bytes::from_static(b"x")).to_bytes().as_ref(),
            &[0x86, b'x']
        );
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::unknown(vec![0x7e])]
    #[case::offline_id(vec![0x05])]
    #[case::truncated_ping(vec![0x00, 1, 2])]
    #[case::trailing(vec![0x15, 0])]
    fn test_deser_invalid(#[case] data: Vec<u8>) {
        assert!(OnlineMessage::deser(&Bytes::from(data)).is_err());
    }
}
