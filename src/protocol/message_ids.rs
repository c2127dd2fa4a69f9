use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Identifies offline messages by the byte with which the datagram starts, and connected
///  control messages by the first byte of the frame payload.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum MessageId {
    ConnectedPing = 0x00,
    UnconnectedPing = 0x01,
    UnconnectedPingOpenConnections = 0x02,
    ConnectedPong = 0x03,
    OpenConnectionRequest1 = 0x05,
    OpenConnectionReply1 = 0x06,
    OpenConnectionRequest2 = 0x07,
    OpenConnectionReply2 = 0x08,
    ConnectionRequest = 0x09,
    ConnectionRequestAccepted = 0x10,
    AlreadyConnected = 0x12,
    NewIncomingConnection = 0x13,
    NoFreeIncomingConnections = 0x14,
    DisconnectionNotification = 0x15,
    ConnectionBanned = 0x17,
    InvalidPassword = 0x18,
    IncompatibleProtocolVersion = 0x19,
    IpRecentlyConnected = 0x1a,
    UnconnectedPong = 0x1c,
    UserPacket = 0x86,
}

/// Marks offline messages, making stray datagrams from other protocols unlikely to be mistaken
///  for handshake traffic
pub const OFFLINE_MAGIC: [u8; 16] = [
    0x00, 0xff, 0xff, 0x00,
    0xfe, 0xfe, 0xfe, 0xfe,
    0xfd, 0xfd, 0xfd, 0xfd,
    0x12, 0x34, 0x56, 0x78,
];

pub const PROTOCOL_VERSION: u8 = 6;

/// IP and UDP header overhead subtracted from the MTU to get the maximum datagram payload
pub const UDP_HEADER_SIZE: usize = 28;

pub const MINIMUM_MTU: u16 = 400;
pub const MAXIMUM_MTU: u16 = 1492;

/// MTUs announced by a remote peer outside these bounds are not accepted
pub fn is_valid_mtu(mtu: u16) -> bool {
    (MINIMUM_MTU..=MAXIMUM_MTU).contains(&mtu)
}

/// upper bound for ordering channels
pub const NUM_ORDERING_CHANNELS: u8 = 32;
