use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use crate::addr::{RakNetGuid, SystemAddress};
use crate::peer::error::RakNetError;

/// Something that happened, as returned by [crate::peer::MessageTransfer::receive]
#[derive(Debug, Clone)]
pub enum PacketKind {
    /// A message sent by the remote application
    UserMessage(Bytes),
    /// Our outgoing connection attempt succeeded
    ConnectionRequestAccepted,
    /// A remote peer completed connecting to us
    NewIncomingConnection,
    /// The remote closed the connection gracefully
    DisconnectionNotification,
    /// The remote stopped answering
    ConnectionLost,
    /// An outgoing connection attempt failed or was cancelled
    ConnectionAttemptFailed(Arc<RakNetError>),
    ReceiptAcked(u32),
    ReceiptLoss(u32),
    /// Answer to [crate::peer::PeerDiagnostics::ping_unconnected]
    UnconnectedPong {
        ping: Duration,
        data: Bytes,
    },
}

#[derive(Debug, Clone)]
pub struct Packet {
    pub system_address: SystemAddress,
    pub guid: RakNetGuid,
    pub kind: PacketKind,
}

impl Packet {
    pub fn new(system_address: SystemAddress, guid: RakNetGuid, kind: PacketKind) -> Packet {
        Packet {
            system_address,
            guid,
            kind,
        }
    }

    /// the payload for user messages, `None` for all other kinds
    pub fn payload(&self) -> Option<&Bytes> {
        match &self.kind {
            PacketKind::UserMessage(payload) => Some(payload),
            _ => None,
        }
    }
}
