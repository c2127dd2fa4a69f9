use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The delivery contract of a single message. The numeric values are RakNet's and go on the
///  wire as a 3-bit field.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum PacketReliability {
    /// At most once, no ordering. Duplicates are dropped, losses are not repaired.
    Unreliable = 0,
    /// Like [PacketReliability::Unreliable], but anything older than the newest message already
    ///  received on the same channel is dropped.
    UnreliableSequenced = 1,
    /// Resent until acknowledged, delivered as soon as it arrives.
    Reliable = 2,
    /// Resent until acknowledged, and held back until all earlier ordered messages on the same
    ///  channel were delivered.
    ReliableOrdered = 3,
    /// Resent until acknowledged, stale messages on the channel are dropped.
    ReliableSequenced = 4,
    UnreliableWithAckReceipt = 5,
    ReliableWithAckReceipt = 6,
    ReliableOrderedWithAckReceipt = 7,
}

impl PacketReliability {
    pub fn is_reliable(self) -> bool {
        matches!(self,
            PacketReliability::Reliable |
            PacketReliability::ReliableOrdered |
            PacketReliability::ReliableSequenced |
            PacketReliability::ReliableWithAckReceipt |
            PacketReliability::ReliableOrderedWithAckReceipt
        )
    }

    pub fn is_ordered(self) -> bool {
        matches!(self, PacketReliability::ReliableOrdered | PacketReliability::ReliableOrderedWithAckReceipt)
    }

    pub fn is_sequenced(self) -> bool {
        matches!(self, PacketReliability::UnreliableSequenced | PacketReliability::ReliableSequenced)
    }

    pub fn requires_ack_receipt(self) -> bool {
        matches!(self,
            PacketReliability::UnreliableWithAckReceipt |
            PacketReliability::ReliableWithAckReceipt |
            PacketReliability::ReliableOrderedWithAckReceipt
        )
    }

    /// Sequenced and ordered messages carry an ordering channel on the wire
    pub fn has_ordering_channel(self) -> bool {
        self.is_ordered() || self.is_sequenced()
    }

    /// The reliable counterpart, used for messages that must be split: losing a single fragment
    ///  would otherwise lose the whole message.
    pub fn upgraded_for_split(self) -> PacketReliability {
        match self {
            PacketReliability::Unreliable => PacketReliability::Reliable,
            PacketReliability::UnreliableSequenced => PacketReliability::ReliableSequenced,
            PacketReliability::UnreliableWithAckReceipt => PacketReliability::ReliableWithAckReceipt,
            other => other,
        }
    }
}


#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum PacketPriority {
    /// Sent on the calling task without waiting for the next update tick
    Immediate = 0,
    High = 1,
    Medium = 2,
    Low = 3,
}

impl PacketPriority {
    pub const ALL: [PacketPriority; 4] = [PacketPriority::Immediate, PacketPriority::High, PacketPriority::Medium, PacketPriority::Low];

    /// Relative share of each update tick's datagrams: every level gets twice the share of the
    ///  next lower one.
    pub fn scheduling_weight(self) -> u32 {
        1 << (3 - u8::from(self))
    }
}
