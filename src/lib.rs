//! A reliable, connection-oriented messaging layer on top of UDP, compatible with the RakNet
//!  wire protocol.
//!
//! The entry point is [peer::RakPeer]: it binds one or more sockets, connects to and accepts
//!  connections from other peers, and delivers messages with the guarantees selected per message
//!  ([protocol::reliability::PacketReliability]): unreliable, sequenced, reliable, ordered, with
//!  or without an ack receipt. Events and received messages are polled with
//!  [peer::MessageTransfer::receive].

pub mod addr;
pub mod connection;
pub mod peer;
pub mod protocol;
pub mod socket;
pub mod test_util;
pub mod util;
