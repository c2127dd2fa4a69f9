//! Wire representation: offline handshake messages, connected datagrams with their frames, and
//!  the control messages carried inside frames.

pub mod datagram;
pub mod frame;
pub mod message_ids;
pub mod offline;
pub mod online;
pub mod reliability;
pub mod seq;
