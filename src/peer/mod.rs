//! The peer engine: owns sockets and the connection table, runs the handshake and drives every
//!  connection's reliability layer. Applications use it through [RakPeer] and the capability
//!  traits in [traits].

pub mod config;
pub mod connection_table;
mod engine;
pub mod error;
mod handshake;
pub mod packet;
pub mod plugin;
mod rak_peer;
pub mod security;
pub mod traits;

pub use config::{PeerConfig, SocketDescriptor};
pub use error::{RakNetError, RakNetResult, RefusalReason};
pub use packet::{Packet, PacketKind};
pub use plugin::{PeerPlugin, PluginId};
pub use rak_peer::RakPeer;
pub use traits::{ConnectionManagement, MessageTransfer, PeerDiagnostics, PeerLifecycle, PeerSecurity, NO_RECEIPT};
