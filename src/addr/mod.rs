//! Value types naming a peer: its physical [SystemAddress], its logical [RakNetGuid], and
//!  [AddressOrGuid] for APIs that accept either.

pub mod address_or_guid;
pub mod guid;
pub mod inet_family;
pub mod system_address;

pub use address_or_guid::AddressOrGuid;
pub use guid::RakNetGuid;
pub use inet_family::InetFamily;
pub use system_address::SystemAddress;

#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("invalid address format '{input}': {reason}")]
    InvalidFormat {
        input: String,
        reason: &'static str,
    },
    #[error("port out of range: {0}")]
    PortOutOfRange(i64),
    #[error("could not resolve host '{host}'")]
    HostResolution {
        host: String,
        #[source]
        source: std::io::Error,
    },
}
