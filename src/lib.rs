//! Port mapping management behind a NAT.
//!
//! The crate has two halves that are meant to be used together:
//!
//! * [`reactor`], a single-threaded readiness loop that watches descriptors and
//!   dispatches callbacks on I/O or on a periodic timeout.
//! * [`client`], a Port Control Protocol (PCP, RFC 6887) client that requests,
//!   renews and expires external port mappings from the router of each network
//!   interface. Its sockets are driven by the reactor.
//!
//! The wire format lives in [`pcp`], with the legacy NAT-PMP responses that
//! share the same ports recognized by [`natpmp`].

use num_enum::TryFromPrimitive;

#[macro_use]
mod log;

pub mod addr;
pub mod client;
pub mod mapping;
pub mod natpmp;
pub mod net;
pub mod pcp;
pub mod reactor;

pub use client::{ClientConfig, PcpClient};
pub use mapping::{MappingState, PortMapping};
pub use net::{Family, InterfaceId, NetworkInterface};
pub use reactor::{Descriptor, Interest, Reactor, ReactorHandle, Readiness};

/// 8-bit version field in the NAT-PMP and PCP headers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Version {
    /// NAT-PMP identifies its version with a `0` byte.
    NatPmp = 0,

    /// PCP identifies its version with a `2` byte.
    /// The RFC explicitly states that PCP must use version `2` because non-compliant
    /// devices were created that used `1` before the creation of PCP.
    Pcp = 2,
}

/// Specifies the transport protocol to map a port for.
/// The discriminants are IANA protocol numbers, as carried in PCP messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive, displaydoc::Display)]
#[repr(u8)]
pub enum Protocol {
    /// TCP
    Tcp = 6,
    /// UDP
    Udp = 17,
}

/// The port the router listens on for NAT-PMP and its successor, PCP.
pub const SERVER_PORT: u16 = 5351;

/// The port clients send from and listen on for router announcements.
pub const CLIENT_PORT: u16 = 5350;

/// PCP messages, including options, never exceed this many bytes.
pub const MAX_DATAGRAM_SIZE: usize = 1100;

/// The lifetime the appliance requests for its mappings.
pub const RECOMMENDED_MAPPING_LIFETIME_SECONDS: u32 = 15 * 60;
