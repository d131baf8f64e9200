//! Network interfaces as seen by the PCP client, and the socket backend it uses.
//!
//! The client never touches the operating system directly: it asks a [`Network`]
//! for [`Transport`]s. [`SystemNetwork`] is the real implementation, built on
//! `socket2` so the socket options PCP needs can be set before binding.

use std::{
    fmt, io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6, UdpSocket},
    os::fd::AsRawFd,
};

use socket2::{Domain, Protocol as IpProtocol, SockAddr, Socket, Type};

use crate::{addr, reactor::Descriptor};

/// The IPv4 all-hosts group, where routers multicast PCP announcements.
pub const ALL_HOSTS_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);

/// The IPv6 all-nodes group, where routers multicast PCP announcements.
pub const ALL_NODES_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

/// Address family of a PCP session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, displaydoc::Display)]
pub enum Family {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

impl Family {
    pub const fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }
}

/// Handle to an interface added to a [`PcpClient`](crate::PcpClient).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InterfaceId(pub(crate) usize);

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ipv4Config {
    pub address: Ipv4Addr,
    pub router: Ipv4Addr,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ipv6Config {
    pub link_local: Ipv6Addr,
    pub site_local: Option<Ipv6Addr>,
    /// Global addresses, only the first three are considered.
    pub global: Vec<Ipv6Addr>,
    /// Usually link-local, as learned from router advertisements.
    pub router: Ipv6Addr,
    /// Interface index, needed to use link-local addresses.
    pub scope_id: u32,
}

impl Ipv6Config {
    /// Addresses a PCP socket may be bound to.
    pub fn candidates(&self) -> impl Iterator<Item = Ipv6Addr> + '_ {
        std::iter::once(self.link_local)
            .chain(self.site_local)
            .chain(self.global.iter().take(3).copied())
            .filter(|a| !a.is_unspecified())
    }

    /// The local address sharing the longest prefix with the router, if any shares a bit.
    pub fn closest_to_router(&self) -> Option<Ipv6Addr> {
        let router = self.router.octets();
        let mut best = None;
        let mut best_bits = 0;
        for candidate in self.candidates() {
            let bits = addr::matching_bits(&candidate.octets(), &router);
            if bits > best_bits {
                best = Some(candidate);
                best_bits = bits;
            }
        }
        best
    }
}

/// A local network attachment, e.g. the WiFi station or access point.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkInterface {
    pub name: String,
    pub ipv4: Option<Ipv4Config>,
    pub ipv6: Option<Ipv6Config>,
}

impl NetworkInterface {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ipv4: None,
            ipv6: None,
        }
    }

    pub fn router(&self, family: Family) -> Option<IpAddr> {
        match family {
            Family::V4 => self.ipv4.as_ref().map(|c| IpAddr::V4(c.router)),
            Family::V6 => self.ipv6.as_ref().map(|c| IpAddr::V6(c.router)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("UDP socket error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("Failed to join multicast group {group}: {source}")]
    Join { group: IpAddr, source: io::Error },
}

/// A non-blocking datagram socket.
pub trait Transport {
    /// What the reactor should watch for this socket.
    fn descriptor(&self) -> Descriptor;

    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

/// Creates the sockets a PCP session needs.
pub trait Network {
    /// A dual-stack socket on `[::]:port` that also receives IPv4, joined to the
    /// all-hosts groups of both families so router announcements reach it.
    /// `ipv4_interface` selects the interface for the IPv4 group.
    fn open_listener(
        &self,
        port: u16,
        ipv4_interface: Ipv4Addr,
        scope_id: u32,
    ) -> Result<Box<dyn Transport>, SocketError>;

    /// A socket bound to one local IPv6 address.
    fn open_bound(&self, addr: SocketAddrV6) -> Result<Box<dyn Transport>, SocketError>;
}

/// Sockets from the operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemNetwork;

impl SystemNetwork {
    fn new_socket() -> Result<Socket, SocketError> {
        let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(IpProtocol::UDP))?;
        // Other software on the host listens for all-hosts multicast, and the
        // listener and the bound socket share the client port.
        socket.set_reuse_address(true)?;
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;
        Ok(socket)
    }

    fn bind(socket: &Socket, addr: SocketAddrV6) -> Result<(), SocketError> {
        socket
            .bind(&SockAddr::from(addr))
            .map_err(|source| SocketError::Bind {
                addr: addr.into(),
                source,
            })
    }
}

impl Network for SystemNetwork {
    fn open_listener(
        &self,
        port: u16,
        ipv4_interface: Ipv4Addr,
        scope_id: u32,
    ) -> Result<Box<dyn Transport>, SocketError> {
        let socket = Self::new_socket()?;
        socket.set_only_v6(false)?;
        Self::bind(&socket, SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0))?;

        // Joining fails with `AddrNotAvailable` when the host already is a member.
        match socket.join_multicast_v4(&ALL_HOSTS_V4, &ipv4_interface) {
            Err(e) if e.kind() != io::ErrorKind::AddrNotAvailable => {
                return Err(SocketError::Join {
                    group: ALL_HOSTS_V4.into(),
                    source: e,
                })
            }
            _ => {}
        }
        match socket.join_multicast_v6(&ALL_NODES_V6, scope_id) {
            Err(e) if e.kind() != io::ErrorKind::AddrNotAvailable => {
                return Err(SocketError::Join {
                    group: ALL_NODES_V6.into(),
                    source: e,
                })
            }
            _ => {}
        }

        Ok(Box::new(UdpTransport(socket.into())))
    }

    fn open_bound(&self, addr: SocketAddrV6) -> Result<Box<dyn Transport>, SocketError> {
        let socket = Self::new_socket()?;
        Self::bind(&socket, addr)?;
        Ok(Box::new(UdpTransport(socket.into())))
    }
}

/// [`Transport`] over a non-blocking standard library socket.
#[derive(Debug)]
pub struct UdpTransport(pub UdpSocket);

impl Transport for UdpTransport {
    fn descriptor(&self) -> Descriptor {
        Descriptor::from_raw(self.0.as_raw_fd())
    }

    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.0.send_to(buf, target)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.0.recv_from(buf)
    }
}

#[cfg(test)]
mod tests;
