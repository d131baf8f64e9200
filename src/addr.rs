//! Address helpers shared by the PCP codec and client.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Count the leading bits two byte strings have in common.
/// Only the overlapping prefix of the two slices is compared.
pub fn matching_bits(a: &[u8], b: &[u8]) -> usize {
    let mut bits = 0;
    for (x, y) in a.iter().zip(b) {
        let diff = x ^ y;
        if diff != 0 {
            return bits + diff.leading_zeros() as usize;
        }
        bits += 8;
    }
    bits
}

/// Whether the 16 address bytes hold an IPv4-mapped-IPv6 address, `::ffff:a.b.c.d`.
pub fn is_ipv4_mapped(octets: &[u8; 16]) -> bool {
    octets[..10].iter().all(|&b| b == 0) && octets[10] == 0xff && octets[11] == 0xff
}

/// Convert an address to the 128-bit form PCP carries on the wire.
pub fn to_pcp_address(addr: IpAddr) -> Ipv6Addr {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

/// Recover the original address family of a 128-bit PCP address.
pub fn from_pcp_address(addr: Ipv6Addr) -> IpAddr {
    let octets = addr.octets();
    if is_ipv4_mapped(&octets) {
        IpAddr::V4(Ipv4Addr::new(octets[12], octets[13], octets[14], octets[15]))
    } else {
        IpAddr::V6(addr)
    }
}

/// Fold an IPv4-mapped IPv6 address back into IPv4.
/// Dual-stack sockets report IPv4 peers this way.
pub fn normalize(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => from_pcp_address(v6),
        v4 => v4,
    }
}

/// Classification of an IPv6 address, used to reject useless mappings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, displaydoc::Display)]
pub enum Ipv6Kind {
    /// unknown
    Unknown,
    /// global
    Global,
    /// link-local
    LinkLocal,
    /// site-local
    SiteLocal,
    /// unique-local
    UniqueLocal,
    /// IPv4-mapped
    Ipv4Mapped,
}

impl Ipv6Kind {
    pub fn of(addr: &Ipv6Addr) -> Self {
        let first = addr.segments()[0];
        if first & 0xe000 == 0x2000 {
            Self::Global
        } else if first & 0xffc0 == 0xfe80 {
            Self::LinkLocal
        } else if first & 0xffc0 == 0xfec0 {
            Self::SiteLocal
        } else if first & 0xfe00 == 0xfc00 {
            Self::UniqueLocal
        } else if is_ipv4_mapped(&addr.octets()) {
            Self::Ipv4Mapped
        } else {
            Self::Unknown
        }
    }
}

#[cfg(test)]
mod tests;
