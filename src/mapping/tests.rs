use std::net::{Ipv4Addr, SocketAddrV4};

use super::*;

fn mapping(internal_port: u16) -> PortMapping {
    PortMapping {
        nonce: Nonce::random(),
        protocol: Protocol::Tcp,
        internal: SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 20), internal_port).into(),
        external: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into(),
        requested_lifetime: Duration::from_secs(900),
        lifetime: Duration::from_secs(900),
        granted_at: Instant::now(),
        expires_at: None,
        state: MappingState::Requested,
        interface: InterfaceId(0),
    }
}

#[test]
fn test_insert_or_replace_by_nonce() {
    let mut table = MappingTable::new();
    let first = mapping(443);
    let second = mapping(80);
    table.insert_or_replace(first.clone());
    table.insert_or_replace(second.clone());
    assert_eq!(table.len(), 2);

    let mut replacement = first.clone();
    replacement.internal.set_port(8443);
    table.insert_or_replace(replacement);
    assert_eq!(table.len(), 2);
    assert_eq!(table.find_by_nonce(&first.nonce).unwrap().internal.port(), 8443);

    // Insertion order is kept
    let ports: Vec<_> = table.iter().map(|m| m.internal.port()).collect();
    assert_eq!(ports, [8443, 80]);
}

#[test]
fn test_for_each_removes_current() {
    let mut table = MappingTable::new();
    for port in [1, 2, 3, 4] {
        table.insert_or_replace(mapping(port));
    }
    let mut visited = Vec::new();
    table.for_each(|m| {
        visited.push(m.internal.port());
        if m.internal.port() % 2 == 0 {
            Visit::Remove
        } else {
            Visit::Keep
        }
    });
    assert_eq!(visited, [1, 2, 3, 4]);
    let left: Vec<_> = table.iter().map(|m| m.internal.port()).collect();
    assert_eq!(left, [1, 3]);
}

#[test]
fn test_remove_and_clear() {
    let mut table = MappingTable::new();
    let m = mapping(443);
    table.insert_or_replace(m.clone());
    table.insert_or_replace(mapping(80));
    assert_eq!(table.remove(&m.nonce).unwrap().internal.port(), 443);
    assert!(table.remove(&m.nonce).is_none());
    table.clear();
    assert!(table.is_empty());
}

#[test]
fn test_grant_expires_one_second_early() {
    let mut m = mapping(443);
    let now = Instant::now();
    let external = SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 1), 7300).into();
    m.grant(external, Duration::from_secs(900), now);
    assert_eq!(m.state, MappingState::Granted);
    assert_eq!(m.expires_at, Some(now + Duration::from_secs(899)));
    assert_eq!(m.remaining(now + Duration::from_secs(600)), Duration::from_secs(299));
    assert_eq!(m.remaining(now + Duration::from_secs(1000)), Duration::ZERO);
}
