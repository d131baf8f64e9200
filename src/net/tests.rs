use super::*;

fn ipv6_config(router: &str) -> Ipv6Config {
    Ipv6Config {
        link_local: "fe80::1234".parse().unwrap(),
        site_local: None,
        global: vec![
            "2001:db8:1::10".parse().unwrap(),
            "2001:db8:2::10".parse().unwrap(),
            "2001:db8:3::10".parse().unwrap(),
            "2001:db8:2::99".parse().unwrap(),
        ],
        router: router.parse().unwrap(),
        scope_id: 2,
    }
}

#[test]
fn test_link_local_router_picks_link_local() {
    let config = ipv6_config("fe80::1");
    assert_eq!(config.closest_to_router(), Some(config.link_local));
}

#[test]
fn test_global_router_picks_longest_prefix() {
    let config = ipv6_config("2001:db8:2::1");
    assert_eq!(
        config.closest_to_router(),
        Some("2001:db8:2::10".parse().unwrap())
    );
}

#[test]
fn test_only_three_globals_considered() {
    let config = ipv6_config("2001:db8:2::99");
    // The exact match is the fourth global address and is ignored.
    assert_eq!(config.candidates().count(), 4);
    assert_eq!(
        config.closest_to_router(),
        Some("2001:db8:2::10".parse().unwrap())
    );
}

#[test]
fn test_no_matching_bits() {
    let mut config = ipv6_config("8000::1");
    config.link_local = Ipv6Addr::UNSPECIFIED;
    config.global.clear();
    config.site_local = Some("7fff::1".parse().unwrap());
    assert_eq!(config.closest_to_router(), None);
}

#[test]
fn test_interface_router_by_family() {
    let mut iface = NetworkInterface::new("sta");
    assert_eq!(iface.router(Family::V4), None);
    iface.ipv4 = Some(Ipv4Config {
        address: Ipv4Addr::new(192, 168, 1, 20),
        router: Ipv4Addr::new(192, 168, 1, 1),
    });
    assert_eq!(
        iface.router(Family::V4),
        Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)))
    );
    assert_eq!(iface.router(Family::V6), None);
}

#[test]
fn test_bound_socket_round_trip() {
    // Hosts without IPv6 loopback cannot run this.
    let Ok(b) = UdpSocket::bind("[::1]:0") else {
        return;
    };
    let a = SystemNetwork
        .open_bound(SocketAddrV6::new(Ipv6Addr::LOCALHOST, 0, 0, 0))
        .unwrap();
    let target = b.local_addr().unwrap();
    assert_eq!(a.send_to(b"ping", target).unwrap(), 4);
    let mut buf = [0u8; 8];
    let (n, from) = b.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"ping");
    assert_eq!(from.ip(), IpAddr::V6(Ipv6Addr::LOCALHOST));
}
