use super::*;

#[test]
fn test_matching_bits_differs_in_last_bit() {
    let a = [0xFFu8; 16];
    let mut b = a;
    b[15] ^= 0x01;
    assert_eq!(matching_bits(&a, &b), 127);
}

#[test]
fn test_matching_bits_differs_in_sixth_byte() {
    let a = [0x20, 0x01, 0x0d, 0xb8, 0x12, 0b0101_0000, 0, 0];
    let b = [0x20, 0x01, 0x0d, 0xb8, 0x12, 0b0100_0000, 0, 0];
    assert_eq!(matching_bits(&a, &b), 40 + 3);

    // The top bit of the sixth byte already differs.
    let c = [0x20, 0x01, 0x0d, 0xb8, 0x12, 0b1000_0000, 0, 0];
    assert_eq!(matching_bits(&a, &c), 40);
}

#[test]
fn test_matching_bits_identical() {
    let a = Ipv6Addr::LOCALHOST.octets();
    assert_eq!(matching_bits(&a, &a), 128);
    assert_eq!(matching_bits(&[], &a), 0);
}

#[test]
fn test_is_ipv4_mapped() {
    let mapped = Ipv4Addr::new(192, 168, 1, 10).to_ipv6_mapped();
    assert!(is_ipv4_mapped(&mapped.octets()));
    assert!(!is_ipv4_mapped(&Ipv6Addr::UNSPECIFIED.octets()));
    let global: Ipv6Addr = "2001:db8::1".parse().unwrap();
    assert!(!is_ipv4_mapped(&global.octets()));
}

#[test]
fn test_pcp_address_conversion() {
    let v4 = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 1));
    assert_eq!(from_pcp_address(to_pcp_address(v4)), v4);

    let v6: IpAddr = "2001:db8::7".parse().unwrap();
    assert_eq!(from_pcp_address(to_pcp_address(v6)), v6);

    // `::ffff:0.0.0.0` keeps its IPv4 meaning.
    let unspecified = Ipv4Addr::UNSPECIFIED.to_ipv6_mapped();
    assert_eq!(
        from_pcp_address(unspecified),
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    );
}

#[test]
fn test_ipv6_kind() {
    let kind = |s: &str| Ipv6Kind::of(&s.parse().unwrap());
    assert_eq!(kind("2001:db8::1"), Ipv6Kind::Global);
    assert_eq!(kind("fe80::1"), Ipv6Kind::LinkLocal);
    assert_eq!(kind("fec0::1"), Ipv6Kind::SiteLocal);
    assert_eq!(kind("fd00::1"), Ipv6Kind::UniqueLocal);
    assert_eq!(kind("::ffff:10.0.0.1"), Ipv6Kind::Ipv4Mapped);
    assert_eq!(kind("::1"), Ipv6Kind::Unknown);
    assert_eq!(Ipv6Kind::LinkLocal.to_string(), "link-local");
}
