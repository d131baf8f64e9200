use std::net::Ipv4Addr;

use super::*;

fn map_request() -> Request {
    Request::map(
        Nonce([1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]),
        Protocol::Tcp,
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
        443,
        (IpAddr::V4(Ipv4Addr::UNSPECIFIED), 7300),
        900,
    )
}

#[test]
fn test_decode_too_short() {
    // Less than 24 bytes should return TooShort
    let bb = BytesMut::from(&[2u8; 16][..]);
    let err = Message::decode(&bb).unwrap_err();
    assert!(matches!(
        err,
        DecodeError::TooShort {
            needed: HEADER_SIZE,
            got: 16,
            ..
        }
    ));
}

#[test]
fn test_decode_map_too_short() {
    // A full header, but the MAP body is cut short
    let mut bb = BytesMut::from(&map_request().encode()[..]);
    bb.truncate(HEADER_SIZE + 20);
    let err = Message::decode(&bb).unwrap_err();
    assert!(matches!(
        err,
        DecodeError::TooShort {
            what: "MAP",
            needed: 60,
            got: 44,
        }
    ));
}

#[test]
fn test_decode_unknown_version() {
    // Correct length, but version is neither PCP nor NAT-PMP
    let mut bb = BytesMut::with_capacity(24);
    bb.put_u8(0xFF); // version (invalid)
    bb.put_bytes(0u8, 23); // rest of header unchecked
    let err = Message::decode(&bb).unwrap_err();
    assert!(matches!(err, DecodeError::UnknownVersion(0xFF)));
}

#[test]
fn test_decode_unknown_opcode() {
    let mut bb = BytesMut::with_capacity(24);
    bb.put_u8(Version::Pcp as u8);
    bb.put_u8(0x80 | 0x05);
    bb.put_bytes(0, 22);
    let err = Message::decode(&bb).unwrap_err();
    assert!(matches!(err, DecodeError::UnknownOpcode(0x05)));
}

#[test]
fn test_decode_announce_response() {
    // 24 bytes, correct version, opcode, result code = Success
    let mut bb = BytesMut::with_capacity(24);
    bb.put_u8(Version::Pcp as u8);
    bb.put_u8(0x80 | OperationCode::Announce as u8); // opcode with R MSb set
    bb.put_u8(0x00); // reserved
    bb.put_u8(ResultCode::Success as u8);
    bb.put_u32(10); // lifetime
    bb.put_u32(20); // epoch
    bb.put_bytes(0, 12); // reserved
    let Message::Response(res) = Message::decode(&bb).unwrap() else {
        panic!("expected a response");
    };
    assert_eq!(res.lifetime_seconds, 10);
    assert_eq!(res.epoch_seconds, 20);
    assert_eq!(res.data, OpcodeData::Announce);
}

#[test]
fn test_encode_map_request_layout() {
    let encoded = map_request().encode();
    assert_eq!(encoded.len(), 60);
    assert_eq!(encoded[0], 2);
    assert_eq!(encoded[1], OperationCode::Map as u8);
    assert_eq!(&encoded[2..4], &[0, 0]);
    assert_eq!(&encoded[4..8], &900u32.to_be_bytes());
    // IPv4-mapped client address
    assert_eq!(&encoded[8..18], &[0; 10]);
    assert_eq!(&encoded[18..20], &[0xff, 0xff]);
    assert_eq!(&encoded[20..24], &[192, 168, 1, 20]);
    assert_eq!(&encoded[24..36], &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
    assert_eq!(encoded[36], 6);
    assert_eq!(&encoded[37..40], &[0, 0, 0]);
    assert_eq!(&encoded[40..42], &443u16.to_be_bytes());
    assert_eq!(&encoded[42..44], &7300u16.to_be_bytes());
    assert_eq!(&encoded[44..56], &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff]);
    assert_eq!(&encoded[56..60], &[0, 0, 0, 0]);
}

#[test]
fn test_map_request_decodes_to_itself() {
    let request = map_request();
    let decoded = Message::decode(&request.encode()).unwrap();
    assert_eq!(decoded, Message::Request(request.clone()));

    let Message::Request(Request {
        client_address,
        data: OpcodeData::Map(map),
        ..
    }) = decoded
    else {
        panic!("expected a MAP request");
    };
    assert_eq!(
        addr::from_pcp_address(client_address),
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20))
    );
    assert_eq!(
        addr::from_pcp_address(map.external_address),
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    );
}

#[test]
fn test_ipv6_map_request_keeps_family() {
    let client: IpAddr = "2001:db8::42".parse().unwrap();
    let request = Request::map(
        Nonce::random(),
        Protocol::Udp,
        client,
        5000,
        (IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        60,
    );
    let Message::Request(decoded) = Message::decode(&request.encode()).unwrap() else {
        panic!("expected a request");
    };
    assert_eq!(addr::from_pcp_address(decoded.client_address), client);
    assert_eq!(decoded, request);
}

#[test]
fn test_map_response_round_trip() {
    let response = Response {
        result_code: ResultCode::NotAuthorized,
        lifetime_seconds: 30,
        epoch_seconds: 99,
        data: OpcodeData::Map(MapData {
            nonce: Nonce::random(),
            protocol: Protocol::Udp,
            internal_port: 53,
            external_port: 0,
            external_address: Ipv6Addr::UNSPECIFIED,
        }),
    };
    let encoded = response.encode();
    assert_eq!(encoded[1], 0x81);
    assert_eq!(encoded[3], 2);
    assert_eq!(Message::decode(&encoded).unwrap(), Message::Response(response));
}

#[test]
fn test_peer_response_with_options() {
    let response = Response {
        result_code: ResultCode::Success,
        lifetime_seconds: 120,
        epoch_seconds: 7,
        data: OpcodeData::Peer(PeerData {
            map: MapData {
                nonce: Nonce::random(),
                protocol: Protocol::Tcp,
                internal_port: 22,
                external_port: 2222,
                external_address: Ipv4Addr::new(203, 0, 113, 9).to_ipv6_mapped(),
            },
            remote_peer_port: 4000,
            remote_peer_address: Ipv4Addr::new(198, 51, 100, 1).to_ipv6_mapped(),
        }),
    };
    let mut bb = BytesMut::from(&response.encode()[..]);
    assert_eq!(bb.len(), 80);
    // A trailing option is ignored
    bb.put_u8(1);
    bb.put_u8(0);
    bb.put_u16(0);
    assert_eq!(Message::decode(&bb).unwrap(), Message::Response(response));
}

#[test]
fn test_unknown_result_code() {
    let mut bb = BytesMut::with_capacity(24);
    bb.put_u8(Version::Pcp as u8);
    bb.put_u8(0x80);
    bb.put_u8(0);
    bb.put_u8(200);
    bb.put_bytes(0, 20);
    let err = Message::decode(&bb).unwrap_err();
    assert!(matches!(err, DecodeError::UnknownResultCode(200)));
}

#[test]
fn test_natpmp_recognized_by_version() {
    let mut bb = BytesMut::with_capacity(12);
    bb.put_u8(Version::NatPmp as u8);
    bb.put_u8(0x80);
    bb.put_u16(0);
    bb.put_u32(3600);
    bb.put_slice(&[203, 0, 113, 5]);
    let Message::NatPmp(res) = Message::decode(&bb).unwrap() else {
        panic!("expected NAT-PMP");
    };
    assert_eq!(res.epoch_seconds, 3600);
}

#[test]
fn test_result_code_display() {
    assert_eq!(
        ResultCode::NotAuthorized.to_string(),
        "The server did not grant us permission to perform the operation."
    );
}

#[test]
fn test_random_nonces_differ() {
    assert_ne!(Nonce::random(), Nonce::random());
}
