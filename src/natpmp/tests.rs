use bytes::{BufMut, BytesMut};

use super::*;

#[test]
fn test_decode_external_address() {
    let mut bb = BytesMut::with_capacity(12);
    bb.put_u8(Version::NatPmp as u8);
    bb.put_u8(RESPONSE_BIT | OperationCode::ExternalAddress as u8);
    bb.put_u16(ResultCode::Success as u16);
    bb.put_u32(1234); // epoch
    bb.put_slice(&[198, 51, 100, 7]);
    let res = Response::decode(&bb).unwrap();
    assert_eq!(res.epoch_seconds, 1234);
    assert_eq!(
        res.data,
        ResponseData::ExternalAddress(Ipv4Addr::new(198, 51, 100, 7))
    );
}

#[test]
fn test_decode_mapping_error() {
    let mut bb = BytesMut::with_capacity(16);
    bb.put_u8(Version::NatPmp as u8);
    bb.put_u8(RESPONSE_BIT | OperationCode::MapTcp as u8);
    bb.put_u16(ResultCode::OutOfResources as u16);
    bb.put_u32(5);
    bb.put_u16(443);
    bb.put_u16(0);
    bb.put_u32(0);
    let res = Response::decode(&bb).unwrap();
    assert_eq!(res.opcode, OperationCode::MapTcp);
    assert_eq!(res.result_code, ResultCode::OutOfResources);
}

#[test]
fn test_decode_too_short() {
    let mut bb = BytesMut::with_capacity(12);
    bb.put_u8(Version::NatPmp as u8);
    bb.put_u8(RESPONSE_BIT | OperationCode::MapUdp as u8);
    bb.put_bytes(0, 10); // a mapping response needs 16 bytes
    let err = Response::decode(&bb).unwrap_err();
    assert!(matches!(err, Failure::InvalidResponse(ref msg)
        if msg.contains("Incorrect number of bytes")
    ));
}

#[test]
fn test_decode_request_rejected() {
    let bb = [Version::NatPmp as u8, OperationCode::ExternalAddress as u8, 0, 0];
    let err = Response::decode(&bb).unwrap_err();
    assert!(matches!(err, Failure::InvalidResponse(ref msg)
        if msg.contains("Not a response")
    ));
}
