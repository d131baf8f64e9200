//! Legacy NAT-PMP (RFC 6886) responses. Routers that predate PCP answer on the
//! same ports with these, so they are decoded for logging and then dropped.

use std::net::Ipv4Addr;

use bytes::Buf;
use num_enum::TryFromPrimitive;

use crate::Version;

/// NAT-PMP result codes, <https://www.rfc-editor.org/rfc/rfc6886#section-3.5>
#[derive(Clone, Copy, Debug, displaydoc::Display, PartialEq, Eq, thiserror::Error, TryFromPrimitive)]
#[repr(u16)]
pub enum ResultCode {
    /// NAT-PMP success
    Success,
    /// NAT-PMP version not supported by the gateway
    UnsupportedVersion,
    /// Mapping refused by the gateway, e.g. because it is disabled
    NotAuthorized,
    /// Gateway has no working uplink or DHCP lease
    NetworkFailure,
    /// Gateway ran out of ports or mapping slots
    OutOfResources,
    /// Gateway does not implement the opcode
    UnsupportedOpcode,
}

/// NAT-PMP opcodes, without the response bit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum OperationCode {
    /// Request the public IP address of the gateway. Also announced unsolicited by the gateway.
    ExternalAddress,
    MapUdp,
    MapTcp,
}

#[derive(Debug, thiserror::Error)]
pub enum Failure {
    /// A version 0 datagram that does not hold a well formed response.
    #[error("Malformed NAT-PMP response: {0}")]
    InvalidResponse(String),
}

/// Payload of a NAT-PMP response, by operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponseData {
    ExternalAddress(Ipv4Addr),
    Mapping {
        internal_port: u16,
        external_port: u16,
        lifetime_seconds: u32,
    },
}

/// A NAT-PMP response. Only recognized: the client does not speak NAT-PMP.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub opcode: OperationCode,
    pub result_code: ResultCode,
    /// Seconds since the gateway started or reset its mappings.
    pub epoch_seconds: u32,
    pub data: ResponseData,
}

/// Set in the opcode byte of every response.
const RESPONSE_BIT: u8 = 128;

impl Response {
    /// Size of an `ExternalAddress` response.
    pub const EXTERNAL_ADDRESS_SIZE: usize = 12;
    /// Size of a port mapping response.
    pub const MAPPING_SIZE: usize = 16;

    /// Decode a NAT-PMP response. Trailing bytes are ignored.
    /// # Errors
    /// Returns `Failure::InvalidResponse` when the message is not a well formed NAT-PMP response.
    pub fn decode(mut bytes: &[u8]) -> Result<Self, Failure> {
        let n = bytes.len();
        if n < 4 {
            return Err(Failure::InvalidResponse(format!(
                "Incorrect number of bytes: {n}"
            )));
        }

        // Read and verify the version and operation bytes.
        let v = Version::try_from(bytes.get_u8())
            .map_err(|v| Failure::InvalidResponse(format!("Invalid version: {v:#}")))?;
        if v != Version::NatPmp {
            return Err(Failure::InvalidResponse(format!(
                "Unsupported version: {v:?}"
            )));
        }
        let op = bytes.get_u8();
        if op & RESPONSE_BIT == 0 {
            return Err(Failure::InvalidResponse(format!(
                "Not a response: {op:#x}"
            )));
        }
        let opcode = OperationCode::try_from(op & !RESPONSE_BIT)
            .map_err(|o| Failure::InvalidResponse(format!("Invalid operation code: {o:#}")))?;

        let expected = match opcode {
            OperationCode::ExternalAddress => Self::EXTERNAL_ADDRESS_SIZE,
            OperationCode::MapUdp | OperationCode::MapTcp => Self::MAPPING_SIZE,
        };
        if n < expected {
            return Err(Failure::InvalidResponse(format!(
                "Incorrect number of bytes: {n}"
            )));
        }

        let result_code = ResultCode::try_from(bytes.get_u16())
            .map_err(|r| Failure::InvalidResponse(format!("Invalid result code: {r:#}")))?;
        let epoch_seconds = bytes.get_u32();

        let data = match opcode {
            OperationCode::ExternalAddress => ResponseData::ExternalAddress(Ipv4Addr::new(
                bytes.get_u8(),
                bytes.get_u8(),
                bytes.get_u8(),
                bytes.get_u8(),
            )),
            OperationCode::MapUdp | OperationCode::MapTcp => ResponseData::Mapping {
                internal_port: bytes.get_u16(),
                external_port: bytes.get_u16(),
                lifetime_seconds: bytes.get_u32(),
            },
        };

        Ok(Self {
            opcode,
            result_code,
            epoch_seconds,
            data,
        })
    }
}

#[cfg(test)]
mod tests;
