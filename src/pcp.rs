//! PCP message encoding and decoding.
//! See <https://www.rfc-editor.org/rfc/rfc6887#section-7>

use std::{
    fmt,
    net::{IpAddr, Ipv6Addr},
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::TryFromPrimitive;
use rand::RngCore;

use crate::{addr, natpmp, Protocol, Version};

/// Size of the common request and response header.
pub const HEADER_SIZE: usize = 24;

/// Size of the MAP opcode-specific body.
pub const MAP_BODY_SIZE: usize = 36;

/// Size of the PEER opcode-specific body.
pub const PEER_BODY_SIZE: usize = 56;

/// The MSb of the opcode byte marks a response.
const RESPONSE_BIT: u8 = 0x80;

/// Operation codes for PCP.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum OperationCode {
    /// Sent by the gateway to announce a restart, or by a client to probe for a server.
    Announce,
    /// Create or renew an endpoint-independent mapping.
    Map,
    /// Create or renew a mapping towards one remote peer.
    Peer,
}

impl OperationCode {
    /// The smallest valid message carrying this opcode.
    pub const fn message_size(self) -> usize {
        match self {
            Self::Announce => HEADER_SIZE,
            Self::Map => HEADER_SIZE + MAP_BODY_SIZE,
            Self::Peer => HEADER_SIZE + PEER_BODY_SIZE,
        }
    }
}

/// Valid result codes from a PCP response.
/// See <https://www.rfc-editor.org/rfc/rfc6887#section-7.4>
#[derive(Clone, Copy, Debug, displaydoc::Display, PartialEq, Eq, thiserror::Error, TryFromPrimitive)]
#[repr(u8)]
pub enum ResultCode {
    /// Success. Will not be returned as an error.
    Success,
    /// The server does not support this version of the protocol.
    UnsupportedVersion,
    /// The server did not grant us permission to perform the operation.
    NotAuthorized,
    /// The server could not parse the request.
    MalformedRequest,
    /// The server does not support the requested operation.
    UnsupportedOpcode,
    /// The server does not support a mandatory option of the request.
    UnsupportedOption,
    /// An option of the request was malformed.
    MalformedOption,
    /// The server is not in a valid network state to perform the operation.
    NetworkFailure,
    /// The server is lacking resources, such as open ports, to complete the operation.
    NoResources,
    /// The server does not support the requested transport protocol.
    UnsupportedProtocol,
    /// The client exceeded its mapping quota on the server.
    UserExceededQuota,
    /// The server cannot provide the suggested external address or port.
    CannotProvideExternal,
    /// The client address in the request does not match the datagram source.
    AddressMismatch,
    /// The server cannot create filters for this many remote peers.
    ExcessiveRemotePeers,
}

/// The 96-bit random value correlating a MAP or PEER request with its responses.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nonce(pub [u8; 12]);

impl Nonce {
    /// Draw a fresh nonce from the thread-local cryptographically secure generator.
    pub fn random() -> Self {
        let mut nonce = [0u8; 12];
        rand::rng().fill_bytes(&mut nonce);
        Self(nonce)
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.iter().try_for_each(|b| write!(f, "{b:02x}"))
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({self})")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The datagram is shorter than its opcode requires.
    #[error("Too few bytes for {what}: needed {needed}, got {got}")]
    TooShort {
        what: &'static str,
        needed: usize,
        got: usize,
    },

    #[error("Unknown version: {0}")]
    UnknownVersion(u8),

    #[error("Unknown opcode: {0:#x}")]
    UnknownOpcode(u8),

    #[error("Unknown result code: {0}")]
    UnknownResultCode(u8),

    #[error("Unsupported protocol number: {0}")]
    UnsupportedProtocol(u8),

    /// A version 0 message that is not a valid NAT-PMP response.
    #[error("NAT-PMP: {0}")]
    NatPmp(#[from] natpmp::Failure),
}

/// The body shared by MAP and PEER messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapData {
    pub nonce: Nonce,
    pub protocol: Protocol,
    pub internal_port: u16,
    /// Suggested external port in a request, assigned external port in a response.
    pub external_port: u16,
    /// Suggested external address in a request, assigned external address in a response.
    pub external_address: Ipv6Addr,
}

impl MapData {
    fn encode(&self, bb: &mut BytesMut) {
        bb.put_slice(&self.nonce.0);
        bb.put_u8(self.protocol as u8);
        bb.put_bytes(0, 3); // reserved
        bb.put_u16(self.internal_port);
        bb.put_u16(self.external_port);
        bb.put_slice(&self.external_address.octets());
    }

    fn decode(bb: &mut &[u8]) -> Result<Self, DecodeError> {
        let mut nonce = [0u8; 12];
        bb.copy_to_slice(&mut nonce);
        let protocol = bb.get_u8();
        let protocol =
            Protocol::try_from(protocol).map_err(|_| DecodeError::UnsupportedProtocol(protocol))?;
        bb.advance(3); // reserved
        let internal_port = bb.get_u16();
        let external_port = bb.get_u16();
        let external_address = get_address(bb);
        Ok(Self {
            nonce: Nonce(nonce),
            protocol,
            internal_port,
            external_port,
            external_address,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerData {
    pub map: MapData,
    pub remote_peer_port: u16,
    pub remote_peer_address: Ipv6Addr,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpcodeData {
    Announce,
    Map(MapData),
    Peer(PeerData),
}

impl OpcodeData {
    pub const fn opcode(&self) -> OperationCode {
        match self {
            Self::Announce => OperationCode::Announce,
            Self::Map(_) => OperationCode::Map,
            Self::Peer(_) => OperationCode::Peer,
        }
    }

    fn encode(&self, bb: &mut BytesMut) {
        match self {
            Self::Announce => {}
            Self::Map(map) => map.encode(bb),
            Self::Peer(peer) => {
                peer.map.encode(bb);
                bb.put_u16(peer.remote_peer_port);
                bb.put_u16(0); // reserved
                bb.put_slice(&peer.remote_peer_address.octets());
            }
        }
    }

    /// The caller has already checked the datagram holds `opcode.message_size()` bytes.
    fn decode(opcode: OperationCode, bb: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(match opcode {
            OperationCode::Announce => Self::Announce,
            OperationCode::Map => Self::Map(MapData::decode(bb)?),
            OperationCode::Peer => {
                let map = MapData::decode(bb)?;
                let remote_peer_port = bb.get_u16();
                bb.advance(2); // reserved
                let remote_peer_address = get_address(bb);
                Self::Peer(PeerData {
                    map,
                    remote_peer_port,
                    remote_peer_address,
                })
            }
        })
    }
}

/// A PCP request, as sent by the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub lifetime_seconds: u32,
    pub client_address: Ipv6Addr,
    pub data: OpcodeData,
}

impl Request {
    /// A MAP request for `internal_port` on `client`. IPv4 addresses are sent IPv4-mapped.
    pub fn map(
        nonce: Nonce,
        protocol: Protocol,
        client: IpAddr,
        internal_port: u16,
        suggested_external: (IpAddr, u16),
        lifetime_seconds: u32,
    ) -> Self {
        Self {
            lifetime_seconds,
            client_address: addr::to_pcp_address(client),
            data: OpcodeData::Map(MapData {
                nonce,
                protocol,
                internal_port,
                external_port: suggested_external.1,
                external_address: addr::to_pcp_address(suggested_external.0),
            }),
        }
    }

    /// An ANNOUNCE request.
    pub fn announce(client: IpAddr) -> Self {
        Self {
            lifetime_seconds: 0,
            client_address: addr::to_pcp_address(client),
            data: OpcodeData::Announce,
        }
    }

    /// Serialize the request. Every byte, reserved fields included, is written explicitly.
    pub fn encode(&self) -> Bytes {
        let opcode = self.data.opcode();
        let mut bb = BytesMut::with_capacity(opcode.message_size());
        bb.put_u8(Version::Pcp as u8);
        bb.put_u8(opcode as u8);
        bb.put_u8(0); // reserved
        bb.put_u8(0); // result code, reserved in requests
        bb.put_u32(self.lifetime_seconds);
        bb.put_slice(&self.client_address.octets());
        self.data.encode(&mut bb);
        debug_assert_eq!(bb.len(), opcode.message_size());
        bb.freeze()
    }
}

/// A PCP response, as sent by the gateway.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub result_code: ResultCode,
    /// Granted lifetime for MAP and PEER, or how long an error is expected to persist.
    pub lifetime_seconds: u32,
    /// Seconds since the gateway started or lost its mapping state.
    pub epoch_seconds: u32,
    pub data: OpcodeData,
}

impl Response {
    /// Serialize the response, as a gateway would.
    pub fn encode(&self) -> Bytes {
        let opcode = self.data.opcode();
        let mut bb = BytesMut::with_capacity(opcode.message_size());
        bb.put_u8(Version::Pcp as u8);
        bb.put_u8(RESPONSE_BIT | opcode as u8);
        bb.put_u8(0); // reserved
        bb.put_u8(self.result_code as u8);
        bb.put_u32(self.lifetime_seconds);
        bb.put_u32(self.epoch_seconds);
        bb.put_bytes(0, 12); // reserved
        self.data.encode(&mut bb);
        bb.freeze()
    }
}

/// Any message that may arrive on the PCP ports.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
    /// A legacy NAT-PMP response, told apart by its version byte.
    NatPmp(natpmp::Response),
}

impl Message {
    /// Decode a datagram. Lengths are validated for the opcode before any field is read,
    /// and trailing PCP options are ignored.
    /// # Errors
    /// Returns a `DecodeError` describing the first problem found.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let Some(&version) = bytes.first() else {
            return Err(DecodeError::TooShort {
                what: "version",
                needed: 1,
                got: 0,
            });
        };
        let version = Version::try_from(version).map_err(|v| DecodeError::UnknownVersion(v.number))?;
        if version == Version::NatPmp {
            return Ok(Self::NatPmp(natpmp::Response::decode(bytes)?));
        }

        let n = bytes.len();
        if n < HEADER_SIZE {
            return Err(DecodeError::TooShort {
                what: "header",
                needed: HEADER_SIZE,
                got: n,
            });
        }

        let mut bb = &bytes[1..];
        let op = bb.get_u8();
        let is_response = op & RESPONSE_BIT != 0;
        let opcode = OperationCode::try_from(op & !RESPONSE_BIT)
            .map_err(|o| DecodeError::UnknownOpcode(o.number))?;
        if n < opcode.message_size() {
            return Err(DecodeError::TooShort {
                what: opcode_name(opcode),
                needed: opcode.message_size(),
                got: n,
            });
        }
        bb.advance(1); // reserved
        let result = bb.get_u8();
        let lifetime_seconds = bb.get_u32();

        if is_response {
            let result_code =
                ResultCode::try_from(result).map_err(|r| DecodeError::UnknownResultCode(r.number))?;
            let epoch_seconds = bb.get_u32();
            bb.advance(12); // reserved
            let data = OpcodeData::decode(opcode, &mut bb)?;
            Ok(Self::Response(Response {
                result_code,
                lifetime_seconds,
                epoch_seconds,
                data,
            }))
        } else {
            let client_address = get_address(&mut bb);
            let data = OpcodeData::decode(opcode, &mut bb)?;
            Ok(Self::Request(Request {
                lifetime_seconds,
                client_address,
                data,
            }))
        }
    }
}

fn get_address(bb: &mut &[u8]) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    bb.copy_to_slice(&mut octets);
    Ipv6Addr::from(octets)
}

const fn opcode_name(opcode: OperationCode) -> &'static str {
    match opcode {
        OperationCode::Announce => "ANNOUNCE",
        OperationCode::Map => "MAP",
        OperationCode::Peer => "PEER",
    }
}

#[cfg(test)]
mod tests;
