//! Packet bodies.
//!
//! Each body type is its own struct with a fixed byte layout. Bodies that
//! carry bulk payload (the zone bitmask, message text) borrow it, so
//! mustering a received packet hands out views into the reception buffer
//! instead of copying. Marshalling always produces a flat, self-contained
//! image directly behind the head.

use std::fmt;

use super::packet::{BodyType, MAX_BODY_SIZE};
use super::wire::{self, Wire};
use crate::prelude::*;

pub const CREDENTIAL_LEN: usize = USERNAME_LEN;
pub const AUTHENTICATION_BODY_SIZE: usize = 2 * CREDENTIAL_LEN;
pub const ZONE_SIZE_TILES: usize = 256;
pub const ZONE_BITMASK_BYTES: usize = ZONE_SIZE_TILES * ZONE_SIZE_TILES / 8;
pub const ZONE_LANDSCAPE_BODY_SIZE: usize = 4 + ZONE_BITMASK_BYTES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// The destination cannot hold the marshalled body. Nothing was written.
    NoRoom { required: usize, available: usize },
    /// The received bytes do not match the fixed size of the body type.
    SizeMismatch { body_type: BodyType, expected: usize, actual: usize },
    /// The body is larger than a head can describe.
    TooLarge { size: usize },
    /// A field holds a value the body type does not allow.
    Malformed(&'static str),
    /// The body type has no layout yet.
    Unsupported(BodyType),
}
impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRoom { required, available } => {
                write!(f, "body needs {required} bytes, {available} available")
            }
            Self::SizeMismatch { body_type, expected, actual } => {
                write!(f, "{body_type} body must be {expected} bytes, got {actual}")
            }
            Self::TooLarge { size } => write!(f, "body of {size} bytes exceeds {MAX_BODY_SIZE}"),
            Self::Malformed(what) => write!(f, "malformed body: {what}"),
            Self::Unsupported(body_type) => write!(f, "{body_type} bodies are not supported"),
        }
    }
}
impl std::error::Error for CodecError {}
impl From<CodecError> for Disconnection {
    fn from(e: CodecError) -> Self {
        Disconnection::new(match e {
            CodecError::NoRoom { .. } | CodecError::TooLarge { .. } => "body does not fit",
            CodecError::SizeMismatch { .. } => "body size does not match its type",
            CodecError::Malformed(what) => what,
            CodecError::Unsupported(_) => "unsupported body type",
        })
    }
}

/// Which side produced a packet. The authentication tag is shared by the
/// request (from a client) and the response (from the server).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Client,
    Server,
}

trait BodyCodec<'a>: Sized {
    const BODY_TYPE: BodyType;
    fn size(&self) -> usize;
    /// `dst` is exactly `size()` bytes long.
    fn encode(&self, dst: &mut [u8]) -> Result<(), CodecError>;
    fn decode(src: &'a [u8]) -> Result<Self, CodecError>;
}

fn fixed_size(body_type: BodyType, expected: usize, src: &[u8]) -> Result<(), CodecError> {
    if src.len() != expected {
        return Err(CodecError::SizeMismatch { body_type, expected, actual: src.len() });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message<'a> {
    pub text: &'a [u8],
}
impl<'a> Message<'a> {
    pub fn new(text: &'a str) -> Self {
        Self { text: text.as_bytes() }
    }
}
impl<'a> BodyCodec<'a> for Message<'a> {
    const BODY_TYPE: BodyType = BodyType::Message;
    fn size(&self) -> usize {
        self.text.len()
    }
    fn encode(&self, dst: &mut [u8]) -> Result<(), CodecError> {
        dst.copy_from_slice(self.text);
        Ok(())
    }
    fn decode(src: &'a [u8]) -> Result<Self, CodecError> {
        let len = src.iter().position(|&b| b == 0).unwrap_or(src.len());
        Ok(Self { text: &src[..len] })
    }
}
impl fmt::Display for Message<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.text))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AuthenticationRequest {
    pub username: [u8; CREDENTIAL_LEN],
    pub password: [u8; CREDENTIAL_LEN],
}
impl AuthenticationRequest {
    /// Pads both fields with NULs. Input longer than a field is cut.
    pub fn new(username: &str, password: &str) -> Self {
        fn field(s: &str) -> [u8; CREDENTIAL_LEN] {
            let mut out = [0; CREDENTIAL_LEN];
            let n = s.len().min(CREDENTIAL_LEN);
            out[..n].copy_from_slice(&s.as_bytes()[..n]);
            out
        }
        Self { username: field(username), password: field(password) }
    }
}
impl fmt::Debug for AuthenticationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.username.iter().position(|&b| b == 0).unwrap_or(CREDENTIAL_LEN);
        f.debug_struct("AuthenticationRequest")
            .field("username", &String::from_utf8_lossy(&self.username[..len]))
            .finish_non_exhaustive()
    }
}
impl BodyCodec<'_> for AuthenticationRequest {
    const BODY_TYPE: BodyType = BodyType::Authentication;
    fn size(&self) -> usize {
        AUTHENTICATION_BODY_SIZE
    }
    fn encode(&self, dst: &mut [u8]) -> Result<(), CodecError> {
        (self.username, self.password)
            .encode(dst)
            .map(drop)
            .ok_or(CodecError::NoRoom { required: AUTHENTICATION_BODY_SIZE, available: dst.len() })
    }
    fn decode(src: &[u8]) -> Result<Self, CodecError> {
        fixed_size(Self::BODY_TYPE, AUTHENTICATION_BODY_SIZE, src)?;
        let ((username, password), _) =
            Wire::decode(src).map_err(|d: Disconnection| CodecError::Malformed(d.reason()))?;
        Ok(Self { username, password })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticationResponse {
    pub accepted: bool,
}
impl BodyCodec<'_> for AuthenticationResponse {
    const BODY_TYPE: BodyType = BodyType::Authentication;
    fn size(&self) -> usize {
        AUTHENTICATION_BODY_SIZE
    }
    fn encode(&self, dst: &mut [u8]) -> Result<(), CodecError> {
        dst.fill(0);
        dst[0] = self.accepted as u8;
        Ok(())
    }
    fn decode(src: &[u8]) -> Result<Self, CodecError> {
        fixed_size(Self::BODY_TYPE, AUTHENTICATION_BODY_SIZE, src)?;
        let (accepted, _) =
            bool::decode(src).map_err(|_| CodecError::Malformed("accepted flag out of range"))?;
        Ok(Self { accepted })
    }
}

/// Void/land bitmask of one zone, `ZONE_SIZE_TILES` square, row-major with
/// the least significant bit first. A set bit is land.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ZoneLandscapeSync<'a> {
    pub zone: Coordinates,
    pub bitmask: &'a [u8],
}
impl ZoneLandscapeSync<'_> {
    pub fn is_land(&self, x: usize, y: usize) -> bool {
        let bit = y * ZONE_SIZE_TILES + x;
        self.bitmask.get(bit / 8).map_or(false, |b| b & (1 << (bit % 8)) != 0)
    }
    pub fn land_tiles(&self) -> usize {
        self.bitmask.iter().map(|b| b.count_ones() as usize).sum()
    }
}
impl fmt::Debug for ZoneLandscapeSync<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZoneLandscapeSync")
            .field("zone", &self.zone)
            .field("land_tiles", &self.land_tiles())
            .finish()
    }
}
impl<'a> BodyCodec<'a> for ZoneLandscapeSync<'a> {
    const BODY_TYPE: BodyType = BodyType::WorldSyncLandscape;
    fn size(&self) -> usize {
        ZONE_LANDSCAPE_BODY_SIZE
    }
    fn encode(&self, dst: &mut [u8]) -> Result<(), CodecError> {
        if self.bitmask.len() != ZONE_BITMASK_BYTES {
            return Err(CodecError::Malformed("zone bitmask has the wrong length"));
        }
        self.zone
            .encode(dst)
            .and_then(|rest| wire::put(rest, self.bitmask))
            .map(drop)
            .ok_or(CodecError::NoRoom { required: ZONE_LANDSCAPE_BODY_SIZE, available: dst.len() })
    }
    fn decode(src: &'a [u8]) -> Result<Self, CodecError> {
        fixed_size(Self::BODY_TYPE, ZONE_LANDSCAPE_BODY_SIZE, src)?;
        let (zone, bitmask) =
            Coordinates::decode(src).map_err(|d| CodecError::Malformed(d.reason()))?;
        Ok(Self { zone, bitmask })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Body<'a> {
    Message(Message<'a>),
    AuthenticationRequest(AuthenticationRequest),
    AuthenticationResponse(AuthenticationResponse),
    ZoneLandscape(ZoneLandscapeSync<'a>),
}
macro_rules! each_body {
    ($body:expr, $b:ident => $e:expr) => {
        match $body {
            Body::Message($b) => $e,
            Body::AuthenticationRequest($b) => $e,
            Body::AuthenticationResponse($b) => $e,
            Body::ZoneLandscape($b) => $e,
        }
    };
}
fn body_type_of<'a, B: BodyCodec<'a>>(_: &B) -> BodyType {
    B::BODY_TYPE
}
impl<'a> Body<'a> {
    pub fn body_type(&self) -> BodyType {
        each_body!(self, b => body_type_of(b))
    }
    /// Size of the marshalled image, known before marshalling.
    pub fn marshalled_size(&self) -> usize {
        each_body!(self, b => b.size())
    }
    /// Writes the flat image to the front of `dest` and returns its size.
    /// Fails without writing when `dest` is too small.
    pub fn marshal(&self, dest: &mut [u8]) -> Result<usize, CodecError> {
        let size = self.marshalled_size();
        if size > MAX_BODY_SIZE {
            return Err(CodecError::TooLarge { size });
        }
        if dest.len() < size {
            return Err(CodecError::NoRoom { required: size, available: dest.len() });
        }
        each_body!(self, b => b.encode(&mut dest[..size]))?;
        Ok(size)
    }
    /// Writes the body behind its network head, the way a peer sends it.
    pub fn marshal_wire(&self, dest: &mut [u8]) -> Result<usize, CodecError> {
        let required = super::packet::WIRE_HEAD_SIZE + self.marshalled_size();
        let available = dest.len();
        let body = (self.body_type().tag(), self.marshalled_size() as u16)
            .encode(dest)
            .ok_or(CodecError::NoRoom { required, available })?;
        let size = self.marshal(body)?;
        Ok(super::packet::WIRE_HEAD_SIZE + size)
    }
    /// Rebuilds a body from its image. Payload fields borrow from `bytes`.
    pub fn muster(
        body_type: BodyType,
        origin: Origin,
        bytes: &'a [u8],
    ) -> Result<Self, CodecError> {
        Ok(match (body_type, origin) {
            (BodyType::Message, _) => Body::Message(Message::decode(bytes)?),
            (BodyType::Authentication, Origin::Client) => {
                Body::AuthenticationRequest(AuthenticationRequest::decode(bytes)?)
            }
            (BodyType::Authentication, Origin::Server) => {
                Body::AuthenticationResponse(AuthenticationResponse::decode(bytes)?)
            }
            (BodyType::WorldSyncLandscape, _) => {
                Body::ZoneLandscape(ZoneLandscapeSync::decode(bytes)?)
            }
            (BodyType::WorldSyncEntities, _) => return Err(CodecError::Unsupported(body_type)),
        })
    }
}
