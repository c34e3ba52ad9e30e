//! Packet heads and buffer framing.
//!
//! On the network a packet is `[type u16][size u16][body]`. Inside the
//! process (reception, sending and write buffers) the connection rides in
//! front: `[connection u16][type u16][size u16][body]`. The socket a packet
//! arrived from, or is headed to, stands in for the connection on the wire.

use std::fmt;

use super::wire::{self, Wire};

pub const WIRE_HEAD_SIZE: usize = 4;
pub const HEAD_SIZE: usize = 6;
pub const MAX_BODY_SIZE: usize = u16::MAX as usize;
pub const INVALID_BODY_TYPE: u16 = u16::MAX;
pub const BODY_TYPE_COUNT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum BodyType {
    /// Raw ANSI string.
    Message = 0,
    /// Request when sent by a client, response when sent by the server.
    Authentication = 1,
    /// Void/land bitmask of one zone.
    WorldSyncLandscape = 2,
    /// Reserved; no body layout yet.
    WorldSyncEntities = 3,
}
impl BodyType {
    pub const ALL: [BodyType; BODY_TYPE_COUNT] = [
        BodyType::Message,
        BodyType::Authentication,
        BodyType::WorldSyncLandscape,
        BodyType::WorldSyncEntities,
    ];
    pub fn from_tag(tag: u16) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }
    pub fn tag(self) -> u16 {
        self as u16
    }
    pub fn index(self) -> usize {
        self as usize
    }
}
impl fmt::Display for BodyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Message => "MESSAGE",
            Self::Authentication => "AUTHENTICATION",
            Self::WorldSyncLandscape => "WORLD_SYNC_LANDSCAPE",
            Self::WorldSyncEntities => "WORLD_SYNC_ENTITIES",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHead {
    /// Pump handle in the reception and sending buffers.
    pub connection: u16,
    pub body_type: BodyType,
    pub body_size: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet<'a> {
    pub head: PacketHead,
    pub body: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    /// Fewer bytes than one head remain.
    Truncated { available: usize },
    /// The type tag is not one of the registered body types.
    InvalidBodyType { connection: u16, tag: u16 },
    /// The declared body runs past the end of the buffer.
    BodyOverrun { connection: u16, body_size: u16, available: usize },
    /// The destination cannot hold the packet.
    NoRoom { required: usize, available: usize },
    /// The body does not fit the 16-bit size field.
    BodyTooLarge { size: usize },
}
impl FramingError {
    /// Connection named by the head that failed, when the head was readable.
    pub fn connection(&self) -> Option<u16> {
        match *self {
            Self::InvalidBodyType { connection, .. } | Self::BodyOverrun { connection, .. } => {
                Some(connection)
            }
            _ => None,
        }
    }
}
impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { available } => write!(f, "truncated head: {available} bytes left"),
            Self::InvalidBodyType { connection, tag } => {
                write!(f, "invalid body type {tag} from connection {connection}")
            }
            Self::BodyOverrun { connection, body_size, available } => write!(
                f,
                "body of {body_size} bytes from connection {connection} overruns buffer \
                 ({available} bytes left)"
            ),
            Self::NoRoom { required, available } => {
                write!(f, "packet needs {required} bytes, {available} available")
            }
            Self::BodyTooLarge { size } => {
                write!(f, "body of {size} bytes exceeds {MAX_BODY_SIZE}")
            }
        }
    }
}
impl std::error::Error for FramingError {}

/// Reads one in-process packet from the front of `buf` and returns it with
/// the bytes that follow it. Never looks past the end of `buf`.
pub fn read_next_packet(buf: &[u8]) -> Result<(Packet<'_>, &[u8]), FramingError> {
    if buf.len() < HEAD_SIZE {
        return Err(FramingError::Truncated { available: buf.len() });
    }
    let ((connection, tag, body_size), rest): ((u16, u16, u16), _) =
        Wire::decode(buf).map_err(|_| FramingError::Truncated { available: buf.len() })?;
    let body_type =
        BodyType::from_tag(tag).ok_or(FramingError::InvalidBodyType { connection, tag })?;
    let (body, rest) = wire::bytes(rest, body_size as usize).ok_or(FramingError::BodyOverrun {
        connection,
        body_size,
        available: rest.len(),
    })?;
    let head = PacketHead { connection, body_type, body_size };
    Ok((Packet { head, body }, rest))
}

/// Writes an in-process packet to the front of `dest`, returning the number
/// of bytes written. Nothing is written when it does not fit.
pub fn write_packet(
    dest: &mut [u8],
    connection: u16,
    body_type: BodyType,
    body: &[u8],
) -> Result<usize, FramingError> {
    let body_size =
        u16::try_from(body.len()).map_err(|_| FramingError::BodyTooLarge { size: body.len() })?;
    let required = HEAD_SIZE + body.len();
    let available = dest.len();
    if available < required {
        return Err(FramingError::NoRoom { required, available });
    }
    let head = PacketHead { connection, body_type, body_size };
    let rest = write_head(dest, &head).ok_or(FramingError::NoRoom { required, available })?;
    rest[..body.len()].copy_from_slice(body);
    Ok(required)
}

/// Writes only the in-process head. The caller fills in the body after it.
pub fn write_head<'b>(dest: &'b mut [u8], head: &PacketHead) -> Option<&'b mut [u8]> {
    (head.connection, head.body_type.tag(), head.body_size).encode(dest)
}

/// Head of a packet as it travels on the network. The tag is kept raw so the
/// receiver can report exactly what it was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHead {
    pub tag: u16,
    pub body_size: u16,
}
impl WireHead {
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let (tag, rest) = wire::u16(buf)?;
        let (body_size, _) = wire::u16(rest)?;
        Some(Self { tag, body_size })
    }
    pub fn packet_len(&self) -> usize {
        WIRE_HEAD_SIZE + self.body_size as usize
    }
}

/// Re-encodes an in-process packet into its network form, dropping the
/// connection. Returns the number of bytes written.
pub fn encode_wire_packet(dest: &mut [u8], packet: &Packet<'_>) -> Result<usize, FramingError> {
    let required = WIRE_HEAD_SIZE + packet.body.len();
    let available = dest.len();
    (packet.head.body_type.tag(), packet.head.body_size)
        .encode(dest)
        .and_then(|rest| wire::put(rest, packet.body))
        .ok_or(FramingError::NoRoom { required, available })?;
    Ok(required)
}

/// Walks the packets of an in-process buffer in order. Yields the first
/// framing error it hits and then stops.
pub struct PacketReader<'a> {
    rest: &'a [u8],
    failed: bool,
}
impl<'a> PacketReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { rest: buf, failed: false }
    }
    /// Bytes not consumed yet.
    pub fn remaining(&self) -> &'a [u8] {
        self.rest
    }
}
impl<'a> Iterator for PacketReader<'a> {
    type Item = Result<Packet<'a>, FramingError>;
    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.rest.is_empty() {
            return None;
        }
        match read_next_packet(self.rest) {
            Ok((packet, rest)) => {
                self.rest = rest;
                Some(Ok(packet))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
