//! Server-side connection table and the outgoing write buffer.
//!
//! Connection ids are dense slot indices handed out most-recently-freed
//! first. The write buffer lives in the arena and holds in-process packets
//! addressed by the transport handle the connection had when the packet was
//! written, so a reused id never inherits packets queued for its previous
//! owner.

use std::collections::HashMap;
use std::fmt;

use crate::memory::{Allocation, Arena, ArenaError};
use crate::network::body::{Body, CodecError};
use crate::network::packet::{self, PacketHead, PacketReader, HEAD_SIZE, MAX_BODY_SIZE};
use crate::prelude::*;

pub mod dispatch;

#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    id: ConnectionId,
    handle: Handle,
    up_time: f32,
    idle_time: f32,
    client: Option<ClientId>,
}
impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
    pub fn handle(&self) -> Handle {
        self.handle
    }
    /// Seconds since the connection was registered.
    pub fn up_time(&self) -> f32 {
        self.up_time
    }
    /// Seconds since a packet from it was last dispatched.
    pub fn idle_time(&self) -> f32 {
        self.idle_time
    }
    pub fn client(&self) -> Option<ClientId> {
        self.client
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionError {
    TableFull { capacity: usize },
    HandleInUse(Handle),
    InvalidConnection(ConnectionId),
    AlreadyLinked { connection: ConnectionId, client: ClientId },
    /// Not enough room left in the write buffer. Nothing was written.
    WriteBufferFull { required: usize, available: usize },
    Codec(CodecError),
    Arena(ArenaError),
}
impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TableFull { capacity } => {
                write!(f, "connection table full ({capacity} connections)")
            }
            Self::HandleInUse(handle) => {
                write!(f, "transport handle {handle} already has a connection")
            }
            Self::InvalidConnection(id) => write!(f, "connection {id} does not exist"),
            Self::AlreadyLinked { connection, client } => {
                write!(f, "connection {connection} is already linked to client {client}")
            }
            Self::WriteBufferFull { required, available } => {
                write!(f, "write buffer full: packet needs {required} bytes, {available} available")
            }
            Self::Codec(e) => fmt::Display::fmt(e, f),
            Self::Arena(e) => fmt::Display::fmt(e, f),
        }
    }
}
impl std::error::Error for ConnectionError {}
impl From<CodecError> for ConnectionError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}
impl From<ArenaError> for ConnectionError {
    fn from(e: ArenaError) -> Self {
        Self::Arena(e)
    }
}

pub struct ConnectionTable {
    slots: SlotMap<Connection>,
    by_handle: HashMap<Handle, ConnectionId>,
    write_buffer: Allocation,
    written: usize,
}
impl ConnectionTable {
    pub fn new(
        arena: &mut Arena,
        capacity: u16,
        write_buffer_bytes: usize,
    ) -> Result<Self, ArenaError> {
        let write_buffer = arena.allocate(write_buffer_bytes)?;
        Ok(Self {
            slots: SlotMap::with_capacity(capacity as usize),
            by_handle: HashMap::with_capacity(capacity as usize),
            write_buffer,
            written: 0,
        })
    }
    /// Returns the table's memory to the arena.
    pub fn free(self, arena: &mut Arena) -> Result<(), ArenaError> {
        arena.free(self.write_buffer.offset()).map(drop)
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }
    pub fn len(&self) -> usize {
        self.slots.len()
    }
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn register(&mut self, handle: Handle) -> Result<ConnectionId, ConnectionError> {
        if self.by_handle.contains_key(&handle) {
            return Err(ConnectionError::HandleInUse(handle));
        }
        let Some(idx) = self.slots.next_idx() else {
            let capacity = self.capacity();
            log::warn!("cannot register handle {handle}: connection table full ({capacity})");
            return Err(ConnectionError::TableFull { capacity });
        };
        let id = ConnectionId(idx as u16);
        let connection = Connection { id, handle, up_time: 0.0, idle_time: 0.0, client: None };
        if self.slots.insert(connection).is_err() {
            return Err(ConnectionError::TableFull { capacity: self.capacity() });
        }
        self.by_handle.insert(handle, id);
        log::debug!("registered connection {id} for handle {handle}");
        Ok(id)
    }

    pub fn delete(&mut self, id: ConnectionId) -> Option<Connection> {
        let connection = self.slots.release(id.index())?;
        self.by_handle.remove(&connection.handle);
        log::debug!("deleted connection {id} (handle {})", connection.handle);
        Some(connection)
    }

    /// Links `client` to the connection. A link is made once and never replaced.
    pub fn connect_client(
        &mut self,
        id: ConnectionId,
        client: ClientId,
    ) -> Result<(), ConnectionError> {
        let connection =
            self.slots.get_mut(id.index()).ok_or(ConnectionError::InvalidConnection(id))?;
        if let Some(linked) = connection.client {
            return Err(ConnectionError::AlreadyLinked { connection: id, client: linked });
        }
        connection.client = Some(client);
        Ok(())
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.slots.get(id.index())
    }
    pub fn get_by_transport_handle(&self, handle: Handle) -> Option<&Connection> {
        self.by_handle.get(&handle).and_then(|id| self.get(*id))
    }
    pub fn iter(&self) -> impl Iterator<Item = &Connection> + '_ {
        self.slots.iter().map(|(_, c)| c)
    }

    /// Marks the connection as active now.
    pub fn touch(&mut self, id: ConnectionId) {
        if let Some(connection) = self.slots.get_mut(id.index()) {
            connection.idle_time = 0.0;
        }
    }
    pub fn update_times(&mut self, dt: f32) {
        for (_, connection) in self.slots.iter_mut() {
            connection.up_time += dt;
            connection.idle_time += dt;
        }
    }

    /// Bytes waiting in the write buffer.
    pub fn written(&self) -> usize {
        self.written
    }
    pub fn write_capacity(&self) -> usize {
        self.write_buffer.len()
    }

    /// Queues `body` for the connection. On failure the write buffer is left
    /// exactly as it was, so the same write can be tried again later.
    pub fn write_outgoing(
        &mut self,
        arena: &mut Arena,
        id: ConnectionId,
        body: &Body<'_>,
    ) -> Result<(), ConnectionError> {
        let buffer = arena.bytes_mut(&self.write_buffer);
        self.write_into(buffer, id, body)
    }

    /// Like `write_outgoing`, for bodies that borrow another arena allocation.
    pub fn write_outgoing_from(
        &mut self,
        arena: &mut Arena,
        source: &Allocation,
        id: ConnectionId,
        body: impl FnOnce(&[u8]) -> Body<'_>,
    ) -> Result<(), ConnectionError> {
        let (source, buffer) = arena.split(source, &self.write_buffer)?;
        self.write_into(buffer, id, &body(source))
    }

    fn write_into(
        &mut self,
        buffer: &mut [u8],
        id: ConnectionId,
        body: &Body<'_>,
    ) -> Result<(), ConnectionError> {
        let Some(handle) = self.get(id).map(Connection::handle) else {
            log::warn!("dropping {} for unknown connection {id}", body.body_type());
            return Err(ConnectionError::InvalidConnection(id));
        };
        let size = body.marshalled_size();
        if size > MAX_BODY_SIZE {
            return Err(CodecError::TooLarge { size }.into());
        }
        let required = HEAD_SIZE + size;
        let available = buffer.len() - self.written;
        if required > available {
            let body_type = body.body_type();
            log::warn!(
                "write buffer full: {body_type} for connection {id} needs {required} bytes, \
                 {available} available"
            );
            return Err(ConnectionError::WriteBufferFull { required, available });
        }
        let dest = &mut buffer[self.written..self.written + required];
        let head = PacketHead {
            connection: handle.0,
            body_type: body.body_type(),
            body_size: size as u16,
        };
        let body_dest = packet::write_head(dest, &head)
            .ok_or(ConnectionError::WriteBufferFull { required, available })?;
        body.marshal(body_dest)?;
        self.written += required;
        log::trace!("queued {} ({size} bytes) for connection {id}", head.body_type);
        Ok(())
    }

    /// Copies whole packets into `dest` and returns the bytes written.
    /// Packets that do not fit move to the front of the write buffer.
    /// Packets whose connection was deleted since the write are discarded.
    pub fn flush(&mut self, arena: &mut Arena, dest: &mut [u8]) -> usize {
        let buffer = arena.bytes_mut(&self.write_buffer);
        let mut out = 0;
        let mut taken = 0;
        for packet in PacketReader::new(&buffer[..self.written]) {
            let packet = match packet {
                Ok(p) => p,
                Err(e) => {
                    log::error!("discarding corrupt write buffer: {e}");
                    taken = self.written;
                    break;
                }
            };
            let len = HEAD_SIZE + packet.body.len();
            let (handle, body_type) = (packet.head.connection, packet.head.body_type);
            if !self.by_handle.contains_key(&Handle(handle)) {
                log::debug!("discarding {body_type} for closed handle {handle}");
                taken += len;
                continue;
            }
            match packet::write_packet(&mut dest[out..], handle, body_type, packet.body) {
                Ok(n) => out += n,
                Err(_) => break,
            }
            taken += len;
        }
        buffer.copy_within(taken..self.written, 0);
        self.written -= taken;
        out
    }
}
impl fmt::Debug for ConnectionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionTable")
            .field("connections", &self.len())
            .field("capacity", &self.capacity())
            .field("written", &self.written)
            .finish()
    }
}
