//! Body type to handler routing.

use std::fmt;

use super::ConnectionTable;
use crate::network::body::{Body, CodecError, Origin};
use crate::network::packet::{BodyType, Packet, BODY_TYPE_COUNT};
use crate::prelude::*;

/// A mustered packet from a known connection.
#[derive(Debug, Clone, Copy)]
pub struct InboundPacket<'a> {
    pub connection: ConnectionId,
    pub handle: Handle,
    pub body: Body<'a>,
}

/// Context handed to handlers. Dispatch only needs the connection table
/// out of it.
pub trait Routing {
    fn connections(&mut self) -> &mut ConnectionTable;
}

type Handler<C> = Box<dyn FnMut(&mut C, InboundPacket<'_>) -> Result<(), Disconnection>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    AlreadyRegistered(BodyType),
    /// No connection is registered for the handle. The packet is dropped.
    UnknownConnection(Handle),
    /// No handler for the body type. The packet is dropped.
    Unhandled { connection: ConnectionId, body_type: BodyType },
    /// The body did not muster. The connection must be closed.
    Codec { connection: ConnectionId, error: CodecError },
    /// The handler refused the packet. The connection must be closed.
    Rejected { connection: ConnectionId, reason: Disconnection },
}
impl DispatchError {
    /// The connection to force-close, if the failure was a protocol violation.
    pub fn offender(&self) -> Option<ConnectionId> {
        match *self {
            Self::Codec { connection, .. } | Self::Rejected { connection, .. } => Some(connection),
            _ => None,
        }
    }
}
impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRegistered(t) => write!(f, "a handler for {t} is already registered"),
            Self::UnknownConnection(h) => write!(f, "no connection for handle {h}"),
            Self::Unhandled { connection, body_type } => {
                write!(f, "no handler for {body_type} from connection {connection}")
            }
            Self::Codec { connection, error } => {
                write!(f, "connection {connection} sent a bad body: {error}")
            }
            Self::Rejected { connection, reason } => write!(f, "connection {connection}: {reason}"),
        }
    }
}
impl std::error::Error for DispatchError {}

/// At most one handler per body type.
pub struct HandlerTable<C> {
    handlers: [Option<Handler<C>>; BODY_TYPE_COUNT],
}
impl<C: Routing> HandlerTable<C> {
    pub fn new() -> Self {
        Self { handlers: std::array::from_fn(|_| None) }
    }
    pub fn register(
        &mut self,
        body_type: BodyType,
        handler: impl FnMut(&mut C, InboundPacket<'_>) -> Result<(), Disconnection> + 'static,
    ) -> Result<(), DispatchError> {
        let slot = &mut self.handlers[body_type.index()];
        if slot.is_some() {
            return Err(DispatchError::AlreadyRegistered(body_type));
        }
        *slot = Some(Box::new(handler));
        Ok(())
    }
    pub fn is_registered(&self, body_type: BodyType) -> bool {
        self.handlers[body_type.index()].is_some()
    }

    /// Resolves the packet's handle to its connection, musters the body and
    /// runs the handler for its type. The connection's idle time is reset
    /// once a handler accepts responsibility for the packet.
    pub fn dispatch(&mut self, ctx: &mut C, packet: &Packet<'_>) -> Result<(), DispatchError> {
        let handle = Handle(packet.head.connection);
        let body_type = packet.head.body_type;
        let connection = ctx.connections().get_by_transport_handle(handle).map(|c| c.id());
        let Some(connection) = connection else {
            log::warn!("dropping {body_type} from unregistered handle {handle}");
            return Err(DispatchError::UnknownConnection(handle));
        };
        let Some(handler) = self.handlers[body_type.index()].as_mut() else {
            log::warn!("dropping {body_type} from connection {connection}: no handler");
            return Err(DispatchError::Unhandled { connection, body_type });
        };
        ctx.connections().touch(connection);
        let body = Body::muster(body_type, Origin::Client, packet.body)
            .map_err(|error| DispatchError::Codec { connection, error })?;
        log::trace!("dispatching {body_type} from connection {connection}");
        handler(ctx, InboundPacket { connection, handle, body })
            .map_err(|reason| DispatchError::Rejected { connection, reason })
    }
}
impl<C: Routing> Default for HandlerTable<C> {
    fn default() -> Self {
        Self::new()
    }
}
