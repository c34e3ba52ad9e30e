//! The single-threaded server tick.

use std::fmt;

use crate::callbacks::{ClientListeners, ListenersFull};
use crate::clients::ClientTable;
use crate::config::ServerConfig;
use crate::connections::dispatch::{DispatchError, HandlerTable, InboundPacket, Routing};
use crate::connections::ConnectionTable;
use crate::memory::{Arena, ArenaError};
use crate::network::body::{AuthenticationResponse, Body};
use crate::network::packet::{BodyType, PacketReader};
use crate::platform::{NetEvent, Platform};
use crate::prelude::*;
use crate::sync::WorldSync;
use crate::world::{World, WorldError, SPAWN};

#[derive(Debug)]
pub enum ServerError {
    Arena(ArenaError),
    Dispatch(DispatchError),
    Listeners(ListenersFull),
}
impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Arena(e) => write!(f, "out of server memory: {e}"),
            Self::Dispatch(e) => fmt::Display::fmt(e, f),
            Self::Listeners(e) => fmt::Display::fmt(e, f),
        }
    }
}
impl std::error::Error for ServerError {}
impl From<ArenaError> for ServerError {
    fn from(e: ArenaError) -> Self {
        Self::Arena(e)
    }
}
impl From<DispatchError> for ServerError {
    fn from(e: DispatchError) -> Self {
        Self::Dispatch(e)
    }
}
impl From<ListenersFull> for ServerError {
    fn from(e: ListenersFull) -> Self {
        Self::Listeners(e)
    }
}

/// Everything handlers and listeners may touch.
pub struct Core {
    pub arena: Arena,
    pub connections: ConnectionTable,
    pub clients: ClientTable,
    pub world: World,
    pub sync: WorldSync,
}
impl Routing for Core {
    fn connections(&mut self) -> &mut ConnectionTable {
        &mut self.connections
    }
}
impl Core {
    /// Deletes the connection and takes its client offline.
    pub fn drop_connection(&mut self, id: ConnectionId, reason: &str) -> Option<Handle> {
        let connection = self.connections.delete(id)?;
        log::info!("connection {id} closed: {reason}");
        if let Some(client) = connection.client() {
            self.clients.disconnect(client);
        }
        Some(connection.handle())
    }

    /// Moves the client's character, resyncing its zone when it crosses one.
    pub fn move_character(&mut self, client: ClientId, to: Coordinates) -> Result<(), WorldError> {
        let Some(character) = self.clients.get(client).and_then(|c| c.character()) else {
            return Ok(());
        };
        if self.world.move_character(character, to)?.is_some() {
            self.sync.zone_changed(client);
        }
        Ok(())
    }

    fn on_authentication(&mut self, packet: InboundPacket<'_>) -> Result<(), Disconnection> {
        let Body::AuthenticationRequest(request) = packet.body else {
            return Err(Disconnection::new("expected an authentication request"));
        };
        let connection = packet.connection;
        let authenticated = self.clients.authenticate(&mut self.connections, connection, &request);
        let accepted = match authenticated {
            Ok(_) => true,
            Err(e) => {
                log::info!("connection {connection} failed to authenticate: {e}");
                false
            }
        };
        let response = Body::AuthenticationResponse(AuthenticationResponse { accepted });
        if let Err(e) = self.connections.write_outgoing(&mut self.arena, connection, &response) {
            log::warn!("authentication response for connection {connection} dropped: {e}");
        }
        Ok(())
    }
}

pub struct Server<P> {
    platform: P,
    core: Core,
    handlers: HandlerTable<Core>,
    listeners: ClientListeners<Core>,
    authentication_grace: f32,
}
impl<P: Platform> Server<P> {
    pub fn new(config: &ServerConfig, platform: P) -> Result<Self, ServerError> {
        let mut arena = Arena::new(vec![0; config.memory_bytes].into_boxed_slice())?;
        log::info!("arena holds {} blocks ({} bytes)", arena.block_count(), arena.capacity());
        let connections =
            ConnectionTable::new(&mut arena, config.max_connections, config.write_buffer_bytes)?;
        let clients = ClientTable::new(config.max_clients);
        let world =
            World::new(&mut arena, config.world_zones, config.max_characters, config.world_seed)?;
        let sync = WorldSync::new(config.max_clients);
        let mut server = Self {
            platform,
            core: Core { arena, connections, clients, world, sync },
            handlers: HandlerTable::new(),
            listeners: ClientListeners::new(),
            authentication_grace: config.authentication_grace_secs,
        };

        server.handlers.register(BodyType::Message, |_, packet| {
            if let Body::Message(message) = packet.body {
                log::info!("message from connection {}: {message}", packet.connection);
            }
            Ok(())
        })?;
        server.handlers.register(BodyType::Authentication, Core::on_authentication)?;

        server.listeners.account_created.register(|core, event| {
            let client = event.client();
            let Some(name) = core.clients.get(client).map(|c| *c.username()) else {
                return;
            };
            match core.world.create_character(name, SPAWN) {
                Ok(character) => core.clients.assign_character(client, character),
                Err(e) => log::error!("client {client} has no character: {e}"),
            }
        })?;
        server.listeners.connected.register(|core, event| {
            let client = event.client();
            let character = core.clients.get(client).and_then(|c| c.character());
            core.sync.activate(client, character);
        })?;
        server
            .listeners
            .disconnected
            .register(|core, event| core.sync.deactivate(event.client()))?;
        Ok(server)
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }
    pub fn core(&self) -> &Core {
        &self.core
    }
    pub fn core_mut(&mut self) -> &mut Core {
        &mut self.core
    }
    pub fn handlers_mut(&mut self) -> &mut HandlerTable<Core> {
        &mut self.handlers
    }
    pub fn listeners_mut(&mut self) -> &mut ClientListeners<Core> {
        &mut self.listeners
    }

    /// Runs one tick. `dt` is the time since the previous tick in seconds.
    pub fn update(&mut self, dt: f32) {
        self.process_network();
        self.deliver_client_events();
        self.expire_connections(dt);
        let core = &mut self.core;
        core.sync.run(&mut core.arena, &core.world, &core.clients, &mut core.connections);
        self.platform
            .with_sending_buffer(&mut |dest| core.connections.flush(&mut core.arena, dest));
    }

    /// Applies connection events, then dispatches received packets.
    ///
    /// Events are drained while the reception buffer is held, so every packet
    /// in it comes from a connection that has already been announced. Packets
    /// from a connection whose disconnection arrived in the same batch are
    /// dropped.
    fn process_network(&mut self) {
        let core = &mut self.core;
        let handlers = &mut self.handlers;
        let platform = &self.platform;
        let mut refused = Vec::new();
        let mut offenders = Vec::new();
        platform.with_reception_buffer(&mut |bytes| {
            platform.with_net_events(&mut |event| apply_net_event(core, event, &mut refused));
            dispatch_reception(core, handlers, bytes, &mut offenders);
        });
        for handle in refused {
            self.platform.close_connection(handle);
        }
        for (id, _, reason) in offenders {
            if let Some(handle) = self.core.drop_connection(id, reason) {
                self.platform.close_connection(handle);
            }
        }
    }

    fn deliver_client_events(&mut self) {
        for event in self.core.clients.take_events() {
            log::debug!("client event {event:?}");
            self.listeners.notify(&mut self.core, &event);
        }
    }

    fn expire_connections(&mut self, dt: f32) {
        self.core.connections.update_times(dt);
        let expired: Vec<ConnectionId> = self
            .core
            .connections
            .iter()
            .filter(|c| c.client().is_none() && c.up_time() > self.authentication_grace)
            .map(|c| c.id())
            .collect();
        for id in expired {
            if let Some(handle) = self.core.drop_connection(id, "not authenticated in time") {
                self.platform.close_connection(handle);
            }
        }
    }

    /// Returns every arena allocation and hands back the platform.
    pub fn shutdown(self) -> Result<P, ArenaError> {
        let Core { mut arena, connections, world, .. } = self.core;
        connections.free(&mut arena)?;
        world.free(&mut arena)?;
        let (free, total) = (arena.free_blocks(), arena.block_count());
        log::info!("server stopped, {free} of {total} blocks free");
        Ok(self.platform)
    }
}

fn apply_net_event(core: &mut Core, event: NetEvent, refused: &mut Vec<Handle>) {
    match event {
        NetEvent::Connected { handle, address } => match core.connections.register(handle) {
            Ok(id) => log::info!("connection {id} opened from {address} (handle {handle})"),
            Err(e) => {
                log::warn!("refusing handle {handle} from {address}: {e}");
                refused.push(handle);
            }
        },
        NetEvent::Disconnected { handle } => {
            // closed by the server itself when no connection is left
            let id = core.connections.get_by_transport_handle(handle).map(|c| c.id());
            if let Some(id) = id {
                core.drop_connection(id, "remote disconnected");
            }
        }
    }
}

/// Offending connection, its transport handle and why it is being closed.
type Offender = (ConnectionId, u16, &'static str);

fn dispatch_reception(
    core: &mut Core,
    handlers: &mut HandlerTable<Core>,
    bytes: &[u8],
    offenders: &mut Vec<Offender>,
) {
    for packet in PacketReader::new(bytes) {
        let packet = match packet {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("reception buffer: {e}");
                let connection = e
                    .connection()
                    .and_then(|h| core.connections.get_by_transport_handle(Handle(h)));
                if let Some(c) = connection {
                    offenders.push((c.id(), c.handle().0, "malformed packet"));
                }
                break;
            }
        };
        let handle = packet.head.connection;
        if offenders.iter().any(|&(_, h, _)| h == handle) {
            continue;
        }
        if let Err(e) = handlers.dispatch(core, &packet) {
            if let Some(id) = e.offender() {
                log::warn!("{e}");
                offenders.push((id, handle, "protocol violation"));
            }
        }
    }
}

impl<P> fmt::Debug for Server<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("arena", &self.core.arena)
            .field("connections", &self.core.connections)
            .field("clients", &self.core.clients)
            .field("world", &self.core.world)
            .finish_non_exhaustive()
    }
}
