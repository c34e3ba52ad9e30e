//! Per-client world synchronization.
//!
//! Every tick the scheduler walks the active sync states and pushes what
//! each client is missing. A flag is cleared only once its packet made it
//! into the write buffer, so a full buffer simply retries next tick.

use crate::clients::ClientTable;
use crate::connections::ConnectionTable;
use crate::memory::Arena;
use crate::network::body::{Body, ZoneLandscapeSync};
use crate::prelude::*;
use crate::world::World;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncState {
    pub active: bool,
    /// Push the landscape of `zone`.
    pub landscape: bool,
    /// Reserved until entity bodies have a layout.
    pub entities: bool,
    /// Recompute `zone` from the controlled character.
    pub zone_changed: bool,
    pub character: Option<CharacterId>,
    pub zone: Coordinates,
}

pub struct WorldSync {
    states: Vec<SyncState>,
}
impl WorldSync {
    /// One state per possible client id.
    pub fn new(max_clients: u16) -> Self {
        Self { states: vec![SyncState::default(); max_clients as usize] }
    }

    pub fn state(&self, client: ClientId) -> Option<&SyncState> {
        self.states.get(client.index())
    }
    pub fn active_count(&self) -> usize {
        self.states.iter().filter(|s| s.active).count()
    }

    pub fn activate(&mut self, client: ClientId, character: Option<CharacterId>) {
        let Some(state) = self.states.get_mut(client.index()) else {
            log::error!("no sync state for client {client}");
            return;
        };
        if state.active {
            log::warn!("sync state of client {client} was already active");
        }
        *state = SyncState {
            active: true,
            landscape: true,
            entities: true,
            zone_changed: true,
            character,
            zone: Coordinates::default(),
        };
    }
    pub fn deactivate(&mut self, client: ClientId) {
        match self.states.get_mut(client.index()) {
            Some(state) if state.active => *state = SyncState::default(),
            Some(_) => log::warn!("sync state of client {client} was not active"),
            None => log::error!("no sync state for client {client}"),
        }
    }
    /// The client's character entered another zone.
    pub fn zone_changed(&mut self, client: ClientId) {
        if let Some(state) = self.states.get_mut(client.index()).filter(|s| s.active) {
            state.zone_changed = true;
        }
    }

    pub fn run(
        &mut self,
        arena: &mut Arena,
        world: &World,
        clients: &ClientTable,
        connections: &mut ConnectionTable,
    ) {
        for (idx, state) in self.states.iter_mut().enumerate() {
            if !state.active {
                continue;
            }
            let client = ClientId(idx as u16);
            if state.zone_changed {
                let character = state.character.and_then(|c| world.character(c));
                let position = character.map(|c| c.position());
                state.zone = position.and_then(|p| world.zone_of(p)).unwrap_or_default();
                state.zone_changed = false;
                state.landscape = true;
            }
            if !state.landscape {
                continue;
            }
            let Some(connection) = clients.get(client).and_then(|c| c.connection()) else {
                continue;
            };
            let Some(bitmask) = world.zone_bitmask(state.zone) else {
                log::error!("client {client} is in zone {} outside the world", state.zone);
                state.landscape = false;
                continue;
            };
            let zone = state.zone;
            let written = connections.write_outgoing_from(arena, bitmask, connection, |bitmask| {
                Body::ZoneLandscape(ZoneLandscapeSync { zone, bitmask })
            });
            match written {
                Ok(()) => {
                    log::debug!("synced landscape of zone {zone} to client {client}");
                    state.landscape = false;
                }
                Err(e) => log::debug!("landscape sync of client {client} deferred: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::body::{AuthenticationRequest, Origin, ZONE_LANDSCAPE_BODY_SIZE};
    use crate::network::packet::{read_next_packet, BodyType, HEAD_SIZE};
    use crate::world::SPAWN;

    const PACKET: usize = HEAD_SIZE + ZONE_LANDSCAPE_BODY_SIZE;

    struct Fixture {
        arena: Arena,
        connections: ConnectionTable,
        clients: ClientTable,
        world: World,
        sync: WorldSync,
    }
    impl Fixture {
        fn new(write_buffer: usize) -> Self {
            let mut arena = Arena::with_blocks(4096).unwrap();
            let connections = ConnectionTable::new(&mut arena, 4, write_buffer).unwrap();
            let clients = ClientTable::new(4);
            let world = World::new(&mut arena, 2, 4, Some(3)).unwrap();
            let sync = WorldSync::new(4);
            Self { arena, connections, clients, world, sync }
        }
        fn online(&mut self, handle: u16, name: &str, at: Coordinates) -> ClientId {
            let connection = self.connections.register(Handle(handle)).unwrap();
            let request = AuthenticationRequest::new(name, "");
            let client =
                self.clients.authenticate(&mut self.connections, connection, &request).unwrap();
            let name = *self.clients.get(client).unwrap().username();
            let character = self.world.create_character(name, at).unwrap();
            self.sync.activate(client, Some(character));
            client
        }
        fn run(&mut self) {
            self.sync.run(&mut self.arena, &self.world, &self.clients, &mut self.connections);
        }
        fn flush(&mut self) -> Vec<u8> {
            let mut out = vec![0; self.connections.write_capacity()];
            let n = self.connections.flush(&mut self.arena, &mut out);
            out.truncate(n);
            out
        }
    }

    #[test]
    fn connecting_pushes_the_current_zone_once() {
        let mut f = Fixture::new(64 * 1024);
        let client = f.online(9, "Ava", SPAWN);
        f.run();
        let state = *f.sync.state(client).unwrap();
        assert!(!state.landscape && !state.zone_changed);
        assert!(state.entities);
        assert_eq!(f.connections.written(), PACKET);
        f.run();
        assert_eq!(f.connections.written(), PACKET);

        let out = f.flush();
        let (packet, _) = read_next_packet(&out).unwrap();
        assert_eq!(packet.head.connection, 9);
        assert_eq!(packet.head.body_type, BodyType::WorldSyncLandscape);
        let body = Body::muster(packet.head.body_type, Origin::Server, packet.body).unwrap();
        let Body::ZoneLandscape(sync) = body else {
            panic!("wrong body")
        };
        assert_eq!(sync.zone, Coordinates::new(0, 0));
        let zone = f.arena.bytes(f.world.zone_bitmask(sync.zone).unwrap());
        assert_eq!(sync.bitmask, zone);
        assert!(sync.is_land(5, 5));
    }

    #[test]
    fn full_write_buffer_retries_next_tick() {
        let mut f = Fixture::new(PACKET);
        let ava = f.online(1, "Ava", SPAWN);
        let bob = f.online(2, "Bob", SPAWN);
        f.run();
        let pending: Vec<bool> =
            [ava, bob].iter().map(|c| f.sync.state(*c).unwrap().landscape).collect();
        assert_eq!(pending.iter().filter(|p| **p).count(), 1);
        assert_eq!(f.connections.written(), PACKET);

        assert_eq!(f.flush().len(), PACKET);
        f.run();
        assert!(!f.sync.state(ava).unwrap().landscape);
        assert!(!f.sync.state(bob).unwrap().landscape);
    }

    #[test]
    fn zone_changes_resend_the_landscape() {
        let mut f = Fixture::new(64 * 1024);
        let client = f.online(1, "Ava", Coordinates::new(300, 5));
        f.run();
        assert_eq!(f.sync.state(client).unwrap().zone, Coordinates::new(1, 0));
        f.flush();

        let character = f.sync.state(client).unwrap().character.unwrap();
        let crossed = f.world.move_character(character, Coordinates::new(5, 300));
        assert_eq!(crossed, Ok(Some(Coordinates::new(0, 1))));
        f.sync.zone_changed(client);
        f.run();
        assert_eq!(f.sync.state(client).unwrap().zone, Coordinates::new(0, 1));
        assert_eq!(f.connections.written(), PACKET);
    }

    #[test]
    fn inactive_and_offline_clients_are_skipped() {
        let mut f = Fixture::new(64 * 1024);
        let client = f.online(1, "Ava", SPAWN);
        f.sync.deactivate(client);
        assert_eq!(f.sync.state(client), Some(&SyncState::default()));
        f.run();
        assert_eq!(f.connections.written(), 0);

        f.sync.activate(client, None);
        let connection = f.clients.get(client).unwrap().connection().unwrap();
        f.connections.delete(connection);
        f.clients.disconnect(client);
        f.run();
        assert_eq!(f.connections.written(), 0);
        assert!(f.sync.state(client).unwrap().landscape);
        assert_eq!(f.sync.active_count(), 1);
    }
}
