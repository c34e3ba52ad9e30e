//! Accounts and their link to a live connection.
//!
//! Clients outlive their connections: disconnecting only clears the link.
//! Lifecycle changes are queued as [`ClientEvent`]s for the server to hand
//! to its listeners once the current dispatch pass is over.

use std::collections::HashMap;
use std::fmt;

use crate::connections::{ConnectionError, ConnectionTable};
use crate::network::body::AuthenticationRequest;
use crate::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    id: ClientId,
    username: Username,
    connection: Option<ConnectionId>,
    character: Option<CharacterId>,
}
impl Client {
    pub fn id(&self) -> ClientId {
        self.id
    }
    pub fn username(&self) -> &Username {
        &self.username
    }
    /// The connection the client is online through.
    pub fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }
    pub fn is_online(&self) -> bool {
        self.connection.is_some()
    }
    pub fn character(&self) -> Option<CharacterId> {
        self.character
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    AccountCreated(ClientId),
    Connected { client: ClientId, connection: ConnectionId },
    Disconnected { client: ClientId, connection: ConnectionId },
}
impl ClientEvent {
    pub fn client(&self) -> ClientId {
        match *self {
            Self::AccountCreated(client)
            | Self::Connected { client, .. }
            | Self::Disconnected { client, .. } => client,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AuthError {
    InvalidUsername,
    TableFull { capacity: usize },
    AlreadyOnline { client: ClientId, connection: ConnectionId },
    Connection(ConnectionError),
}
impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidUsername => write!(f, "invalid username"),
            Self::TableFull { capacity } => write!(f, "client table full ({capacity} clients)"),
            Self::AlreadyOnline { client, connection } => {
                write!(f, "client {client} is already online through connection {connection}")
            }
            Self::Connection(e) => fmt::Display::fmt(e, f),
        }
    }
}
impl std::error::Error for AuthError {}
impl From<ConnectionError> for AuthError {
    fn from(e: ConnectionError) -> Self {
        Self::Connection(e)
    }
}

pub struct ClientTable {
    clients: Vec<Client>,
    capacity: usize,
    by_username: HashMap<Username, ClientId>,
    events: Vec<ClientEvent>,
}
impl ClientTable {
    pub fn new(capacity: u16) -> Self {
        Self {
            clients: Vec::with_capacity(capacity as usize),
            capacity: capacity as usize,
            by_username: HashMap::with_capacity(capacity as usize),
            events: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
    pub fn get(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(id.index())
    }
    pub fn by_username(&self, username: &Username) -> Option<&Client> {
        self.by_username.get(username).and_then(|id| self.get(*id))
    }
    pub fn iter(&self) -> impl Iterator<Item = &Client> + '_ {
        self.clients.iter()
    }

    pub fn create(&mut self, username: Username) -> Result<ClientId, AuthError> {
        if let Some(&id) = self.by_username.get(&username) {
            return Ok(id);
        }
        if self.clients.len() >= self.capacity {
            log::error!("cannot create account {username}: client table full ({})", self.capacity);
            return Err(AuthError::TableFull { capacity: self.capacity });
        }
        let id = ClientId(self.clients.len() as u16);
        self.clients.push(Client { id, username, connection: None, character: None });
        self.by_username.insert(username, id);
        self.events.push(ClientEvent::AccountCreated(id));
        log::info!("created account {username} as client {id}");
        Ok(id)
    }

    /// Authenticates `connection` as the account named in `request`,
    /// creating it on first use. Neither the client nor the connection may
    /// already be linked to something else.
    pub fn authenticate(
        &mut self,
        connections: &mut ConnectionTable,
        connection: ConnectionId,
        request: &AuthenticationRequest,
    ) -> Result<ClientId, AuthError> {
        let username = Username::from_padded(&request.username).ok_or(AuthError::InvalidUsername)?;
        let linked = connections
            .get(connection)
            .ok_or(ConnectionError::InvalidConnection(connection))?;
        if let Some(client) = linked.client() {
            return Err(ConnectionError::AlreadyLinked { connection, client }.into());
        }
        let id = self.create(username)?;
        if let Some(current) = self.clients[id.index()].connection {
            return Err(AuthError::AlreadyOnline { client: id, connection: current });
        }
        connections.connect_client(connection, id)?;
        self.clients[id.index()].connection = Some(connection);
        self.events.push(ClientEvent::Connected { client: id, connection });
        log::info!("connection {connection} authenticated as {username} (client {id})");
        Ok(id)
    }

    /// Marks the client offline after its connection went away.
    pub fn disconnect(&mut self, id: ClientId) {
        let Some(client) = self.clients.get_mut(id.index()) else {
            return;
        };
        if let Some(connection) = client.connection.take() {
            self.events.push(ClientEvent::Disconnected { client: id, connection });
            log::info!("client {id} ({}) went offline", client.username);
        }
    }

    pub fn assign_character(&mut self, id: ClientId, character: CharacterId) {
        if let Some(client) = self.clients.get_mut(id.index()) {
            client.character = Some(character);
        }
    }

    /// Events queued since the last call, oldest first.
    pub fn take_events(&mut self) -> Vec<ClientEvent> {
        std::mem::take(&mut self.events)
    }
}
impl fmt::Debug for ClientTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTable")
            .field("clients", &self.clients.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Arena;

    fn setup() -> (Arena, ConnectionTable, ClientTable) {
        let mut arena = Arena::with_blocks(128).unwrap();
        let connections = ConnectionTable::new(&mut arena, 4, 256).unwrap();
        let clients = ClientTable::new(2);
        (arena, connections, clients)
    }

    #[test]
    fn an_account_is_online_through_one_connection_only() {
        let (_arena, mut connections, mut clients) = setup();
        let first = connections.register(Handle(7)).unwrap();
        let second = connections.register(Handle(8)).unwrap();
        let request = AuthenticationRequest::new("Ava", "");

        let ava = clients.authenticate(&mut connections, first, &request).unwrap();
        assert_eq!(connections.get(first).unwrap().client(), Some(ava));
        assert_eq!(clients.get(ava).unwrap().connection(), Some(first));

        assert_eq!(
            clients.authenticate(&mut connections, second, &request),
            Err(AuthError::AlreadyOnline { client: ava, connection: first })
        );
        assert_eq!(connections.get(second).unwrap().client(), None);
        assert_eq!(
            clients.take_events(),
            [
                ClientEvent::AccountCreated(ava),
                ClientEvent::Connected { client: ava, connection: first }
            ]
        );
    }

    #[test]
    fn linked_connections_cannot_switch_account() {
        let (_arena, mut connections, mut clients) = setup();
        let id = connections.register(Handle(1)).unwrap();
        let ava = clients
            .authenticate(&mut connections, id, &AuthenticationRequest::new("Ava", ""))
            .unwrap();
        assert_eq!(
            clients.authenticate(&mut connections, id, &AuthenticationRequest::new("Bob", "")),
            Err(AuthError::Connection(ConnectionError::AlreadyLinked {
                connection: id,
                client: ava
            }))
        );
        assert!(clients.by_username(&Username::new("Bob").unwrap()).is_none());
    }

    #[test]
    fn short_names_and_full_tables_are_refused() {
        let (_arena, mut connections, mut clients) = setup();
        let id = connections.register(Handle(1)).unwrap();
        assert_eq!(
            clients.authenticate(&mut connections, id, &AuthenticationRequest::new("Av", "")),
            Err(AuthError::InvalidUsername)
        );
        clients.create(Username::new("one").unwrap()).unwrap();
        clients.create(Username::new("two").unwrap()).unwrap();
        assert_eq!(
            clients.authenticate(&mut connections, id, &AuthenticationRequest::new("three", "")),
            Err(AuthError::TableFull { capacity: 2 })
        );
    }

    #[test]
    fn clients_survive_their_connection() {
        let (_arena, mut connections, mut clients) = setup();
        let first = connections.register(Handle(1)).unwrap();
        let request = AuthenticationRequest::new("Ava", "");
        let ava = clients.authenticate(&mut connections, first, &request).unwrap();
        connections.delete(first);
        clients.disconnect(ava);
        clients.disconnect(ava);
        assert!(!clients.get(ava).unwrap().is_online());

        let again = connections.register(Handle(2)).unwrap();
        assert_eq!(clients.authenticate(&mut connections, again, &request), Ok(ava));
        assert_eq!(
            clients.take_events(),
            [
                ClientEvent::AccountCreated(ava),
                ClientEvent::Connected { client: ava, connection: first },
                ClientEvent::Disconnected { client: ava, connection: first },
                ClientEvent::Connected { client: ava, connection: again },
            ]
        );
        assert_eq!(clients.len(), 1);
    }
}
