use std::fmt;

use crate::clients::ClientEvent;

pub const MAX_LISTENERS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenersFull {
    pub capacity: usize,
}
impl fmt::Display for ListenersFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener table full ({} listeners)", self.capacity)
    }
}
impl std::error::Error for ListenersFull {}

type Listener<C, E> = Box<dyn FnMut(&mut C, &E)>;

/// Up to `MAX_LISTENERS` callbacks, run in the order they were registered.
pub struct Listeners<C, E> {
    listeners: Vec<Listener<C, E>>,
}
impl<C, E> Listeners<C, E> {
    pub fn new() -> Self {
        Self { listeners: Vec::with_capacity(MAX_LISTENERS) }
    }
    pub fn len(&self) -> usize {
        self.listeners.len()
    }
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
    pub fn register(
        &mut self,
        listener: impl FnMut(&mut C, &E) + 'static,
    ) -> Result<(), ListenersFull> {
        if self.listeners.len() >= MAX_LISTENERS {
            return Err(ListenersFull { capacity: MAX_LISTENERS });
        }
        self.listeners.push(Box::new(listener));
        Ok(())
    }
    pub fn notify(&mut self, ctx: &mut C, event: &E) {
        for listener in &mut self.listeners {
            listener(ctx, event);
        }
    }
}
impl<C, E> Default for Listeners<C, E> {
    fn default() -> Self {
        Self::new()
    }
}

/// One listener table per client lifecycle event.
pub struct ClientListeners<C> {
    pub account_created: Listeners<C, ClientEvent>,
    pub connected: Listeners<C, ClientEvent>,
    pub disconnected: Listeners<C, ClientEvent>,
}
impl<C> ClientListeners<C> {
    pub fn new() -> Self {
        Self {
            account_created: Listeners::new(),
            connected: Listeners::new(),
            disconnected: Listeners::new(),
        }
    }
    pub fn notify(&mut self, ctx: &mut C, event: &ClientEvent) {
        match event {
            ClientEvent::AccountCreated(_) => self.account_created.notify(ctx, event),
            ClientEvent::Connected { .. } => self.connected.notify(ctx, event),
            ClientEvent::Disconnected { .. } => self.disconnected.notify(ctx, event),
        }
    }
}
impl<C> Default for ClientListeners<C> {
    fn default() -> Self {
        Self::new()
    }
}
