use std::net::SocketAddr;

use crate::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetEvent {
    Connected { handle: Handle, address: SocketAddr },
    Disconnected { handle: Handle },
}

/// What the server tick needs from its host.
///
/// Each `with_*` call holds the underlying buffer for the duration of the
/// closure and releases it afterwards. The reception buffer is emptied once
/// the closure returns. The sending closure reports how many bytes it
/// appended and the host then wakes whoever drains it.
pub trait Platform {
    fn with_net_events(&self, f: &mut dyn FnMut(NetEvent));
    fn with_reception_buffer(&self, f: &mut dyn FnMut(&[u8]));
    fn with_sending_buffer(&self, f: &mut dyn FnMut(&mut [u8]) -> usize);
    fn close_connection(&self, handle: Handle);
}
