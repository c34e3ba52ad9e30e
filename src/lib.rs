mod collections;
pub mod callbacks;
pub mod clients;
pub mod config;
pub mod connections;
pub mod memory;
pub mod network;
pub mod platform;
pub mod server;
pub mod sync;
pub mod types;
pub mod world;

pub use config::ServerConfig;
pub use network::NetPump;
pub use platform::{NetEvent, Platform};
pub use server::{Core, Server};
pub use world::World;

mod prelude {
    pub(crate) use crate::collections::*;
    pub(crate) use crate::types::*;
    pub(crate) use std::io;
    pub(crate) use std::net::TcpStream;
}
