pub mod body;
pub mod buffer;
pub mod packet;
pub mod pump;
pub mod wire;

pub use body::{Body, CodecError, Origin};
pub use buffer::PacketBuffer;
pub use packet::{BodyType, FramingError, Packet, PacketHead, PacketReader};
pub use pump::{NetPump, PumpConfig};
